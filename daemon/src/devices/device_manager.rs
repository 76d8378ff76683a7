// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The device manager owns the radio service lifecycle, the chip table,
//! the interface registry and every listener set.
//!
//! All mutable state lives behind one lock that each public operation
//! holds for its full duration. Listener callbacks are posted to the
//! listener's executor, so they never run under that lock. Callbacks from
//! the radio service carry the generation they were registered in; a
//! callback from a superseded generation is ignored.

use crate::devices::chip::{Chip, ChipInfo};
use crate::devices::iface_registry::{IfaceCacheEntry, InterfaceRegistry, RegistryError};
use crate::devices::listener::{AvailableListener, DestroyedListener, ListenerId, StatusCallback};
use crate::devices::resource_catalog::CreationProposal;
use crate::events::{publish, Event, Events};
use crate::hal::{
    ChipIdentifier, DeathToken, HalError, HalResult, IfaceIdentifier, IfaceType, ServiceManager,
    WifiChip, WifiEventCallback, WifiService, WifiStatusCode,
};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;

const START_HAL_RETRY_TIMES: u32 = 3;

#[derive(Debug, Error)]
enum CreateError {
    #[error("radio service is not available")]
    ServiceUnavailable,
    #[error("no chip can host a {0} interface")]
    NoCombination(IfaceType),
    #[error("chip {0} is no longer tracked")]
    ChipGone(ChipIdentifier),
    #[error("radio service: {0}")]
    Hal(#[from] HalError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Default)]
struct DeviceManagerState {
    watching: bool,
    wifi: Option<Arc<dyn WifiService>>,
    death_token: Option<DeathToken>,
    generation: u64,
    // Generation whose handle is being set up outside the lock.
    acquiring: Option<u64>,
    event_callback_registered: bool,
    chips: BTreeMap<ChipIdentifier, Chip>,
    registry: InterfaceRegistry,
    status_callbacks: BTreeMap<ListenerId, StatusCallback>,
    available_listeners: BTreeMap<IfaceType, BTreeMap<ListenerId, AvailableListener>>,
}

impl DeviceManagerState {
    fn proposal_for(&self, iface_type: IfaceType) -> Option<(ChipIdentifier, CreationProposal)> {
        let mut best: Option<(ChipIdentifier, CreationProposal)> = None;
        for chip in self.chips.values() {
            let live = self.registry.ifaces_on_chip(chip.id);
            if let Some(p) = chip.catalog.best_proposal(chip.current_mode, &live, iface_type) {
                if best.as_ref().map_or(true, |(_, b)| p.is_better_than(b)) {
                    best = Some((chip.id, p));
                }
            }
        }
        best
    }

    /// Cached name, else asks the chip and caches the answer.
    fn resolve_name(&mut self, iface: IfaceIdentifier) -> Option<String> {
        let entry = self.registry.lookup(iface)?;
        if entry.name.is_some() {
            return entry.name.clone();
        }
        let hal = self.chips.get(&entry.chip_id)?.hal.clone();
        match hal.get_iface_name(iface) {
            Ok(name) => {
                if let Some(entry) = self.registry.lookup_mut(iface) {
                    entry.name = Some(name.clone());
                }
                Some(name)
            }
            Err(e) => {
                warn!("cannot resolve name of iface {iface}: {e}");
                None
            }
        }
    }
}

/// Relays radio service events of one generation back to the manager.
struct ServiceEventCallback {
    manager: Weak<DeviceManager>,
    generation: u64,
}

impl WifiEventCallback for ServiceEventCallback {
    fn on_start(&self) {
        debug!("radio service reports started (generation {})", self.generation);
    }

    fn on_stop(&self) {
        debug!("radio service reports stopped (generation {})", self.generation);
    }

    fn on_failure(&self, error: &HalError) {
        error!("radio service failure (generation {}): {error}", self.generation);
        if let Some(manager) = self.manager.upgrade() {
            manager.on_wifi_failure(self.generation);
        }
    }
}

pub struct DeviceManager {
    service_manager: Arc<dyn ServiceManager>,
    events: Arc<Mutex<Events>>,
    state: Mutex<DeviceManagerState>,
    weak_self: Weak<DeviceManager>,
}

impl DeviceManager {
    pub fn new(
        service_manager: Arc<dyn ServiceManager>,
        events: Arc<Mutex<Events>>,
    ) -> Arc<DeviceManager> {
        Arc::new_cyclic(|weak| DeviceManager {
            service_manager,
            events,
            state: Mutex::new(DeviceManagerState::default()),
            weak_self: weak.clone(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, DeviceManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts watching for radio service registrations. No-op when already
    /// watching.
    pub fn initialize(&self) {
        {
            let mut state = self.lock_state();
            if state.watching {
                debug!("initialize: already watching the service manager");
                return;
            }
            state.watching = true;
        }
        // The service manager may notify synchronously, so the lock is not
        // held from here on.
        let weak = self.weak_self.clone();
        if let Err(e) = self.service_manager.link_to_death(Box::new(move || {
            if let Some(manager) = weak.upgrade() {
                manager.on_service_manager_died();
            }
        })) {
            warn!("initialize: cannot link to service manager death: {e}");
        }
        let weak = self.weak_self.clone();
        if let Err(e) = self.service_manager.register_for_notifications(Box::new(move || {
            if let Some(manager) = weak.upgrade() {
                manager.on_service_registered();
            }
        })) {
            error!("initialize: cannot register for service notifications: {e}");
            self.lock_state().watching = false;
        }
    }

    /// A (new) radio service instance was announced.
    ///
    /// The service may report death or failure synchronously from the calls
    /// made while acquiring it, so those calls run without the state lock.
    /// The generation stays marked as acquiring until the handle is stored;
    /// a death in between abandons it.
    fn on_service_registered(&self) {
        let Some(wifi) = self.service_manager.get_wifi_service() else {
            warn!("service registration notified but no radio service is available");
            return;
        };
        let (generation, old_wifi, old_token) = {
            let mut state = self.lock_state();
            let old_wifi = state.wifi.take();
            let old_token = state.death_token.take();
            if old_wifi.is_some() {
                info!("radio service re-registered, dropping generation {}", state.generation);
                state.event_callback_registered = false;
                self.teardown_locked(&mut state, "service re-registered");
            }
            state.generation += 1;
            state.acquiring = Some(state.generation);
            (state.generation, old_wifi, old_token)
        };
        if let (Some(old), Some(token)) = (old_wifi, old_token) {
            old.unlink_to_death(token);
        }

        let weak = self.weak_self.clone();
        let token = match wifi.link_to_death(Box::new(move || {
            if let Some(manager) = weak.upgrade() {
                manager.on_wifi_died(generation);
            }
        })) {
            Ok(token) => token,
            Err(e) => {
                error!("cannot link to radio service death: {e}");
                self.abandon_acquire(generation);
                return;
            }
        };
        let callback = Arc::new(ServiceEventCallback { manager: self.weak_self.clone(), generation });
        if let Err(e) = wifi.register_event_callback(callback) {
            error!("cannot register radio service event callback: {e}");
            wifi.unlink_to_death(token);
            self.abandon_acquire(generation);
            return;
        }
        // Start from a known stopped state.
        if let Ok(true) = wifi.is_started() {
            if let Err(e) = wifi.stop() {
                warn!("cannot stop freshly acquired radio service: {e}");
            }
        }

        let mut state = self.lock_state();
        if state.acquiring != Some(generation) {
            drop(state);
            warn!("radio service generation {generation} was lost while being acquired");
            wifi.unlink_to_death(token);
            return;
        }
        state.acquiring = None;
        state.death_token = Some(token);
        state.event_callback_registered = true;
        state.wifi = Some(wifi);
        info!("radio service acquired (generation {generation})");
    }

    fn abandon_acquire(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.acquiring == Some(generation) {
            state.acquiring = None;
        }
    }

    fn on_wifi_died(&self, generation: u64) {
        let mut state = self.lock_state();
        if generation == state.generation && state.acquiring == Some(generation) {
            warn!("radio service died while being acquired (generation {generation})");
            state.acquiring = None;
            return;
        }
        if generation != state.generation || state.wifi.is_none() {
            debug!(
                "ignoring radio service death of generation {generation} (current {})",
                state.generation
            );
            return;
        }
        error!("radio service died (generation {generation})");
        state.wifi = None;
        state.death_token = None;
        state.event_callback_registered = false;
        self.teardown_locked(&mut state, "service died");
    }

    fn on_wifi_failure(&self, generation: u64) {
        let mut state = self.lock_state();
        if generation != state.generation {
            debug!("ignoring failure of generation {generation}");
            return;
        }
        self.teardown_locked(&mut state, "service failure");
    }

    fn on_service_manager_died(&self) {
        warn!("service manager died");
        self.lock_state().watching = false;
    }

    /// Radio service handle present and event callback registered.
    pub fn is_ready(&self) -> bool {
        let state = self.lock_state();
        state.wifi.is_some() && state.event_callback_registered
    }

    pub fn is_started(&self) -> bool {
        let state = self.lock_state();
        if !state.event_callback_registered {
            return false;
        }
        match &state.wifi {
            None => false,
            Some(wifi) => wifi.is_started().unwrap_or_else(|e| {
                warn!("is_started: {e}");
                false
            }),
        }
    }

    /// Starts the radio service. `on_start` is posted to every status
    /// callback after the service confirms.
    pub fn start(&self) -> bool {
        let mut state = self.lock_state();
        let Some(wifi) = state.wifi.clone() else {
            warn!("start: radio service is not available");
            return false;
        };
        let mut attempt = 0;
        loop {
            match wifi.start() {
                Ok(()) => break,
                Err(e)
                    if e.code == WifiStatusCode::ErrorNotAvailable
                        && attempt + 1 < START_HAL_RETRY_TIMES =>
                {
                    attempt += 1;
                    warn!("start: {e}, retry {attempt}");
                }
                Err(e) => {
                    error!("start: radio service did not start: {e}");
                    return false;
                }
            }
        }
        if let Err(e) = Self::refresh_chips_locked(&mut state, wifi.as_ref()) {
            error!("start: cannot read chips: {e}");
            if let Err(e) = wifi.stop() {
                warn!("start: stop after failed chip read: {e}");
            }
            return false;
        }
        info!("radio service started with {} chip(s)", state.chips.len());
        for callback in state.status_callbacks.values() {
            callback.trigger(|c| c.on_start());
        }
        publish(&self.events, Event::WifiStarted);
        true
    }

    fn refresh_chips_locked(state: &mut DeviceManagerState, wifi: &dyn WifiService) -> HalResult<()> {
        let mut chips = BTreeMap::new();
        for chip_id in wifi.get_chip_ids()? {
            let chip = Chip::from_hal(wifi.get_chip(chip_id)?)?;
            chips.insert(chip.id, chip);
        }
        state.chips = chips;
        Ok(())
    }

    /// Stops the radio service and tears down all tracked state, even when
    /// the service reports a failure.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        match state.wifi.clone() {
            Some(wifi) => {
                if let Err(e) = wifi.stop() {
                    warn!("stop: radio service reported {e}, tearing down anyway");
                }
            }
            None => warn!("stop: radio service is not available, tearing down anyway"),
        }
        self.teardown_locked(&mut state, "stop");
    }

    fn teardown_locked(&self, state: &mut DeviceManagerState, reason: &str) {
        info!(
            "teardown ({reason}): {} iface(s), {} status callback(s)",
            state.registry.len(),
            state.status_callbacks.len()
        );
        for callback in state.status_callbacks.values() {
            callback.trigger(|c| c.on_stop());
        }
        for (iface, entry) in state.registry.drain() {
            self.dispatch_destroyed(iface, entry);
        }
        state.available_listeners.clear();
        state.chips.clear();
        publish(&self.events, Event::WifiStopped);
    }

    fn dispatch_destroyed(&self, iface: IfaceIdentifier, entry: IfaceCacheEntry) {
        let IfaceCacheEntry { iface_type, name, destroyed_listeners, .. } = entry;
        let name = name.unwrap_or_default();
        debug!("iface {iface} ({name}) destroyed, {} listener(s)", destroyed_listeners.len());
        for listener in destroyed_listeners.into_values() {
            let name = name.clone();
            listener.trigger(move |l| l.on_destroyed(&name));
        }
        publish(&self.events, Event::InterfaceRemoved { iface_id: iface, iface_type });
    }

    pub fn register_status_callback(&self, callback: StatusCallback) {
        let mut state = self.lock_state();
        if state.status_callbacks.contains_key(&callback.id()) {
            debug!("status callback {} already registered", callback.id());
            return;
        }
        state.status_callbacks.insert(callback.id(), callback);
    }

    /// Creates an interface of `iface_type`, preempting lower or equal
    /// priority interfaces when needed.
    ///
    /// On failure `available`, if given, joins the waiters of that type and
    /// `None` is returned.
    pub fn create_iface(
        &self,
        iface_type: IfaceType,
        destroyed: Option<DestroyedListener>,
        available: Option<AvailableListener>,
    ) -> Option<IfaceIdentifier> {
        let mut state = self.lock_state();
        match self.create_iface_locked(&mut state, iface_type, destroyed) {
            Ok(iface) => Some(iface),
            Err(e) => {
                match &e {
                    CreateError::Registry(_) => error!("WTF: create {iface_type}: {e}"),
                    _ => warn!("create {iface_type} failed: {e}"),
                }
                if let Some(listener) = available {
                    state
                        .available_listeners
                        .entry(iface_type)
                        .or_default()
                        .insert(listener.id(), listener);
                }
                None
            }
        }
    }

    pub fn create_sta_iface(&self, destroyed: Option<DestroyedListener>) -> Option<IfaceIdentifier> {
        self.create_iface(IfaceType::Sta, destroyed, None)
    }

    pub fn create_ap_iface(&self, destroyed: Option<DestroyedListener>) -> Option<IfaceIdentifier> {
        self.create_iface(IfaceType::Ap, destroyed, None)
    }

    pub fn create_p2p_iface(
        &self,
        destroyed: Option<DestroyedListener>,
        available: Option<AvailableListener>,
    ) -> Option<IfaceIdentifier> {
        self.create_iface(IfaceType::P2p, destroyed, available)
    }

    pub fn create_nan_iface(
        &self,
        destroyed: Option<DestroyedListener>,
        available: Option<AvailableListener>,
    ) -> Option<IfaceIdentifier> {
        self.create_iface(IfaceType::Nan, destroyed, available)
    }

    fn create_iface_locked(
        &self,
        state: &mut DeviceManagerState,
        iface_type: IfaceType,
        destroyed: Option<DestroyedListener>,
    ) -> Result<IfaceIdentifier, CreateError> {
        if state.wifi.is_none() {
            return Err(CreateError::ServiceUnavailable);
        }
        let (chip_id, proposal) =
            state.proposal_for(iface_type).ok_or(CreateError::NoCombination(iface_type))?;
        for victim in &proposal.remove {
            info!("preempting iface {victim} for {iface_type}");
            self.remove_iface_locked(state, *victim);
        }
        let chip = state.chips.get_mut(&chip_id).ok_or(CreateError::ChipGone(chip_id))?;
        let hal = chip.hal.clone();
        if proposal.reconfigure {
            info!("configuring chip {chip_id} into mode {}", proposal.mode_id);
            hal.configure_chip(proposal.mode_id)?;
            chip.current_mode = Some(proposal.mode_id);
        }
        let iface = hal.create_iface(iface_type)?;
        let name = match hal.get_iface_name(iface) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!("created iface {iface} has no name yet: {e}");
                None
            }
        };
        if let Err(e) = state.registry.register(iface, chip_id, iface_type, name.clone()) {
            // Undo the chip side so no interface lives on untracked.
            match name.as_deref() {
                Some(name) => {
                    if let Err(remove_err) = hal.remove_iface(iface_type, name) {
                        warn!("cannot remove untracked {iface_type} iface {name}: {remove_err}");
                    }
                }
                None => warn!("untracked iface {iface} has no name, leaving it on the chip"),
            }
            return Err(e.into());
        }
        if let Some(listener) = destroyed {
            state.registry.add_destroyed_listener(iface, listener);
        }
        info!("created {iface_type} iface {iface} ({}) on chip {chip_id}", name.unwrap_or_default());
        publish(&self.events, Event::InterfaceAdded { iface_id: iface, iface_type, chip_id });
        Ok(iface)
    }

    /// Removes `iface`. Its destroyed listeners fire whatever the chip
    /// reports; the return value is the chip's verdict.
    pub fn remove_iface(&self, iface: IfaceIdentifier) -> bool {
        let mut state = self.lock_state();
        if state.registry.lookup(iface).is_none() {
            warn!("remove_iface: unknown iface {iface}");
            return false;
        }
        let removed = self.remove_iface_locked(&mut state, iface);
        self.dispatch_available_locked(&mut state);
        removed
    }

    fn remove_iface_locked(&self, state: &mut DeviceManagerState, iface: IfaceIdentifier) -> bool {
        let name = state.resolve_name(iface);
        let Some(entry) = state.registry.unregister(iface) else {
            debug!("iface {iface} already gone");
            return false;
        };
        let hal = state.chips.get(&entry.chip_id).map(|c| c.hal.clone());
        let removed = match (hal, name.as_deref()) {
            (Some(hal), Some(name)) => match hal.remove_iface(entry.iface_type, name) {
                Ok(()) => true,
                Err(e) => {
                    warn!("chip failed to remove {} iface {name}: {e}", entry.iface_type);
                    false
                }
            },
            (None, _) => {
                warn!("iface {iface} references unknown chip {}", entry.chip_id);
                false
            }
            (_, None) => {
                warn!("iface {iface} has no name, cannot ask the chip to remove it");
                false
            }
        };
        self.dispatch_destroyed(iface, entry);
        removed
    }

    /// Fires and clears the waiters of every type that can now be created.
    fn dispatch_available_locked(&self, state: &mut DeviceManagerState) {
        let ready: Vec<IfaceType> = state
            .available_listeners
            .iter()
            .filter(|(_, waiters)| !waiters.is_empty())
            .map(|(t, _)| *t)
            .filter(|t| state.proposal_for(*t).is_some())
            .collect();
        for iface_type in ready {
            if let Some(waiters) = state.available_listeners.remove(&iface_type) {
                debug!("{iface_type} available, {} waiter(s)", waiters.len());
                for waiter in waiters.into_values() {
                    waiter.trigger(|w| w.on_available_for_request());
                }
            }
        }
    }

    pub fn register_destroyed_listener(
        &self,
        iface: IfaceIdentifier,
        listener: DestroyedListener,
    ) -> bool {
        let added = self.lock_state().registry.add_destroyed_listener(iface, listener);
        if !added {
            warn!("register_destroyed_listener: unknown iface {iface}");
        }
        added
    }

    /// The chip hosting `iface`.
    pub fn get_chip(&self, iface: IfaceIdentifier) -> Option<Arc<dyn WifiChip>> {
        let state = self.lock_state();
        let chip_id = state.registry.lookup(iface)?.chip_id;
        state.chips.get(&chip_id).map(|c| c.hal.clone())
    }

    pub fn get_name(&self, iface: IfaceIdentifier) -> Option<String> {
        self.lock_state().resolve_name(iface)
    }

    pub fn get_iface_type(&self, iface: IfaceIdentifier) -> Option<IfaceType> {
        self.lock_state().registry.lookup(iface).map(|e| e.iface_type)
    }

    pub fn iface_count(&self) -> usize {
        self.lock_state().registry.len()
    }

    /// Outstanding availability waiters across all types.
    pub fn waiter_count(&self) -> usize {
        self.lock_state().available_listeners.values().map(|w| w.len()).sum()
    }

    pub fn chip_info(&self, chip_id: ChipIdentifier) -> Option<ChipInfo> {
        let state = self.lock_state();
        state.chips.get(&chip_id).map(|c| c.info(&state.registry))
    }

    pub fn chip_infos(&self) -> Vec<ChipInfo> {
        let state = self.lock_state();
        state.chips.values().map(|c| c.info(&state.registry)).collect()
    }

    pub fn dump(&self) -> String {
        let state = self.lock_state();
        let mut out = String::new();
        let _ = writeln!(out, "DeviceManager:");
        let _ = writeln!(out, "  watching: {}", state.watching);
        let _ = writeln!(out, "  radio service present: {}", state.wifi.is_some());
        let _ = writeln!(out, "  generation: {}", state.generation);
        let _ = writeln!(out, "  event callback registered: {}", state.event_callback_registered);
        let _ = writeln!(out, "  status callbacks: {}", state.status_callbacks.len());
        for (iface_type, waiters) in &state.available_listeners {
            let _ = writeln!(out, "  {iface_type} waiters: {}", waiters.len());
        }
        let _ = writeln!(out, "  interfaces: {}", state.registry.len());
        for iface in state.registry.handles() {
            if let Some(entry) = state.registry.lookup(iface) {
                let _ = writeln!(
                    out,
                    "    {iface}: {} {} chip={} listeners={}",
                    entry.iface_type,
                    entry.name.as_deref().unwrap_or("?"),
                    entry.chip_id,
                    entry.destroyed_listeners.len()
                );
            }
        }
        for chip in state.chips.values() {
            let mode = chip.current_mode.map_or("unconfigured".to_string(), |m| m.to_string());
            let _ = writeln!(out, "  chip {}: mode {mode}", chip.id);
        }
        out
    }
}
