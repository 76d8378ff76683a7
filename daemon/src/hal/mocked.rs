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

//! In-memory radio service used by `wifid` and by tests.
//!
//! The mock enforces the chip's declared interface combinations, supports
//! failure injection and counts the calls tests care about.

use crate::devices::id_factory::IdFactory;
use crate::devices::resource_catalog::{IfaceCounts, ResourceCatalog};
use crate::hal::{
    ChipIdentifier, ChipIfaceCombination, ChipIfaceCombinationLimit, ChipMode, ChipModeId,
    DeathRecipient, DeathToken, HalError, HalResult, IfaceIdentifier, IfaceType,
    InterfaceControl, ServiceManager, ServiceNotification, WifiChip, WifiEventCallback,
    WifiService, WifiStatusCode,
};
use lazy_static::lazy_static;
use log::info;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

const INITIAL_IFACE_ID: u32 = 1;

// Allocator for interface identifiers, unique across every mock chip.
lazy_static! {
    static ref IFACE_IDS: RwLock<IdFactory<u32>> =
        RwLock::new(IdFactory::new(INITIAL_IFACE_ID, 1));
}

/// Mode ids used by the built-in chip profiles.
pub const STA_CHIP_MODE_ID: ChipModeId = 0;
pub const AP_CHIP_MODE_ID: ChipModeId = 1;

fn limit(types: &[IfaceType], max_ifaces: u32) -> ChipIfaceCombinationLimit {
    ChipIfaceCombinationLimit { types: types.to_vec(), max_ifaces }
}

/// Two modes: {STA + one of P2P/NAN} or {AP}.
pub fn single_sta_or_ap_modes() -> Vec<ChipMode> {
    vec![
        ChipMode {
            id: STA_CHIP_MODE_ID,
            available_combinations: vec![ChipIfaceCombination {
                limits: vec![
                    limit(&[IfaceType::Sta], 1),
                    limit(&[IfaceType::P2p, IfaceType::Nan], 1),
                ],
            }],
        },
        ChipMode {
            id: AP_CHIP_MODE_ID,
            available_combinations: vec![ChipIfaceCombination {
                limits: vec![limit(&[IfaceType::Ap], 1)],
            }],
        },
    ]
}

/// A single mode hosting {STA + AP} or {STA + one of P2P/NAN}.
pub fn concurrent_modes() -> Vec<ChipMode> {
    vec![ChipMode {
        id: STA_CHIP_MODE_ID,
        available_combinations: vec![
            ChipIfaceCombination {
                limits: vec![limit(&[IfaceType::Sta], 1), limit(&[IfaceType::Ap], 1)],
            },
            ChipIfaceCombination {
                limits: vec![
                    limit(&[IfaceType::Sta], 1),
                    limit(&[IfaceType::P2p, IfaceType::Nan], 1),
                ],
            },
        ],
    }]
}

fn name_prefix(iface_type: IfaceType) -> &'static str {
    match iface_type {
        IfaceType::Sta => "wlan",
        IfaceType::Ap => "ap",
        IfaceType::P2p => "p2p",
        IfaceType::Nan => "aware",
    }
}

#[derive(Default)]
struct MockChipState {
    mode: Option<ChipModeId>,
    ifaces: BTreeMap<IfaceIdentifier, (IfaceType, String)>,
    fail_create: bool,
    fail_remove: bool,
    reused_iface_id: Option<IfaceIdentifier>,
    create_count: usize,
    remove_count: usize,
    configure_count: usize,
}

pub struct MockChip {
    id: ChipIdentifier,
    catalog: ResourceCatalog,
    state: Mutex<MockChipState>,
}

impl MockChip {
    pub fn new(id: ChipIdentifier, modes: Vec<ChipMode>) -> Arc<MockChip> {
        Arc::new(MockChip {
            id,
            catalog: ResourceCatalog::new(modes),
            state: Mutex::new(MockChipState::default()),
        })
    }

    pub fn single_sta_or_ap(id: ChipIdentifier) -> Arc<MockChip> {
        MockChip::new(id, single_sta_or_ap_modes())
    }

    pub fn concurrent(id: ChipIdentifier) -> Arc<MockChip> {
        MockChip::new(id, concurrent_modes())
    }

    /// Drops every interface and forgets the configured mode.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.mode = None;
        state.ifaces.clear();
    }

    pub fn live_ifaces(&self) -> Vec<(IfaceIdentifier, IfaceType, String)> {
        let state = self.state.lock().unwrap();
        state.ifaces.iter().map(|(id, (t, name))| (*id, *t, name.clone())).collect()
    }

    pub fn current_mode(&self) -> Option<ChipModeId> {
        self.state.lock().unwrap().mode
    }

    pub fn catalog(&self) -> &ResourceCatalog {
        &self.catalog
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn set_fail_remove(&self, fail: bool) {
        self.state.lock().unwrap().fail_remove = fail;
    }

    /// The next created interface gets `iface` instead of a fresh id.
    pub fn reuse_iface_id(&self, iface: IfaceIdentifier) {
        self.state.lock().unwrap().reused_iface_id = Some(iface);
    }

    pub fn create_count(&self) -> usize {
        self.state.lock().unwrap().create_count
    }

    pub fn remove_count(&self) -> usize {
        self.state.lock().unwrap().remove_count
    }

    pub fn configure_count(&self) -> usize {
        self.state.lock().unwrap().configure_count
    }
}

impl WifiChip for MockChip {
    fn get_id(&self) -> ChipIdentifier {
        self.id
    }

    fn get_available_modes(&self) -> HalResult<Vec<ChipMode>> {
        Ok(self.catalog.modes().to_vec())
    }

    fn get_mode(&self) -> HalResult<Option<ChipModeId>> {
        Ok(self.state.lock().unwrap().mode)
    }

    fn configure_chip(&self, mode_id: ChipModeId) -> HalResult<()> {
        if !self.catalog.modes().iter().any(|m| m.id == mode_id) {
            return Err(HalError::new(
                WifiStatusCode::ErrorInvalidArgs,
                format!("unknown chip mode {mode_id}"),
            ));
        }
        let mut state = self.state.lock().unwrap();
        state.configure_count += 1;
        if state.mode != Some(mode_id) {
            state.ifaces.clear();
            state.mode = Some(mode_id);
        }
        Ok(())
    }

    fn create_iface(&self, iface_type: IfaceType) -> HalResult<IfaceIdentifier> {
        let mut state = self.state.lock().unwrap();
        state.create_count += 1;
        if state.fail_create {
            return Err(HalError::new(WifiStatusCode::ErrorUnknown, "injected create failure"));
        }
        let mode = state.mode.ok_or_else(|| {
            HalError::new(WifiStatusCode::ErrorNotAvailable, "chip is not configured")
        })?;
        let mut counts = IfaceCounts::from_types(state.ifaces.values().map(|(t, _)| *t));
        counts.add(iface_type);
        if !self.catalog.can_host(mode, &counts) {
            return Err(HalError::new(
                WifiStatusCode::ErrorNotAvailable,
                format!("no room for {iface_type} in mode {mode}"),
            ));
        }
        let prefix = name_prefix(iface_type);
        let name = (0..)
            .map(|n| format!("{prefix}{n}"))
            .find(|candidate| !state.ifaces.values().any(|(_, used)| used == candidate))
            .unwrap_or_else(|| prefix.to_string());
        let id = match state.reused_iface_id.take() {
            Some(id) => id,
            None => IfaceIdentifier(IFACE_IDS.write().unwrap().next_id()),
        };
        info!("mock chip {}: created {iface_type} iface {name} ({id})", self.id);
        state.ifaces.insert(id, (iface_type, name));
        Ok(id)
    }

    fn remove_iface(&self, iface_type: IfaceType, name: &str) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        state.remove_count += 1;
        if state.fail_remove {
            return Err(HalError::new(WifiStatusCode::ErrorUnknown, "injected remove failure"));
        }
        let id = state
            .ifaces
            .iter()
            .find(|(_, (t, n))| *t == iface_type && n == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| {
                HalError::new(WifiStatusCode::ErrorInvalidArgs, format!("no {iface_type} {name}"))
            })?;
        state.ifaces.remove(&id);
        Ok(())
    }

    fn get_iface_name(&self, iface: IfaceIdentifier) -> HalResult<String> {
        let state = self.state.lock().unwrap();
        state.ifaces.get(&iface).map(|(_, name)| name.clone()).ok_or_else(|| {
            HalError::new(WifiStatusCode::ErrorWifiIfaceInvalid, format!("iface {iface}"))
        })
    }

    fn get_iface_type(&self, iface: IfaceIdentifier) -> HalResult<IfaceType> {
        let state = self.state.lock().unwrap();
        state.ifaces.get(&iface).map(|(t, _)| *t).ok_or_else(|| {
            HalError::new(WifiStatusCode::ErrorWifiIfaceInvalid, format!("iface {iface}"))
        })
    }
}

#[derive(Default)]
struct MockWifiState {
    started: bool,
    event_callbacks: Vec<Arc<dyn WifiEventCallback>>,
    death_recipients: BTreeMap<u64, DeathRecipient>,
    next_token: u64,
    fail_start: bool,
    fail_stop: bool,
    die_on_link: bool,
    start_count: usize,
    stop_count: usize,
}

pub struct MockWifi {
    chips: Vec<Arc<MockChip>>,
    state: Mutex<MockWifiState>,
}

impl MockWifi {
    pub fn new(chips: Vec<Arc<MockChip>>) -> Arc<MockWifi> {
        Arc::new(MockWifi { chips, state: Mutex::new(MockWifiState::default()) })
    }

    pub fn chip(&self, index: usize) -> Option<Arc<MockChip>> {
        self.chips.get(index).cloned()
    }

    /// Simulates a crash of the radio service: every death recipient fires
    /// once and all chips lose their interfaces.
    pub fn kill(&self) {
        let recipients = {
            let mut state = self.state.lock().unwrap();
            state.started = false;
            std::mem::take(&mut state.death_recipients)
        };
        for chip in &self.chips {
            chip.reset();
        }
        info!("mock radio service killed, {} death recipient(s)", recipients.len());
        for recipient in recipients.into_values() {
            recipient();
        }
    }

    /// Reports a service failure through the registered event callbacks.
    pub fn trigger_failure(&self) {
        let callbacks = self.state.lock().unwrap().event_callbacks.clone();
        let error = HalError::new(WifiStatusCode::ErrorUnknown, "injected failure");
        for callback in callbacks {
            callback.on_failure(&error);
        }
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.state.lock().unwrap().fail_stop = fail;
    }

    /// The next death link fires its recipient before returning.
    pub fn set_die_on_link(&self, die: bool) {
        self.state.lock().unwrap().die_on_link = die;
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().unwrap().start_count
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().unwrap().stop_count
    }

    pub fn death_recipient_count(&self) -> usize {
        self.state.lock().unwrap().death_recipients.len()
    }
}

impl WifiService for MockWifi {
    fn link_to_death(&self, recipient: DeathRecipient) -> HalResult<DeathToken> {
        let mut state = self.state.lock().unwrap();
        state.next_token += 1;
        let token = state.next_token;
        if std::mem::take(&mut state.die_on_link) {
            drop(state);
            info!("mock radio service dies while linking");
            recipient();
            return Ok(DeathToken(token));
        }
        state.death_recipients.insert(token, recipient);
        Ok(DeathToken(token))
    }

    fn unlink_to_death(&self, token: DeathToken) {
        self.state.lock().unwrap().death_recipients.remove(&token.0);
    }

    fn register_event_callback(&self, callback: Arc<dyn WifiEventCallback>) -> HalResult<()> {
        self.state.lock().unwrap().event_callbacks.push(callback);
        Ok(())
    }

    fn is_started(&self) -> HalResult<bool> {
        Ok(self.state.lock().unwrap().started)
    }

    fn start(&self) -> HalResult<()> {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            state.start_count += 1;
            if state.fail_start {
                return Err(HalError::new(WifiStatusCode::ErrorNotAvailable, "injected failure"));
            }
            state.started = true;
            state.event_callbacks.clone()
        };
        for callback in callbacks {
            callback.on_start();
        }
        Ok(())
    }

    fn stop(&self) -> HalResult<()> {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            state.stop_count += 1;
            if state.fail_stop {
                return Err(HalError::new(WifiStatusCode::ErrorUnknown, "injected failure"));
            }
            state.started = false;
            state.event_callbacks.clone()
        };
        for chip in &self.chips {
            chip.reset();
        }
        for callback in callbacks {
            callback.on_stop();
        }
        Ok(())
    }

    fn get_chip_ids(&self) -> HalResult<Vec<ChipIdentifier>> {
        if !self.state.lock().unwrap().started {
            return Err(HalError::new(WifiStatusCode::ErrorNotStarted, "radio is stopped"));
        }
        Ok(self.chips.iter().map(|c| c.get_id()).collect())
    }

    fn get_chip(&self, chip_id: ChipIdentifier) -> HalResult<Arc<dyn WifiChip>> {
        self.chips
            .iter()
            .find(|c| c.get_id() == chip_id)
            .map(|c| c.clone() as Arc<dyn WifiChip>)
            .ok_or_else(|| {
                HalError::new(WifiStatusCode::ErrorWifiChipInvalid, format!("chip {chip_id}"))
            })
    }
}

#[derive(Default)]
struct MockServiceManagerState {
    service: Option<Arc<MockWifi>>,
    notifications: Vec<Arc<ServiceNotification>>,
    death_recipients: Vec<DeathRecipient>,
    next_token: u64,
}

/// Announces `MockWifi` registrations to whoever registered for them.
#[derive(Default)]
pub struct MockServiceManager {
    state: Mutex<MockServiceManagerState>,
}

impl MockServiceManager {
    pub fn new() -> Arc<MockServiceManager> {
        Arc::new(MockServiceManager::default())
    }

    /// Registers (or replaces) the radio service and notifies watchers.
    pub fn register_service(&self, service: Arc<MockWifi>) {
        let notifications = {
            let mut state = self.state.lock().unwrap();
            state.service = Some(service);
            state.notifications.clone()
        };
        for notify in notifications {
            notify();
        }
    }

    /// Forgets the radio service without notifying anyone.
    pub fn unregister_service(&self) {
        self.state.lock().unwrap().service = None;
    }

    /// Simulates the death of the service manager itself.
    pub fn kill(&self) {
        let recipients = std::mem::take(&mut self.state.lock().unwrap().death_recipients);
        for recipient in recipients {
            recipient();
        }
    }

    pub fn notification_count(&self) -> usize {
        self.state.lock().unwrap().notifications.len()
    }
}

impl ServiceManager for MockServiceManager {
    fn link_to_death(&self, recipient: DeathRecipient) -> HalResult<DeathToken> {
        let mut state = self.state.lock().unwrap();
        state.next_token += 1;
        state.death_recipients.push(recipient);
        Ok(DeathToken(state.next_token))
    }

    fn register_for_notifications(&self, callback: ServiceNotification) -> HalResult<()> {
        let callback = Arc::new(callback);
        let already_registered = {
            let mut state = self.state.lock().unwrap();
            state.notifications.push(callback.clone());
            state.service.is_some()
        };
        if already_registered {
            callback();
        }
        Ok(())
    }

    fn get_wifi_service(&self) -> Option<Arc<dyn WifiService>> {
        self.state.lock().unwrap().service.clone().map(|s| s as Arc<dyn WifiService>)
    }
}

/// Records interface up/down requests.
#[derive(Default)]
pub struct MockInterfaceControl {
    state: Mutex<(BTreeMap<String, bool>, bool)>,
}

impl MockInterfaceControl {
    pub fn new() -> Arc<MockInterfaceControl> {
        Arc::new(MockInterfaceControl::default())
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.state.lock().unwrap().0.get(name).copied().unwrap_or(false)
    }

    pub fn set_fail(&self, fail: bool) {
        self.state.lock().unwrap().1 = fail;
    }
}

impl InterfaceControl for MockInterfaceControl {
    fn set_interface_up(&self, name: &str, up: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.1 {
            return false;
        }
        state.0.insert(name.to_string(), up);
        true
    }
}
