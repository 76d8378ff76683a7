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

//! The mode state machine: decides which operating mode the Wi-Fi stack
//! is in and drives the mode managers accordingly.
//!
//! Messages are processed one at a time, in order, on a single thread.
//! States are grouped in families; leaving a family stops the family's
//! mode manager, moving within one (e.g. `ClientMode` to
//! `ClientModeActive`) keeps it. A family handler passes what it does not
//! handle to the default handler.

use crate::config::Config;
use crate::devices::device_manager::DeviceManager;
use crate::devices::listener::{ListenerProxy, ManagerStatusCallback};
use crate::dispatch::Executor;
use crate::events::{publish, Event, Events};
use crate::mode::managers::{ActiveModeManager, ModeManagerFactory, StateListener, WifiState};
use crate::mode::message::{Command, ModeRequestError};
use crate::mode::settings::{WifiSavedState, WifiSettingsStore};
use crate::mode::soft_ap_config::{SoftApModeConfiguration, SoftApTargetMode};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModeState {
    Disabled,
    ClientMode,
    ClientModeActive,
    ScanOnlyMode,
    ScanOnlyModeActive,
    SoftApMode,
    SoftApModeActive,
    EmergencyCallbackMode,
}

impl ModeState {
    fn family(self) -> Family {
        match self {
            ModeState::Disabled => Family::Disabled,
            ModeState::ClientMode | ModeState::ClientModeActive => Family::Client,
            ModeState::ScanOnlyMode | ModeState::ScanOnlyModeActive => Family::ScanOnly,
            ModeState::SoftApMode | ModeState::SoftApModeActive => Family::SoftAp,
            ModeState::EmergencyCallbackMode => Family::Emergency,
        }
    }

    /// The mode manager of this state reported its interface up.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ModeState::ClientModeActive | ModeState::ScanOnlyModeActive | ModeState::SoftApModeActive
        )
    }
}

impl fmt::Display for ModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Family {
    Disabled,
    Client,
    ScanOnly,
    SoftAp,
    Emergency,
}

enum ManagerKind {
    Client,
    ScanOnly,
    SoftAp(SoftApModeConfiguration),
}

/// Turns device manager stop notifications into `HalStopped` messages.
struct HalStatusBridge {
    tx: Mutex<Sender<Command>>,
}

impl ManagerStatusCallback for HalStatusBridge {
    fn on_start(&self) {}

    fn on_stop(&self) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if tx.send(Command::HalStopped).is_err() {
            debug!("mode state machine gone, dropping HalStopped");
        }
    }
}

pub struct ModeStateMachine {
    config: Config,
    dm: Arc<DeviceManager>,
    factory: Box<dyn ModeManagerFactory>,
    settings: Arc<Mutex<WifiSettingsStore>>,
    events: Arc<Mutex<Events>>,
    tx: Sender<Command>,
    inbox: Receiver<Command>,
    queue: VecDeque<Command>,
    // Keyed by (due, sequence) so equal deadlines keep their send order.
    delayed: BTreeMap<(Instant, u64), Command>,
    delayed_seq: u64,
    // Moved to the front of the queue after the next transition.
    deferred: Vec<Command>,
    state: ModeState,
    current: Arc<RwLock<ModeState>>,
    started: bool,
    stopped: bool,
    // Time of the message being processed.
    now: Instant,
    manager: Option<Box<dyn ActiveModeManager>>,
    manager_id: u64,
    next_manager_id: u64,
    soft_ap_configs: VecDeque<SoftApModeConfiguration>,
    disabled_at: Option<Instant>,
    deferred_enable_serial: u64,
    have_deferred_enable: bool,
    ecm_entry_count: u32,
    first_user_sign_on: bool,
}

impl ModeStateMachine {
    /// Builds the machine and the handle used to talk to it. The machine
    /// subscribes to `dm` status callbacks, delivered through `executor`.
    pub fn new(
        config: Config,
        dm: Arc<DeviceManager>,
        factory: Box<dyn ModeManagerFactory>,
        settings: Arc<Mutex<WifiSettingsStore>>,
        events: Arc<Mutex<Events>>,
        executor: Arc<dyn Executor>,
    ) -> (ModeStateMachine, ModeStateMachineHandle) {
        let (tx, inbox) = channel();
        let current = Arc::new(RwLock::new(ModeState::Disabled));
        let bridge: Arc<dyn ManagerStatusCallback> =
            Arc::new(HalStatusBridge { tx: Mutex::new(tx.clone()) });
        dm.register_status_callback(ListenerProxy::new(bridge, executor));
        let handle = ModeStateMachineHandle {
            tx: tx.clone(),
            settings: settings.clone(),
            current: current.clone(),
        };
        let machine = ModeStateMachine {
            config,
            dm,
            factory,
            settings,
            events,
            tx,
            inbox,
            queue: VecDeque::new(),
            delayed: BTreeMap::new(),
            delayed_seq: 0,
            deferred: Vec::new(),
            state: ModeState::Disabled,
            current,
            started: false,
            stopped: false,
            now: Instant::now(),
            manager: None,
            manager_id: 0,
            next_manager_id: 0,
            soft_ap_configs: VecDeque::new(),
            disabled_at: None,
            deferred_enable_serial: 0,
            have_deferred_enable: false,
            ecm_entry_count: 0,
            first_user_sign_on: false,
        };
        (machine, handle)
    }

    pub fn state(&self) -> ModeState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn first_user_sign_on(&self) -> bool {
        self.first_user_sign_on
    }

    /// When the earliest delayed message falls due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.delayed.keys().next().map(|(due, _)| *due)
    }

    /// Enters the initial state chosen from the current settings.
    pub fn start(&mut self, now: Instant) {
        if self.started {
            return;
        }
        self.started = true;
        self.now = now;
        let initial = if self.wifi_toggle_enabled() {
            ModeState::ClientMode
        } else if self.scan_only_available() {
            ModeState::ScanOnlyMode
        } else {
            ModeState::Disabled
        };
        info!("mode state machine starting in {initial}");
        self.set_state(initial);
        self.enter_family(initial.family());
    }

    /// Processes every message available at `now`, including the ones
    /// produced while processing. Returns how many were processed.
    pub fn process_pending(&mut self, now: Instant) -> usize {
        self.start(now);
        let mut processed = 0;
        while !self.stopped {
            while let Ok(command) = self.inbox.try_recv() {
                self.queue.push_back(command);
            }
            self.release_due(now);
            let Some(command) = self.queue.pop_front() else {
                break;
            };
            self.now = now;
            self.handle(command);
            processed += 1;
        }
        processed
    }

    /// Runs the machine on the calling thread until shut down.
    pub fn run(mut self) {
        while !self.stopped {
            self.process_pending(Instant::now());
            if self.stopped {
                break;
            }
            let received = match self.next_deadline() {
                Some(due) => {
                    self.inbox.recv_timeout(due.saturating_duration_since(Instant::now()))
                }
                None => self.inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(command) => self.queue.push_back(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("mode state machine stopped");
    }

    pub fn spawn(self) -> anyhow::Result<JoinHandle<()>> {
        Ok(thread::Builder::new().name("ModeStateMachine".to_string()).spawn(move || self.run())?)
    }

    fn lock_settings(&self) -> MutexGuard<'_, WifiSettingsStore> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wifi_toggle_enabled(&self) -> bool {
        self.lock_settings().is_wifi_toggle_enabled()
    }

    fn airplane_mode_on(&self) -> bool {
        self.lock_settings().is_airplane_mode_on()
    }

    fn scan_only_available(&self) -> bool {
        self.lock_settings().check_scan_only_mode_available()
    }

    fn scan_only_or_disabled(&self) -> ModeState {
        if self.scan_only_available() {
            ModeState::ScanOnlyMode
        } else {
            ModeState::Disabled
        }
    }

    /// Where to go when soft AP ends.
    fn next_wifi_state(&self) -> ModeState {
        if self.lock_settings().wifi_saved_state() == WifiSavedState::Enabled {
            ModeState::ClientMode
        } else {
            self.scan_only_or_disabled()
        }
    }

    fn send_message_delayed(&mut self, command: Command, delay: Duration) {
        self.delayed_seq += 1;
        self.delayed.insert((self.now + delay, self.delayed_seq), command);
    }

    fn release_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            self.queue.push_back(entry.remove());
        }
    }

    fn set_state(&mut self, state: ModeState) {
        let from = self.state;
        self.state = state;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = state;
        if from != state {
            info!("{from} -> {state}");
            publish(&self.events, Event::ModeChanged { from, to: state });
        }
    }

    fn transition_to(&mut self, target: ModeState) {
        let from = self.state;
        if from.family() != target.family() {
            if from.family() == Family::SoftAp && !self.soft_ap_configs.is_empty() {
                debug!("dropping {} queued soft AP requests", self.soft_ap_configs.len());
                self.soft_ap_configs.clear();
            }
            self.exit_family();
            self.set_state(target);
            self.enter_family(target.family());
        } else if target.is_active() {
            self.set_state(target);
        }
        for command in self.deferred.drain(..).rev() {
            self.queue.push_front(command);
        }
    }

    // A mode manager that failed to start leaves the radio service in an
    // unknown state: drop the manager and stop the device manager before
    // settling on `next`.
    fn recover_from_start_failure(&mut self, next: ModeState) {
        self.exit_family();
        self.stop_device_manager();
        self.transition_to(next);
    }

    fn exit_family(&mut self) {
        if let Some(mut manager) = self.manager.take() {
            manager.stop();
        }
        self.manager_id = 0;
    }

    fn enter_family(&mut self, family: Family) {
        match family {
            Family::Disabled => {
                self.stop_device_manager();
                self.mark_sta_disabled();
            }
            Family::Client => self.start_manager(ManagerKind::Client),
            Family::ScanOnly => {
                self.start_manager(ManagerKind::ScanOnly);
                self.mark_sta_disabled();
            }
            Family::SoftAp => {
                let config = self.soft_ap_configs.pop_front().unwrap_or_else(|| {
                    error!("WTF: soft AP mode entered without a request");
                    SoftApModeConfiguration::new(SoftApTargetMode::Tethered, None)
                });
                self.start_manager(ManagerKind::SoftAp(config));
            }
            Family::Emergency => {
                self.ecm_entry_count = 1;
                self.stop_device_manager();
            }
        }
    }

    fn stop_device_manager(&self) {
        if self.dm.is_started() {
            self.dm.stop();
        }
    }

    // Starts the re-enable cool-down and invalidates pending deferrals.
    fn mark_sta_disabled(&mut self) {
        self.disabled_at = Some(self.now);
        self.deferred_enable_serial += 1;
        self.have_deferred_enable = false;
    }

    fn start_manager(&mut self, kind: ManagerKind) {
        self.next_manager_id += 1;
        let manager_id = self.next_manager_id;
        let tx = Mutex::new(self.tx.clone());
        let listener: Arc<dyn StateListener> = Arc::new(move |state: WifiState| {
            let tx = tx.lock().unwrap_or_else(|e| e.into_inner());
            if tx.send(Command::ModeManagerStateChanged { manager_id, state }).is_err() {
                debug!("mode state machine gone, dropping {state:?}");
            }
        });
        let mut manager = match kind {
            ManagerKind::Client => self.factory.make_client_mode_manager(listener),
            ManagerKind::ScanOnly => self.factory.make_scan_only_mode_manager(listener),
            ManagerKind::SoftAp(config) => self.factory.make_soft_ap_manager(listener, config),
        };
        self.manager_id = manager_id;
        manager.start();
        self.manager = Some(manager);
    }

    /// Holds back an enable arriving within the re-enable delay. Returns
    /// whether it was deferred.
    fn defer_enable(&mut self, command: Command) -> bool {
        let Some(disabled_at) = self.disabled_at else {
            return false;
        };
        let elapsed = self.now.saturating_duration_since(disabled_at);
        if elapsed >= self.config.reenable_delay {
            return false;
        }
        info!("enable requested {}ms after disable, deferring", elapsed.as_millis());
        self.deferred_enable_serial += 1;
        let delay = self.config.reenable_delay - elapsed + self.config.defer_margin;
        let serial = self.deferred_enable_serial;
        self.send_message_delayed(Command::DeferredToggle { serial, command: Box::new(command) }, delay);
        true
    }

    fn handle_enable_request(&mut self, command: Command) {
        if !self.defer_enable(command) {
            self.transition_to(ModeState::ClientMode);
            return;
        }
        if self.have_deferred_enable {
            // A second deferral within the window cancels both.
            self.deferred_enable_serial += 1;
        }
        self.have_deferred_enable = !self.have_deferred_enable;
    }

    fn handle_deferred_toggle(&mut self, serial: u64, command: Command) {
        if serial != self.deferred_enable_serial {
            debug!("dropping superseded deferred toggle {serial}");
            return;
        }
        debug!("re-delivering deferred {command:?}");
        self.have_deferred_enable = false;
        self.queue.push_back(command);
    }

    fn request_soft_ap(&mut self, config: SoftApModeConfiguration, saved: WifiSavedState) {
        if self.airplane_mode_on() {
            warn!("dropping soft AP request: airplane mode is on");
            return;
        }
        self.lock_settings().set_wifi_saved_state(saved);
        self.soft_ap_configs.push_back(config);
        self.transition_to(ModeState::SoftApMode);
    }

    fn handle_hal_stopped(&mut self) {
        if self.dm.is_started() {
            debug!("device manager already running again");
            return;
        }
        self.handle_default(Command::RecoveryRestartWifi("device manager stopped".to_string()));
    }

    fn handle(&mut self, command: Command) {
        debug!("{}: {command:?}", self.state);
        if let Command::ModeManagerStateChanged { manager_id, state } = &command {
            if self.manager.is_none() || *manager_id != self.manager_id {
                debug!("dropping {state:?} from superseded mode manager {manager_id}");
                return;
            }
        }
        let unhandled = match self.state.family() {
            Family::Disabled => self.handle_disabled(command),
            Family::Client => self.handle_client(command),
            Family::ScanOnly => self.handle_scan_only(command),
            Family::SoftAp => self.handle_soft_ap(command),
            Family::Emergency => self.handle_emergency(command),
        };
        if let Some(command) = unhandled {
            self.handle_default(command);
        }
    }

    fn handle_disabled(&mut self, command: Command) -> Option<Command> {
        match command {
            Command::WifiToggled | Command::AirplaneToggled => {
                if self.wifi_toggle_enabled() {
                    self.handle_enable_request(command);
                } else if self.scan_only_available() {
                    self.transition_to(ModeState::ScanOnlyMode);
                }
            }
            Command::ScanAlwaysModeChanged => {
                if self.scan_only_available() {
                    self.transition_to(ModeState::ScanOnlyMode);
                }
            }
            Command::StartSoftAp(config) => self.request_soft_ap(config, WifiSavedState::Disabled),
            Command::DeferredToggle { serial, command } => {
                self.handle_deferred_toggle(serial, *command)
            }
            Command::RecoveryRestartWifiContinue => {
                if self.wifi_toggle_enabled() {
                    self.transition_to(ModeState::ClientMode);
                } else if self.scan_only_available() {
                    self.transition_to(ModeState::ScanOnlyMode);
                }
            }
            Command::EmergencyCallStateChanged(true) | Command::EmergencyModeChanged(true)
                if self.config.disable_wifi_in_ecbm =>
            {
                self.transition_to(ModeState::EmergencyCallbackMode)
            }
            other => return Some(other),
        }
        None
    }

    fn handle_client(&mut self, command: Command) -> Option<Command> {
        match command {
            Command::WifiToggled => {
                if !self.wifi_toggle_enabled() {
                    let next = self.scan_only_or_disabled();
                    self.transition_to(next);
                }
            }
            Command::AirplaneToggled => {
                if !self.wifi_toggle_enabled() {
                    self.transition_to(ModeState::Disabled);
                }
            }
            Command::StartSoftAp(config) => self.request_soft_ap(config, WifiSavedState::Enabled),
            Command::ModeManagerStateChanged { state, .. } => match state {
                WifiState::Enabled => self.transition_to(ModeState::ClientModeActive),
                WifiState::Disabled => {
                    warn!("client mode manager stopped on its own");
                    let next = self.scan_only_or_disabled();
                    self.transition_to(next);
                }
                WifiState::Unknown => {
                    error!("client mode failed to start");
                    let next = self.scan_only_or_disabled();
                    self.recover_from_start_failure(next);
                }
            },
            Command::EmergencyCallStateChanged(true) | Command::EmergencyModeChanged(true)
                if self.config.disable_wifi_in_ecbm =>
            {
                self.transition_to(ModeState::EmergencyCallbackMode)
            }
            Command::HalStopped => self.handle_hal_stopped(),
            other => return Some(other),
        }
        None
    }

    fn handle_scan_only(&mut self, command: Command) -> Option<Command> {
        match command {
            Command::WifiToggled | Command::AirplaneToggled if self.wifi_toggle_enabled() => {
                self.handle_enable_request(command)
            }
            Command::WifiToggled => {}
            Command::AirplaneToggled => {
                if self.airplane_mode_on() {
                    self.transition_to(ModeState::Disabled);
                }
            }
            Command::ScanAlwaysModeChanged => {
                if !self.scan_only_available() {
                    self.transition_to(ModeState::Disabled);
                }
            }
            Command::StartSoftAp(config) => self.request_soft_ap(config, WifiSavedState::Disabled),
            Command::DeferredToggle { serial, command } => {
                self.handle_deferred_toggle(serial, *command)
            }
            Command::ModeManagerStateChanged { state, .. } => match state {
                WifiState::Enabled => self.transition_to(ModeState::ScanOnlyModeActive),
                WifiState::Disabled => {
                    warn!("scan-only mode manager stopped on its own");
                    self.transition_to(ModeState::Disabled);
                }
                WifiState::Unknown => {
                    error!("scan-only mode failed to start");
                    self.recover_from_start_failure(ModeState::Disabled);
                }
            },
            Command::EmergencyCallStateChanged(true) | Command::EmergencyModeChanged(true)
                if self.config.disable_wifi_in_ecbm =>
            {
                self.transition_to(ModeState::EmergencyCallbackMode)
            }
            Command::HalStopped => self.handle_hal_stopped(),
            other => return Some(other),
        }
        None
    }

    fn handle_soft_ap(&mut self, command: Command) -> Option<Command> {
        match command {
            Command::AirplaneToggled => {
                if self.airplane_mode_on() {
                    self.transition_to(ModeState::Disabled);
                }
            }
            Command::WifiToggled => {
                if self.wifi_toggle_enabled() {
                    self.transition_to(ModeState::ClientMode);
                }
            }
            Command::StartSoftAp(config) => {
                if self.airplane_mode_on() {
                    warn!("dropping soft AP request: airplane mode is on");
                } else {
                    // Applied once the running AP reports it stopped.
                    info!("soft AP restart requested with a new configuration");
                    self.soft_ap_configs.push_back(config);
                    if let Some(manager) = self.manager.as_mut() {
                        manager.stop();
                    }
                }
            }
            Command::StopSoftAp => {
                let next = self.next_wifi_state();
                self.transition_to(next);
            }
            Command::ModeManagerStateChanged { state, .. } => match state {
                WifiState::Enabled => self.transition_to(ModeState::SoftApModeActive),
                WifiState::Disabled if !self.soft_ap_configs.is_empty() => {
                    self.exit_family();
                    self.set_state(ModeState::SoftApMode);
                    self.enter_family(Family::SoftAp);
                }
                WifiState::Disabled => {
                    let next = self.next_wifi_state();
                    self.transition_to(next);
                }
                WifiState::Unknown => {
                    error!("soft AP failed to start");
                    let next = self.next_wifi_state();
                    self.recover_from_start_failure(next);
                }
            },
            Command::EmergencyCallStateChanged(true) | Command::EmergencyModeChanged(true) => {
                self.transition_to(ModeState::EmergencyCallbackMode)
            }
            Command::HalStopped => self.handle_hal_stopped(),
            other => return Some(other),
        }
        None
    }

    fn handle_emergency(&mut self, command: Command) -> Option<Command> {
        match command {
            Command::EmergencyCallStateChanged(true) | Command::EmergencyModeChanged(true) => {
                self.ecm_entry_count += 1;
            }
            Command::EmergencyCallStateChanged(false) | Command::EmergencyModeChanged(false) => {
                if self.ecm_entry_count == 0 {
                    error!("WTF: emergency exit without a matching entry");
                    self.exit_emergency();
                } else {
                    self.ecm_entry_count -= 1;
                    if self.ecm_entry_count == 0 {
                        self.exit_emergency();
                    }
                }
            }
            Command::RecoveryRestartWifi(_)
            | Command::RecoveryDisableWifi
            | Command::StartSoftAp(_)
            | Command::StartClientMode
            | Command::StartScanOnlyMode
            | Command::DisableWifi => {
                debug!("ignored in emergency callback mode");
            }
            other => return Some(other),
        }
        None
    }

    fn exit_emergency(&mut self) {
        let next =
            if self.wifi_toggle_enabled() { ModeState::ClientMode } else { self.scan_only_or_disabled() };
        self.transition_to(next);
    }

    fn handle_default(&mut self, command: Command) {
        match command {
            Command::RecoveryRestartWifi(reason) => {
                warn!("restarting Wi-Fi: {reason}");
                self.deferred.push(Command::RecoveryRestartWifiContinue);
                self.transition_to(ModeState::Disabled);
            }
            Command::RecoveryDisableWifi => {
                warn!("disabling Wi-Fi for recovery");
                self.transition_to(ModeState::Disabled);
            }
            Command::UserPresent => self.first_user_sign_on = true,
            Command::StartClientMode => self.transition_to(ModeState::ClientMode),
            Command::StartScanOnlyMode => self.transition_to(ModeState::ScanOnlyMode),
            Command::DisableWifi => self.transition_to(ModeState::Disabled),
            Command::Shutdown => self.shut_down(),
            Command::DeferredToggle { serial, .. } => {
                debug!("ignoring deferred toggle {serial} in {}", self.state)
            }
            other => debug!("{}: ignoring {other:?}", self.state),
        }
    }

    fn shut_down(&mut self) {
        info!("shutting down in {}", self.state);
        self.exit_family();
        self.stop_device_manager();
        self.queue.clear();
        self.delayed.clear();
        self.stopped = true;
    }
}

/// Thread-safe entry point into a running `ModeStateMachine`.
///
/// Settings are updated before the matching message is posted, so the
/// machine always reads the value that triggered it.
#[derive(Clone)]
pub struct ModeStateMachineHandle {
    tx: Sender<Command>,
    settings: Arc<Mutex<WifiSettingsStore>>,
    current: Arc<RwLock<ModeState>>,
}

impl ModeStateMachineHandle {
    fn send(&self, command: Command) -> Result<(), ModeRequestError> {
        self.tx.send(command).map_err(|_| ModeRequestError::StateMachineStopped)
    }

    fn lock_settings(&self) -> MutexGuard<'_, WifiSettingsStore> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_state(&self) -> ModeState {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wifi_toggled(&self, enabled: bool) -> Result<(), ModeRequestError> {
        self.lock_settings().handle_wifi_toggled(enabled);
        self.send(Command::WifiToggled)
    }

    pub fn airplane_toggled(&self, on: bool) -> Result<(), ModeRequestError> {
        self.lock_settings().handle_airplane_toggled(on);
        self.send(Command::AirplaneToggled)
    }

    pub fn scan_always_mode_changed(&self, available: bool) -> Result<(), ModeRequestError> {
        self.lock_settings().set_scan_always_available(available);
        self.send(Command::ScanAlwaysModeChanged)
    }

    pub fn location_mode_changed(&self, on: bool) -> Result<(), ModeRequestError> {
        self.lock_settings().set_location_mode(on);
        self.send(Command::ScanAlwaysModeChanged)
    }

    /// Requests soft AP with `config`. Rejected while airplane mode is on.
    pub fn enter_soft_ap_mode(
        &self,
        config: SoftApModeConfiguration,
    ) -> Result<(), ModeRequestError> {
        if self.lock_settings().is_airplane_mode_on() {
            warn!("soft AP request rejected: airplane mode is on");
            return Err(ModeRequestError::AirplaneModeOn);
        }
        self.send(Command::StartSoftAp(config))
    }

    pub fn stop_soft_ap_mode(&self) -> Result<(), ModeRequestError> {
        self.send(Command::StopSoftAp)
    }

    pub fn emergency_call_state_changed(&self, in_call: bool) -> Result<(), ModeRequestError> {
        self.send(Command::EmergencyCallStateChanged(in_call))
    }

    pub fn emergency_callback_mode_changed(&self, active: bool) -> Result<(), ModeRequestError> {
        self.send(Command::EmergencyModeChanged(active))
    }

    pub fn restart_wifi(&self, reason: &str) -> Result<(), ModeRequestError> {
        self.send(Command::RecoveryRestartWifi(reason.to_string()))
    }

    pub fn disable_wifi_for_recovery(&self) -> Result<(), ModeRequestError> {
        self.send(Command::RecoveryDisableWifi)
    }

    pub fn user_present(&self) -> Result<(), ModeRequestError> {
        self.send(Command::UserPresent)
    }

    pub fn enter_client_mode(&self) -> Result<(), ModeRequestError> {
        self.send(Command::StartClientMode)
    }

    pub fn enter_scan_only_mode(&self) -> Result<(), ModeRequestError> {
        self.send(Command::StartScanOnlyMode)
    }

    pub fn disable_wifi(&self) -> Result<(), ModeRequestError> {
        self.send(Command::DisableWifi)
    }

    pub fn shutdown(&self) -> Result<(), ModeRequestError> {
        self.send(Command::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::QueuedExecutor;
    use crate::hal::mocked::{MockChip, MockServiceManager, MockWifi};
    use crate::hal::ChipIdentifier;
    use crate::mode::soft_ap_config::SoftApConfig;
    use std::sync::mpsc::Receiver;

    #[derive(Default)]
    struct Record {
        starts: Vec<&'static str>,
        stops: Vec<&'static str>,
        ap_configs: Vec<SoftApModeConfiguration>,
        failing: Vec<&'static str>,
    }

    struct FakeManager {
        kind: &'static str,
        listener: Arc<dyn StateListener>,
        record: Arc<Mutex<Record>>,
    }

    impl ActiveModeManager for FakeManager {
        fn start(&mut self) {
            let fail = {
                let mut record = self.record.lock().unwrap();
                record.starts.push(self.kind);
                record.failing.contains(&self.kind)
            };
            let state = if fail { WifiState::Unknown } else { WifiState::Enabled };
            self.listener.on_state_changed(state);
        }

        fn stop(&mut self) {
            self.record.lock().unwrap().stops.push(self.kind);
            self.listener.on_state_changed(WifiState::Disabled);
        }

        fn iface(&self) -> Option<crate::hal::IfaceIdentifier> {
            None
        }
    }

    struct FakeFactory {
        record: Arc<Mutex<Record>>,
    }

    impl FakeFactory {
        fn make(&self, kind: &'static str, listener: Arc<dyn StateListener>) -> Box<dyn ActiveModeManager> {
            Box::new(FakeManager { kind, listener, record: self.record.clone() })
        }
    }

    impl ModeManagerFactory for FakeFactory {
        fn make_client_mode_manager(
            &self,
            listener: Arc<dyn StateListener>,
        ) -> Box<dyn ActiveModeManager> {
            self.make("client", listener)
        }

        fn make_scan_only_mode_manager(
            &self,
            listener: Arc<dyn StateListener>,
        ) -> Box<dyn ActiveModeManager> {
            self.make("scan", listener)
        }

        fn make_soft_ap_manager(
            &self,
            listener: Arc<dyn StateListener>,
            config: SoftApModeConfiguration,
        ) -> Box<dyn ActiveModeManager> {
            self.record.lock().unwrap().ap_configs.push(config);
            self.make("ap", listener)
        }
    }

    struct Fixture {
        machine: ModeStateMachine,
        handle: ModeStateMachineHandle,
        record: Arc<Mutex<Record>>,
        settings: Arc<Mutex<WifiSettingsStore>>,
        mode_events: Receiver<Event>,
        t0: Instant,
    }

    impl Fixture {
        fn run_at(&mut self, ms: u64) {
            self.machine.process_pending(self.t0 + Duration::from_millis(ms));
        }

        fn starts(&self) -> Vec<&'static str> {
            self.record.lock().unwrap().starts.clone()
        }

        fn visited(&self) -> Vec<ModeState> {
            self.mode_events
                .try_iter()
                .filter_map(|e| match e {
                    Event::ModeChanged { to, .. } => Some(to),
                    _ => None,
                })
                .collect()
        }
    }

    fn fixture_with(settings: WifiSettingsStore, config: Config) -> Fixture {
        let sm = MockServiceManager::new();
        sm.register_service(MockWifi::new(vec![MockChip::single_sta_or_ap(ChipIdentifier(0))]));
        let dm = DeviceManager::new(sm, Events::new());
        dm.initialize();
        let record = Arc::new(Mutex::new(Record::default()));
        let events = Events::new();
        let mode_events = events.lock().unwrap().subscribe();
        let settings = Arc::new(Mutex::new(settings));
        let (machine, handle) = ModeStateMachine::new(
            config,
            dm,
            Box::new(FakeFactory { record: record.clone() }),
            settings.clone(),
            events,
            QueuedExecutor::new(),
        );
        let mut f =
            Fixture { machine, handle, record, settings, mode_events, t0: Instant::now() };
        f.machine.start(f.t0);
        f
    }

    fn fixture() -> Fixture {
        fixture_with(WifiSettingsStore::new(), Config::default())
    }

    fn wifi_on_settings() -> WifiSettingsStore {
        let mut settings = WifiSettingsStore::new();
        settings.handle_wifi_toggled(true);
        settings
    }

    fn soft_ap_request(ssid: &str) -> SoftApModeConfiguration {
        SoftApModeConfiguration::new(
            SoftApTargetMode::Tethered,
            Some(SoftApConfig {
                ssid: ssid.to_string(),
                passphrase: None,
                band: crate::mode::soft_ap_config::ApBand::TwoGhz,
                hidden: false,
            }),
        )
    }

    #[test]
    fn test_initial_state_follows_settings() {
        let f = fixture();
        assert_eq!(f.machine.state(), ModeState::Disabled);

        let mut f = fixture_with(wifi_on_settings(), Config::default());
        f.run_at(0);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
        assert_eq!(f.handle.current_state(), ModeState::ClientModeActive);
        assert_eq!(f.starts(), vec!["client"]);
    }

    #[test]
    fn test_toggle_after_cool_down_enters_client_mode() {
        let mut f = fixture();
        f.handle.wifi_toggled(true).unwrap();
        f.run_at(1000);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
        assert_eq!(f.visited(), vec![ModeState::ClientMode, ModeState::ClientModeActive]);
    }

    #[test]
    fn test_toggle_within_cool_down_is_deferred() {
        let mut f = fixture();
        f.handle.wifi_toggled(true).unwrap();
        f.run_at(100);
        assert_eq!(f.machine.state(), ModeState::Disabled);
        assert!(f.starts().is_empty());
        assert_eq!(f.machine.next_deadline(), Some(f.t0 + Duration::from_millis(505)));
        f.run_at(504);
        assert_eq!(f.machine.state(), ModeState::Disabled);
        f.run_at(505);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
    }

    #[test]
    fn test_two_deferred_enables_cancel_out() {
        let mut f = fixture();
        f.handle.wifi_toggled(true).unwrap();
        f.run_at(100);
        f.handle.wifi_toggled(true).unwrap();
        f.run_at(200);
        f.run_at(2000);
        assert_eq!(f.machine.state(), ModeState::Disabled);
        assert!(f.starts().is_empty());
        assert!(f.machine.next_deadline().is_none());
    }

    #[test]
    fn test_rapid_off_on_off_stays_off() {
        let mut f = fixture_with(wifi_on_settings(), Config::default());
        f.run_at(0);
        f.handle.wifi_toggled(false).unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::Disabled);
        f.handle.wifi_toggled(true).unwrap();
        f.run_at(20);
        f.handle.wifi_toggled(false).unwrap();
        f.run_at(30);
        f.run_at(1000);
        assert_eq!(f.machine.state(), ModeState::Disabled);
        assert_eq!(f.starts(), vec!["client"]);
    }

    #[test]
    fn test_toggle_off_with_scan_always_enters_scan_only() {
        let mut settings = wifi_on_settings();
        settings.set_scan_always_available(true);
        let mut f = fixture_with(settings, Config::default());
        f.run_at(0);
        f.handle.wifi_toggled(false).unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::ScanOnlyModeActive);
        assert_eq!(f.starts(), vec!["client", "scan"]);
        assert_eq!(f.record.lock().unwrap().stops, vec!["client"]);

        f.handle.location_mode_changed(false).unwrap();
        f.run_at(20);
        assert_eq!(f.machine.state(), ModeState::Disabled);
    }

    #[test]
    fn test_client_failure_falls_back() {
        let mut f = fixture();
        f.record.lock().unwrap().failing.push("client");
        f.handle.wifi_toggled(true).unwrap();
        f.run_at(1000);
        assert_eq!(f.machine.state(), ModeState::Disabled);
        assert_eq!(f.visited(), vec![ModeState::ClientMode, ModeState::Disabled]);
    }

    #[test]
    fn test_soft_ap_returns_to_saved_state() {
        let mut f = fixture_with(wifi_on_settings(), Config::default());
        f.run_at(0);
        f.handle.enter_soft_ap_mode(soft_ap_request("first")).unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::SoftApModeActive);
        f.handle.stop_soft_ap_mode().unwrap();
        f.run_at(20);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
        assert_eq!(f.starts(), vec!["client", "ap", "client"]);
    }

    #[test]
    fn test_soft_ap_rejected_in_airplane_mode() {
        let mut f = fixture();
        f.handle.airplane_toggled(true).unwrap();
        f.run_at(10);
        assert_eq!(
            f.handle.enter_soft_ap_mode(soft_ap_request("ap")),
            Err(ModeRequestError::AirplaneModeOn)
        );
        f.run_at(20);
        assert_eq!(f.machine.state(), ModeState::Disabled);
        assert!(f.starts().is_empty());
    }

    #[test]
    fn test_airplane_mode_stops_soft_ap() {
        let mut f = fixture();
        f.handle.enter_soft_ap_mode(soft_ap_request("ap")).unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::SoftApModeActive);
        f.handle.airplane_toggled(true).unwrap();
        f.run_at(20);
        assert_eq!(f.machine.state(), ModeState::Disabled);
        assert_eq!(f.record.lock().unwrap().stops, vec!["ap"]);
    }

    #[test]
    fn test_soft_ap_failure_recomputes_state() {
        let mut f = fixture();
        f.record.lock().unwrap().failing.push("ap");
        f.handle.enter_soft_ap_mode(soft_ap_request("ap")).unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::Disabled);
    }

    #[test]
    fn test_new_soft_ap_request_restarts_with_queued_config() {
        let mut f = fixture();
        f.handle.enter_soft_ap_mode(soft_ap_request("first")).unwrap();
        f.run_at(10);
        f.handle.enter_soft_ap_mode(soft_ap_request("second")).unwrap();
        f.run_at(20);
        assert_eq!(f.machine.state(), ModeState::SoftApModeActive);
        let record = f.record.lock().unwrap();
        let ssids: Vec<_> = record
            .ap_configs
            .iter()
            .map(|c| c.wifi_config.as_ref().unwrap().ssid.clone())
            .collect();
        assert_eq!(ssids, vec!["first", "second"]);
    }

    #[test]
    fn test_soft_ap_restart_keeps_saved_state() {
        let mut f = fixture_with(wifi_on_settings(), Config::default());
        f.run_at(0);
        f.handle.enter_soft_ap_mode(soft_ap_request("first")).unwrap();
        f.run_at(10);
        assert_eq!(f.settings.lock().unwrap().wifi_saved_state(), WifiSavedState::Enabled);

        // Wi-Fi was switched off while the AP is up; the restart must not
        // overwrite what was recorded when the AP first took the radio.
        f.settings.lock().unwrap().handle_wifi_toggled(false);
        f.handle.enter_soft_ap_mode(soft_ap_request("second")).unwrap();
        f.run_at(20);
        assert_eq!(f.machine.state(), ModeState::SoftApModeActive);
        assert_eq!(f.settings.lock().unwrap().wifi_saved_state(), WifiSavedState::Enabled);

        f.handle.stop_soft_ap_mode().unwrap();
        f.run_at(30);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
    }

    #[test]
    fn test_soft_ap_from_disabled_records_wifi_off() {
        let mut f = fixture();
        f.settings.lock().unwrap().set_wifi_saved_state(WifiSavedState::Enabled);
        f.handle.enter_soft_ap_mode(soft_ap_request("ap")).unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::SoftApModeActive);
        assert_eq!(f.settings.lock().unwrap().wifi_saved_state(), WifiSavedState::Disabled);
    }

    #[test]
    fn test_airplane_toggle_with_wifi_off_leaves_client_mode() {
        let mut f = fixture_with(wifi_on_settings(), Config::default());
        f.run_at(0);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
        // Wi-Fi off is recorded but only the airplane signal is delivered.
        f.settings.lock().unwrap().handle_wifi_toggled(false);
        f.handle.airplane_toggled(false).unwrap();
        f.run_at(10);
        assert!(!f.settings.lock().unwrap().is_airplane_mode_on());
        assert_eq!(f.machine.state(), ModeState::Disabled);
        assert_eq!(f.record.lock().unwrap().stops, vec!["client"]);
    }

    #[test]
    fn test_emergency_counts_overlapping_signals() {
        let mut f = fixture_with(wifi_on_settings(), Config::default());
        f.run_at(0);
        f.handle.emergency_call_state_changed(true).unwrap();
        f.handle.emergency_callback_mode_changed(true).unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::EmergencyCallbackMode);
        f.handle.emergency_call_state_changed(false).unwrap();
        f.run_at(20);
        assert_eq!(f.machine.state(), ModeState::EmergencyCallbackMode);
        f.handle.emergency_callback_mode_changed(false).unwrap();
        f.run_at(30);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
    }

    #[test]
    fn test_emergency_ignored_when_not_configured() {
        let config = Config { disable_wifi_in_ecbm: false, ..Config::default() };
        let mut f = fixture_with(wifi_on_settings(), config);
        f.run_at(0);
        f.handle.emergency_call_state_changed(true).unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
    }

    #[test]
    fn test_recovery_restart_passes_through_disabled() {
        let mut f = fixture_with(wifi_on_settings(), Config::default());
        f.run_at(0);
        f.visited();
        f.handle.restart_wifi("firmware crash").unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
        assert_eq!(
            f.visited(),
            vec![ModeState::Disabled, ModeState::ClientMode, ModeState::ClientModeActive]
        );
        assert_eq!(f.starts(), vec!["client", "client"]);
    }

    #[test]
    fn test_recovery_disable() {
        let mut f = fixture_with(wifi_on_settings(), Config::default());
        f.run_at(0);
        f.handle.disable_wifi_for_recovery().unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::Disabled);
    }

    #[test]
    fn test_hal_stopped_restarts_active_mode() {
        let mut f = fixture_with(wifi_on_settings(), Config::default());
        f.run_at(0);
        f.machine.tx.send(Command::HalStopped).unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
        assert_eq!(f.starts(), vec!["client", "client"]);
    }

    #[test]
    fn test_superseded_manager_report_is_dropped() {
        let mut f = fixture_with(wifi_on_settings(), Config::default());
        f.run_at(0);
        f.machine
            .tx
            .send(Command::ModeManagerStateChanged { manager_id: 999, state: WifiState::Disabled })
            .unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
    }

    #[test]
    fn test_direct_mode_requests() {
        let mut f = fixture();
        f.handle.enter_scan_only_mode().unwrap();
        f.run_at(10);
        assert_eq!(f.machine.state(), ModeState::ScanOnlyModeActive);
        f.handle.enter_client_mode().unwrap();
        f.run_at(20);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
        f.handle.enter_client_mode().unwrap();
        f.run_at(30);
        assert_eq!(f.machine.state(), ModeState::ClientModeActive);
        f.handle.disable_wifi().unwrap();
        f.run_at(40);
        assert_eq!(f.machine.state(), ModeState::Disabled);
        f.handle.user_present().unwrap();
        f.run_at(50);
        assert!(f.machine.first_user_sign_on());
    }

    #[test]
    fn test_shutdown_stops_manager() {
        let mut f = fixture_with(wifi_on_settings(), Config::default());
        f.run_at(0);
        f.handle.shutdown().unwrap();
        f.run_at(10);
        assert!(f.machine.is_stopped());
        assert_eq!(f.record.lock().unwrap().stops, vec!["client"]);
    }

    #[test]
    fn test_spawned_runner() {
        let f = fixture_with(
            WifiSettingsStore::new(),
            Config { reenable_delay: Duration::ZERO, ..Config::default() },
        );
        let handle = f.handle.clone();
        let runner = f.machine.spawn().unwrap();
        handle.wifi_toggled(true).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.current_state() != ModeState::ClientModeActive {
            assert!(Instant::now() < deadline, "runner never reached client mode");
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown().unwrap();
        runner.join().unwrap();
        assert_eq!(handle.wifi_toggled(false), Err(ModeRequestError::StateMachineStopped));
    }
}
