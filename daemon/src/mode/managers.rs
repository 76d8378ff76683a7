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

//! Mode managers: each owns the one interface its operating mode needs.
//!
//! A manager reports its progress through a `StateListener`: `Enabled`
//! once the interface is up, `Unknown` when it could not get there, and
//! `Disabled` after a stop or when the interface vanished underneath it.

use crate::devices::device_manager::DeviceManager;
use crate::devices::listener::destroyed_listener;
use crate::dispatch::Executor;
use crate::hal::{IfaceIdentifier, IfaceType, InterfaceControl};
use crate::mode::soft_ap_config::{SoftApConfig, SoftApModeConfiguration};
use log::{error, info, warn};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WifiState {
    /// Failed to start.
    Unknown,
    Disabled,
    Enabled,
}

pub trait StateListener: Send + Sync {
    fn on_state_changed(&self, state: WifiState);
}

impl<F: Fn(WifiState) + Send + Sync> StateListener for F {
    fn on_state_changed(&self, state: WifiState) {
        self(state)
    }
}

pub trait ActiveModeManager: Send {
    fn start(&mut self);
    fn stop(&mut self);
    fn iface(&self) -> Option<IfaceIdentifier>;
}

/// Builds the managers the mode state machine drives.
pub trait ModeManagerFactory: Send {
    fn make_client_mode_manager(
        &self,
        listener: Arc<dyn StateListener>,
    ) -> Box<dyn ActiveModeManager>;

    fn make_scan_only_mode_manager(
        &self,
        listener: Arc<dyn StateListener>,
    ) -> Box<dyn ActiveModeManager>;

    fn make_soft_ap_manager(
        &self,
        listener: Arc<dyn StateListener>,
        config: SoftApModeConfiguration,
    ) -> Box<dyn ActiveModeManager>;
}

/// Creates, raises, lowers and removes one interface.
struct IfaceLifecycle {
    role: &'static str,
    iface_type: IfaceType,
    dm: Arc<DeviceManager>,
    iface_control: Arc<dyn InterfaceControl>,
    executor: Arc<dyn Executor>,
    listener: Arc<dyn StateListener>,
    iface: Option<IfaceIdentifier>,
    // Name of the interface this manager still considers its own.
    active_name: Arc<Mutex<Option<String>>>,
}

impl IfaceLifecycle {
    fn new(
        role: &'static str,
        iface_type: IfaceType,
        deps: &ManagerDeps,
        listener: Arc<dyn StateListener>,
    ) -> Self {
        IfaceLifecycle {
            role,
            iface_type,
            dm: deps.dm.clone(),
            iface_control: deps.iface_control.clone(),
            executor: deps.executor.clone(),
            listener,
            iface: None,
            active_name: Arc::new(Mutex::new(None)),
        }
    }

    fn report(&self, state: WifiState) {
        self.listener.on_state_changed(state);
    }

    fn fail(&self, reason: &str) {
        error!("{}: {reason}", self.role);
        self.report(WifiState::Unknown);
    }

    fn bring_up(&mut self) {
        if self.iface.is_some() {
            warn!("{}: already started", self.role);
            return;
        }
        if !self.dm.is_started() && !self.dm.start() {
            self.fail("device manager failed to start");
            return;
        }
        let active = self.active_name.clone();
        let listener = self.listener.clone();
        let role = self.role;
        let on_destroyed = destroyed_listener(self.executor.clone(), move |name: &str| {
            let was_active = {
                let mut active = active.lock().unwrap_or_else(|e| e.into_inner());
                if active.as_deref() == Some(name) {
                    *active = None;
                    true
                } else {
                    false
                }
            };
            if was_active {
                warn!("{role}: interface {name} destroyed while in use");
                listener.on_state_changed(WifiState::Disabled);
            }
        });
        let Some(iface) = self.dm.create_iface(self.iface_type, Some(on_destroyed), None) else {
            self.fail("could not create interface");
            return;
        };
        let Some(name) = self.dm.get_name(iface) else {
            self.dm.remove_iface(iface);
            self.fail("interface has no name");
            return;
        };
        if !self.iface_control.set_interface_up(&name, true) {
            self.dm.remove_iface(iface);
            self.fail("could not bring interface up");
            return;
        }
        *self.active_name.lock().unwrap_or_else(|e| e.into_inner()) = Some(name.clone());
        self.iface = Some(iface);
        info!("{}: {name} is up", self.role);
        self.report(WifiState::Enabled);
    }

    fn tear_down(&mut self) {
        let name = self.active_name.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(iface) = self.iface.take() {
            if let Some(name) = &name {
                if !self.iface_control.set_interface_up(name, false) {
                    warn!("{}: could not bring {name} down", self.role);
                }
            }
            self.dm.remove_iface(iface);
            info!("{}: stopped", self.role);
        }
        self.report(WifiState::Disabled);
    }
}

/// Station interface for connectivity.
pub struct ClientModeManager {
    lifecycle: IfaceLifecycle,
}

impl ActiveModeManager for ClientModeManager {
    fn start(&mut self) {
        self.lifecycle.bring_up();
    }

    fn stop(&mut self) {
        self.lifecycle.tear_down();
    }

    fn iface(&self) -> Option<IfaceIdentifier> {
        self.lifecycle.iface
    }
}

/// Station interface used only for background scans.
pub struct ScanOnlyModeManager {
    lifecycle: IfaceLifecycle,
}

impl ActiveModeManager for ScanOnlyModeManager {
    fn start(&mut self) {
        self.lifecycle.bring_up();
    }

    fn stop(&mut self) {
        self.lifecycle.tear_down();
    }

    fn iface(&self) -> Option<IfaceIdentifier> {
        self.lifecycle.iface
    }
}

pub struct SoftApManager {
    lifecycle: IfaceLifecycle,
    mode_config: SoftApModeConfiguration,
    applied: Option<SoftApConfig>,
}

impl SoftApManager {
    /// The configuration the running AP was started with.
    pub fn applied_config(&self) -> Option<&SoftApConfig> {
        self.applied.as_ref()
    }
}

impl ActiveModeManager for SoftApManager {
    fn start(&mut self) {
        let config = match self.mode_config.resolve() {
            Ok(config) => config,
            Err(e) => {
                self.lifecycle.fail(&format!("invalid configuration: {e}"));
                return;
            }
        };
        info!(
            "soft AP: starting {:?} network {} on {:?}",
            self.mode_config.target_mode, config.ssid, config.band
        );
        self.applied = Some(config);
        self.lifecycle.bring_up();
    }

    fn stop(&mut self) {
        self.applied = None;
        self.lifecycle.tear_down();
    }

    fn iface(&self) -> Option<IfaceIdentifier> {
        self.lifecycle.iface
    }
}

/// Collaborators shared by every manager.
#[derive(Clone)]
pub struct ManagerDeps {
    pub dm: Arc<DeviceManager>,
    pub iface_control: Arc<dyn InterfaceControl>,
    /// Where destroyed-listener callbacks run.
    pub executor: Arc<dyn Executor>,
}

pub struct DefaultModeManagerFactory {
    deps: ManagerDeps,
}

impl DefaultModeManagerFactory {
    pub fn new(deps: ManagerDeps) -> Self {
        DefaultModeManagerFactory { deps }
    }
}

impl ModeManagerFactory for DefaultModeManagerFactory {
    fn make_client_mode_manager(
        &self,
        listener: Arc<dyn StateListener>,
    ) -> Box<dyn ActiveModeManager> {
        Box::new(ClientModeManager {
            lifecycle: IfaceLifecycle::new("client mode", IfaceType::Sta, &self.deps, listener),
        })
    }

    fn make_scan_only_mode_manager(
        &self,
        listener: Arc<dyn StateListener>,
    ) -> Box<dyn ActiveModeManager> {
        Box::new(ScanOnlyModeManager {
            lifecycle: IfaceLifecycle::new("scan-only mode", IfaceType::Sta, &self.deps, listener),
        })
    }

    fn make_soft_ap_manager(
        &self,
        listener: Arc<dyn StateListener>,
        config: SoftApModeConfiguration,
    ) -> Box<dyn ActiveModeManager> {
        Box::new(SoftApManager {
            lifecycle: IfaceLifecycle::new("soft AP", IfaceType::Ap, &self.deps, listener),
            mode_config: config,
            applied: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::QueuedExecutor;
    use crate::events::Events;
    use crate::hal::mocked::{MockChip, MockInterfaceControl, MockServiceManager, MockWifi};
    use crate::hal::ChipIdentifier;
    use crate::mode::soft_ap_config::{ApBand, SoftApTargetMode};

    struct Fixture {
        wifi: Arc<MockWifi>,
        control: Arc<MockInterfaceControl>,
        executor: Arc<QueuedExecutor>,
        factory: DefaultModeManagerFactory,
        dm: Arc<DeviceManager>,
    }

    fn fixture() -> Fixture {
        let sm = MockServiceManager::new();
        let wifi = MockWifi::new(vec![MockChip::single_sta_or_ap(ChipIdentifier(0))]);
        sm.register_service(wifi.clone());
        let dm = DeviceManager::new(sm, Events::new());
        dm.initialize();
        let control = MockInterfaceControl::new();
        let executor = QueuedExecutor::new();
        let factory = DefaultModeManagerFactory::new(ManagerDeps {
            dm: dm.clone(),
            iface_control: control.clone(),
            executor: executor.clone(),
        });
        Fixture { wifi, control, executor, factory, dm }
    }

    fn recorder() -> (Arc<dyn StateListener>, Arc<Mutex<Vec<WifiState>>>) {
        let states = Arc::new(Mutex::new(Vec::new()));
        let states_clone = states.clone();
        let listener: Arc<dyn StateListener> =
            Arc::new(move |s: WifiState| states_clone.lock().unwrap().push(s));
        (listener, states)
    }

    #[test]
    fn test_client_start_stop() {
        let f = fixture();
        let (listener, states) = recorder();
        let mut manager = f.factory.make_client_mode_manager(listener);
        manager.start();
        assert!(f.dm.is_started());
        let iface = manager.iface().unwrap();
        assert!(f.control.is_up("wlan0"));
        manager.stop();
        assert!(manager.iface().is_none());
        assert!(!f.control.is_up("wlan0"));
        assert!(f.dm.get_iface_type(iface).is_none());
        // Our own removal is not reported as an unexpected loss.
        f.executor.run_pending();
        assert_eq!(*states.lock().unwrap(), vec![WifiState::Enabled, WifiState::Disabled]);
    }

    #[test]
    fn test_start_failure_reports_unknown() {
        let f = fixture();
        f.wifi.set_fail_start(true);
        let (listener, states) = recorder();
        let mut manager = f.factory.make_scan_only_mode_manager(listener);
        manager.start();
        assert!(manager.iface().is_none());
        assert_eq!(*states.lock().unwrap(), vec![WifiState::Unknown]);
    }

    #[test]
    fn test_iface_up_failure_removes_iface() {
        let f = fixture();
        f.control.set_fail(true);
        let (listener, states) = recorder();
        let mut manager = f.factory.make_client_mode_manager(listener);
        manager.start();
        assert_eq!(f.dm.iface_count(), 0);
        assert_eq!(*states.lock().unwrap(), vec![WifiState::Unknown]);
    }

    #[test]
    fn test_unexpected_destroy_reports_disabled() {
        let f = fixture();
        let (listener, states) = recorder();
        let mut manager = f.factory.make_client_mode_manager(listener);
        manager.start();
        f.wifi.kill();
        f.executor.run_pending();
        assert_eq!(*states.lock().unwrap(), vec![WifiState::Enabled, WifiState::Disabled]);
    }

    #[test]
    fn test_soft_ap_rejects_invalid_config() {
        let f = fixture();
        let (listener, states) = recorder();
        let bad = SoftApConfig {
            ssid: String::new(),
            passphrase: None,
            band: ApBand::TwoGhz,
            hidden: false,
        };
        let mut manager = f.factory.make_soft_ap_manager(
            listener,
            SoftApModeConfiguration::new(SoftApTargetMode::Tethered, Some(bad)),
        );
        manager.start();
        assert!(manager.iface().is_none());
        assert_eq!(f.dm.iface_count(), 0);
        assert_eq!(*states.lock().unwrap(), vec![WifiState::Unknown]);
    }

    #[test]
    fn test_soft_ap_start() {
        let f = fixture();
        let (listener, states) = recorder();
        let mut manager = f.factory.make_soft_ap_manager(
            listener,
            SoftApModeConfiguration::new(SoftApTargetMode::LocalOnly, None),
        );
        manager.start();
        let iface = manager.iface().unwrap();
        assert_eq!(f.dm.get_iface_type(iface), Some(IfaceType::Ap));
        assert!(f.control.is_up("ap0"));
        assert_eq!(*states.lock().unwrap(), vec![WifiState::Enabled]);
    }
}
