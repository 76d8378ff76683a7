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

//! Messages processed by the mode state machine.

use crate::mode::managers::WifiState;
use crate::mode::soft_ap_config::SoftApModeConfiguration;
use thiserror::Error;

#[derive(Debug)]
pub enum Command {
    /// The Wi-Fi toggle changed; read the new value from settings.
    WifiToggled,
    AirplaneToggled,
    /// Scan-always or location mode changed.
    ScanAlwaysModeChanged,
    StartSoftAp(SoftApModeConfiguration),
    StopSoftAp,
    EmergencyCallStateChanged(bool),
    EmergencyModeChanged(bool),
    RecoveryRestartWifi(String),
    RecoveryRestartWifiContinue,
    RecoveryDisableWifi,
    /// A toggle held back by the re-enable cool-down. Only acted on while
    /// `serial` is still current.
    DeferredToggle { serial: u64, command: Box<Command> },
    ModeManagerStateChanged { manager_id: u64, state: WifiState },
    /// The device manager reported it stopped.
    HalStopped,
    UserPresent,
    StartClientMode,
    StartScanOnlyMode,
    DisableWifi,
    Shutdown,
}

/// A mode request turned away before reaching the state machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModeRequestError {
    #[error("airplane mode is on")]
    AirplaneModeOn,
    #[error("mode state machine is not running")]
    StateMachineStopped,
}
