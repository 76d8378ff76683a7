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

//! Boundaries to the radio service, its chips, the service manager that
//! announces the radio service and the interface up/down helper.
//!
//! Every call is synchronous and returns a status; asynchronous events
//! (service registration, death, failure) arrive through callbacks.

pub mod mocked;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChipIdentifier(pub u32);

impl fmt::Display for ChipIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IfaceIdentifier(pub u32);

impl fmt::Display for IfaceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical interface types a chip can host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IfaceType {
    Sta,
    Ap,
    P2p,
    Nan,
}

impl IfaceType {
    pub const ALL: [IfaceType; 4] = [IfaceType::Sta, IfaceType::Ap, IfaceType::P2p, IfaceType::Nan];

    pub fn index(self) -> usize {
        match self {
            IfaceType::Sta => 0,
            IfaceType::Ap => 1,
            IfaceType::P2p => 2,
            IfaceType::Nan => 3,
        }
    }
}

impl fmt::Display for IfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IfaceType::Sta => "STA",
            IfaceType::Ap => "AP",
            IfaceType::P2p => "P2P",
            IfaceType::Nan => "NAN",
        };
        write!(f, "{name}")
    }
}

/// Opaque chip mode identifier reported by the chip.
pub type ChipModeId = u32;

/// Up to `max_ifaces` interfaces drawn from `types`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChipIfaceCombinationLimit {
    pub types: Vec<IfaceType>,
    pub max_ifaces: u32,
}

/// A set of limits that may be satisfied simultaneously.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChipIfaceCombination {
    pub limits: Vec<ChipIfaceCombinationLimit>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChipMode {
    pub id: ChipModeId,
    pub available_combinations: Vec<ChipIfaceCombination>,
}

/// Status codes reported across the radio service boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WifiStatusCode {
    ErrorWifiChipInvalid,
    ErrorWifiIfaceInvalid,
    ErrorNotSupported,
    ErrorNotAvailable,
    ErrorNotStarted,
    ErrorInvalidArgs,
    ErrorBusy,
    ErrorUnknown,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code:?}: {description}")]
pub struct HalError {
    pub code: WifiStatusCode,
    pub description: String,
}

impl HalError {
    pub fn new(code: WifiStatusCode, description: impl Into<String>) -> Self {
        HalError { code, description: description.into() }
    }
}

pub type HalResult<T> = Result<T, HalError>;

/// Invoked at most once when the linked remote object dies.
pub type DeathRecipient = Box<dyn FnOnce() + Send>;

/// Cancellable death subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeathToken(pub u64);

/// Fired when the radio service announces itself (again).
pub type ServiceNotification = Box<dyn Fn() + Send + Sync>;

/// Events reported by the radio service.
pub trait WifiEventCallback: Send + Sync {
    fn on_start(&self);
    fn on_stop(&self);
    fn on_failure(&self, error: &HalError);
}

/// The top-level radio service.
///
/// A death recipient or event callback may run synchronously from
/// `link_to_death` and `register_event_callback`. From the other calls only
/// `on_start` and `on_stop` may be delivered synchronously; death and
/// `on_failure` must come from another thread.
pub trait WifiService: Send + Sync {
    fn link_to_death(&self, recipient: DeathRecipient) -> HalResult<DeathToken>;
    fn unlink_to_death(&self, token: DeathToken);
    fn register_event_callback(&self, callback: Arc<dyn WifiEventCallback>) -> HalResult<()>;
    fn is_started(&self) -> HalResult<bool>;
    fn start(&self) -> HalResult<()>;
    fn stop(&self) -> HalResult<()>;
    fn get_chip_ids(&self) -> HalResult<Vec<ChipIdentifier>>;
    fn get_chip(&self, chip_id: ChipIdentifier) -> HalResult<Arc<dyn WifiChip>>;
}

/// One radio chip exposed by the radio service.
pub trait WifiChip: Send + Sync {
    fn get_id(&self) -> ChipIdentifier;
    fn get_available_modes(&self) -> HalResult<Vec<ChipMode>>;
    /// `None` while the chip has never been configured.
    fn get_mode(&self) -> HalResult<Option<ChipModeId>>;
    /// Switching modes destroys every interface on the chip.
    fn configure_chip(&self, mode_id: ChipModeId) -> HalResult<()>;
    fn create_iface(&self, iface_type: IfaceType) -> HalResult<IfaceIdentifier>;
    fn remove_iface(&self, iface_type: IfaceType, name: &str) -> HalResult<()>;
    fn get_iface_name(&self, iface: IfaceIdentifier) -> HalResult<String>;
    fn get_iface_type(&self, iface: IfaceIdentifier) -> HalResult<IfaceType>;
}

/// Announces registrations of the radio service.
pub trait ServiceManager: Send + Sync {
    fn link_to_death(&self, recipient: DeathRecipient) -> HalResult<DeathToken>;
    /// The callback also fires right away when the service is already
    /// registered.
    fn register_for_notifications(&self, callback: ServiceNotification) -> HalResult<()>;
    fn get_wifi_service(&self) -> Option<Arc<dyn WifiService>>;
}

/// Administrative up/down of a named network interface.
pub trait InterfaceControl: Send + Sync {
    fn set_interface_up(&self, name: &str, up: bool) -> bool;
}
