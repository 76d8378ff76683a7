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

//! Soft AP start parameters.

use rand::Rng;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoftApTargetMode {
    Tethered,
    LocalOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApBand {
    TwoGhz,
    FiveGhz,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoftApConfig {
    pub ssid: String,
    /// `None` for an open network.
    pub passphrase: Option<String>,
    pub band: ApBand,
    pub hidden: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SoftApConfigError {
    #[error("SSID must be 1 to 32 bytes, got {0}")]
    SsidLength(usize),
    #[error("passphrase must be 8 to 63 characters, got {0}")]
    PassphraseLength(usize),
}

impl SoftApConfig {
    /// Open 2.4 GHz network named `AndroidAP_NNNN`.
    pub fn generate_default() -> Self {
        let suffix: u16 = rand::thread_rng().gen_range(1000..10000);
        SoftApConfig {
            ssid: format!("AndroidAP_{suffix}"),
            passphrase: None,
            band: ApBand::TwoGhz,
            hidden: false,
        }
    }

    pub fn validate(&self) -> Result<(), SoftApConfigError> {
        let ssid_len = self.ssid.len();
        if !(1..=32).contains(&ssid_len) {
            return Err(SoftApConfigError::SsidLength(ssid_len));
        }
        if let Some(passphrase) = &self.passphrase {
            let len = passphrase.chars().count();
            if !(8..=63).contains(&len) {
                return Err(SoftApConfigError::PassphraseLength(len));
            }
        }
        Ok(())
    }
}

/// What a soft AP request asks for; queued until the AP mode is entered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoftApModeConfiguration {
    pub target_mode: SoftApTargetMode,
    pub wifi_config: Option<SoftApConfig>,
}

impl SoftApModeConfiguration {
    pub fn new(target_mode: SoftApTargetMode, wifi_config: Option<SoftApConfig>) -> Self {
        SoftApModeConfiguration { target_mode, wifi_config }
    }

    /// The configuration to apply, generating a default when none was given.
    pub fn resolve(&self) -> Result<SoftApConfig, SoftApConfigError> {
        let config = self.wifi_config.clone().unwrap_or_else(SoftApConfig::generate_default);
        config.validate()?;
        Ok(config)
    }
}
