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

//! User-facing Wi-Fi settings consulted by the mode state machine.
//!
//! Mirrors the toggle/airplane interplay of the platform settings: turning
//! airplane mode on remembers that Wi-Fi was on, and a user who turns Wi-Fi
//! on while in airplane mode overrides it until airplane mode ends.

use anyhow::{anyhow, Context};
use log::warn;
use std::path::PathBuf;
use wifi_common::util::ini_file::IniFile;

const SETTINGS_VERSION: u32 = 1;

/// Persisted toggle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PersistedWifiState {
    Disabled,
    Enabled,
    /// Enabled by the user while airplane mode is on.
    EnabledAirplaneOverride,
    /// Was enabled when airplane mode turned on.
    DisabledAirplaneOn,
}

impl PersistedWifiState {
    fn code(self) -> u64 {
        match self {
            PersistedWifiState::Disabled => 0,
            PersistedWifiState::Enabled => 1,
            PersistedWifiState::EnabledAirplaneOverride => 2,
            PersistedWifiState::DisabledAirplaneOn => 3,
        }
    }

    fn from_code(code: u64) -> anyhow::Result<Self> {
        match code {
            0 => Ok(PersistedWifiState::Disabled),
            1 => Ok(PersistedWifiState::Enabled),
            2 => Ok(PersistedWifiState::EnabledAirplaneOverride),
            3 => Ok(PersistedWifiState::DisabledAirplaneOn),
            other => Err(anyhow!("invalid persisted wifi state {other}")),
        }
    }
}

/// Whether Wi-Fi was on when soft AP took over the radio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WifiSavedState {
    Disabled,
    Enabled,
}

pub struct WifiSettingsStore {
    persisted: PersistedWifiState,
    airplane_mode_on: bool,
    scan_always_available: bool,
    location_mode_on: bool,
    saved_state: WifiSavedState,
    filepath: Option<PathBuf>,
}

impl Default for WifiSettingsStore {
    fn default() -> Self {
        WifiSettingsStore {
            persisted: PersistedWifiState::Disabled,
            airplane_mode_on: false,
            scan_always_available: false,
            location_mode_on: true,
            saved_state: WifiSavedState::Disabled,
            filepath: None,
        }
    }
}

impl WifiSettingsStore {
    /// In-memory store with defaults.
    pub fn new() -> Self {
        WifiSettingsStore::default()
    }

    /// Loads the store from `filepath`; a missing file yields defaults that
    /// will be written there on the first change.
    pub fn load(filepath: PathBuf) -> anyhow::Result<Self> {
        let mut store = WifiSettingsStore { filepath: Some(filepath.clone()), ..Default::default() };
        if !filepath.exists() {
            return Ok(store);
        }
        let mut ini = IniFile::new(filepath);
        ini.read()?;
        match ini.version()? {
            Some(SETTINGS_VERSION) | None => {}
            Some(other) => return Err(anyhow!("unsupported settings version {other}")),
        }
        if let Some(code) = ini.get_u64("wifi_on")? {
            store.persisted = PersistedWifiState::from_code(code)?;
        }
        if let Some(on) = ini.get_bool("airplane_mode_on")? {
            store.airplane_mode_on = on;
        }
        if let Some(on) = ini.get_bool("scan_always_enabled")? {
            store.scan_always_available = on;
        }
        if let Some(on) = ini.get_bool("location_mode_on")? {
            store.location_mode_on = on;
        }
        if let Some(enabled) = ini.get_bool("wifi_saved_state")? {
            store.saved_state =
                if enabled { WifiSavedState::Enabled } else { WifiSavedState::Disabled };
        }
        Ok(store)
    }

    /// Writes the store to its file, if it has one.
    pub fn save(&self) -> anyhow::Result<()> {
        let Some(filepath) = &self.filepath else {
            return Ok(());
        };
        let mut ini = IniFile::new(filepath.clone());
        ini.set_version(SETTINGS_VERSION);
        ini.insert("wifi_on", &self.persisted.code().to_string());
        ini.insert("airplane_mode_on", &self.airplane_mode_on.to_string());
        ini.insert("scan_always_enabled", &self.scan_always_available.to_string());
        ini.insert("location_mode_on", &self.location_mode_on.to_string());
        ini.insert(
            "wifi_saved_state",
            &(self.saved_state == WifiSavedState::Enabled).to_string(),
        );
        ini.write().context("saving wifi settings")
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!("{e:#}");
        }
    }

    pub fn is_wifi_toggle_enabled(&self) -> bool {
        if self.airplane_mode_on {
            self.persisted == PersistedWifiState::EnabledAirplaneOverride
        } else {
            self.persisted != PersistedWifiState::Disabled
        }
    }

    pub fn is_airplane_mode_on(&self) -> bool {
        self.airplane_mode_on
    }

    /// Background scanning is never available in airplane mode.
    pub fn is_scan_always_available(&self) -> bool {
        !self.airplane_mode_on && self.scan_always_available
    }

    pub fn is_location_mode_on(&self) -> bool {
        self.location_mode_on
    }

    /// Scan-only mode needs location mode and background scanning.
    pub fn check_scan_only_mode_available(&self) -> bool {
        self.location_mode_on && self.is_scan_always_available()
    }

    pub fn wifi_saved_state(&self) -> WifiSavedState {
        self.saved_state
    }

    pub fn handle_wifi_toggled(&mut self, enabled: bool) {
        self.persisted = match (enabled, self.airplane_mode_on) {
            (false, _) => PersistedWifiState::Disabled,
            (true, true) => PersistedWifiState::EnabledAirplaneOverride,
            (true, false) => PersistedWifiState::Enabled,
        };
        self.persist();
    }

    pub fn handle_airplane_toggled(&mut self, on: bool) {
        self.airplane_mode_on = on;
        if on {
            if self.persisted == PersistedWifiState::Enabled {
                self.persisted = PersistedWifiState::DisabledAirplaneOn;
            }
        } else if matches!(
            self.persisted,
            PersistedWifiState::EnabledAirplaneOverride | PersistedWifiState::DisabledAirplaneOn
        ) {
            self.persisted = PersistedWifiState::Enabled;
        }
        self.persist();
    }

    pub fn set_scan_always_available(&mut self, available: bool) {
        self.scan_always_available = available;
        self.persist();
    }

    pub fn set_location_mode(&mut self, on: bool) {
        self.location_mode_on = on;
        self.persist();
    }

    pub fn set_wifi_saved_state(&mut self, state: WifiSavedState) {
        self.saved_state = state;
        self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{distributions::Alphanumeric, Rng};
    use std::env;

    fn temp_settings_path() -> PathBuf {
        env::temp_dir().join(format!(
            "wifi_settings_{}.ini",
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect::<String>()
        ))
    }

    #[test]
    fn test_toggle() {
        let mut store = WifiSettingsStore::new();
        assert!(!store.is_wifi_toggle_enabled());
        store.handle_wifi_toggled(true);
        assert!(store.is_wifi_toggle_enabled());
        store.handle_wifi_toggled(false);
        assert!(!store.is_wifi_toggle_enabled());
    }

    #[test]
    fn test_airplane_remembers_wifi() {
        let mut store = WifiSettingsStore::new();
        store.handle_wifi_toggled(true);
        store.handle_airplane_toggled(true);
        assert!(!store.is_wifi_toggle_enabled());
        store.handle_airplane_toggled(false);
        assert!(store.is_wifi_toggle_enabled());
    }

    #[test]
    fn test_user_override_in_airplane() {
        let mut store = WifiSettingsStore::new();
        store.handle_airplane_toggled(true);
        store.handle_wifi_toggled(true);
        assert!(store.is_wifi_toggle_enabled());
        store.handle_airplane_toggled(false);
        assert!(store.is_wifi_toggle_enabled());
    }

    #[test]
    fn test_scan_only_availability() {
        let mut store = WifiSettingsStore::new();
        assert!(!store.check_scan_only_mode_available());
        store.set_scan_always_available(true);
        assert!(store.check_scan_only_mode_available());
        store.set_location_mode(false);
        assert!(!store.check_scan_only_mode_available());
        store.set_location_mode(true);
        store.handle_airplane_toggled(true);
        assert!(!store.check_scan_only_mode_available());
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_settings_path();
        {
            let mut store = WifiSettingsStore::load(path.clone()).unwrap();
            store.handle_wifi_toggled(true);
            store.set_scan_always_available(true);
            store.set_wifi_saved_state(WifiSavedState::Enabled);
        }
        let store = WifiSettingsStore::load(path.clone()).unwrap();
        assert!(store.is_wifi_toggle_enabled());
        assert!(store.is_scan_always_available());
        assert_eq!(store.wifi_saved_state(), WifiSavedState::Enabled);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_load_rejects_future_version() {
        let path = temp_settings_path();
        std::fs::write(&path, "version=9\nwifi_on=1\n").unwrap();
        assert!(WifiSettingsStore::load(path.clone()).is_err());
        std::fs::remove_file(path).unwrap();
    }
}
