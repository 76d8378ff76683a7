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

/// Configuration file for wifid.
///
/// An ini style `key=value` file:
///
/// ```text
/// version=1
/// reenable_delay_ms=500
/// defer_margin_ms=5
/// disable_wifi_in_ecbm=true
/// settings_file=/data/wifi/settings.ini
/// chip_profile=single
/// ```
use crate::config::Config;
use log::warn;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use wifi_common::util::ini_file::IniFile;

const CONFIG_VERSION: u32 = 1;
const KNOWN_KEYS: [&str; 5] = [
    "reenable_delay_ms",
    "defer_margin_ms",
    "disable_wifi_in_ecbm",
    "settings_file",
    "chip_profile",
];

pub fn new_from_file(filename: &str) -> Result<Config, String> {
    let contents = fs::read_to_string(filename)
        .map_err(|e| format!("Failed to read config file {}: {} ", filename, e))?;
    from_str(&contents)
}

pub fn from_str(contents: &str) -> Result<Config, String> {
    let ini = IniFile::from_bytes(PathBuf::new(), contents.as_bytes())
        .map_err(|e| format!("Failed to parse config: {}", e))?;
    validate_version(&ini)?;
    for key in ini.keys().filter(|k| !KNOWN_KEYS.contains(k)) {
        warn!("Ignoring unknown config key: {key}");
    }

    let mut config = Config::default();
    let err = |e: anyhow::Error| format!("Invalid config: {}", e);
    if let Some(ms) = ini.get_u64("reenable_delay_ms").map_err(err)? {
        config.reenable_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = ini.get_u64("defer_margin_ms").map_err(err)? {
        config.defer_margin = Duration::from_millis(ms);
    }
    if let Some(flag) = ini.get_bool("disable_wifi_in_ecbm").map_err(err)? {
        config.disable_wifi_in_ecbm = flag;
    }
    if let Some(path) = ini.get("settings_file").filter(|p| !p.is_empty()) {
        config.settings_file = Some(PathBuf::from(path));
    }
    if let Some(profile) = ini.get("chip_profile") {
        config.chip_profile = profile.parse()?;
    }
    validate(&config)?;
    Ok(config)
}

fn validate_version(ini: &IniFile) -> Result<(), String> {
    match ini.version().map_err(|e| format!("Invalid config: {}", e))? {
        None => Ok(()),
        Some(CONFIG_VERSION) => Ok(()),
        Some(other) => Err(format!("Unsupported config version: {}", other)),
    }
}

fn validate(config: &Config) -> Result<(), String> {
    if config.defer_margin.is_zero() {
        return Err("defer_margin_ms must be positive".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChipProfile;

    #[test]
    fn test_ini() {
        let config = from_str(
            r#"
        version=1
        reenable_delay_ms=250
        disable_wifi_in_ecbm=false
        chip_profile=concurrent
        settings_file=/tmp/wifi_settings.ini
        "#,
        );
        assert!(config.as_ref().ok().is_some(), "{config:?}");
        let config = config.unwrap();
        assert_eq!(config.reenable_delay, Duration::from_millis(250));
        assert_eq!(config.defer_margin, Duration::from_millis(5));
        assert!(!config.disable_wifi_in_ecbm);
        assert_eq!(config.chip_profile, ChipProfile::Concurrent);
        assert_eq!(config.settings_file, Some(PathBuf::from("/tmp/wifi_settings.ini")));
    }

    #[test]
    fn test_empty_is_default() {
        assert_eq!(from_str("").unwrap(), Config::default());
    }

    #[test]
    fn test_unknown_key_is_ignored() {
        assert_eq!(from_str("color=blue\n").unwrap(), Config::default());
    }

    #[test]
    fn test_invalid_values() {
        assert!(from_str("reenable_delay_ms=soon").is_err());
        assert!(from_str("disable_wifi_in_ecbm=perhaps").is_err());
        assert!(from_str("chip_profile=quad").is_err());
        assert!(from_str("defer_margin_ms=0").is_err());
        assert!(from_str("version=2").is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(new_from_file("/nonexistent/wifid.ini").is_err());
    }
}
