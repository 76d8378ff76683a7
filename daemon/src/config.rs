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

/// Configuration for wifid.
///
/// Built once at startup from defaults, the optional config file and the
/// command line, then handed explicitly to the components that need it.
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Minimum time after Wi-Fi is disabled before an enable is acted on.
pub const DEFAULT_REENABLE_DELAY: Duration = Duration::from_millis(500);

/// Added on top of the remaining cool-down of a deferred toggle.
pub const DEFAULT_DEFER_MARGIN: Duration = Duration::from_millis(5);

/// The simulated chip wifid runs against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChipProfile {
    /// STA (+ P2P/NAN) or AP, never both.
    Single,
    /// STA + AP, or STA + P2P/NAN, in a single chip mode.
    Concurrent,
}

impl FromStr for ChipProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(ChipProfile::Single),
            "concurrent" => Ok(ChipProfile::Concurrent),
            other => Err(format!("unknown chip profile: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub reenable_delay: Duration,
    pub defer_margin: Duration,
    /// Emergency calls and callback mode force Wi-Fi off.
    pub disable_wifi_in_ecbm: bool,
    pub settings_file: Option<PathBuf>,
    pub chip_profile: ChipProfile,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            reenable_delay: DEFAULT_REENABLE_DELAY,
            defer_margin: DEFAULT_DEFER_MARGIN,
            disable_wifi_in_ecbm: true,
            settings_file: None,
            chip_profile: ChipProfile::Single,
        }
    }
}
