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

use std::path::PathBuf;

use clap::Parser;

use crate::config::ChipProfile;

#[derive(Debug, Parser)]
#[command(name = "wifid", about = "Wi-Fi mode control daemon on a simulated HAL")]
pub struct WifidArgs {
    /// Configuration file with key=value lines
    #[arg(short, long)]
    pub config: Option<String>,

    /// File the Wi-Fi settings are persisted in
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Read commands from this file instead of stdin
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Simulated chip: single or concurrent
    #[arg(long, alias = "chip_profile")]
    pub chip_profile: Option<ChipProfile>,

    /// Minimum time between disabling and re-enabling Wi-Fi
    #[arg(long, alias = "reenable_delay_ms")]
    pub reenable_delay_ms: Option<u64>,

    /// Set verbose mode
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = WifidArgs::parse_from([
            "wifid",
            "--chip-profile",
            "concurrent",
            "--reenable-delay-ms",
            "250",
            "-v",
        ]);
        assert_eq!(args.chip_profile, Some(ChipProfile::Concurrent));
        assert_eq!(args.reenable_delay_ms, Some(250));
        assert!(args.verbose);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_reject_unknown_chip_profile() {
        assert!(WifidArgs::try_parse_from(["wifid", "--chip-profile", "dual"]).is_err());
    }
}
