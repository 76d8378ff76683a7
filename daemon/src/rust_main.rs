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

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wifi_common::util::wifi_logger;

use crate::args::WifidArgs;
use crate::config::{ChipProfile, Config};
use crate::config_file;
use crate::devices::device_manager::DeviceManager;
use crate::dispatch::ThreadExecutor;
use crate::events::{self, Event, Events};
use crate::hal::mocked::{MockChip, MockInterfaceControl, MockServiceManager, MockWifi};
use crate::hal::ChipIdentifier;
use crate::mode::managers::{DefaultModeManagerFactory, ManagerDeps};
use crate::mode::settings::WifiSettingsStore;
use crate::mode::soft_ap_config::{ApBand, SoftApConfig, SoftApModeConfiguration, SoftApTargetMode};
use crate::mode::state_machine::{ModeStateMachine, ModeStateMachineHandle};

/// Wi-Fi mode control daemon driven by line commands against a simulated
/// HAL.
pub fn rust_main() {
    // enable Rust backtrace by setting env RUST_BACKTRACE=full
    env::set_var("RUST_BACKTRACE", "full");
    let args = WifidArgs::parse();
    wifi_logger::init("wifid", args.verbose);
    if let Err(e) = run(args) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

/// One line of input.
#[derive(Debug, PartialEq, Eq)]
enum Request {
    Wifi(bool),
    Airplane(bool),
    ScanAlways(bool),
    Location(bool),
    ApStart { ssid: Option<String>, passphrase: Option<String> },
    ApStop,
    EmergencyCall(bool),
    EmergencyMode(bool),
    RecoveryRestart,
    RecoveryDisable,
    UserPresent,
    HalKill,
    HalRegister,
    Status,
    Sleep(Duration),
    Quit,
}

fn parse_on_off(word: Option<&str>) -> Result<bool, String> {
    match word {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        other => Err(format!("expected on|off, got {}", other.unwrap_or("nothing"))),
    }
}

fn parse_start_end(word: Option<&str>) -> Result<bool, String> {
    match word {
        Some("start") => Ok(true),
        Some("end") => Ok(false),
        other => Err(format!("expected start|end, got {}", other.unwrap_or("nothing"))),
    }
}

/// Parses a command line; blank lines and `#` comments yield `None`.
fn parse_request(line: &str) -> Result<Option<Request>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut words = line.split_whitespace();
    let request = match words.next() {
        Some("wifi") => Request::Wifi(parse_on_off(words.next())?),
        Some("airplane") => Request::Airplane(parse_on_off(words.next())?),
        Some("scan-always") => Request::ScanAlways(parse_on_off(words.next())?),
        Some("location") => Request::Location(parse_on_off(words.next())?),
        Some("ap") => match words.next() {
            Some("start") => Request::ApStart {
                ssid: words.next().map(str::to_string),
                passphrase: words.next().map(str::to_string),
            },
            Some("stop") => Request::ApStop,
            _ => return Err("usage: ap start [ssid] [passphrase] | ap stop".to_string()),
        },
        Some("emergency") => match words.next() {
            Some("call") => Request::EmergencyCall(parse_start_end(words.next())?),
            Some("mode") => Request::EmergencyMode(parse_start_end(words.next())?),
            _ => return Err("usage: emergency call|mode start|end".to_string()),
        },
        Some("recovery") => match words.next() {
            Some("restart") => Request::RecoveryRestart,
            Some("disable") => Request::RecoveryDisable,
            _ => return Err("usage: recovery restart|disable".to_string()),
        },
        Some("user-present") => Request::UserPresent,
        Some("hal") => match words.next() {
            Some("kill") => Request::HalKill,
            Some("register") => Request::HalRegister,
            _ => return Err("usage: hal kill|register".to_string()),
        },
        Some("status") => Request::Status,
        Some("sleep") => {
            let ms = words
                .next()
                .and_then(|w| w.parse::<u64>().ok())
                .ok_or_else(|| "usage: sleep <ms>".to_string())?;
            Request::Sleep(Duration::from_millis(ms))
        }
        Some("quit") => Request::Quit,
        Some(other) => return Err(format!("unknown command: {other}")),
        None => return Ok(None),
    };
    Ok(Some(request))
}

// Command line overrides config file settings
fn disambiguate_args(args: &WifidArgs, config: &mut Config) {
    if let Some(settings) = &args.settings {
        config.settings_file = Some(settings.clone());
    }
    if let Some(chip_profile) = args.chip_profile {
        config.chip_profile = chip_profile;
    }
    if let Some(ms) = args.reenable_delay_ms {
        config.reenable_delay = Duration::from_millis(ms);
    }
}

fn load_settings(config: &Config) -> WifiSettingsStore {
    let Some(path) = &config.settings_file else {
        return WifiSettingsStore::new();
    };
    match WifiSettingsStore::load(path.clone()) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Using default settings, failed to load {}: {e:#}", path.display());
            WifiSettingsStore::new()
        }
    }
}

// Logs every event until ShutDown.
fn spawn_event_logger(events_rx: Receiver<Event>) -> anyhow::Result<JoinHandle<()>> {
    Ok(thread::Builder::new().name("event_logger".to_string()).spawn(move || {
        while let Ok(event) = events_rx.recv() {
            info!("event: {event:?}");
            if let Event::ShutDown { reason } = event {
                info!("wifid is shutdown: {reason}");
                return;
            }
        }
    })?)
}

/// The simulated world commands act on.
struct Simulation {
    handle: ModeStateMachineHandle,
    dm: Arc<DeviceManager>,
    service_manager: Arc<MockServiceManager>,
    wifi: Arc<MockWifi>,
    settings: Arc<Mutex<WifiSettingsStore>>,
}

impl Simulation {
    /// Executes requests until `quit` or end of input; returns why it stopped.
    fn run_requests(&self, input: Box<dyn BufRead>) -> String {
        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => return format!("input error: {e}"),
            };
            match parse_request(&line) {
                Ok(Some(Request::Quit)) => return "quit".to_string(),
                Ok(Some(request)) => self.execute(request),
                Ok(None) => {}
                Err(e) => warn!("{e}"),
            }
        }
        "end of input".to_string()
    }

    fn execute(&self, request: Request) {
        info!("{request:?}");
        let result = match request {
            Request::Wifi(on) => self.handle.wifi_toggled(on),
            Request::Airplane(on) => self.handle.airplane_toggled(on),
            Request::ScanAlways(on) => self.handle.scan_always_mode_changed(on),
            Request::Location(on) => self.handle.location_mode_changed(on),
            Request::ApStart { ssid, passphrase } => {
                let wifi_config = ssid.map(|ssid| SoftApConfig {
                    ssid,
                    passphrase,
                    band: ApBand::TwoGhz,
                    hidden: false,
                });
                self.handle.enter_soft_ap_mode(SoftApModeConfiguration::new(
                    SoftApTargetMode::Tethered,
                    wifi_config,
                ))
            }
            Request::ApStop => self.handle.stop_soft_ap_mode(),
            Request::EmergencyCall(active) => self.handle.emergency_call_state_changed(active),
            Request::EmergencyMode(active) => self.handle.emergency_callback_mode_changed(active),
            Request::RecoveryRestart => self.handle.restart_wifi("requested from command line"),
            Request::RecoveryDisable => self.handle.disable_wifi_for_recovery(),
            Request::UserPresent => self.handle.user_present(),
            Request::HalKill => {
                self.wifi.kill();
                Ok(())
            }
            Request::HalRegister => {
                self.service_manager.register_service(self.wifi.clone());
                Ok(())
            }
            Request::Status => {
                self.print_status();
                Ok(())
            }
            Request::Sleep(duration) => {
                thread::sleep(duration);
                Ok(())
            }
            Request::Quit => Ok(()),
        };
        if let Err(e) = result {
            warn!("request rejected: {e}");
        }
    }

    fn print_status(&self) {
        let (toggle, airplane, scan) = {
            let settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            (
                settings.is_wifi_toggle_enabled(),
                settings.is_airplane_mode_on(),
                settings.check_scan_only_mode_available(),
            )
        };
        println!("mode: {}", self.handle.current_state());
        println!("wifi toggle: {toggle}, airplane: {airplane}, scan-only available: {scan}");
        print!("{}", self.dm.dump());
    }
}

fn run(args: WifidArgs) -> anyhow::Result<()> {
    // Log all args
    info!("{:#?}", args);

    let mut config = Config::default();
    if let Some(ref filename) = args.config {
        match config_file::new_from_file(filename) {
            Ok(config_from_file) => {
                config = config_from_file;
            }
            Err(e) => {
                error!("Skipping config in {}: {}", filename, e);
            }
        }
    }
    disambiguate_args(&args, &mut config);
    info!("{:#?}", config);

    let settings = Arc::new(Mutex::new(load_settings(&config)));
    let events = Events::new();
    let event_logger = spawn_event_logger(events.lock().unwrap_or_else(|e| e.into_inner()).subscribe())?;

    let chip = match config.chip_profile {
        ChipProfile::Single => MockChip::single_sta_or_ap(ChipIdentifier(0)),
        ChipProfile::Concurrent => MockChip::concurrent(ChipIdentifier(0)),
    };
    let wifi = MockWifi::new(vec![chip]);
    let service_manager = MockServiceManager::new();
    let executor = ThreadExecutor::new("wifi_callbacks")?;

    let dm = DeviceManager::new(service_manager.clone(), events.clone());
    dm.initialize();
    service_manager.register_service(wifi.clone());

    let factory = DefaultModeManagerFactory::new(ManagerDeps {
        dm: dm.clone(),
        iface_control: MockInterfaceControl::new(),
        executor: executor.clone(),
    });
    let (machine, handle) = ModeStateMachine::new(
        config,
        dm.clone(),
        Box::new(factory),
        settings.clone(),
        events.clone(),
        executor,
    );
    let runner = machine.spawn()?;

    let input: Box<dyn BufRead> = match &args.script {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening script {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let simulation = Simulation {
        handle: handle.clone(),
        dm,
        service_manager,
        wifi,
        settings: settings.clone(),
    };
    let reason = simulation.run_requests(input);

    events::publish(&events, Event::ShutDown { reason });
    if handle.shutdown().is_ok() && runner.join().is_err() {
        error!("mode state machine thread panicked");
    }
    if event_logger.join().is_err() {
        error!("event logger thread panicked");
    }
    let saved = settings.lock().unwrap_or_else(|e| e.into_inner()).save();
    saved
}
