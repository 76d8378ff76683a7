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

//! A module with mpmc channels for distributing lifecycle events.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::hal::{ChipIdentifier, IfaceIdentifier, IfaceType};
use crate::mode::state_machine::ModeState;

/// Event messages shared across the device manager, the mode state machine
/// and external observers in a loosely coupled manner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    WifiStarted,
    WifiStopped,
    InterfaceAdded {
        iface_id: IfaceIdentifier,
        iface_type: IfaceType,
        chip_id: ChipIdentifier,
    },
    InterfaceRemoved {
        iface_id: IfaceIdentifier,
        iface_type: IfaceType,
    },
    ModeChanged {
        from: ModeState,
        to: ModeState,
    },
    ShutDown {
        reason: String,
    },
}

/// Broadcast queue over `std::sync::mpsc`: every subscriber receives its
/// own copy of each published event, in publish order.
///
/// Events published before a subscriber joins are not replayed to it.
pub struct Events {
    subscribers: Vec<Sender<Event>>,
}

impl Events {
    pub fn new() -> Arc<Mutex<Events>> {
        Arc::new(Mutex::new(Self { subscribers: Vec::new() }))
    }

    pub fn subscribe(&mut self) -> Receiver<Event> {
        let (tx, rx) = channel::<Event>();
        self.subscribers.push(tx);
        rx
    }

    /// Sends `msg` to every live subscriber and forgets the ones whose
    /// receiver is gone.
    pub fn publish(&mut self, msg: Event) {
        if self.subscribers.is_empty() {
            log::debug!("event {msg:?} has no subscriber");
            return;
        }
        self.subscribers.retain(|subscriber| subscriber.send(msg.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Publishes through a shared `Events`, tolerating a poisoned lock.
pub fn publish(events: &Mutex<Events>, msg: Event) {
    events.lock().unwrap_or_else(|e| e.into_inner()).publish(msg);
}
