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

//! Per-interface records keyed by interface handle.
//!
//! Not synchronized: the device manager keeps the registry under its lock.

use crate::devices::listener::{DestroyedListener, ListenerId};
use crate::hal::{ChipIdentifier, IfaceIdentifier, IfaceType};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("interface {0} is already registered")]
    DuplicateHandle(IfaceIdentifier),
}

pub struct IfaceCacheEntry {
    pub chip_id: ChipIdentifier,
    /// Resolved lazily from the chip and cached.
    pub name: Option<String>,
    pub iface_type: IfaceType,
    pub destroyed_listeners: BTreeMap<ListenerId, DestroyedListener>,
}

#[derive(Default)]
pub struct InterfaceRegistry {
    entries: HashMap<IfaceIdentifier, IfaceCacheEntry>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        InterfaceRegistry::default()
    }

    pub fn register(
        &mut self,
        iface: IfaceIdentifier,
        chip_id: ChipIdentifier,
        iface_type: IfaceType,
        name: Option<String>,
    ) -> Result<(), RegistryError> {
        if self.entries.contains_key(&iface) {
            return Err(RegistryError::DuplicateHandle(iface));
        }
        self.entries.insert(
            iface,
            IfaceCacheEntry { chip_id, name, iface_type, destroyed_listeners: BTreeMap::new() },
        );
        Ok(())
    }

    pub fn lookup(&self, iface: IfaceIdentifier) -> Option<&IfaceCacheEntry> {
        self.entries.get(&iface)
    }

    pub fn lookup_mut(&mut self, iface: IfaceIdentifier) -> Option<&mut IfaceCacheEntry> {
        self.entries.get_mut(&iface)
    }

    /// Removes and returns the record. Whoever gets `Some` owns the
    /// dispatch of its destroyed listeners.
    pub fn unregister(&mut self, iface: IfaceIdentifier) -> Option<IfaceCacheEntry> {
        self.entries.remove(&iface)
    }

    /// Adds `listener` to the interface's set. Returns false when the
    /// interface is unknown; adding the same listener twice is a no-op.
    pub fn add_destroyed_listener(
        &mut self,
        iface: IfaceIdentifier,
        listener: DestroyedListener,
    ) -> bool {
        match self.entries.get_mut(&iface) {
            Some(entry) => {
                entry.destroyed_listeners.entry(listener.id()).or_insert(listener);
                true
            }
            None => false,
        }
    }

    /// Live interfaces on `chip_id`, ascending by handle.
    pub fn ifaces_on_chip(&self, chip_id: ChipIdentifier) -> Vec<(IfaceIdentifier, IfaceType)> {
        let mut ifaces: Vec<(IfaceIdentifier, IfaceType)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.chip_id == chip_id)
            .map(|(id, e)| (*id, e.iface_type))
            .collect();
        ifaces.sort_by_key(|(id, _)| *id);
        ifaces
    }

    /// Removes every record, ascending by handle.
    pub fn drain(&mut self) -> Vec<(IfaceIdentifier, IfaceCacheEntry)> {
        let mut all: Vec<(IfaceIdentifier, IfaceCacheEntry)> = self.entries.drain().collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn handles(&self) -> Vec<IfaceIdentifier> {
        let mut handles: Vec<IfaceIdentifier> = self.entries.keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
