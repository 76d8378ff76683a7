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

/// A Chip is the device manager's record of one radio chip reported by the
/// radio service.
///
/// The record and its live interface set are only mutated by the device
/// manager under its lock; observers get `ChipInfo` snapshots.
///
use crate::devices::iface_registry::InterfaceRegistry;
use crate::devices::resource_catalog::ResourceCatalog;
use crate::hal::{ChipIdentifier, ChipModeId, HalResult, IfaceIdentifier, IfaceType, WifiChip};
use std::sync::Arc;

pub struct Chip {
    pub id: ChipIdentifier,
    pub hal: Arc<dyn WifiChip>,
    pub catalog: ResourceCatalog,
    // None until the chip has been configured.
    pub current_mode: Option<ChipModeId>,
}

impl Chip {
    /// Reads the chip's modes and current mode from the radio service.
    pub fn from_hal(hal: Arc<dyn WifiChip>) -> HalResult<Chip> {
        let catalog = ResourceCatalog::new(hal.get_available_modes()?);
        let current_mode = hal.get_mode()?;
        Ok(Chip { id: hal.get_id(), hal, catalog, current_mode })
    }

    /// Snapshot of the chip and the interfaces the registry tracks on it.
    pub fn info(&self, registry: &InterfaceRegistry) -> ChipInfo {
        let ifaces = registry
            .ifaces_on_chip(self.id)
            .into_iter()
            .map(|(id, iface_type)| {
                let name = registry.lookup(id).and_then(|e| e.name.clone());
                IfaceInfo { id, iface_type, name }
            })
            .collect();
        ChipInfo { id: self.id, current_mode: self.current_mode, ifaces }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IfaceInfo {
    pub id: IfaceIdentifier,
    pub iface_type: IfaceType,
    pub name: Option<String>,
}

/// Read-only view of a chip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChipInfo {
    pub id: ChipIdentifier,
    pub current_mode: Option<ChipModeId>,
    pub ifaces: Vec<IfaceInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mocked::{MockChip, STA_CHIP_MODE_ID};

    #[test]
    fn test_from_hal_and_info() {
        let mock = MockChip::single_sta_or_ap(ChipIdentifier(4));
        mock.configure_chip(STA_CHIP_MODE_ID).unwrap();
        let chip = Chip::from_hal(mock.clone()).unwrap();
        assert_eq!(chip.id, ChipIdentifier(4));
        assert_eq!(chip.current_mode, Some(STA_CHIP_MODE_ID));
        assert_eq!(chip.catalog.modes().len(), 2);

        let mut registry = InterfaceRegistry::new();
        registry
            .register(IfaceIdentifier(11), ChipIdentifier(4), IfaceType::Sta, Some("wlan0".into()))
            .unwrap();
        registry.register(IfaceIdentifier(12), ChipIdentifier(5), IfaceType::Ap, None).unwrap();
        let info = chip.info(&registry);
        assert_eq!(
            info.ifaces,
            vec![IfaceInfo {
                id: IfaceIdentifier(11),
                iface_type: IfaceType::Sta,
                name: Some("wlan0".into())
            }]
        );
    }
}
