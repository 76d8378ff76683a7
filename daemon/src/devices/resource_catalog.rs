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

//! Static description of what a chip can host in each of its chip modes,
//! and the preemption policy built on top of it.
//!
//! Preemption: an existing interface may be removed to make room for a
//! request when its type priority is lower than or equal to the requested
//! type's priority. Among workable proposals the catalog picks, in order:
//! the fewest removals, staying in the current chip mode, removing the
//! lowest priorities, removing the lowest handles.

use crate::hal::{ChipIfaceCombination, ChipMode, ChipModeId, IfaceIdentifier, IfaceType};
use log::warn;

/// Upper bound on the interfaces weighed for preemption in one request.
/// Beyond it only the lowest priorities (then lowest handles) are tried.
const MAX_PREEMPTION_CANDIDATES: usize = 16;

/// Interface count per type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IfaceCounts([u32; 4]);

impl IfaceCounts {
    pub fn from_types<I: IntoIterator<Item = IfaceType>>(types: I) -> Self {
        let mut counts = IfaceCounts::default();
        for t in types {
            counts.add(t);
        }
        counts
    }

    pub fn add(&mut self, iface_type: IfaceType) {
        self.0[iface_type.index()] += 1;
    }

    pub fn get(&self, iface_type: IfaceType) -> u32 {
        self.0[iface_type.index()]
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }
}

/// How to make room for a requested interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreationProposal {
    pub mode_id: ChipModeId,
    /// The chip must be reconfigured into `mode_id` first.
    pub reconfigure: bool,
    /// Interfaces to remove, ascending.
    pub remove: Vec<IfaceIdentifier>,
    removed_priorities: Vec<u8>,
}

impl CreationProposal {
    fn rank(&self) -> (usize, bool, &[u8], &[IfaceIdentifier]) {
        (self.remove.len(), self.reconfigure, &self.removed_priorities, &self.remove)
    }

    pub fn is_better_than(&self, other: &CreationProposal) -> bool {
        self.rank() < other.rank()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ResourceCatalog {
    modes: Vec<ChipMode>,
}

impl ResourceCatalog {
    pub fn new(modes: Vec<ChipMode>) -> Self {
        ResourceCatalog { modes }
    }

    pub fn modes(&self) -> &[ChipMode] {
        &self.modes
    }

    /// Combinations allowed in `mode_id`; empty when the mode is unknown.
    pub fn supported_combinations(&self, mode_id: ChipModeId) -> &[ChipIfaceCombination] {
        self.modes
            .iter()
            .find(|m| m.id == mode_id)
            .map(|m| m.available_combinations.as_slice())
            .unwrap_or(&[])
    }

    /// Preemption rank; higher wins.
    pub fn priority(iface_type: IfaceType) -> u8 {
        match iface_type {
            IfaceType::Ap => 4,
            IfaceType::Sta => 3,
            IfaceType::P2p => 2,
            IfaceType::Nan => 1,
        }
    }

    /// Whether some combination of `mode_id` can host all of `counts`.
    pub fn can_host(&self, mode_id: ChipModeId, counts: &IfaceCounts) -> bool {
        self.supported_combinations(mode_id).iter().any(|c| combination_fits(c, counts))
    }

    /// Cheapest way to host one more `requested` interface next to `live`,
    /// or `None` when no mode can host it even after preemption.
    pub fn best_proposal(
        &self,
        current_mode: Option<ChipModeId>,
        live: &[(IfaceIdentifier, IfaceType)],
        requested: IfaceType,
    ) -> Option<CreationProposal> {
        let requested_priority = Self::priority(requested);
        let mut best: Option<CreationProposal> = None;
        let mut consider = |proposal: CreationProposal| {
            if best.as_ref().map_or(true, |b| proposal.is_better_than(b)) {
                best = Some(proposal);
            }
        };

        for mode in &self.modes {
            if current_mode == Some(mode.id) {
                let mut preemptable: Vec<usize> = (0..live.len())
                    .filter(|&i| Self::priority(live[i].1) <= requested_priority)
                    .collect();
                if preemptable.len() > MAX_PREEMPTION_CANDIDATES {
                    warn!(
                        "{} preemptable interfaces, weighing only {MAX_PREEMPTION_CANDIDATES}",
                        preemptable.len()
                    );
                    preemptable.sort_by_key(|&i| (Self::priority(live[i].1), live[i].0));
                    preemptable.truncate(MAX_PREEMPTION_CANDIDATES);
                }
                // Every subset of the preemptable interfaces.
                for mask in 0u32..(1u32 << preemptable.len()) {
                    let removed: Vec<usize> = preemptable
                        .iter()
                        .enumerate()
                        .filter(|(bit, _)| mask & (1 << bit) != 0)
                        .map(|(_, &i)| i)
                        .collect();
                    let mut counts = IfaceCounts::from_types(
                        (0..live.len()).filter(|i| !removed.contains(i)).map(|i| live[i].1),
                    );
                    counts.add(requested);
                    if self.can_host(mode.id, &counts) {
                        consider(proposal(mode.id, false, removed.iter().map(|&i| live[i])));
                    }
                }
            } else {
                if live.iter().any(|(_, t)| Self::priority(*t) > requested_priority) {
                    continue;
                }
                if self.can_host(mode.id, &IfaceCounts::from_types([requested])) {
                    consider(proposal(mode.id, true, live.iter().copied()));
                }
            }
        }
        best
    }
}

fn proposal<I>(mode_id: ChipModeId, reconfigure: bool, removed: I) -> CreationProposal
where
    I: Iterator<Item = (IfaceIdentifier, IfaceType)>,
{
    let mut removed: Vec<(IfaceIdentifier, IfaceType)> = removed.collect();
    removed.sort_by_key(|(id, _)| *id);
    let mut removed_priorities: Vec<u8> =
        removed.iter().map(|(_, t)| ResourceCatalog::priority(*t)).collect();
    removed_priorities.sort_unstable_by(|a, b| b.cmp(a));
    CreationProposal {
        mode_id,
        reconfigure,
        remove: removed.into_iter().map(|(id, _)| id).collect(),
        removed_priorities,
    }
}

/// Assigns every interface in `counts` to a limit of `combination` that
/// accepts its type, backtracking over limits shared by several types.
fn combination_fits(combination: &ChipIfaceCombination, counts: &IfaceCounts) -> bool {
    let mut pending: Vec<IfaceType> = Vec::new();
    for t in IfaceType::ALL {
        for _ in 0..counts.get(t) {
            pending.push(t);
        }
    }
    let mut capacity: Vec<u32> = combination.limits.iter().map(|l| l.max_ifaces).collect();
    assign(combination, &pending, &mut capacity)
}

fn assign(combination: &ChipIfaceCombination, pending: &[IfaceType], capacity: &mut [u32]) -> bool {
    let Some((first, rest)) = pending.split_first() else {
        return true;
    };
    for (i, limit) in combination.limits.iter().enumerate() {
        if capacity[i] > 0 && limit.types.contains(first) {
            capacity[i] -= 1;
            let fits = assign(combination, rest, capacity);
            capacity[i] += 1;
            if fits {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ChipIfaceCombinationLimit;
    use crate::hal::mocked::{
        concurrent_modes, single_sta_or_ap_modes, AP_CHIP_MODE_ID, STA_CHIP_MODE_ID,
    };

    const H1: IfaceIdentifier = IfaceIdentifier(1);
    const H2: IfaceIdentifier = IfaceIdentifier(2);
    const H3: IfaceIdentifier = IfaceIdentifier(3);

    #[test]
    fn test_unknown_mode_supports_nothing() {
        let catalog = ResourceCatalog::new(single_sta_or_ap_modes());
        assert!(catalog.supported_combinations(42).is_empty());
        assert!(!catalog.can_host(42, &IfaceCounts::from_types([IfaceType::Sta])));
    }

    #[test]
    fn test_priority_order() {
        assert!(ResourceCatalog::priority(IfaceType::Ap) > ResourceCatalog::priority(IfaceType::Sta));
        assert!(ResourceCatalog::priority(IfaceType::Sta) > ResourceCatalog::priority(IfaceType::P2p));
        assert!(ResourceCatalog::priority(IfaceType::P2p) > ResourceCatalog::priority(IfaceType::Nan));
    }

    #[test]
    fn test_shared_limit_backtracks() {
        let catalog = ResourceCatalog::new(concurrent_modes());
        assert!(catalog.can_host(
            STA_CHIP_MODE_ID,
            &IfaceCounts::from_types([IfaceType::Sta, IfaceType::Nan])
        ));
        assert!(!catalog.can_host(
            STA_CHIP_MODE_ID,
            &IfaceCounts::from_types([IfaceType::P2p, IfaceType::Nan])
        ));
        assert!(!catalog.can_host(
            STA_CHIP_MODE_ID,
            &IfaceCounts::from_types([IfaceType::Ap, IfaceType::P2p])
        ));
    }

    #[test]
    fn test_unconfigured_chip_picks_mode() {
        let catalog = ResourceCatalog::new(single_sta_or_ap_modes());
        let p = catalog.best_proposal(None, &[], IfaceType::Ap).unwrap();
        assert_eq!(p.mode_id, AP_CHIP_MODE_ID);
        assert!(p.reconfigure);
        assert!(p.remove.is_empty());
    }

    #[test]
    fn test_fits_without_changes() {
        let catalog = ResourceCatalog::new(single_sta_or_ap_modes());
        let p = catalog
            .best_proposal(Some(STA_CHIP_MODE_ID), &[(H1, IfaceType::Sta)], IfaceType::P2p)
            .unwrap();
        assert_eq!(p.mode_id, STA_CHIP_MODE_ID);
        assert!(!p.reconfigure);
        assert!(p.remove.is_empty());
    }

    #[test]
    fn test_ap_preempts_sta_with_mode_change() {
        let catalog = ResourceCatalog::new(single_sta_or_ap_modes());
        let live = [(H1, IfaceType::Sta), (H2, IfaceType::P2p)];
        let p = catalog.best_proposal(Some(STA_CHIP_MODE_ID), &live, IfaceType::Ap).unwrap();
        assert_eq!(p.mode_id, AP_CHIP_MODE_ID);
        assert!(p.reconfigure);
        assert_eq!(p.remove, vec![H1, H2]);
    }

    #[test]
    fn test_lower_priority_cannot_preempt() {
        let catalog = ResourceCatalog::new(single_sta_or_ap_modes());
        let live = [(H1, IfaceType::Ap)];
        assert!(catalog.best_proposal(Some(AP_CHIP_MODE_ID), &live, IfaceType::Sta).is_none());
        assert!(catalog.best_proposal(Some(AP_CHIP_MODE_ID), &live, IfaceType::Nan).is_none());
    }

    #[test]
    fn test_same_mode_removes_lowest_priority() {
        let catalog = ResourceCatalog::new(concurrent_modes());
        let live = [(H1, IfaceType::Sta), (H2, IfaceType::P2p)];
        let p = catalog.best_proposal(Some(STA_CHIP_MODE_ID), &live, IfaceType::Ap).unwrap();
        assert!(!p.reconfigure);
        assert_eq!(p.remove, vec![H2]);
    }

    #[test]
    fn test_equal_priority_replaces() {
        let catalog = ResourceCatalog::new(concurrent_modes());
        let live = [(H1, IfaceType::Sta), (H3, IfaceType::Nan)];
        let p = catalog.best_proposal(Some(STA_CHIP_MODE_ID), &live, IfaceType::Nan).unwrap();
        assert_eq!(p.remove, vec![H3]);
        let p = catalog.best_proposal(Some(STA_CHIP_MODE_ID), &live, IfaceType::Sta).unwrap();
        assert_eq!(p.remove, vec![H1]);
    }

    #[test]
    fn test_many_live_interfaces_do_not_overflow() {
        let catalog = ResourceCatalog::new(vec![ChipMode {
            id: STA_CHIP_MODE_ID,
            available_combinations: vec![ChipIfaceCombination {
                limits: vec![ChipIfaceCombinationLimit {
                    types: vec![IfaceType::Sta, IfaceType::P2p],
                    max_ifaces: 40,
                }],
            }],
        }]);
        let live: Vec<(IfaceIdentifier, IfaceType)> =
            (1..=40).rev().map(|n| (IfaceIdentifier(n), IfaceType::P2p)).collect();
        let proposal =
            catalog.best_proposal(Some(STA_CHIP_MODE_ID), &live, IfaceType::Sta).unwrap();
        assert!(!proposal.reconfigure);
        assert_eq!(proposal.remove, vec![IfaceIdentifier(1)]);
    }

    #[test]
    fn test_tie_break_on_lowest_handle() {
        let modes = vec![ChipMode {
            id: 0,
            available_combinations: vec![ChipIfaceCombination {
                limits: vec![crate::hal::ChipIfaceCombinationLimit {
                    types: vec![IfaceType::P2p, IfaceType::Nan],
                    max_ifaces: 2,
                }],
            }],
        }];
        let catalog = ResourceCatalog::new(modes);
        let live = [(H3, IfaceType::P2p), (H2, IfaceType::P2p)];
        let p = catalog.best_proposal(Some(0), &live, IfaceType::P2p).unwrap();
        assert_eq!(p.remove, vec![H2]);
    }
}
