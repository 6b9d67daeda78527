//! Filling a play list from a query result.
//!
//! Used when building set lists or rehearsal banks out of the catalog: take
//! the filtered patches and keep the top N, a random N, or everything from
//! the currently playing patch onward.

use rand::seq::SliceRandom;

use crate::model::PatchHolder;

/// How the candidate patches become the list content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFillMode {
    /// Keep everything as queried.
    #[default]
    None,
    /// The first `desired_count` patches.
    Top,
    /// Everything starting at the active patch (falls back to the full set
    /// when the active patch is not among the candidates).
    FromActive,
    /// A random subset of `desired_count` patches.
    Random,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListFillRequest {
    pub mode: ListFillMode,
    /// Target size for `Top`, `FromActive` and `Random`. 0 means unlimited.
    pub desired_count: usize,
    /// Pad by repeating the last patch until this size is reached.
    pub minimum_count: usize,
}

#[derive(Debug, Default)]
pub struct ListFillResult {
    pub patches: Vec<PatchHolder>,
    /// Whether `FromActive` actually found the active patch.
    pub active_patch_found: bool,
}

fn matches_active(candidate: &PatchHolder, active: Option<&PatchHolder>) -> bool {
    match active {
        Some(active) => candidate.same_patch_as(active),
        None => false,
    }
}

fn pad_to_minimum(patches: &mut Vec<PatchHolder>, minimum: usize) {
    while !patches.is_empty() && patches.len() < minimum {
        let last = patches[patches.len() - 1].clone();
        patches.push(last);
    }
}

/// Shape the candidate patches according to the request.
pub fn fill_patch_list(
    mut patches: Vec<PatchHolder>,
    active_patch: Option<&PatchHolder>,
    request: &ListFillRequest,
) -> ListFillResult {
    let mut result = ListFillResult::default();

    match request.mode {
        ListFillMode::None => {
            result.patches = patches;
        }
        ListFillMode::Top => {
            if request.desired_count > 0 && patches.len() > request.desired_count {
                patches.truncate(request.desired_count);
            }
            result.patches = patches;
        }
        ListFillMode::FromActive => {
            if let Some(start) = patches
                .iter()
                .position(|candidate| matches_active(candidate, active_patch))
            {
                result.active_patch_found = true;
                patches.drain(..start);
            }
            if request.desired_count > 0 && patches.len() > request.desired_count {
                patches.truncate(request.desired_count);
            }
            result.patches = patches;
        }
        ListFillMode::Random => {
            let take = if request.desired_count == 0 {
                patches.len()
            } else {
                request.desired_count.min(patches.len())
            };
            patches.shuffle(&mut rand::thread_rng());
            patches.truncate(take);
            result.patches = patches;
        }
    }

    pad_to_minimum(&mut result.patches, request.minimum_count);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BankNumber;
    use crate::testsynth::{make_holder, TestSynth};

    fn candidates(count: u32) -> Vec<PatchHolder> {
        let synth = TestSynth::builder("FillSynth").single_bank(32).build();
        let bank = BankNumber::new(0, 32);
        (0..count)
            .map(|i| make_holder(&synth, &format!("C{i}"), bank, i, None))
            .collect()
    }

    #[test]
    fn test_none_keeps_everything() {
        let result = fill_patch_list(candidates(5), None, &ListFillRequest::default());
        assert_eq!(result.patches.len(), 5);
        assert!(!result.active_patch_found);
    }

    #[test]
    fn test_top_truncates() {
        let request = ListFillRequest {
            mode: ListFillMode::Top,
            desired_count: 3,
            minimum_count: 0,
        };
        let result = fill_patch_list(candidates(5), None, &request);
        assert_eq!(result.patches.len(), 3);
        assert_eq!(result.patches[0].name(), "C0");
    }

    #[test]
    fn test_from_active_starts_at_active() {
        let patches = candidates(5);
        let active = patches[2].clone();
        let request = ListFillRequest {
            mode: ListFillMode::FromActive,
            desired_count: 0,
            minimum_count: 0,
        };
        let result = fill_patch_list(patches, Some(&active), &request);
        assert!(result.active_patch_found);
        assert_eq!(result.patches.len(), 3);
        assert_eq!(result.patches[0].name(), "C2");
    }

    #[test]
    fn test_from_active_without_match_keeps_all() {
        let patches = candidates(4);
        let other_synth = TestSynth::builder("Other").single_bank(8).build();
        let foreign = make_holder(&other_synth, "X", BankNumber::new(0, 8), 0, None);
        let request = ListFillRequest {
            mode: ListFillMode::FromActive,
            desired_count: 0,
            minimum_count: 0,
        };
        let result = fill_patch_list(patches, Some(&foreign), &request);
        assert!(!result.active_patch_found);
        assert_eq!(result.patches.len(), 4);
    }

    #[test]
    fn test_random_subset_size() {
        let request = ListFillRequest {
            mode: ListFillMode::Random,
            desired_count: 3,
            minimum_count: 0,
        };
        let result = fill_patch_list(candidates(10), None, &request);
        assert_eq!(result.patches.len(), 3);

        let oversized = ListFillRequest {
            mode: ListFillMode::Random,
            desired_count: 20,
            minimum_count: 0,
        };
        let result = fill_patch_list(candidates(4), None, &oversized);
        assert_eq!(result.patches.len(), 4);
    }

    #[test]
    fn test_minimum_padding_repeats_last() {
        let request = ListFillRequest {
            mode: ListFillMode::Top,
            desired_count: 2,
            minimum_count: 5,
        };
        let result = fill_patch_list(candidates(2), None, &request);
        assert_eq!(result.patches.len(), 5);
        assert_eq!(result.patches[4].name(), "C1");
    }

    #[test]
    fn test_padding_leaves_empty_input_alone() {
        let request = ListFillRequest {
            mode: ListFillMode::None,
            desired_count: 0,
            minimum_count: 5,
        };
        let result = fill_patch_list(Vec::new(), None, &request);
        assert!(result.patches.is_empty());
    }
}
