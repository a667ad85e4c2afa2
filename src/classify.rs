//! Leak-kind classifier.
//!
//! Nearly degenerate on purpose: the tracker already names the kind; this
//! pass re-derives it from the witness event and the final tracker state
//! and refuses to ship a verdict the two disagree on. Guards against
//! tracker bugs, not against bad input.

use crate::error::Inconclusive;
use crate::models::{LeakKind, RootCause, Witness};

/// Confirm the tracker's verdict against the kind post-conditions.
pub fn confirm(cause: &RootCause) -> Result<(), Inconclusive> {
    let expected = expected_kind(cause);
    match expected {
        Some(kind) if kind == cause.kind => Ok(()),
        _ => Err(Inconclusive::ClassifierMismatch {
            expected: expected
                .map(|k| k.to_string())
                .unwrap_or_else(|| "no kind satisfies the post-conditions".to_string()),
            got: cause.kind.to_string(),
        }),
    }
}

fn expected_kind(cause: &RootCause) -> Option<LeakKind> {
    if cause.freed {
        // A freed allocation never classifies as a leak.
        return None;
    }
    match cause.witness {
        Witness::ScopeExit | Witness::EndOfTrace => Some(LeakKind::MissingFree),
        Witness::Assign => Some(LeakKind::PathLossByReassignment),
        Witness::Free => Some(LeakKind::ContainerFreedFirst),
        // A return empties the roots two ways: the allocation's result was
        // never received anywhere (no root ever existed), or the returning
        // frame held the last root and nothing re-bound it.
        Witness::Return => {
            if cause.roots_at_leak.is_empty() {
                Some(LeakKind::MissingFree)
            } else {
                Some(LeakKind::PathLossByReassignment)
            }
        }
    }
}
