//! Change-event stream (§4.8, §9 "Expose a change-event stream instead
//! of requiring polling").
//!
//! Grounded on `seesaw::EventBus` — the blanket `impl<T: Clone + Send +
//! Sync + 'static> Event for T` in `seesaw-rs/src/core.rs` means any
//! plain clonable struct/enum here is already a valid event with no
//! extra trait wiring, matching how `seesaw`'s own domain events are
//! defined throughout the teacher's `packages/server`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternEventKind {
    PatternLearned,
    PatternApplied,
    PatternTransferred,
    PatternQuarantined,
    PatternRetired,
}

/// Emitted on `seesaw::EventBus` whenever the Learning Engine or API
/// Pattern Registry changes state observable to a caller (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternChangeEvent {
    pub kind: PatternEventKind,
    pub domain: String,
    pub pattern_id: Option<uuid::Uuid>,
    pub detail: String,
}

impl PatternChangeEvent {
    pub fn learned(domain: impl Into<String>, pattern_id: uuid::Uuid, detail: impl Into<String>) -> Self {
        Self {
            kind: PatternEventKind::PatternLearned,
            domain: domain.into(),
            pattern_id: Some(pattern_id),
            detail: detail.into(),
        }
    }

    pub fn applied(domain: impl Into<String>, pattern_id: uuid::Uuid) -> Self {
        Self {
            kind: PatternEventKind::PatternApplied,
            domain: domain.into(),
            pattern_id: Some(pattern_id),
            detail: String::new(),
        }
    }

    pub fn transferred(domain: impl Into<String>, pattern_id: uuid::Uuid, from_domain: impl Into<String>) -> Self {
        Self {
            kind: PatternEventKind::PatternTransferred,
            domain: domain.into(),
            pattern_id: Some(pattern_id),
            detail: format!("transferred from {}", from_domain.into()),
        }
    }

    pub fn quarantined(domain: impl Into<String>, pattern_id: uuid::Uuid) -> Self {
        Self {
            kind: PatternEventKind::PatternQuarantined,
            domain: domain.into(),
            pattern_id: Some(pattern_id),
            detail: String::new(),
        }
    }

    pub fn retired(domain: impl Into<String>, pattern_id: uuid::Uuid) -> Self {
        Self {
            kind: PatternEventKind::PatternRetired,
            domain: domain.into(),
            pattern_id: Some(pattern_id),
            detail: String::new(),
        }
    }
}
