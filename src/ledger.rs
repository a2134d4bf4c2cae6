//! Append-only status history for proposals and theses.
//!
//! Status is never stored on the entity. Every change is a new
//! [`StatusEvent`] and the current status is the event with the greatest
//! `occurred_at`, ties going to the greatest insertion sequence.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{StatusId, StatusKind};

/// The entity a ledger event belongs to, keyed by its code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum LedgerSubject {
    Proposal(String),
    Thesis(String),
}

impl LedgerSubject {
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::Proposal(_) => StatusKind::Proposal,
            Self::Thesis(_) => StatusKind::Thesis,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Proposal(code) | Self::Thesis(code) => code,
        }
    }

    pub(crate) fn entity(&self) -> &'static str {
        match self {
            Self::Proposal(_) => "proposal",
            Self::Thesis(_) => "thesis",
        }
    }
}

impl fmt::Display for LedgerSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entity(), self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub id: Uuid,
    pub subject: LedgerSubject,
    pub status_id: StatusId,
    pub status_name: String,
    pub occurred_at: DateTime<Utc>,
    /// Insertion sequence, strictly increasing per ledger.
    pub seq: i64,
}

impl StatusEvent {
    fn ordering_key(&self) -> (DateTime<Utc>, i64) {
        (self.occurred_at, self.seq)
    }
}

/// Picks the current event out of a subject's history.
pub fn latest<'a, I>(events: I) -> Option<&'a StatusEvent>
where
    I: IntoIterator<Item = &'a StatusEvent>,
{
    events.into_iter().max_by_key(|event| event.ordering_key())
}

/// Whether saving an entity with `requested` must append a ledger event.
pub fn needs_append(current: Option<&StatusEvent>, requested: Option<StatusId>) -> bool {
    match (current, requested) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(event), Some(status)) => event.status_id != status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn event(status_id: StatusId, minutes: i64, seq: i64) -> StatusEvent {
        let base = Utc.with_ymd_and_hms(2020, 1, 5, 18, 39, 0).unwrap();
        StatusEvent {
            id: Uuid::new_v4(),
            subject: LedgerSubject::Proposal("P1".to_string()),
            status_id,
            status_name: format!("status-{status_id}"),
            occurred_at: base + Duration::minutes(minutes),
            seq,
        }
    }

    #[test]
    fn latest_prefers_greatest_timestamp_over_insertion_order() {
        let events = vec![event(1, 10, 1), event(2, 30, 2), event(3, 20, 3)];
        assert_eq!(latest(&events).map(|e| e.status_id), Some(2));
    }

    #[test]
    fn timestamp_ties_go_to_last_inserted() {
        let events = vec![event(1, 5, 7), event(2, 5, 9), event(3, 5, 8)];
        assert_eq!(latest(&events).map(|e| e.status_id), Some(2));
    }

    #[test]
    fn empty_history_has_no_current_status() {
        let events: Vec<StatusEvent> = Vec::new();
        assert!(latest(&events).is_none());
    }

    #[test]
    fn append_only_when_status_changes() {
        let current = event(2, 0, 1);
        assert!(!needs_append(Some(&current), None));
        assert!(!needs_append(Some(&current), Some(2)));
        assert!(needs_append(Some(&current), Some(3)));
        assert!(needs_append(None, Some(1)));
        assert!(!needs_append(None, None));
    }

    #[test]
    fn subject_reports_kind_and_code() {
        let subject = LedgerSubject::Thesis("TGP100".to_string());
        assert_eq!(subject.kind(), StatusKind::Thesis);
        assert_eq!(subject.code(), "TGP100");
        assert_eq!(subject.to_string(), "thesis TGP100");
    }
}
