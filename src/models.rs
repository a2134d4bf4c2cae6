use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::ledger::{LedgerSubject, StatusEvent};

pub type StatusId = i32;
pub type TermId = i32;
pub type PersonTypeId = i32;

/// Which status catalog (and which ledger) a status belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Proposal,
    Thesis,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proposal => f.write_str("proposal"),
            Self::Thesis => f.write_str("thesis"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonType {
    pub id: PersonTypeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id_card_number: String,
    pub type_id: PersonTypeId,
    pub name: String,
    pub last_name: String,
    pub institutional_email: Option<String>,
    pub email: String,
    pub primary_phone: String,
    pub secondary_phone: Option<String>,
    pub observations: Option<String>,
}

impl fmt::Display for Person {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.name, self.last_name, self.id_card_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Term {
    pub id: TermId,
    pub period: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub id: StatusId,
    pub kind: StatusKind,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Proposal {
    pub code: String,
    pub submission_date: NaiveDate,
    pub title: String,
    pub student1: Option<String>,
    pub student2: Option<String>,
    pub academic_tutor: String,
    pub industry_tutor: Option<String>,
    pub term_id: TermId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Thesis {
    pub code: String,
    pub proposal_code: String,
    pub title: String,
    pub delivery_term_id: TermId,
    pub nrc: String,
    pub description: String,
    pub thematic_category: String,
    pub submission_date: NaiveDate,
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Defence {
    pub code: String,
    pub thesis_code: String,
    pub scheduled_at: DateTime<Utc>,
    pub grade: Option<i16>,
    pub is_publication_mention: bool,
    pub is_honorific_mention: bool,
    pub corrections_submission_date: Option<NaiveDate>,
    pub was_grade_loaded: bool,
    pub observations: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JuryAssignment {
    pub id: Uuid,
    pub person_id: String,
    pub defence_code: String,
    pub is_backup: bool,
    pub confirmed_assistance: bool,
}

/// An entity paired with the latest event of its status ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WithStatus<T> {
    pub record: T,
    pub current_status: Option<StatusEvent>,
}

impl<T> WithStatus<T> {
    pub fn status_name(&self) -> Option<&str> {
        self.current_status
            .as_ref()
            .map(|event| event.status_name.as_str())
    }

    /// The current status, or `NoCurrentStatus` for an empty ledger.
    pub fn require_status(&self, subject: impl FnOnce() -> LedgerSubject) -> Result<&StatusEvent> {
        self.current_status
            .as_ref()
            .ok_or_else(|| RegistryError::NoCurrentStatus(subject()))
    }
}

/// Everything the term report needs, gathered in one read.
#[derive(Debug, Clone, Serialize)]
pub struct TermOverview {
    pub term: Term,
    pub proposals: Vec<WithStatus<Proposal>>,
    pub theses: Vec<WithStatus<Thesis>>,
    pub defences: Vec<DefenceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DefenceSummary {
    pub defence: Defence,
    pub thesis_title: String,
    pub principal_jurors: usize,
    pub backup_jurors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn person_display_matches_listing_format() {
        let person = Person {
            id_card_number: "V-20111222".to_string(),
            type_id: 1,
            name: "Ana".to_string(),
            last_name: "Rojas".to_string(),
            institutional_email: None,
            email: "ana@example.com".to_string(),
            primary_phone: "0412-5550000".to_string(),
            secondary_phone: None,
            observations: None,
        };
        assert_eq!(person.to_string(), "Ana Rojas (V-20111222)");
    }

    #[test]
    fn missing_status_is_reported_for_subject() {
        let empty: WithStatus<()> = WithStatus {
            record: (),
            current_status: None,
        };
        assert!(empty.status_name().is_none());
        let err = empty
            .require_status(|| LedgerSubject::Proposal("P9".to_string()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoCurrentStatus(_)));
    }
}
