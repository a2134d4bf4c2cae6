//! The storage-agnostic API of the registry.
//!
//! Both backends implement [`Registry`]; the rules they share (promotion
//! eligibility, grading, default catalogs) live here so the Postgres and
//! in-memory stores cannot drift apart.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::jury::{JurorDraft, JuryPolicy};
use crate::ledger::{LedgerSubject, StatusEvent};
use crate::models::{
    Defence, JuryAssignment, Person, PersonType, Proposal, Status, StatusId, StatusKind, Term,
    TermId, TermOverview, Thesis, WithStatus,
};
use crate::search::{Page, PageRequest, SearchSpec};

pub const DEFAULT_PERSON_TYPES: &[&str] = &["Profesor", "Estudiante", "Externo"];

pub const DEFAULT_PROPOSAL_STATUSES: &[&str] = &["Por evaluar", "Diferida", "Aprobada", "Rechazada"];

pub const DEFAULT_THESIS_STATUSES: &[&str] = &[
    "Por entregar",
    "Entregado y pendiente por defender",
    "Diferido",
    "Aprobado",
    "Rechazado",
    "Aprobado con solicitud de correcciones",
];

/// Proposal status a proposal must currently hold to become a thesis.
pub const PROMOTABLE_PROPOSAL_STATUS: &str = "Aprobada";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewProposal {
    pub code: String,
    pub submission_date: NaiveDate,
    pub title: String,
    pub student1: Option<String>,
    pub student2: Option<String>,
    pub academic_tutor: String,
    pub industry_tutor: Option<String>,
    pub term_id: TermId,
    /// First ledger event, appended with the proposal.
    pub status: StatusId,
}

impl NewProposal {
    pub(crate) fn into_record(self) -> (Proposal, StatusId) {
        let status = self.status;
        let proposal = Proposal {
            code: self.code,
            submission_date: self.submission_date,
            title: self.title,
            student1: self.student1,
            student2: self.student2,
            academic_tutor: self.academic_tutor,
            industry_tutor: self.industry_tutor,
            term_id: self.term_id,
        };
        (proposal, status)
    }
}

/// Edits through the standard update path. `None` leaves a field as is,
/// `Some(None)` clears an optional one; a `status` different from the
/// current one appends a ledger event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProposalChanges {
    pub title: Option<String>,
    pub submission_date: Option<NaiveDate>,
    pub student1: Option<Option<String>>,
    pub student2: Option<Option<String>>,
    pub academic_tutor: Option<String>,
    pub industry_tutor: Option<Option<String>>,
    pub term_id: Option<TermId>,
    pub status: Option<StatusId>,
}

impl ProposalChanges {
    pub fn status(status: StatusId) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub(crate) fn apply(&self, proposal: &mut Proposal) {
        if let Some(title) = &self.title {
            proposal.title = title.clone();
        }
        if let Some(date) = self.submission_date {
            proposal.submission_date = date;
        }
        if let Some(student) = &self.student1 {
            proposal.student1 = student.clone();
        }
        if let Some(student) = &self.student2 {
            proposal.student2 = student.clone();
        }
        if let Some(tutor) = &self.academic_tutor {
            proposal.academic_tutor = tutor.clone();
        }
        if let Some(tutor) = &self.industry_tutor {
            proposal.industry_tutor = tutor.clone();
        }
        if let Some(term) = self.term_id {
            proposal.term_id = term;
        }
    }

    /// People the edit assigns, cleared fields excluded.
    pub(crate) fn people(&self) -> impl Iterator<Item = &str> {
        [&self.student1, &self.student2, &self.industry_tutor]
            .into_iter()
            .flatten()
            .flatten()
            .chain(&self.academic_tutor)
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewThesis {
    pub proposal_code: String,
    /// Falls back to the proposal's title.
    pub title: Option<String>,
    pub delivery_term_id: TermId,
    pub nrc: String,
    pub description: String,
    pub thematic_category: String,
    pub submission_date: NaiveDate,
    pub company_name: Option<String>,
    pub status: StatusId,
}

impl NewThesis {
    pub(crate) fn into_record(self, proposal: &Proposal) -> (Thesis, StatusId) {
        let status = self.status;
        let thesis = Thesis {
            code: crate::codes::thesis_code(&proposal.code),
            proposal_code: proposal.code.clone(),
            title: self.title.unwrap_or_else(|| proposal.title.clone()),
            delivery_term_id: self.delivery_term_id,
            nrc: self.nrc,
            description: self.description,
            thematic_category: self.thematic_category,
            submission_date: self.submission_date,
            company_name: self.company_name,
        };
        (thesis, status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThesisChanges {
    pub title: Option<String>,
    pub delivery_term_id: Option<TermId>,
    pub nrc: Option<String>,
    pub description: Option<String>,
    pub thematic_category: Option<String>,
    pub submission_date: Option<NaiveDate>,
    pub company_name: Option<Option<String>>,
    pub status: Option<StatusId>,
}

impl ThesisChanges {
    pub fn status(status: StatusId) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub(crate) fn apply(&self, thesis: &mut Thesis) {
        if let Some(title) = &self.title {
            thesis.title = title.clone();
        }
        if let Some(term) = self.delivery_term_id {
            thesis.delivery_term_id = term;
        }
        if let Some(nrc) = &self.nrc {
            thesis.nrc = nrc.clone();
        }
        if let Some(description) = &self.description {
            thesis.description = description.clone();
        }
        if let Some(category) = &self.thematic_category {
            thesis.thematic_category = category.clone();
        }
        if let Some(date) = self.submission_date {
            thesis.submission_date = date;
        }
        if let Some(company) = &self.company_name {
            thesis.company_name = company.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewDefence {
    pub thesis_code: String,
    pub scheduled_at: DateTime<Utc>,
    pub observations: String,
    /// Initial jury, checked against an empty panel.
    pub jurors: Vec<JurorDraft>,
}

impl NewDefence {
    pub(crate) fn to_record(&self) -> Defence {
        Defence {
            code: crate::codes::defence_code(&self.thesis_code),
            thesis_code: self.thesis_code.clone(),
            scheduled_at: self.scheduled_at,
            grade: None,
            is_publication_mention: false,
            is_honorific_mention: false,
            corrections_submission_date: None,
            was_grade_loaded: false,
            observations: self.observations.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Grading {
    pub grade: i16,
    pub is_publication_mention: bool,
    pub is_honorific_mention: bool,
    pub corrections_submission_date: Option<NaiveDate>,
}

impl Grading {
    /// Grading is terminal and grades are non-negative.
    pub(crate) fn apply(&self, defence: &mut Defence) -> Result<()> {
        if defence.was_grade_loaded {
            return Err(RegistryError::AlreadyGraded(defence.code.clone()));
        }
        if self.grade < 0 {
            return Err(RegistryError::InvalidGrade(self.grade));
        }
        defence.grade = Some(self.grade);
        defence.is_publication_mention = self.is_publication_mention;
        defence.is_honorific_mention = self.is_honorific_mention;
        defence.corrections_submission_date = self.corrections_submission_date;
        defence.was_grade_loaded = true;
        Ok(())
    }
}

/// Checks that `proposal` may become a thesis. `existing_thesis` is the code
/// of a thesis already built from it, if any.
pub fn ensure_promotable(
    proposal: &WithStatus<Proposal>,
    existing_thesis: Option<&str>,
) -> Result<()> {
    let code = &proposal.record.code;
    if let Some(thesis) = existing_thesis {
        return Err(RegistryError::AlreadyPromoted {
            proposal: code.clone(),
            thesis: thesis.to_string(),
        });
    }
    let current = proposal.require_status(|| LedgerSubject::Proposal(code.clone()))?;
    if current.status_name != PROMOTABLE_PROPOSAL_STATUS {
        return Err(RegistryError::NotPromotable {
            proposal: code.clone(),
            status: current.status_name.clone(),
        });
    }
    Ok(())
}

pub fn default_statuses(kind: StatusKind) -> &'static [&'static str] {
    match kind {
        StatusKind::Proposal => DEFAULT_PROPOSAL_STATUSES,
        StatusKind::Thesis => DEFAULT_THESIS_STATUSES,
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    fn jury_policy(&self) -> JuryPolicy;

    /// Inserts the default person types and status catalogs, keeping rows
    /// that already exist.
    async fn seed_defaults(&self) -> Result<()>;

    async fn create_person_type(&self, name: &str) -> Result<PersonType>;
    async fn person_types(&self) -> Result<Vec<PersonType>>;
    async fn create_person(&self, person: Person) -> Result<Person>;
    async fn get_person(&self, id_card_number: &str) -> Result<Person>;
    async fn search_persons(&self, spec: &SearchSpec, page: PageRequest) -> Result<Page<Person>>;

    async fn create_term(&self, period: i32) -> Result<Term>;
    async fn term_by_period(&self, period: i32) -> Result<Term>;

    async fn create_status(
        &self,
        kind: StatusKind,
        name: &str,
        description: Option<&str>,
    ) -> Result<Status>;
    async fn list_statuses(&self, kind: StatusKind) -> Result<Vec<Status>>;
    async fn status_by_name(&self, kind: StatusKind, name: &str) -> Result<Status>;

    /// Persists the proposal and its first ledger event atomically.
    async fn create_proposal(&self, proposal: NewProposal) -> Result<WithStatus<Proposal>>;
    async fn update_proposal(
        &self,
        code: &str,
        changes: ProposalChanges,
    ) -> Result<WithStatus<Proposal>>;
    async fn get_proposal(&self, code: &str) -> Result<WithStatus<Proposal>>;
    async fn search_proposals(
        &self,
        spec: &SearchSpec,
        page: PageRequest,
    ) -> Result<Page<WithStatus<Proposal>>>;

    async fn record_status_at(
        &self,
        subject: &LedgerSubject,
        status: StatusId,
        occurred_at: DateTime<Utc>,
    ) -> Result<Uuid>;

    async fn record_status(&self, subject: &LedgerSubject, status: StatusId) -> Result<Uuid> {
        self.record_status_at(subject, status, Utc::now()).await
    }

    /// `Ok(None)` when the subject exists but has no events.
    async fn current_status(&self, subject: &LedgerSubject) -> Result<Option<StatusEvent>>;
    /// Every event of the subject, oldest insertion first.
    async fn status_history(&self, subject: &LedgerSubject) -> Result<Vec<StatusEvent>>;

    async fn promote_proposal(&self, thesis: NewThesis) -> Result<WithStatus<Thesis>>;
    async fn update_thesis(&self, code: &str, changes: ThesisChanges)
        -> Result<WithStatus<Thesis>>;
    async fn get_thesis(&self, code: &str) -> Result<WithStatus<Thesis>>;
    async fn search_theses(
        &self,
        spec: &SearchSpec,
        page: PageRequest,
    ) -> Result<Page<WithStatus<Thesis>>>;

    async fn create_defence(&self, defence: NewDefence) -> Result<Defence>;
    async fn get_defence(&self, code: &str) -> Result<Defence>;
    async fn search_defences(&self, spec: &SearchSpec, page: PageRequest) -> Result<Page<Defence>>;

    /// One new assignment per person, duplicates included, or
    /// `CapacityExceeded` if the panel would outgrow the jury policy.
    async fn add_jurors(
        &self,
        defence_code: &str,
        person_ids: &[String],
        is_backup: bool,
    ) -> Result<Vec<Uuid>>;
    async fn jury(&self, defence_code: &str) -> Result<Vec<JuryAssignment>>;
    async fn confirm_assistance(&self, assignment: Uuid) -> Result<JuryAssignment>;
    async fn grade_defence(&self, code: &str, grading: Grading) -> Result<Defence>;

    async fn term_overview(&self, period: i32) -> Result<TermOverview>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn proposal(status: Option<&str>) -> WithStatus<Proposal> {
        WithStatus {
            record: Proposal {
                code: "P1".to_string(),
                submission_date: NaiveDate::from_ymd_opt(2019, 10, 1).unwrap(),
                title: "Sistema de gestión de trabajos de grado".to_string(),
                student1: None,
                student2: None,
                academic_tutor: "V-1".to_string(),
                industry_tutor: None,
                term_id: 1,
            },
            current_status: status.map(|name| StatusEvent {
                id: Uuid::new_v4(),
                subject: LedgerSubject::Proposal("P1".to_string()),
                status_id: 3,
                status_name: name.to_string(),
                occurred_at: Utc.with_ymd_and_hms(2019, 11, 1, 9, 0, 0).unwrap(),
                seq: 2,
            }),
        }
    }

    #[test]
    fn approved_proposal_is_promotable() {
        assert!(ensure_promotable(&proposal(Some("Aprobada")), None).is_ok());
    }

    #[test]
    fn pending_proposal_is_not_promotable() {
        let err = ensure_promotable(&proposal(Some("Por evaluar")), None).unwrap_err();
        assert!(matches!(err, RegistryError::NotPromotable { .. }));
    }

    #[test]
    fn promotion_happens_once() {
        let err = ensure_promotable(&proposal(Some("Aprobada")), Some("TGP1")).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyPromoted { .. }));
    }

    #[test]
    fn proposal_without_history_is_reported() {
        let err = ensure_promotable(&proposal(None), None).unwrap_err();
        assert!(matches!(err, RegistryError::NoCurrentStatus(_)));
    }

    #[test]
    fn thesis_title_defaults_to_proposal_title() {
        let source = proposal(Some("Aprobada")).record;
        let draft = NewThesis {
            proposal_code: "P1".to_string(),
            title: None,
            delivery_term_id: 2,
            nrc: "12345".to_string(),
            description: "Descripción".to_string(),
            thematic_category: "Sistemas".to_string(),
            submission_date: NaiveDate::from_ymd_opt(2020, 2, 1).unwrap(),
            company_name: None,
            status: 1,
        };
        let (thesis, status) = draft.clone().into_record(&source);
        assert_eq!(thesis.code, "TGP1");
        assert_eq!(thesis.title, source.title);
        assert_eq!(status, 1);

        let titled = NewThesis {
            title: Some("Otro título".to_string()),
            ..draft
        };
        assert_eq!(titled.into_record(&source).0.title, "Otro título");
    }

    #[test]
    fn grading_is_terminal() {
        let mut defence = NewDefence {
            thesis_code: "TGP1".to_string(),
            scheduled_at: Utc.with_ymd_and_hms(2020, 3, 10, 14, 0, 0).unwrap(),
            observations: String::new(),
            jurors: Vec::new(),
        }
        .to_record();
        assert_eq!(defence.code, "DFTGP1");

        let grading = Grading {
            grade: 19,
            is_publication_mention: true,
            is_honorific_mention: false,
            corrections_submission_date: None,
        };
        grading.apply(&mut defence).unwrap();
        assert_eq!(defence.grade, Some(19));
        assert!(defence.was_grade_loaded);
        assert!(matches!(
            grading.apply(&mut defence),
            Err(RegistryError::AlreadyGraded(_))
        ));
    }

    #[test]
    fn negative_grades_are_rejected() {
        let mut defence = NewDefence {
            thesis_code: "TGP2".to_string(),
            scheduled_at: Utc.with_ymd_and_hms(2020, 3, 10, 14, 0, 0).unwrap(),
            observations: String::new(),
            jurors: Vec::new(),
        }
        .to_record();
        let grading = Grading {
            grade: -1,
            is_publication_mention: false,
            is_honorific_mention: false,
            corrections_submission_date: None,
        };
        assert!(matches!(
            grading.apply(&mut defence),
            Err(RegistryError::InvalidGrade(-1))
        ));
        assert!(!defence.was_grade_loaded);
    }
}
