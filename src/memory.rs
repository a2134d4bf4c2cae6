//! In-process registry with the same semantics as the Postgres store.
//!
//! All state sits behind one lock, held for the whole of each operation, so
//! every call is atomic and jury additions are serialised per store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::jury::JuryPolicy;
use crate::ledger::{self, LedgerSubject, StatusEvent};
use crate::models::{
    Defence, DefenceSummary, JuryAssignment, Person, PersonType, Proposal, Status, StatusId,
    StatusKind, Term, TermId, TermOverview, Thesis, WithStatus,
};
use crate::registry::{
    self, ensure_promotable, Grading, NewDefence, NewProposal, NewThesis, ProposalChanges,
    Registry, ThesisChanges, DEFAULT_PERSON_TYPES,
};
use crate::search::{Page, PageRequest, SearchSpec};

#[derive(Default)]
struct State {
    person_types: Vec<PersonType>,
    persons: BTreeMap<String, Person>,
    terms: Vec<Term>,
    statuses: Vec<Status>,
    proposals: BTreeMap<String, Proposal>,
    theses: BTreeMap<String, Thesis>,
    defences: BTreeMap<String, Defence>,
    jury: Vec<JuryAssignment>,
    events: Vec<StatusEvent>,
    last_id: i32,
    last_seq: i64,
}

impl State {
    fn next_id(&mut self) -> i32 {
        self.last_id += 1;
        self.last_id
    }

    fn status(&self, kind: StatusKind, id: StatusId) -> Result<&Status> {
        self.statuses
            .iter()
            .find(|status| status.kind == kind && status.id == id)
            .ok_or_else(|| RegistryError::not_found("status", format!("{kind} #{id}")))
    }

    fn ensure_person(&self, id_card_number: &str) -> Result<()> {
        if self.persons.contains_key(id_card_number) {
            Ok(())
        } else {
            Err(RegistryError::not_found("person", id_card_number))
        }
    }

    fn ensure_term(&self, id: TermId) -> Result<()> {
        if self.terms.iter().any(|term| term.id == id) {
            Ok(())
        } else {
            Err(RegistryError::not_found("term", format!("#{id}")))
        }
    }

    fn ensure_subject(&self, subject: &LedgerSubject) -> Result<()> {
        let exists = match subject {
            LedgerSubject::Proposal(code) => self.proposals.contains_key(code),
            LedgerSubject::Thesis(code) => self.theses.contains_key(code),
        };
        if exists {
            Ok(())
        } else {
            Err(RegistryError::not_found(subject.entity(), subject.code()))
        }
    }

    fn history<'a>(&'a self, subject: &'a LedgerSubject) -> impl Iterator<Item = &'a StatusEvent> {
        self.events.iter().filter(move |event| &event.subject == subject)
    }

    fn current(&self, subject: &LedgerSubject) -> Option<StatusEvent> {
        ledger::latest(self.history(subject)).cloned()
    }

    fn append(
        &mut self,
        subject: LedgerSubject,
        status: StatusId,
        occurred_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let status_name = self.status(subject.kind(), status)?.name.clone();
        self.last_seq += 1;
        let event = StatusEvent {
            id: Uuid::new_v4(),
            subject,
            status_id: status,
            status_name,
            occurred_at,
            seq: self.last_seq,
        };
        let id = event.id;
        info!(subject = %event.subject, status = %event.status_name, "status recorded");
        self.events.push(event);
        Ok(id)
    }

    fn proposal(&self, code: &str) -> Result<WithStatus<Proposal>> {
        let record = self
            .proposals
            .get(code)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("proposal", code))?;
        let current_status = self.current(&LedgerSubject::Proposal(code.to_string()));
        Ok(WithStatus {
            record,
            current_status,
        })
    }

    fn thesis(&self, code: &str) -> Result<WithStatus<Thesis>> {
        let record = self
            .theses
            .get(code)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("thesis", code))?;
        let current_status = self.current(&LedgerSubject::Thesis(code.to_string()));
        Ok(WithStatus {
            record,
            current_status,
        })
    }

    fn jury_of<'a>(&'a self, defence_code: &'a str) -> impl Iterator<Item = &'a JuryAssignment> {
        self.jury
            .iter()
            .filter(move |assignment| assignment.defence_code == defence_code)
    }

    fn seat(&mut self, defence_code: &str, person_id: &str, is_backup: bool) -> Uuid {
        let assignment = JuryAssignment {
            id: Uuid::new_v4(),
            person_id: person_id.to_string(),
            defence_code: defence_code.to_string(),
            is_backup,
            confirmed_assistance: false,
        };
        let id = assignment.id;
        self.jury.push(assignment);
        id
    }

    fn insert_status(&mut self, kind: StatusKind, name: &str, description: Option<&str>) -> Status {
        let status = Status {
            id: self.next_id(),
            kind,
            name: name.to_string(),
            description: description.map(str::to_string),
        };
        self.statuses.push(status.clone());
        status
    }
}

pub struct MemoryRegistry {
    policy: JuryPolicy,
    state: Mutex<State>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(JuryPolicy::default())
    }
}

impl MemoryRegistry {
    pub fn new(policy: JuryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn jury_policy(&self) -> JuryPolicy {
        self.policy
    }

    async fn seed_defaults(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for name in DEFAULT_PERSON_TYPES {
            if !state.person_types.iter().any(|kind| kind.name == *name) {
                let id = state.next_id();
                state.person_types.push(PersonType {
                    id,
                    name: (*name).to_string(),
                });
            }
        }
        for kind in [StatusKind::Proposal, StatusKind::Thesis] {
            for name in registry::default_statuses(kind) {
                let exists = state
                    .statuses
                    .iter()
                    .any(|status| status.kind == kind && status.name == *name);
                if !exists {
                    state.insert_status(kind, name, None);
                }
            }
        }
        Ok(())
    }

    async fn create_person_type(&self, name: &str) -> Result<PersonType> {
        let mut state = self.state.lock().await;
        if state.person_types.iter().any(|kind| kind.name == name) {
            return Err(RegistryError::duplicate("person type", name));
        }
        let person_type = PersonType {
            id: state.next_id(),
            name: name.to_string(),
        };
        state.person_types.push(person_type.clone());
        Ok(person_type)
    }

    async fn person_types(&self) -> Result<Vec<PersonType>> {
        Ok(self.state.lock().await.person_types.clone())
    }

    async fn create_person(&self, person: Person) -> Result<Person> {
        let mut state = self.state.lock().await;
        if !state.person_types.iter().any(|kind| kind.id == person.type_id) {
            return Err(RegistryError::not_found(
                "person type",
                format!("#{}", person.type_id),
            ));
        }
        if state.persons.contains_key(&person.id_card_number) {
            return Err(RegistryError::duplicate("person", &person.id_card_number));
        }
        if let Some(email) = &person.institutional_email {
            let taken = state
                .persons
                .values()
                .any(|other| other.institutional_email.as_deref() == Some(email.as_str()));
            if taken {
                return Err(RegistryError::duplicate("institutional email", email));
            }
        }
        state
            .persons
            .insert(person.id_card_number.clone(), person.clone());
        Ok(person)
    }

    async fn get_person(&self, id_card_number: &str) -> Result<Person> {
        self.state
            .lock()
            .await
            .persons
            .get(id_card_number)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("person", id_card_number))
    }

    async fn search_persons(&self, spec: &SearchSpec, page: PageRequest) -> Result<Page<Person>> {
        let state = self.state.lock().await;
        let rows = state
            .persons
            .values()
            .filter(|person| spec.matches(*person))
            .cloned()
            .collect();
        Ok(Page::paginate(rows, page))
    }

    async fn create_term(&self, period: i32) -> Result<Term> {
        let mut state = self.state.lock().await;
        if state.terms.iter().any(|term| term.period == period) {
            return Err(RegistryError::duplicate("term", period));
        }
        let term = Term {
            id: state.next_id(),
            period,
        };
        state.terms.push(term.clone());
        Ok(term)
    }

    async fn term_by_period(&self, period: i32) -> Result<Term> {
        self.state
            .lock()
            .await
            .terms
            .iter()
            .find(|term| term.period == period)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("term", period))
    }

    async fn create_status(
        &self,
        kind: StatusKind,
        name: &str,
        description: Option<&str>,
    ) -> Result<Status> {
        let mut state = self.state.lock().await;
        let exists = state
            .statuses
            .iter()
            .any(|status| status.kind == kind && status.name == name);
        if exists {
            return Err(RegistryError::duplicate("status", format!("{kind} {name}")));
        }
        Ok(state.insert_status(kind, name, description))
    }

    async fn list_statuses(&self, kind: StatusKind) -> Result<Vec<Status>> {
        let state = self.state.lock().await;
        Ok(state
            .statuses
            .iter()
            .filter(|status| status.kind == kind)
            .cloned()
            .collect())
    }

    async fn status_by_name(&self, kind: StatusKind, name: &str) -> Result<Status> {
        let state = self.state.lock().await;
        state
            .statuses
            .iter()
            .find(|status| status.kind == kind && status.name == name)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("status", format!("{kind} {name}")))
    }

    async fn create_proposal(&self, proposal: NewProposal) -> Result<WithStatus<Proposal>> {
        let mut state = self.state.lock().await;
        let (record, status) = proposal.into_record();
        if state.proposals.contains_key(&record.code) {
            return Err(RegistryError::duplicate("proposal", &record.code));
        }
        state.ensure_term(record.term_id)?;
        for person in [&record.student1, &record.student2, &record.industry_tutor]
            .into_iter()
            .flatten()
            .chain(std::iter::once(&record.academic_tutor))
        {
            state.ensure_person(person)?;
        }
        state.status(StatusKind::Proposal, status)?;

        let code = record.code.clone();
        state.proposals.insert(code.clone(), record);
        state.append(LedgerSubject::Proposal(code.clone()), status, Utc::now())?;
        state.proposal(&code)
    }

    async fn update_proposal(
        &self,
        code: &str,
        changes: ProposalChanges,
    ) -> Result<WithStatus<Proposal>> {
        let mut state = self.state.lock().await;
        let current = state.proposal(code)?;
        for person in changes.people() {
            state.ensure_person(person)?;
        }
        if let Some(term) = changes.term_id {
            state.ensure_term(term)?;
        }
        if let Some(status) = changes.status {
            state.status(StatusKind::Proposal, status)?;
        }

        let mut record = current.record;
        changes.apply(&mut record);
        state.proposals.insert(code.to_string(), record);
        if let Some(status) = changes.status {
            if ledger::needs_append(current.current_status.as_ref(), Some(status)) {
                state.append(LedgerSubject::Proposal(code.to_string()), status, Utc::now())?;
            }
        }
        state.proposal(code)
    }

    async fn get_proposal(&self, code: &str) -> Result<WithStatus<Proposal>> {
        self.state.lock().await.proposal(code)
    }

    async fn search_proposals(
        &self,
        spec: &SearchSpec,
        page: PageRequest,
    ) -> Result<Page<WithStatus<Proposal>>> {
        let state = self.state.lock().await;
        let rows = state
            .proposals
            .keys()
            .map(|code| state.proposal(code))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|row| spec.matches(row))
            .collect();
        Ok(Page::paginate(rows, page))
    }

    async fn record_status_at(
        &self,
        subject: &LedgerSubject,
        status: StatusId,
        occurred_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let mut state = self.state.lock().await;
        state.ensure_subject(subject)?;
        state.append(subject.clone(), status, occurred_at)
    }

    async fn current_status(&self, subject: &LedgerSubject) -> Result<Option<StatusEvent>> {
        let state = self.state.lock().await;
        state.ensure_subject(subject)?;
        Ok(state.current(subject))
    }

    async fn status_history(&self, subject: &LedgerSubject) -> Result<Vec<StatusEvent>> {
        let state = self.state.lock().await;
        state.ensure_subject(subject)?;
        Ok(state.history(subject).cloned().collect())
    }

    async fn promote_proposal(&self, thesis: NewThesis) -> Result<WithStatus<Thesis>> {
        let mut state = self.state.lock().await;
        let proposal = state.proposal(&thesis.proposal_code)?;
        let existing = state
            .theses
            .values()
            .find(|other| other.proposal_code == proposal.record.code)
            .map(|other| other.code.clone());
        ensure_promotable(&proposal, existing.as_deref())?;
        state.ensure_term(thesis.delivery_term_id)?;
        state.status(StatusKind::Thesis, thesis.status)?;

        let (record, status) = thesis.into_record(&proposal.record);
        let code = record.code.clone();
        if state.theses.contains_key(&code) {
            return Err(RegistryError::duplicate("thesis", &code));
        }
        state.theses.insert(code.clone(), record);
        state.append(LedgerSubject::Thesis(code.clone()), status, Utc::now())?;
        info!(proposal = %proposal.record.code, thesis = %code, "proposal promoted");
        state.thesis(&code)
    }

    async fn update_thesis(
        &self,
        code: &str,
        changes: ThesisChanges,
    ) -> Result<WithStatus<Thesis>> {
        let mut state = self.state.lock().await;
        let current = state.thesis(code)?;
        if let Some(term) = changes.delivery_term_id {
            state.ensure_term(term)?;
        }
        if let Some(status) = changes.status {
            state.status(StatusKind::Thesis, status)?;
        }

        let mut record = current.record;
        changes.apply(&mut record);
        state.theses.insert(code.to_string(), record);
        if let Some(status) = changes.status {
            if ledger::needs_append(current.current_status.as_ref(), Some(status)) {
                state.append(LedgerSubject::Thesis(code.to_string()), status, Utc::now())?;
            }
        }
        state.thesis(code)
    }

    async fn get_thesis(&self, code: &str) -> Result<WithStatus<Thesis>> {
        self.state.lock().await.thesis(code)
    }

    async fn search_theses(
        &self,
        spec: &SearchSpec,
        page: PageRequest,
    ) -> Result<Page<WithStatus<Thesis>>> {
        let state = self.state.lock().await;
        let rows = state
            .theses
            .keys()
            .map(|code| state.thesis(code))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|row| spec.matches(row))
            .collect();
        Ok(Page::paginate(rows, page))
    }

    async fn create_defence(&self, defence: NewDefence) -> Result<Defence> {
        let mut state = self.state.lock().await;
        if !state.theses.contains_key(&defence.thesis_code) {
            return Err(RegistryError::not_found("thesis", &defence.thesis_code));
        }
        let record = defence.to_record();
        if state.defences.contains_key(&record.code) {
            return Err(RegistryError::duplicate("defence", &record.code));
        }
        self.policy.check(&record.code, 0, defence.jurors.len())?;
        for juror in &defence.jurors {
            state.ensure_person(&juror.person_id)?;
        }

        state.defences.insert(record.code.clone(), record.clone());
        for juror in &defence.jurors {
            state.seat(&record.code, &juror.person_id, juror.is_backup);
        }
        info!(defence = %record.code, jurors = defence.jurors.len(), "defence created");
        Ok(record)
    }

    async fn get_defence(&self, code: &str) -> Result<Defence> {
        self.state
            .lock()
            .await
            .defences
            .get(code)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("defence", code))
    }

    async fn search_defences(&self, spec: &SearchSpec, page: PageRequest) -> Result<Page<Defence>> {
        let state = self.state.lock().await;
        let rows = state
            .defences
            .values()
            .filter(|defence| spec.matches(*defence))
            .cloned()
            .collect();
        Ok(Page::paginate(rows, page))
    }

    async fn add_jurors(
        &self,
        defence_code: &str,
        person_ids: &[String],
        is_backup: bool,
    ) -> Result<Vec<Uuid>> {
        let mut state = self.state.lock().await;
        if !state.defences.contains_key(defence_code) {
            return Err(RegistryError::not_found("defence", defence_code));
        }
        let existing = state.jury_of(defence_code).count();
        debug!(defence = defence_code, existing, proposed = person_ids.len(), "checking jury capacity");
        if let Err(err) = self.policy.check(defence_code, existing, person_ids.len()) {
            warn!(defence = defence_code, %err, "jury addition rejected");
            return Err(err);
        }
        for person in person_ids {
            state.ensure_person(person)?;
        }
        let ids = person_ids
            .iter()
            .map(|person| state.seat(defence_code, person, is_backup))
            .collect::<Vec<_>>();
        info!(defence = defence_code, added = ids.len(), is_backup, "jurors added");
        Ok(ids)
    }

    async fn jury(&self, defence_code: &str) -> Result<Vec<JuryAssignment>> {
        let state = self.state.lock().await;
        if !state.defences.contains_key(defence_code) {
            return Err(RegistryError::not_found("defence", defence_code));
        }
        Ok(state.jury_of(defence_code).cloned().collect())
    }

    async fn confirm_assistance(&self, assignment: Uuid) -> Result<JuryAssignment> {
        let mut state = self.state.lock().await;
        let row = state
            .jury
            .iter_mut()
            .find(|row| row.id == assignment)
            .ok_or_else(|| RegistryError::not_found("jury assignment", assignment))?;
        row.confirmed_assistance = true;
        Ok(row.clone())
    }

    async fn grade_defence(&self, code: &str, grading: Grading) -> Result<Defence> {
        let mut state = self.state.lock().await;
        let defence = state
            .defences
            .get_mut(code)
            .ok_or_else(|| RegistryError::not_found("defence", code))?;
        grading.apply(defence)?;
        info!(defence = code, grade = grading.grade, "defence graded");
        Ok(defence.clone())
    }

    async fn term_overview(&self, period: i32) -> Result<TermOverview> {
        let state = self.state.lock().await;
        let term = state
            .terms
            .iter()
            .find(|term| term.period == period)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("term", period))?;

        let proposals = state
            .proposals
            .values()
            .filter(|proposal| proposal.term_id == term.id)
            .map(|proposal| state.proposal(&proposal.code))
            .collect::<Result<Vec<_>>>()?;
        let theses = state
            .theses
            .values()
            .filter(|thesis| thesis.delivery_term_id == term.id)
            .map(|thesis| state.thesis(&thesis.code))
            .collect::<Result<Vec<_>>>()?;
        let defences = state
            .defences
            .values()
            .filter_map(|defence| {
                let thesis = theses
                    .iter()
                    .find(|thesis| thesis.record.code == defence.thesis_code)?;
                let (backup, principal): (Vec<_>, Vec<_>) = state
                    .jury_of(&defence.code)
                    .partition(|assignment| assignment.is_backup);
                Some(DefenceSummary {
                    defence: defence.clone(),
                    thesis_title: thesis.record.title.clone(),
                    principal_jurors: principal.len(),
                    backup_jurors: backup.len(),
                })
            })
            .collect();

        Ok(TermOverview {
            term,
            proposals,
            theses,
            defences,
        })
    }
}
