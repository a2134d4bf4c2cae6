//! Postgres registry.
//!
//! Every mutating call runs in one transaction. Status is always read from
//! the ledger tables; jury additions lock the defence row before counting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::jury::JuryPolicy;
use crate::ledger::{self, LedgerSubject, StatusEvent};
use crate::models::{
    Defence, DefenceSummary, JuryAssignment, Person, PersonType, Proposal, Status, StatusId,
    StatusKind, Term, TermOverview, Thesis, WithStatus,
};
use crate::registry::{
    self, ensure_promotable, Grading, NewDefence, NewProposal, NewThesis, ProposalChanges,
    Registry, ThesisChanges, DEFAULT_PERSON_TYPES,
};
use crate::search::{Page, PageRequest, PageWindow, SearchSpec};

pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const PERSON_COLUMNS: &str = "pe.id_card_number, pe.type_id, pe.name, pe.last_name, \
     pe.institutional_email, pe.email, pe.primary_phone, pe.secondary_phone, pe.observations";

const PROPOSAL_COLUMNS: &str = "p.code, p.submission_date, p.title, p.student1, p.student2, \
     p.academic_tutor, p.industry_tutor, p.term_id";

const THESIS_COLUMNS: &str = "t.code, t.proposal_code, t.title, t.delivery_term_id, t.nrc, \
     t.description, t.thematic_category, t.submission_date, t.company_name";

const DEFENCE_COLUMNS: &str = "d.code, d.thesis_code, d.scheduled_at, d.grade, \
     d.is_publication_mention, d.is_honorific_mention, d.corrections_submission_date, \
     d.was_grade_loaded, d.observations";

const JURY_COLUMNS: &str = "id, person_id, defence_code, is_backup, confirmed_assistance";

/// Table names of one ledger and the entities it tracks.
struct LedgerTables {
    statuses: &'static str,
    events: &'static str,
    subjects: &'static str,
    subject_column: &'static str,
}

fn ledger_tables(kind: StatusKind) -> LedgerTables {
    match kind {
        StatusKind::Proposal => LedgerTables {
            statuses: "proposal_statuses",
            events: "proposal_status_events",
            subjects: "proposals",
            subject_column: "proposal_code",
        },
        StatusKind::Thesis => LedgerTables {
            statuses: "thesis_statuses",
            events: "thesis_status_events",
            subjects: "theses",
            subject_column: "thesis_code",
        },
    }
}

/// `SELECT` of an entity joined with its latest ledger event, one row per
/// entity. `alias` must be the alias used in the entity's column list.
fn select_with_current(kind: StatusKind, columns: &str, alias: &str) -> String {
    let tables = ledger_tables(kind);
    format!(
        "SELECT {columns}, cur.event_id, cur.event_seq, cur.status_id, cur.status_name, cur.occurred_at \
         FROM thesis_registry.{subjects} {alias} \
         LEFT JOIN LATERAL ( \
             SELECT e.id AS event_id, e.seq AS event_seq, e.status_id, s.name AS status_name, e.occurred_at \
             FROM thesis_registry.{events} e \
             JOIN thesis_registry.{statuses} s ON s.id = e.status_id \
             WHERE e.{column} = {alias}.code \
             ORDER BY e.occurred_at DESC, e.seq DESC \
             LIMIT 1 \
         ) cur ON TRUE",
        subjects = tables.subjects,
        events = tables.events,
        statuses = tables.statuses,
        column = tables.subject_column,
    )
}

fn proposal_select() -> String {
    select_with_current(StatusKind::Proposal, PROPOSAL_COLUMNS, "p")
}

fn thesis_select() -> String {
    select_with_current(StatusKind::Thesis, THESIS_COLUMNS, "t")
}

fn person_from_row(row: &PgRow) -> sqlx::Result<Person> {
    Ok(Person {
        id_card_number: row.try_get("id_card_number")?,
        type_id: row.try_get("type_id")?,
        name: row.try_get("name")?,
        last_name: row.try_get("last_name")?,
        institutional_email: row.try_get("institutional_email")?,
        email: row.try_get("email")?,
        primary_phone: row.try_get("primary_phone")?,
        secondary_phone: row.try_get("secondary_phone")?,
        observations: row.try_get("observations")?,
    })
}

fn proposal_from_row(row: &PgRow) -> sqlx::Result<Proposal> {
    Ok(Proposal {
        code: row.try_get("code")?,
        submission_date: row.try_get("submission_date")?,
        title: row.try_get("title")?,
        student1: row.try_get("student1")?,
        student2: row.try_get("student2")?,
        academic_tutor: row.try_get("academic_tutor")?,
        industry_tutor: row.try_get("industry_tutor")?,
        term_id: row.try_get("term_id")?,
    })
}

fn thesis_from_row(row: &PgRow) -> sqlx::Result<Thesis> {
    Ok(Thesis {
        code: row.try_get("code")?,
        proposal_code: row.try_get("proposal_code")?,
        title: row.try_get("title")?,
        delivery_term_id: row.try_get("delivery_term_id")?,
        nrc: row.try_get("nrc")?,
        description: row.try_get("description")?,
        thematic_category: row.try_get("thematic_category")?,
        submission_date: row.try_get("submission_date")?,
        company_name: row.try_get("company_name")?,
    })
}

fn defence_from_row(row: &PgRow) -> sqlx::Result<Defence> {
    Ok(Defence {
        code: row.try_get("code")?,
        thesis_code: row.try_get("thesis_code")?,
        scheduled_at: row.try_get("scheduled_at")?,
        grade: row.try_get("grade")?,
        is_publication_mention: row.try_get("is_publication_mention")?,
        is_honorific_mention: row.try_get("is_honorific_mention")?,
        corrections_submission_date: row.try_get("corrections_submission_date")?,
        was_grade_loaded: row.try_get("was_grade_loaded")?,
        observations: row.try_get("observations")?,
    })
}

fn jury_from_row(row: &PgRow) -> sqlx::Result<JuryAssignment> {
    Ok(JuryAssignment {
        id: row.try_get("id")?,
        person_id: row.try_get("person_id")?,
        defence_code: row.try_get("defence_code")?,
        is_backup: row.try_get("is_backup")?,
        confirmed_assistance: row.try_get("confirmed_assistance")?,
    })
}

fn status_from_row(row: &PgRow, kind: StatusKind) -> sqlx::Result<Status> {
    Ok(Status {
        id: row.try_get("id")?,
        kind,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
    })
}

/// Reads the ledger columns of a row; all of them are NULL for an entity
/// without events.
fn event_from_row(row: &PgRow, subject: LedgerSubject) -> sqlx::Result<Option<StatusEvent>> {
    let id: Option<Uuid> = row.try_get("event_id")?;
    let Some(id) = id else {
        return Ok(None);
    };
    Ok(Some(StatusEvent {
        id,
        subject,
        status_id: row.try_get("status_id")?,
        status_name: row.try_get("status_name")?,
        occurred_at: row.try_get("occurred_at")?,
        seq: row.try_get("event_seq")?,
    }))
}

fn proposal_with_status(row: &PgRow) -> sqlx::Result<WithStatus<Proposal>> {
    let record = proposal_from_row(row)?;
    let current_status = event_from_row(row, LedgerSubject::Proposal(record.code.clone()))?;
    Ok(WithStatus {
        record,
        current_status,
    })
}

fn thesis_with_status(row: &PgRow) -> sqlx::Result<WithStatus<Thesis>> {
    let record = thesis_from_row(row)?;
    let current_status = event_from_row(row, LedgerSubject::Thesis(record.code.clone()))?;
    Ok(WithStatus {
        record,
        current_status,
    })
}

async fn ensure_key(
    conn: &mut PgConnection,
    table: &str,
    column: &str,
    key: &str,
    entity: &'static str,
) -> Result<()> {
    let sql = format!("SELECT 1 FROM thesis_registry.{table} WHERE {column} = $1");
    let found = sqlx::query(&sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(RegistryError::not_found(entity, key)),
    }
}

async fn ensure_id(conn: &mut PgConnection, table: &str, id: i32, entity: &'static str) -> Result<()> {
    let sql = format!("SELECT 1 FROM thesis_registry.{table} WHERE id = $1");
    let found = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    match found {
        Some(_) => Ok(()),
        None => Err(RegistryError::not_found(entity, format!("#{id}"))),
    }
}

async fn ensure_person(conn: &mut PgConnection, id_card_number: &str) -> Result<()> {
    ensure_key(conn, "persons", "id_card_number", id_card_number, "person").await
}

async fn ensure_subject(conn: &mut PgConnection, subject: &LedgerSubject) -> Result<()> {
    let tables = ledger_tables(subject.kind());
    ensure_key(conn, tables.subjects, "code", subject.code(), subject.entity()).await
}

async fn ensure_status(conn: &mut PgConnection, kind: StatusKind, status: StatusId) -> Result<()> {
    let sql = format!(
        "SELECT 1 FROM thesis_registry.{} WHERE id = $1",
        ledger_tables(kind).statuses
    );
    let found = sqlx::query(&sql).bind(status).fetch_optional(&mut *conn).await?;
    match found {
        Some(_) => Ok(()),
        None => Err(RegistryError::not_found("status", format!("{kind} #{status}"))),
    }
}

async fn append_event(
    conn: &mut PgConnection,
    subject: &LedgerSubject,
    status: StatusId,
    occurred_at: DateTime<Utc>,
) -> Result<Uuid> {
    ensure_status(conn, subject.kind(), status).await?;
    let tables = ledger_tables(subject.kind());
    let sql = format!(
        "INSERT INTO thesis_registry.{} (id, {}, status_id, occurred_at) VALUES ($1, $2, $3, $4)",
        tables.events, tables.subject_column
    );
    let id = Uuid::new_v4();
    sqlx::query(&sql)
        .bind(id)
        .bind(subject.code())
        .bind(status)
        .bind(occurred_at)
        .execute(&mut *conn)
        .await?;
    info!(subject = %subject, status, "status recorded");
    Ok(id)
}

fn ledger_select(subject: &LedgerSubject) -> String {
    let tables = ledger_tables(subject.kind());
    format!(
        "SELECT e.id AS event_id, e.seq AS event_seq, e.status_id, s.name AS status_name, e.occurred_at \
         FROM thesis_registry.{events} e \
         JOIN thesis_registry.{statuses} s ON s.id = e.status_id \
         WHERE e.{column} = $1",
        events = tables.events,
        statuses = tables.statuses,
        column = tables.subject_column,
    )
}

async fn fetch_current(conn: &mut PgConnection, subject: &LedgerSubject) -> Result<Option<StatusEvent>> {
    let sql = format!(
        "{} ORDER BY e.occurred_at DESC, e.seq DESC LIMIT 1",
        ledger_select(subject)
    );
    let row = sqlx::query(&sql)
        .bind(subject.code())
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(event_from_row(&row, subject.clone())?),
        None => Ok(None),
    }
}

async fn fetch_proposal(conn: &mut PgConnection, code: &str) -> Result<WithStatus<Proposal>> {
    let sql = format!("{} WHERE p.code = $1", proposal_select());
    let row = sqlx::query(&sql)
        .bind(code)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| RegistryError::not_found("proposal", code))?;
    Ok(proposal_with_status(&row)?)
}

async fn fetch_thesis(conn: &mut PgConnection, code: &str) -> Result<WithStatus<Thesis>> {
    let sql = format!("{} WHERE t.code = $1", thesis_select());
    let row = sqlx::query(&sql)
        .bind(code)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| RegistryError::not_found("thesis", code))?;
    Ok(thesis_with_status(&row)?)
}

async fn fetch_defence(conn: &mut PgConnection, code: &str, for_update: bool) -> Result<Defence> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!("SELECT {DEFENCE_COLUMNS} FROM thesis_registry.defences d WHERE d.code = $1{lock}");
    let row = sqlx::query(&sql)
        .bind(code)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| RegistryError::not_found("defence", code))?;
    Ok(defence_from_row(&row)?)
}

async fn lock_row(conn: &mut PgConnection, table: &str, code: &str, entity: &'static str) -> Result<()> {
    let sql = format!("SELECT code FROM thesis_registry.{table} WHERE code = $1 FOR UPDATE");
    let row = sqlx::query(&sql).bind(code).fetch_optional(&mut *conn).await?;
    match row {
        Some(_) => Ok(()),
        None => Err(RegistryError::not_found(entity, code)),
    }
}

async fn insert_juror(
    conn: &mut PgConnection,
    defence_code: &str,
    person_id: &str,
    is_backup: bool,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO thesis_registry.jury_assignments (id, person_id, defence_code, is_backup)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(id)
    .bind(person_id)
    .bind(defence_code)
    .bind(is_backup)
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

/// Counts rows of `base` (which must end in a FROM clause) matching `spec`.
async fn count_matching(conn: &mut PgConnection, base: &str, spec: &SearchSpec) -> Result<usize> {
    let mut builder = QueryBuilder::<Postgres>::new(base);
    builder.push(" WHERE TRUE");
    spec.push_filter(&mut builder);
    let total = builder.build_query_scalar::<i64>().fetch_one(&mut *conn).await?;
    Ok(total.max(0) as usize)
}

const PERSON_EMAIL_CONSTRAINT: &str = "persons_institutional_email_key";

/// Names the clashing value of a rejected person insert.
fn person_conflict(constraint: Option<&str>, person: &Person) -> (&'static str, String) {
    match (constraint, &person.institutional_email) {
        (Some(PERSON_EMAIL_CONSTRAINT), Some(email)) => ("institutional email", email.clone()),
        _ => ("person", person.id_card_number.clone()),
    }
}

/// `LIMIT`/`OFFSET` values, saturating at `i64::MAX`.
fn sql_window(window: &PageWindow) -> (i64, i64) {
    (
        i64::try_from(window.length).unwrap_or(i64::MAX),
        i64::try_from(window.offset).unwrap_or(i64::MAX),
    )
}

/// Runs `select` filtered by `spec`, ordered by `order_by`, for one page.
async fn fetch_page<T>(
    conn: &mut PgConnection,
    count_base: &str,
    select: String,
    order_by: &str,
    spec: &SearchSpec,
    page: PageRequest,
    map: fn(&PgRow) -> sqlx::Result<T>,
) -> Result<Page<T>> {
    let total = count_matching(conn, count_base, spec).await?;
    let window = page.resolve(total);
    debug!(total, page = window.number, terms = spec.terms().len(), "listing page");

    let (limit, offset) = sql_window(&window);
    let mut builder = QueryBuilder::<Postgres>::new(select);
    builder.push(" WHERE TRUE");
    spec.push_filter(&mut builder);
    builder
        .push(" ORDER BY ")
        .push(order_by)
        .push(" LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let rows = builder.build().fetch_all(&mut *conn).await?;
    let items = rows.iter().map(map).collect::<sqlx::Result<Vec<_>>>()?;
    Ok(Page::from_window(items, window, total))
}

pub struct PgRegistry {
    pool: PgPool,
    policy: JuryPolicy,
}

impl PgRegistry {
    pub fn new(pool: PgPool, policy: JuryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Registry for PgRegistry {
    fn jury_policy(&self) -> JuryPolicy {
        self.policy
    }

    async fn seed_defaults(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for name in DEFAULT_PERSON_TYPES {
            sqlx::query(
                "INSERT INTO thesis_registry.person_types (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
            )
            .bind(*name)
            .execute(&mut *tx)
            .await?;
        }
        for kind in [StatusKind::Proposal, StatusKind::Thesis] {
            let sql = format!(
                "INSERT INTO thesis_registry.{} (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
                ledger_tables(kind).statuses
            );
            for name in registry::default_statuses(kind) {
                sqlx::query(&sql).bind(*name).execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_person_type(&self, name: &str) -> Result<PersonType> {
        let id: i32 = sqlx::query_scalar(
            "INSERT INTO thesis_registry.person_types (name) VALUES ($1) RETURNING id",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| RegistryError::from_insert(err, "person type", name))?;
        Ok(PersonType {
            id,
            name: name.to_string(),
        })
    }

    async fn person_types(&self) -> Result<Vec<PersonType>> {
        let rows = sqlx::query("SELECT id, name FROM thesis_registry.person_types ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut types = Vec::with_capacity(rows.len());
        for row in rows {
            types.push(PersonType {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(types)
    }

    async fn create_person(&self, person: Person) -> Result<Person> {
        let mut tx = self.pool.begin().await?;
        ensure_id(&mut tx, "person_types", person.type_id, "person type").await?;
        sqlx::query(
            r#"
            INSERT INTO thesis_registry.persons
            (id_card_number, type_id, name, last_name, institutional_email, email,
             primary_phone, secondary_phone, observations)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&person.id_card_number)
        .bind(person.type_id)
        .bind(&person.name)
        .bind(&person.last_name)
        .bind(&person.institutional_email)
        .bind(&person.email)
        .bind(&person.primary_phone)
        .bind(&person.secondary_phone)
        .bind(&person.observations)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            let constraint = err
                .as_database_error()
                .and_then(|db| db.constraint())
                .map(str::to_string);
            let (entity, key) = person_conflict(constraint.as_deref(), &person);
            RegistryError::from_insert(err, entity, key)
        })?;
        tx.commit().await?;
        Ok(person)
    }

    async fn get_person(&self, id_card_number: &str) -> Result<Person> {
        let sql =
            format!("SELECT {PERSON_COLUMNS} FROM thesis_registry.persons pe WHERE pe.id_card_number = $1");
        let row = sqlx::query(&sql)
            .bind(id_card_number)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RegistryError::not_found("person", id_card_number))?;
        Ok(person_from_row(&row)?)
    }

    async fn search_persons(&self, spec: &SearchSpec, page: PageRequest) -> Result<Page<Person>> {
        let mut conn = self.pool.acquire().await?;
        fetch_page(
            &mut conn,
            "SELECT COUNT(*) FROM thesis_registry.persons pe",
            format!("SELECT {PERSON_COLUMNS} FROM thesis_registry.persons pe"),
            "pe.id_card_number",
            spec,
            page,
            person_from_row,
        )
        .await
    }

    async fn create_term(&self, period: i32) -> Result<Term> {
        let id: i32 =
            sqlx::query_scalar("INSERT INTO thesis_registry.terms (period) VALUES ($1) RETURNING id")
                .bind(period)
                .fetch_one(&self.pool)
                .await
                .map_err(|err| RegistryError::from_insert(err, "term", period))?;
        Ok(Term { id, period })
    }

    async fn term_by_period(&self, period: i32) -> Result<Term> {
        let id: Option<i32> =
            sqlx::query_scalar("SELECT id FROM thesis_registry.terms WHERE period = $1")
                .bind(period)
                .fetch_optional(&self.pool)
                .await?;
        id.map(|id| Term { id, period })
            .ok_or_else(|| RegistryError::not_found("term", period))
    }

    async fn create_status(
        &self,
        kind: StatusKind,
        name: &str,
        description: Option<&str>,
    ) -> Result<Status> {
        let sql = format!(
            "INSERT INTO thesis_registry.{} (name, description) VALUES ($1, $2) RETURNING id",
            ledger_tables(kind).statuses
        );
        let id: i32 = sqlx::query_scalar(&sql)
            .bind(name)
            .bind(description)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| RegistryError::from_insert(err, "status", format!("{kind} {name}")))?;
        Ok(Status {
            id,
            kind,
            name: name.to_string(),
            description: description.map(str::to_string),
        })
    }

    async fn list_statuses(&self, kind: StatusKind) -> Result<Vec<Status>> {
        let sql = format!(
            "SELECT id, name, description FROM thesis_registry.{} ORDER BY id",
            ledger_tables(kind).statuses
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let statuses = rows
            .iter()
            .map(|row| status_from_row(row, kind))
            .collect::<sqlx::Result<Vec<_>>>()?;
        Ok(statuses)
    }

    async fn status_by_name(&self, kind: StatusKind, name: &str) -> Result<Status> {
        let sql = format!(
            "SELECT id, name, description FROM thesis_registry.{} WHERE name = $1",
            ledger_tables(kind).statuses
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RegistryError::not_found("status", format!("{kind} {name}")))?;
        Ok(status_from_row(&row, kind)?)
    }

    async fn create_proposal(&self, proposal: NewProposal) -> Result<WithStatus<Proposal>> {
        let (record, status) = proposal.into_record();
        let mut tx = self.pool.begin().await?;
        ensure_id(&mut tx, "terms", record.term_id, "term").await?;
        for person in [&record.student1, &record.student2, &record.industry_tutor]
            .into_iter()
            .flatten()
            .chain(std::iter::once(&record.academic_tutor))
        {
            ensure_person(&mut tx, person).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO thesis_registry.proposals
            (code, submission_date, title, student1, student2, academic_tutor, industry_tutor, term_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.code)
        .bind(record.submission_date)
        .bind(&record.title)
        .bind(&record.student1)
        .bind(&record.student2)
        .bind(&record.academic_tutor)
        .bind(&record.industry_tutor)
        .bind(record.term_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| RegistryError::from_insert(err, "proposal", &record.code))?;

        let subject = LedgerSubject::Proposal(record.code.clone());
        append_event(&mut tx, &subject, status, Utc::now()).await?;
        let created = fetch_proposal(&mut tx, &record.code).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn update_proposal(
        &self,
        code: &str,
        changes: ProposalChanges,
    ) -> Result<WithStatus<Proposal>> {
        let mut tx = self.pool.begin().await?;
        lock_row(&mut tx, "proposals", code, "proposal").await?;
        let current = fetch_proposal(&mut tx, code).await?;
        for person in changes.people() {
            ensure_person(&mut tx, person).await?;
        }
        if let Some(term) = changes.term_id {
            ensure_id(&mut tx, "terms", term, "term").await?;
        }

        let mut record = current.record;
        changes.apply(&mut record);
        sqlx::query(
            r#"
            UPDATE thesis_registry.proposals
            SET submission_date = $2, title = $3, student1 = $4, student2 = $5,
                academic_tutor = $6, industry_tutor = $7, term_id = $8
            WHERE code = $1
            "#,
        )
        .bind(code)
        .bind(record.submission_date)
        .bind(&record.title)
        .bind(&record.student1)
        .bind(&record.student2)
        .bind(&record.academic_tutor)
        .bind(&record.industry_tutor)
        .bind(record.term_id)
        .execute(&mut *tx)
        .await?;

        if let Some(status) = changes.status {
            if ledger::needs_append(current.current_status.as_ref(), Some(status)) {
                let subject = LedgerSubject::Proposal(code.to_string());
                append_event(&mut tx, &subject, status, Utc::now()).await?;
            }
        }
        let updated = fetch_proposal(&mut tx, code).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn get_proposal(&self, code: &str) -> Result<WithStatus<Proposal>> {
        let mut conn = self.pool.acquire().await?;
        fetch_proposal(&mut conn, code).await
    }

    async fn search_proposals(
        &self,
        spec: &SearchSpec,
        page: PageRequest,
    ) -> Result<Page<WithStatus<Proposal>>> {
        let mut conn = self.pool.acquire().await?;
        fetch_page(
            &mut conn,
            "SELECT COUNT(*) FROM thesis_registry.proposals p",
            proposal_select(),
            "p.code",
            spec,
            page,
            proposal_with_status,
        )
        .await
    }

    async fn record_status_at(
        &self,
        subject: &LedgerSubject,
        status: StatusId,
        occurred_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;
        ensure_subject(&mut tx, subject).await?;
        let id = append_event(&mut tx, subject, status, occurred_at).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn current_status(&self, subject: &LedgerSubject) -> Result<Option<StatusEvent>> {
        let mut conn = self.pool.acquire().await?;
        ensure_subject(&mut conn, subject).await?;
        fetch_current(&mut conn, subject).await
    }

    async fn status_history(&self, subject: &LedgerSubject) -> Result<Vec<StatusEvent>> {
        let mut conn = self.pool.acquire().await?;
        ensure_subject(&mut conn, subject).await?;
        let sql = format!("{} ORDER BY e.seq", ledger_select(subject));
        let rows = sqlx::query(&sql)
            .bind(subject.code())
            .fetch_all(&mut *conn)
            .await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(event) = event_from_row(&row, subject.clone())? {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn promote_proposal(&self, thesis: NewThesis) -> Result<WithStatus<Thesis>> {
        let mut tx = self.pool.begin().await?;
        lock_row(&mut tx, "proposals", &thesis.proposal_code, "proposal").await?;
        let proposal = fetch_proposal(&mut tx, &thesis.proposal_code).await?;
        let existing: Option<String> =
            sqlx::query_scalar("SELECT code FROM thesis_registry.theses WHERE proposal_code = $1")
                .bind(&proposal.record.code)
                .fetch_optional(&mut *tx)
                .await?;
        ensure_promotable(&proposal, existing.as_deref())?;
        ensure_id(&mut tx, "terms", thesis.delivery_term_id, "term").await?;

        let (record, status) = thesis.into_record(&proposal.record);
        sqlx::query(
            r#"
            INSERT INTO thesis_registry.theses
            (code, proposal_code, title, delivery_term_id, nrc, description,
             thematic_category, submission_date, company_name)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&record.code)
        .bind(&record.proposal_code)
        .bind(&record.title)
        .bind(record.delivery_term_id)
        .bind(&record.nrc)
        .bind(&record.description)
        .bind(&record.thematic_category)
        .bind(record.submission_date)
        .bind(&record.company_name)
        .execute(&mut *tx)
        .await
        .map_err(|err| RegistryError::from_insert(err, "thesis", &record.code))?;

        let subject = LedgerSubject::Thesis(record.code.clone());
        append_event(&mut tx, &subject, status, Utc::now()).await?;
        let created = fetch_thesis(&mut tx, &record.code).await?;
        tx.commit().await?;
        info!(proposal = %record.proposal_code, thesis = %record.code, "proposal promoted");
        Ok(created)
    }

    async fn update_thesis(
        &self,
        code: &str,
        changes: ThesisChanges,
    ) -> Result<WithStatus<Thesis>> {
        let mut tx = self.pool.begin().await?;
        lock_row(&mut tx, "theses", code, "thesis").await?;
        let current = fetch_thesis(&mut tx, code).await?;
        if let Some(term) = changes.delivery_term_id {
            ensure_id(&mut tx, "terms", term, "term").await?;
        }

        let mut record = current.record;
        changes.apply(&mut record);
        sqlx::query(
            r#"
            UPDATE thesis_registry.theses
            SET title = $2, delivery_term_id = $3, nrc = $4, description = $5,
                thematic_category = $6, submission_date = $7, company_name = $8
            WHERE code = $1
            "#,
        )
        .bind(code)
        .bind(&record.title)
        .bind(record.delivery_term_id)
        .bind(&record.nrc)
        .bind(&record.description)
        .bind(&record.thematic_category)
        .bind(record.submission_date)
        .bind(&record.company_name)
        .execute(&mut *tx)
        .await?;

        if let Some(status) = changes.status {
            if ledger::needs_append(current.current_status.as_ref(), Some(status)) {
                let subject = LedgerSubject::Thesis(code.to_string());
                append_event(&mut tx, &subject, status, Utc::now()).await?;
            }
        }
        let updated = fetch_thesis(&mut tx, code).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn get_thesis(&self, code: &str) -> Result<WithStatus<Thesis>> {
        let mut conn = self.pool.acquire().await?;
        fetch_thesis(&mut conn, code).await
    }

    async fn search_theses(
        &self,
        spec: &SearchSpec,
        page: PageRequest,
    ) -> Result<Page<WithStatus<Thesis>>> {
        let mut conn = self.pool.acquire().await?;
        fetch_page(
            &mut conn,
            "SELECT COUNT(*) FROM thesis_registry.theses t",
            thesis_select(),
            "t.code",
            spec,
            page,
            thesis_with_status,
        )
        .await
    }

    async fn create_defence(&self, defence: NewDefence) -> Result<Defence> {
        let record = defence.to_record();
        let mut tx = self.pool.begin().await?;
        lock_row(&mut tx, "theses", &defence.thesis_code, "thesis").await?;
        self.policy.check(&record.code, 0, defence.jurors.len())?;
        for juror in &defence.jurors {
            ensure_person(&mut tx, &juror.person_id).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO thesis_registry.defences (code, thesis_code, scheduled_at, observations)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&record.code)
        .bind(&record.thesis_code)
        .bind(record.scheduled_at)
        .bind(&record.observations)
        .execute(&mut *tx)
        .await
        .map_err(|err| RegistryError::from_insert(err, "defence", &record.code))?;

        for juror in &defence.jurors {
            insert_juror(&mut tx, &record.code, &juror.person_id, juror.is_backup).await?;
        }
        tx.commit().await?;
        info!(defence = %record.code, jurors = defence.jurors.len(), "defence created");
        Ok(record)
    }

    async fn get_defence(&self, code: &str) -> Result<Defence> {
        let mut conn = self.pool.acquire().await?;
        fetch_defence(&mut conn, code, false).await
    }

    async fn search_defences(&self, spec: &SearchSpec, page: PageRequest) -> Result<Page<Defence>> {
        let mut conn = self.pool.acquire().await?;
        fetch_page(
            &mut conn,
            "SELECT COUNT(*) FROM thesis_registry.defences d",
            format!("SELECT {DEFENCE_COLUMNS} FROM thesis_registry.defences d"),
            "d.code",
            spec,
            page,
            defence_from_row,
        )
        .await
    }

    async fn add_jurors(
        &self,
        defence_code: &str,
        person_ids: &[String],
        is_backup: bool,
    ) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;
        // Concurrent additions to the same defence queue up here.
        lock_row(&mut tx, "defences", defence_code, "defence").await?;
        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM thesis_registry.jury_assignments WHERE defence_code = $1",
        )
        .bind(defence_code)
        .fetch_one(&mut *tx)
        .await?;
        let existing = existing.max(0) as usize;
        debug!(defence = defence_code, existing, proposed = person_ids.len(), "checking jury capacity");
        if let Err(err) = self.policy.check(defence_code, existing, person_ids.len()) {
            warn!(defence = defence_code, %err, "jury addition rejected");
            return Err(err);
        }

        let mut ids = Vec::with_capacity(person_ids.len());
        for person in person_ids {
            ensure_person(&mut tx, person).await?;
            ids.push(insert_juror(&mut tx, defence_code, person, is_backup).await?);
        }
        tx.commit().await?;
        info!(defence = defence_code, added = ids.len(), is_backup, "jurors added");
        Ok(ids)
    }

    async fn jury(&self, defence_code: &str) -> Result<Vec<JuryAssignment>> {
        let mut conn = self.pool.acquire().await?;
        ensure_key(&mut conn, "defences", "code", defence_code, "defence").await?;
        let sql = format!(
            "SELECT {JURY_COLUMNS} FROM thesis_registry.jury_assignments WHERE defence_code = $1 ORDER BY seq"
        );
        let rows = sqlx::query(&sql)
            .bind(defence_code)
            .fetch_all(&mut *conn)
            .await?;
        let jury = rows
            .iter()
            .map(jury_from_row)
            .collect::<sqlx::Result<Vec<_>>>()?;
        Ok(jury)
    }

    async fn confirm_assistance(&self, assignment: Uuid) -> Result<JuryAssignment> {
        let sql = format!(
            "UPDATE thesis_registry.jury_assignments SET confirmed_assistance = TRUE \
             WHERE id = $1 RETURNING {JURY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(assignment)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RegistryError::not_found("jury assignment", assignment))?;
        Ok(jury_from_row(&row)?)
    }

    async fn grade_defence(&self, code: &str, grading: Grading) -> Result<Defence> {
        let mut tx = self.pool.begin().await?;
        let mut defence = fetch_defence(&mut tx, code, true).await?;
        grading.apply(&mut defence)?;
        sqlx::query(
            r#"
            UPDATE thesis_registry.defences
            SET grade = $2, is_publication_mention = $3, is_honorific_mention = $4,
                corrections_submission_date = $5, was_grade_loaded = TRUE
            WHERE code = $1
            "#,
        )
        .bind(code)
        .bind(defence.grade)
        .bind(defence.is_publication_mention)
        .bind(defence.is_honorific_mention)
        .bind(defence.corrections_submission_date)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(defence = code, grade = grading.grade, "defence graded");
        Ok(defence)
    }

    async fn term_overview(&self, period: i32) -> Result<TermOverview> {
        let term = self.term_by_period(period).await?;
        let mut conn = self.pool.acquire().await?;

        let sql = format!("{} WHERE p.term_id = $1 ORDER BY p.code", proposal_select());
        let proposals = sqlx::query(&sql)
            .bind(term.id)
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(proposal_with_status)
            .collect::<sqlx::Result<Vec<_>>>()?;

        let sql = format!("{} WHERE t.delivery_term_id = $1 ORDER BY t.code", thesis_select());
        let theses = sqlx::query(&sql)
            .bind(term.id)
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(thesis_with_status)
            .collect::<sqlx::Result<Vec<_>>>()?;

        let sql = format!(
            "SELECT {DEFENCE_COLUMNS}, t.title AS thesis_title, \
                    COUNT(j.id) FILTER (WHERE NOT j.is_backup) AS principal_jurors, \
                    COUNT(j.id) FILTER (WHERE j.is_backup) AS backup_jurors \
             FROM thesis_registry.defences d \
             JOIN thesis_registry.theses t ON t.code = d.thesis_code \
             LEFT JOIN thesis_registry.jury_assignments j ON j.defence_code = d.code \
             WHERE t.delivery_term_id = $1 \
             GROUP BY d.code, t.title \
             ORDER BY d.code"
        );
        let rows = sqlx::query(&sql)
            .bind(term.id)
            .fetch_all(&mut *conn)
            .await?;
        let mut defences = Vec::with_capacity(rows.len());
        for row in rows {
            let principal: i64 = row.try_get("principal_jurors")?;
            let backup: i64 = row.try_get("backup_jurors")?;
            defences.push(DefenceSummary {
                defence: defence_from_row(&row)?,
                thesis_title: row.try_get("thesis_title")?,
                principal_jurors: principal.max(0) as usize,
                backup_jurors: backup.max(0) as usize,
            });
        }

        Ok(TermOverview {
            term,
            proposals,
            theses,
            defences,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_status_join_orders_by_time_then_sequence() {
        let sql = proposal_select();
        assert!(sql.contains("FROM thesis_registry.proposals p"));
        assert!(sql.contains("WHERE e.proposal_code = p.code"));
        assert!(sql.contains("ORDER BY e.occurred_at DESC, e.seq DESC"));
        assert!(sql.contains("LIMIT 1"));
    }

    #[test]
    fn person_conflicts_name_the_clashing_column() {
        let person = Person {
            id_card_number: "V-999".to_string(),
            type_id: 1,
            name: "Ana".to_string(),
            last_name: "Rojas".to_string(),
            institutional_email: Some("shared@ucab.edu.ve".to_string()),
            email: "ana@example.com".to_string(),
            primary_phone: "0212-0000000".to_string(),
            secondary_phone: None,
            observations: None,
        };
        assert_eq!(
            person_conflict(Some(PERSON_EMAIL_CONSTRAINT), &person),
            ("institutional email", "shared@ucab.edu.ve".to_string())
        );
        assert_eq!(
            person_conflict(Some("persons_pkey"), &person),
            ("person", "V-999".to_string())
        );
        assert_eq!(person_conflict(None, &person), ("person", "V-999".to_string()));
    }

    #[test]
    fn oversized_page_lengths_saturate() {
        let window = PageRequest::new(1, usize::MAX).resolve(10);
        assert_eq!(sql_window(&window), (i64::MAX, 0));

        let window = PageRequest::new(2, 15).resolve(40);
        assert_eq!(sql_window(&window), (15, 15));
    }

    #[test]
    fn thesis_ledger_uses_thesis_tables() {
        let sql = thesis_select();
        assert!(sql.contains("thesis_registry.thesis_status_events e"));
        assert!(sql.contains("thesis_registry.thesis_statuses s"));
        assert!(sql.contains("WHERE e.thesis_code = t.code"));

        let history = ledger_select(&LedgerSubject::Thesis("TGP1".to_string()));
        assert!(history.ends_with("WHERE e.thesis_code = $1"));
    }
}
