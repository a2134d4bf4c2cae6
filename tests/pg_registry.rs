//! Runs the Postgres backend against a live database. Every test is skipped
//! when `DATABASE_URL` is not set; each one works on its own codes so they
//! can share a database.

use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use thesis_registry::db::{init_db, PgRegistry};
use thesis_registry::jury::JurorDraft;
use thesis_registry::models::{Person, StatusId, StatusKind, Term};
use thesis_registry::registry::{NewDefence, NewProposal, NewThesis, ProposalChanges};
use thesis_registry::search::{PageRequest, SearchSpec, PROPOSAL_FIELDS};
use thesis_registry::{JuryPolicy, LedgerSubject, Registry, RegistryError};
use uuid::Uuid;

struct Fixture {
    registry: PgRegistry,
    /// Unique per test, prefixed to every code and id card.
    tag: String,
    term: Term,
}

impl Fixture {
    fn code(&self, name: &str) -> String {
        format!("{name}-{}", self.tag)
    }

    fn person_id(&self, n: u8) -> String {
        format!("V-{}-{n}", self.tag)
    }

    async fn status(&self, kind: StatusKind, name: &str) -> StatusId {
        self.registry.status_by_name(kind, name).await.unwrap().id
    }
}

async fn fixture() -> Option<Fixture> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("skipping Postgres test (DATABASE_URL not set)");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .unwrap();
    init_db(&pool).await.unwrap();
    let registry = PgRegistry::new(pool, JuryPolicy::default());
    registry.seed_defaults().await.unwrap();

    let id = Uuid::new_v4();
    let tag = id.simple().to_string()[..12].to_string();
    let period = (id.as_u128() % 2_000_000_000) as i32 + 1;
    let term = registry.create_term(period).await.unwrap();

    let professor = registry
        .person_types()
        .await
        .unwrap()
        .into_iter()
        .find(|kind| kind.name == "Profesor")
        .unwrap()
        .id;
    let fx = Fixture {
        registry,
        tag,
        term,
    };
    for n in 1..=5 {
        fx.registry
            .create_person(Person {
                id_card_number: fx.person_id(n),
                type_id: professor,
                name: format!("Profesor {n}"),
                last_name: "Prueba".to_string(),
                institutional_email: None,
                email: format!("profesor{n}@example.com"),
                primary_phone: "0212-4075000".to_string(),
                secondary_phone: None,
                observations: None,
            })
            .await
            .unwrap();
    }
    Some(fx)
}

async fn proposal(fx: &Fixture, name: &str) -> String {
    let code = fx.code(name);
    let pending = fx.status(StatusKind::Proposal, "Por evaluar").await;
    fx.registry
        .create_proposal(NewProposal {
            code: code.clone(),
            submission_date: NaiveDate::from_ymd_opt(2019, 10, 14).unwrap(),
            title: format!("Propuesta {name}"),
            student1: None,
            student2: None,
            academic_tutor: fx.person_id(1),
            industry_tutor: None,
            term_id: fx.term.id,
            status: pending,
        })
        .await
        .unwrap();
    code
}

async fn thesis(fx: &Fixture, name: &str) -> String {
    let code = proposal(fx, name).await;
    let approved = fx.status(StatusKind::Proposal, "Aprobada").await;
    fx.registry
        .update_proposal(&code, ProposalChanges::status(approved))
        .await
        .unwrap();
    let to_deliver = fx.status(StatusKind::Thesis, "Por entregar").await;
    fx.registry
        .promote_proposal(NewThesis {
            proposal_code: code,
            title: None,
            delivery_term_id: fx.term.id,
            nrc: "20415".to_string(),
            description: "Trabajo instrumental".to_string(),
            thematic_category: "Ingeniería de software".to_string(),
            submission_date: NaiveDate::from_ymd_opt(2020, 1, 20).unwrap(),
            company_name: None,
            status: to_deliver,
        })
        .await
        .unwrap()
        .record
        .code
}

async fn defence(fx: &Fixture, name: &str, jurors: &[u8]) -> String {
    let thesis_code = thesis(fx, name).await;
    fx.registry
        .create_defence(NewDefence {
            thesis_code,
            scheduled_at: Utc.with_ymd_and_hms(2020, 3, 2, 14, 0, 0).unwrap(),
            observations: String::new(),
            jurors: jurors
                .iter()
                .map(|n| JurorDraft::principal(fx.person_id(*n)))
                .collect(),
        })
        .await
        .unwrap()
        .code
}

#[tokio::test]
async fn promoted_thesis_carries_latest_status() {
    let Some(fx) = fixture().await else { return };
    let code = thesis(&fx, "P1").await;
    let proposal_code = fx.code("P1");
    assert_eq!(code, format!("TG{proposal_code}"));

    let history = fx
        .registry
        .status_history(&LedgerSubject::Proposal(proposal_code.clone()))
        .await
        .unwrap();
    let names: Vec<_> = history.iter().map(|e| e.status_name.as_str()).collect();
    assert_eq!(names, ["Por evaluar", "Aprobada"]);

    let page = fx
        .registry
        .search_proposals(
            &SearchSpec::parse(Some(proposal_code.as_str()), PROPOSAL_FIELDS),
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].status_name(), Some("Aprobada"));

    let thesis = fx.registry.get_thesis(&code).await.unwrap();
    assert_eq!(thesis.status_name(), Some("Por entregar"));
}

#[tokio::test]
async fn timestamp_ties_resolve_by_insertion() {
    let Some(fx) = fixture().await else { return };
    let code = proposal(&fx, "P2").await;
    let subject = LedgerSubject::Proposal(code.clone());
    let deferred = fx.status(StatusKind::Proposal, "Diferida").await;
    let approved = fx.status(StatusKind::Proposal, "Aprobada").await;
    let rejected = fx.status(StatusKind::Proposal, "Rechazada").await;

    let at = Utc::now() + chrono::Duration::days(1);
    fx.registry.record_status_at(&subject, deferred, at).await.unwrap();
    fx.registry.record_status_at(&subject, approved, at).await.unwrap();
    let current = fx.registry.current_status(&subject).await.unwrap().unwrap();
    assert_eq!(current.status_name, "Aprobada");

    let earlier = at - chrono::Duration::days(30);
    fx.registry
        .record_status_at(&subject, rejected, earlier)
        .await
        .unwrap();
    let current = fx.registry.get_proposal(&code).await.unwrap();
    assert_eq!(current.status_name(), Some("Aprobada"));
    assert_eq!(fx.registry.status_history(&subject).await.unwrap().len(), 4);
}

#[tokio::test]
async fn overflowing_batch_is_rolled_back() {
    let Some(fx) = fixture().await else { return };
    let code = defence(&fx, "P3", &[1, 2]).await;

    let err = fx
        .registry
        .add_jurors(&code, &[fx.person_id(3), fx.person_id(4)], false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::CapacityExceeded {
            existing: 2,
            proposed: 2,
            max: 3,
            ..
        }
    ));
    assert_eq!(fx.registry.jury(&code).await.unwrap().len(), 2);

    fx.registry
        .add_jurors(&code, &[fx.person_id(3)], true)
        .await
        .unwrap();
    let jury = fx.registry.jury(&code).await.unwrap();
    assert_eq!(jury.len(), 3);
    assert!(jury[2].is_backup);

    let err = fx
        .registry
        .add_jurors(&code, &[fx.person_id(4)], false)
        .await
        .unwrap_err();
    assert!(err.is_capacity_exceeded());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_additions_fill_the_last_seat_once() {
    let Some(fx) = fixture().await else { return };
    let code = defence(&fx, "P4", &[1, 2]).await;
    let contenders = [fx.person_id(3), fx.person_id(4)];
    let registry = Arc::new(fx.registry);

    let handles = contenders.map(|person| {
        let registry = Arc::clone(&registry);
        let code = code.clone();
        tokio::spawn(async move { registry.add_jurors(&code, &[person], false).await })
    });

    let mut accepted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(err) if err.is_capacity_exceeded() => rejected += 1,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!((accepted, rejected), (1, 1));
    assert_eq!(registry.jury(&code).await.unwrap().len(), 3);
}

#[tokio::test]
async fn institutional_email_clash_is_told_apart() {
    let Some(fx) = fixture().await else { return };
    let mut first = fx.registry.get_person(&fx.person_id(1)).await.unwrap();
    first.id_card_number = fx.code("V-A");
    first.institutional_email = Some(format!("{}@ucab.edu.ve", fx.tag));
    fx.registry.create_person(first.clone()).await.unwrap();

    let err = fx.registry.create_person(first.clone()).await.unwrap_err();
    assert!(matches!(err, RegistryError::Duplicate { entity: "person", .. }));

    let mut clash = first;
    clash.id_card_number = fx.code("V-B");
    let err = fx.registry.create_person(clash).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Duplicate {
            entity: "institutional email",
            ..
        }
    ));
}
