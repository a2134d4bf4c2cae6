use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use thesis_registry::config::{self, Settings};
use thesis_registry::db::{self, PgRegistry};
use thesis_registry::jury::JurorDraft;
use thesis_registry::models::{Person, StatusId, StatusKind};
use thesis_registry::registry::{
    Grading, NewDefence, NewProposal, NewThesis, ProposalChanges, ThesisChanges,
};
use thesis_registry::search::{
    Page, PageRequest, SearchSpec, DEFAULT_PAGE_LENGTH, DEFENCE_FIELDS, PERSON_FIELDS,
    PROPOSAL_FIELDS, THESIS_FIELDS,
};
use thesis_registry::{import, report, LedgerSubject, Registry};

#[derive(Parser)]
#[command(name = "thesis-registry")]
#[command(about = "Proposal, thesis and defence registry", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Insert the default person types and status catalogs
    Seed,
    /// Import people from a CSV file
    ImportPersons {
        #[arg(long)]
        csv: PathBuf,
    },
    #[command(subcommand)]
    Person(PersonCommand),
    #[command(subcommand)]
    Term(TermCommand),
    #[command(subcommand)]
    Status(StatusCommand),
    #[command(subcommand)]
    Proposal(ProposalCommand),
    #[command(subcommand)]
    Thesis(ThesisCommand),
    #[command(subcommand)]
    Defence(DefenceCommand),
    /// Generate a markdown report for a term
    Report {
        #[arg(long)]
        term: i32,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[derive(Args)]
struct ListArgs {
    /// Whitespace separated terms, all of which must match
    #[arg(long)]
    search: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: usize,
    #[arg(long, default_value_t = DEFAULT_PAGE_LENGTH)]
    page_length: usize,
    #[arg(long)]
    json: bool,
}

impl ListArgs {
    fn request(&self) -> PageRequest {
        PageRequest::new(self.page, self.page_length)
    }
}

#[derive(Subcommand)]
enum PersonCommand {
    /// Register a person
    Add {
        #[arg(long)]
        id_card_number: String,
        #[arg(long = "type")]
        person_type: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        institutional_email: Option<String>,
        #[arg(long)]
        email: String,
        #[arg(long)]
        primary_phone: String,
        #[arg(long)]
        secondary_phone: Option<String>,
        #[arg(long)]
        observations: Option<String>,
    },
    List(ListArgs),
    Show {
        id_card_number: String,
    },
}

#[derive(Subcommand)]
enum TermCommand {
    Add {
        #[arg(long)]
        period: i32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Proposal,
    Thesis,
}

impl From<KindArg> for StatusKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Proposal => StatusKind::Proposal,
            KindArg::Thesis => StatusKind::Thesis,
        }
    }
}

#[derive(Subcommand)]
enum StatusCommand {
    /// Add a status to the proposal or thesis catalog
    Add {
        #[arg(long, value_enum)]
        kind: KindArg,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List {
        #[arg(long, value_enum)]
        kind: KindArg,
    },
}

#[derive(Subcommand)]
enum ProposalCommand {
    /// Submit a proposal with its initial status
    Add {
        #[arg(long)]
        code: String,
        #[arg(long)]
        submission_date: NaiveDate,
        #[arg(long)]
        title: String,
        #[arg(long)]
        student1: Option<String>,
        #[arg(long)]
        student2: Option<String>,
        #[arg(long)]
        academic_tutor: String,
        #[arg(long)]
        industry_tutor: Option<String>,
        /// Term period, e.g. 201925
        #[arg(long)]
        term: i32,
        #[arg(long, default_value = "Por evaluar")]
        status: String,
    },
    /// Edit fields; a new status is appended to the history
    Edit {
        code: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        student1: Option<String>,
        #[arg(long, conflicts_with = "student1")]
        clear_student1: bool,
        #[arg(long)]
        student2: Option<String>,
        #[arg(long, conflicts_with = "student2")]
        clear_student2: bool,
        #[arg(long)]
        academic_tutor: Option<String>,
        #[arg(long)]
        industry_tutor: Option<String>,
        #[arg(long, conflicts_with = "industry_tutor")]
        clear_industry_tutor: bool,
        #[arg(long)]
        term: Option<i32>,
        #[arg(long)]
        status: Option<String>,
    },
    SetStatus {
        code: String,
        #[arg(long)]
        status: String,
    },
    History {
        code: String,
        #[arg(long)]
        json: bool,
    },
    List(ListArgs),
    Show {
        code: String,
    },
}

#[derive(Subcommand)]
enum ThesisCommand {
    /// Create the thesis of an approved proposal
    Promote {
        #[arg(long)]
        proposal: String,
        /// Defaults to the proposal title
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        delivery_term: i32,
        #[arg(long)]
        nrc: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        thematic_category: String,
        #[arg(long)]
        submission_date: NaiveDate,
        #[arg(long)]
        company: Option<String>,
        #[arg(long, default_value = "Por entregar")]
        status: String,
    },
    SetStatus {
        code: String,
        #[arg(long)]
        status: String,
    },
    History {
        code: String,
        #[arg(long)]
        json: bool,
    },
    List(ListArgs),
    Show {
        code: String,
    },
}

#[derive(Subcommand)]
enum DefenceCommand {
    /// Schedule the defence of a thesis with its initial jury
    Add {
        #[arg(long)]
        thesis: String,
        /// RFC 3339 timestamp, e.g. 2020-03-02T14:00:00Z
        #[arg(long)]
        scheduled_at: DateTime<Utc>,
        #[arg(long, default_value = "")]
        observations: String,
        #[arg(long = "juror")]
        jurors: Vec<String>,
        #[arg(long = "backup-juror")]
        backup_jurors: Vec<String>,
    },
    AddJurors {
        code: String,
        #[arg(long = "person", required = true)]
        persons: Vec<String>,
        #[arg(long)]
        backup: bool,
    },
    /// Mark a juror as confirmed
    Confirm {
        assignment: Uuid,
    },
    Grade {
        code: String,
        #[arg(long)]
        grade: i16,
        #[arg(long)]
        publication_mention: bool,
        #[arg(long)]
        honorific_mention: bool,
        #[arg(long)]
        corrections_date: Option<NaiveDate>,
    },
    Jury {
        code: String,
    },
    List(ListArgs),
}

async fn status_id(registry: &dyn Registry, kind: StatusKind, name: &str) -> anyhow::Result<StatusId> {
    let status = registry
        .status_by_name(kind, name)
        .await
        .with_context(|| format!("unknown {kind} status '{name}'"))?;
    Ok(status.id)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_page_footer<T>(page: &Page<T>) {
    println!(
        "Page {} of {} ({} total).",
        page.number, page.num_pages, page.total
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_tracing();
    let cli = Cli::parse();

    let pool = PgPoolOptions::new()
        .max_connections(cli.settings.max_connections)
        .connect(&cli.settings.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let registry = PgRegistry::new(pool, cli.settings.jury_policy());

    match cli.command {
        Commands::InitDb => {
            db::init_db(registry.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            registry.seed_defaults().await?;
            println!("Default catalogs inserted.");
        }
        Commands::ImportPersons { csv } => {
            let file = std::fs::File::open(&csv)
                .with_context(|| format!("failed to open {}", csv.display()))?;
            let inserted = import::import_persons(&registry, file).await?;
            println!("Inserted {inserted} persons from {}.", csv.display());
        }
        Commands::Person(command) => run_person(&registry, command).await?,
        Commands::Term(TermCommand::Add { period }) => {
            let term = registry.create_term(period).await?;
            println!("Term {} registered.", term.period);
        }
        Commands::Status(command) => run_status(&registry, command).await?,
        Commands::Proposal(command) => run_proposal(&registry, command).await?,
        Commands::Thesis(command) => run_thesis(&registry, command).await?,
        Commands::Defence(command) => run_defence(&registry, command).await?,
        Commands::Report { term, out } => {
            let overview = registry.term_overview(term).await?;
            std::fs::write(&out, report::build_report(&overview))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn run_person(registry: &dyn Registry, command: PersonCommand) -> anyhow::Result<()> {
    match command {
        PersonCommand::Add {
            id_card_number,
            person_type,
            name,
            last_name,
            institutional_email,
            email,
            primary_phone,
            secondary_phone,
            observations,
        } => {
            let type_id = registry
                .person_types()
                .await?
                .into_iter()
                .find(|kind| kind.name.eq_ignore_ascii_case(&person_type))
                .map(|kind| kind.id)
                .with_context(|| format!("unknown person type '{person_type}'"))?;
            let person = registry
                .create_person(Person {
                    id_card_number,
                    type_id,
                    name,
                    last_name,
                    institutional_email,
                    email,
                    primary_phone,
                    secondary_phone,
                    observations,
                })
                .await?;
            println!("Registered {person}.");
        }
        PersonCommand::List(args) => {
            let spec = SearchSpec::parse(args.search.as_deref(), PERSON_FIELDS);
            let page = registry.search_persons(&spec, args.request()).await?;
            if args.json {
                return print_json(&page);
            }
            if page.items.is_empty() {
                println!("No persons found.");
            }
            for person in &page.items {
                println!("- {person} <{}>", person.email);
            }
            print_page_footer(&page);
        }
        PersonCommand::Show { id_card_number } => {
            let person = registry.get_person(&id_card_number).await?;
            print_json(&person)?;
        }
    }
    Ok(())
}

async fn run_status(registry: &dyn Registry, command: StatusCommand) -> anyhow::Result<()> {
    match command {
        StatusCommand::Add {
            kind,
            name,
            description,
        } => {
            let status = registry
                .create_status(kind.into(), &name, description.as_deref())
                .await?;
            println!("Added {} status '{}' (#{}).", status.kind, status.name, status.id);
        }
        StatusCommand::List { kind } => {
            for status in registry.list_statuses(kind.into()).await? {
                match status.description {
                    Some(description) => println!("#{} {}: {}", status.id, status.name, description),
                    None => println!("#{} {}", status.id, status.name),
                }
            }
        }
    }
    Ok(())
}

async fn print_history(registry: &dyn Registry, subject: LedgerSubject, json: bool) -> anyhow::Result<()> {
    let history = registry.status_history(&subject).await?;
    if json {
        return print_json(&history);
    }
    if history.is_empty() {
        println!("{subject} has no recorded status.");
    }
    for event in history {
        println!(
            "{} {}",
            event.occurred_at.format("%Y-%m-%d %H:%M:%S"),
            event.status_name
        );
    }
    Ok(())
}

/// `--x value` sets, `--clear-x` empties, neither leaves the field alone.
fn optional_change(value: Option<String>, clear: bool) -> Option<Option<String>> {
    if clear {
        Some(None)
    } else {
        value.map(Some)
    }
}

async fn run_proposal(registry: &dyn Registry, command: ProposalCommand) -> anyhow::Result<()> {
    match command {
        ProposalCommand::Add {
            code,
            submission_date,
            title,
            student1,
            student2,
            academic_tutor,
            industry_tutor,
            term,
            status,
        } => {
            let term = registry.term_by_period(term).await?;
            let status = status_id(registry, StatusKind::Proposal, &status).await?;
            let created = registry
                .create_proposal(NewProposal {
                    code,
                    submission_date,
                    title,
                    student1,
                    student2,
                    academic_tutor,
                    industry_tutor,
                    term_id: term.id,
                    status,
                })
                .await?;
            println!(
                "Proposal {} created as '{}'.",
                created.record.code,
                created.status_name().unwrap_or_default()
            );
        }
        ProposalCommand::Edit {
            code,
            title,
            student1,
            clear_student1,
            student2,
            clear_student2,
            academic_tutor,
            industry_tutor,
            clear_industry_tutor,
            term,
            status,
        } => {
            let term_id = match term {
                Some(period) => Some(registry.term_by_period(period).await?.id),
                None => None,
            };
            let status = match status {
                Some(name) => Some(status_id(registry, StatusKind::Proposal, &name).await?),
                None => None,
            };
            let changes = ProposalChanges {
                title,
                student1: optional_change(student1, clear_student1),
                student2: optional_change(student2, clear_student2),
                academic_tutor,
                industry_tutor: optional_change(industry_tutor, clear_industry_tutor),
                term_id,
                status,
                ..ProposalChanges::default()
            };
            let updated = registry.update_proposal(&code, changes).await?;
            println!(
                "Proposal {} saved, status '{}'.",
                updated.record.code,
                updated.status_name().unwrap_or_default()
            );
        }
        ProposalCommand::SetStatus { code, status } => {
            let status = status_id(registry, StatusKind::Proposal, &status).await?;
            let updated = registry
                .update_proposal(&code, ProposalChanges::status(status))
                .await?;
            println!(
                "Proposal {} is now '{}'.",
                updated.record.code,
                updated.status_name().unwrap_or_default()
            );
        }
        ProposalCommand::History { code, json } => {
            print_history(registry, LedgerSubject::Proposal(code), json).await?;
        }
        ProposalCommand::List(args) => {
            let spec = SearchSpec::parse(args.search.as_deref(), PROPOSAL_FIELDS);
            let page = registry.search_proposals(&spec, args.request()).await?;
            if args.json {
                return print_json(&page);
            }
            if page.items.is_empty() {
                println!("No proposals found.");
            }
            for proposal in &page.items {
                println!(
                    "- {} {} [{}]",
                    proposal.record.code,
                    proposal.record.title,
                    proposal.status_name().unwrap_or("sin estado")
                );
            }
            print_page_footer(&page);
        }
        ProposalCommand::Show { code } => {
            print_json(&registry.get_proposal(&code).await?)?;
        }
    }
    Ok(())
}

async fn run_thesis(registry: &dyn Registry, command: ThesisCommand) -> anyhow::Result<()> {
    match command {
        ThesisCommand::Promote {
            proposal,
            title,
            delivery_term,
            nrc,
            description,
            thematic_category,
            submission_date,
            company,
            status,
        } => {
            let term = registry.term_by_period(delivery_term).await?;
            let status = status_id(registry, StatusKind::Thesis, &status).await?;
            let thesis = registry
                .promote_proposal(NewThesis {
                    proposal_code: proposal,
                    title,
                    delivery_term_id: term.id,
                    nrc,
                    description,
                    thematic_category,
                    submission_date,
                    company_name: company,
                    status,
                })
                .await?;
            println!(
                "Thesis {} \"{}\" created as '{}'.",
                thesis.record.code,
                thesis.record.title,
                thesis.status_name().unwrap_or_default()
            );
        }
        ThesisCommand::SetStatus { code, status } => {
            let status = status_id(registry, StatusKind::Thesis, &status).await?;
            let updated = registry
                .update_thesis(&code, ThesisChanges::status(status))
                .await?;
            println!(
                "Thesis {} is now '{}'.",
                updated.record.code,
                updated.status_name().unwrap_or_default()
            );
        }
        ThesisCommand::History { code, json } => {
            print_history(registry, LedgerSubject::Thesis(code), json).await?;
        }
        ThesisCommand::List(args) => {
            let spec = SearchSpec::parse(args.search.as_deref(), THESIS_FIELDS);
            let page = registry.search_theses(&spec, args.request()).await?;
            if args.json {
                return print_json(&page);
            }
            if page.items.is_empty() {
                println!("No theses found.");
            }
            for thesis in &page.items {
                println!(
                    "- {} {} [{}]",
                    thesis.record.code,
                    thesis.record.title,
                    thesis.status_name().unwrap_or("sin estado")
                );
            }
            print_page_footer(&page);
        }
        ThesisCommand::Show { code } => {
            print_json(&registry.get_thesis(&code).await?)?;
        }
    }
    Ok(())
}

async fn run_defence(registry: &dyn Registry, command: DefenceCommand) -> anyhow::Result<()> {
    match command {
        DefenceCommand::Add {
            thesis,
            scheduled_at,
            observations,
            jurors,
            backup_jurors,
        } => {
            let jurors = jurors
                .into_iter()
                .map(JurorDraft::principal)
                .chain(backup_jurors.into_iter().map(JurorDraft::backup))
                .collect();
            let defence = registry
                .create_defence(NewDefence {
                    thesis_code: thesis,
                    scheduled_at,
                    observations,
                    jurors,
                })
                .await?;
            println!("Defence {} scheduled for {}.", defence.code, defence.scheduled_at);
        }
        DefenceCommand::AddJurors {
            code,
            persons,
            backup,
        } => {
            let ids = registry.add_jurors(&code, &persons, backup).await?;
            println!(
                "Added {} jurors to {} (maximum {}).",
                ids.len(),
                code,
                registry.jury_policy().max_judges()
            );
        }
        DefenceCommand::Confirm { assignment } => {
            let row = registry.confirm_assistance(assignment).await?;
            println!("{} confirmed for {}.", row.person_id, row.defence_code);
        }
        DefenceCommand::Grade {
            code,
            grade,
            publication_mention,
            honorific_mention,
            corrections_date,
        } => {
            let defence = registry
                .grade_defence(
                    &code,
                    Grading {
                        grade,
                        is_publication_mention: publication_mention,
                        is_honorific_mention: honorific_mention,
                        corrections_submission_date: corrections_date,
                    },
                )
                .await?;
            println!(
                "Defence {} graded {}.",
                defence.code,
                defence.grade.unwrap_or_default()
            );
        }
        DefenceCommand::Jury { code } => {
            let jury = registry.jury(&code).await?;
            if jury.is_empty() {
                println!("No jurors assigned to {code}.");
            }
            for row in jury {
                let person = registry.get_person(&row.person_id).await?;
                println!(
                    "- {} {}{}{}",
                    row.id,
                    person,
                    if row.is_backup { " (backup)" } else { "" },
                    if row.confirmed_assistance { " confirmed" } else { "" }
                );
            }
        }
        DefenceCommand::List(args) => {
            let spec = SearchSpec::parse(args.search.as_deref(), DEFENCE_FIELDS);
            let page = registry.search_defences(&spec, args.request()).await?;
            if args.json {
                return print_json(&page);
            }
            if page.items.is_empty() {
                println!("No defences found.");
            }
            for defence in &page.items {
                let grade = defence
                    .grade
                    .map(|grade| grade.to_string())
                    .unwrap_or_else(|| "pending".to_string());
                println!(
                    "- {} {} {} grade {}",
                    defence.code,
                    defence.thesis_code,
                    defence.scheduled_at.format("%Y-%m-%d %H:%M"),
                    grade
                );
            }
            print_page_footer(&page);
        }
    }
    Ok(())
}
