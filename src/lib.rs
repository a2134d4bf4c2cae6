//! Registry of thesis proposals, theses, defences and their juries.
//!
//! Proposal and thesis status lives in an append-only ledger
//! ([`ledger`]); defences enforce a jury cap ([`jury`]). Storage is behind
//! the [`Registry`] trait, with a Postgres backend ([`db::PgRegistry`]) and
//! an in-process one ([`memory::MemoryRegistry`]).

pub mod codes;
pub mod config;
pub mod db;
pub mod error;
pub mod import;
pub mod jury;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod registry;
pub mod report;
pub mod search;

pub use error::{RegistryError, Result};
pub use jury::{JuryPolicy, DEFAULT_MAX_JUDGES};
pub use ledger::{LedgerSubject, StatusEvent};
pub use registry::Registry;
