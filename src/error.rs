use crate::ledger::LedgerSubject;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Adding the requested jurors would break the per-defence cap.
    #[error(
        "defence {defence} already has {existing} jurors, adding {proposed} exceeds the maximum of {max}"
    )]
    CapacityExceeded {
        defence: String,
        max: usize,
        existing: usize,
        proposed: usize,
    },

    /// The subject exists but its ledger holds no events.
    #[error("{0} has no recorded status")]
    NoCurrentStatus(LedgerSubject),

    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} {key} already exists")]
    Duplicate { entity: &'static str, key: String },

    #[error("proposal {proposal} was already promoted to thesis {thesis}")]
    AlreadyPromoted { proposal: String, thesis: String },

    #[error("proposal {proposal} is '{status}', only approved proposals become theses")]
    NotPromotable { proposal: String, status: String },

    #[error("defence {0} was already graded")]
    AlreadyGraded(String),

    #[error("grade {0} is negative")]
    InvalidGrade(i16),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl RegistryError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn duplicate(entity: &'static str, key: impl ToString) -> Self {
        Self::Duplicate {
            entity,
            key: key.to_string(),
        }
    }

    /// Turns a unique-constraint violation into `Duplicate`, passing every
    /// other database failure through.
    pub(crate) fn from_insert(err: sqlx::Error, entity: &'static str, key: impl ToString) -> Self {
        let unique = err
            .as_database_error()
            .map(|db| db.is_unique_violation())
            .unwrap_or(false);
        if unique {
            Self::duplicate(entity, key)
        } else {
            Self::Database(err)
        }
    }

    #[must_use]
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
