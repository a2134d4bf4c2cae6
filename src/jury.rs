use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// Jurors allowed per defence unless configured otherwise.
pub const DEFAULT_MAX_JUDGES: usize = 3;

/// Per-defence jury cap. Backup and principal jurors share the same pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JuryPolicy {
    max_judges: usize,
}

impl Default for JuryPolicy {
    fn default() -> Self {
        Self {
            max_judges: DEFAULT_MAX_JUDGES,
        }
    }
}

impl JuryPolicy {
    pub fn new(max_judges: usize) -> Self {
        Self { max_judges }
    }

    pub fn max_judges(&self) -> usize {
        self.max_judges
    }

    pub fn check(&self, defence: &str, existing: usize, proposed: usize) -> Result<()> {
        if existing.saturating_add(proposed) > self.max_judges {
            return Err(RegistryError::CapacityExceeded {
                defence: defence.to_string(),
                max: self.max_judges,
                existing,
                proposed,
            });
        }
        Ok(())
    }
}

/// One juror to seat on a new defence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JurorDraft {
    pub person_id: String,
    pub is_backup: bool,
}

impl JurorDraft {
    pub fn principal(person_id: impl Into<String>) -> Self {
        Self {
            person_id: person_id.into(),
            is_backup: false,
        }
    }

    pub fn backup(person_id: impl Into<String>) -> Self {
        Self {
            person_id: person_id.into(),
            is_backup: true,
        }
    }
}
