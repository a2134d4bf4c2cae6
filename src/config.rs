use clap::Args;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::jury::{JuryPolicy, DEFAULT_MAX_JUDGES};

/// Connection and policy settings shared by every command.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    #[arg(long, env = "THESIS_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// Jurors allowed per defence, backups included
    #[arg(long, env = "THESIS_MAX_JUDGES", default_value_t = DEFAULT_MAX_JUDGES)]
    pub max_judges: usize,
}

impl Settings {
    pub fn jury_policy(&self) -> JuryPolicy {
        JuryPolicy::new(self.max_judges)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Installs the global subscriber. `RUST_LOG` filters (default `info`) and
/// `THESIS_LOG_JSON` switches to JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_flag("THESIS_LOG_JSON") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        settings: Settings,
    }

    #[test]
    fn defaults_apply_when_only_url_given() {
        let harness = Harness::parse_from(["test", "--database-url", "postgres://localhost/thesis"]);
        assert_eq!(harness.settings.max_connections, 5);
        assert_eq!(harness.settings.jury_policy().max_judges(), DEFAULT_MAX_JUDGES);
    }

    #[test]
    fn max_judges_is_configurable() {
        let harness = Harness::parse_from([
            "test",
            "--database-url",
            "postgres://localhost/thesis",
            "--max-judges",
            "5",
        ]);
        assert_eq!(harness.settings.jury_policy().max_judges(), 5);
    }
}
