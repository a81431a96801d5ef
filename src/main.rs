use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use leadflow::Leadflow;
use leadflow::audit;
use leadflow::clock::SystemClock;
use leadflow::config::Config;
use leadflow::db::{ContactPriority, ContactStatus, connect_from_config};
use leadflow::lifecycle::StatusChange;
use leadflow::routing::ManualAssignment;
use leadflow::rules::ConditionValue;

#[derive(Parser, Debug)]
#[command(name = "leadflow", version, about = "Contact routing and lifecycle scoring engine")]
struct Cli {
    /// Settings file (TOML). Environment variables override it.
    #[arg(long, env = "LEADFLOW_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or upgrade the database schema.
    Migrate,
    /// Route a contact through the active assignment rules.
    Assign {
        contact: Uuid,
        /// Context value visible to rule conditions, as `field=value`.
        #[arg(long = "override", value_name = "FIELD=VALUE")]
        overrides: Vec<String>,
    },
    /// Assign a contact to a specific owner.
    AssignManual {
        contact: Uuid,
        owner: Uuid,
        #[arg(long, default_value = "Manual assignment")]
        reason: String,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        actor: Option<Uuid>,
    },
    Unassign {
        contact: Uuid,
        #[arg(long, default_value = "Manual unassignment")]
        reason: String,
        #[arg(long)]
        actor: Option<Uuid>,
    },
    /// Recompute a contact's lead score.
    Score {
        contact: Uuid,
        #[arg(long)]
        force: bool,
        #[arg(long, default_value = "cli")]
        reason: String,
    },
    /// Move a contact to a new status.
    Status {
        contact: Uuid,
        status: String,
        #[arg(long)]
        force: bool,
        #[arg(long, default_value = "Status updated")]
        reason: String,
        #[arg(long)]
        actor: Option<Uuid>,
    },
    Lifecycle {
        contact: Uuid,
    },
    Events {
        contact: Uuid,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Workload {
        owner: Uuid,
    },
    /// Recompute workload counters for every known owner.
    ReconcileWorkloads,
    /// Evaluate scheduled transition rules once.
    RunScheduled,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("leadflow=info"));
    let json = std::env::var("LEADFLOW_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `field=value`; numbers and booleans are typed, everything else is text.
fn parse_override(raw: &str) -> anyhow::Result<(String, ConditionValue)> {
    let Some((field, value)) = raw.split_once('=') else {
        bail!("override '{raw}' must look like field=value");
    };
    let field = field.trim();
    if field.is_empty() {
        bail!("override '{raw}' has an empty field name");
    }
    let value = value.trim();
    let parsed = if let Ok(n) = value.parse::<f64>() {
        ConditionValue::Number(n)
    } else {
        match value.to_ascii_lowercase().as_str() {
            "true" => ConditionValue::Bool(true),
            "false" => ConditionValue::Bool(false),
            _ => ConditionValue::String(value.to_string()),
        }
    };
    Ok((field.to_string(), parsed))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.settings.as_deref()).context("loading configuration")?;
    audit::init(&config.audit);
    tracing::debug!(enabled = audit::enabled(), "Decision audit log configured");

    let db = connect_from_config(&config.database)
        .await
        .context("opening database")?;
    if matches!(cli.command, Command::Migrate) {
        tracing::info!(
            path = %config.database.local_path().display(),
            "Database schema is up to date"
        );
        return Ok(());
    }

    let engine = Leadflow::new(db, Arc::new(SystemClock), config.engine.clone());

    match cli.command {
        Command::Migrate => {}
        Command::Assign { contact, overrides } => {
            let overrides = overrides
                .iter()
                .map(|raw| parse_override(raw))
                .collect::<anyhow::Result<HashMap<_, _>>>()?;
            let assignment = engine
                .assignment()
                .assign_automatically(contact, &overrides)
                .await?;
            print_json(&assignment)?;
        }
        Command::AssignManual {
            contact,
            owner,
            reason,
            priority,
            actor,
        } => {
            let priority = priority
                .map(|raw| {
                    ContactPriority::from_db_value(&raw)
                        .with_context(|| format!("unknown priority '{raw}'"))
                })
                .transpose()?;
            let assignment = engine
                .assignment()
                .assign_manually(&ManualAssignment {
                    contact_id: contact,
                    owner_id: owner,
                    reason,
                    priority,
                    actor_id: actor,
                })
                .await?;
            print_json(&assignment)?;
        }
        Command::Unassign {
            contact,
            reason,
            actor,
        } => {
            let assignment = engine.assignment().unassign(contact, actor, &reason).await?;
            print_json(&assignment)?;
        }
        Command::Score {
            contact,
            force,
            reason,
        } => {
            let snapshot = engine.score_contact(contact, force, &reason, None).await?;
            print_json(&snapshot)?;
        }
        Command::Status {
            contact,
            status,
            force,
            reason,
            actor,
        } => {
            let new_status = ContactStatus::from_db_value(&status)
                .with_context(|| format!("unknown status '{status}'"))?;
            let snapshot = engine
                .change_status(&StatusChange {
                    contact_id: contact,
                    new_status,
                    reason,
                    force,
                    actor_id: actor,
                })
                .await?;
            print_json(&snapshot)?;
        }
        Command::Lifecycle { contact } => {
            print_json(&engine.lifecycle().get_lifecycle(contact).await?)?;
        }
        Command::Events { contact, limit } => {
            print_json(&engine.lifecycle().lifecycle_events(contact, limit).await?)?;
        }
        Command::Workload { owner } => {
            print_json(&engine.assignment().get_workload(owner).await?)?;
        }
        Command::ReconcileWorkloads => {
            let owners = engine.assignment().reconcile_workloads().await?;
            print_json(&serde_json::json!({ "owners_recomputed": owners }))?;
        }
        Command::RunScheduled => {
            let moved = engine.run_scheduled_transitions().await?;
            print_json(&serde_json::json!({ "moved": moved }))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use leadflow::rules::ConditionValue;

    use super::parse_override;

    #[test]
    fn overrides_are_typed() {
        assert_eq!(
            parse_override("lead_score=85").unwrap(),
            ("lead_score".to_string(), ConditionValue::Number(85.0))
        );
        assert_eq!(
            parse_override("email_opened=TRUE").unwrap(),
            ("email_opened".to_string(), ConditionValue::Bool(true))
        );
        assert_eq!(
            parse_override("country = US").unwrap(),
            ("country".to_string(), ConditionValue::String("US".to_string()))
        );
        assert!(parse_override("country").is_err());
        assert!(parse_override("=US").is_err());
    }
}
