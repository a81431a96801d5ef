//! Append-only decision log for routing and lifecycle changes.
//!
//! One JSON object per line. With the hash chain enabled every line carries
//! the SHA-256 of the previous line's serialized entry, so edits or
//! deletions in the middle of the file are detectable.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::AuditConfig;

/// Kind of decision written to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ContactAssigned,
    ContactUnassigned,
    BulkAssigned,
    RuleRateLimited,
    LeadScored,
    StatusChanged,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContactAssigned => "contact_assigned",
            Self::ContactUnassigned => "contact_unassigned",
            Self::BulkAssigned => "bulk_assigned",
            Self::RuleRateLimited => "rule_rate_limited",
            Self::LeadScored => "lead_scored",
            Self::StatusChanged => "status_changed",
        }
    }
}

/// How the owner of a committed assignment was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Rule,
    Fallback,
    Manual,
}

/// Running totals embedded in every entry.
#[derive(Debug, Default, Clone, Serialize)]
struct Tallies {
    decisions: BTreeMap<&'static str, u64>,
    routed_by_rule: u64,
    routed_by_fallback: u64,
    routed_manually: u64,
}

#[derive(Debug, Serialize)]
struct Entry<'a> {
    ts: String,
    decision: &'static str,
    details: &'a serde_json::Value,
    tallies: &'a Tallies,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

#[derive(Default)]
struct ChainState {
    head: Option<String>,
    tallies: Tallies,
}

struct DecisionLog {
    path: PathBuf,
    hash_chain: bool,
    state: Mutex<ChainState>,
}

impl DecisionLog {
    fn new(path: PathBuf, hash_chain: bool) -> Self {
        Self {
            path,
            hash_chain,
            state: Mutex::new(ChainState::default()),
        }
    }

    fn count_route(&self, route: Route) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let slot = match route {
            Route::Rule => &mut state.tallies.routed_by_rule,
            Route::Fallback => &mut state.tallies.routed_by_fallback,
            Route::Manual => &mut state.tallies.routed_manually,
        };
        *slot += 1;
    }

    /// The chain head only advances once the line is on disk.
    fn append(&self, decision: Decision, details: &serde_json::Value) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(error = %e, "Decision log lock poisoned");
                return;
            }
        };
        *state.tallies.decisions.entry(decision.as_str()).or_default() += 1;

        let mut entry = Entry {
            ts: Utc::now().to_rfc3339(),
            decision: decision.as_str(),
            details,
            tallies: &state.tallies,
            prev_hash: state.head.as_deref(),
            hash: None,
        };
        let line = match seal(&mut entry, self.hash_chain) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize decision log entry");
                return;
            }
        };
        let hash = entry.hash.take();

        match append_line(&self.path, &line) {
            Ok(()) => {
                if hash.is_some() {
                    state.head = hash;
                }
            }
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Decision not written to audit log"
            ),
        }
    }
}

/// Serialize `entry`, first stamping it with the hash of its unhashed form.
fn seal(entry: &mut Entry<'_>, hash_chain: bool) -> serde_json::Result<String> {
    if hash_chain {
        let unhashed = serde_json::to_string(&*entry)?;
        entry.hash = Some(format!("{:x}", Sha256::digest(unhashed.as_bytes())));
    }
    serde_json::to_string(&*entry)
}

fn open_owner_only(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);
    let file = options.open(path)?;

    // A pre-existing file readable by others is never appended to.
    #[cfg(unix)]
    {
        let mode = file.metadata()?.permissions().mode() & 0o777;
        if mode != 0o600 {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("audit log has mode {mode:o}, expected 600"),
            ));
        }
    }
    Ok(file)
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = open_owner_only(path)?;
    writeln!(file, "{line}")
}

static LOG: OnceLock<DecisionLog> = OnceLock::new();

/// Install the process-wide decision log. Later calls are ignored.
pub fn init(config: &AuditConfig) {
    if config.enabled {
        let _ = LOG.set(DecisionLog::new(config.path.clone(), config.hash_chain));
    }
}

pub fn record(decision: Decision, details: serde_json::Value) {
    if let Some(log) = LOG.get() {
        log.append(decision, &details);
    }
}

pub fn count_route(route: Route) {
    if let Some(log) = LOG.get() {
        log.count_route(route);
    }
}

pub fn enabled() -> bool {
    LOG.get().is_some()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::{Value, json};

    use super::{Decision, DecisionLog, Route};

    fn lines(path: &std::path::Path) -> Vec<Value> {
        fs::read_to_string(path)
            .expect("read audit log")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    #[test]
    fn hash_chain_links_consecutive_decisions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("audit.jsonl");
        let log = DecisionLog::new(path.clone(), true);

        log.count_route(Route::Rule);
        log.append(Decision::ContactAssigned, &json!({"contact_id": "c-1"}));
        log.append(Decision::LeadScored, &json!({"contact_id": "c-1", "score": 25}));

        let entries = lines(&path);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].get("prev_hash").is_none());
        assert_eq!(entries[0]["decision"], "contact_assigned");
        assert_eq!(entries[0]["tallies"]["routed_by_rule"], 1);
        assert_eq!(entries[1]["prev_hash"], entries[0]["hash"]);
        assert_eq!(entries[1]["tallies"]["decisions"]["lead_scored"], 1);
    }

    #[test]
    fn unchained_entries_carry_no_hashes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plain.jsonl");
        let log = DecisionLog::new(path.clone(), false);
        log.append(Decision::RuleRateLimited, &json!({"rule_id": "r-1"}));
        log.append(Decision::RuleRateLimited, &json!({"rule_id": "r-1"}));

        let entries = lines(&path);
        assert!(entries.iter().all(|e| e.get("hash").is_none()));
        assert_eq!(entries[1]["tallies"]["decisions"]["rule_rate_limited"], 2);
    }

    #[cfg(unix)]
    #[test]
    fn refuses_existing_file_with_broad_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        fs::write(&path, "existing\n").expect("seed existing file");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");

        DecisionLog::new(path.clone(), false).append(Decision::ContactUnassigned, &json!({}));

        assert_eq!(fs::read_to_string(&path).expect("read"), "existing\n");
    }

    #[cfg(unix)]
    #[test]
    fn new_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit-new.jsonl");
        DecisionLog::new(path.clone(), false).append(Decision::StatusChanged, &json!({}));

        let mode = fs::metadata(&path).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
