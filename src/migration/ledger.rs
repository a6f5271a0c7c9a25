use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::guest::{GuestId, GuestKind};
use crate::errors::LedgerError;
use crate::scheduler::{MoveReason, ProposedMove};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Proposed,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl MigrationStatus {
    pub fn can_transition(self, to: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, to),
            (Proposed, Executing) | (Proposed, Skipped) | (Executing, Completed) | (Executing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Skipped
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationStatus::Proposed => "proposed",
            MigrationStatus::Executing => "executing",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(MigrationStatus::Proposed),
            "executing" => Ok(MigrationStatus::Executing),
            "completed" => Ok(MigrationStatus::Completed),
            "failed" => Ok(MigrationStatus::Failed),
            "skipped" => Ok(MigrationStatus::Skipped),
            other => Err(format!("unknown migration status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: u64,
    pub pass_id: Uuid,
    pub guest: GuestId,
    pub guest_name: String,
    pub kind: GuestKind,
    pub source: String,
    pub target: String,
    pub reason: MoveReason,
    pub status: MigrationStatus,
    pub dry_run: bool,
    pub proposed_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    records: BTreeMap<u64, MigrationRecord>,
    next_id: u64,
}

/// Append-only history of relocations, optionally mirrored to a JSON-lines journal.
#[derive(Debug)]
pub struct MigrationLedger {
    inner: RwLock<LedgerInner>,
    journal: Option<PathBuf>,
}

impl Default for MigrationLedger {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl MigrationLedger {
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(LedgerInner {
                records: BTreeMap::new(),
                next_id: 1,
            }),
            journal: None,
        }
    }

    /// Opens a journal-backed ledger, replaying existing entries. Later lines win.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let mut records = BTreeMap::new();
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                for (line_no, line) in raw.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let record: MigrationRecord = serde_json::from_str(line).map_err(|e| {
                        LedgerError::Journal(format!("{} line {}: {}", path.display(), line_no + 1, e))
                    })?;
                    records.insert(record.id, record);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LedgerError::Journal(e.to_string())),
        }
        let next_id = records.keys().next_back().map(|id| id + 1).unwrap_or(1);
        info!(path = %path.display(), records = records.len(), "Migration ledger opened");
        Ok(Self {
            inner: RwLock::new(LedgerInner { records, next_id }),
            journal: Some(path.to_path_buf()),
        })
    }

    async fn append(&self, record: &MigrationRecord) -> Result<(), LedgerError> {
        let Some(path) = &self.journal else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerError::Journal(e.to_string()))?;
        }
        let mut line = serde_json::to_string(record).map_err(|e| LedgerError::Journal(e.to_string()))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| LedgerError::Journal(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| LedgerError::Journal(e.to_string()))?;
        file.flush().await.map_err(|e| LedgerError::Journal(e.to_string()))
    }

    pub async fn record_proposed(
        &self,
        pass_id: Uuid,
        proposed: &ProposedMove,
        dry_run: bool,
    ) -> Result<MigrationRecord, LedgerError> {
        let mut inner = self.inner.write().await;
        let record = MigrationRecord {
            id: inner.next_id,
            pass_id,
            guest: proposed.guest,
            guest_name: proposed.guest_name.clone(),
            kind: proposed.kind,
            source: proposed.source.clone(),
            target: proposed.target.clone(),
            reason: proposed.reason,
            status: MigrationStatus::Proposed,
            dry_run,
            proposed_at: Utc::now(),
            executed_at: None,
            completed_at: None,
            error: None,
        };
        self.append(&record).await?;
        inner.next_id += 1;
        inner.records.insert(record.id, record.clone());
        debug!(id = record.id, guest = %record.guest_name, "Migration proposed");
        Ok(record)
    }

    pub async fn transition(
        &self,
        id: u64,
        to: MigrationStatus,
        error: Option<String>,
    ) -> Result<MigrationRecord, LedgerError> {
        let mut inner = self.inner.write().await;
        let current = inner.records.get(&id).ok_or(LedgerError::NotFound(id))?;
        if !current.status.can_transition(to) {
            warn!(id, from = %current.status, to = %to, "Rejected ledger transition");
            return Err(LedgerError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }

        let mut updated = current.clone();
        let now = Utc::now();
        updated.status = to;
        match to {
            MigrationStatus::Executing => updated.executed_at = Some(now),
            _ if to.is_terminal() => updated.completed_at = Some(now),
            _ => {}
        }
        if error.is_some() {
            updated.error = error;
        }

        self.append(&updated).await?;
        inner.records.insert(id, updated.clone());
        debug!(id, status = %to, "Migration transitioned");
        Ok(updated)
    }

    pub async fn get(&self, id: u64) -> Result<MigrationRecord, LedgerError> {
        self.inner
            .read()
            .await
            .records
            .get(&id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))
    }

    /// Newest first.
    pub async fn list(&self, status: Option<MigrationStatus>, limit: Option<usize>) -> Vec<MigrationRecord> {
        let inner = self.inner.read().await;
        inner
            .records
            .values()
            .rev()
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub async fn for_pass(&self, pass_id: Uuid) -> Vec<MigrationRecord> {
        let inner = self.inner.read().await;
        inner
            .records
            .values()
            .filter(|r| r.pass_id == pass_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
