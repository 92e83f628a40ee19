use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use nlq_db::StatementKind;
use serde::Serialize;
use sha2::Sha256;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_path: PathBuf,
    pub hmac_key: Option<Vec<u8>>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: PathBuf::from("./logs/statements.jsonl"),
            hmac_key: None,
        }
    }
}

/// Append-only JSONL record of every generated statement that reached the engine.
#[derive(Debug)]
pub(crate) struct StatementAuditLog {
    state: Arc<AuditLogState>,
}

#[derive(Debug)]
struct AuditLogState {
    path: PathBuf,
    hmac_key: Option<Vec<u8>>,
    lock: Mutex<()>,
}

impl StatementAuditLog {
    pub fn try_new(config: &AuditConfig) -> Result<Self> {
        if let Some(parent) = config.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating audit log directory {}", parent.display()))?;
        }

        Ok(Self {
            state: Arc::new(AuditLogState {
                path: config.log_path.clone(),
                hmac_key: config.hmac_key.clone(),
                lock: Mutex::new(()),
            }),
        })
    }

    pub async fn append(&self, event: &StatementEvent) -> Result<()> {
        let _guard = self.state.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.state.path)
            .await
            .with_context(|| format!("opening audit log {}", self.state.path.display()))?;

        let payload = serde_json::to_vec(event).context("serializing audit payload")?;
        let signature = match &self.state.hmac_key {
            Some(key) => {
                let mut mac = HmacSha256::new_from_slice(key)
                    .context("initializing HMAC for audit log entry")?;
                mac.update(&payload);
                Some(STANDARD_NO_PAD.encode(mac.finalize().into_bytes()))
            }
            None => None,
        };

        #[derive(Serialize)]
        struct AuditLine<'a> {
            #[serde(flatten)]
            event: &'a StatementEvent,
            #[serde(skip_serializing_if = "Option::is_none")]
            signature: Option<String>,
        }

        let line = AuditLine { event, signature };
        let mut encoded = serde_json::to_vec(&line).context("serializing audit line")?;
        encoded.push(b'\n');
        file.write_all(&encoded)
            .await
            .with_context(|| format!("writing audit log {}", self.state.path.display()))?;
        // tokio finishes file writes in the background; the line must reach the file before
        // the lock is released.
        file.flush()
            .await
            .with_context(|| format!("flushing audit log {}", self.state.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct StatementEvent {
    pub timestamp: DateTime<Utc>,
    pub account_id: String,
    pub database: String,
    pub sql_query: String,
    pub kind: StatementKind,
    #[serde(flatten)]
    pub outcome: StatementOutcome,
}

#[derive(Debug, Serialize, Clone)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StatementOutcome {
    Rows { row_count: usize },
    Effect,
    Failed { error: String },
}

impl StatementEvent {
    pub fn new(
        account_id: impl Into<String>,
        database: impl Into<String>,
        sql_query: impl Into<String>,
        kind: StatementKind,
        outcome: StatementOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            account_id: account_id.into(),
            database: database.into(),
            sql_query: sql_query.into(),
            kind,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event() -> StatementEvent {
        StatementEvent::new(
            "u1",
            "shop",
            "SELECT * FROM customers;",
            StatementKind::Read,
            StatementOutcome::Rows { row_count: 2 },
        )
    }

    #[tokio::test]
    async fn writes_signed_entries() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("statements.jsonl");
        let config = AuditConfig {
            enabled: true,
            log_path: path.clone(),
            hmac_key: Some(b"super-secret".to_vec()),
        };

        let log = StatementAuditLog::try_new(&config).unwrap();
        let event = event();
        log.append(&event).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let line = contents.lines().next().unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["outcome"], "rows");
        assert_eq!(value["row_count"], 2);
        assert_eq!(value["kind"], "read");

        let signature = value["signature"].as_str().unwrap();
        let mut mac = HmacSha256::new_from_slice(b"super-secret").unwrap();
        mac.update(&serde_json::to_vec(&event).unwrap());
        let expected = STANDARD_NO_PAD.encode(mac.finalize().into_bytes());
        assert_eq!(signature, expected);
    }

    #[tokio::test]
    async fn appends_unsigned_failures() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("statements.jsonl");
        let config = AuditConfig {
            enabled: true,
            log_path: path.clone(),
            hmac_key: None,
        };

        let log = StatementAuditLog::try_new(&config).unwrap();
        log.append(&event()).await.unwrap();
        log.append(&StatementEvent::new(
            "u1",
            "shop",
            "DROP TABLE customers",
            StatementKind::Write,
            StatementOutcome::Failed {
                error: "1142 (42000): DROP command denied".into(),
            },
        ))
        .await
        .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].get("signature").is_none());
        assert_eq!(lines[1]["outcome"], "failed");
        assert_eq!(lines[1]["error"], "1142 (42000): DROP command denied");
    }

    #[tokio::test]
    async fn back_to_back_appends_are_readable_immediately() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("statements.jsonl");
        let log = StatementAuditLog::try_new(&AuditConfig {
            enabled: true,
            log_path: path.clone(),
            hmac_key: None,
        })
        .unwrap();

        let long_query = format!("SELECT '{}'", "x".repeat(20_000));
        for round in 1..=50 {
            for _ in 0..2 {
                log.append(&StatementEvent::new(
                    "u1",
                    "shop",
                    long_query.as_str(),
                    StatementKind::Read,
                    StatementOutcome::Rows { row_count: 1 },
                ))
                .await
                .unwrap();
            }

            let contents = tokio::fs::read_to_string(&path).await.unwrap();
            let lines: Vec<&str> = contents.lines().collect();
            assert_eq!(lines.len(), round * 2, "round {round}");
            for line in lines {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                assert_eq!(value["sql_query"], long_query.as_str());
            }
        }
    }
}
