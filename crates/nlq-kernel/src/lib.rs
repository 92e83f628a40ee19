//! Natural-language query pipeline.
//!
//! [`QueryPipeline::run`] drives one request end to end: it validates the request,
//! resolves the account's database login, asks the completion service for a statement,
//! classifies it and executes it against the account's database. Every failure becomes
//! a [`PipelineOutcome::Failure`] tagged with the stage that produced it. Execution
//! failures are soft (reported beside the generated SQL); the other stages are hard.
//!
//! The generated statement runs exactly as the completion service wrote it. There is
//! no parameterisation or allow-listing; the only guard is the database login the
//! account supplied.

mod audit;
pub mod completion;
pub mod prompt;
pub mod translator;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use nlq_db::{
    Credentials, Database, EngineConnector, ExecutionError, ExecutionResult, StatementExecutor,
    StatementKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use audit::StatementAuditLog;

pub use audit::{AuditConfig, StatementEvent, StatementOutcome};
pub use completion::{CompletionService, GeminiClient, GeminiConfig, ServiceError};
pub use prompt::build_prompt;
pub use translator::{TranslationError, Translator};

/// Message used for unknown accounts, kept identical to the account endpoints.
pub const ACCOUNT_NOT_FOUND: &str = "User not found!";

/// Resolves an account identifier to the database login it owns.
#[async_trait]
pub trait AccountLookup: Send + Sync + 'static {
    async fn lookup(&self, account_id: &str) -> anyhow::Result<Option<Credentials>>;
}

#[async_trait]
impl AccountLookup for Database {
    async fn lookup(&self, account_id: &str) -> anyhow::Result<Option<Credentials>> {
        self.credentials_for(account_id).await
    }
}

/// Runtime knobs for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub completion_timeout: Duration,
    pub engine_timeout: Duration,
    pub audit: AuditConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            completion_timeout: completion::DEFAULT_COMPLETION_TIMEOUT,
            engine_timeout: nlq_db::executor::DEFAULT_ENGINE_TIMEOUT,
            audit: AuditConfig::default(),
        }
    }
}

/// Inbound request. Fields stay optional so missing ones are reported by the
/// pipeline as a validation failure instead of a decoding error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub account_id: Option<String>,
    pub target_database: Option<String>,
    pub natural_language_text: Option<String>,
}

impl TranslationRequest {
    pub fn new(
        account_id: impl Into<String>,
        target_database: impl Into<String>,
        natural_language_text: impl Into<String>,
    ) -> Self {
        Self {
            account_id: Some(account_id.into()),
            target_database: Some(target_database.into()),
            natural_language_text: Some(natural_language_text.into()),
        }
    }

    fn validate(&self) -> Result<ValidRequest<'_>, PipelineError> {
        fn present(field: &Option<String>) -> Option<&str> {
            field.as_deref().filter(|value| !value.is_empty())
        }

        match (
            present(&self.account_id),
            present(&self.target_database),
            present(&self.natural_language_text),
        ) {
            (Some(account_id), Some(target_database), Some(text)) => Ok(ValidRequest {
                account_id,
                target_database,
                text,
            }),
            _ => Err(PipelineError::Validation(
                "Email, database name, and query are required!".into(),
            )),
        }
    }
}

struct ValidRequest<'a> {
    account_id: &'a str,
    target_database: &'a str,
    text: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Validation,
    AccountLookup,
    Translation,
    Execution,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Validation => "validation",
            PipelineStage::AccountLookup => "account_lookup",
            PipelineStage::Translation => "translation",
            PipelineStage::Execution => "execution",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),
    #[error("{ACCOUNT_NOT_FOUND}")]
    AccountNotFound,
    #[error("account lookup failed: {0}")]
    AccountStore(anyhow::Error),
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl PipelineError {
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::Validation(_) => PipelineStage::Validation,
            PipelineError::AccountNotFound | PipelineError::AccountStore(_) => {
                PipelineStage::AccountLookup
            }
            PipelineError::Translation(_) => PipelineStage::Translation,
            PipelineError::Execution(_) => PipelineStage::Execution,
        }
    }

    /// Soft failures are reported inside a success-shaped envelope.
    pub fn is_soft(&self) -> bool {
        matches!(self, PipelineError::Execution(_))
    }
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Success {
        nl_query: String,
        sql_query: String,
        result: ExecutionResult,
    },
    Failure {
        stage: PipelineStage,
        error: PipelineError,
        /// Present once translation succeeded.
        sql_query: Option<String>,
    },
}

impl PipelineOutcome {
    fn failure(error: PipelineError, sql_query: Option<String>) -> Self {
        PipelineOutcome::Failure {
            stage: error.stage(),
            error,
            sql_query,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Success { .. })
    }

    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            PipelineOutcome::Success { .. } => None,
            PipelineOutcome::Failure { stage, .. } => Some(*stage),
        }
    }
}

/// Orchestrates lookup, translation and execution for one request at a time. Cheap to
/// clone; instances share no per-request state.
#[derive(Clone)]
pub struct QueryPipeline {
    accounts: Arc<dyn AccountLookup>,
    translator: Translator,
    executor: StatementExecutor,
    audit: Option<Arc<StatementAuditLog>>,
}

impl QueryPipeline {
    pub fn new(
        accounts: Arc<dyn AccountLookup>,
        completion: Arc<dyn CompletionService>,
        connector: Arc<dyn EngineConnector>,
        config: PipelineConfig,
    ) -> Self {
        let audit = if config.audit.enabled {
            match StatementAuditLog::try_new(&config.audit) {
                Ok(log) => Some(Arc::new(log)),
                Err(err) => {
                    warn!(error = %err, "failed to initialize statement audit log; disabling audits");
                    None
                }
            }
        } else {
            None
        };

        Self {
            accounts,
            translator: Translator::new(completion).with_timeout(config.completion_timeout),
            executor: StatementExecutor::new(connector).with_timeout(config.engine_timeout),
            audit,
        }
    }

    #[instrument(
        skip(self, request),
        fields(
            account_id = request.account_id.as_deref().unwrap_or(""),
            database = request.target_database.as_deref().unwrap_or("")
        )
    )]
    pub async fn run(&self, request: &TranslationRequest) -> PipelineOutcome {
        let request = match request.validate() {
            Ok(valid) => valid,
            Err(err) => return PipelineOutcome::failure(err, None),
        };

        let credentials = match self.accounts.lookup(request.account_id).await {
            Ok(Some(credentials)) => credentials,
            Ok(None) => return PipelineOutcome::failure(PipelineError::AccountNotFound, None),
            Err(err) => return PipelineOutcome::failure(PipelineError::AccountStore(err), None),
        };

        let prompt = build_prompt(request.target_database, request.text);
        let statement = match self.translator.translate(&prompt).await {
            Ok(statement) => statement,
            Err(err) => return PipelineOutcome::failure(err.into(), None),
        };

        let kind = statement.kind();
        info!(kind = kind.as_str(), sql = %statement, "statement generated");

        let executed = self
            .executor
            .execute(&credentials, request.target_database, &statement, kind)
            .await;

        self.record_audit(&request, statement.as_str(), kind, &executed)
            .await;

        match executed {
            Ok(result) => PipelineOutcome::Success {
                nl_query: request.text.to_owned(),
                sql_query: statement.into_inner(),
                result,
            },
            Err(err) => {
                warn!(error = %err, "statement execution failed");
                PipelineOutcome::failure(err.into(), Some(statement.into_inner()))
            }
        }
    }

    async fn record_audit(
        &self,
        request: &ValidRequest<'_>,
        sql_query: &str,
        kind: StatementKind,
        executed: &Result<ExecutionResult, ExecutionError>,
    ) {
        let Some(log) = self.audit.clone() else {
            return;
        };

        let outcome = match executed {
            Ok(ExecutionResult::RowSet(rows)) => StatementOutcome::Rows {
                row_count: rows.len(),
            },
            Ok(ExecutionResult::Effect { .. }) => StatementOutcome::Effect,
            Err(err) => StatementOutcome::Failed {
                error: err.to_string(),
            },
        };

        let event = StatementEvent::new(
            request.account_id,
            request.target_database,
            sql_query,
            kind,
            outcome,
        );
        if let Err(err) = log.append(&event).await {
            warn!(error = %err, "failed to append statement audit entry");
        }
    }
}
