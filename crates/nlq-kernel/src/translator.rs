use std::{sync::Arc, time::Duration};

use nlq_db::CandidateStatement;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::completion::{CompletionService, ServiceError, DEFAULT_COMPLETION_TIMEOUT};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranslationError {
    #[error("translation service unavailable: {0}")]
    ServiceUnavailable(ServiceError),
}

/// Prompt → completion → sanitized statement. No retries and no fallback statement.
#[derive(Clone)]
pub struct Translator {
    service: Arc<dyn CompletionService>,
    timeout: Duration,
}

impl Translator {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self {
            service,
            timeout: DEFAULT_COMPLETION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[instrument(skip(self, prompt), fields(service = self.service.name()))]
    pub async fn translate(&self, prompt: &str) -> Result<CandidateStatement, TranslationError> {
        let raw = tokio::time::timeout(self.timeout, self.service.complete(prompt))
            .await
            .map_err(|_| ServiceError::TimedOut(self.timeout))
            .and_then(|completion| completion)
            .map_err(|err| {
                warn!(error = %err, "completion call failed");
                TranslationError::ServiceUnavailable(err)
            })?;

        Ok(CandidateStatement::sanitize(&raw))
    }
}
