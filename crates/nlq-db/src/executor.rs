//! Runs candidate statements against an account owner's database.
//!
//! Every call opens its own connection through an [`EngineConnector`] and releases it
//! before returning, whatever the outcome. Reads are materialised into column-keyed
//! rows; writes are committed and reported as an effect confirmation.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::sql::{CandidateStatement, StatementKind};

/// Default bound on a single engine round trip.
pub const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(30);

/// Confirmation returned for statements that do not produce rows.
pub const WRITE_CONFIRMATION: &str = "Query executed successfully";

/// One result row keyed by the column names reported by the engine.
pub type Row = Map<String, Value>;

/// Per-invocation database login. Never persisted by the executor.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub db_user: String,
    pub db_password: String,
}

impl Credentials {
    pub fn new(db_user: impl Into<String>, db_password: impl Into<String>) -> Self {
        Self {
            db_user: db_user.into(),
            db_password: db_password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("db_user", &self.db_user)
            .field("db_password", &"***")
            .finish()
    }
}

/// Shaped outcome of a statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExecutionResult {
    RowSet(Vec<Row>),
    Effect { message: String },
}

impl ExecutionResult {
    pub fn effect() -> Self {
        ExecutionResult::Effect {
            message: WRITE_CONFIRMATION.to_string(),
        }
    }

    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            ExecutionResult::RowSet(rows) => Some(rows),
            ExecutionResult::Effect { .. } => None,
        }
    }
}

/// Execution failures carry the engine's message verbatim.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("{0}")]
    ConnectionFailed(String),
    #[error("{0}")]
    StatementFailed(String),
}

impl ExecutionError {
    pub fn message(&self) -> &str {
        match self {
            ExecutionError::ConnectionFailed(message) | ExecutionError::StatementFailed(message) => {
                message
            }
        }
    }
}

/// Error raised by an engine connector or session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn timed_out(operation: &str, limit: Duration) -> Self {
        Self::new(format!(
            "{operation} timed out after {}ms",
            limit.as_millis()
        ))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Opens connections to a named database on behalf of an account.
#[async_trait]
pub trait EngineConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        credentials: &Credentials,
        database: &str,
    ) -> Result<Box<dyn EngineSession>, EngineError>;
}

/// A single open connection. Writes are only persisted by [`EngineSession::commit`].
#[async_trait]
pub trait EngineSession: Send {
    /// Runs a statement and returns every row in engine order.
    async fn fetch_rows(&mut self, statement: &str) -> Result<Vec<Row>, EngineError>;
    /// Runs a statement and returns the affected row count.
    async fn execute(&mut self, statement: &str) -> Result<u64, EngineError>;
    async fn commit(&mut self) -> Result<(), EngineError>;
    async fn close(self: Box<Self>) -> Result<(), EngineError>;
}

/// Creates databases for newly registered accounts.
#[async_trait]
pub trait DatabaseProvisioner: Send + Sync + 'static {
    async fn provision_database(
        &self,
        credentials: &Credentials,
        database: &str,
    ) -> Result<(), EngineError>;
}

#[derive(Clone)]
pub struct StatementExecutor {
    connector: Arc<dyn EngineConnector>,
    timeout: Duration,
}

impl StatementExecutor {
    pub fn new(connector: Arc<dyn EngineConnector>) -> Self {
        Self {
            connector,
            timeout: DEFAULT_ENGINE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(skip(self, credentials, statement, kind), fields(kind = kind.as_str()))]
    pub async fn execute(
        &self,
        credentials: &Credentials,
        database: &str,
        statement: &CandidateStatement,
        kind: StatementKind,
    ) -> Result<ExecutionResult, ExecutionError> {
        let mut session = bounded(
            "connect",
            self.timeout,
            self.connector.connect(credentials, database),
        )
        .await
        .map_err(|err| ExecutionError::ConnectionFailed(err.message))?;

        let outcome = self.run(session.as_mut(), statement, kind).await;

        if let Err(err) = bounded("close", self.timeout, session.close()).await {
            warn!(database, error = %err, "failed to close engine connection");
        }

        outcome.map_err(|err| ExecutionError::StatementFailed(err.message))
    }

    async fn run(
        &self,
        session: &mut dyn EngineSession,
        statement: &CandidateStatement,
        kind: StatementKind,
    ) -> Result<ExecutionResult, EngineError> {
        match kind {
            StatementKind::Read => {
                let rows =
                    bounded("statement", self.timeout, session.fetch_rows(statement.as_str()))
                        .await?;
                debug!(rows = rows.len(), "read statement materialised");
                Ok(ExecutionResult::RowSet(rows))
            }
            StatementKind::Write => {
                let affected =
                    bounded("statement", self.timeout, session.execute(statement.as_str()))
                        .await?;
                bounded("commit", self.timeout, session.commit()).await?;
                debug!(affected, "write statement committed");
                Ok(ExecutionResult::effect())
            }
        }
    }
}

async fn bounded<T, F>(operation: &str, limit: Duration, future: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| EngineError::timed_out(operation, limit))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Connect { user: String, database: String },
        Fetch(String),
        Execute(String),
        Commit,
        Close,
    }

    #[derive(Default)]
    struct FakeEngine {
        calls: Arc<Mutex<Vec<Call>>>,
        rows: Vec<Row>,
        fail_connect: Option<String>,
        stall_connect: bool,
        fail_statement: Option<String>,
        stall_statement: bool,
        fail_commit: Option<String>,
    }

    struct FakeSession {
        calls: Arc<Mutex<Vec<Call>>>,
        rows: Vec<Row>,
        fail_statement: Option<String>,
        stall_statement: bool,
        fail_commit: Option<String>,
    }

    impl FakeSession {
        async fn statement(&mut self, call: Call) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push(call);
            if self.stall_statement {
                futures::future::pending::<()>().await;
            }
            match &self.fail_statement {
                Some(message) => Err(EngineError::new(message.clone())),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl EngineConnector for FakeEngine {
        async fn connect(
            &self,
            credentials: &Credentials,
            database: &str,
        ) -> Result<Box<dyn EngineSession>, EngineError> {
            self.calls.lock().unwrap().push(Call::Connect {
                user: credentials.db_user.clone(),
                database: database.to_string(),
            });
            if self.stall_connect {
                futures::future::pending::<()>().await;
            }
            if let Some(message) = &self.fail_connect {
                return Err(EngineError::new(message.clone()));
            }
            Ok(Box::new(FakeSession {
                calls: self.calls.clone(),
                rows: self.rows.clone(),
                fail_statement: self.fail_statement.clone(),
                stall_statement: self.stall_statement,
                fail_commit: self.fail_commit.clone(),
            }))
        }
    }

    #[async_trait]
    impl EngineSession for FakeSession {
        async fn fetch_rows(&mut self, statement: &str) -> Result<Vec<Row>, EngineError> {
            self.statement(Call::Fetch(statement.to_string())).await?;
            Ok(self.rows.clone())
        }

        async fn execute(&mut self, statement: &str) -> Result<u64, EngineError> {
            self.statement(Call::Execute(statement.to_string())).await?;
            Ok(1)
        }

        async fn commit(&mut self) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push(Call::Commit);
            match &self.fail_commit {
                Some(message) => Err(EngineError::new(message.clone())),
                None => Ok(()),
            }
        }

        async fn close(self: Box<Self>) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push(Call::Close);
            Ok(())
        }
    }

    fn customer_rows() -> Vec<Row> {
        [(1, "Ada", "ada@example.com"), (2, "Linus", "linus@example.com")]
            .into_iter()
            .map(|(id, name, email)| {
                json!({ "id": id, "name": name, "email": email })
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect()
    }

    fn executor(engine: FakeEngine) -> (StatementExecutor, Arc<Mutex<Vec<Call>>>) {
        let calls = engine.calls.clone();
        (StatementExecutor::new(Arc::new(engine)), calls)
    }

    fn credentials() -> Credentials {
        Credentials::new("root", "secret")
    }

    #[tokio::test]
    async fn read_returns_rows_and_closes_without_commit() {
        let (executor, calls) = executor(FakeEngine {
            rows: customer_rows(),
            ..FakeEngine::default()
        });
        let statement = CandidateStatement::sanitize("SELECT * FROM customers;");

        let result = executor
            .execute(&credentials(), "shop", &statement, StatementKind::Read)
            .await
            .unwrap();

        let rows = result.rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.len() == 3));
        assert_eq!(rows[0]["name"], "Ada");
        assert_eq!(
            rows[1].keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["id", "name", "email"]
        );

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                Call::Connect {
                    user: "root".into(),
                    database: "shop".into()
                },
                Call::Fetch("SELECT * FROM customers;".into()),
                Call::Close,
            ]
        );
    }

    #[tokio::test]
    async fn read_with_no_rows_is_an_empty_row_set() {
        let (executor, _) = executor(FakeEngine::default());
        let statement = CandidateStatement::sanitize("select * from empty");
        let result = executor
            .execute(&credentials(), "shop", &statement, StatementKind::Read)
            .await
            .unwrap();
        assert_eq!(result, ExecutionResult::RowSet(Vec::new()));
    }

    #[tokio::test]
    async fn write_commits_then_closes() {
        let (executor, calls) = executor(FakeEngine::default());
        let statement = CandidateStatement::sanitize("UPDATE t SET x = 1");

        let result = executor
            .execute(&credentials(), "shop", &statement, StatementKind::Write)
            .await
            .unwrap();

        assert_eq!(result, ExecutionResult::effect());
        let calls = calls.lock().unwrap();
        assert_eq!(
            calls[1..].to_vec(),
            vec![
                Call::Execute("UPDATE t SET x = 1".into()),
                Call::Commit,
                Call::Close
            ]
        );
    }

    #[tokio::test]
    async fn statement_failure_still_closes_connection() {
        let message = "1142 (42000): DELETE command denied to user 'ro'@'localhost'";
        let (executor, calls) = executor(FakeEngine {
            fail_statement: Some(message.into()),
            ..FakeEngine::default()
        });
        let statement = CandidateStatement::sanitize("DELETE FROM t");

        let err = executor
            .execute(&credentials(), "shop", &statement, StatementKind::Write)
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionError::StatementFailed(message.into()));
        let calls = calls.lock().unwrap();
        assert!(!calls.contains(&Call::Commit));
        assert_eq!(calls.last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn connect_failure_is_reported_verbatim() {
        let (executor, calls) = executor(FakeEngine {
            fail_connect: Some("1045 (28000): Access denied for user 'root'".into()),
            ..FakeEngine::default()
        });
        let statement = CandidateStatement::sanitize("SELECT 1");

        let err = executor
            .execute(&credentials(), "shop", &statement, StatementKind::Read)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ExecutionError::ConnectionFailed("1045 (28000): Access denied for user 'root'".into())
        );
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stalled_statement_times_out_and_closes() {
        let (executor, calls) = executor(FakeEngine {
            stall_statement: true,
            ..FakeEngine::default()
        });
        let executor = executor.with_timeout(Duration::from_millis(20));
        let statement = CandidateStatement::sanitize("SELECT SLEEP(100)");

        let err = executor
            .execute(&credentials(), "shop", &statement, StatementKind::Read)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::StatementFailed(ref m) if m.contains("timed out")));
        assert_eq!(calls.lock().unwrap().last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn stalled_connect_times_out_as_connection_failure() {
        let (executor, calls) = executor(FakeEngine {
            stall_connect: true,
            ..FakeEngine::default()
        });
        let executor = executor.with_timeout(Duration::from_millis(20));
        let statement = CandidateStatement::sanitize("SELECT 1");

        let err = executor
            .execute(&credentials(), "shop", &statement, StatementKind::Read)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::ConnectionFailed(ref m) if m.contains("connect timed out")));
        // No session was ever handed out, so there is nothing to close.
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commit_failure_is_a_statement_failure_and_closes() {
        let message = "1180 (HY000): Got error 5 during COMMIT";
        let (executor, calls) = executor(FakeEngine {
            fail_commit: Some(message.into()),
            ..FakeEngine::default()
        });
        let statement = CandidateStatement::sanitize("INSERT INTO t VALUES (1)");

        let err = executor
            .execute(&credentials(), "shop", &statement, StatementKind::Write)
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionError::StatementFailed(message.into()));
        let calls = calls.lock().unwrap();
        assert_eq!(
            calls[1..].to_vec(),
            vec![
                Call::Execute("INSERT INTO t VALUES (1)".into()),
                Call::Commit,
                Call::Close
            ]
        );
    }

    #[test]
    fn credentials_debug_hides_password() {
        let rendered = format!("{:?}", credentials());
        assert!(rendered.contains("root"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn results_serialise_like_the_wire_contract() {
        let effect = serde_json::to_value(ExecutionResult::effect()).unwrap();
        assert_eq!(effect, json!({ "message": "Query executed successfully" }));

        let rows = serde_json::to_value(ExecutionResult::RowSet(customer_rows())).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);
    }
}
