//! MySQL engine access via `sqlx`.
//!
//! Statements are sent as plain text queries (not prepared), so every column arrives in
//! MySQL's text encoding and can be rendered generically from the column metadata.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Number, Value};
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow},
    Column, ConnectOptions, Connection, Executor, Row as _, TypeInfo, ValueRef,
};
use tracing::{debug, info, warn};

use crate::{
    executor::{
        Credentials, DatabaseProvisioner, EngineConnector, EngineError, EngineSession, Row,
    },
    sql::is_valid_database_name,
};

pub const DEFAULT_MYSQL_HOST: &str = "localhost";
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Opens one MySQL connection per call on a fixed host.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    host: String,
    port: u16,
}

impl Default for MySqlConnector {
    fn default() -> Self {
        Self::new(DEFAULT_MYSQL_HOST, DEFAULT_MYSQL_PORT)
    }
}

impl MySqlConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn options(&self, credentials: &Credentials) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&credentials.db_user)
            .password(&credentials.db_password)
            .disable_statement_logging()
    }
}

#[async_trait]
impl EngineConnector for MySqlConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
        database: &str,
    ) -> Result<Box<dyn EngineSession>, EngineError> {
        let options = self.options(credentials).database(database);
        let mut conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(engine_error)?;

        // Writes must only land on explicit commit; closing without one discards them.
        if let Err(err) = conn.execute("SET autocommit = 0").await {
            if let Err(close_err) = conn.close().await {
                warn!(database, error = %close_err, "failed to close mysql session");
            }
            return Err(engine_error(err));
        }

        debug!(host = %self.host, database, "mysql session opened");
        Ok(Box::new(MySqlSession { conn }))
    }
}

#[async_trait]
impl DatabaseProvisioner for MySqlConnector {
    async fn provision_database(
        &self,
        credentials: &Credentials,
        database: &str,
    ) -> Result<(), EngineError> {
        if !is_valid_database_name(database) {
            return Err(EngineError::new(format!(
                "invalid database name '{database}'"
            )));
        }

        let mut conn = MySqlConnection::connect_with(&self.options(credentials))
            .await
            .map_err(engine_error)?;
        let outcome = conn
            .execute(format!("CREATE DATABASE IF NOT EXISTS `{database}`").as_str())
            .await
            .map(|_| ())
            .map_err(engine_error);
        conn.close().await.map_err(engine_error)?;

        if outcome.is_ok() {
            info!(database, "database provisioned");
        }
        outcome
    }
}

struct MySqlSession {
    conn: MySqlConnection,
}

#[async_trait]
impl EngineSession for MySqlSession {
    async fn fetch_rows(&mut self, statement: &str) -> Result<Vec<Row>, EngineError> {
        let rows = self
            .conn
            .fetch_all(statement)
            .await
            .map_err(engine_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&mut self, statement: &str) -> Result<u64, EngineError> {
        let done = self.conn.execute(statement).await.map_err(engine_error)?;
        Ok(done.rows_affected())
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        self.conn.execute("COMMIT").await.map_err(engine_error)?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), EngineError> {
        self.conn.close().await.map_err(engine_error)
    }
}

/// Database errors keep MySQL's own `<code> (<state>): <message>` rendering.
fn engine_error(err: sqlx::Error) -> EngineError {
    match err {
        sqlx::Error::Database(db_err) => EngineError::new(db_err.to_string()),
        other => EngineError::new(other.to_string()),
    }
}

fn decode_row(row: &MySqlRow) -> Result<Row, EngineError> {
    let mut out = Row::new();
    for column in row.columns() {
        let value = decode_value(row, column.ordinal(), column.type_info().name())
            .map_err(|err| {
                EngineError::new(format!(
                    "failed to decode column '{}': {err}",
                    column.name()
                ))
            })?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn decode_value(row: &MySqlRow, index: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            Value::from(row.try_get_unchecked::<i64, _>(index)?)
        }
        name if name.ends_with("UNSIGNED") => {
            Value::from(row.try_get_unchecked::<u64, _>(index)?)
        }
        "FLOAT" | "DOUBLE" => Number::from_f64(row.try_get_unchecked::<f64, _>(index)?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "JSON" => {
            let text = row.try_get_unchecked::<String, _>(index)?;
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        }
        _ => match row.try_get_unchecked::<String, _>(index) {
            Ok(text) => Value::String(text),
            Err(_) => Value::String(STANDARD.encode(row.try_get_unchecked::<Vec<u8>, _>(index)?)),
        },
    };
    Ok(value)
}
