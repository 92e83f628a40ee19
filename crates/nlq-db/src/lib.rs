//! NLQ persistence and engine access.
//!
//! The crate holds two concerns: the account store (an async `sqlx` SQLite catalog of
//! registered users, their login hashes and the database credentials they own) and the
//! execution side that runs generated statements against those owned databases.

pub mod cipher;
pub mod executor;
pub mod mysql;
pub mod password;
pub mod sql;

use std::{path::Path, str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

pub use cipher::{CipherError, CredentialCipher};
pub use executor::{
    Credentials, DatabaseProvisioner, EngineConnector, EngineError, EngineSession,
    ExecutionError, ExecutionResult, StatementExecutor,
};
pub use mysql::MySqlConnector;
pub use sql::{classify, CandidateStatement, StatementKind};

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Account store handle.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
    cipher: Option<Arc<CredentialCipher>>,
    password_cost: u32,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///var/lib/nlq/accounts.db`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            cipher: None,
            password_cost: password::BCRYPT_COST,
        })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    /// Seals database passwords written from now on. Rows stored without a key keep
    /// working.
    pub fn with_cipher(mut self, cipher: CredentialCipher) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    /// Overrides the bcrypt cost for passwords hashed from now on.
    pub fn with_password_cost(mut self, cost: u32) -> Self {
        self.password_cost = cost;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persists a new account. The login password is hashed; the database password is
    /// sealed when a cipher is configured.
    #[instrument(skip(self, data), fields(email = %data.email))]
    pub async fn create_account(&self, data: NewAccount<'_>) -> Result<AccountRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let password_hash = password::hash_password(data.password, self.password_cost).await?;
        let db_password = match &self.cipher {
            Some(cipher) => cipher.encrypt(data.db_password)?,
            None => data.db_password.to_owned(),
        };
        let databases = serde_json::to_string(&[data.database_name])?;

        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, username, email, password_hash,
                db_user, db_password, databases, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(data.username)
        .bind(data.email)
        .bind(password_hash)
        .bind(data.db_user)
        .bind(db_password)
        .bind(databases)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                anyhow::Error::new(AccountError::DuplicateEmail(data.email.to_owned()))
            } else {
                err.into()
            }
        })?;

        info!(account_id = %id, "account created");
        self.find_account(data.email).await?.ok_or_else(|| {
            anyhow!(
                "account inserted but missing when reloaded (email={})",
                data.email
            )
        })
    }

    /// Retrieves an account by its login email.
    pub async fn find_account(&self, email: &str) -> Result<Option<AccountRecord>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| map_account(&row)).transpose()
    }

    /// Checks a login. Unknown emails and wrong passwords are distinct
    /// [`AccountError`]s wrapped in the returned error.
    #[instrument(skip(self, password))]
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<AccountRecord> {
        let row = sqlx::query("SELECT * FROM accounts WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AccountError::NotFound(email.to_owned()))?;

        let hash: String = row.try_get("password_hash")?;
        if !password::verify_password(password, &hash).await? {
            return Err(AccountError::InvalidPassword.into());
        }
        map_account(&row)
    }

    /// Resolves the database login an account owns, or `None` for unknown accounts.
    #[instrument(skip(self))]
    pub async fn credentials_for(&self, email: &str) -> Result<Option<Credentials>> {
        let row = sqlx::query("SELECT db_user, db_password FROM accounts WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let db_user: String = row.try_get("db_user")?;
        let stored: String = row.try_get("db_password")?;
        let db_password = match &self.cipher {
            Some(cipher) => cipher
                .decrypt(&stored)
                .context("failed to unseal stored database password")?,
            None if CredentialCipher::is_sealed(&stored) => {
                return Err(anyhow!(
                    "stored database password is sealed but no credential key is configured"
                ));
            }
            None => stored,
        };

        Ok(Some(Credentials {
            db_user,
            db_password,
        }))
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn map_account(row: &SqliteRow) -> Result<AccountRecord> {
    let id: String = row.try_get("id")?;
    let databases: String = row.try_get("databases")?;

    Ok(AccountRecord {
        id: Uuid::parse_str(&id)?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        db_user: row.try_get("db_user")?,
        databases: serde_json::from_str(&databases)
            .context("failed to deserialize account databases JSON")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}

/// Errors returned by the account store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountError {
    #[error("an account with email '{0}' already exists")]
    DuplicateEmail(String),
    #[error("account '{0}' not found")]
    NotFound(String),
    #[error("invalid password")]
    InvalidPassword,
}

/// Registration payload.
#[derive(Debug, Clone)]
pub struct NewAccount<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password: &'a str,
    pub db_user: &'a str,
    pub db_password: &'a str,
    pub database_name: &'a str,
}

/// Persisted account row. Secrets never leave the store through this type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountRecord {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub db_user: String,
    pub databases: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
