//! Account registration and lookups backing the `/api/v1/accounts` routes.

use std::sync::Arc;

use nlq_db::{
    sql::is_valid_database_name, AccountError, AccountRecord, Credentials, Database,
    DatabaseProvisioner, NewAccount,
};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum AccountServiceError {
    #[error("{0}")]
    Invalid(String),
    #[error("an account with email '{0}' already exists")]
    Duplicate(String),
    #[error("User not found!")]
    NotFound,
    #[error("Invalid password!")]
    InvalidPassword,
    #[error("{0}")]
    Provisioning(String),
    #[error("{0}")]
    Internal(String),
}

impl From<anyhow::Error> for AccountServiceError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<AccountError>() {
            Ok(AccountError::DuplicateEmail(email)) => AccountServiceError::Duplicate(email),
            Ok(AccountError::NotFound(_)) => AccountServiceError::NotFound,
            Ok(AccountError::InvalidPassword) => AccountServiceError::InvalidPassword,
            Err(other) => AccountServiceError::Internal(other.to_string()),
        }
    }
}

/// Registration input as received on the wire.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub db_user: String,
    pub db_password: String,
    pub database_name: String,
}

impl Registration {
    fn validate(&self) -> Result<(), AccountServiceError> {
        let fields = [
            &self.username,
            &self.email,
            &self.password,
            &self.db_user,
            &self.db_password,
            &self.database_name,
        ];
        if fields.iter().any(|field| field.is_empty()) {
            return Err(AccountServiceError::Invalid("All fields are required!".into()));
        }
        if !is_valid_database_name(&self.database_name) {
            return Err(AccountServiceError::Invalid(format!(
                "invalid database name '{}'",
                self.database_name
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct AccountService {
    db: Database,
    provisioner: Arc<dyn DatabaseProvisioner>,
}

impl AccountService {
    pub fn new(db: Database, provisioner: Arc<dyn DatabaseProvisioner>) -> Self {
        Self { db, provisioner }
    }

    /// Creates the account's database with its own credentials, then stores the account.
    #[instrument(skip(self, registration), fields(email = %registration.email, database = %registration.database_name))]
    pub async fn register(
        &self,
        registration: Registration,
    ) -> Result<AccountRecord, AccountServiceError> {
        registration.validate()?;

        if self.db.find_account(&registration.email).await?.is_some() {
            return Err(AccountServiceError::Duplicate(registration.email));
        }

        let credentials = Credentials::new(&registration.db_user, &registration.db_password);
        self.provisioner
            .provision_database(&credentials, &registration.database_name)
            .await
            .map_err(|err| {
                warn!(error = %err, "database provisioning failed");
                AccountServiceError::Provisioning(err.message().to_string())
            })?;

        let record = self
            .db
            .create_account(NewAccount {
                username: &registration.username,
                email: &registration.email,
                password: &registration.password,
                db_user: &registration.db_user,
                db_password: &registration.db_password,
                database_name: &registration.database_name,
            })
            .await?;

        info!(account_id = %record.id, "account registered");
        Ok(record)
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AccountRecord, AccountServiceError> {
        if email.is_empty() || password.is_empty() {
            return Err(AccountServiceError::Invalid(
                "Email and password are required!".into(),
            ));
        }
        Ok(self.db.authenticate(email, password).await?)
    }

    pub async fn databases(&self, email: &str) -> Result<Vec<String>, AccountServiceError> {
        Ok(self.account(email).await?.databases)
    }

    pub async fn account(&self, email: &str) -> Result<AccountRecord, AccountServiceError> {
        if email.is_empty() {
            return Err(AccountServiceError::Invalid("Email is required!".into()));
        }
        self.db
            .find_account(email)
            .await?
            .ok_or(AccountServiceError::NotFound)
    }
}
