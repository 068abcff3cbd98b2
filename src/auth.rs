use std::str::FromStr;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Actor, Role};
use crate::observability;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("missing user name")]
    Missing,
    #[error("user must look like role:ULID, got {0:?}")]
    Malformed(String),
    #[error("{0}")]
    Role(String),
    #[error("bad ULID in user name: {0}")]
    Id(String),
}

/// Parse a connection user name of the form `role:ULID`, e.g. `provider:01J...`.
pub fn parse_actor(user: &str) -> Result<Actor, IdentityError> {
    let user = user.trim();
    if user.is_empty() {
        return Err(IdentityError::Missing);
    }
    let (role, id) = user
        .split_once(':')
        .ok_or_else(|| IdentityError::Malformed(user.to_string()))?;
    let role = Role::from_str(role).map_err(IdentityError::Role)?;
    let id = Ulid::from_string(id).map_err(|e| IdentityError::Id(e.to_string()))?;
    Ok(Actor { id, role })
}

/// One shared password for every connection. The user name carries the identity and
/// must parse as an [`Actor`] before the password is even compared.
#[derive(Debug)]
pub struct SharedPasswordAuthSource {
    password: String,
}

impl SharedPasswordAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if let Err(e) = parse_actor(login.user().unwrap_or_default()) {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                e.to_string(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
