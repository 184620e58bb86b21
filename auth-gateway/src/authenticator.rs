use crate::error::AuthResult;
use crate::method::AuthMethod;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The authenticated caller, attached to the request's extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
}

/// One authentication strategy.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn method(&self) -> AuthMethod;

    /// Verify a bearer credential.
    async fn authenticate(&self, credential: &str) -> AuthResult<Principal>;
}
