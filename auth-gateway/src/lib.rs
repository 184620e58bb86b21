//! Authentication for the ReBAC engine's HTTP surface.
//!
//! The configured method name selects one [`Authenticator`]:
//!
//! - `none`: requests pass through unauthenticated
//! - `preshared`: a bearer token must equal one of the configured keys
//! - `oidc`: a bearer token must be an RS256 JWT from the configured issuer
//!
//! [`require_authentication`] wires the chosen strategy into an axum router.
//!
//! # Example
//!
//! ```rust
//! use auth_gateway::{AuthMethod, AuthSettings};
//!
//! let settings = AuthSettings {
//!     method: "preshared".to_string(),
//!     preshared_keys: vec!["s3cret".to_string()],
//!     ..AuthSettings::default()
//! };
//! let authenticator = settings.build().unwrap().unwrap();
//! assert_eq!(authenticator.method(), AuthMethod::Preshared);
//! ```

pub mod authenticator;
pub mod error;
pub mod method;
pub mod middleware;
pub mod oidc;
pub mod preshared;

pub use authenticator::{Authenticator, Principal};
pub use error::{AuthError, AuthResult};
pub use method::AuthMethod;
pub use middleware::{bearer_token, require_authentication};
pub use oidc::OidcAuthenticator;
pub use preshared::PresharedKeyAuthenticator;

use std::sync::Arc;
use tracing::info;

/// Raw authentication options as they appear in the service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSettings {
    pub method: String,
    pub preshared_keys: Vec<String>,
    pub oidc_issuer: Option<String>,
    pub oidc_audience: Option<String>,
}

impl AuthSettings {
    /// Resolve the configured strategy; `None` when authentication is off.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidConfiguration`] for an unknown method name or for
    /// parameters the selected method cannot work with.
    pub fn build(&self) -> AuthResult<Option<Arc<dyn Authenticator>>> {
        let method: AuthMethod = self.method.parse()?;
        let authenticator: Arc<dyn Authenticator> = match method {
            AuthMethod::None => {
                info!("Authentication disabled");
                return Ok(None);
            }
            AuthMethod::Preshared => Arc::new(PresharedKeyAuthenticator::new(&self.preshared_keys)?),
            AuthMethod::Oidc => {
                let issuer = self.oidc_issuer.as_deref().ok_or_else(|| {
                    AuthError::InvalidConfiguration("oidc requires an issuer".to_string())
                })?;
                let audience = self.oidc_audience.as_deref().ok_or_else(|| {
                    AuthError::InvalidConfiguration("oidc requires an audience".to_string())
                })?;
                Arc::new(OidcAuthenticator::new(issuer, audience)?)
            }
        };
        info!(method = %method, "Authentication enabled");
        Ok(Some(authenticator))
    }
}
