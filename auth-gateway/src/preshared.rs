use crate::authenticator::{Authenticator, Principal};
use crate::error::{AuthError, AuthResult};
use crate::method::AuthMethod;
use async_trait::async_trait;
use subtle::{Choice, ConstantTimeEq};

/// Accepts any of a fixed set of shared secrets.
pub struct PresharedKeyAuthenticator {
    keys: Vec<Vec<u8>>,
}

impl PresharedKeyAuthenticator {
    /// # Errors
    ///
    /// The key list must be non-empty and contain no empty keys.
    pub fn new(keys: &[String]) -> AuthResult<Self> {
        if keys.is_empty() {
            return Err(AuthError::InvalidConfiguration(
                "preshared authentication requires at least one key".to_string(),
            ));
        }
        if keys.iter().any(|key| key.is_empty()) {
            return Err(AuthError::InvalidConfiguration(
                "preshared keys must not be empty".to_string(),
            ));
        }
        Ok(Self {
            keys: keys.iter().map(|key| key.as_bytes().to_vec()).collect(),
        })
    }
}

#[async_trait]
impl Authenticator for PresharedKeyAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::Preshared
    }

    async fn authenticate(&self, credential: &str) -> AuthResult<Principal> {
        // compare against every key so timing does not reveal which one matched
        let matched = self
            .keys
            .iter()
            .fold(Choice::from(0), |acc, key| acc | key.ct_eq(credential.as_bytes()));

        if bool::from(matched) {
            Ok(Principal {
                subject: "preshared".to_string(),
            })
        } else {
            Err(AuthError::InvalidCredential)
        }
    }
}
