//! OpenID Connect bearer token verification.

use crate::authenticator::{Authenticator, Principal};
use crate::error::{AuthError, AuthResult};
use crate::method::AuthMethod;
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, jwk::JwkSet, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// How long a fetched key set is trusted before it is fetched again.
const JWKS_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Verifies RS256 tokens issued by one OIDC provider for one audience.
///
/// Signing keys are discovered through the issuer's
/// `/.well-known/openid-configuration` on first use and cached; an unknown
/// key id forces a refresh so provider key rotation is picked up.
pub struct OidcAuthenticator {
    issuer: Url,
    audience: String,
    client: reqwest::Client,
    jwks: RwLock<Option<(Instant, JwkSet)>>,
}

impl OidcAuthenticator {
    /// # Errors
    ///
    /// The issuer must be an absolute http(s) URL with a host and the
    /// audience must be non-empty.
    pub fn new(issuer: &str, audience: &str) -> AuthResult<Self> {
        let issuer = Url::parse(issuer)
            .map_err(|e| AuthError::InvalidConfiguration(format!("invalid OIDC issuer: {e}")))?;
        if !matches!(issuer.scheme(), "http" | "https") || issuer.host_str().is_none() {
            return Err(AuthError::InvalidConfiguration(format!(
                "OIDC issuer must be an http(s) URL with a host: {issuer}"
            )));
        }
        if audience.trim().is_empty() {
            return Err(AuthError::InvalidConfiguration(
                "OIDC audience must not be empty".to_string(),
            ));
        }

        Ok(Self {
            issuer,
            audience: audience.to_string(),
            client: reqwest::Client::new(),
            jwks: RwLock::new(None),
        })
    }

    pub fn issuer(&self) -> &str {
        self.issuer_str()
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    // `iss` claims carry no trailing slash; Url always renders one for a bare host
    fn issuer_str(&self) -> &str {
        self.issuer.as_str().trim_end_matches('/')
    }

    async fn fetch_jwks(&self) -> AuthResult<JwkSet> {
        let discovery_url = format!("{}/.well-known/openid-configuration", self.issuer_str());
        let discovery: DiscoveryDocument = self
            .client
            .get(&discovery_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::Discovery(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::Discovery(e.to_string()))?;

        let jwks: JwkSet = self
            .client
            .get(&discovery.jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::Discovery(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::Discovery(e.to_string()))?;

        debug!(keys = jwks.keys.len(), issuer = self.issuer_str(), "Fetched OIDC signing keys");
        Ok(jwks)
    }

    async fn decoding_key(&self, kid: &str) -> AuthResult<DecodingKey> {
        {
            let cache = self.jwks.read().await;
            if let Some((fetched_at, jwks)) = cache.as_ref() {
                if fetched_at.elapsed() < JWKS_TTL {
                    if let Some(jwk) = jwks.find(kid) {
                        return DecodingKey::from_jwk(jwk).map_err(|_| AuthError::InvalidCredential);
                    }
                }
            }
        }

        let jwks = self.fetch_jwks().await?;
        let key = jwks
            .find(kid)
            .map(DecodingKey::from_jwk)
            .transpose()
            .map_err(|_| AuthError::InvalidCredential)?;
        *self.jwks.write().await = Some((Instant::now(), jwks));

        key.ok_or_else(|| {
            warn!(kid, "Token signed with an unknown key");
            AuthError::InvalidCredential
        })
    }
}

#[async_trait]
impl Authenticator for OidcAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::Oidc
    }

    async fn authenticate(&self, credential: &str) -> AuthResult<Principal> {
        let header = decode_header(credential).map_err(|_| AuthError::InvalidCredential)?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidCredential);
        }
        let kid = header.kid.ok_or(AuthError::InvalidCredential)?;
        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.issuer_str()]);
        validation.set_audience(&[&self.audience]);
        validation.validate_nbf = true;

        let data = decode::<Claims>(credential, &key, &validation).map_err(|e| {
            debug!("Token validation failed: {}", e);
            AuthError::InvalidCredential
        })?;

        Ok(Principal {
            subject: data.claims.sub,
        })
    }
}
