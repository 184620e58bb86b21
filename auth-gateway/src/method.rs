use crate::error::AuthError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported authentication strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    None,
    Preshared,
    Oidc,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Preshared => "preshared",
            AuthMethod::Oidc => "oidc",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(AuthMethod::None),
            "preshared" => Ok(AuthMethod::Preshared),
            "oidc" => Ok(AuthMethod::Oidc),
            other => Err(AuthError::InvalidConfiguration(format!(
                "unsupported authentication method '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_methods() {
        assert_eq!("none".parse::<AuthMethod>().unwrap(), AuthMethod::None);
        assert_eq!("Preshared".parse::<AuthMethod>().unwrap(), AuthMethod::Preshared);
        assert_eq!(" oidc ".parse::<AuthMethod>().unwrap(), AuthMethod::Oidc);
    }

    #[test]
    fn test_unknown_method_is_a_configuration_error() {
        assert!(matches!(
            "kerberos".parse::<AuthMethod>(),
            Err(AuthError::InvalidConfiguration(_))
        ));
    }
}
