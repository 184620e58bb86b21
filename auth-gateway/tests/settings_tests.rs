use auth_gateway::{AuthError, AuthMethod, AuthSettings};

fn settings(method: &str) -> AuthSettings {
    AuthSettings {
        method: method.to_string(),
        ..AuthSettings::default()
    }
}

#[test]
fn test_none_disables_authentication() {
    assert!(settings("none").build().unwrap().is_none());
}

#[test]
fn test_unknown_method_is_rejected() {
    assert!(matches!(
        settings("ldap").build(),
        Err(AuthError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_preshared_without_keys_is_rejected() {
    assert!(matches!(
        settings("preshared").build(),
        Err(AuthError::InvalidConfiguration(_))
    ));
}

#[tokio::test]
async fn test_preshared_authenticates_configured_key() {
    let auth = AuthSettings {
        preshared_keys: vec!["k1".to_string(), "k2".to_string()],
        ..settings("preshared")
    }
    .build()
    .unwrap()
    .unwrap();

    assert_eq!(auth.method(), AuthMethod::Preshared);
    assert!(auth.authenticate("k2").await.is_ok());
    assert_eq!(auth.authenticate("k3").await, Err(AuthError::InvalidCredential));
}

#[test]
fn test_oidc_requires_issuer_and_audience() {
    assert!(matches!(
        AuthSettings {
            oidc_audience: Some("rebac".to_string()),
            ..settings("oidc")
        }
        .build(),
        Err(AuthError::InvalidConfiguration(_))
    ));
    assert!(matches!(
        AuthSettings {
            oidc_issuer: Some("https://issuer.example.com".to_string()),
            ..settings("oidc")
        }
        .build(),
        Err(AuthError::InvalidConfiguration(_))
    ));
    assert!(matches!(
        AuthSettings {
            oidc_issuer: Some("issuer.example.com".to_string()),
            oidc_audience: Some("rebac".to_string()),
            ..settings("oidc")
        }
        .build(),
        Err(AuthError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_oidc_with_valid_parameters_builds_lazily() {
    let auth = AuthSettings {
        oidc_issuer: Some("https://issuer.example.com".to_string()),
        oidc_audience: Some("rebac".to_string()),
        ..settings("oidc")
    }
    .build()
    .unwrap()
    .unwrap();
    assert_eq!(auth.method(), AuthMethod::Oidc);
}
