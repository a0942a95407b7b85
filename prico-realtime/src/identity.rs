//! Handshake credentials and the identity capability.
//!
//! Verifying tokens is not this crate's job: a deployment plugs in its own
//! [`IdentityProvider`]. [`HandshakeIdentity`] is the development default
//! and trusts the `user_id` / `name` query parameters as given.

use thiserror::Error;

/// Credential material taken from the handshake query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub token: Option<String>,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
}

impl Credential {
    /// Parses `token`, `user_id` and `name` from a URL query string.
    /// Empty values are ignored.
    pub fn from_query(query: &str) -> Self {
        let mut credential = Credential::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            let value = value.into_owned();
            match key.as_ref() {
                "token" => credential.token = Some(value),
                "user_id" => credential.user_id = Some(value),
                "name" => credential.display_name = Some(value),
                _ => {}
            }
        }
        credential
    }
}

/// A verified user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub display_name: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("missing credential: {0}")]
    Missing(&'static str),

    #[error("credential rejected: {0}")]
    Rejected(String),
}

pub trait IdentityProvider: Send + Sync {
    fn verify(&self, credential: &Credential) -> Result<Principal, IdentityError>;
}

/// Accepts any non-empty `user_id`; the display name defaults to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeIdentity;

impl IdentityProvider for HandshakeIdentity {
    fn verify(&self, credential: &Credential) -> Result<Principal, IdentityError> {
        let user_id = credential
            .user_id
            .clone()
            .ok_or(IdentityError::Missing("user_id"))?;
        let display_name = credential
            .display_name
            .clone()
            .unwrap_or_else(|| user_id.clone());
        Ok(Principal {
            user_id,
            display_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_query_decodes_values() {
        let credential = Credential::from_query("token=abc&user_id=u%201&name=Ada+L&extra=1");
        assert_eq!(
            credential,
            Credential {
                token: Some("abc".into()),
                user_id: Some("u 1".into()),
                display_name: Some("Ada L".into()),
            }
        );
    }

    #[test]
    fn test_from_query_ignores_empty_values() {
        let credential = Credential::from_query("user_id=&name=Bob");
        assert_eq!(credential.user_id, None);
        assert_eq!(credential.display_name.as_deref(), Some("Bob"));
        assert_eq!(Credential::from_query(""), Credential::default());
    }

    #[test]
    fn test_handshake_identity() {
        let principal = HandshakeIdentity
            .verify(&Credential::from_query("user_id=u1&name=Ada"))
            .unwrap();
        assert_eq!(principal, Principal::new("u1", "Ada"));

        let unnamed = HandshakeIdentity
            .verify(&Credential::from_query("user_id=u2"))
            .unwrap();
        assert_eq!(unnamed.display_name, "u2");

        let err = HandshakeIdentity
            .verify(&Credential::from_query("name=Ada"))
            .unwrap_err();
        assert_eq!(err, IdentityError::Missing("user_id"));
    }
}
