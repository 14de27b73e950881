//! Short-lived session tokens handed to browsers by the HTML endpoint.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TOKEN_LIFETIME: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token validation failed: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token expired")]
    Expired,
    #[error("token missing session identifier")]
    MissingSession,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    session_id: String,
    expires: u64,
}

pub struct SessionTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl SessionTokens {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            lifetime: TOKEN_LIFETIME,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Mints a token for a fresh session id.
    pub fn issue(&self, session_id: &str) -> Result<String, TokenError> {
        let claims = SessionClaims {
            session_id: session_id.to_string(),
            expires: unix_now() + self.lifetime.as_secs(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Returns the session id of a valid, unexpired token.
    pub fn verify(&self, token: &str) -> Result<String, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        let claims = decode::<SessionClaims>(token, &self.decoding, &validation)?.claims;
        if unix_now() > claims.expires {
            return Err(TokenError::Expired);
        }
        if claims.session_id.is_empty() {
            return Err(TokenError::MissingSession);
        }
        Ok(claims.session_id)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn issued_token_round_trips() {
        let tokens = SessionTokens::new(b"secret");
        let token = tokens.issue("abc").expect("issue");
        assert_eq!(tokens.verify(&token).expect("verify"), "abc");
    }

    #[test_timeout::timeout]
    fn foreign_and_expired_tokens_are_rejected() {
        let tokens = SessionTokens::new(b"secret");
        let other = SessionTokens::new(b"other");
        let token = other.issue("abc").expect("issue");
        assert!(matches!(tokens.verify(&token), Err(TokenError::Invalid(_))));

        let stale = encode(
            &Header::new(Algorithm::HS256),
            &SessionClaims {
                session_id: "abc".into(),
                expires: unix_now() - 1,
            },
            &EncodingKey::from_secret(b"secret"),
        )
        .expect("encode");
        assert!(matches!(tokens.verify(&stale), Err(TokenError::Expired)));

        assert!(matches!(tokens.verify("not-a-jwt"), Err(TokenError::Invalid(_))));
    }

    #[test_timeout::timeout]
    fn empty_session_is_rejected() {
        let tokens = SessionTokens::new(b"secret");
        let token = tokens.issue("").expect("issue");
        assert!(matches!(tokens.verify(&token), Err(TokenError::MissingSession)));
    }
}
