use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;

use crate::auth::claims::{Claims, TokenKind, UserId};
use crate::auth::{AuthError, AuthResult};

const TOKEN_ID_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// HS256 signer and verifier for one kind of token. Access and refresh tokens
/// each get their own instance with their own secret.
pub struct TokenSigner {
    kind: TokenKind,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(kind: TokenKind, secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the caller's clock in `verify_at`.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            kind,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn issue(&self, user_id: UserId, is_admin: bool) -> AuthResult<SignedToken> {
        self.issue_at(user_id, is_admin, Utc::now())
    }

    pub fn issue_at(
        &self,
        user_id: UserId,
        is_admin: bool,
        now: DateTime<Utc>,
    ) -> AuthResult<SignedToken> {
        let expires_at = now + self.ttl;
        let claims = Claims {
            user_id,
            is_admin,
            token_kind: self.kind,
            jti: generate_token_id(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| AuthError::Signing(err.to_string()))?;

        Ok(SignedToken { token, expires_at })
    }

    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        self.verify_at(token, Utc::now())
    }

    /// Check signature, kind and expiry, in that order. Malformed input of any
    /// sort is reported as `InvalidSignature`.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> AuthResult<Claims> {
        let claims = match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => data.claims,
            Err(err) => {
                if !matches!(err.kind(), ErrorKind::InvalidSignature) {
                    log::debug!("malformed {} token: {}", self.kind.as_str(), err);
                }
                return Err(AuthError::InvalidSignature);
            }
        };

        if claims.token_kind != self.kind {
            return Err(AuthError::WrongKind);
        }

        if claims.is_expired_at(now) {
            return Err(AuthError::Expired);
        }

        Ok(claims)
    }
}

fn generate_token_id() -> String {
    let mut bytes = [0u8; TOKEN_ID_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
