use chrono::{TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use warden_types::key::{Key, KeyType};

use crate::error::{Error, ErrorType};

/// Encodes keys into signed, self-describing bearer tokens and back.
///
/// `parse` must be pure and deterministic for a given signing key: expiry is
/// reported as [`ErrorType::KeyExpired`], any structural or signature failure
/// as [`ErrorType::InvalidToken`].
pub trait Tokenizer: Send + Sync {
    fn issue(&self, key: &Key) -> Result<String, Error>;
    fn parse(&self, token: &str) -> Result<Key, Error>;
}

/// The claims carried by the wire format. Timestamps are carried at second
/// precision; sub-second precision of the source key is not preserved.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    jti: String,
    iss: String,
    sub: String,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
    variant: KeyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<String>,
}

impl From<&Key> for Claims {
    fn from(key: &Key) -> Self {
        Self {
            jti: key.id.clone(),
            iss: key.issuer.clone(),
            sub: key.subject.clone(),
            iat: key.issued_at.timestamp(),
            exp: key.expires_at.map(|exp| exp.timestamp()),
            variant: key.variant,
            user: key.user.clone(),
            domain: key.domain.clone(),
        }
    }
}

impl TryFrom<Claims> for Key {
    type Error = Error;

    fn try_from(claims: Claims) -> Result<Self, Error> {
        let issued_at = Utc
            .timestamp_opt(claims.iat, 0)
            .single()
            .ok_or(ErrorType::InvalidToken)?;
        let expires_at = claims
            .exp
            .map(|exp| Utc.timestamp_opt(exp, 0).single())
            .map(|ts| ts.ok_or(ErrorType::InvalidToken))
            .transpose()?;

        Ok(Key {
            id: claims.jti,
            variant: claims.variant,
            issuer: claims.iss,
            subject: claims.sub,
            user: claims.user,
            domain: claims.domain,
            issued_at,
            expires_at,
        })
    }
}

pub struct JwtTokenizer {
    header: Header,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtTokenizer {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS512);
        // Expiry is applied after decoding so that an expired token is
        // distinguishable from a malformed one.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        Self {
            header: Header::new(Algorithm::HS512),
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl Tokenizer for JwtTokenizer {
    #[tracing::instrument(skip_all)]
    fn issue(&self, key: &Key) -> Result<String, Error> {
        let claims = Claims::from(key);
        encode(&self.header, &claims, &self.encoding_key)
            .map_err(|err| ErrorType::InternalError(err.into()).into())
    }

    #[tracing::instrument(skip_all)]
    fn parse(&self, token: &str) -> Result<Key, Error> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| ErrorType::InvalidToken)?;
        let key = Key::try_from(data.claims)?;
        if key.is_expired() {
            return Err(ErrorType::KeyExpired { key: Box::new(key) }.into());
        }
        Ok(key)
    }
}
