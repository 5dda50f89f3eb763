use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The kind of credential a [`Key`] represents. The discriminants are the
/// values persisted in storage and carried inside tokens.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum KeyType {
    Access = 0,
    Refresh = 1,
    Recovery = 2,
    Api = 3,
    Invitation = 4,
}

impl TryFrom<i64> for KeyType {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Access),
            1 => Ok(Self::Refresh),
            2 => Ok(Self::Recovery),
            3 => Ok(Self::Api),
            4 => Ok(Self::Invitation),
            other => Err(other),
        }
    }
}

/// An issued credential record. Only `Api` keys are persisted; the other
/// kinds live solely inside the tokens that carry them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub variant: KeyType,
    pub issuer: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub issued_at: DateTime<Utc>,
    /// `None` only for `Api` keys that never expire.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Key {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |exp| exp <= Utc::now())
    }
}

/// An encoded access token plus the optional paired refresh value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Filters for listing the persisted keys of an issuer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFilter {
    /// Substring match on the key subject.
    pub subject: Option<String>,
    pub variant: Option<KeyType>,
    pub offset: u64,
    pub limit: u64,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::Duration;

    use super::*;

    #[test]
    fn key_type_round_trip() {
        for variant in [
            KeyType::Access,
            KeyType::Refresh,
            KeyType::Recovery,
            KeyType::Api,
            KeyType::Invitation,
        ] {
            assert_eq!(KeyType::from_str(&variant.to_string()).unwrap(), variant);
            assert_eq!(KeyType::try_from(variant as i64).unwrap(), variant);
        }
        assert!(KeyType::try_from(5).is_err());
    }

    #[test]
    fn expiry() {
        let mut key = Key {
            id: "k".into(),
            variant: KeyType::Access,
            issuer: "u1".into(),
            subject: "u1@example.com".into(),
            user: None,
            domain: None,
            issued_at: Utc::now(),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        };
        assert!(!key.is_expired());

        key.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(key.is_expired());

        // Keys without an expiry never expire
        key.expires_at = None;
        assert!(!key.is_expired());
    }
}
