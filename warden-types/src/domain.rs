use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::Metadata;

/// Lifecycle status of a domain. `All` is a query-only value and is never
/// persisted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DomainStatus {
    Enabled = 0,
    Disabled = 1,
    All = 2,
}

impl TryFrom<i64> for DomainStatus {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Enabled),
            1 => Ok(Self::Disabled),
            2 => Ok(Self::All),
            other => Err(other),
        }
    }
}

/// A tenant container. The `alias` is globally unique and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub name: String,
    pub alias: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub status: DomainStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Filters for domain listings. A `None` subject means the caller sees all
/// domains (platform admin); otherwise results are restricted to domains the
/// subject holds a policy on. A `None` status defaults to `Enabled`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainFilter {
    pub subject_id: Option<String>,
    pub status: Option<DomainStatus>,
    /// Exact name match.
    pub name: Option<String>,
    /// Any-of match against the tags sequence.
    pub tag: Option<String>,
    /// Top-level JSON containment on metadata.
    pub metadata: Option<Metadata>,
    pub ids: Vec<String>,
    pub offset: u64,
    pub limit: u64,
}

/// Partial update of a domain. Every field is independently optional; when
/// `status` is not set only enabled rows are updated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainUpdate {
    pub name: Option<String>,
    pub alias: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Metadata>,
    pub status: Option<DomainStatus>,
}

/// Compose the subject id of a user acting inside a domain.
#[must_use]
pub fn encode_domain_user_id(domain_id: &str, user_id: &str) -> String {
    format!("{domain_id}_{user_id}")
}
