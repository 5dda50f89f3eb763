use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::Metadata;

/// Depth bound on the group tree and on every ancestor/descendant query.
/// Requests beyond this are clamped, not rejected.
pub const MAX_LEVEL: u64 = 5;

/// The closed set of member kinds, seeded at migration. A group holds
/// members of exactly one kind and children inherit it from their parent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MemberKind {
    Users = 0,
    Things = 1,
}

impl TryFrom<i64> for MemberKind {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Users),
            1 => Ok(Self::Things),
            other => Err(other),
        }
    }
}

/// A node in a per-owner tree. `path` is the dotted sequence of ancestor
/// ids terminating in the node's own id and `level` is its length, so a
/// root has `path == id` and `level == 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub path: String,
    pub level: u64,
    pub variant: MemberKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filters for group listings. A zero `level` means "no explicit bound"
/// and is treated as [`MAX_LEVEL`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFilter {
    pub owner_id: Option<String>,
    pub level: u64,
    pub metadata: Option<Metadata>,
    pub offset: u64,
    pub limit: u64,
}
