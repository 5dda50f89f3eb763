use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The canonical platform object id. A policy request with
/// `object_type == Platform` must reference exactly this object.
pub const PLATFORM_ID: &str = "platform";

pub const ADMINISTRATOR_RELATION: &str = "administrator";
pub const EDITOR_RELATION: &str = "editor";
pub const CONTRIBUTOR_RELATION: &str = "contributor";
pub const MEMBER_RELATION: &str = "member";
pub const GUEST_RELATION: &str = "guest";

pub const ADMIN_PERMISSION: &str = "admin";
pub const EDIT_PERMISSION: &str = "edit";
pub const VIEW_PERMISSION: &str = "view";
pub const MEMBERSHIP_PERMISSION: &str = "membership";

/// The closed set of entity types that can appear on either side of a
/// policy tuple.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntityType {
    #[default]
    User,
    Group,
    Domain,
    Platform,
    Client,
    Channel,
}

/// How the `subject` field of a [`PolicyReq`] should be interpreted:
/// a principal id, or a bearer token to be identified first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SubjectKind {
    #[default]
    Users,
    Tokens,
}

/// The authorization atom. The entire 6-tuple is the primary key; the
/// `permission` field is derived on read and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub subject_type: EntityType,
    pub subject_id: String,
    /// Empty for a direct subject; otherwise the tuple grants to the set of
    /// subjects holding this relation on `subject_id` (a userset).
    #[serde(default)]
    pub subject_relation: String,
    pub relation: String,
    pub object_type: EntityType,
    pub object_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permission: String,
}

/// An authorization question posed to the evaluator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReq {
    pub subject: String,
    pub subject_type: EntityType,
    #[serde(default)]
    pub subject_kind: SubjectKind,
    #[serde(default)]
    pub subject_relation: String,
    pub object: String,
    pub object_type: EntityType,
    #[serde(default)]
    pub relation: String,
    #[serde(default)]
    pub permission: String,
    #[serde(default)]
    pub domain: String,
}

impl PolicyReq {
    /// The permission to evaluate: the explicit one when set, otherwise the
    /// view onto the requested relation.
    #[must_use]
    pub fn effective_permission(&self) -> &str {
        if self.permission.is_empty() {
            relation_permission(&self.relation)
        } else {
            &self.permission
        }
    }
}

/// Tuple filter for bulk deletion; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFilter {
    pub subject_type: Option<EntityType>,
    pub subject_id: Option<String>,
    pub subject_relation: Option<String>,
    pub relation: Option<String>,
    pub object_type: Option<EntityType>,
    pub object_id: Option<String>,
}

impl PolicyFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subject_type.is_none()
            && self.subject_id.is_none()
            && self.subject_relation.is_none()
            && self.relation.is_none()
            && self.object_type.is_none()
            && self.object_id.is_none()
    }
}

/// The fixed relation → permission view. Unknown relations pass through
/// unchanged.
#[must_use]
pub fn relation_permission(relation: &str) -> &str {
    match relation {
        ADMINISTRATOR_RELATION => ADMIN_PERMISSION,
        EDITOR_RELATION => EDIT_PERMISSION,
        CONTRIBUTOR_RELATION | GUEST_RELATION => VIEW_PERMISSION,
        MEMBER_RELATION => MEMBERSHIP_PERMISSION,
        other => other,
    }
}

/// The relations that satisfy a permission when held on the object. An
/// unknown permission is treated as a raw relation and only matches itself.
#[must_use]
pub fn granting_relations(permission: &str) -> Vec<&str> {
    match permission {
        ADMIN_PERMISSION => vec![ADMINISTRATOR_RELATION],
        EDIT_PERMISSION => vec![ADMINISTRATOR_RELATION, EDITOR_RELATION],
        VIEW_PERMISSION => vec![
            ADMINISTRATOR_RELATION,
            EDITOR_RELATION,
            CONTRIBUTOR_RELATION,
            GUEST_RELATION,
        ],
        MEMBERSHIP_PERMISSION => vec![
            ADMINISTRATOR_RELATION,
            EDITOR_RELATION,
            CONTRIBUTOR_RELATION,
            MEMBER_RELATION,
            GUEST_RELATION,
        ],
        other => vec![other],
    }
}
