use sqlx::SqlitePool;
use warden_types::Metadata;

use crate::error::{Error, ErrorType};

use self::{domain::DomainRepo, group::GroupRepo, key::KeyRepo, policy::PolicyRepo};

pub mod domain;
pub mod group;
pub mod key;
pub mod policy;

#[derive(Clone)]
pub struct Repos {
    pub key: KeyRepo,
    pub policy: PolicyRepo,
    pub group: GroupRepo,
    pub domain: DomainRepo,
    pub pool: SqlitePool,
}

impl Repos {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            key: KeyRepo::new(pool.clone()),
            policy: PolicyRepo::new(pool.clone()),
            group: GroupRepo::new(pool.clone()),
            domain: DomainRepo::new(pool.clone()),
            pool,
        }
    }
}

/// Build top-level JSON containment predicates for a metadata column. Every
/// criteria key must equal the stored value; empty criteria matches all rows.
/// Returns one clause and one bind (the serialized criteria) per key.
pub(crate) fn metadata_predicates(
    column: &str,
    metadata: &Metadata,
) -> Result<(Vec<String>, Vec<String>), Error> {
    let criteria = serde_json::to_string(metadata)
        .map_err(|_| ErrorType::MalformedEntity("Invalid metadata filter".to_string()))?;

    let mut clauses = Vec::with_capacity(metadata.len());
    let mut binds = Vec::with_capacity(metadata.len());
    for key in metadata.keys() {
        if key.contains('"') {
            return Err(
                ErrorType::MalformedEntity(format!("Invalid metadata key `{key}`")).into(),
            );
        }
        clauses.push(format!(
            "json_extract({column}, '$.\"{key}\"') = json_extract(?, '$.\"{key}\"')"
        ));
        binds.push(criteria.clone());
    }
    Ok((clauses, binds))
}
