use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use warden_types::{
    group::{Group, GroupFilter, MemberKind, MAX_LEVEL},
    page::{Page, DEFAULT_LIMIT},
};

use crate::error::{Error, ErrorType};

use super::metadata_predicates;

#[derive(Debug, sqlx::FromRow)]
pub struct GroupRaw {
    id: String,
    parent_id: Option<String>,
    owner_id: String,
    name: String,
    description: String,
    metadata: String,
    path: String,
    level: i64,
    variant: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<GroupRaw> for Group {
    type Error = Error;

    fn try_from(value: GroupRaw) -> Result<Group, Error> {
        let metadata = serde_json::from_str(&value.metadata).map_err(|_| {
            ErrorType::BadData(format!("Unable to parse group metadata `{}`", value.metadata))
        })?;
        let variant = MemberKind::try_from(value.variant)
            .map_err(|v| ErrorType::BadData(format!("`{v}` is not a valid group type")))?;

        Ok(Group {
            id: value.id,
            owner_id: value.owner_id,
            parent_id: value.parent_id,
            name: value.name,
            description: value.description,
            metadata,
            path: value.path,
            level: u64::try_from(value.level).unwrap_or_default(),
            variant,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

/// Depth used for hierarchical queries; zero means unbounded and anything
/// beyond the cap is silently clamped.
fn clamp_level(level: u64) -> u64 {
    if level == 0 {
        MAX_LEVEL
    } else {
        level.min(MAX_LEVEL)
    }
}

/// Tree of groups stored with a materialized path. All ancestor/descendant
/// predicates run against the path index.
#[derive(Clone)]
pub struct GroupRepo {
    pool: SqlitePool,
}

impl GroupRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a group. A root requires an explicit type; a child inherits
    /// the parent's type atomically, aborting if the parent vanished between
    /// read and write.
    #[tracing::instrument(skip_all, fields(id = %group.id))]
    pub async fn save(&self, group: &Group) -> Result<Group, Error> {
        let metadata = serde_json::to_string(&group.metadata)
            .map_err(|_| ErrorType::MalformedEntity("Invalid group metadata".to_string()))?;

        let mut tx = self.pool.begin().await?;

        let (path, level, variant) = match &group.parent_id {
            Some(parent_id) => {
                let parent: Option<(String, i64, i64)> =
                    sqlx::query_as("SELECT path, level, variant FROM GROUPS WHERE id = ?")
                        .bind(parent_id)
                        .fetch_optional(&mut tx)
                        .await?;
                let (parent_path, parent_level, parent_variant) = parent.ok_or_else(|| {
                    Error::from(ErrorType::NotFound(format!(
                        "Parent group `{parent_id}` not found"
                    )))
                })?;
                (
                    format!("{parent_path}.{}", group.id),
                    parent_level + 1,
                    parent_variant,
                )
            }
            None => (group.id.clone(), 1, group.variant as i64),
        };
        if u64::try_from(level).unwrap_or_default() > MAX_LEVEL {
            return Err(ErrorType::MalformedEntity(format!(
                "Group tree depth is capped at {MAX_LEVEL}"
            ))
            .into());
        }

        sqlx::query(
            "INSERT INTO GROUPS (id, parent_id, owner_id, name, description, metadata, path, level, variant, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&group.id)
        .bind(&group.parent_id)
        .bind(&group.owner_id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(&metadata)
        .bind(&path)
        .bind(level)
        .bind(variant)
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;

        let variant = MemberKind::try_from(variant)
            .map_err(|v| ErrorType::BadData(format!("`{v}` is not a valid group type")))?;
        Ok(Group {
            path,
            level: u64::try_from(level).unwrap_or_default(),
            variant,
            ..group.clone()
        })
    }

    /// Mutate name, description and metadata only; the id, owner, parent,
    /// path and type are immutable post-create.
    #[tracing::instrument(skip_all, fields(id = %group.id))]
    pub async fn update(&self, group: &Group) -> Result<Group, Error> {
        let metadata = serde_json::to_string(&group.metadata)
            .map_err(|_| ErrorType::MalformedEntity("Invalid group metadata".to_string()))?;
        let updated_at = Utc::now();

        let res = sqlx::query(
            "UPDATE GROUPS SET name = ?, description = ?, metadata = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&group.name)
        .bind(&group.description)
        .bind(&metadata)
        .bind(updated_at)
        .bind(&group.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() != 1 {
            return Err(ErrorType::NotFound(format!("Group `{}` not found", group.id)).into());
        }

        self.retrieve_by_id(&group.id).await
    }

    /// Delete a group. Rejected when the group or any of its descendants
    /// still has members; descendants themselves cascade with the row.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        let path: Option<String> = sqlx::query_scalar("SELECT path FROM GROUPS WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut tx)
            .await?;
        let path =
            path.ok_or_else(|| Error::from(ErrorType::NotFound(format!("Group `{id}` not found"))))?;

        let members: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM GROUP_RELATIONS
            WHERE group_id IN (SELECT id FROM GROUPS WHERE path = ? OR path LIKE ? || '.%')",
        )
        .bind(&path)
        .bind(&path)
        .fetch_one(&mut tx)
        .await?;
        if members > 0 {
            return Err(ErrorType::GroupNotEmpty.into());
        }

        sqlx::query("DELETE FROM GROUPS WHERE id = ?")
            .bind(id)
            .execute(&mut tx)
            .await?;

        tx.commit().await.map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn retrieve_by_id(&self, id: &str) -> Result<Group, Error> {
        sqlx::query_as("SELECT * FROM GROUPS WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
            .and_then(|group: Option<GroupRaw>| match group {
                Some(group) => group.try_into(),
                None => Err(ErrorType::NotFound(format!("Group `{id}` not found")).into()),
            })
    }

    /// List groups at `level <= filter.level`, optionally filtered by
    /// metadata containment, ordered by path for a stable pre-order listing.
    #[tracing::instrument(skip(self, filter))]
    pub async fn retrieve_all(&self, filter: &GroupFilter) -> Result<Page<Group>, Error> {
        let level = clamp_level(filter.level);
        let limit = if filter.limit == 0 {
            DEFAULT_LIMIT
        } else {
            filter.limit
        };

        let mut condition = String::from("level <= ?");
        let mut binds: Vec<String> = vec![];
        if let Some(owner_id) = &filter.owner_id {
            condition.push_str(" AND owner_id = ?");
            binds.push(owner_id.clone());
        }
        if let Some(metadata) = &filter.metadata {
            let (clauses, metadata_binds) = metadata_predicates("metadata", metadata)?;
            for clause in clauses {
                condition.push_str(" AND ");
                condition.push_str(&clause);
            }
            binds.extend(metadata_binds);
        }

        let count_sql = format!("SELECT COUNT(*) FROM GROUPS WHERE {condition}");
        let mut count_query =
            sqlx::query_scalar(&count_sql).bind(i64::try_from(level).unwrap_or_default());
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?;

        let select_sql =
            format!("SELECT * FROM GROUPS WHERE {condition} ORDER BY path LIMIT ? OFFSET ?");
        let mut select_query =
            sqlx::query_as(&select_sql).bind(i64::try_from(level).unwrap_or_default());
        for bind in &binds {
            select_query = select_query.bind(bind);
        }
        let rows: Vec<GroupRaw> = select_query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            total: u64::try_from(total).unwrap_or_default(),
            offset: filter.offset,
            limit,
            items: rows
                .into_iter()
                .filter_map(|group| group.try_into().ok())
                .collect(),
        })
    }

    /// The ancestor chain of a group (self included), clipped to
    /// `min(filter.level, MAX_LEVEL)` levels upwards.
    #[tracing::instrument(skip(self, filter))]
    pub async fn retrieve_parents(
        &self,
        group_id: &str,
        filter: &GroupFilter,
    ) -> Result<Page<Group>, Error> {
        let (path, level) = self.path_and_level(group_id).await?;
        let depth = clamp_level(filter.level);
        let min_level = level.saturating_sub(depth - 1);

        let condition = "(? = path OR ? LIKE path || '.%') AND level >= ?";
        self.page_by_path(
            condition,
            &[path.clone(), path, min_level.to_string()],
            filter,
        )
        .await
    }

    /// The descendants of a group (self included), clipped to
    /// `min(filter.level, MAX_LEVEL)` levels downwards.
    #[tracing::instrument(skip(self, filter))]
    pub async fn retrieve_children(
        &self,
        group_id: &str,
        filter: &GroupFilter,
    ) -> Result<Page<Group>, Error> {
        let (path, level) = self.path_and_level(group_id).await?;
        let depth = clamp_level(filter.level);
        let max_level = level + depth - 1;

        let condition = "(path = ? OR path LIKE ? || '.%') AND level <= ?";
        self.page_by_path(
            condition,
            &[path.clone(), path, max_level.to_string()],
            filter,
        )
        .await
    }

    #[tracing::instrument(skip(self, filter))]
    pub async fn members(
        &self,
        group_id: &str,
        kind: MemberKind,
        filter: &GroupFilter,
    ) -> Result<Page<String>, Error> {
        let limit = if filter.limit == 0 {
            DEFAULT_LIMIT
        } else {
            filter.limit
        };

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM GROUP_RELATIONS WHERE group_id = ? AND variant = ?",
        )
        .bind(group_id)
        .bind(kind as i64)
        .fetch_one(&self.pool)
        .await?;

        let items: Vec<String> = sqlx::query_scalar(
            "SELECT member_id FROM GROUP_RELATIONS WHERE group_id = ? AND variant = ?
            ORDER BY member_id LIMIT ? OFFSET ?",
        )
        .bind(group_id)
        .bind(kind as i64)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            total: u64::try_from(total).unwrap_or_default(),
            offset: filter.offset,
            limit,
            items,
        })
    }

    /// The groups a member is assigned to.
    #[tracing::instrument(skip(self, filter))]
    pub async fn memberships(
        &self,
        member_id: &str,
        filter: &GroupFilter,
    ) -> Result<Page<Group>, Error> {
        let limit = if filter.limit == 0 {
            DEFAULT_LIMIT
        } else {
            filter.limit
        };

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM GROUPS G
            INNER JOIN GROUP_RELATIONS GR ON G.id = GR.group_id WHERE GR.member_id = ?",
        )
        .bind(member_id)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<GroupRaw> = sqlx::query_as(
            "SELECT G.* FROM GROUPS G
            INNER JOIN GROUP_RELATIONS GR ON G.id = GR.group_id WHERE GR.member_id = ?
            ORDER BY G.path LIMIT ? OFFSET ?",
        )
        .bind(member_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            total: u64::try_from(total).unwrap_or_default(),
            offset: filter.offset,
            limit,
            items: rows
                .into_iter()
                .filter_map(|group| group.try_into().ok())
                .collect(),
        })
    }

    /// Assign members to a group. Re-assigning an existing member fails the
    /// whole batch with [`ErrorType::MemberAlreadyAssigned`].
    #[tracing::instrument(skip(self, member_ids))]
    pub async fn assign(
        &self,
        group_id: &str,
        kind: MemberKind,
        member_ids: &[String],
    ) -> Result<(), Error> {
        if member_ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for member_id in member_ids {
            sqlx::query("INSERT INTO GROUP_RELATIONS (member_id, group_id, variant) VALUES (?, ?, ?)")
                .bind(member_id)
                .bind(group_id)
                .bind(kind as i64)
                .execute(&mut tx)
                .await
                .map_err(|err| {
                    let err = Error::from(err);
                    match err.variant {
                        ErrorType::UniqueConstraintViolation { .. } => {
                            ErrorType::MemberAlreadyAssigned.into()
                        }
                        ErrorType::ForeignKeyViolation { .. } => {
                            ErrorType::NotFound(format!("Group `{group_id}` not found")).into()
                        }
                        _ => err,
                    }
                })?;
        }
        tx.commit().await.map_err(Into::into)
    }

    /// Idempotent: unassigning an absent member is not an error.
    #[tracing::instrument(skip(self, member_ids))]
    pub async fn unassign(&self, group_id: &str, member_ids: &[String]) -> Result<(), Error> {
        if member_ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; member_ids.len()].join(", ");
        let sql =
            format!("DELETE FROM GROUP_RELATIONS WHERE group_id = ? AND member_id IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(group_id);
        for member_id in member_ids {
            query = query.bind(member_id);
        }
        query
            .execute(&self.pool)
            .await
            .map_err(Into::into)
            .map(|_| ())
    }

    async fn path_and_level(&self, group_id: &str) -> Result<(String, u64), Error> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT path, level FROM GROUPS WHERE id = ?")
                .bind(group_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(path, level)| (path, u64::try_from(level).unwrap_or_default()))
            .ok_or_else(|| ErrorType::NotFound(format!("Group `{group_id}` not found")).into())
    }

    async fn page_by_path(
        &self,
        condition: &str,
        binds: &[String],
        filter: &GroupFilter,
    ) -> Result<Page<Group>, Error> {
        let limit = if filter.limit == 0 {
            DEFAULT_LIMIT
        } else {
            filter.limit
        };

        let count_sql = format!("SELECT COUNT(*) FROM GROUPS WHERE {condition}");
        let mut count_query = sqlx::query_scalar(&count_sql);
        for bind in binds {
            count_query = count_query.bind(bind);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?;

        let select_sql =
            format!("SELECT * FROM GROUPS WHERE {condition} ORDER BY path LIMIT ? OFFSET ?");
        let mut select_query = sqlx::query_as(&select_sql);
        for bind in binds {
            select_query = select_query.bind(bind);
        }
        let rows: Vec<GroupRaw> = select_query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            total: u64::try_from(total).unwrap_or_default(),
            offset: filter.offset,
            limit,
            items: rows
                .into_iter()
                .filter_map(|group| group.try_into().ok())
                .collect(),
        })
    }
}
