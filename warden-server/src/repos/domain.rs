use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use warden_types::{
    domain::{Domain, DomainFilter, DomainStatus, DomainUpdate},
    page::{Page, DEFAULT_LIMIT},
    policy::EntityType,
};

use crate::error::{Error, ErrorType};

use super::metadata_predicates;

#[derive(Debug, sqlx::FromRow)]
pub struct DomainRaw {
    id: String,
    name: String,
    alias: String,
    tags: String,
    metadata: String,
    status: i64,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_by: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<DomainRaw> for Domain {
    type Error = Error;

    fn try_from(value: DomainRaw) -> Result<Domain, Error> {
        let tags = serde_json::from_str(&value.tags).map_err(|_| {
            ErrorType::BadData(format!("Unable to parse domain tags `{}`", value.tags))
        })?;
        let metadata = serde_json::from_str(&value.metadata).map_err(|_| {
            ErrorType::BadData(format!(
                "Unable to parse domain metadata `{}`",
                value.metadata
            ))
        })?;
        let status = DomainStatus::try_from(value.status)
            .map_err(|s| ErrorType::BadData(format!("`{s}` is not a valid domain status")))?;

        Ok(Domain {
            id: value.id,
            name: value.name,
            alias: value.alias,
            tags,
            metadata,
            status,
            created_by: value.created_by,
            created_at: value.created_at,
            updated_by: value.updated_by,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct DomainRepo {
    pool: SqlitePool,
}

impl DomainRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a domain and return the stored row.
    #[tracing::instrument(skip_all, fields(id = %domain.id))]
    pub async fn save(&self, domain: &Domain) -> Result<Domain, Error> {
        if domain.status == DomainStatus::All {
            return Err(ErrorType::MalformedEntity(
                "`all` is a query-only status".to_string(),
            )
            .into());
        }
        let tags = serde_json::to_string(&domain.tags)
            .map_err(|_| ErrorType::MalformedEntity("Invalid domain tags".to_string()))?;
        let metadata = serde_json::to_string(&domain.metadata)
            .map_err(|_| ErrorType::MalformedEntity("Invalid domain metadata".to_string()))?;

        sqlx::query(
            "INSERT INTO DOMAINS (id, name, alias, tags, metadata, status, created_by, created_at, updated_by, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&domain.id)
        .bind(&domain.name)
        .bind(&domain.alias)
        .bind(&tags)
        .bind(&metadata)
        .bind(domain.status as i64)
        .bind(&domain.created_by)
        .bind(domain.created_at)
        .bind(&domain.updated_by)
        .bind(domain.updated_at)
        .execute(&self.pool)
        .await?;

        self.retrieve_by_id(&domain.id).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn retrieve_by_id(&self, id: &str) -> Result<Domain, Error> {
        sqlx::query_as("SELECT * FROM DOMAINS WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
            .and_then(|domain: Option<DomainRaw>| match domain {
                Some(domain) => domain.try_into(),
                None => Err(ErrorType::NotFound(format!("Domain `{id}` not found")).into()),
            })
    }

    /// Retrieve a set of domains by id with the remaining filters applied.
    /// An empty id list yields an empty page without touching storage.
    #[tracing::instrument(skip(self, filter))]
    pub async fn retrieve_all_by_ids(
        &self,
        ids: &[String],
        filter: &DomainFilter,
    ) -> Result<Page<Domain>, Error> {
        if ids.is_empty() {
            let limit = if filter.limit == 0 {
                DEFAULT_LIMIT
            } else {
                filter.limit
            };
            return Ok(Page::empty(filter.offset, limit));
        }

        let scoped = DomainFilter {
            ids: ids.to_vec(),
            ..filter.clone()
        };
        self.list_domains(&scoped).await
    }

    /// List domains. A `None` subject spans all domains (platform admin);
    /// otherwise results are restricted to domains the subject holds a
    /// policy on. A `None` status lists enabled domains only.
    #[tracing::instrument(skip(self, filter))]
    pub async fn list_domains(&self, filter: &DomainFilter) -> Result<Page<Domain>, Error> {
        let limit = if filter.limit == 0 {
            DEFAULT_LIMIT
        } else {
            filter.limit
        };

        let mut condition = String::from("1 = 1");
        let mut binds: Vec<String> = vec![];

        if let Some(subject_id) = &filter.subject_id {
            condition.push_str(
                " AND id IN (SELECT object_id FROM POLICIES WHERE subject_type = ? AND subject_id = ? AND object_type = ?)",
            );
            binds.push(EntityType::User.to_string());
            binds.push(subject_id.clone());
            binds.push(EntityType::Domain.to_string());
        }
        match filter.status {
            Some(DomainStatus::All) => {}
            Some(status) => condition.push_str(&format!(" AND status = {}", status as i64)),
            None => condition.push_str(&format!(" AND status = {}", DomainStatus::Enabled as i64)),
        }
        if let Some(name) = &filter.name {
            condition.push_str(" AND name = ?");
            binds.push(name.clone());
        }
        if let Some(tag) = &filter.tag {
            condition
                .push_str(" AND EXISTS (SELECT 1 FROM json_each(DOMAINS.tags) WHERE value = ?)");
            binds.push(tag.clone());
        }
        if let Some(metadata) = &filter.metadata {
            let (clauses, metadata_binds) = metadata_predicates("metadata", metadata)?;
            for clause in clauses {
                condition.push_str(" AND ");
                condition.push_str(&clause);
            }
            binds.extend(metadata_binds);
        }
        if !filter.ids.is_empty() {
            let placeholders = vec!["?"; filter.ids.len()].join(", ");
            condition.push_str(&format!(" AND id IN ({placeholders})"));
            binds.extend(filter.ids.iter().cloned());
        }

        let count_sql = format!("SELECT COUNT(*) FROM DOMAINS WHERE {condition}");
        let mut count_query = sqlx::query_scalar(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?;

        let select_sql =
            format!("SELECT * FROM DOMAINS WHERE {condition} ORDER BY id LIMIT ? OFFSET ?");
        let mut select_query = sqlx::query_as(&select_sql);
        for bind in &binds {
            select_query = select_query.bind(bind);
        }
        let rows: Vec<DomainRaw> = select_query
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
                .filter_map(|domain| domain.try_into().ok())
                .collect(),
        })
    }

    /// Partial update; every field is independently optional. When the patch
    /// does not carry a status, only enabled rows are updated.
    #[tracing::instrument(skip(self, update))]
    pub async fn update(
        &self,
        id: &str,
        actor: &str,
        update: &DomainUpdate,
    ) -> Result<Domain, Error> {
        if update.status == Some(DomainStatus::All) {
            return Err(ErrorType::MalformedEntity(
                "`all` is a query-only status".to_string(),
            )
            .into());
        }

        let mut assignments = String::from("updated_by = ?, updated_at = ?");
        let mut binds: Vec<String> = vec![];
        if let Some(name) = &update.name {
            assignments.push_str(", name = ?");
            binds.push(name.clone());
        }
        if let Some(alias) = &update.alias {
            assignments.push_str(", alias = ?");
            binds.push(alias.clone());
        }
        if let Some(tags) = &update.tags {
            assignments.push_str(", tags = ?");
            binds.push(
                serde_json::to_string(tags)
                    .map_err(|_| ErrorType::MalformedEntity("Invalid domain tags".to_string()))?,
            );
        }
        if let Some(metadata) = &update.metadata {
            assignments.push_str(", metadata = ?");
            binds.push(serde_json::to_string(metadata).map_err(|_| {
                ErrorType::MalformedEntity("Invalid domain metadata".to_string())
            })?);
        }
        if let Some(status) = update.status {
            assignments.push_str(&format!(", status = {}", status as i64));
        }

        let mut sql = format!("UPDATE DOMAINS SET {assignments} WHERE id = ?");
        if update.status.is_none() {
            sql.push_str(&format!(" AND status = {}", DomainStatus::Enabled as i64));
        }

        let mut query = sqlx::query(&sql).bind(actor).bind(Utc::now());
        for bind in &binds {
            query = query.bind(bind);
        }
        let res = query.bind(id).execute(&self.pool).await?;
        if res.rows_affected() != 1 {
            return Err(ErrorType::NotFound(format!("Domain `{id}` not found")).into());
        }

        self.retrieve_by_id(id).await
    }

    /// Hard delete.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        let res = sqlx::query("DELETE FROM DOMAINS WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() != 1 {
            return Err(ErrorType::NotFound(format!("Domain `{id}` not found")).into());
        }
        Ok(())
    }
}
