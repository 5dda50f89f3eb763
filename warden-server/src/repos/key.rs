use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use warden_types::{
    key::{Key, KeyFilter, KeyType},
    page::{Page, DEFAULT_LIMIT},
};

use crate::error::{Error, ErrorType};

#[derive(Debug, sqlx::FromRow)]
pub struct KeyRaw {
    id: String,
    variant: i64,
    issuer_id: String,
    subject: String,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<KeyRaw> for Key {
    type Error = Error;

    fn try_from(value: KeyRaw) -> Result<Key, Error> {
        let variant = KeyType::try_from(value.variant)
            .map_err(|v| ErrorType::BadData(format!("`{v}` is not a valid key type")))?;

        Ok(Key {
            id: value.id,
            variant,
            issuer: value.issuer_id,
            subject: value.subject,
            // User and domain scope live only inside tokens
            user: None,
            domain: None,
            issued_at: value.issued_at,
            expires_at: value.expires_at,
        })
    }
}

#[derive(Clone)]
pub struct KeyRepo {
    pool: SqlitePool,
}

impl KeyRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip_all, fields(id = %key.id))]
    pub async fn save(&self, key: &Key) -> Result<String, Error> {
        sqlx::query(
            "INSERT INTO KEYS (id, variant, issuer_id, subject, issued_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.id)
        .bind(key.variant as i64)
        .bind(&key.issuer)
        .bind(&key.subject)
        .bind(key.issued_at)
        .bind(key.expires_at)
        .execute(&self.pool)
        .await
        .map_err(Into::into)
        .map(|_| key.id.clone())
    }

    #[tracing::instrument(skip(self))]
    pub async fn retrieve(&self, issuer: &str, id: &str) -> Result<Key, Error> {
        sqlx::query_as("SELECT * FROM KEYS WHERE id = ? AND issuer_id = ?")
            .bind(id)
            .bind(issuer)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
            .and_then(|key: Option<KeyRaw>| match key {
                Some(key) => key.try_into(),
                None => Err(ErrorType::NotFound(format!("Key `{id}` not found")).into()),
            })
    }

    /// Idempotent: removing an absent row is not an error.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, issuer: &str, id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM KEYS WHERE id = ? AND issuer_id = ?")
            .bind(id)
            .bind(issuer)
            .execute(&self.pool)
            .await
            .map_err(Into::into)
            .map(|_| ())
    }

    #[tracing::instrument(skip(self, filter))]
    pub async fn retrieve_all(&self, issuer: &str, filter: &KeyFilter) -> Result<Page<Key>, Error> {
        let limit = if filter.limit == 0 {
            DEFAULT_LIMIT
        } else {
            filter.limit
        };

        let mut condition = String::from("issuer_id = ?");
        if filter.subject.is_some() {
            condition.push_str(" AND subject LIKE ?");
        }
        if filter.variant.is_some() {
            condition.push_str(" AND variant = ?");
        }
        let subject_pattern = filter.subject.as_ref().map(|s| format!("%{s}%"));

        let count_sql = format!("SELECT COUNT(*) FROM KEYS WHERE {condition}");
        let mut count_query = sqlx::query_scalar(&count_sql).bind(issuer);
        if let Some(pattern) = &subject_pattern {
            count_query = count_query.bind(pattern);
        }
        if let Some(variant) = filter.variant {
            count_query = count_query.bind(variant as i64);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?;

        let select_sql =
            format!("SELECT * FROM KEYS WHERE {condition} ORDER BY id LIMIT ? OFFSET ?");
        let mut select_query = sqlx::query_as(&select_sql).bind(issuer);
        if let Some(pattern) = &subject_pattern {
            select_query = select_query.bind(pattern);
        }
        if let Some(variant) = filter.variant {
            select_query = select_query.bind(variant as i64);
        }
        let rows: Vec<KeyRaw> = select_query
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
                .filter_map(|key| key.try_into().ok())
                .collect(),
        })
    }
}

#[cfg(test)]
pub mod tests {
    use std::str::FromStr;

    use chrono::Duration;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    use super::*;

    pub async fn pool() -> SqlitePool {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();

        crate::migrations::migrate(&pool).await.unwrap();

        pool
    }

    fn api_key(id: &str, issuer: &str, subject: &str) -> Key {
        let now = Utc::now();
        Key {
            id: id.into(),
            variant: KeyType::Api,
            issuer: issuer.into(),
            subject: subject.into(),
            user: None,
            domain: None,
            issued_at: now,
            expires_at: Some(now + Duration::days(30)),
        }
    }

    #[tokio::test]
    async fn crud() {
        let repo = KeyRepo::new(pool().await);

        let key = api_key("k1", "u1", "u1@example.com");
        assert_eq!(repo.save(&key).await.unwrap(), "k1");

        // Duplicate (id, issuer) conflicts
        let err = repo.save(&key).await.unwrap_err();
        assert!(matches!(
            err.variant,
            ErrorType::UniqueConstraintViolation { .. }
        ));

        // Same id under a different issuer is fine
        let other_issuer = api_key("k1", "u2", "u2@example.com");
        assert!(repo.save(&other_issuer).await.is_ok());

        let retrieved = repo.retrieve("u1", "k1").await.unwrap();
        assert_eq!(retrieved.subject, "u1@example.com");
        assert_eq!(retrieved.variant, KeyType::Api);

        assert!(repo.remove("u1", "k1").await.is_ok());
        let err = repo.retrieve("u1", "k1").await.unwrap_err();
        assert!(err.is_not_found());

        // Removing an absent row is a no-op
        assert!(repo.remove("u1", "k1").await.is_ok());
    }

    #[tokio::test]
    async fn retrieve_all_filters() {
        let repo = KeyRepo::new(pool().await);

        for (id, subject) in [
            ("k1", "alice@example.com"),
            ("k2", "bob@example.com"),
            ("k3", "alice@other.org"),
        ] {
            repo.save(&api_key(id, "u1", subject)).await.unwrap();
        }
        // A key from another issuer must not leak in
        repo.save(&api_key("k4", "u2", "alice@example.com"))
            .await
            .unwrap();

        let page = repo
            .retrieve_all("u1", &KeyFilter::default())
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 3);
        // Ordered by id
        let ids: Vec<_> = page.items.iter().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, vec!["k1", "k2", "k3"]);

        let page = repo
            .retrieve_all(
                "u1",
                &KeyFilter {
                    subject: Some("alice".into()),
                    ..KeyFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 2);

        let page = repo
            .retrieve_all(
                "u1",
                &KeyFilter {
                    variant: Some(KeyType::Access),
                    ..KeyFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 0);

        let page = repo
            .retrieve_all(
                "u1",
                &KeyFilter {
                    offset: 1,
                    limit: 1,
                    ..KeyFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "k2");
    }
}
