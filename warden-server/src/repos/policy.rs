use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sqlx::SqlitePool;
use warden_types::{
    group::MAX_LEVEL,
    policy::{
        granting_relations, relation_permission, EntityType, Policy, PolicyFilter, PolicyReq,
        ADMIN_PERMISSION, EDIT_PERMISSION, MEMBERSHIP_PERMISSION, VIEW_PERMISSION,
    },
};

use crate::error::{Error, ErrorType};

#[derive(Debug, sqlx::FromRow)]
pub struct PolicyRaw {
    subject_type: String,
    subject_id: String,
    subject_relation: String,
    relation: String,
    object_type: String,
    object_id: String,
}

impl TryFrom<PolicyRaw> for Policy {
    type Error = Error;

    fn try_from(value: PolicyRaw) -> Result<Policy, Error> {
        let subject_type = EntityType::from_str(&value.subject_type).map_err(|_| {
            ErrorType::BadData(format!("`{}` is not a valid entity type", value.subject_type))
        })?;
        let object_type = EntityType::from_str(&value.object_type).map_err(|_| {
            ErrorType::BadData(format!("`{}` is not a valid entity type", value.object_type))
        })?;
        let permission = relation_permission(&value.relation).to_string();

        Ok(Policy {
            subject_type,
            subject_id: value.subject_id,
            subject_relation: value.subject_relation,
            relation: value.relation,
            object_type,
            object_id: value.object_id,
            permission,
        })
    }
}

fn encode_cursor(id: &str) -> String {
    STANDARD_NO_PAD.encode(id)
}

fn decode_cursor(cursor: &str) -> Result<String, Error> {
    if cursor.is_empty() {
        return Ok(String::new());
    }
    STANDARD_NO_PAD
        .decode(cursor)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| ErrorType::MalformedEntity("Invalid cursor".to_string()).into())
}

/// The authoritative relation-tuple store and its evaluator. Permission
/// checks expand `subject_relation` usersets breadth-first, bounded by
/// [`MAX_LEVEL`].
#[derive(Clone)]
pub struct PolicyRepo {
    pool: SqlitePool,
}

impl PolicyRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Atomic batch insert. A conflict rolls the whole batch back. A batch
    /// that would create zero tuples is a no-op.
    #[tracing::instrument(skip_all, fields(count = policies.len()))]
    pub async fn save_policies(&self, policies: &[Policy]) -> Result<(), Error> {
        if policies.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for policy in policies {
            sqlx::query(
                "INSERT INTO POLICIES (subject_type, subject_id, subject_relation, relation, object_type, object_id)
                VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(policy.subject_type.to_string())
            .bind(&policy.subject_id)
            .bind(&policy.subject_relation)
            .bind(&policy.relation)
            .bind(policy.object_type.to_string())
            .bind(&policy.object_id)
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await.map_err(Into::into)
    }

    /// Transactional all-or-nothing delete. Deleting an absent tuple is not
    /// an error, so the whole operation is idempotent.
    #[tracing::instrument(skip_all, fields(count = policies.len()))]
    pub async fn delete_policies(&self, policies: &[Policy]) -> Result<(), Error> {
        if policies.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for policy in policies {
            sqlx::query(
                "DELETE FROM POLICIES WHERE subject_type = ? AND subject_id = ? AND subject_relation = ?
                AND relation = ? AND object_type = ? AND object_id = ?",
            )
            .bind(policy.subject_type.to_string())
            .bind(&policy.subject_id)
            .bind(&policy.subject_relation)
            .bind(&policy.relation)
            .bind(policy.object_type.to_string())
            .bind(&policy.object_id)
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await.map_err(Into::into)
    }

    /// Delete all tuples matching the filter; every field is optional, but
    /// an entirely empty filter is rejected.
    #[tracing::instrument(skip(self))]
    pub async fn delete_policy_filter(&self, filter: &PolicyFilter) -> Result<(), Error> {
        if filter.is_empty() {
            return Err(ErrorType::MalformedEntity(
                "Refusing to delete policies with an empty filter".to_string(),
            )
            .into());
        }

        let mut sql = String::from("DELETE FROM POLICIES WHERE 1 = 1");
        let mut binds: Vec<String> = vec![];
        if let Some(subject_type) = filter.subject_type {
            sql.push_str(" AND subject_type = ?");
            binds.push(subject_type.to_string());
        }
        if let Some(subject_id) = &filter.subject_id {
            sql.push_str(" AND subject_id = ?");
            binds.push(subject_id.clone());
        }
        if let Some(subject_relation) = &filter.subject_relation {
            sql.push_str(" AND subject_relation = ?");
            binds.push(subject_relation.clone());
        }
        if let Some(relation) = &filter.relation {
            sql.push_str(" AND relation = ?");
            binds.push(relation.clone());
        }
        if let Some(object_type) = filter.object_type {
            sql.push_str(" AND object_type = ?");
            binds.push(object_type.to_string());
        }
        if let Some(object_id) = &filter.object_id {
            sql.push_str(" AND object_id = ?");
            binds.push(object_id.clone());
        }

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        query
            .execute(&self.pool)
            .await
            .map_err(Into::into)
            .map(|_| ())
    }

    /// Purge every tuple whose subject is the given user.
    #[tracing::instrument(skip(self))]
    pub async fn delete_user_policies(&self, user_id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM POLICIES WHERE subject_type = ? AND subject_id = ?")
            .bind(EntityType::User.to_string())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(Into::into)
            .map(|_| ())
    }

    /// Is the requested relation/permission satisfied, directly or through
    /// userset indirection?
    #[tracing::instrument(skip(self, req), fields(subject = %req.subject, object = %req.object))]
    pub async fn check_policy(&self, req: &PolicyReq) -> Result<bool, Error> {
        let subject_type = req.subject_type.to_string();
        let mut visited: HashSet<(String, String, String)> = HashSet::new();
        let mut frontier = vec![(
            req.object_type.to_string(),
            req.object.clone(),
            req.effective_permission().to_string(),
        )];

        for _ in 0..=MAX_LEVEL {
            let mut next = vec![];
            for goal in frontier.drain(..) {
                if !visited.insert(goal.clone()) {
                    continue;
                }
                let (object_type, object_id, permission) = goal;
                let relations = granting_relations(&permission);
                if self
                    .direct_check(&subject_type, &req.subject, &relations, &object_type, &object_id)
                    .await?
                {
                    return Ok(true);
                }
                for userset in self.usersets(&relations, &object_type, &object_id).await? {
                    next.push((
                        userset.subject_type,
                        userset.subject_id,
                        relation_permission(&userset.subject_relation).to_string(),
                    ));
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(false)
    }

    /// Stream the objects of a given type the subject can reach with a
    /// permission. Keyset-paginated by object id via an opaque cursor;
    /// never materializes more than one page.
    #[tracing::instrument(skip(self, req), fields(subject = %req.subject))]
    pub async fn retrieve_objects(
        &self,
        req: &PolicyReq,
        cursor: &str,
        limit: u64,
    ) -> Result<(Vec<Policy>, String), Error> {
        let after = decode_cursor(cursor)?;
        let permission = req.effective_permission().to_string();
        let relations = granting_relations(&permission);
        let usersets = self.subject_closure(req).await?;

        let placeholders = vec!["?"; relations.len()].join(", ");
        let mut sql = format!(
            "SELECT DISTINCT object_id FROM POLICIES
            WHERE object_type = ? AND relation IN ({placeholders}) AND object_id > ?
            AND ((subject_relation = '' AND subject_type = ? AND subject_id = ?)"
        );
        for _ in &usersets {
            sql.push_str(" OR (subject_type = ? AND subject_id = ? AND subject_relation = ?)");
        }
        sql.push_str(") ORDER BY object_id LIMIT ?");

        let mut query = sqlx::query_scalar(&sql).bind(req.object_type.to_string());
        for relation in &relations {
            query = query.bind(*relation);
        }
        query = query
            .bind(&after)
            .bind(req.subject_type.to_string())
            .bind(&req.subject);
        for (subject_type, subject_id, subject_relation) in &usersets {
            query = query.bind(subject_type).bind(subject_id).bind(subject_relation);
        }
        let object_ids: Vec<String> = query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let next_cursor = if object_ids.len() as u64 == limit {
            object_ids.last().map(|id| encode_cursor(id)).unwrap_or_default()
        } else {
            String::new()
        };
        let policies = object_ids
            .into_iter()
            .map(|object_id| Policy {
                subject_type: req.subject_type,
                subject_id: req.subject.clone(),
                subject_relation: String::new(),
                relation: req.relation.clone(),
                object_type: req.object_type,
                object_id,
                permission: permission.clone(),
            })
            .collect();
        Ok((policies, next_cursor))
    }

    /// Dual of [`Self::retrieve_objects`]: stream the subjects of a given
    /// type holding a permission on the object.
    #[tracing::instrument(skip(self, req), fields(object = %req.object))]
    pub async fn retrieve_subjects(
        &self,
        req: &PolicyReq,
        cursor: &str,
        limit: u64,
    ) -> Result<(Vec<Policy>, String), Error> {
        let after = decode_cursor(cursor)?;
        let permission = req.effective_permission().to_string();

        // Expand usersets on the object into the entities whose members are
        // granted through them, bounded by the tree depth cap.
        let mut targets: Vec<(String, String, Vec<String>)> = vec![];
        let mut visited: HashSet<(String, String, String)> = HashSet::new();
        let mut frontier = vec![(
            req.object_type.to_string(),
            req.object.clone(),
            permission.clone(),
        )];
        for _ in 0..=MAX_LEVEL {
            let mut next = vec![];
            for goal in frontier.drain(..) {
                if !visited.insert(goal.clone()) {
                    continue;
                }
                let (object_type, object_id, goal_permission) = goal;
                let relations: Vec<String> = granting_relations(&goal_permission)
                    .into_iter()
                    .map(ToString::to_string)
                    .collect();
                for userset in self
                    .usersets_owned(&relations, &object_type, &object_id)
                    .await?
                {
                    next.push((
                        userset.subject_type,
                        userset.subject_id,
                        relation_permission(&userset.subject_relation).to_string(),
                    ));
                }
                targets.push((object_type, object_id, relations));
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let mut sql = String::from(
            "SELECT DISTINCT subject_id FROM POLICIES
            WHERE subject_relation = '' AND subject_type = ? AND subject_id > ? AND (1 = 0",
        );
        for (_, _, relations) in &targets {
            let placeholders = vec!["?"; relations.len()].join(", ");
            sql.push_str(&format!(
                " OR (object_type = ? AND object_id = ? AND relation IN ({placeholders}))"
            ));
        }
        sql.push_str(") ORDER BY subject_id LIMIT ?");

        let mut query = sqlx::query_scalar(&sql)
            .bind(req.subject_type.to_string())
            .bind(&after);
        for (object_type, object_id, relations) in &targets {
            query = query.bind(object_type).bind(object_id);
            for relation in relations {
                query = query.bind(relation);
            }
        }
        let subject_ids: Vec<String> = query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let next_cursor = if subject_ids.len() as u64 == limit {
            subject_ids.last().map(|id| encode_cursor(id)).unwrap_or_default()
        } else {
            String::new()
        };
        let policies = subject_ids
            .into_iter()
            .map(|subject_id| Policy {
                subject_type: req.subject_type,
                subject_id,
                subject_relation: String::new(),
                relation: req.relation.clone(),
                object_type: req.object_type,
                object_id: req.object.clone(),
                permission: permission.clone(),
            })
            .collect();
        Ok((policies, next_cursor))
    }

    /// Enumerate all permissions the subject holds on the object.
    #[tracing::instrument(skip(self, req), fields(subject = %req.subject, object = %req.object))]
    pub async fn retrieve_permissions(&self, req: &PolicyReq) -> Result<Vec<String>, Error> {
        let mut permissions = vec![];
        for permission in [
            ADMIN_PERMISSION,
            EDIT_PERMISSION,
            VIEW_PERMISSION,
            MEMBERSHIP_PERMISSION,
        ] {
            let candidate = PolicyReq {
                permission: permission.to_string(),
                ..req.clone()
            };
            if self.check_policy(&candidate).await? {
                permissions.push(permission.to_string());
            }
        }

        // Unknown relations pass through as permissions unchanged
        let raw: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT relation FROM POLICIES
            WHERE subject_type = ? AND subject_id = ? AND subject_relation = ''
            AND object_type = ? AND object_id = ?",
        )
        .bind(req.subject_type.to_string())
        .bind(&req.subject)
        .bind(req.object_type.to_string())
        .bind(&req.object)
        .fetch_all(&self.pool)
        .await?;
        for relation in raw {
            let permission = relation_permission(&relation).to_string();
            if !permissions.contains(&permission) {
                permissions.push(permission);
            }
        }

        Ok(permissions)
    }

    async fn direct_check(
        &self,
        subject_type: &str,
        subject_id: &str,
        relations: &[&str],
        object_type: &str,
        object_id: &str,
    ) -> Result<bool, Error> {
        let placeholders = vec!["?"; relations.len()].join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM POLICIES
            WHERE subject_type = ? AND subject_id = ? AND subject_relation = ''
            AND relation IN ({placeholders}) AND object_type = ? AND object_id = ?"
        );
        let mut query = sqlx::query_scalar(&sql).bind(subject_type).bind(subject_id);
        for relation in relations {
            query = query.bind(*relation);
        }
        let count: i64 = query
            .bind(object_type)
            .bind(object_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn usersets(
        &self,
        relations: &[&str],
        object_type: &str,
        object_id: &str,
    ) -> Result<Vec<PolicyRaw>, Error> {
        let owned: Vec<String> = relations.iter().map(ToString::to_string).collect();
        self.usersets_owned(&owned, object_type, object_id).await
    }

    async fn usersets_owned(
        &self,
        relations: &[String],
        object_type: &str,
        object_id: &str,
    ) -> Result<Vec<PolicyRaw>, Error> {
        let placeholders = vec!["?"; relations.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT * FROM POLICIES
            WHERE subject_relation <> '' AND relation IN ({placeholders})
            AND object_type = ? AND object_id = ?"
        );
        let mut query = sqlx::query_as(&sql);
        for relation in relations {
            query = query.bind(relation);
        }
        query
            .bind(object_type)
            .bind(object_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// All usersets the subject is covered by, found by walking the
    /// relations the subject holds transitively, bounded by [`MAX_LEVEL`].
    /// Grants made to a covered userset accrue to the subject, so covered
    /// usersets re-enter the walk as subjects of the next level.
    async fn subject_closure(
        &self,
        req: &PolicyReq,
    ) -> Result<Vec<(String, String, String)>, Error> {
        let mut closure = vec![];
        let mut held: HashMap<(String, String), HashSet<String>> = HashMap::new();
        let mut frontier = vec![(
            req.subject_type.to_string(),
            req.subject.clone(),
            String::new(),
        )];

        for _ in 0..MAX_LEVEL {
            let mut next = vec![];
            for (subject_type, subject_id, subject_relation) in frontier.drain(..) {
                let grants: Vec<PolicyRaw> = sqlx::query_as(
                    "SELECT * FROM POLICIES WHERE subject_type = ? AND subject_id = ? AND subject_relation = ?",
                )
                .bind(&subject_type)
                .bind(&subject_id)
                .bind(&subject_relation)
                .fetch_all(&self.pool)
                .await?;

                for grant in grants {
                    let entity = (grant.object_type.clone(), grant.object_id.clone());
                    let relations = held.entry(entity.clone()).or_default();
                    if !relations.insert(grant.relation.clone()) {
                        continue;
                    }

                    // Usersets on this entity the newly held relation covers
                    let referenced: Vec<String> = sqlx::query_scalar(
                        "SELECT DISTINCT subject_relation FROM POLICIES
                        WHERE subject_type = ? AND subject_id = ? AND subject_relation <> ''",
                    )
                    .bind(&entity.0)
                    .bind(&entity.1)
                    .fetch_all(&self.pool)
                    .await?;
                    for covered in referenced {
                        let satisfied = granting_relations(relation_permission(&covered))
                            .contains(&grant.relation.as_str());
                        if satisfied {
                            let userset = (entity.0.clone(), entity.1.clone(), covered);
                            if !closure.contains(&userset) {
                                closure.push(userset.clone());
                                next.push(userset);
                            }
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(closure)
    }
}

#[cfg(test)]
mod tests {
    use warden_types::policy::{ADMINISTRATOR_RELATION, EDITOR_RELATION, MEMBER_RELATION};

    use crate::repos::key::tests::pool;

    use super::*;

    fn tuple(
        subject_type: EntityType,
        subject_id: &str,
        subject_relation: &str,
        relation: &str,
        object_type: EntityType,
        object_id: &str,
    ) -> Policy {
        Policy {
            subject_type,
            subject_id: subject_id.into(),
            subject_relation: subject_relation.into(),
            relation: relation.into(),
            object_type,
            object_id: object_id.into(),
            permission: String::new(),
        }
    }

    fn check_req(subject: &str, permission: &str, object_type: EntityType, object: &str) -> PolicyReq {
        PolicyReq {
            subject: subject.into(),
            subject_type: EntityType::User,
            object: object.into(),
            object_type,
            permission: permission.into(),
            ..PolicyReq::default()
        }
    }

    #[tokio::test]
    async fn save_check_delete() {
        let repo = PolicyRepo::new(pool().await);

        let admin = tuple(
            EntityType::User,
            "u1",
            "",
            ADMINISTRATOR_RELATION,
            EntityType::Domain,
            "d1",
        );
        repo.save_policies(std::slice::from_ref(&admin)).await.unwrap();

        // Every stored tuple must check ok
        assert!(repo
            .check_policy(&check_req("u1", ADMIN_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap());
        // Administrator satisfies the weaker permissions too
        assert!(repo
            .check_policy(&check_req("u1", VIEW_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap());
        assert!(!repo
            .check_policy(&check_req("u2", VIEW_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap());

        repo.delete_policies(std::slice::from_ref(&admin)).await.unwrap();
        assert!(!repo
            .check_policy(&check_req("u1", ADMIN_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap());

        // Deleting the same set again is a no-op
        repo.delete_policies(std::slice::from_ref(&admin)).await.unwrap();
    }

    #[tokio::test]
    async fn conflicting_batch_rolls_back() {
        let repo = PolicyRepo::new(pool().await);

        let first = tuple(
            EntityType::User,
            "u1",
            "",
            EDITOR_RELATION,
            EntityType::Domain,
            "d1",
        );
        repo.save_policies(std::slice::from_ref(&first)).await.unwrap();

        let fresh = tuple(
            EntityType::User,
            "u2",
            "",
            EDITOR_RELATION,
            EntityType::Domain,
            "d1",
        );
        let err = repo
            .save_policies(&[fresh.clone(), first.clone()])
            .await
            .unwrap_err();
        assert!(matches!(
            err.variant,
            ErrorType::UniqueConstraintViolation { .. }
        ));

        // The non-conflicting half of the batch must not have been applied
        assert!(!repo
            .check_policy(&check_req("u2", EDIT_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap());

        // Empty batches are no-ops
        repo.save_policies(&[]).await.unwrap();
        repo.delete_policies(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn userset_expansion() {
        let repo = PolicyRepo::new(pool().await);

        repo.save_policies(&[
            // u1 is a member of group g1
            tuple(
                EntityType::User,
                "u1",
                "",
                MEMBER_RELATION,
                EntityType::Group,
                "g1",
            ),
            // members of g1 are editors of domain d1
            tuple(
                EntityType::Group,
                "g1",
                MEMBER_RELATION,
                EDITOR_RELATION,
                EntityType::Domain,
                "d1",
            ),
        ])
        .await
        .unwrap();

        assert!(repo
            .check_policy(&check_req("u1", EDIT_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap());
        assert!(repo
            .check_policy(&check_req("u1", VIEW_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap());
        assert!(!repo
            .check_policy(&check_req("u1", ADMIN_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap());
        assert!(!repo
            .check_policy(&check_req("u2", VIEW_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_user_policies_purges_subject() {
        let repo = PolicyRepo::new(pool().await);

        repo.save_policies(&[
            tuple(
                EntityType::User,
                "u1",
                "",
                ADMINISTRATOR_RELATION,
                EntityType::Domain,
                "d1",
            ),
            tuple(
                EntityType::User,
                "u1",
                "",
                MEMBER_RELATION,
                EntityType::Group,
                "g1",
            ),
            tuple(
                EntityType::User,
                "u2",
                "",
                EDITOR_RELATION,
                EntityType::Domain,
                "d1",
            ),
        ])
        .await
        .unwrap();

        repo.delete_user_policies("u1").await.unwrap();

        assert!(!repo
            .check_policy(&check_req("u1", ADMIN_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap());
        assert!(!repo
            .check_policy(&check_req(
                "u1",
                MEMBERSHIP_PERMISSION,
                EntityType::Group,
                "g1"
            ))
            .await
            .unwrap());
        // Other subjects are untouched
        assert!(repo
            .check_policy(&check_req("u2", EDIT_PERMISSION, EntityType::Domain, "d1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_by_filter() {
        let repo = PolicyRepo::new(pool().await);

        repo.save_policies(&[
            tuple(
                EntityType::User,
                "u1",
                "",
                ADMINISTRATOR_RELATION,
                EntityType::Group,
                "g1",
            ),
            tuple(
                EntityType::User,
                "u2",
                "",
                EDITOR_RELATION,
                EntityType::Group,
                "g1",
            ),
            tuple(
                EntityType::User,
                "u1",
                "",
                ADMINISTRATOR_RELATION,
                EntityType::Group,
                "g2",
            ),
        ])
        .await
        .unwrap();

        // Everything on g1 goes away, g2 stays
        repo.delete_policy_filter(&PolicyFilter {
            object_type: Some(EntityType::Group),
            object_id: Some("g1".into()),
            ..PolicyFilter::default()
        })
        .await
        .unwrap();

        assert!(!repo
            .check_policy(&check_req("u1", ADMIN_PERMISSION, EntityType::Group, "g1"))
            .await
            .unwrap());
        assert!(repo
            .check_policy(&check_req("u1", ADMIN_PERMISSION, EntityType::Group, "g2"))
            .await
            .unwrap());

        let err = repo
            .delete_policy_filter(&PolicyFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err.variant, ErrorType::MalformedEntity(_)));
    }

    #[tokio::test]
    async fn retrieve_objects_paginates_without_gaps() {
        let repo = PolicyRepo::new(pool().await);

        let mut policies = vec![];
        for i in 0..25 {
            policies.push(tuple(
                EntityType::User,
                "u1",
                "",
                EDITOR_RELATION,
                EntityType::Client,
                &format!("c{i:03}"),
            ));
        }
        // One reachable through a group userset
        policies.push(tuple(
            EntityType::User,
            "u1",
            "",
            MEMBER_RELATION,
            EntityType::Group,
            "g1",
        ));
        policies.push(tuple(
            EntityType::Group,
            "g1",
            MEMBER_RELATION,
            EDITOR_RELATION,
            EntityType::Client,
            "c900",
        ));
        repo.save_policies(&policies).await.unwrap();

        let req = PolicyReq {
            subject: "u1".into(),
            subject_type: EntityType::User,
            object_type: EntityType::Client,
            permission: EDIT_PERMISSION.into(),
            ..PolicyReq::default()
        };

        let mut seen = vec![];
        let mut cursor = String::new();
        loop {
            let (page, next) = repo.retrieve_objects(&req, &cursor, 10).await.unwrap();
            assert!(page.len() <= 10);
            seen.extend(page.into_iter().map(|p| p.object_id));
            if next.is_empty() {
                break;
            }
            cursor = next;
        }

        // All 26 objects, no duplicates, no omissions
        assert_eq!(seen.len(), 26);
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 26);
        assert!(seen.contains(&"c900".to_string()));
    }

    #[tokio::test]
    async fn retrieve_subjects_expands_usersets() {
        let repo = PolicyRepo::new(pool().await);

        repo.save_policies(&[
            tuple(
                EntityType::User,
                "u1",
                "",
                ADMINISTRATOR_RELATION,
                EntityType::Domain,
                "d1",
            ),
            tuple(
                EntityType::User,
                "u2",
                "",
                MEMBER_RELATION,
                EntityType::Group,
                "g1",
            ),
            tuple(
                EntityType::Group,
                "g1",
                MEMBER_RELATION,
                EDITOR_RELATION,
                EntityType::Domain,
                "d1",
            ),
        ])
        .await
        .unwrap();

        let req = PolicyReq {
            subject_type: EntityType::User,
            object: "d1".into(),
            object_type: EntityType::Domain,
            permission: VIEW_PERMISSION.into(),
            ..PolicyReq::default()
        };
        let (subjects, cursor) = repo.retrieve_subjects(&req, "", 10).await.unwrap();
        assert!(cursor.is_empty());
        let mut ids: Vec<_> = subjects.into_iter().map(|p| p.subject_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn retrieve_permissions_enumerates() {
        let repo = PolicyRepo::new(pool().await);

        repo.save_policies(&[tuple(
            EntityType::User,
            "u1",
            "",
            EDITOR_RELATION,
            EntityType::Domain,
            "d1",
        )])
        .await
        .unwrap();

        let req = check_req("u1", "", EntityType::Domain, "d1");
        let permissions = repo.retrieve_permissions(&req).await.unwrap();
        assert!(permissions.contains(&EDIT_PERMISSION.to_string()));
        assert!(permissions.contains(&VIEW_PERMISSION.to_string()));
        assert!(permissions.contains(&MEMBERSHIP_PERMISSION.to_string()));
        assert!(!permissions.contains(&ADMIN_PERMISSION.to_string()));
    }
}
