use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use warden_types::{
    group::{Group, GroupFilter, MemberKind, MAX_LEVEL},
    key::Key,
    page::Page,
    policy::{
        EntityType, Policy, PolicyFilter, PolicyReq, ADMINISTRATOR_RELATION, ADMIN_PERMISSION,
        EDIT_PERMISSION, GUEST_RELATION, MEMBERSHIP_PERMISSION, MEMBER_RELATION, VIEW_PERMISSION,
    },
};

use crate::{
    error::{Error, ErrorType},
    idp::IdProvider,
    repos::{group::GroupRepo, policy::PolicyRepo},
};

use super::{actor, token::AuthService};

fn member_entity(kind: MemberKind) -> EntityType {
    match kind {
        MemberKind::Users => EntityType::User,
        MemberKind::Things => EntityType::Client,
    }
}

/// Facade over the group tree. Every mutating call authorizes the caller
/// first and mirrors the relationship into the policy store.
#[derive(Clone)]
pub struct GroupService {
    auth: AuthService,
    groups: GroupRepo,
    policies: PolicyRepo,
    idp: Arc<dyn IdProvider>,
}

impl GroupService {
    #[must_use]
    pub fn new(
        auth: AuthService,
        groups: GroupRepo,
        policies: PolicyRepo,
        idp: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            auth,
            groups,
            policies,
            idp,
        }
    }

    /// Create a group inside a domain. The caller must be a member of the
    /// domain; the caller becomes the group administrator and domain members
    /// may view the group.
    #[tracing::instrument(skip(self, token, group))]
    pub async fn create_group(
        &self,
        token: &str,
        domain_id: &str,
        mut group: Group,
    ) -> Result<Group, Error> {
        if group.name.trim().is_empty() {
            return Err(ErrorType::MalformedEntity("Group name cannot be empty".to_string()).into());
        }
        let key = self
            .authorize_domain(token, MEMBERSHIP_PERMISSION, domain_id)
            .await?;

        group.id = self.idp.id();
        group.owner_id = domain_id.to_string();
        let now = Utc::now();
        group.created_at = now;
        group.updated_at = now;
        let group = self.groups.save(&group).await?;

        let mirror = [
            Policy {
                subject_type: EntityType::User,
                subject_id: key.subject.clone(),
                subject_relation: String::new(),
                relation: ADMINISTRATOR_RELATION.into(),
                object_type: EntityType::Group,
                object_id: group.id.clone(),
                permission: String::new(),
            },
            Policy {
                subject_type: EntityType::Domain,
                subject_id: domain_id.to_string(),
                subject_relation: MEMBER_RELATION.into(),
                relation: GUEST_RELATION.into(),
                object_type: EntityType::Group,
                object_id: group.id.clone(),
                permission: String::new(),
            },
        ];
        if let Err(err) = self.policies.save_policies(&mirror).await {
            // Mirror failure rolls the store write back
            let _ = self.groups.delete(&group.id).await;
            return Err(err);
        }

        Ok(group)
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn view_group(&self, token: &str, group_id: &str) -> Result<Group, Error> {
        let group = self.groups.retrieve_by_id(group_id).await?;
        self.authorize_group(token, VIEW_PERMISSION, &group).await?;
        Ok(group)
    }

    /// Mutates name, description and metadata only.
    #[tracing::instrument(skip(self, token, group), fields(id = %group.id))]
    pub async fn update_group(&self, token: &str, group: Group) -> Result<Group, Error> {
        let stored = self.groups.retrieve_by_id(&group.id).await?;
        self.authorize_group(token, EDIT_PERMISSION, &stored).await?;
        self.groups.update(&group).await
    }

    /// Delete a group and the mirrored policies of its subtree. Rejected
    /// while the group or any descendant still has members.
    #[tracing::instrument(skip(self, token))]
    pub async fn delete_group(&self, token: &str, group_id: &str) -> Result<(), Error> {
        let group = self.groups.retrieve_by_id(group_id).await?;
        self.authorize_group(token, ADMIN_PERMISSION, &group).await?;

        // The cascade will take the descendants with it, so collect their
        // ids for the policy cleanup first
        let subtree = self
            .groups
            .retrieve_children(
                group_id,
                &GroupFilter {
                    level: MAX_LEVEL,
                    limit: u64::MAX,
                    ..GroupFilter::default()
                },
            )
            .await?;
        self.groups.delete(group_id).await?;

        let cleanups = subtree.items.into_iter().map(|descendant| {
            let policies = self.policies.clone();
            async move {
                policies
                    .delete_policy_filter(&PolicyFilter {
                        object_type: Some(EntityType::Group),
                        object_id: Some(descendant.id),
                        ..PolicyFilter::default()
                    })
                    .await
            }
        });
        for res in join_all(cleanups).await {
            res?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, token, filter))]
    pub async fn list_groups(
        &self,
        token: &str,
        domain_id: &str,
        mut filter: GroupFilter,
    ) -> Result<Page<Group>, Error> {
        self.authorize_domain(token, MEMBERSHIP_PERMISSION, domain_id)
            .await?;
        filter.owner_id = Some(domain_id.to_string());
        self.groups.retrieve_all(&filter).await
    }

    #[tracing::instrument(skip(self, token, filter))]
    pub async fn list_parents(
        &self,
        token: &str,
        group_id: &str,
        filter: GroupFilter,
    ) -> Result<Page<Group>, Error> {
        let group = self.groups.retrieve_by_id(group_id).await?;
        self.authorize_group(token, VIEW_PERMISSION, &group).await?;
        self.groups.retrieve_parents(group_id, &filter).await
    }

    #[tracing::instrument(skip(self, token, filter))]
    pub async fn list_children(
        &self,
        token: &str,
        group_id: &str,
        filter: GroupFilter,
    ) -> Result<Page<Group>, Error> {
        let group = self.groups.retrieve_by_id(group_id).await?;
        self.authorize_group(token, VIEW_PERMISSION, &group).await?;
        self.groups.retrieve_children(group_id, &filter).await
    }

    /// Assign members to a group and mirror the member relation.
    #[tracing::instrument(skip(self, token, member_ids))]
    pub async fn assign(
        &self,
        token: &str,
        group_id: &str,
        kind: MemberKind,
        member_ids: &[String],
    ) -> Result<(), Error> {
        let group = self.groups.retrieve_by_id(group_id).await?;
        self.authorize_group(token, EDIT_PERMISSION, &group).await?;

        self.groups.assign(group_id, kind, member_ids).await?;

        let mirror: Vec<Policy> = member_ids
            .iter()
            .map(|member_id| Policy {
                subject_type: member_entity(kind),
                subject_id: member_id.clone(),
                subject_relation: String::new(),
                relation: MEMBER_RELATION.into(),
                object_type: EntityType::Group,
                object_id: group_id.to_string(),
                permission: String::new(),
            })
            .collect();
        if let Err(err) = self.policies.save_policies(&mirror).await {
            let _ = self.groups.unassign(group_id, member_ids).await;
            return Err(err);
        }
        Ok(())
    }

    /// Unassign members and drop the mirrored relations. Idempotent.
    #[tracing::instrument(skip(self, token, member_ids))]
    pub async fn unassign(
        &self,
        token: &str,
        group_id: &str,
        member_ids: &[String],
    ) -> Result<(), Error> {
        let group = self.groups.retrieve_by_id(group_id).await?;
        self.authorize_group(token, EDIT_PERMISSION, &group).await?;

        self.groups.unassign(group_id, member_ids).await?;

        for member_id in member_ids {
            self.policies
                .delete_policy_filter(&PolicyFilter {
                    subject_id: Some(member_id.clone()),
                    relation: Some(MEMBER_RELATION.into()),
                    object_type: Some(EntityType::Group),
                    object_id: Some(group_id.to_string()),
                    ..PolicyFilter::default()
                })
                .await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, token, filter))]
    pub async fn list_members(
        &self,
        token: &str,
        group_id: &str,
        kind: MemberKind,
        filter: GroupFilter,
    ) -> Result<Page<String>, Error> {
        let group = self.groups.retrieve_by_id(group_id).await?;
        self.authorize_group(token, VIEW_PERMISSION, &group).await?;
        self.groups.members(group_id, kind, &filter).await
    }

    /// The groups a member belongs to; restricted to the member itself or a
    /// platform admin.
    #[tracing::instrument(skip(self, token, filter))]
    pub async fn list_memberships(
        &self,
        token: &str,
        member_id: &str,
        filter: GroupFilter,
    ) -> Result<Page<Group>, Error> {
        let key = self.auth.identify(token).await?;
        if actor(&key) != member_id && !self.auth.is_platform_admin(actor(&key)).await? {
            return Err(ErrorType::Authorization.into());
        }
        self.groups.memberships(member_id, &filter).await
    }

    async fn authorize_group(
        &self,
        token: &str,
        permission: &str,
        group: &Group,
    ) -> Result<Key, Error> {
        let key = self.auth.identify(token).await?;
        self.auth
            .authorize(&PolicyReq {
                subject: key.subject.clone(),
                subject_type: EntityType::User,
                object: group.id.clone(),
                object_type: EntityType::Group,
                permission: permission.into(),
                domain: group.owner_id.clone(),
                ..PolicyReq::default()
            })
            .await?;
        Ok(key)
    }

    async fn authorize_domain(
        &self,
        token: &str,
        permission: &str,
        domain_id: &str,
    ) -> Result<Key, Error> {
        let key = self.auth.identify(token).await?;
        self.auth
            .authorize(&PolicyReq {
                subject: key.subject.clone(),
                subject_type: EntityType::User,
                object: domain_id.to_string(),
                object_type: EntityType::Domain,
                permission: permission.into(),
                domain: domain_id.to_string(),
                ..PolicyReq::default()
            })
            .await?;
        Ok(key)
    }
}
