use std::sync::Arc;

use chrono::Utc;
use warden_types::{
    domain::{encode_domain_user_id, Domain, DomainFilter, DomainStatus, DomainUpdate},
    key::Key,
    page::Page,
    policy::{
        EntityType, Policy, PolicyFilter, PolicyReq, ADMINISTRATOR_RELATION, ADMIN_PERMISSION,
        EDIT_PERMISSION, MEMBERSHIP_PERMISSION, MEMBER_RELATION, PLATFORM_ID,
    },
};

use crate::{
    error::{Error, ErrorType},
    idp::IdProvider,
    repos::{domain::DomainRepo, policy::PolicyRepo},
};

use super::{actor, token::AuthService};

/// Facade over the domain store. Domains carry their owner policies in the
/// mirrored policy store.
#[derive(Clone)]
pub struct DomainService {
    auth: AuthService,
    domains: DomainRepo,
    policies: PolicyRepo,
    idp: Arc<dyn IdProvider>,
}

impl DomainService {
    #[must_use]
    pub fn new(
        auth: AuthService,
        domains: DomainRepo,
        policies: PolicyRepo,
        idp: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            auth,
            domains,
            policies,
            idp,
        }
    }

    /// Create a domain. Any authenticated principal may open a tenant; the
    /// creator becomes its administrator, in both plain and domain-scoped
    /// subject forms, and the domain is registered under the platform.
    #[tracing::instrument(skip_all, fields(alias = %domain.alias))]
    pub async fn create_domain(&self, token: &str, mut domain: Domain) -> Result<Domain, Error> {
        let key = self.auth.identify(token).await?;
        let creator = actor(&key).to_string();

        if domain.alias.trim().is_empty() {
            return Err(
                ErrorType::MalformedEntity("Domain alias cannot be empty".to_string()).into(),
            );
        }

        domain.id = self.idp.id();
        domain.created_by = creator.clone();
        domain.created_at = Utc::now();
        domain.updated_by = None;
        domain.updated_at = None;
        let stored = self.domains.save(&domain).await?;

        let mirror = [
            Policy {
                subject_type: EntityType::User,
                subject_id: creator.clone(),
                subject_relation: String::new(),
                relation: ADMINISTRATOR_RELATION.into(),
                object_type: EntityType::Domain,
                object_id: stored.id.clone(),
                permission: String::new(),
            },
            Policy {
                subject_type: EntityType::User,
                subject_id: encode_domain_user_id(&stored.id, &creator),
                subject_relation: String::new(),
                relation: ADMINISTRATOR_RELATION.into(),
                object_type: EntityType::Domain,
                object_id: stored.id.clone(),
                permission: String::new(),
            },
            Policy {
                subject_type: EntityType::Domain,
                subject_id: stored.id.clone(),
                subject_relation: String::new(),
                relation: MEMBER_RELATION.into(),
                object_type: EntityType::Platform,
                object_id: PLATFORM_ID.into(),
                permission: String::new(),
            },
        ];
        if let Err(err) = self.policies.save_policies(&mirror).await {
            // Mirror failure rolls the store write back
            let _ = self.domains.delete(&stored.id).await;
            return Err(err);
        }

        Ok(stored)
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn retrieve_domain(&self, token: &str, domain_id: &str) -> Result<Domain, Error> {
        let key = self.auth.identify(token).await?;
        if !self.auth.is_platform_admin(actor(&key)).await? {
            self.authorize(&key, MEMBERSHIP_PERMISSION, domain_id).await?;
        }
        self.domains.retrieve_by_id(domain_id).await
    }

    /// List domains visible to the caller: everything for a platform admin,
    /// otherwise only domains the caller holds a policy on.
    #[tracing::instrument(skip(self, token, filter))]
    pub async fn list_domains(
        &self,
        token: &str,
        mut filter: DomainFilter,
    ) -> Result<Page<Domain>, Error> {
        let key = self.auth.identify(token).await?;
        if self.auth.is_platform_admin(actor(&key)).await? {
            filter.subject_id = None;
        } else {
            filter.subject_id = Some(actor(&key).to_string());
        }
        self.domains.list_domains(&filter).await
    }

    #[tracing::instrument(skip(self, token, update))]
    pub async fn update_domain(
        &self,
        token: &str,
        domain_id: &str,
        update: DomainUpdate,
    ) -> Result<Domain, Error> {
        let key = self.auth.identify(token).await?;
        self.authorize(&key, EDIT_PERMISSION, domain_id).await?;
        self.domains.update(domain_id, actor(&key), &update).await
    }

    /// Enable or disable a domain.
    #[tracing::instrument(skip(self, token))]
    pub async fn change_domain_status(
        &self,
        token: &str,
        domain_id: &str,
        status: DomainStatus,
    ) -> Result<Domain, Error> {
        let key = self.auth.identify(token).await?;
        self.authorize(&key, ADMIN_PERMISSION, domain_id).await?;
        self.domains
            .update(
                domain_id,
                actor(&key),
                &DomainUpdate {
                    status: Some(status),
                    ..DomainUpdate::default()
                },
            )
            .await
    }

    /// Hard delete; platform admins only. The domain's policies, in both
    /// subject and object position, go with it.
    #[tracing::instrument(skip(self, token))]
    pub async fn delete_domain(&self, token: &str, domain_id: &str) -> Result<(), Error> {
        self.auth.require_platform_admin(token).await?;
        self.domains.delete(domain_id).await?;

        self.policies
            .delete_policy_filter(&PolicyFilter {
                object_type: Some(EntityType::Domain),
                object_id: Some(domain_id.to_string()),
                ..PolicyFilter::default()
            })
            .await?;
        self.policies
            .delete_policy_filter(&PolicyFilter {
                subject_type: Some(EntityType::Domain),
                subject_id: Some(domain_id.to_string()),
                ..PolicyFilter::default()
            })
            .await
    }

    /// Grant a user a relation on the domain, in both plain and
    /// domain-scoped subject forms.
    #[tracing::instrument(skip(self, token))]
    pub async fn assign_user(
        &self,
        token: &str,
        domain_id: &str,
        user_id: &str,
        relation: &str,
    ) -> Result<(), Error> {
        let key = self.auth.identify(token).await?;
        self.authorize(&key, ADMIN_PERMISSION, domain_id).await?;

        self.policies
            .save_policies(&[
                Policy {
                    subject_type: EntityType::User,
                    subject_id: user_id.to_string(),
                    subject_relation: String::new(),
                    relation: relation.to_string(),
                    object_type: EntityType::Domain,
                    object_id: domain_id.to_string(),
                    permission: String::new(),
                },
                Policy {
                    subject_type: EntityType::User,
                    subject_id: encode_domain_user_id(domain_id, user_id),
                    subject_relation: String::new(),
                    relation: relation.to_string(),
                    object_type: EntityType::Domain,
                    object_id: domain_id.to_string(),
                    permission: String::new(),
                },
            ])
            .await
    }

    /// Drop every relation the user holds on the domain. Idempotent.
    #[tracing::instrument(skip(self, token))]
    pub async fn unassign_user(
        &self,
        token: &str,
        domain_id: &str,
        user_id: &str,
    ) -> Result<(), Error> {
        let key = self.auth.identify(token).await?;
        self.authorize(&key, ADMIN_PERMISSION, domain_id).await?;

        for subject_id in [
            user_id.to_string(),
            encode_domain_user_id(domain_id, user_id),
        ] {
            self.policies
                .delete_policy_filter(&PolicyFilter {
                    subject_type: Some(EntityType::User),
                    subject_id: Some(subject_id),
                    object_type: Some(EntityType::Domain),
                    object_id: Some(domain_id.to_string()),
                    ..PolicyFilter::default()
                })
                .await?;
        }
        Ok(())
    }

    /// The domains a user belongs to; restricted to the user themselves or a
    /// platform admin.
    #[tracing::instrument(skip(self, token, filter))]
    pub async fn list_user_domains(
        &self,
        token: &str,
        user_id: &str,
        mut filter: DomainFilter,
    ) -> Result<Page<Domain>, Error> {
        let key = self.auth.identify(token).await?;
        if actor(&key) != user_id && !self.auth.is_platform_admin(actor(&key)).await? {
            return Err(ErrorType::Authorization.into());
        }
        filter.subject_id = Some(user_id.to_string());
        self.domains.list_domains(&filter).await
    }

    /// The permissions the caller holds on the domain.
    #[tracing::instrument(skip(self, token))]
    pub async fn list_permissions(
        &self,
        token: &str,
        domain_id: &str,
    ) -> Result<Vec<String>, Error> {
        let key = self.auth.identify(token).await?;
        self.policies
            .retrieve_permissions(&PolicyReq {
                subject: key.subject.clone(),
                subject_type: EntityType::User,
                object: domain_id.to_string(),
                object_type: EntityType::Domain,
                ..PolicyReq::default()
            })
            .await
    }

    async fn authorize(&self, key: &Key, permission: &str, domain_id: &str) -> Result<(), Error> {
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
            .await
    }
}
