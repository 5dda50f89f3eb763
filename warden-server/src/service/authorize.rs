use warden_types::{
    key::Key,
    policy::{
        EntityType, Policy, PolicyFilter, PolicyReq, SubjectKind, MEMBERSHIP_PERMISSION,
        PLATFORM_ID,
    },
};

use crate::error::{Error, ErrorType};

use super::{actor, token::AuthService};

impl AuthService {
    /// Decide whether the subject may perform the requested action on the
    /// object. Token subjects are identified first; user subjects acting on
    /// domain-bound objects must be members of the referenced domain.
    #[tracing::instrument(skip_all, fields(object = %req.object, object_type = %req.object_type))]
    pub async fn authorize(&self, req: &PolicyReq) -> Result<(), Error> {
        let mut req = req.clone();

        if req.object_type == EntityType::Platform && req.object != PLATFORM_ID {
            return Err(ErrorType::MalformedEntity(format!(
                "`{}` is not the platform object",
                req.object
            ))
            .into());
        }

        if req.subject_kind == SubjectKind::Tokens {
            let key = self.identify(&req.subject).await?;
            req.subject = key.subject.clone();
            if req.domain.is_empty() {
                if let Some(domain) = key.domain {
                    req.domain = domain;
                }
            }
            if req.subject.is_empty()
                && matches!(
                    req.object_type,
                    EntityType::Group | EntityType::Client | EntityType::Domain
                )
            {
                return Err(ErrorType::DomainAuthorization.into());
            }
            req.subject_kind = SubjectKind::Users;
        }

        if req.subject_type == EntityType::User
            && matches!(
                req.object_type,
                EntityType::Group | EntityType::Client | EntityType::Domain
            )
            && !self.is_platform_admin(&req.subject).await?
        {
            let domain_id = if req.object_type == EntityType::Domain {
                req.object.clone()
            } else {
                req.domain.clone()
            };
            let member = !domain_id.is_empty()
                && self
                    .policies
                    .check_policy(&PolicyReq {
                        subject: req.subject.clone(),
                        subject_type: EntityType::User,
                        object: domain_id,
                        object_type: EntityType::Domain,
                        permission: MEMBERSHIP_PERMISSION.into(),
                        ..PolicyReq::default()
                    })
                    .await?;
            if !member {
                return Err(ErrorType::DomainAuthorization.into());
            }
        }

        if !self.policies.check_policy(&req).await? {
            return Err(ErrorType::Authorization.into());
        }
        Ok(())
    }

    pub async fn add_policy(&self, token: &str, policy: Policy) -> Result<(), Error> {
        self.add_policies(token, std::slice::from_ref(&policy)).await
    }

    /// Arbitrary tuple writes are a platform-admin operation; the stores
    /// mirror their own tuples internally.
    #[tracing::instrument(skip_all, fields(count = policies.len()))]
    pub async fn add_policies(&self, token: &str, policies: &[Policy]) -> Result<(), Error> {
        self.require_platform_admin(token).await?;
        self.policies.save_policies(policies).await
    }

    pub async fn delete_policy(&self, token: &str, policy: Policy) -> Result<(), Error> {
        self.delete_policies(token, std::slice::from_ref(&policy))
            .await
    }

    #[tracing::instrument(skip_all, fields(count = policies.len()))]
    pub async fn delete_policies(&self, token: &str, policies: &[Policy]) -> Result<(), Error> {
        self.require_platform_admin(token).await?;
        self.policies.delete_policies(policies).await
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn delete_policy_filter(
        &self,
        token: &str,
        filter: &PolicyFilter,
    ) -> Result<(), Error> {
        self.require_platform_admin(token).await?;
        self.policies.delete_policy_filter(filter).await
    }

    /// Purge every policy the user appears in as a subject, as part of user
    /// deletion.
    #[tracing::instrument(skip(self, token))]
    pub async fn delete_user_policies(&self, token: &str, user_id: &str) -> Result<(), Error> {
        self.require_platform_admin(token).await?;
        self.policies.delete_user_policies(user_id).await
    }

    pub async fn list_objects(
        &self,
        req: &PolicyReq,
        cursor: &str,
        limit: u64,
    ) -> Result<(Vec<Policy>, String), Error> {
        self.policies.retrieve_objects(req, cursor, limit).await
    }

    pub async fn list_subjects(
        &self,
        req: &PolicyReq,
        cursor: &str,
        limit: u64,
    ) -> Result<(Vec<Policy>, String), Error> {
        self.policies.retrieve_subjects(req, cursor, limit).await
    }

    pub async fn list_permissions(&self, req: &PolicyReq) -> Result<Vec<String>, Error> {
        self.policies.retrieve_permissions(req).await
    }

    pub(crate) async fn require_platform_admin(&self, token: &str) -> Result<Key, Error> {
        let caller = self.identify(token).await?;
        if !self.is_platform_admin(actor(&caller)).await? {
            return Err(ErrorType::Authorization.into());
        }
        Ok(caller)
    }
}
