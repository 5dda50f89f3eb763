use std::sync::Arc;

use chrono::{Duration, Utc};
use warden_types::{
    domain::encode_domain_user_id,
    key::{Key, KeyFilter, KeyType, Token},
    page::Page,
    policy::{EntityType, PolicyReq, ADMIN_PERMISSION, MEMBERSHIP_PERMISSION, PLATFORM_ID},
};

use crate::{
    error::{Error, ErrorType},
    idp::IdProvider,
    repos::{key::KeyRepo, policy::PolicyRepo},
    tokenizer::Tokenizer,
};

const RECOVERY_TTL_MINUTES: i64 = 5;

/// Orchestrates the tokenizer and the key and policy stores. Owns no
/// persistent state of its own.
#[derive(Clone)]
pub struct AuthService {
    pub(crate) tokenizer: Arc<dyn Tokenizer>,
    pub(crate) idp: Arc<dyn IdProvider>,
    pub(crate) keys: KeyRepo,
    pub(crate) policies: PolicyRepo,
    access_ttl: Duration,
    refresh_ttl: Duration,
    invitation_ttl: Duration,
}

impl AuthService {
    #[must_use]
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        idp: Arc<dyn IdProvider>,
        keys: KeyRepo,
        policies: PolicyRepo,
        access_ttl: Duration,
        refresh_ttl: Duration,
        invitation_ttl: Duration,
    ) -> Self {
        Self {
            tokenizer,
            idp,
            keys,
            policies,
            access_ttl,
            refresh_ttl,
            invitation_ttl,
        }
    }

    /// Issue a token for the key, dispatching on the key type.
    #[tracing::instrument(skip_all, fields(variant = %key.variant))]
    pub async fn issue(&self, caller_token: &str, mut key: Key) -> Result<Token, Error> {
        key.issued_at = Utc::now();
        match key.variant {
            KeyType::Api => self.issue_api_key(caller_token, key).await,
            KeyType::Refresh => self.refresh_key(caller_token, key).await,
            KeyType::Recovery => self.recovery_key(key),
            KeyType::Invitation => self.invitation_key(key).await,
            KeyType::Access => self.access_key(key).await,
        }
    }

    /// Revoke a persisted API key of the caller. Idempotent.
    #[tracing::instrument(skip(self, token))]
    pub async fn revoke(&self, token: &str, id: &str) -> Result<(), Error> {
        let caller = self.identify(token).await?;
        self.keys.remove(&caller.issuer, id).await
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn retrieve_key(&self, token: &str, id: &str) -> Result<Key, Error> {
        let caller = self.identify(token).await?;
        self.keys.retrieve(&caller.issuer, id).await
    }

    #[tracing::instrument(skip(self, token, filter))]
    pub async fn retrieve_keys(
        &self,
        token: &str,
        filter: &KeyFilter,
    ) -> Result<Page<Key>, Error> {
        let caller = self.identify(token).await?;
        self.keys.retrieve_all(&caller.issuer, filter).await
    }

    /// Resolve a token to the key it carries. Expired API keys are removed
    /// from the store best-effort; revoked API keys stop identifying.
    #[tracing::instrument(skip_all)]
    pub async fn identify(&self, token: &str) -> Result<Key, Error> {
        let key = match self.tokenizer.parse(token) {
            Ok(key) => key,
            Err(err) => {
                if let ErrorType::KeyExpired { key } = &err.variant {
                    if key.variant == KeyType::Api {
                        // Eager cleanup; the row may already be gone
                        let _ = self.keys.remove(&key.issuer, &key.id).await;
                    }
                }
                return Err(err.into_authentication());
            }
        };

        match key.variant {
            KeyType::Api => match self.keys.retrieve(&key.issuer, &key.id).await {
                Ok(_) => Ok(key),
                Err(err) if err.is_not_found() => Err(err.into_authentication()),
                Err(err) => Err(err),
            },
            _ => Ok(key),
        }
    }

    pub(crate) async fn is_platform_admin(&self, user: &str) -> Result<bool, Error> {
        self.policies
            .check_policy(&PolicyReq {
                subject: user.into(),
                subject_type: EntityType::User,
                object: PLATFORM_ID.into(),
                object_type: EntityType::Platform,
                permission: ADMIN_PERMISSION.into(),
                ..PolicyReq::default()
            })
            .await
    }

    async fn issue_api_key(&self, caller_token: &str, mut key: Key) -> Result<Token, Error> {
        let caller = self
            .tokenizer
            .parse(caller_token)
            .map_err(Error::into_authentication)?;
        if caller.variant != KeyType::Access || caller.issuer.is_empty() {
            return Err(ErrorType::Authentication(anyhow::Error::msg(
                "API keys can only be issued with an access token",
            ))
            .into());
        }

        key.issuer = caller.issuer;
        if key.subject.is_empty() {
            key.subject = caller.subject;
        }
        key.id = self.idp.id();
        // A nil expiry means the key never expires
        if let Some(expires_at) = key.expires_at {
            if expires_at <= key.issued_at {
                return Err(ErrorType::MalformedEntity(
                    "Key expiry must be after issuance".to_string(),
                )
                .into());
            }
        }

        self.keys.save(&key).await?;
        let access_token = self.tokenizer.issue(&key)?;
        Ok(Token {
            access_token,
            refresh_token: None,
        })
    }

    async fn refresh_key(&self, caller_token: &str, mut key: Key) -> Result<Token, Error> {
        let caller = self
            .tokenizer
            .parse(caller_token)
            .map_err(Error::into_authentication)?;
        if caller.variant != KeyType::Refresh {
            return Err(ErrorType::Authentication(anyhow::Error::msg(
                "Tokens can only be refreshed with a refresh token",
            ))
            .into());
        }

        key.id = caller.id;
        key.issuer = caller.issuer;
        key.subject = caller.subject;
        key.user = caller.user;
        if key.domain.is_none() {
            key.domain = caller.domain;
        }
        self.scope_to_domain(&mut key).await?;
        self.token_pair(key)
    }

    fn recovery_key(&self, mut key: Key) -> Result<Token, Error> {
        key.id = self.idp.id();
        key.expires_at = Some(key.issued_at + Duration::minutes(RECOVERY_TTL_MINUTES));
        let access_token = self.tokenizer.issue(&key)?;
        Ok(Token {
            access_token,
            refresh_token: None,
        })
    }

    async fn invitation_key(&self, mut key: Key) -> Result<Token, Error> {
        key.id = self.idp.id();
        key.expires_at = Some(key.issued_at + self.invitation_ttl);
        self.scope_to_domain(&mut key).await?;
        let access_token = self.tokenizer.issue(&key)?;
        Ok(Token {
            access_token,
            refresh_token: None,
        })
    }

    async fn access_key(&self, mut key: Key) -> Result<Token, Error> {
        key.id = self.idp.id();
        self.scope_to_domain(&mut key).await?;
        self.token_pair(key)
    }

    /// Emit the (access, refresh) pair for a key.
    fn token_pair(&self, key: Key) -> Result<Token, Error> {
        let mut access = key.clone();
        access.variant = KeyType::Access;
        access.expires_at = Some(access.issued_at + self.access_ttl);

        let mut refresh = key;
        refresh.variant = KeyType::Refresh;
        refresh.expires_at = Some(refresh.issued_at + self.refresh_ttl);

        Ok(Token {
            access_token: self.tokenizer.issue(&access)?,
            refresh_token: Some(self.tokenizer.issue(&refresh)?),
        })
    }

    /// When the key is domain-scoped, require the user to be a platform
    /// admin or a member of the domain, then rewrite the subject to the
    /// domain-scoped form. A domain-scoped key without a user has nobody to
    /// check membership for and is denied outright.
    async fn scope_to_domain(&self, key: &mut Key) -> Result<(), Error> {
        let Some(domain) = key.domain.clone().filter(|domain| !domain.is_empty()) else {
            return Ok(());
        };
        let Some(user) = key.user.clone().filter(|user| !user.is_empty()) else {
            return Err(ErrorType::DomainAuthorization.into());
        };

        if !self.is_platform_admin(&user).await? {
            let member = self
                .policies
                .check_policy(&PolicyReq {
                    subject: user.clone(),
                    subject_type: EntityType::User,
                    object: domain.clone(),
                    object_type: EntityType::Domain,
                    permission: MEMBERSHIP_PERMISSION.into(),
                    ..PolicyReq::default()
                })
                .await?;
            if !member {
                return Err(ErrorType::DomainAuthorization.into());
            }
        }

        key.subject = encode_domain_user_id(&domain, &user);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use warden_types::policy::{Policy, ADMINISTRATOR_RELATION, MEMBER_RELATION};

    use crate::service::tests::{key_template, login, stack};

    use super::*;

    #[tokio::test]
    async fn issue_api_then_identify_then_revoke() {
        let (auth, _, _, _) = stack().await;
        let access = login(&auth, "u1").await;

        let mut api = key_template(KeyType::Api, "ignored");
        api.issuer = String::new();
        api.subject = "u1@example.com".into();
        api.user = None;
        let token = auth.issue(&access, api).await.unwrap();
        assert!(token.refresh_token.is_none());

        let key = auth.identify(&token.access_token).await.unwrap();
        assert_eq!(key.variant, KeyType::Api);
        assert_eq!(key.issuer, "u1");
        assert_eq!(key.subject, "u1@example.com");

        auth.revoke(&access, &key.id).await.unwrap();
        let err = auth.identify(&token.access_token).await.unwrap_err();
        assert!(matches!(err.variant, ErrorType::Authentication(_)));

        // Revoking again is a no-op
        auth.revoke(&access, &key.id).await.unwrap();
    }

    #[tokio::test]
    async fn api_key_requires_access_caller() {
        let (auth, _, _, _) = stack().await;

        let err = auth
            .issue("not-a-token", key_template(KeyType::Api, "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err.variant, ErrorType::Authentication(_)));

        // A refresh token is not an acceptable caller either
        let pair = auth
            .issue("", key_template(KeyType::Access, "u1"))
            .await
            .unwrap();
        let refresh = pair.refresh_token.unwrap();
        let err = auth
            .issue(&refresh, key_template(KeyType::Api, "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err.variant, ErrorType::Authentication(_)));
    }

    #[tokio::test]
    async fn api_key_expiry_must_follow_issuance() {
        let (auth, _, _, _) = stack().await;
        let access = login(&auth, "u1").await;

        let mut api = key_template(KeyType::Api, "u1");
        api.expires_at = Some(Utc::now() - Duration::hours(1));
        let err = auth.issue(&access, api).await.unwrap_err();
        assert!(matches!(err.variant, ErrorType::MalformedEntity(_)));

        // Never-expiring API keys are allowed
        let mut api = key_template(KeyType::Api, "u1");
        api.expires_at = None;
        let token = auth.issue(&access, api).await.unwrap();
        let key = auth.identify(&token.access_token).await.unwrap();
        assert_eq!(key.expires_at, None);
    }

    #[tokio::test]
    async fn access_pair_and_refresh_flow() {
        let (auth, _, _, _) = stack().await;

        let pair = auth
            .issue("", key_template(KeyType::Access, "u1"))
            .await
            .unwrap();
        let refresh = pair.refresh_token.clone().unwrap();

        let access = auth.identify(&pair.access_token).await.unwrap();
        assert_eq!(access.variant, KeyType::Access);
        assert!(access.expires_at.unwrap() > access.issued_at);

        let refreshed = auth
            .issue(&refresh, key_template(KeyType::Refresh, "u1"))
            .await
            .unwrap();
        let key = auth.identify(&refreshed.access_token).await.unwrap();
        assert_eq!(key.variant, KeyType::Access);
        assert_eq!(key.subject, "u1");
        // The pair keeps the original key id
        assert_eq!(key.id, access.id);

        // An access token cannot be used to refresh
        let err = auth
            .issue(&pair.access_token, key_template(KeyType::Refresh, "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err.variant, ErrorType::Authentication(_)));
    }

    #[tokio::test]
    async fn recovery_key_is_short_lived() {
        let (auth, _, _, _) = stack().await;

        let token = auth
            .issue("", key_template(KeyType::Recovery, "u1"))
            .await
            .unwrap();
        assert!(token.refresh_token.is_none());

        let key = auth.identify(&token.access_token).await.unwrap();
        assert_eq!(key.variant, KeyType::Recovery);
        let ttl = key.expires_at.unwrap() - key.issued_at;
        assert_eq!(ttl, Duration::minutes(RECOVERY_TTL_MINUTES));
    }

    #[tokio::test]
    async fn domain_scoping_without_a_user_is_denied() {
        let (auth, _, _, _) = stack().await;

        // A domain-scoped key with no user must not slip past the
        // membership check
        let mut scoped = key_template(KeyType::Access, "u1");
        scoped.domain = Some("d1".into());
        scoped.user = None;
        let err = auth.issue("", scoped).await.unwrap_err();
        assert!(matches!(err.variant, ErrorType::DomainAuthorization));

        // An empty user string is the same boundary
        let mut scoped = key_template(KeyType::Invitation, "u1");
        scoped.domain = Some("d1".into());
        scoped.user = Some(String::new());
        let err = auth.issue("", scoped).await.unwrap_err();
        assert!(matches!(err.variant, ErrorType::DomainAuthorization));
    }

    #[tokio::test]
    async fn invitation_requires_domain_membership() {
        let (auth, _, _, repos) = stack().await;

        let mut invitation = key_template(KeyType::Invitation, "u1");
        invitation.domain = Some("d1".into());
        let err = auth.issue("", invitation.clone()).await.unwrap_err();
        assert!(matches!(err.variant, ErrorType::DomainAuthorization));

        repos
            .policy
            .save_policies(&[Policy {
                subject_type: EntityType::User,
                subject_id: "u1".into(),
                subject_relation: String::new(),
                relation: MEMBER_RELATION.into(),
                object_type: EntityType::Domain,
                object_id: "d1".into(),
                permission: String::new(),
            }])
            .await
            .unwrap();

        let token = auth.issue("", invitation).await.unwrap();
        assert!(token.refresh_token.is_none());
        let key = auth.identify(&token.access_token).await.unwrap();
        assert_eq!(key.variant, KeyType::Invitation);
        assert_eq!(key.subject, "d1_u1");
        assert!(key.expires_at.unwrap() > key.issued_at);
    }

    #[tokio::test]
    async fn expired_api_key_is_removed_on_identify() {
        let (auth, _, _, repos) = stack().await;

        let now = Utc::now();
        let key = Key {
            id: "k-expired".into(),
            variant: KeyType::Api,
            issuer: "u1".into(),
            subject: "u1@example.com".into(),
            user: None,
            domain: None,
            issued_at: now - Duration::hours(2),
            expires_at: Some(now - Duration::hours(1)),
        };
        repos.key.save(&key).await.unwrap();
        let token = auth.tokenizer.issue(&key).unwrap();

        let err = auth.identify(&token).await.unwrap_err();
        assert!(matches!(err.variant, ErrorType::Authentication(_)));

        // The stored row was cleaned up eagerly
        assert!(repos
            .key
            .retrieve("u1", "k-expired")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn domain_scoping() {
        let (auth, _, _, repos) = stack().await;

        repos
            .policy
            .save_policies(&[Policy {
                subject_type: EntityType::User,
                subject_id: "u1".into(),
                subject_relation: String::new(),
                relation: MEMBER_RELATION.into(),
                object_type: EntityType::Domain,
                object_id: "d1".into(),
                permission: String::new(),
            }])
            .await
            .unwrap();

        let mut scoped = key_template(KeyType::Access, "u1");
        scoped.domain = Some("d1".into());
        let pair = auth.issue("", scoped).await.unwrap();
        let key = auth.identify(&pair.access_token).await.unwrap();
        assert_eq!(key.subject, "d1_u1");
        assert_eq!(key.domain.as_deref(), Some("d1"));

        // Refreshing re-checks the membership
        let refreshed = auth
            .issue(
                &pair.refresh_token.unwrap(),
                key_template(KeyType::Refresh, "u1"),
            )
            .await
            .unwrap();
        let key = auth.identify(&refreshed.access_token).await.unwrap();
        assert_eq!(key.subject, "d1_u1");

        // Not a member of the other domain
        let mut unscoped = key_template(KeyType::Access, "u1");
        unscoped.domain = Some("d2".into());
        let err = auth.issue("", unscoped).await.unwrap_err();
        assert!(matches!(err.variant, ErrorType::DomainAuthorization));

        // Platform admins bypass membership
        repos
            .policy
            .save_policies(&[Policy {
                subject_type: EntityType::User,
                subject_id: "admin".into(),
                subject_relation: String::new(),
                relation: ADMINISTRATOR_RELATION.into(),
                object_type: EntityType::Platform,
                object_id: PLATFORM_ID.into(),
                permission: String::new(),
            }])
            .await
            .unwrap();
        let mut admin_key = key_template(KeyType::Access, "admin");
        admin_key.domain = Some("d2".into());
        let pair = auth.issue("", admin_key).await.unwrap();
        let key = auth.identify(&pair.access_token).await.unwrap();
        assert_eq!(key.subject, "d2_admin");
    }

    #[tokio::test]
    async fn retrieve_keys_for_caller() {
        let (auth, _, _, _) = stack().await;
        let access = login(&auth, "u1").await;

        for subject in ["svc-a", "svc-b"] {
            let mut api = key_template(KeyType::Api, "u1");
            api.subject = subject.into();
            auth.issue(&access, api).await.unwrap();
        }

        let page = auth
            .retrieve_keys(&access, &KeyFilter::default())
            .await
            .unwrap();
        assert_eq!(page.total, 2);

        let page = auth
            .retrieve_keys(
                &access,
                &KeyFilter {
                    subject: Some("svc-a".into()),
                    ..KeyFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        let id = page.items[0].id.clone();
        let key = auth.retrieve_key(&access, &id).await.unwrap();
        assert_eq!(key.subject, "svc-a");

        let err = auth.retrieve_key(&access, "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
