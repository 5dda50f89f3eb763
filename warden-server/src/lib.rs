#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![deny(clippy::pedantic)]
#![deny(clippy::get_unwrap)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod config;
mod error;
mod idp;
mod migrations;
mod repos;
mod service;
mod tokenizer;

use std::{str::FromStr, sync::Arc};

use chrono::Duration;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

pub use config::Config;
pub use error::{Error, ErrorType};
pub use idp::{IdProvider, UlidProvider};
pub use repos::Repos;
pub use service::{AuthService, DomainService, GroupService};
pub use tokenizer::{JwtTokenizer, Tokenizer};

/// The assembled core: the three services sharing one storage pool.
pub struct Warden {
    pub auth: AuthService,
    pub groups: GroupService,
    pub domains: DomainService,
    pub repos: Repos,
}

/// Open the storage pool, apply migrations and assemble the services. The
/// signing key, TTL configuration and id provider are fixed for the process
/// lifetime after this returns.
pub async fn start(mut config: Config) -> anyhow::Result<Warden> {
    config.sanitize()?;

    let options = if config.using_inmemory_storage() {
        SqliteConnectOptions::from_str("sqlite::memory:")?
    } else {
        SqliteConnectOptions::new()
            .create_if_missing(true)
            .filename(config.db_path())
    }
    .foreign_keys(true);
    // A single connection keeps an in-memory database alive and shared
    let max_connections = if config.using_inmemory_storage() { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    migrations::migrate(&pool).await.map_err(anyhow::Error::new)?;

    let secret = config.token_secret.clone().unwrap_or_default();
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(JwtTokenizer::new(secret.as_bytes()));
    let idp: Arc<dyn IdProvider> = Arc::new(UlidProvider);
    let repos = Repos::new(pool);

    let auth = AuthService::new(
        tokenizer,
        Arc::clone(&idp),
        repos.key.clone(),
        repos.policy.clone(),
        Duration::from_std(config.access_ttl)?,
        Duration::from_std(config.refresh_ttl)?,
        Duration::from_std(config.invitation_ttl)?,
    );
    let groups = GroupService::new(
        auth.clone(),
        repos.group.clone(),
        repos.policy.clone(),
        Arc::clone(&idp),
    );
    let domains = DomainService::new(
        auth.clone(),
        repos.domain.clone(),
        repos.policy.clone(),
        idp,
    );

    info!("warden core initialized");
    Ok(Warden {
        auth,
        groups,
        domains,
        repos,
    })
}

#[cfg(test)]
mod tests {
    use warden_types::key::{Key, KeyType, Token};

    use super::*;

    #[tokio::test]
    async fn start_with_inmemory_storage() {
        let config = Config {
            storage_path: ":memory:".into(),
            access_ttl: std::time::Duration::from_secs(3600),
            refresh_ttl: std::time::Duration::from_secs(86400),
            invitation_ttl: std::time::Duration::from_secs(604_800),
            token_secret: None,
        };
        let warden = start(config).await.unwrap();

        let key = Key {
            id: String::new(),
            variant: KeyType::Access,
            issuer: "u1".into(),
            subject: "u1".into(),
            user: Some("u1".into()),
            domain: None,
            issued_at: chrono::Utc::now(),
            expires_at: None,
        };
        let Token { access_token, .. } = warden.auth.issue("", key).await.unwrap();
        let identified = warden.auth.identify(&access_token).await.unwrap();
        assert_eq!(identified.subject, "u1");
    }
}
