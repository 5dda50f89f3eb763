use std::time::Duration;

use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::Deserialize;

const TOKEN_SECRET_LENGTH: usize = 32;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub storage_path: String,
    /// Lifetime of access keys and of the access half of refresh pairs.
    #[serde(with = "humantime_serde", default = "default_access_ttl")]
    pub access_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_refresh_ttl")]
    pub refresh_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_invitation_ttl")]
    pub invitation_ttl: Duration,
    /// HMAC secret the tokenizer signs with. Generated on startup when not
    /// provided, which invalidates outstanding tokens across restarts.
    #[serde(default)]
    pub token_secret: Option<String>,
}

fn default_access_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_refresh_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_invitation_ttl() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

impl Config {
    #[must_use]
    pub fn db_path(&self) -> String {
        if self.using_inmemory_storage() {
            self.storage_path.to_string()
        } else {
            let maybe_slash = if self.storage_path.ends_with('/') {
                ""
            } else {
                "/"
            };
            format!("{}{maybe_slash}{}", self.storage_path, "warden.db")
        }
    }

    #[must_use]
    pub fn using_inmemory_storage(&self) -> bool {
        self.storage_path.contains(":memory:")
    }

    pub fn sanitize(&mut self) -> anyhow::Result<()> {
        if !self.using_inmemory_storage() {
            let storage_path = std::path::Path::new(&self.storage_path);
            if !storage_path.exists()
                && std::fs::DirBuilder::new()
                    .recursive(true)
                    .create(storage_path)
                    .is_err()
            {
                return Err(anyhow::Error::msg("Failed to create storage directory"));
            }

            if !storage_path.is_dir() {
                return Err(anyhow::Error::msg(
                    "The storage path provided is not a directory",
                ));
            }
        }

        if self
            .token_secret
            .as_ref()
            .map_or(true, |secret| secret.is_empty())
        {
            let mut rng = thread_rng();
            let secret: String = (0..TOKEN_SECRET_LENGTH)
                .map(|_| rng.sample(Alphanumeric) as char)
                .collect();
            self.token_secret = Some(secret);
        }

        Ok(())
    }
}
