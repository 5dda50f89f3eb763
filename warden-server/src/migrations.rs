use rust_embed::RustEmbed;
use sqlx::SqlitePool;

use crate::error::{Error, ErrorType};

#[derive(RustEmbed)]
#[folder = "migrations/"]
struct Migrations;

/// Apply the embedded migration scripts in numeric filename order. Every
/// script is a single idempotent statement.
pub(crate) async fn migrate(pool: &SqlitePool) -> Result<(), Error> {
    let mut filenames: Vec<String> = Migrations::iter().map(|f| f.to_string()).collect();
    filenames.sort_by_key(|filename| {
        filename
            .split('_')
            .next()
            .and_then(|version| version.parse::<u32>().ok())
            .unwrap_or(u32::MAX)
    });

    for filename in filenames {
        let file = Migrations::get(&filename).ok_or_else(|| {
            ErrorType::BadData(format!("Missing embedded migration `{filename}`"))
        })?;
        let script = std::str::from_utf8(&file.data).map_err(|_| {
            ErrorType::BadData(format!("Migration `{filename}` is not valid utf-8"))
        })?;
        sqlx::query(script)
            .execute(pool)
            .await
            .map_err(|error| ErrorType::Migration {
                error,
                filename: filename.clone(),
            })?;
    }
    Ok(())
}
