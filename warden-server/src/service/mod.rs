use warden_types::key::Key;

mod authorize;
mod domain;
mod group;
mod token;

pub use domain::DomainService;
pub use group::GroupService;
pub use token::AuthService;

/// The principal a key acts for: its user when scoped, its subject otherwise.
pub(crate) fn actor(key: &Key) -> &str {
    key.user.as_deref().unwrap_or(&key.subject)
}
