use ulid::Ulid;

/// Generator of opaque, lexicographically sortable identifiers.
pub trait IdProvider: Send + Sync {
    fn id(&self) -> String;
}

pub struct UlidProvider;

impl IdProvider for UlidProvider {
    fn id(&self) -> String {
        Ulid::new().to_string()
    }
}
