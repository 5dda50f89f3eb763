use serde::{Deserialize, Serialize};

/// Listing limit applied when the caller does not provide one.
pub const DEFAULT_LIMIT: u64 = 10;

/// Uniform envelope for offset/limit listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    #[must_use]
    pub fn empty(offset: u64, limit: u64) -> Self {
        Self {
            total: 0,
            offset,
            limit,
            items: vec![],
        }
    }
}
