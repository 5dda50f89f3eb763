#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod domain;
pub mod error;
pub mod group;
pub mod key;
pub mod page;
pub mod policy;

/// Free-form metadata attached to domains and groups.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
