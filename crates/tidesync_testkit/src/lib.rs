//! # tidesync testkit
//!
//! Test utilities for tidesync.
//!
//! This crate provides:
//! - `MemoryHub`, an in-memory authoritative hub serving several clients
//! - fixture schemas and rows
//! - property-based test generators using proptest
//! - tracing initialisation for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidesync_testkit::prelude::*;
//!
//! let hub = MemoryHub::new(crm_schema(), HubConfig::default());
//! hub.insert("Company", vec![Value::from("Acme"), Value::Null]);
//! let session = hub.initialize("alice", "crm", "contacts")?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod hub;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::hub::*;
    pub use tidesync_codec::Value;
}

pub use fixtures::*;
pub use generators::*;
pub use hub::*;
