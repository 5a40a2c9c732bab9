//! # Bulkload Testkit
//!
//! Test utilities for bulkload destinations and the engine.
//!
//! This crate provides:
//! - An in-memory destination with per-stream fault injection
//! - Input flows over prepared messages and a collecting output
//! - A task factory decorator that counts the tasks it builds
//! - Message fixtures and tracing setup
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bulkload_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_sync() {
//!     let destination = Arc::new(MemoryDestination::new());
//!     let input = VecInput::new(stream_messages(&stream("users"), 10));
//!     // ... build a launcher and run it
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod destination;
pub mod factory;
pub mod fixtures;
pub mod generators;
pub mod io;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::destination::*;
    pub use crate::factory::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::io::*;
}

pub use destination::*;
pub use factory::*;
pub use fixtures::*;
pub use generators::*;
pub use io::*;
