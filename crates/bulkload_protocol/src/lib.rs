//! # Bulkload Protocol
//!
//! Deserialized protocol messages consumed and produced by a bulkload
//! destination.
//!
//! This crate provides:
//! - `StreamDescriptor` and `DestinationCatalog` for identifying streams
//! - `DestinationRecord` and `DestinationFile` data messages
//! - `CheckpointMessage` progress markers
//! - `InputMessage`, the envelope the engine reads from its input flow
//!
//! Framing and wire encoding live outside this crate; these are the
//! already-parsed forms.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod checkpoint;
mod message;

pub use catalog::{CatalogError, DestinationCatalog, StreamDescriptor};
pub use checkpoint::{CheckpointMessage, CheckpointScope};
pub use message::{DestinationFile, DestinationRecord, InputMessage};
