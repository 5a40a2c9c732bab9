//! Stream identity and the configured catalog.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Identifies one logical stream within a sync.
///
/// Two descriptors are equal when both namespace and name match. A missing
/// namespace is distinct from an empty one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Optional namespace (schema, dataset, ...).
    pub namespace: Option<String>,
    /// Stream name.
    pub name: String,
}

impl StreamDescriptor {
    /// Creates a descriptor with a namespace.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Creates a descriptor without a namespace.
    pub fn unnamespaced(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}.{}", namespace, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Errors raised while building a catalog.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The same stream was configured twice.
    #[error("duplicate stream in catalog: {0}")]
    DuplicateStream(StreamDescriptor),
}

/// The ordered set of streams configured for one sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationCatalog {
    streams: Vec<StreamDescriptor>,
}

impl DestinationCatalog {
    /// Creates a catalog, rejecting duplicate descriptors.
    pub fn new(streams: Vec<StreamDescriptor>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::with_capacity(streams.len());
        for stream in &streams {
            if !seen.insert(stream) {
                return Err(CatalogError::DuplicateStream(stream.clone()));
            }
        }
        Ok(Self { streams })
    }

    /// Returns the configured streams in catalog order.
    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    /// Returns true if the stream is part of this catalog.
    pub fn contains(&self, stream: &StreamDescriptor) -> bool {
        self.streams.contains(stream)
    }

    /// Number of configured streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Returns true if no streams are configured.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
