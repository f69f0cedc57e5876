//! Catalog: index metadata for collections
//!
//! Tracks index entries (key patterns, full-text specs) per namespace.
//! The builder consults it when lowering index scans and text matches;
//! lookups poll the operation context for interruption. The catalog is a
//! read-only view here — the caller is responsible for holding whatever
//! lock makes that view stable for the duration of the build.

use crate::context::OperationContext;
use crate::error::BuildError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordering or transform applied to one key-pattern component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPartKind {
    /// Ascending (`1`)
    Ascending,
    /// Descending (`-1`)
    Descending,
    /// Hashed component (`"hashed"`)
    Hashed,
    /// Text component (`"text"`)
    Text,
}

/// One component of an index or shard key pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPatternPart {
    /// Dotted field path (`"a.b"`)
    pub path: String,
    /// Component kind
    pub kind: KeyPartKind,
}

impl KeyPatternPart {
    /// Ascending component
    pub fn asc(path: impl Into<String>) -> Self {
        KeyPatternPart {
            path: path.into(),
            kind: KeyPartKind::Ascending,
        }
    }

    /// Descending component
    pub fn desc(path: impl Into<String>) -> Self {
        KeyPatternPart {
            path: path.into(),
            kind: KeyPartKind::Descending,
        }
    }

    /// Hashed component
    pub fn hashed(path: impl Into<String>) -> Self {
        KeyPatternPart {
            path: path.into(),
            kind: KeyPartKind::Hashed,
        }
    }
}

/// An ordered key pattern (`{a: 1, "b.c": -1}`)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyPattern(Vec<KeyPatternPart>);

impl KeyPattern {
    /// Build a pattern from parts
    pub fn new(parts: Vec<KeyPatternPart>) -> Self {
        KeyPattern(parts)
    }

    /// Build a pattern from `(path, direction)` pairs; any direction
    /// other than `-1` is ascending.
    pub fn parse(spec: &[(&str, i32)]) -> Self {
        KeyPattern(
            spec.iter()
                .map(|(path, dir)| {
                    if *dir == -1 {
                        KeyPatternPart::desc(*path)
                    } else {
                        KeyPatternPart::asc(*path)
                    }
                })
                .collect(),
        )
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True iff the pattern has no components
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Components in pattern order
    pub fn parts(&self) -> &[KeyPatternPart] {
        &self.0
    }

    /// Position of a path within the pattern
    pub fn position_of(&self, path: &str) -> Option<usize> {
        self.0.iter().position(|part| part.path == path)
    }
}

/// Full-text index spec carried on a text index entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtsSpec {
    /// Default language for stemming
    pub language: String,
    /// Weighted text fields
    pub weights: Vec<(String, i32)>,
}

/// A compiled full-text matcher. Materialized from the catalog at build
/// time and embedded into `ftsMatch` expressions as an opaque constant;
/// the builder never evaluates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMatcher {
    /// Name of the backing text index
    pub index_name: String,
    /// Spec the matcher was compiled from
    pub spec: FtsSpec,
    /// Stemmed query terms
    pub terms: Vec<String>,
}

impl TextMatcher {
    /// Compile a matcher for a term list against a text index spec
    pub fn compile(index_name: impl Into<String>, spec: FtsSpec, terms: Vec<String>) -> Self {
        TextMatcher {
            index_name: index_name.into(),
            spec,
            terms,
        }
    }
}

/// One index on a collection
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Index name (`"a_1_b_1"`)
    pub name: String,
    /// Key pattern
    pub key_pattern: KeyPattern,
    /// Full-text spec, present iff this is a text index
    pub fts: Option<FtsSpec>,
}

/// Per-collection metadata
#[derive(Debug, Clone, Default)]
pub struct CollectionInfo {
    indexes: Vec<IndexEntry>,
}

impl CollectionInfo {
    /// All index entries
    pub fn indexes(&self) -> &[IndexEntry] {
        &self.indexes
    }
}

/// Catalog of collections visible to this operation
#[derive(Debug, Clone, Default)]
pub struct CollectionCatalog {
    collections: HashMap<String, CollectionInfo>,
}

impl CollectionCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        CollectionCatalog {
            collections: HashMap::new(),
        }
    }

    /// Register a namespace (no-op if already present)
    pub fn register_collection(&mut self, namespace: impl Into<String>) {
        self.collections.entry(namespace.into()).or_default();
    }

    /// Register an index on a namespace, creating the namespace if needed
    pub fn register_index(&mut self, namespace: impl Into<String>, entry: IndexEntry) {
        self.collections
            .entry(namespace.into())
            .or_default()
            .indexes
            .push(entry);
    }

    /// Check whether a namespace exists
    pub fn has_collection(&self, namespace: &str) -> bool {
        self.collections.contains_key(namespace)
    }

    /// Look up an index entry, polling for interruption first
    pub fn index_entry(
        &self,
        op_ctx: &OperationContext,
        namespace: &str,
        index_name: &str,
    ) -> Result<&IndexEntry, BuildError> {
        op_ctx.check_for_interrupt()?;

        let info = self
            .collections
            .get(namespace)
            .ok_or_else(|| BuildError::NamespaceNotFound(namespace.to_string()))?;

        info.indexes
            .iter()
            .find(|entry| entry.name == index_name)
            .ok_or_else(|| BuildError::IndexNotFound {
                namespace: namespace.to_string(),
                index: index_name.to_string(),
            })
    }
}
