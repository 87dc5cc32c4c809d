//! Shared typed models used across the query, access, graph and store layers.

use std::fmt;

use pyo3::prelude::*;
use serde::{Deserialize, Serialize};

use crate::access::vector::AccessVector;
use crate::errors::{CradleError, CradleResult};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Whether an entry is access-controlled (ENTITY) or universally queryable
/// (ARTIFACT).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Entity,
    Artifact,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Entity => "entity",
            EntryType::Artifact => "artifact",
        }
    }

    pub fn parse(value: &str) -> CradleResult<Self> {
        match value {
            "entity" => Ok(EntryType::Entity),
            "artifact" => Ok(EntryType::Artifact),
            other => Err(CradleError::Database(format!("unknown entry type {other:?}"))),
        }
    }
}

/// Access level held by a user on an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    None,
    Read,
    #[serde(rename = "read-write")]
    ReadWrite,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::None => "none",
            AccessType::Read => "read",
            AccessType::ReadWrite => "read-write",
        }
    }

    pub fn parse(value: &str) -> CradleResult<Self> {
        match value {
            "none" => Ok(AccessType::None),
            "read" => Ok(AccessType::Read),
            "read-write" | "read_write" => Ok(AccessType::ReadWrite),
            other => Err(CradleError::Database(format!("unknown access type {other:?}"))),
        }
    }

    /// True when holding `self` fulfils at least one of `required`.
    ///
    /// READ_WRITE covers a READ requirement. NONE fulfils nothing, and a
    /// NONE requirement is never satisfiable.
    pub fn satisfies(&self, required: &[AccessType]) -> bool {
        if *self == AccessType::None {
            return false;
        }
        required
            .iter()
            .any(|req| *req != AccessType::None && *self >= *req)
    }
}

/// Why a relation exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationReason {
    Digest,
    Enrichment,
    Contains,
    Alias,
    Encounter,
    Note,
}

impl RelationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationReason::Digest => "digest",
            RelationReason::Enrichment => "enrichment",
            RelationReason::Contains => "contains",
            RelationReason::Alias => "alias",
            RelationReason::Encounter => "encounter",
            RelationReason::Note => "note",
        }
    }

    pub fn parse(value: &str) -> CradleResult<Self> {
        Ok(match value {
            "digest" => RelationReason::Digest,
            "enrichment" => RelationReason::Enrichment,
            "contains" => RelationReason::Contains,
            "alias" => RelationReason::Alias,
            "encounter" => RelationReason::Encounter,
            "note" => RelationReason::Note,
            other => {
                return Err(CradleError::Database(format!(
                    "unknown relation reason {other:?}"
                )))
            }
        })
    }
}

/// Text-matching rule attached to an entry class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "rule", rename_all = "lowercase")]
pub enum ClassFormat {
    Regex(String),
    Options(Vec<String>),
}

// ---------------------------------------------------------------------------
// Content references
// ---------------------------------------------------------------------------

/// Owner of a relation / holder of a content access vector.
///
/// Every variant is backed by a row in `content_objects`; the kind column
/// doubles as the lookup key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentRef {
    Note { id: i64 },
    Digest { id: i64 },
    Other { kind: String, id: i64 },
}

impl ContentRef {
    pub fn id(&self) -> i64 {
        match self {
            ContentRef::Note { id } | ContentRef::Digest { id } | ContentRef::Other { id, .. } => {
                *id
            }
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            ContentRef::Note { .. } => "note",
            ContentRef::Digest { .. } => "digest",
            ContentRef::Other { kind, .. } => kind.as_str(),
        }
    }

    /// Rebuild a reference from its stored `(kind, id)` pair.
    pub fn from_parts(kind: &str, id: i64) -> Self {
        match kind {
            "note" => ContentRef::Note { id },
            "digest" => ContentRef::Digest { id },
            other => ContentRef::Other {
                kind: other.to_string(),
                id,
            },
        }
    }

    /// Notes and digests carry their own access vector; other content kinds
    /// fall back to the default vector.
    pub fn carries_vector(&self) -> bool {
        matches!(self, ContentRef::Note { .. } | ContentRef::Digest { .. })
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Identity of the user issuing a request.
#[pyclass(frozen, get_all)]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserIdentity {
    pub id: i64,
    pub is_admin: bool,
}

#[pymethods]
impl UserIdentity {
    #[new]
    #[pyo3(signature = (id, is_admin=false))]
    pub fn new(id: i64, is_admin: bool) -> Self {
        Self { id, is_admin }
    }

    fn __repr__(&self) -> String {
        format!("UserIdentity(id={}, is_admin={})", self.id, self.is_admin)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
}

impl UserRecord {
    pub fn identity(&self) -> UserIdentity {
        UserIdentity::new(self.id, self.is_admin)
    }
}

/// Schema/type descriptor for entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryClass {
    pub id: i64,
    pub subtype: String,
    pub entry_type: EntryType,
    pub format: Option<ClassFormat>,
}

/// A node of the knowledge graph, joined with its class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub id: i64,
    pub name: String,
    pub class_id: i64,
    pub subtype: String,
    pub entry_type: EntryType,
    pub description: Option<String>,
    pub acvec_offset: i64,
    pub degree: i64,
}

impl Entry {
    pub fn is_entity(&self) -> bool {
        self.entry_type == EntryType::Entity
    }
}

/// Directed, reason-tagged edge between two entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Relation {
    pub id: i64,
    pub e1: i64,
    pub e2: i64,
    pub reason: RelationReason,
    pub inherit_av: bool,
    pub access_vector: AccessVector,
    pub owner: Option<ContentRef>,
    pub created_at: String,
}

impl Relation {
    /// The endpoint opposite to `entry_id`, if the relation touches it.
    pub fn other_end(&self, entry_id: i64) -> Option<i64> {
        if self.e1 == entry_id {
            Some(self.e2)
        } else if self.e2 == entry_id {
            Some(self.e1)
        } else {
            None
        }
    }
}

/// One access row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccessRecord {
    pub user_id: i64,
    pub entity_id: i64,
    pub access_type: AccessType,
}
