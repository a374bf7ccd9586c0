//! Tandem Core - causal op-log documents
//!
//! This crate provides the replicated storage every other Tandem crate
//! builds on:
//! - Documents as append-only DAGs of hashed changes
//! - Head sets as the version currency
//! - Deterministic replay for convergence across replicas
//! - A store that announces head changes to subscribers

pub mod change;
pub mod crdt;
pub mod document;
pub mod error;
pub mod file;
pub mod heads;
pub mod store;

pub use change::{Change, ChangeMetadata, MergeMetadata, Op, OpAction};
pub use crdt::{DocPath, Number, PathChange, PathChangeKind, PathSegment, TieBreak, Value};
pub use document::{Document, DocumentId, DocumentMeta};
pub use error::{Error, Result};
pub use file::{FileContent, FileKind};
pub use heads::{ActorId, ChangeHash, HeadSet};
pub use store::{ChangeOrigin, DocumentEvent, DocumentStore};
