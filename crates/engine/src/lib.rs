// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

//! Git-like versioning for MongoDB collections.
//!
//! The engine wraps a target collection and maintains its history in
//! auxiliary collections of the same database: a tree of registered versions
//! (the log), per-document invertible deltas between adjacent versions, a
//! replica snapshot of the last registered state, and modification trackers
//! fed by a background change-stream listener.
//!
//! [`VersionedCollection`] is the entry point: `init` starts tracking,
//! `register` turns captured changes into a version, `checkout` moves the
//! collection to any registered version, and `push`/`pull` synchronize two
//! tracked collections, with three-way auto-merge and explicit conflict
//! resolution on divergence.
//!
//! Cross-process safety comes from a re-entrant lock record per collection;
//! consistency with the change stream comes from a fence: every operation
//! writes a sentinel and waits for the listener to drain up to it before
//! trusting the trackers.

mod config;
mod docid;
mod engine;
mod error;
mod listener;
mod lock;
mod resolver;
mod store;
mod sync;
mod tree;

pub use config::{CollectionLocator, EngineConfig};
pub use docid::DocId;
pub use engine::{DocumentDiff, InitOutcome, RegisterOutcome, Status, VersionSpec, VersionedCollection};
pub use error::{Error, Result};
pub use listener::FENCE_PREFIX;
pub use resolver::{MergeTool, Resolver};
pub use store::{
	BranchRecord, ConflictRecord, DeltaRecord, LogEntry, Metadata, ModifiedTracker, TrackedOp,
};
pub use sync::{PullOutcome, PushOutcome, ResolveReport};
pub use tree::{Direction, LogNode, LogTree, VersionId};
