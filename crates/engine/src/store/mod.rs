// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

//! Typed wrappers over the auxiliary collections that carry the version
//! history of one tracked collection. Each store exposes only the CRUD the
//! engine needs; writes that belong to a user operation take the operation's
//! [`ClientSession`](mongodb::ClientSession) so they commit or roll back
//! together.

mod branches;
mod conflicts;
mod deltas;
mod lock;
mod log;
mod metadata;
mod modified;
mod replica;
mod stash;

use mongodb::Database;

pub use branches::{BranchRecord, BranchStore};
pub use conflicts::{ConflictRecord, ConflictStore};
pub(crate) use deltas::delta_binary;
pub use deltas::{DeltaRecord, DeltaStore};
pub use lock::{LockRecord, LockStore};
pub use log::{LogEntry, LogStore};
pub use metadata::{Metadata, MetadataStore};
pub use modified::{ModifiedStore, ModifiedTracker, TrackedOp, coalesce, coalesce_trackers};
pub use replica::ReplicaStore;
pub use stash::StashStore;

/// The per-database lock collection shared by every tracked collection.
pub const LOCK_COLLECTION: &str = "__vc_lock";

/// Auxiliary collections are named `__<role>_<collection>`.
pub fn aux_name(role: &str, collection: &str) -> String {
	format!("__{role}_{collection}")
}

/// All auxiliary stores of one tracked collection.
#[derive(Clone)]
pub struct Stores {
	pub log: LogStore,
	pub branches: BranchStore,
	pub deltas: DeltaStore,
	pub metadata: MetadataStore,
	pub modified: ModifiedStore,
	pub replica: ReplicaStore,
	pub stash: StashStore,
	pub conflicts: ConflictStore,
	pub lock: LockStore,
}

impl Stores {
	pub fn open(db: &Database, collection: &str) -> Self {
		Self {
			log: LogStore::open(db, collection),
			branches: BranchStore::open(db, collection),
			deltas: DeltaStore::open(db, collection),
			metadata: MetadataStore::open(db, collection),
			modified: ModifiedStore::open(db, collection),
			replica: ReplicaStore::open(db, collection),
			stash: StashStore::open(db, collection),
			conflicts: ConflictStore::open(db, collection),
			lock: LockStore::open(db),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn aux_names_follow_the_role_prefix_scheme() {
		assert_eq!(aux_name("log", "albums"), "__log_albums");
		assert_eq!(aux_name("stash_modified", "albums"), "__stash_modified_albums");
	}
}
