// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("collection `{0}` is not initialized for versioning")]
	NotInitialized(String),

	#[error("collection `{0}` is already initialized for versioning")]
	AlreadyInitialized(String),

	#[error("version ({n}, {branch}) does not exist")]
	InvalidVersion { n: i64, branch: String },

	#[error("branch `{0}` already exists")]
	BranchExists(String),

	#[error("unknown branch `{0}`")]
	UnknownBranch(String),

	#[error("the collection has uncommitted changes; register, stash or discard them first")]
	UncommittedChanges,

	#[error("detached from the branch tip; registering changes here requires a new branch name")]
	DetachedWithoutBranch,

	#[error("remote tip of `{0}` is not an ancestor of the local tip; pull first")]
	NonFastForward(String),

	#[error("automatic merge failed; {0} document(s) left in conflict")]
	AutoMergeFailed(usize),

	#[error("there are unresolved conflicts; run resolve-conflicts first")]
	UnresolvedConflicts,

	#[error("a stash already exists; apply or discard it first")]
	StashExists,

	#[error("the change listener did not reach the fence within {0:?}")]
	ListenerStalled(Duration),

	#[error("the change listener is not running")]
	ListenerNotRunning,

	#[error("the change listener failed: {0}")]
	ListenerFailed(String),

	#[error("timed out acquiring the collection lock after {0:?}")]
	LockTimeout(Duration),

	#[error("the collection lock was lost while held")]
	LockLost,

	#[error("versioning metadata is corrupt: {0}")]
	Corrupt(String),

	#[error("invalid document id: {0}")]
	InvalidDocumentId(String),

	#[error("resolver failed: {0}")]
	Resolver(String),

	#[error("delta codec: {0}")]
	Codec(#[from] mongovc_delta::Error),

	#[error("database error: {0}")]
	Database(#[from] mongodb::error::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
