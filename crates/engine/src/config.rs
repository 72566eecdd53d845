// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use std::time::Duration;

/// Tunables for lock acquisition, the listener fence, and listener retry
/// behavior. The defaults suit interactive use.
#[derive(Clone, Debug)]
pub struct EngineConfig {
	/// Give up acquiring the cross-process lock after this long.
	pub lock_timeout: Duration,
	/// Initial backoff between lock acquisition attempts; doubles per
	/// attempt up to [`lock_backoff_cap`](Self::lock_backoff_cap).
	pub lock_backoff: Duration,
	pub lock_backoff_cap: Duration,
	/// Give up waiting for the change listener to drain up to a fence
	/// sentinel after this long.
	pub fence_timeout: Duration,
	/// How often the listener retries a failing change stream before
	/// reporting a fatal error through the fence.
	pub listener_retry_limit: u32,
	/// Initial backoff between listener retries; doubles per attempt.
	pub listener_retry_backoff: Duration,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			lock_timeout: Duration::from_secs(10),
			lock_backoff: Duration::from_millis(50),
			lock_backoff_cap: Duration::from_secs(1),
			fence_timeout: Duration::from_secs(10),
			listener_retry_limit: 5,
			listener_retry_backoff: Duration::from_millis(100),
		}
	}
}

/// Where a tracked collection lives. Used both to open it and to order lock
/// acquisition across collections, so that two engines syncing the same pair
/// always lock in the same order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CollectionLocator {
	pub host: String,
	pub database: String,
	pub collection: String,
}

impl CollectionLocator {
	pub fn new(host: impl Into<String>, database: impl Into<String>, collection: impl Into<String>) -> Self {
		Self { host: host.into(), database: database.into(), collection: collection.into() }
	}
}

impl std::fmt::Display for CollectionLocator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}/{}", self.host, self.database, self.collection)
	}
}
