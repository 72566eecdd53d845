// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
	EngineConfig, Error, Result,
	store::{LockRecord, LockStore},
};

/// Re-entrant cross-process mutual exclusion for one tracked collection,
/// backed by CAS updates on the `__vc_lock` record. Contended acquisition
/// retries with jittered exponential backoff until the configured timeout.
pub(crate) struct CollectionLock {
	store: LockStore,
	collection_name: String,
	holder_id: String,
	config: EngineConfig,
}

impl CollectionLock {
	pub fn new(store: LockStore, collection_name: &str, holder_id: &str, config: EngineConfig) -> Self {
		Self {
			store,
			collection_name: collection_name.to_owned(),
			holder_id: holder_id.to_owned(),
			config,
		}
	}

	pub fn holder_id(&self) -> &str {
		&self.holder_id
	}

	pub async fn ensure_record(&self) -> Result<()> {
		self.store.ensure(&self.collection_name).await
	}

	/// Acquires (or re-enters) the lock, returning the record as observed at
	/// acquisition so the caller can compare epochs.
	pub async fn acquire(&self) -> Result<LockRecord> {
		let deadline = Instant::now() + self.config.lock_timeout;
		let mut backoff = self.config.lock_backoff;

		loop {
			if let Some(record) = self.store.reenter(&self.collection_name, &self.holder_id).await? {
				trace!(collection = %self.collection_name, depth = record.depth, "re-entered lock");
				return Ok(record);
			}
			if let Some(record) = self.store.try_acquire(&self.collection_name, &self.holder_id).await? {
				trace!(collection = %self.collection_name, epoch = record.epoch, "acquired lock");
				return Ok(record);
			}

			if Instant::now() >= deadline {
				return Err(Error::LockTimeout(self.config.lock_timeout));
			}
			let jitter = Duration::from_millis(rand::rng().random_range(0..=backoff.as_millis() as u64 / 2));
			debug!(collection = %self.collection_name, ?backoff, "lock contended, backing off");
			tokio::time::sleep_until((Instant::now() + backoff + jitter).min(deadline)).await;
			backoff = (backoff * 2).min(self.config.lock_backoff_cap);
		}
	}

	/// Releases one level; the outermost release bumps the epoch iff the
	/// critical section mutated state. Returns the epoch after release.
	pub async fn release(&self, mutated: bool) -> Result<i64> {
		self.store.release(&self.collection_name, &self.holder_id, mutated).await
	}
}
