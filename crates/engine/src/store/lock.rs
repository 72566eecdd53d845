// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use bson::doc;
use mongodb::{Collection, Database, options::ReturnDocument};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The cross-process lock record of one tracked collection. `epoch` counts
/// state-mutating critical sections; a reader whose remembered epoch differs
/// from the stored one is holding stale caches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRecord {
	pub collection_name: String,
	pub locked: bool,
	pub holder_id: Option<String>,
	pub depth: i64,
	pub epoch: i64,
}

/// The per-database `__vc_lock` collection. All mutations are single-record
/// compare-and-swap updates, which MongoDB applies atomically.
#[derive(Clone)]
pub struct LockStore {
	coll: Collection<LockRecord>,
}

impl LockStore {
	pub(crate) fn open(db: &Database) -> Self {
		Self { coll: db.collection(super::LOCK_COLLECTION) }
	}

	/// Makes sure a lock record exists for the collection.
	pub async fn ensure(&self, collection_name: &str) -> Result<()> {
		self.coll
			.update_one(
				doc! {"collection_name": collection_name},
				doc! {"$setOnInsert": {
					"locked": false,
					"holder_id": null,
					"depth": 0_i64,
					"epoch": 0_i64,
				}},
			)
			.upsert(true)
			.await?;
		Ok(())
	}

	/// CAS `locked: false -> true`. Returns the record when this caller won
	/// the lock, `None` when someone else holds it.
	pub async fn try_acquire(&self, collection_name: &str, holder_id: &str) -> Result<Option<LockRecord>> {
		Ok(self
			.coll
			.find_one_and_update(
				doc! {"collection_name": collection_name, "locked": false},
				doc! {"$set": {"locked": true, "holder_id": holder_id, "depth": 1_i64}},
			)
			.return_document(ReturnDocument::After)
			.await?)
	}

	/// Re-entrant step: bumps the depth when this caller already holds the
	/// lock.
	pub async fn reenter(&self, collection_name: &str, holder_id: &str) -> Result<Option<LockRecord>> {
		Ok(self
			.coll
			.find_one_and_update(
				doc! {"collection_name": collection_name, "locked": true, "holder_id": holder_id},
				doc! {"$inc": {"depth": 1_i64}},
			)
			.return_document(ReturnDocument::After)
			.await?)
	}

	/// Drops one level of the lock. The outermost release clears the holder
	/// and bumps the epoch iff the critical section mutated state. Returns
	/// the epoch after release.
	pub async fn release(&self, collection_name: &str, holder_id: &str, mutated: bool) -> Result<i64> {
		// Inner level of a re-entrant hold.
		if let Some(record) = self
			.coll
			.find_one_and_update(
				doc! {
					"collection_name": collection_name,
					"holder_id": holder_id,
					"depth": {"$gt": 1_i64},
				},
				doc! {"$inc": {"depth": -1_i64}},
			)
			.return_document(ReturnDocument::After)
			.await?
		{
			return Ok(record.epoch);
		}

		// Outermost release.
		let mut update = doc! {"$set": {"locked": false, "holder_id": null, "depth": 0_i64}};
		if mutated {
			update.insert("$inc", doc! {"epoch": 1_i64});
		}
		let record = self
			.coll
			.find_one_and_update(
				doc! {"collection_name": collection_name, "holder_id": holder_id, "depth": 1_i64},
				update,
			)
			.return_document(ReturnDocument::After)
			.await?;

		record.map(|r| r.epoch).ok_or(Error::LockLost)
	}

	pub async fn epoch(&self, collection_name: &str) -> Result<i64> {
		let record = self.coll.find_one(doc! {"collection_name": collection_name}).await?;
		Ok(record.map(|r| r.epoch).unwrap_or(0))
	}
}
