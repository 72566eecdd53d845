// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use bson::{DateTime, doc, oid::ObjectId};
use futures_util::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};
use serde::{Deserialize, Serialize};

use crate::Result;

/// One registered version. `prev_id`/`next_ids` are foreign keys forming a
/// tree over log entries; the in-memory tree is rebuilt from them on load.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
	#[serde(rename = "_id")]
	pub id: ObjectId,
	pub n: i64,
	pub branch: String,
	pub timestamp: DateTime,
	pub message: String,
	pub prev_id: Option<ObjectId>,
	pub next_ids: Vec<ObjectId>,
}

#[derive(Clone)]
pub struct LogStore {
	coll: Collection<LogEntry>,
}

impl LogStore {
	pub(crate) fn open(db: &Database, collection: &str) -> Self {
		Self { coll: db.collection(&super::aux_name("log", collection)) }
	}

	pub async fn all(&self) -> Result<Vec<LogEntry>> {
		Ok(self.coll.find(doc! {}).await?.try_collect().await?)
	}

	pub async fn insert(&self, entry: &LogEntry, session: &mut ClientSession) -> Result<()> {
		self.coll.insert_one(entry).session(session).await?;
		Ok(())
	}

	/// Appends `child` to an entry's `next_ids`. Children are kept in
	/// registration order, which is timestamp order.
	pub async fn push_next_id(&self, id: ObjectId, child: ObjectId, session: &mut ClientSession) -> Result<()> {
		self.coll
			.update_one(doc! {"_id": id}, doc! {"$push": {"next_ids": child}})
			.session(session)
			.await?;
		Ok(())
	}

	pub async fn pull_next_ids(&self, removed: &[ObjectId], session: &mut ClientSession) -> Result<()> {
		if removed.is_empty() {
			return Ok(());
		}
		self.coll
			.update_many(doc! {}, doc! {"$pull": {"next_ids": {"$in": removed.to_vec()}}})
			.session(session)
			.await?;
		Ok(())
	}

	pub async fn clear(&self, session: &mut ClientSession) -> Result<()> {
		self.coll.delete_many(doc! {}).session(session).await?;
		Ok(())
	}

	pub async fn delete_ids(&self, ids: &[ObjectId], session: &mut ClientSession) -> Result<()> {
		if ids.is_empty() {
			return Ok(());
		}
		self.coll
			.delete_many(doc! {"_id": {"$in": ids.to_vec()}})
			.session(session)
			.await?;
		Ok(())
	}
}
