// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use bson::doc;
use futures_util::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};
use serde::{Deserialize, Serialize};

use crate::Result;

/// One record per branch. `(tip_n, tip_branch)` locates the branch tip in
/// the log; for a branch that has no registered version yet, the tip is the
/// version the branch was created from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchRecord {
	pub name: String,
	pub tip_n: i64,
	pub tip_branch: String,
}

#[derive(Clone)]
pub struct BranchStore {
	coll: Collection<BranchRecord>,
}

impl BranchStore {
	pub(crate) fn open(db: &Database, collection: &str) -> Self {
		Self { coll: db.collection(&super::aux_name("branches", collection)) }
	}

	pub async fn all(&self) -> Result<Vec<BranchRecord>> {
		Ok(self.coll.find(doc! {}).await?.try_collect().await?)
	}

	pub async fn find(&self, name: &str) -> Result<Option<BranchRecord>> {
		Ok(self.coll.find_one(doc! {"name": name}).await?)
	}

	pub async fn insert(&self, record: &BranchRecord, session: &mut ClientSession) -> Result<()> {
		self.coll.insert_one(record).session(session).await?;
		Ok(())
	}

	pub async fn set_tip(&self, name: &str, tip_n: i64, tip_branch: &str, session: &mut ClientSession) -> Result<()> {
		self.coll
			.update_one(doc! {"name": name}, doc! {"$set": {"tip_n": tip_n, "tip_branch": tip_branch}})
			.session(session)
			.await?;
		Ok(())
	}

	/// Inserts or replaces a branch record, used when replicating branch
	/// state between collections.
	pub async fn upsert(&self, record: &BranchRecord, session: &mut ClientSession) -> Result<()> {
		self.coll
			.replace_one(doc! {"name": record.name.as_str()}, record)
			.upsert(true)
			.session(session)
			.await?;
		Ok(())
	}

	pub async fn clear(&self, session: &mut ClientSession) -> Result<()> {
		self.coll.delete_many(doc! {}).session(session).await?;
		Ok(())
	}

	pub async fn delete_names(&self, names: &[String], session: &mut ClientSession) -> Result<()> {
		if names.is_empty() {
			return Ok(());
		}
		self.coll
			.delete_many(doc! {"name": {"$in": names.to_vec()}})
			.session(session)
			.await?;
		Ok(())
	}
}
