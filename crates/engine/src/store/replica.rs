// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use bson::{Document, doc};
use futures_util::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};

use crate::{DocId, Result};

/// Element-wise snapshot of the tracked collection at the last registered or
/// checked-out version. While `changed` is false the replica and the tracked
/// collection are identical.
#[derive(Clone)]
pub struct ReplicaStore {
	coll: Collection<Document>,
}

impl ReplicaStore {
	pub(crate) fn open(db: &Database, collection: &str) -> Self {
		Self { coll: db.collection(&super::aux_name("replica", collection)) }
	}

	pub async fn get(&self, id: &DocId) -> Result<Option<Document>> {
		Ok(self.coll.find_one(id.filter()).await?)
	}

	pub async fn all(&self) -> Result<Vec<Document>> {
		Ok(self.coll.find(doc! {}).await?.try_collect().await?)
	}

	/// Brings one document in line with the given state: present replaces
	/// (inserting if needed), absent removes.
	pub async fn write(&self, id: &DocId, state: Option<&Document>, session: &mut ClientSession) -> Result<()> {
		match state {
			Some(doc) => {
				self.coll.replace_one(id.filter(), doc).upsert(true).session(session).await?;
			}
			None => {
				self.coll.delete_one(id.filter()).session(session).await?;
			}
		}
		Ok(())
	}

	pub async fn clear(&self, session: &mut ClientSession) -> Result<()> {
		self.coll.delete_many(doc! {}).session(session).await?;
		Ok(())
	}

	pub async fn insert_many(&self, docs: &[Document], session: &mut ClientSession) -> Result<()> {
		if docs.is_empty() {
			return Ok(());
		}
		self.coll.insert_many(docs).session(session).await?;
		Ok(())
	}
}
