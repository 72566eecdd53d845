// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use bson::{Bson, Document, doc};
use futures_util::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};
use serde::{Deserialize, Serialize};

use crate::Result;

/// One document whose three-way merge produced a conflict during a pull.
/// `merged` carries the destination value at the conflicted fields; a `None`
/// side means the document does not exist on that side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConflictRecord {
	pub document_id: Bson,
	pub destination: Option<Document>,
	pub source: Option<Document>,
	pub merged: Option<Document>,
	pub destination_branch: String,
	pub source_branch: String,
}

#[derive(Clone)]
pub struct ConflictStore {
	coll: Collection<ConflictRecord>,
}

impl ConflictStore {
	pub(crate) fn open(db: &Database, collection: &str) -> Self {
		Self { coll: db.collection(&super::aux_name("conflicts", collection)) }
	}

	pub async fn all(&self) -> Result<Vec<ConflictRecord>> {
		Ok(self.coll.find(doc! {}).await?.try_collect().await?)
	}

	pub async fn any(&self) -> Result<bool> {
		Ok(self.coll.find_one(doc! {}).await?.is_some())
	}

	pub async fn insert_many(&self, records: &[ConflictRecord], session: &mut ClientSession) -> Result<()> {
		if records.is_empty() {
			return Ok(());
		}
		self.coll.insert_many(records).session(session).await?;
		Ok(())
	}

	pub async fn remove(&self, document_id: &Bson, session: &mut ClientSession) -> Result<()> {
		self.coll
			.delete_one(doc! {"document_id": document_id.clone()})
			.session(session)
			.await?;
		Ok(())
	}
}
