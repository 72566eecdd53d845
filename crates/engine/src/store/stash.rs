// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use bson::{Document, doc};
use futures_util::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};

use crate::Result;

use super::ModifiedTracker;

/// The single-level stash: modified documents as they were when `stash` was
/// called, plus the trackers that described them.
#[derive(Clone)]
pub struct StashStore {
	docs: Collection<Document>,
	trackers: Collection<ModifiedTracker>,
}

impl StashStore {
	pub(crate) fn open(db: &Database, collection: &str) -> Self {
		Self {
			docs: db.collection(&super::aux_name("stash", collection)),
			trackers: db.collection(&super::aux_name("stash_modified", collection)),
		}
	}

	pub async fn docs(&self) -> Result<Vec<Document>> {
		Ok(self.docs.find(doc! {}).await?.try_collect().await?)
	}

	pub async fn trackers(&self) -> Result<Vec<ModifiedTracker>> {
		Ok(self.trackers.find(doc! {}).await?.try_collect().await?)
	}

	pub async fn save(
		&self,
		docs: &[Document],
		trackers: &[ModifiedTracker],
		session: &mut ClientSession,
	) -> Result<()> {
		if !docs.is_empty() {
			self.docs.insert_many(docs).session(&mut *session).await?;
		}
		if !trackers.is_empty() {
			self.trackers.insert_many(trackers).session(session).await?;
		}
		Ok(())
	}

	pub async fn clear(&self, session: &mut ClientSession) -> Result<()> {
		self.docs.delete_many(doc! {}).session(&mut *session).await?;
		self.trackers.delete_many(doc! {}).session(session).await?;
		Ok(())
	}
}
