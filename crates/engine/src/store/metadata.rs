// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use bson::{Document, doc};
use mongodb::{ClientSession, Collection, Database, change_stream::event::ResumeToken};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SINGLETON_ID: &str = "metadata";

/// The engine position singleton. The listener owns `resume_token` and the
/// `changed` hint; every other field is written only under the collection
/// lock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metadata {
	pub current_n: i64,
	pub current_branch: String,
	pub detached: bool,
	pub changed: bool,
	pub has_stash: bool,
	pub has_conflicts: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resume_token: Option<ResumeToken>,
}

impl Metadata {
	pub fn initial() -> Self {
		Self {
			current_n: 0,
			current_branch: "main".to_owned(),
			detached: false,
			changed: false,
			has_stash: false,
			has_conflicts: false,
			resume_token: None,
		}
	}
}

#[derive(Clone)]
pub struct MetadataStore {
	coll: Collection<Document>,
}

impl MetadataStore {
	pub(crate) fn open(db: &Database, collection: &str) -> Self {
		Self { coll: db.collection(&super::aux_name("metadata", collection)) }
	}

	/// Loads the singleton. A document holding only a resume token (written
	/// by a listener racing ahead of `init`) does not count as initialized.
	pub async fn load(&self) -> Result<Option<Metadata>> {
		let doc = match self.coll.find_one(doc! {"_id": SINGLETON_ID}).await? {
			Some(doc) => doc,
			None => return Ok(None),
		};
		if !doc.contains_key("current_branch") {
			return Ok(None);
		}
		bson::from_document(doc)
			.map(Some)
			.map_err(|err| Error::Corrupt(format!("metadata singleton: {err}")))
	}

	pub async fn create(&self, metadata: &Metadata, session: &mut ClientSession) -> Result<()> {
		let mut fields =
			bson::to_document(metadata).map_err(|err| Error::Corrupt(format!("metadata singleton: {err}")))?;
		fields.remove("_id");
		self.coll
			.update_one(doc! {"_id": SINGLETON_ID}, doc! {"$set": fields})
			.upsert(true)
			.session(session)
			.await?;
		Ok(())
	}

	pub async fn set_position(
		&self,
		n: i64,
		branch: &str,
		detached: bool,
		session: &mut ClientSession,
	) -> Result<()> {
		self.coll
			.update_one(
				doc! {"_id": SINGLETON_ID},
				doc! {"$set": {"current_n": n, "current_branch": branch, "detached": detached}},
			)
			.session(session)
			.await?;
		Ok(())
	}

	/// Listener-side write: no session, the hint may lag the trackers.
	pub async fn set_changed_hint(&self, changed: bool) -> Result<()> {
		self.coll
			.update_one(doc! {"_id": SINGLETON_ID}, doc! {"$set": {"changed": changed}})
			.upsert(true)
			.await?;
		Ok(())
	}

	pub async fn set_changed(&self, changed: bool, session: &mut ClientSession) -> Result<()> {
		self.coll
			.update_one(doc! {"_id": SINGLETON_ID}, doc! {"$set": {"changed": changed}})
			.session(session)
			.await?;
		Ok(())
	}

	pub async fn set_has_stash(&self, has_stash: bool, session: &mut ClientSession) -> Result<()> {
		self.coll
			.update_one(doc! {"_id": SINGLETON_ID}, doc! {"$set": {"has_stash": has_stash}})
			.session(session)
			.await?;
		Ok(())
	}

	pub async fn set_has_conflicts(&self, has_conflicts: bool, session: &mut ClientSession) -> Result<()> {
		self.coll
			.update_one(doc! {"_id": SINGLETON_ID}, doc! {"$set": {"has_conflicts": has_conflicts}})
			.session(session)
			.await?;
		Ok(())
	}

	/// Listener-side write, upserting so the token survives a listener that
	/// starts before `init` completes.
	pub async fn save_resume_token(&self, token: &ResumeToken) -> Result<()> {
		let token =
			bson::to_bson(token).map_err(|err| Error::Corrupt(format!("resume token: {err}")))?;
		self.coll
			.update_one(doc! {"_id": SINGLETON_ID}, doc! {"$set": {"resume_token": token}})
			.upsert(true)
			.await?;
		Ok(())
	}

	pub async fn resume_token(&self) -> Result<Option<ResumeToken>> {
		let doc = self.coll.find_one(doc! {"_id": SINGLETON_ID}).await?;
		let Some(token) = doc.and_then(|d| d.get("resume_token").cloned()) else {
			return Ok(None);
		};
		bson::from_bson(token)
			.map(Some)
			.map_err(|err| Error::Corrupt(format!("resume token: {err}")))
	}
}
