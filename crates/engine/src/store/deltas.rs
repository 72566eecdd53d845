// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use bson::{Binary, Bson, DateTime, doc, oid::ObjectId, spec::BinarySubtype};
use futures_util::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};
use mongovc_delta::DocumentDelta;
use serde::{Deserialize, Serialize};

use crate::{Result, tree::VersionId};

/// One delta of one document, registered against one version. `forward`
/// transforms the document from the state at the previous delta into the
/// state at `(version_n, branch)`; `backward` is its inverse.
/// `prev_id`/`next_ids` link deltas of the same document along the log tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeltaRecord {
	#[serde(rename = "_id")]
	pub id: ObjectId,
	pub document_id: Bson,
	pub version_n: i64,
	pub branch: String,
	pub timestamp: DateTime,
	pub forward: Binary,
	pub backward: Binary,
	pub prev_id: Option<ObjectId>,
	pub next_ids: Vec<ObjectId>,
}

impl DeltaRecord {
	pub fn version(&self) -> VersionId {
		VersionId::new(self.version_n, &self.branch)
	}

	pub fn decode_forward(&self) -> crate::Result<DocumentDelta> {
		Ok(mongovc_delta::decode(&self.forward.bytes)?)
	}

	pub fn decode_backward(&self) -> crate::Result<DocumentDelta> {
		Ok(mongovc_delta::decode(&self.backward.bytes)?)
	}
}

pub(crate) fn delta_binary(bytes: Vec<u8>) -> Binary {
	Binary { subtype: BinarySubtype::Generic, bytes }
}

#[derive(Clone)]
pub struct DeltaStore {
	coll: Collection<DeltaRecord>,
}

fn version_filter(versions: &[VersionId]) -> Bson {
	let clauses: Vec<Bson> = versions
		.iter()
		.map(|v| Bson::Document(doc! {"version_n": v.n, "branch": v.branch.as_str()}))
		.collect();
	Bson::Array(clauses)
}

impl DeltaStore {
	pub(crate) fn open(db: &Database, collection: &str) -> Self {
		Self { coll: db.collection(&super::aux_name("deltas", collection)) }
	}

	/// All deltas registered against any of `versions`, across documents.
	pub async fn on_versions(&self, versions: &[VersionId]) -> Result<Vec<DeltaRecord>> {
		if versions.is_empty() {
			return Ok(Vec::new());
		}
		let filter = doc! {"$or": version_filter(versions)};
		Ok(self.coll.find(filter).await?.try_collect().await?)
	}

	/// Deltas of the given documents on any of `versions`. Used by register
	/// to find each document's most recent delta up the current path.
	pub async fn for_documents_on_versions(
		&self,
		document_ids: &[Bson],
		versions: &[VersionId],
	) -> Result<Vec<DeltaRecord>> {
		if versions.is_empty() || document_ids.is_empty() {
			return Ok(Vec::new());
		}
		let filter = doc! {
			"document_id": {"$in": document_ids.to_vec()},
			"$or": version_filter(versions),
		};
		Ok(self.coll.find(filter).await?.try_collect().await?)
	}

	pub async fn insert_many(&self, records: &[DeltaRecord], session: &mut ClientSession) -> Result<()> {
		if records.is_empty() {
			return Ok(());
		}
		self.coll.insert_many(records).session(session).await?;
		Ok(())
	}

	pub async fn push_next_id(&self, id: ObjectId, child: ObjectId, session: &mut ClientSession) -> Result<()> {
		self.coll
			.update_one(doc! {"_id": id}, doc! {"$push": {"next_ids": child}})
			.session(session)
			.await?;
		Ok(())
	}

	/// Removes all deltas registered against the given versions and unlinks
	/// them from surviving predecessors.
	pub async fn delete_on_versions(&self, versions: &[VersionId], session: &mut ClientSession) -> Result<()> {
		if versions.is_empty() {
			return Ok(());
		}
		let filter = doc! {"$or": version_filter(versions)};
		// Writers are serialized by the collection lock, so the id scan does
		// not need the transaction's view.
		let removed: Vec<DeltaRecord> = self.coll.find(filter.clone()).await?.try_collect().await?;
		let removed_ids: Vec<ObjectId> = removed.iter().map(|r| r.id).collect();

		self.coll.delete_many(filter).session(&mut *session).await?;
		if !removed_ids.is_empty() {
			self.coll
				.update_many(doc! {}, doc! {"$pull": {"next_ids": {"$in": removed_ids}}})
				.session(session)
				.await?;
		}
		Ok(())
	}
}
