// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use bson::{Bson, doc, oid::ObjectId};
use futures_util::TryStreamExt;
use mongodb::{ClientSession, Collection, Database};
use serde::{Deserialize, Serialize};

use crate::{DocId, Result};

/// The kind of change the listener captured for a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackedOp {
	Insert,
	Update,
	Delete,
}

impl TrackedOp {
	pub fn as_str(&self) -> &'static str {
		match self {
			TrackedOp::Insert => "insert",
			TrackedOp::Update => "update",
			TrackedOp::Delete => "delete",
		}
	}
}

/// One captured modification of one document since the last registered or
/// checked-out version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModifiedTracker {
	#[serde(rename = "_id")]
	pub id: ObjectId,
	pub document_id: Bson,
	pub op: TrackedOp,
}

/// The tracker precedence table: what one document's tracker becomes when a
/// further operation on it is observed. `None` means the tracker nets out to
/// nothing (an insert that was deleted again within the interval).
pub fn coalesce(existing: Option<TrackedOp>, incoming: TrackedOp) -> Option<TrackedOp> {
	use TrackedOp::*;
	match (existing, incoming) {
		(None, op) => Some(op),
		(Some(Insert), Delete) => None,
		(Some(Insert), _) => Some(Insert),
		(Some(Update), Delete) => Some(Delete),
		(Some(Update), _) => Some(Update),
		(Some(Delete), Insert) => Some(Update),
		(Some(Delete), Update) => Some(Update),
		(Some(Delete), Delete) => Some(Delete),
	}
}

/// Folds raw trackers into one net operation per document, in capture order.
pub fn coalesce_trackers(trackers: Vec<ModifiedTracker>) -> Result<Vec<(DocId, TrackedOp)>> {
	let mut order: Vec<DocId> = Vec::new();
	let mut net: std::collections::HashMap<DocId, Option<TrackedOp>> = std::collections::HashMap::new();

	let mut trackers = trackers;
	trackers.sort_by_key(|t| t.id);

	for tracker in trackers {
		let doc_id = DocId::new(tracker.document_id)?;
		let slot = net.entry(doc_id.clone()).or_insert_with(|| {
			order.push(doc_id.clone());
			None
		});
		*slot = coalesce(*slot, tracker.op);
	}

	Ok(order
		.into_iter()
		.filter_map(|doc_id| {
			let op = net.get(&doc_id).copied().flatten()?;
			Some((doc_id, op))
		})
		.collect())
}

#[derive(Clone)]
pub struct ModifiedStore {
	coll: Collection<ModifiedTracker>,
}

impl ModifiedStore {
	pub(crate) fn open(db: &Database, collection: &str) -> Self {
		Self { coll: db.collection(&super::aux_name("modified", collection)) }
	}

	pub async fn all(&self) -> Result<Vec<ModifiedTracker>> {
		Ok(self.coll.find(doc! {}).await?.try_collect().await?)
	}

	pub async fn any(&self) -> Result<bool> {
		Ok(self.coll.find_one(doc! {}).await?.is_some())
	}

	/// Listener-side upsert applying the [`coalesce`] precedence. Returns
	/// whether any tracker remains for the document afterwards.
	pub async fn record(&self, document_id: &Bson, op: TrackedOp) -> Result<bool> {
		let filter = doc! {"document_id": document_id.clone()};
		let existing = self.coll.find_one(filter.clone()).await?;

		match coalesce(existing.as_ref().map(|t| t.op), op) {
			None => {
				self.coll.delete_one(filter).await?;
				Ok(false)
			}
			Some(net) => {
				match existing {
					Some(tracker) if tracker.op == net => {}
					Some(tracker) => {
						self.coll
							.update_one(doc! {"_id": tracker.id}, doc! {"$set": {"op": net.as_str()}})
							.await?;
					}
					None => {
						let tracker =
							ModifiedTracker { id: ObjectId::new(), document_id: document_id.clone(), op: net };
						self.coll.insert_one(&tracker).await?;
					}
				}
				Ok(true)
			}
		}
	}

	pub async fn insert_many(&self, trackers: &[ModifiedTracker], session: &mut ClientSession) -> Result<()> {
		if trackers.is_empty() {
			return Ok(());
		}
		self.coll.insert_many(trackers).session(session).await?;
		Ok(())
	}

	pub async fn clear(&self, session: &mut ClientSession) -> Result<()> {
		self.coll.delete_many(doc! {}).session(session).await?;
		Ok(())
	}

	/// Sessionless clear, used after an operation fences away the events its
	/// own collection writes produced.
	pub async fn clear_unsessioned(&self) -> Result<()> {
		self.coll.delete_many(doc! {}).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tracker(document_id: i64, op: TrackedOp) -> ModifiedTracker {
		ModifiedTracker { id: ObjectId::new(), document_id: Bson::Int64(document_id), op }
	}

	#[test]
	fn precedence_table() {
		use TrackedOp::*;
		assert_eq!(coalesce(None, Insert), Some(Insert));
		assert_eq!(coalesce(None, Update), Some(Update));
		assert_eq!(coalesce(None, Delete), Some(Delete));
		assert_eq!(coalesce(Some(Insert), Delete), None);
		assert_eq!(coalesce(Some(Insert), Update), Some(Insert));
		assert_eq!(coalesce(Some(Update), Update), Some(Update));
		assert_eq!(coalesce(Some(Update), Delete), Some(Delete));
		assert_eq!(coalesce(Some(Delete), Insert), Some(Update));
	}

	#[test]
	fn coalescing_nets_out_insert_then_delete() {
		let trackers = vec![
			tracker(1, TrackedOp::Insert),
			tracker(2, TrackedOp::Update),
			tracker(1, TrackedOp::Delete),
		];
		let net = coalesce_trackers(trackers).unwrap();
		assert_eq!(net.len(), 1);
		assert_eq!(net[0].0.value(), &Bson::Int64(2));
		assert_eq!(net[0].1, TrackedOp::Update);
	}

	#[test]
	fn coalescing_keeps_one_entry_per_document() {
		let trackers = vec![
			tracker(1, TrackedOp::Insert),
			tracker(1, TrackedOp::Update),
			tracker(1, TrackedOp::Update),
		];
		let net = coalesce_trackers(trackers).unwrap();
		assert_eq!(net.len(), 1);
		assert_eq!(net[0].1, TrackedOp::Insert);
	}
}
