// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use std::collections::HashMap;
use std::sync::Mutex;

use bson::{Bson, DateTime, Document, doc, oid::ObjectId};
use futures_util::TryStreamExt;
use mongodb::{Client, ClientSession, Collection};
use mongovc_delta::{DocumentDelta, encode};
use tracing::{debug, info, instrument};

use crate::{
	CollectionLocator, DocId, EngineConfig, Error, Result,
	listener::{ChangeListener, fence_marker_id, user_docs_filter},
	lock::CollectionLock,
	store::{
		BranchRecord, DeltaRecord, LogEntry, Metadata, ModifiedTracker, Stores, TrackedOp, coalesce_trackers,
		delta_binary,
	},
	tree::{LogTree, PartialDeltaTree, VersionId, compose_along_path},
};

/// Target of a checkout or diff: a version number, a branch, or both.
/// A bare branch addresses the branch tip.
#[derive(Clone, Debug, Default)]
pub struct VersionSpec {
	pub n: Option<i64>,
	pub branch: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitOutcome {
	Initialized,
	AlreadyInitialized,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
	Registered(VersionId),
	/// Nothing to register; the engine state is untouched.
	NoChanges(VersionId),
}

/// One document's pending or historical change, as reported by `diff`.
#[derive(Clone, Debug)]
pub struct DocumentDiff {
	pub document_id: Bson,
	pub delta: DocumentDelta,
}

#[derive(Clone, Debug)]
pub struct Status {
	pub current_n: i64,
	pub current_branch: String,
	pub detached: bool,
	pub changed: bool,
	pub has_stash: bool,
	pub has_conflicts: bool,
}

#[derive(Default)]
struct CacheState {
	log_tree: Option<LogTree>,
	last_epoch: Option<i64>,
}

/// A versioned MongoDB collection: the tracked collection plus the auxiliary
/// stores, the background change listener, and the cross-process lock.
///
/// All public operations serialize through the lock; readers (`status`,
/// `log`, `branches`, `diff`) go without it and tolerate a stale snapshot.
pub struct VersionedCollection {
	client: Client,
	locator: CollectionLocator,
	collection: Collection<Document>,
	pub(crate) stores: Stores,
	pub(crate) lock: CollectionLock,
	listener: Mutex<Option<ChangeListener>>,
	cache: Mutex<CacheState>,
	config: EngineConfig,
}

impl VersionedCollection {
	/// Opens the engine over a collection. The change listener starts
	/// immediately when the collection is already initialized; otherwise
	/// `init` starts it.
	pub async fn open(client: Client, locator: CollectionLocator, config: EngineConfig) -> Result<Self> {
		let database = client.database(&locator.database);
		let collection = database.collection::<Document>(&locator.collection);
		let stores = Stores::open(&database, &locator.collection);
		let holder_id = format!("vc-{}", uuid::Uuid::new_v4());
		let lock = CollectionLock::new(stores.lock.clone(), &locator.collection, &holder_id, config.clone());

		let engine = Self {
			client,
			locator,
			collection,
			stores,
			lock,
			listener: Mutex::new(None),
			cache: Mutex::new(CacheState::default()),
			config,
		};
		if engine.stores.metadata.load().await?.is_some() {
			engine.lock.ensure_record().await?;
			engine.start_listener();
		}
		Ok(engine)
	}

	pub fn locator(&self) -> &CollectionLocator {
		&self.locator
	}

	pub fn collection(&self) -> &Collection<Document> {
		&self.collection
	}

	/// Stops the listener; its resume token is already persisted per event.
	pub async fn close(self) -> Result<()> {
		let listener = self.listener.lock().unwrap_or_else(|p| p.into_inner()).take();
		if let Some(listener) = listener {
			listener.shutdown().await;
		}
		Ok(())
	}

	// ---- Operations ------------------------------------------------------

	/// Creates the auxiliary stores, the root version `(0, main)`, and the
	/// replica snapshot, and starts the listener. A second `init` reports
	/// and changes nothing.
	#[instrument(level = "debug", skip(self))]
	pub async fn init(&self, message: &str) -> Result<InitOutcome> {
		if self.stores.metadata.load().await?.is_some() {
			info!(collection = %self.locator, "already initialized");
			return Ok(InitOutcome::AlreadyInitialized);
		}
		self.lock.ensure_record().await?;
		let acquired = self.lock.acquire().await?;
		self.absorb_epoch(acquired.epoch);
		let result = self.init_locked(message).await;
		self.finish(result).await
	}

	async fn init_locked(&self, message: &str) -> Result<(InitOutcome, bool)> {
		if self.stores.metadata.load().await?.is_some() {
			return Ok((InitOutcome::AlreadyInitialized, false));
		}
		// The listener must watch the stream before the snapshot is taken;
		// anything written after the fence lands in `modified`.
		self.start_listener();
		self.fence().await?;

		let docs: Vec<Document> = self.collection.find(user_docs_filter()).await?.try_collect().await?;
		let root = LogEntry {
			id: ObjectId::new(),
			n: 0,
			branch: "main".to_owned(),
			timestamp: DateTime::now(),
			message: message.to_owned(),
			prev_id: None,
			next_ids: Vec::new(),
		};

		let mut session = self.start_transaction().await?;
		let outcome = self.init_in(&mut session, &root, &docs).await;
		self.end_transaction(session, outcome).await?;

		self.cache_tree(LogTree::from_entries(std::slice::from_ref(&root))?);
		info!(collection = %self.locator, "initialized at (0, main)");
		Ok((InitOutcome::Initialized, true))
	}

	async fn init_in(&self, session: &mut ClientSession, root: &LogEntry, docs: &[Document]) -> Result<()> {
		self.stores.log.insert(root, session).await?;
		let main = BranchRecord { name: "main".to_owned(), tip_n: 0, tip_branch: "main".to_owned() };
		self.stores.branches.insert(&main, session).await?;
		self.stores.replica.clear(session).await?;
		self.stores.replica.insert_many(docs, session).await?;
		self.stores.metadata.create(&Metadata::initial(), session).await?;
		Ok(())
	}

	/// Registers the captured changes as a new version: the next version on
	/// the current branch, or the first version of a branch created here
	/// when `branch` is given.
	#[instrument(level = "debug", skip(self))]
	pub async fn register(&self, message: &str, branch: Option<&str>) -> Result<RegisterOutcome> {
		let acquired = self.lock.acquire().await?;
		self.absorb_epoch(acquired.epoch);
		let result = self.register_locked(message, branch).await;
		self.finish(result).await
	}

	async fn register_locked(&self, message: &str, branch: Option<&str>) -> Result<(RegisterOutcome, bool)> {
		let meta = self.require_metadata().await?;
		if meta.has_conflicts {
			return Err(Error::UnresolvedConflicts);
		}
		self.fence().await?;

		let changes = coalesce_trackers(self.stores.modified.all().await?)?;
		let mut tree = self.log_tree().await?;
		let parent = self.current_position(&meta).await?;

		if changes.is_empty() && branch.is_none() {
			debug!("nothing to register");
			return Ok((RegisterOutcome::NoChanges(parent), false));
		}
		if meta.detached && branch.is_none() {
			return Err(Error::DetachedWithoutBranch);
		}

		let new_version = match branch {
			Some(name) => {
				if self.stores.branches.find(name).await?.is_some() {
					return Err(Error::BranchExists(name.to_owned()));
				}
				VersionId::new(1, name)
			}
			// The first version of a branch is 1; only the root is 0.
			None if meta.current_n < 0 => VersionId::new(1, &meta.current_branch),
			None => VersionId::new(meta.current_n + 1, &meta.current_branch),
		};
		if tree.contains(&new_version) {
			return Err(Error::Corrupt(format!("version {new_version} already registered")));
		}

		// Each new delta links to the document's most recent delta up the
		// path from the parent version to the root.
		let mut prev_scope = vec![parent.clone()];
		prev_scope.extend(tree.ancestors(&parent)?);
		let doc_ids: Vec<Bson> = changes.iter().map(|(id, _)| id.value().clone()).collect();
		let prior = self.stores.deltas.for_documents_on_versions(&doc_ids, &prev_scope).await?;
		let mut deepest: HashMap<DocId, &DeltaRecord> = HashMap::new();
		for record in &prior {
			let doc_id = DocId::new(record.document_id.clone())?;
			let level = tree.node(&record.version())?.level;
			let deeper = match deepest.get(&doc_id) {
				Some(existing) => level > tree.node(&existing.version())?.level,
				None => true,
			};
			if deeper {
				deepest.insert(doc_id, record);
			}
		}

		let now = DateTime::now();
		let mut delta_records = Vec::new();
		let mut new_states: Vec<(DocId, Option<Document>)> = Vec::new();
		for (doc_id, _) in &changes {
			let current = self.collection.find_one(doc_id.filter()).await?;
			let previous = self.stores.replica.get(doc_id).await?;
			let delta = DocumentDelta::diff(previous.as_ref(), current.as_ref());
			new_states.push((doc_id.clone(), current));
			if delta.is_identity() {
				continue;
			}
			delta_records.push(DeltaRecord {
				id: ObjectId::new(),
				document_id: doc_id.value().clone(),
				version_n: new_version.n,
				branch: new_version.branch.clone(),
				timestamp: now,
				forward: delta_binary(encode(&delta)?),
				backward: delta_binary(encode(&delta.invert())?),
				prev_id: deepest.get(doc_id).map(|record| record.id),
				next_ids: Vec::new(),
			});
		}

		if delta_records.is_empty() && branch.is_none() {
			// Everything captured netted out to a no-op; just settle the
			// trackers.
			let mut session = self.start_transaction().await?;
			let outcome = async {
				self.stores.modified.clear(&mut session).await?;
				self.stores.metadata.set_changed(false, &mut session).await
			}
			.await;
			self.end_transaction(session, outcome).await?;
			return Ok((RegisterOutcome::NoChanges(parent), true));
		}

		let entry = LogEntry {
			id: ObjectId::new(),
			n: new_version.n,
			branch: new_version.branch.clone(),
			timestamp: now,
			message: message.to_owned(),
			prev_id: Some(tree.node(&parent)?.entry_id),
			next_ids: Vec::new(),
		};

		let mut session = self.start_transaction().await?;
		let outcome = self
			.register_in(&mut session, &meta, &entry, &parent, branch, &delta_records, &new_states)
			.await;
		self.end_transaction(session, outcome).await?;

		tree.insert_child(&parent, &entry)?;
		self.cache_tree(tree);
		info!(version = %new_version, "registered");
		Ok((RegisterOutcome::Registered(new_version), true))
	}

	#[allow(clippy::too_many_arguments)]
	async fn register_in(
		&self,
		session: &mut ClientSession,
		meta: &Metadata,
		entry: &LogEntry,
		parent: &VersionId,
		new_branch: Option<&str>,
		delta_records: &[DeltaRecord],
		new_states: &[(DocId, Option<Document>)],
	) -> Result<()> {
		self.stores.log.insert(entry, session).await?;
		let tree = self.log_tree().await?;
		self.stores.log.push_next_id(tree.node(parent)?.entry_id, entry.id, session).await?;

		self.stores.deltas.insert_many(delta_records, session).await?;
		for record in delta_records {
			if let Some(prev) = record.prev_id {
				self.stores.deltas.push_next_id(prev, record.id, session).await?;
			}
		}

		match new_branch {
			Some(name) => {
				let record =
					BranchRecord { name: name.to_owned(), tip_n: entry.n, tip_branch: entry.branch.clone() };
				self.stores.branches.insert(&record, session).await?;
			}
			None => {
				self.stores
					.branches
					.set_tip(&meta.current_branch, entry.n, &entry.branch, session)
					.await?;
			}
		}

		for (doc_id, state) in new_states {
			self.stores.replica.write(doc_id, state.as_ref(), session).await?;
		}
		self.stores.modified.clear(session).await?;
		self.stores.metadata.set_position(entry.n, &entry.branch, false, session).await?;
		self.stores.metadata.set_changed(false, session).await?;
		Ok(())
	}

	/// Moves the collection to another registered version by composing each
	/// affected document's deltas along the path there.
	#[instrument(level = "debug", skip(self))]
	pub async fn checkout(&self, spec: VersionSpec) -> Result<VersionId> {
		let acquired = self.lock.acquire().await?;
		self.absorb_epoch(acquired.epoch);
		let result = self.checkout_locked(spec).await;
		self.finish(result).await
	}

	pub(crate) async fn checkout_locked(&self, spec: VersionSpec) -> Result<(VersionId, bool)> {
		let meta = self.require_metadata().await?;
		if meta.has_conflicts {
			return Err(Error::UnresolvedConflicts);
		}
		self.fence().await?;
		if meta.changed || self.stores.modified.any().await? {
			return Err(Error::UncommittedChanges);
		}

		let tree = self.log_tree().await?;
		let target = self.resolve_target(&meta, &spec).await?;
		if !tree.contains(&target) {
			return Err(Error::InvalidVersion { n: target.n, branch: target.branch });
		}
		let current = self.current_position(&meta).await?;
		if current == target && meta.current_n >= 0 {
			return Ok((target, false));
		}

		let path = tree.path(&current, &target)?;
		let versions: Vec<VersionId> = path.iter().map(|(version, _)| version.clone()).collect();
		let records = self.stores.deltas.on_versions(&versions).await?;

		let mut writes: Vec<(DocId, Option<Document>)> = Vec::new();
		for (doc_id, group) in group_by_document(&records)? {
			let partial = PartialDeltaTree::build(&group, &tree)?;
			let net = compose_along_path(&partial, &path)?;
			if net.is_identity() {
				continue;
			}
			let prior = self.stores.replica.get(&doc_id).await?;
			let next = net.apply(prior)?;
			writes.push((doc_id, next));
		}

		let record = self
			.stores
			.branches
			.find(&target.branch)
			.await?
			.ok_or_else(|| Error::UnknownBranch(target.branch.clone()))?;
		let detached = !(record.tip_n == target.n && record.tip_branch == target.branch);

		let mut session = self.start_transaction().await?;
		let outcome = self.checkout_in(&mut session, &target, detached, &writes).await;
		self.end_transaction(session, outcome).await?;

		// Our own writes to the collection are in the stream now; drain and
		// drop their trackers so they do not count as user changes.
		self.fence().await?;
		self.stores.modified.clear_unsessioned().await?;
		self.stores.metadata.set_changed_hint(false).await?;

		info!(version = %target, detached, "checked out");
		Ok((target, true))
	}

	async fn checkout_in(
		&self,
		session: &mut ClientSession,
		target: &VersionId,
		detached: bool,
		writes: &[(DocId, Option<Document>)],
	) -> Result<()> {
		for (doc_id, next) in writes {
			match next {
				Some(doc) => {
					self.collection
						.replace_one(doc_id.filter(), doc)
						.upsert(true)
						.session(&mut *session)
						.await?;
				}
				None => {
					self.collection.delete_one(doc_id.filter()).session(&mut *session).await?;
				}
			}
			self.stores.replica.write(doc_id, next.as_ref(), session).await?;
		}
		self.stores.metadata.set_position(target.n, &target.branch, detached, session).await?;
		Ok(())
	}

	/// Creates a branch at the current position and moves onto it; the
	/// branch has no versions until the next register.
	#[instrument(level = "debug", skip(self))]
	pub async fn create_branch(&self, name: &str) -> Result<()> {
		let acquired = self.lock.acquire().await?;
		self.absorb_epoch(acquired.epoch);
		let result = self.create_branch_locked(name).await;
		self.finish(result).await
	}

	async fn create_branch_locked(&self, name: &str) -> Result<((), bool)> {
		let meta = self.require_metadata().await?;
		if self.stores.branches.find(name).await?.is_some() {
			return Err(Error::BranchExists(name.to_owned()));
		}
		let position = self.current_position(&meta).await?;
		let record =
			BranchRecord { name: name.to_owned(), tip_n: position.n, tip_branch: position.branch.clone() };

		let mut session = self.start_transaction().await?;
		let outcome = async {
			self.stores.branches.insert(&record, &mut session).await?;
			self.stores.metadata.set_position(-1, name, false, &mut session).await
		}
		.await;
		self.end_transaction(session, outcome).await?;
		info!(branch = name, origin = %position, "created branch");
		Ok(((), true))
	}

	/// Removes a version and its whole subtree: log entries, deltas, and
	/// branch records whose tip lies inside. Checks out the parent first
	/// when the current version is being removed. The root is protected.
	#[instrument(level = "debug", skip(self))]
	pub async fn delete_version_subtree(&self, n: i64, branch: &str) -> Result<Vec<VersionId>> {
		let acquired = self.lock.acquire().await?;
		self.absorb_epoch(acquired.epoch);
		let result = self.delete_subtree_locked(n, branch).await;
		self.finish(result).await
	}

	async fn delete_subtree_locked(&self, n: i64, branch: &str) -> Result<(Vec<VersionId>, bool)> {
		let meta = self.require_metadata().await?;
		let target = VersionId::new(n, branch);
		let tree = self.log_tree().await?;
		if !tree.contains(&target) || target == *tree.root() {
			return Err(Error::InvalidVersion { n, branch: branch.to_owned() });
		}

		let mut pruned = tree.clone();
		let removed = pruned.remove_subtree(&target)?;

		let current = self.current_position(&meta).await?;
		if removed.contains(&current) {
			let parent = tree
				.parent(&target)?
				.cloned()
				.ok_or_else(|| Error::Corrupt(format!("{target} has no parent")))?;
			self.checkout_locked(VersionSpec { n: Some(parent.n), branch: Some(parent.branch) }).await?;
		}

		let entry_ids: Vec<ObjectId> =
			removed.iter().map(|version| tree.node(version).map(|node| node.entry_id)).collect::<Result<_>>()?;

		// A record whose tip fell inside the subtree is dropped with it,
		// unless its branch keeps earlier versions, in which case it points
		// at the deepest survivor.
		let mut dead_branches = Vec::new();
		let mut retipped: Vec<BranchRecord> = Vec::new();
		for record in self.stores.branches.all().await? {
			let tip = VersionId::new(record.tip_n, &record.tip_branch);
			if !removed.contains(&tip) {
				continue;
			}
			let survivor = pruned
				.preorder()
				.into_iter()
				.filter(|version| version.branch == record.name)
				.max_by_key(|version| version.n);
			match survivor {
				Some(tip) => retipped.push(BranchRecord {
					name: record.name.clone(),
					tip_n: tip.n,
					tip_branch: tip.branch,
				}),
				None => dead_branches.push(record.name.clone()),
			}
		}

		let mut session = self.start_transaction().await?;
		let outcome = async {
			self.stores.log.delete_ids(&entry_ids, &mut session).await?;
			self.stores.log.pull_next_ids(&entry_ids, &mut session).await?;
			self.stores.deltas.delete_on_versions(&removed, &mut session).await?;
			self.stores.branches.delete_names(&dead_branches, &mut session).await?;
			for record in &retipped {
				self.stores.branches.upsert(record, &mut session).await?;
			}
			Ok(())
		}
		.await;
		self.end_transaction(session, outcome).await?;

		self.cache_tree(pruned);
		info!(target = %target, removed = removed.len(), "deleted version subtree");
		Ok((removed, true))
	}

	/// Pending changes against the current version (`other = None`), or the
	/// forward deltas from another registered version to the current one.
	#[instrument(level = "debug", skip(self))]
	pub async fn diff(&self, other: Option<VersionSpec>) -> Result<Vec<DocumentDiff>> {
		let meta = self.require_metadata().await?;
		match other {
			None => {
				self.fence().await?;
				let changes = coalesce_trackers(self.stores.modified.all().await?)?;
				let mut diffs = Vec::new();
				for (doc_id, _) in changes {
					let previous = self.stores.replica.get(&doc_id).await?;
					let current = self.collection.find_one(doc_id.filter()).await?;
					let delta = DocumentDelta::diff(previous.as_ref(), current.as_ref());
					if delta.is_identity() {
						continue;
					}
					diffs.push(DocumentDiff { document_id: doc_id.value().clone(), delta });
				}
				Ok(diffs)
			}
			Some(spec) => {
				let tree = self.log_tree().await?;
				let other = self.resolve_target(&meta, &spec).await?;
				if !tree.contains(&other) {
					return Err(Error::InvalidVersion { n: other.n, branch: other.branch });
				}
				let current = self.current_position(&meta).await?;
				let path = tree.path(&other, &current)?;
				let versions: Vec<VersionId> = path.iter().map(|(version, _)| version.clone()).collect();
				let records = self.stores.deltas.on_versions(&versions).await?;

				let mut diffs = Vec::new();
				for (doc_id, group) in group_by_document(&records)? {
					let partial = PartialDeltaTree::build(&group, &tree)?;
					let net = compose_along_path(&partial, &path)?;
					if net.is_identity() {
						continue;
					}
					diffs.push(DocumentDiff { document_id: doc_id.value().clone(), delta: net });
				}
				Ok(diffs)
			}
		}
	}

	/// Moves the captured changes and their documents aside and restores the
	/// collection to the registered state.
	#[instrument(level = "debug", skip(self))]
	pub async fn stash(&self) -> Result<bool> {
		let acquired = self.lock.acquire().await?;
		self.absorb_epoch(acquired.epoch);
		let result = self.stash_locked().await;
		self.finish(result).await
	}

	async fn stash_locked(&self) -> Result<(bool, bool)> {
		let meta = self.require_metadata().await?;
		if meta.has_stash {
			return Err(Error::StashExists);
		}
		self.fence().await?;
		let changes = coalesce_trackers(self.stores.modified.all().await?)?;
		if changes.is_empty() {
			return Ok((false, false));
		}

		let mut stashed_docs = Vec::new();
		let mut stashed_trackers = Vec::new();
		let mut restores: Vec<(DocId, Option<Document>)> = Vec::new();
		for (doc_id, op) in &changes {
			if *op != TrackedOp::Delete {
				if let Some(doc) = self.collection.find_one(doc_id.filter()).await? {
					stashed_docs.push(doc);
				}
			}
			stashed_trackers.push(ModifiedTracker {
				id: ObjectId::new(),
				document_id: doc_id.value().clone(),
				op: *op,
			});
			restores.push((doc_id.clone(), self.stores.replica.get(doc_id).await?));
		}

		let mut session = self.start_transaction().await?;
		let outcome = async {
			self.stores.stash.save(&stashed_docs, &stashed_trackers, &mut session).await?;
			self.restore_documents_in(&mut session, &restores).await?;
			self.stores.modified.clear(&mut session).await?;
			self.stores.metadata.set_has_stash(true, &mut session).await?;
			self.stores.metadata.set_changed(false, &mut session).await
		}
		.await;
		self.end_transaction(session, outcome).await?;

		self.fence().await?;
		self.stores.modified.clear_unsessioned().await?;
		self.stores.metadata.set_changed_hint(false).await?;
		info!(documents = changes.len(), "stashed changes");
		Ok((true, true))
	}

	/// Writes the stashed documents back over the collection and drops the
	/// stash. The restored writes count as fresh changes.
	#[instrument(level = "debug", skip(self))]
	pub async fn stash_apply(&self) -> Result<bool> {
		let acquired = self.lock.acquire().await?;
		self.absorb_epoch(acquired.epoch);
		let result = self.stash_apply_locked().await;
		self.finish(result).await
	}

	async fn stash_apply_locked(&self) -> Result<(bool, bool)> {
		let meta = self.require_metadata().await?;
		if !meta.has_stash {
			return Ok((false, false));
		}
		let docs = self.stores.stash.docs().await?;
		let trackers = self.stores.stash.trackers().await?;

		let mut by_id: HashMap<DocId, Document> = HashMap::new();
		for doc in docs {
			let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
			by_id.insert(DocId::new(id)?, doc);
		}

		let mut session = self.start_transaction().await?;
		let outcome = async {
			for tracker in &trackers {
				let doc_id = DocId::new(tracker.document_id.clone())?;
				match (tracker.op, by_id.get(&doc_id)) {
					(TrackedOp::Delete, _) => {
						self.collection.delete_one(doc_id.filter()).session(&mut session).await?;
					}
					(_, Some(doc)) => {
						self.collection
							.replace_one(doc_id.filter(), doc)
							.upsert(true)
							.session(&mut session)
							.await?;
					}
					(_, None) => {}
				}
			}
			self.stores.stash.clear(&mut session).await?;
			self.stores.metadata.set_has_stash(false, &mut session).await
		}
		.await;
		self.end_transaction(session, outcome).await?;
		info!(documents = trackers.len(), "applied stash");
		Ok((true, true))
	}

	#[instrument(level = "debug", skip(self))]
	pub async fn stash_discard(&self) -> Result<bool> {
		let acquired = self.lock.acquire().await?;
		self.absorb_epoch(acquired.epoch);
		let result = self.stash_discard_locked().await;
		self.finish(result).await
	}

	async fn stash_discard_locked(&self) -> Result<(bool, bool)> {
		let meta = self.require_metadata().await?;
		if !meta.has_stash {
			return Ok((false, false));
		}
		let mut session = self.start_transaction().await?;
		let outcome = async {
			self.stores.stash.clear(&mut session).await?;
			self.stores.metadata.set_has_stash(false, &mut session).await
		}
		.await;
		self.end_transaction(session, outcome).await?;
		Ok((true, true))
	}

	/// Throws away the captured changes, restoring modified documents from
	/// the replica.
	#[instrument(level = "debug", skip(self))]
	pub async fn discard_changes(&self) -> Result<bool> {
		let acquired = self.lock.acquire().await?;
		self.absorb_epoch(acquired.epoch);
		let result = self.discard_changes_locked().await;
		self.finish(result).await
	}

	async fn discard_changes_locked(&self) -> Result<(bool, bool)> {
		self.require_metadata().await?;
		self.fence().await?;
		let changes = coalesce_trackers(self.stores.modified.all().await?)?;
		if changes.is_empty() {
			return Ok((false, false));
		}

		let mut restores: Vec<(DocId, Option<Document>)> = Vec::new();
		for (doc_id, _) in &changes {
			restores.push((doc_id.clone(), self.stores.replica.get(doc_id).await?));
		}

		let mut session = self.start_transaction().await?;
		let outcome = async {
			self.restore_documents_in(&mut session, &restores).await?;
			self.stores.modified.clear(&mut session).await?;
			self.stores.metadata.set_changed(false, &mut session).await
		}
		.await;
		self.end_transaction(session, outcome).await?;

		self.fence().await?;
		self.stores.modified.clear_unsessioned().await?;
		self.stores.metadata.set_changed_hint(false).await?;
		info!(documents = changes.len(), "discarded changes");
		Ok((true, true))
	}

	/// The registered versions in deterministic tree order.
	pub async fn log(&self) -> Result<Vec<LogEntry>> {
		self.require_metadata().await?;
		let entries = self.stores.log.all().await?;
		let tree = LogTree::from_entries(&entries)?;
		let mut by_version: HashMap<VersionId, LogEntry> = entries
			.into_iter()
			.map(|entry| (VersionId::new(entry.n, &entry.branch), entry))
			.collect();
		Ok(tree.preorder().into_iter().filter_map(|version| by_version.remove(&version)).collect())
	}

	pub async fn status(&self) -> Result<Status> {
		let meta = self.require_metadata().await?;
		let changed = meta.changed || self.stores.modified.any().await?;
		Ok(Status {
			current_n: meta.current_n,
			current_branch: meta.current_branch,
			detached: meta.detached,
			changed,
			has_stash: meta.has_stash,
			has_conflicts: meta.has_conflicts,
		})
	}

	pub async fn branches(&self) -> Result<Vec<BranchRecord>> {
		self.require_metadata().await?;
		self.stores.branches.all().await
	}

	/// The conflicts left by the last divergent pull, if any.
	pub async fn conflicts(&self) -> Result<Vec<crate::store::ConflictRecord>> {
		self.require_metadata().await?;
		self.stores.conflicts.all().await
	}

	// ---- Shared plumbing -------------------------------------------------

	pub(crate) async fn require_metadata(&self) -> Result<Metadata> {
		self.stores
			.metadata
			.load()
			.await?
			.ok_or_else(|| Error::NotInitialized(self.locator.collection.clone()))
	}

	/// The current log position. A freshly created branch (`current_n = -1`)
	/// sits at the version it was created from.
	pub(crate) async fn current_position(&self, meta: &Metadata) -> Result<VersionId> {
		if meta.current_n >= 0 {
			return Ok(VersionId::new(meta.current_n, &meta.current_branch));
		}
		let record = self
			.stores
			.branches
			.find(&meta.current_branch)
			.await?
			.ok_or_else(|| Error::UnknownBranch(meta.current_branch.clone()))?;
		Ok(VersionId::new(record.tip_n, &record.tip_branch))
	}

	async fn resolve_target(&self, meta: &Metadata, spec: &VersionSpec) -> Result<VersionId> {
		match (spec.n, &spec.branch) {
			(None, Some(branch)) => {
				let record = self
					.stores
					.branches
					.find(branch)
					.await?
					.ok_or_else(|| Error::UnknownBranch(branch.clone()))?;
				Ok(VersionId::new(record.tip_n, record.tip_branch))
			}
			(Some(n), Some(branch)) => Ok(VersionId::new(n, branch)),
			(Some(n), None) => Ok(VersionId::new(n, &meta.current_branch)),
			(None, None) => Err(Error::InvalidVersion { n: -1, branch: meta.current_branch.clone() }),
		}
	}

	async fn restore_documents_in(
		&self,
		session: &mut ClientSession,
		restores: &[(DocId, Option<Document>)],
	) -> Result<()> {
		for (doc_id, state) in restores {
			match state {
				Some(doc) => {
					self.collection
						.replace_one(doc_id.filter(), doc)
						.upsert(true)
						.session(&mut *session)
						.await?;
				}
				None => {
					self.collection.delete_one(doc_id.filter()).session(&mut *session).await?;
				}
			}
		}
		Ok(())
	}

	/// Blocks until the listener has drained every event written before this
	/// call, by watching for a sentinel insert on a reserved id.
	///
	/// Sentinels are retried on a short interval: a listener whose stream is
	/// still opening (first start, or a reopen after an error) misses writes
	/// made before the stream went live, and only a fresh sentinel can prove
	/// it has caught up.
	pub(crate) async fn fence(&self) -> Result<()> {
		let deadline = tokio::time::Instant::now() + self.config.fence_timeout;
		loop {
			let mut receiver = {
				let guard = self.listener.lock().unwrap_or_else(|p| p.into_inner());
				let listener = guard.as_ref().ok_or(Error::ListenerNotRunning)?;
				if let Some(message) = listener.fatal() {
					return Err(Error::ListenerFailed(message));
				}
				listener.subscribe_fence()
			};

			let marker = fence_marker_id();
			self.collection.insert_one(doc! {"_id": marker.as_str()}).await?;
			self.collection.delete_one(doc! {"_id": marker.as_str()}).await?;

			let now = tokio::time::Instant::now();
			if now >= deadline {
				return Err(Error::ListenerStalled(self.config.fence_timeout));
			}
			let slice = std::cmp::min(deadline - now, std::time::Duration::from_millis(500));

			let wait = receiver.wait_for(|seen| seen.as_deref() == Some(marker.as_str()));
			match tokio::time::timeout(slice, wait).await {
				Ok(Ok(_)) => return Ok(()),
				Ok(Err(_)) => return Err(Error::ListenerNotRunning),
				Err(_) if tokio::time::Instant::now() < deadline => continue,
				Err(_) => {
					let fatal = {
						let guard = self.listener.lock().unwrap_or_else(|p| p.into_inner());
						guard.as_ref().and_then(|listener| listener.fatal())
					};
					return match fatal {
						Some(message) => Err(Error::ListenerFailed(message)),
						None => Err(Error::ListenerStalled(self.config.fence_timeout)),
					};
				}
			}
		}
	}

	fn start_listener(&self) {
		let listener = ChangeListener::spawn(
			self.collection.clone(),
			self.stores.metadata.clone(),
			self.stores.modified.clone(),
			self.config.clone(),
		);
		*self.listener.lock().unwrap_or_else(|p| p.into_inner()) = Some(listener);
	}

	pub(crate) async fn log_tree(&self) -> Result<LogTree> {
		if let Some(tree) = self.cache.lock().unwrap_or_else(|p| p.into_inner()).log_tree.clone() {
			return Ok(tree);
		}
		let entries = self.stores.log.all().await?;
		let tree = LogTree::from_entries(&entries)?;
		self.cache_tree(tree.clone());
		Ok(tree)
	}

	pub(crate) fn cache_tree(&self, tree: LogTree) {
		self.cache.lock().unwrap_or_else(|p| p.into_inner()).log_tree = Some(tree);
	}

	pub(crate) fn invalidate_tree(&self) {
		self.cache.lock().unwrap_or_else(|p| p.into_inner()).log_tree = None;
	}

	/// Compares the epoch observed at lock acquisition with the last one
	/// this process saw; someone else mutated state in between when they
	/// differ, so cached trees are stale.
	pub(crate) fn absorb_epoch(&self, epoch: i64) {
		let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
		if cache.last_epoch != Some(epoch) {
			cache.log_tree = None;
			cache.last_epoch = Some(epoch);
		}
	}

	pub(crate) async fn finish<T>(&self, result: Result<(T, bool)>) -> Result<T> {
		match result {
			Ok((value, mutated)) => {
				let epoch = self.lock.release(mutated).await?;
				self.cache.lock().unwrap_or_else(|p| p.into_inner()).last_epoch = Some(epoch);
				Ok(value)
			}
			Err(err) => {
				let _ = self.lock.release(false).await;
				Err(err)
			}
		}
	}

	pub(crate) async fn start_transaction(&self) -> Result<ClientSession> {
		let mut session = self.client.start_session().await?;
		session.start_transaction().await?;
		Ok(session)
	}

	pub(crate) async fn end_transaction(&self, mut session: ClientSession, outcome: Result<()>) -> Result<()> {
		match outcome {
			Ok(()) => {
				session.commit_transaction().await?;
				Ok(())
			}
			Err(err) => {
				let _ = session.abort_transaction().await;
				Err(err)
			}
		}
	}
}

/// Groups delta records by document, preserving each group's record order.
pub(crate) fn group_by_document(records: &[DeltaRecord]) -> Result<Vec<(DocId, Vec<&DeltaRecord>)>> {
	let mut order: Vec<DocId> = Vec::new();
	let mut groups: HashMap<DocId, Vec<&DeltaRecord>> = HashMap::new();
	for record in records {
		let doc_id = DocId::new(record.document_id.clone())?;
		groups
			.entry(doc_id.clone())
			.or_insert_with(|| {
				order.push(doc_id.clone());
				Vec::new()
			})
			.push(record);
	}
	Ok(order
		.into_iter()
		.map(|doc_id| {
			let group = groups.remove(&doc_id).unwrap_or_default();
			(doc_id, group)
		})
		.collect())
}
