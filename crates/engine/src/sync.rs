// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

//! Synchronization between two versioned collections: fast-forward `push`,
//! `pull` with three-way auto-merge and conflict materialization, and
//! `resolve_conflicts`.
//!
//! Versions keep their log entry ids when replicated, so the fork point of
//! two collections is found by entry id. `(n, branch)` cannot serve here:
//! after a divergent history both sides hold a `(2, main)` with different
//! content, which is exactly what a pull has to detect.

use std::collections::{HashMap, HashSet};

use bson::{Document, oid::ObjectId};
use mongodb::ClientSession;
use mongovc_delta::three_way_merge;
use tracing::{debug, info, instrument};

use crate::{
	DocId, Error, Result, VersionSpec, VersionedCollection,
	engine::group_by_document,
	store::{BranchRecord, ConflictRecord, DeltaRecord, LogEntry},
	tree::{LogTree, PartialDeltaTree, VersionId, compose_along_path},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushOutcome {
	UpToDate,
	Pushed { versions: usize, tip: VersionId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PullOutcome {
	UpToDate,
	FastForwarded(VersionId),
	/// Remote commits were staged on a rebranch and auto-merged cleanly;
	/// the merged changes are uncommitted in the collection, ready to
	/// register.
	Merged { source_tip: VersionId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolveReport {
	pub resolved: usize,
	pub remaining: usize,
}

impl VersionedCollection {
	/// Replicates this collection's `branch` history onto `remote`.
	/// Fast-forward only: the remote tip must be an ancestor of the local
	/// tip.
	#[instrument(level = "debug", skip(self, remote), fields(remote = %remote.locator()))]
	pub async fn push(&self, remote: &VersionedCollection, branch: Option<&str>) -> Result<PushOutcome> {
		let meta = self.require_metadata().await?;
		if meta.has_conflicts {
			return Err(Error::UnresolvedConflicts);
		}
		let branch = branch.unwrap_or(&meta.current_branch).to_owned();

		acquire_pair(self, remote).await?;
		let result = self.push_locked(remote, &branch).await;
		let mutated = result.as_ref().ok().map(|(_, remote_mutated)| (false, *remote_mutated));
		release_pair(self, remote, mutated).await;
		result.map(|(outcome, _)| outcome)
	}

	async fn push_locked(&self, remote: &VersionedCollection, branch: &str) -> Result<(PushOutcome, bool)> {
		self.fence().await?;
		if self.stores.modified.any().await? {
			return Err(Error::UncommittedChanges);
		}
		let remote_meta = remote.require_metadata().await?;

		let local_tree = self.log_tree().await?;
		let remote_tree = remote.log_tree().await?;

		let record = self
			.stores
			.branches
			.find(branch)
			.await?
			.ok_or_else(|| Error::UnknownBranch(branch.to_owned()))?;
		if record.tip_branch != branch {
			// The branch was created but nothing was registered on it.
			return Ok((PushOutcome::UpToDate, false));
		}
		let tip = VersionId::new(record.tip_n, record.tip_branch);

		let lineage = lineage_rootward(&local_tree, &tip)?;
		let remote_ids = remote_tree.entry_ids();
		let missing: Vec<VersionId> = lineage
			.iter()
			.filter(|version| {
				local_tree
					.node(version)
					.map(|node| !remote_ids.contains(&node.entry_id))
					.unwrap_or(true)
			})
			.cloned()
			.collect();

		// Fast-forward check: the remote tip of this branch must sit on the
		// local lineage.
		let old_remote_tip = remote
			.stores
			.branches
			.find(branch)
			.await?
			.filter(|record| record.tip_branch == branch)
			.map(|record| VersionId::new(record.tip_n, record.tip_branch));
		if let Some(remote_tip) = &old_remote_tip {
			let remote_tip_id = remote_tree.node(remote_tip)?.entry_id;
			match local_tree.version_by_entry_id(remote_tip_id) {
				Some(local_twin) if local_tree.is_ancestor_or_equal(local_twin, &tip)? => {}
				_ => return Err(Error::NonFastForward(branch.to_owned())),
			}
		}
		if missing.is_empty() {
			return Ok((PushOutcome::UpToDate, false));
		}

		let adopt = fresh_history(remote, &remote_tree).await?;
		let fork_entry_id = match local_tree.parent(&missing[0])? {
			Some(parent) => Some(local_tree.node(parent)?.entry_id),
			None => None,
		};
		if fork_entry_id.is_none() && !adopt {
			return Err(Error::Corrupt("collections have unrelated histories".into()));
		}
		if missing.len() == lineage.len() && !adopt {
			// Nothing shared and the remote has real history of its own.
			return Err(Error::Corrupt("collections have unrelated histories".into()));
		}

		let mut session = remote.start_transaction().await?;
		let outcome = async {
			if missing.len() == lineage.len() {
				adopt_history_in(remote, &mut session).await?;
				replicate_versions(self, remote, &local_tree, &missing, None, None, &mut session).await?;
			} else {
				replicate_versions(self, remote, &local_tree, &missing, None, fork_entry_id, &mut session)
					.await?;
			}
			let record =
				BranchRecord { name: branch.to_owned(), tip_n: tip.n, tip_branch: tip.branch.clone() };
			remote.stores.branches.upsert(&record, &mut session).await?;
			Ok(())
		}
		.await;
		remote.end_transaction(session, outcome).await?;
		remote.invalidate_tree();

		// Refresh the remote working collection when it sat cleanly on the
		// branch we just advanced (a fresh remote sits on its root).
		let remote_position = remote.current_position(&remote_meta).await?;
		let parked = match &old_remote_tip {
			Some(old_tip) => remote_position == *old_tip && !remote_meta.detached,
			None => remote_position == *remote_tree.root(),
		};
		if parked && !remote_meta.changed && !remote.stores.modified.any().await? {
			remote
				.checkout_locked(VersionSpec { n: Some(tip.n), branch: Some(tip.branch.clone()) })
				.await?;
		}

		info!(branch, versions = missing.len(), tip = %tip, "pushed");
		Ok((PushOutcome::Pushed { versions: missing.len(), tip }, true))
	}

	/// Brings the remote history of `branch` into this collection:
	/// fast-forward when the local branch has not diverged, otherwise a
	/// rebranch-and-merge whose conflicts fail the pull with
	/// [`Error::AutoMergeFailed`].
	#[instrument(level = "debug", skip(self, remote), fields(remote = %remote.locator()))]
	pub async fn pull(&self, remote: &VersionedCollection, branch: Option<&str>) -> Result<PullOutcome> {
		let meta = self.require_metadata().await?;
		if meta.has_conflicts {
			return Err(Error::UnresolvedConflicts);
		}
		let branch = branch.unwrap_or(&meta.current_branch).to_owned();

		acquire_pair(self, remote).await?;
		let result = self.pull_locked(remote, &branch).await;
		// A conflicted auto-merge has still written records, so the lock
		// epoch must advance for it too.
		let mutated = match &result {
			Ok((_, local_mutated)) => Some((*local_mutated, false)),
			Err(Error::AutoMergeFailed(_)) => Some((true, false)),
			Err(_) => None,
		};
		release_pair(self, remote, mutated).await;
		result.map(|(outcome, _)| outcome)
	}

	async fn pull_locked(&self, remote: &VersionedCollection, branch: &str) -> Result<(PullOutcome, bool)> {
		let meta = self.require_metadata().await?;
		self.fence().await?;
		if meta.changed || self.stores.modified.any().await? {
			return Err(Error::UncommittedChanges);
		}
		remote.require_metadata().await?;

		let local_tree = self.log_tree().await?;
		let remote_tree = remote.log_tree().await?;

		let remote_record = remote
			.stores
			.branches
			.find(branch)
			.await?
			.ok_or_else(|| Error::UnknownBranch(branch.to_owned()))?;
		if remote_record.tip_branch != branch {
			return Ok((PullOutcome::UpToDate, false));
		}
		let remote_tip = VersionId::new(remote_record.tip_n, remote_record.tip_branch);

		let lineage = lineage_rootward(&remote_tree, &remote_tip)?;
		let local_ids = local_tree.entry_ids();
		let missing: Vec<VersionId> = lineage
			.iter()
			.filter(|version| {
				remote_tree
					.node(version)
					.map(|node| !local_ids.contains(&node.entry_id))
					.unwrap_or(true)
			})
			.cloned()
			.collect();
		if missing.is_empty() {
			return Ok((PullOutcome::UpToDate, false));
		}

		if missing.len() == lineage.len() {
			// Nothing shared: adoptable only over a fresh local history.
			if !fresh_history(self, &local_tree).await? {
				return Err(Error::Corrupt("collections have unrelated histories".into()));
			}
			return self
				.pull_fast_forward(remote, branch, &remote_tip, &missing, None, &remote_tree, true)
				.await;
		}

		let fork = remote_tree
			.parent(&missing[0])?
			.cloned()
			.ok_or_else(|| Error::Corrupt("collections have unrelated histories".into()))?;
		let fork_entry_id = remote_tree.node(&fork)?.entry_id;
		let local_fork = local_tree
			.version_by_entry_id(fork_entry_id)
			.cloned()
			.ok_or_else(|| Error::Corrupt("fork version is missing locally".into()))?;

		// Divergence is judged by entry id: a local branch tip that is not
		// the fork itself carries local-only versions.
		let local_tip = self
			.stores
			.branches
			.find(branch)
			.await?
			.filter(|record| record.tip_branch == branch)
			.map(|record| VersionId::new(record.tip_n, record.tip_branch));
		let diverged = match &local_tip {
			None => false,
			Some(tip) => local_tree.node(tip)?.entry_id != fork_entry_id,
		};

		if !diverged {
			return self
				.pull_fast_forward(
					remote,
					branch,
					&remote_tip,
					&missing,
					Some(fork_entry_id),
					&remote_tree,
					false,
				)
				.await;
		}

		let local_tip = local_tip.ok_or_else(|| Error::UnknownBranch(branch.to_owned()))?;
		self.pull_divergent(remote, branch, &meta, local_tip, local_fork, &remote_tip, &missing, fork_entry_id, &remote_tree)
			.await
	}

	#[allow(clippy::too_many_arguments)]
	async fn pull_fast_forward(
		&self,
		remote: &VersionedCollection,
		branch: &str,
		remote_tip: &VersionId,
		missing: &[VersionId],
		fork_entry_id: Option<ObjectId>,
		remote_tree: &LogTree,
		adopt: bool,
	) -> Result<(PullOutcome, bool)> {
		let mut session = self.start_transaction().await?;
		let outcome = async {
			if adopt {
				adopt_history_in(self, &mut session).await?;
			}
			replicate_versions(remote, self, remote_tree, missing, None, fork_entry_id, &mut session)
				.await?;
			let record = BranchRecord {
				name: branch.to_owned(),
				tip_n: remote_tip.n,
				tip_branch: remote_tip.branch.clone(),
			};
			self.stores.branches.upsert(&record, &mut session).await?;
			Ok(())
		}
		.await;
		self.end_transaction(session, outcome).await?;
		self.invalidate_tree();

		self.checkout_locked(VersionSpec { n: Some(remote_tip.n), branch: Some(remote_tip.branch.clone()) })
			.await?;
		info!(branch, versions = missing.len(), tip = %remote_tip, "pulled fast-forward");
		Ok((PullOutcome::FastForwarded(remote_tip.clone()), true))
	}

	#[allow(clippy::too_many_arguments)]
	async fn pull_divergent(
		&self,
		remote: &VersionedCollection,
		branch: &str,
		meta: &crate::store::Metadata,
		local_tip: VersionId,
		fork: VersionId,
		remote_tip: &VersionId,
		missing: &[VersionId],
		fork_entry_id: ObjectId,
		remote_tree: &LogTree,
	) -> Result<(PullOutcome, bool)> {
		// The merge bases itself on the replica, so the engine must sit on
		// the local branch tip.
		let current = self.current_position(meta).await?;
		if current != local_tip {
			self.checkout_locked(VersionSpec { n: Some(local_tip.n), branch: Some(local_tip.branch.clone()) })
				.await?;
		}

		// Stage the remote commits on a synthetic branch rooted at the fork.
		let taken: HashSet<String> =
			self.stores.branches.all().await?.into_iter().map(|record| record.name).collect();
		let mut k = 0u32;
		let rebranch = loop {
			let name = format!("__rebranched_{branch}_{k}");
			if !taken.contains(&name) {
				break name;
			}
			k += 1;
		};
		let rename: HashMap<VersionId, VersionId> = missing
			.iter()
			.map(|version| (version.clone(), VersionId::new(version.n, &rebranch)))
			.collect();
		let rebranch_tip = VersionId::new(remote_tip.n, &rebranch);

		let mut session = self.start_transaction().await?;
		let outcome = async {
			replicate_versions(
				remote,
				self,
				remote_tree,
				missing,
				Some(&rename),
				Some(fork_entry_id),
				&mut session,
			)
			.await?;
			let record = BranchRecord {
				name: rebranch.clone(),
				tip_n: rebranch_tip.n,
				tip_branch: rebranch_tip.branch.clone(),
			};
			self.stores.branches.insert(&record, &mut session).await?;
			Ok(())
		}
		.await;
		self.end_transaction(session, outcome).await?;
		self.invalidate_tree();
		debug!(rebranch = %rebranch, tip = %rebranch_tip, "staged remote commits");

		// Three-way merge, fork as base: dest is the local tip state (the
		// replica), source the rebranch tip state.
		let tree = self.log_tree().await?;
		let dest_path = tree.path(&local_tip, &fork)?;
		let source_path = tree.path(&fork, &rebranch_tip)?;
		let dest_versions: Vec<VersionId> = dest_path.iter().map(|(v, _)| v.clone()).collect();
		let source_versions: Vec<VersionId> = source_path.iter().map(|(v, _)| v.clone()).collect();

		let dest_records = self.stores.deltas.on_versions(&dest_versions).await?;
		let source_records = self.stores.deltas.on_versions(&source_versions).await?;
		let dest_groups: HashMap<DocId, Vec<&DeltaRecord>> =
			group_by_document(&dest_records)?.into_iter().collect();
		let source_groups: HashMap<DocId, Vec<&DeltaRecord>> =
			group_by_document(&source_records)?.into_iter().collect();

		let mut doc_ids: Vec<DocId> = dest_groups.keys().cloned().collect();
		for doc_id in source_groups.keys() {
			if !dest_groups.contains_key(doc_id) {
				doc_ids.push(doc_id.clone());
			}
		}

		let mut merged_writes: Vec<(DocId, Option<Document>)> = Vec::new();
		let mut conflicts: Vec<ConflictRecord> = Vec::new();
		for doc_id in doc_ids {
			let dest_state = self.stores.replica.get(&doc_id).await?;

			let base_state = match dest_groups.get(&doc_id) {
				Some(group) => {
					let partial = PartialDeltaTree::build(group, &tree)?;
					compose_along_path(&partial, &dest_path)?.apply(dest_state.clone())?
				}
				None => dest_state.clone(),
			};
			let source_state = match source_groups.get(&doc_id) {
				Some(group) => {
					let partial = PartialDeltaTree::build(group, &tree)?;
					compose_along_path(&partial, &source_path)?.apply(base_state.clone())?
				}
				None => base_state.clone(),
			};

			let outcome = three_way_merge(base_state.as_ref(), dest_state.as_ref(), source_state.as_ref())?;
			if outcome.conflicts.is_empty() {
				if outcome.merged != dest_state {
					merged_writes.push((doc_id, outcome.merged));
				}
			} else {
				conflicts.push(ConflictRecord {
					document_id: doc_id.value().clone(),
					destination: dest_state,
					source: source_state,
					merged: outcome.merged,
					destination_branch: branch.to_owned(),
					source_branch: rebranch.clone(),
				});
			}
		}

		// Merged documents land in the working collection as ordinary
		// uncommitted changes; the caller registers the merge.
		for (doc_id, merged) in &merged_writes {
			match merged {
				Some(doc) => {
					self.collection().replace_one(doc_id.filter(), doc).upsert(true).await?;
				}
				None => {
					self.collection().delete_one(doc_id.filter()).await?;
				}
			}
		}

		if !conflicts.is_empty() {
			let count = conflicts.len();
			let mut session = self.start_transaction().await?;
			let outcome = async {
				self.stores.conflicts.insert_many(&conflicts, &mut session).await?;
				self.stores.metadata.set_has_conflicts(true, &mut session).await
			}
			.await;
			self.end_transaction(session, outcome).await?;
			info!(branch, conflicts = count, "auto-merge failed");
			return Err(Error::AutoMergeFailed(count));
		}

		info!(branch, merged = merged_writes.len(), source_tip = %rebranch_tip, "pulled with auto-merge");
		Ok((PullOutcome::Merged { source_tip: rebranch_tip }, true))
	}

	/// Hands every conflict to the resolver; each resolution is written to
	/// the collection and its record removed. Documents the resolver
	/// declines stay conflicted. Clears `has_conflicts` when none remain.
	#[instrument(level = "debug", skip(self, resolver))]
	pub async fn resolve_conflicts(&self, resolver: &dyn crate::Resolver) -> Result<ResolveReport> {
		let acquired = self.lock.acquire().await?;
		self.absorb_epoch(acquired.epoch);
		let result = self.resolve_conflicts_locked(resolver).await;
		self.finish(result).await
	}

	async fn resolve_conflicts_locked(&self, resolver: &dyn crate::Resolver) -> Result<(ResolveReport, bool)> {
		self.require_metadata().await?;
		let conflicts = self.stores.conflicts.all().await?;
		if conflicts.is_empty() {
			let mut session = self.start_transaction().await?;
			let outcome = self.stores.metadata.set_has_conflicts(false, &mut session).await;
			self.end_transaction(session, outcome).await?;
			return Ok((ResolveReport { resolved: 0, remaining: 0 }, true));
		}

		let mut resolved = 0usize;
		let mut remaining = 0usize;
		for conflict in &conflicts {
			let resolution = resolver
				.resolve(conflict.destination.as_ref(), conflict.source.as_ref(), conflict.merged.as_ref())
				.await?;
			let Some(document) = resolution else {
				debug!(document_id = %conflict.document_id, "resolution aborted");
				remaining += 1;
				continue;
			};

			let doc_id = DocId::new(conflict.document_id.clone())?;
			let mut session = self.start_transaction().await?;
			let outcome = async {
				self.collection()
					.replace_one(doc_id.filter(), &document)
					.upsert(true)
					.session(&mut session)
					.await?;
				self.stores.conflicts.remove(&conflict.document_id, &mut session).await?;
				Ok(())
			}
			.await;
			self.end_transaction(session, outcome).await?;
			resolved += 1;
		}

		if remaining == 0 {
			let mut session = self.start_transaction().await?;
			let outcome = self.stores.metadata.set_has_conflicts(false, &mut session).await;
			self.end_transaction(session, outcome).await?;
		}
		info!(resolved, remaining, "resolve pass finished");
		Ok((ResolveReport { resolved, remaining }, true))
	}
}

/// Root-first lineage of `tip`: `[root, .., tip]`.
fn lineage_rootward(tree: &LogTree, tip: &VersionId) -> Result<Vec<VersionId>> {
	let mut lineage = vec![tip.clone()];
	lineage.extend(tree.ancestors(tip)?);
	lineage.reverse();
	Ok(lineage)
}

/// True when the collection has no history of its own: only the root
/// version, an empty replica, and nothing pending.
async fn fresh_history(engine: &VersionedCollection, tree: &LogTree) -> Result<bool> {
	Ok(tree.len() == 1
		&& engine.stores.replica.all().await?.is_empty()
		&& !engine.stores.modified.any().await?)
}

/// Drops a fresh history so an unrelated one can be adopted wholesale.
async fn adopt_history_in(engine: &VersionedCollection, session: &mut ClientSession) -> Result<()> {
	engine.stores.log.clear(session).await?;
	engine.stores.branches.clear(session).await?;
	Ok(())
}

/// Locks two collections in locator order, so concurrent syncs over the same
/// pair cannot deadlock.
async fn acquire_pair(a: &VersionedCollection, b: &VersionedCollection) -> Result<()> {
	let (first, second) = if a.locator() <= b.locator() { (a, b) } else { (b, a) };
	let record = first.lock.acquire().await?;
	first.absorb_epoch(record.epoch);
	match second.lock.acquire().await {
		Ok(record) => {
			second.absorb_epoch(record.epoch);
			Ok(())
		}
		Err(err) => {
			let _ = first.lock.release(false).await;
			Err(err)
		}
	}
}

/// Releases both locks. `mutated` carries `(a_mutated, b_mutated)`; `None`
/// (the failure path) releases without advancing either epoch.
async fn release_pair(a: &VersionedCollection, b: &VersionedCollection, mutated: Option<(bool, bool)>) {
	let (a_mutated, b_mutated) = mutated.unwrap_or((false, false));
	let _: Result<()> = a.finish(Ok(((), a_mutated))).await;
	let _: Result<()> = b.finish(Ok(((), b_mutated))).await;
}

/// Copies a contiguous run of versions (root-first, each the parent of the
/// next) from `source` into `dest`, preserving record ids so version
/// identity survives replication. `rename` rewrites the branch name when a
/// divergent pull stages commits on a rebranch; `fork_entry_id` is the
/// shared parent the first copied entry hangs off (`None` when an entire
/// history is being adopted).
async fn replicate_versions(
	source: &VersionedCollection,
	dest: &VersionedCollection,
	source_tree: &LogTree,
	versions: &[VersionId],
	rename: Option<&HashMap<VersionId, VersionId>>,
	fork_entry_id: Option<ObjectId>,
	session: &mut ClientSession,
) -> Result<()> {
	let renamed = |version: &VersionId| -> VersionId {
		rename.and_then(|map| map.get(version).cloned()).unwrap_or_else(|| version.clone())
	};

	let mut copied_entry_ids = HashSet::with_capacity(versions.len());
	for version in versions {
		copied_entry_ids.insert(source_tree.node(version)?.entry_id);
	}

	let mut first = true;
	for version in versions {
		let node = source_tree.node(version)?;
		let dest_version = renamed(version);

		let prev_id = if first {
			first = false;
			fork_entry_id
		} else {
			match &node.parent {
				Some(parent) => Some(source_tree.node(parent)?.entry_id),
				None => None,
			}
		};
		// Children outside the copied run (other branches of the source)
		// are not replicated, so their links are dropped.
		let mut next_ids = Vec::new();
		for child in &node.children {
			let child_id = source_tree.node(child)?.entry_id;
			if copied_entry_ids.contains(&child_id) {
				next_ids.push(child_id);
			}
		}

		let entry = LogEntry {
			id: node.entry_id,
			n: dest_version.n,
			branch: dest_version.branch.clone(),
			timestamp: node.timestamp,
			message: node.message.clone(),
			prev_id,
			next_ids,
		};
		dest.stores.log.insert(&entry, session).await?;
	}
	if let Some(fork_id) = fork_entry_id {
		let first_id = source_tree.node(&versions[0])?.entry_id;
		dest.stores.log.push_next_id(fork_id, first_id, session).await?;
	}

	let records = source.stores.deltas.on_versions(versions).await?;
	let copied_delta_ids: HashSet<ObjectId> = records.iter().map(|record| record.id).collect();
	for record in &records {
		let dest_version = renamed(&record.version());
		let next_ids: Vec<ObjectId> =
			record.next_ids.iter().copied().filter(|id| copied_delta_ids.contains(id)).collect();
		let copy = DeltaRecord {
			id: record.id,
			document_id: record.document_id.clone(),
			version_n: dest_version.n,
			branch: dest_version.branch.clone(),
			timestamp: record.timestamp,
			forward: record.forward.clone(),
			backward: record.backward.clone(),
			prev_id: record.prev_id,
			next_ids,
		};
		dest.stores.deltas.insert_many(std::slice::from_ref(&copy), session).await?;
		if let Some(prev) = record.prev_id {
			if !copied_delta_ids.contains(&prev) {
				// The predecessor lives on the shared lineage; hook the new
				// record into its chain on the destination.
				dest.stores.deltas.push_next_id(prev, record.id, session).await?;
			}
		}
	}
	Ok(())
}
