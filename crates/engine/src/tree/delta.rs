// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use std::collections::HashMap;

use bson::oid::ObjectId;
use mongovc_delta::DocumentDelta;

use crate::{
	Error, Result,
	store::DeltaRecord,
	tree::{Direction, LogTree, VersionId},
};

/// One node of a document's partial delta tree. Synthetic nodes carry the
/// identity delta and exist only to join subtrees that were disconnected in
/// storage (the document was inserted independently on several branches).
#[derive(Clone, Debug)]
pub struct DeltaNode {
	pub version: VersionId,
	pub forward: DocumentDelta,
	pub backward: DocumentDelta,
	pub parent: Option<VersionId>,
	pub children: Vec<VersionId>,
	pub synthetic: bool,
}

/// The partial delta tree of one document, restricted to the versions of a
/// checkout path and joined into a single tree.
#[derive(Clone, Debug, Default)]
pub struct PartialDeltaTree {
	nodes: HashMap<VersionId, DeltaNode>,
}

impl PartialDeltaTree {
	/// Builds the tree from one document's delta records fetched along a
	/// path. Records whose predecessor lies outside the fetched set start a
	/// component; components are then joined greedily, deepest common
	/// ancestor first, under synthetic identity deltas.
	pub fn build(records: &[&DeltaRecord], log: &LogTree) -> Result<Self> {
		let fetched: HashMap<ObjectId, VersionId> =
			records.iter().map(|record| (record.id, record.version())).collect();

		let mut nodes: HashMap<VersionId, DeltaNode> = HashMap::with_capacity(records.len());
		for record in records {
			let version = record.version();
			let parent = record.prev_id.and_then(|prev| fetched.get(&prev).cloned());
			let node = DeltaNode {
				version: version.clone(),
				forward: record.decode_forward()?,
				backward: record.decode_backward()?,
				parent,
				children: Vec::new(),
				synthetic: false,
			};
			if nodes.insert(version.clone(), node).is_some() {
				return Err(Error::Corrupt(format!(
					"document has two deltas at version {version}"
				)));
			}
		}

		let links: Vec<(VersionId, VersionId)> = nodes
			.iter()
			.filter_map(|(version, node)| node.parent.clone().map(|parent| (parent, version.clone())))
			.collect();
		for (parent, child) in links {
			match nodes.get_mut(&parent) {
				Some(parent_node) => parent_node.children.push(child),
				None => {
					// Predecessor delta lies off the fetched path; the child
					// stays a component root.
					if let Some(node) = nodes.get_mut(&child) {
						node.parent = None;
					}
				}
			}
		}

		let mut tree = Self { nodes };
		tree.join_components(log)?;
		Ok(tree)
	}

	fn roots(&self) -> Vec<VersionId> {
		self.nodes
			.values()
			.filter(|node| node.parent.is_none())
			.map(|node| node.version.clone())
			.collect()
	}

	fn component_root(&self, version: &VersionId) -> VersionId {
		let mut cursor = version.clone();
		while let Some(parent) = self.nodes.get(&cursor).and_then(|node| node.parent.clone()) {
			cursor = parent;
		}
		cursor
	}

	/// Greedily pairs the two component roots with the deepest common
	/// ancestor in the log tree and joins them there, repeating until a
	/// single tree remains.
	fn join_components(&mut self, log: &LogTree) -> Result<()> {
		loop {
			let roots = self.roots();
			if roots.len() <= 1 {
				return Ok(());
			}

			let mut best: Option<(usize, VersionId, VersionId, VersionId)> = None;
			for i in 0..roots.len() {
				for j in (i + 1)..roots.len() {
					let meet = log.lca(&roots[i], &roots[j])?;
					let level = log.node(&meet)?.level;
					if best.as_ref().is_none_or(|(deepest, ..)| level > *deepest) {
						best = Some((level, roots[i].clone(), roots[j].clone(), meet));
					}
				}
			}
			let (_, r1, r2, meet) =
				best.ok_or_else(|| Error::Corrupt("no joinable delta components".into()))?;

			if meet == r1 || meet == r2 {
				// One root is an ancestor of the other; link directly.
				let (parent, child) = if meet == r1 { (r1, r2) } else { (r2, r1) };
				self.attach(&parent, &child);
			} else if self.nodes.contains_key(&meet) {
				// The meet point already belongs to one component; adopt the
				// other one there.
				let inside = self.component_root(&meet);
				let orphan = if inside == r1 { r2 } else { r1 };
				self.attach(&meet, &orphan);
			} else {
				// Join both under a synthetic identity delta at the meet
				// point.
				let node = DeltaNode {
					version: meet.clone(),
					forward: DocumentDelta::identity(),
					backward: DocumentDelta::identity(),
					parent: None,
					children: Vec::new(),
					synthetic: true,
				};
				self.nodes.insert(meet.clone(), node);
				self.attach(&meet, &r1);
				self.attach(&meet, &r2);
			}
		}
	}

	fn attach(&mut self, parent: &VersionId, child: &VersionId) {
		if let Some(node) = self.nodes.get_mut(child) {
			node.parent = Some(parent.clone());
		}
		if let Some(node) = self.nodes.get_mut(parent) {
			node.children.push(child.clone());
		}
	}

	pub fn node(&self, version: &VersionId) -> Option<&DeltaNode> {
		self.nodes.get(version)
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}
}

/// Composes a document's net delta along a path: at each position that holds
/// a delta for the document, the direction picks the forward or backward
/// side; positions without a delta leave the document untouched.
pub fn compose_along_path(
	tree: &PartialDeltaTree,
	path: &[(VersionId, Direction)],
) -> Result<DocumentDelta> {
	let mut net = DocumentDelta::identity();
	for (version, direction) in path {
		let Some(node) = tree.node(version) else {
			continue;
		};
		let step = match direction {
			Direction::Forward => &node.forward,
			Direction::Backward => &node.backward,
		};
		net = net.compose(step)?;
	}
	Ok(net)
}

#[cfg(test)]
mod tests {
	use bson::{DateTime, Document, doc};
	use mongovc_delta::encode;

	use super::*;
	use crate::store::{LogEntry, delta_binary};

	fn oid(byte: u8) -> ObjectId {
		ObjectId::from_bytes([byte; 12])
	}

	fn v(n: i64, branch: &str) -> VersionId {
		VersionId::new(n, branch)
	}

	fn log_entry(id_byte: u8, n: i64, branch: &str, prev: Option<u8>, millis: i64) -> LogEntry {
		LogEntry {
			id: oid(id_byte),
			n,
			branch: branch.to_owned(),
			timestamp: DateTime::from_millis(millis),
			message: String::new(),
			prev_id: prev.map(oid),
			next_ids: Vec::new(),
		}
	}

	fn delta_record(
		id_byte: u8,
		version: VersionId,
		prev: Option<u8>,
		before: Option<&Document>,
		after: Option<&Document>,
	) -> DeltaRecord {
		let forward = DocumentDelta::diff(before, after);
		DeltaRecord {
			id: oid(id_byte),
			document_id: bson::Bson::Int64(3),
			version_n: version.n,
			branch: version.branch,
			timestamp: DateTime::from_millis(0),
			forward: delta_binary(encode(&forward).unwrap()),
			backward: delta_binary(encode(&forward.invert()).unwrap()),
			prev_id: prev.map(oid),
			next_ids: Vec::new(),
		}
	}

	/// root(0,main) -> (1,main) -> (2,main)
	///                     \-> (1,b)
	fn forked_log() -> LogTree {
		let entries = vec![
			log_entry(0, 0, "main", None, 0),
			log_entry(1, 1, "main", Some(0), 10),
			log_entry(2, 2, "main", Some(1), 20),
			log_entry(3, 1, "b", Some(1), 30),
		];
		LogTree::from_entries(&entries).unwrap()
	}

	#[test]
	fn connected_chain_composes_along_a_path() {
		let log = forked_log();
		let d0 = doc! {"_id": 3, "v": 0};
		let d1 = doc! {"_id": 3, "v": 1};

		// Insert at (1, main), update at (2, main).
		let r1 = delta_record(10, v(1, "main"), None, None, Some(&d0));
		let r2 = delta_record(11, v(2, "main"), Some(10), Some(&d0), Some(&d1));
		let tree = PartialDeltaTree::build(&[&r1, &r2], &log).unwrap();
		assert!(tree.node(&v(2, "main")).unwrap().parent == Some(v(1, "main")));

		let path = log.path(&v(0, "main"), &v(2, "main")).unwrap();
		let net = compose_along_path(&tree, &path).unwrap();
		assert_eq!(net.apply(None).unwrap(), Some(d1));
	}

	#[test]
	fn round_trip_composes_to_identity() {
		let log = forked_log();
		let d0 = doc! {"_id": 3, "v": 0};
		let d1 = doc! {"_id": 3, "v": 1};

		let r1 = delta_record(10, v(1, "main"), None, None, Some(&d0));
		let r2 = delta_record(11, v(2, "main"), Some(10), Some(&d0), Some(&d1));
		let tree = PartialDeltaTree::build(&[&r1, &r2], &log).unwrap();

		let mut there = log.path(&v(0, "main"), &v(2, "main")).unwrap();
		let back = log.path(&v(2, "main"), &v(0, "main")).unwrap();
		there.extend(back);
		let net = compose_along_path(&tree, &there).unwrap();
		assert!(net.is_identity());
	}

	#[test]
	fn disconnected_subtrees_join_under_an_identity_delta_at_the_fork() {
		let log = forked_log();
		let d3 = doc! {"_id": 3, "who": "main"};
		let d3_prime = doc! {"_id": 3, "who": "b"};

		// The document was inserted independently on both branches.
		let on_main = delta_record(10, v(2, "main"), None, None, Some(&d3));
		let on_b = delta_record(11, v(1, "b"), None, None, Some(&d3_prime));
		let tree = PartialDeltaTree::build(&[&on_main, &on_b], &log).unwrap();

		let joint = tree.node(&v(1, "main")).expect("synthetic node at the fork");
		assert!(joint.synthetic);
		assert!(joint.forward.is_identity());
		assert_eq!(tree.node(&v(2, "main")).unwrap().parent, Some(v(1, "main")));
		assert_eq!(tree.node(&v(1, "b")).unwrap().parent, Some(v(1, "main")));

		// Crossing the fork removes one incarnation and materializes the
		// other.
		let path = log.path(&v(2, "main"), &v(1, "b")).unwrap();
		let net = compose_along_path(&tree, &path).unwrap();
		assert_eq!(net.apply(Some(d3)).unwrap(), Some(d3_prime));
	}

	#[test]
	fn ancestor_root_adopts_the_other_component_directly() {
		let log = forked_log();
		let d0 = doc! {"_id": 3, "v": 0};
		let d1 = doc! {"_id": 3, "v": 1};

		// Chain broken in the middle: the (2, main) record's predecessor is
		// not in the fetched set, so it starts its own component whose join
		// point is the other root itself.
		let r1 = delta_record(10, v(1, "main"), None, None, Some(&d0));
		let r2 = delta_record(11, v(2, "main"), Some(99), Some(&d0), Some(&d1));
		let tree = PartialDeltaTree::build(&[&r1, &r2], &log).unwrap();

		assert_eq!(tree.node(&v(2, "main")).unwrap().parent, Some(v(1, "main")));
		assert!(!tree.node(&v(1, "main")).unwrap().synthetic);
	}

	#[test]
	fn positions_without_deltas_are_skipped() {
		let log = forked_log();
		let d0 = doc! {"_id": 3, "v": 0};

		let r1 = delta_record(10, v(1, "main"), None, None, Some(&d0));
		let tree = PartialDeltaTree::build(&[&r1], &log).unwrap();

		// (2, main) has no delta for this document.
		let path = log.path(&v(0, "main"), &v(2, "main")).unwrap();
		let net = compose_along_path(&tree, &path).unwrap();
		assert_eq!(net.apply(None).unwrap(), Some(d0));
	}
}
