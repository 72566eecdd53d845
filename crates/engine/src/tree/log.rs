// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use bson::{DateTime, oid::ObjectId};

use crate::{Error, Result, store::LogEntry};

/// A version identity: `(n, branch)`. `n = -1` marks a branch that was
/// created but has no registered version yet; such a position never appears
/// as a log tree node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionId {
	pub n: i64,
	pub branch: String,
}

impl VersionId {
	pub fn new(n: i64, branch: impl AsRef<str>) -> Self {
		Self { n, branch: branch.as_ref().to_owned() }
	}

	/// The root of every log tree.
	pub fn root() -> Self {
		Self::new(0, "main")
	}
}

impl Display for VersionId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "({}, {})", self.n, self.branch)
	}
}

/// Which side of a delta to apply while moving along a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
	Forward,
	Backward,
}

impl Direction {
	pub fn inverted(self) -> Self {
		match self {
			Direction::Forward => Direction::Backward,
			Direction::Backward => Direction::Forward,
		}
	}
}

#[derive(Clone, Debug)]
pub struct LogNode {
	pub entry_id: ObjectId,
	pub parent: Option<VersionId>,
	pub children: Vec<VersionId>,
	/// Depth from the root; precomputed on load, maintained on mutation.
	pub level: usize,
	pub timestamp: DateTime,
	pub message: String,
}

/// The tree of registered versions, rebuilt from the `log` store. Children
/// are ordered by timestamp, then branch name, so traversal order is
/// deterministic.
#[derive(Clone, Debug)]
pub struct LogTree {
	nodes: HashMap<VersionId, LogNode>,
	root: VersionId,
}

impl LogTree {
	pub fn from_entries(entries: &[LogEntry]) -> Result<Self> {
		let by_id: HashMap<ObjectId, &LogEntry> =
			entries.iter().map(|entry| (entry.id, entry)).collect();

		let mut nodes = HashMap::with_capacity(entries.len());
		let mut root = None;

		for entry in entries {
			let version = VersionId::new(entry.n, &entry.branch);
			let parent = match entry.prev_id {
				Some(prev_id) => {
					let parent = by_id.get(&prev_id).ok_or_else(|| {
						Error::Corrupt(format!("log entry {version} points at a missing parent"))
					})?;
					Some(VersionId::new(parent.n, &parent.branch))
				}
				None => {
					if root.replace(version.clone()).is_some() {
						return Err(Error::Corrupt("log has more than one root".into()));
					}
					None
				}
			};
			let node = LogNode {
				entry_id: entry.id,
				parent,
				children: Vec::new(),
				level: 0,
				timestamp: entry.timestamp,
				message: entry.message.clone(),
			};
			if nodes.insert(version.clone(), node).is_some() {
				return Err(Error::Corrupt(format!("duplicate log entry for {version}")));
			}
		}

		let root = root.ok_or_else(|| Error::Corrupt("log has no root".into()))?;

		// Wire up and order children, then index levels root-down.
		let links: Vec<(VersionId, VersionId)> = nodes
			.iter()
			.filter_map(|(version, node)| node.parent.clone().map(|parent| (parent, version.clone())))
			.collect();
		for (parent, child) in links {
			nodes
				.get_mut(&parent)
				.ok_or_else(|| Error::Corrupt(format!("missing parent node {parent}")))?
				.children
				.push(child);
		}
		let mut tree = Self { nodes, root };
		tree.sort_children();
		tree.index_levels()?;
		Ok(tree)
	}

	fn sort_children(&mut self) {
		let order: HashMap<VersionId, (DateTime, String)> = self
			.nodes
			.iter()
			.map(|(version, node)| (version.clone(), (node.timestamp, version.branch.clone())))
			.collect();
		for node in self.nodes.values_mut() {
			node.children.sort_by_key(|child| order[child].clone());
		}
	}

	fn index_levels(&mut self) -> Result<()> {
		let mut stack = vec![(self.root.clone(), 0usize)];
		let mut visited = 0usize;
		while let Some((version, level)) = stack.pop() {
			visited += 1;
			let node = self
				.nodes
				.get_mut(&version)
				.ok_or_else(|| Error::Corrupt(format!("missing node {version}")))?;
			node.level = level;
			for child in node.children.clone() {
				stack.push((child, level + 1));
			}
		}
		if visited != self.nodes.len() {
			return Err(Error::Corrupt("log tree is not connected".into()));
		}
		Ok(())
	}

	pub fn root(&self) -> &VersionId {
		&self.root
	}

	pub fn contains(&self, version: &VersionId) -> bool {
		self.nodes.contains_key(version)
	}

	pub fn node(&self, version: &VersionId) -> Result<&LogNode> {
		self.nodes
			.get(version)
			.ok_or_else(|| Error::InvalidVersion { n: version.n, branch: version.branch.clone() })
	}

	pub fn parent(&self, version: &VersionId) -> Result<Option<&VersionId>> {
		Ok(self.node(version)?.parent.as_ref())
	}

	pub fn children(&self, version: &VersionId) -> Result<&[VersionId]> {
		Ok(&self.node(version)?.children)
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	/// Versions in deterministic preorder from the root, for display.
	pub fn preorder(&self) -> Vec<VersionId> {
		let mut out = Vec::with_capacity(self.nodes.len());
		let mut stack = vec![self.root.clone()];
		while let Some(version) = stack.pop() {
			if let Some(node) = self.nodes.get(&version) {
				for child in node.children.iter().rev() {
					stack.push(child.clone());
				}
			}
			out.push(version);
		}
		out
	}

	/// Lowest common ancestor: walk the deeper node up to the shallower
	/// node's level, then walk both up in lockstep. O(depth).
	pub fn lca(&self, u: &VersionId, v: &VersionId) -> Result<VersionId> {
		let mut a = u.clone();
		let mut b = v.clone();
		let mut level_a = self.node(&a)?.level;
		let mut level_b = self.node(&b)?.level;

		while level_a > level_b {
			a = self.step_up(&a)?;
			level_a -= 1;
		}
		while level_b > level_a {
			b = self.step_up(&b)?;
			level_b -= 1;
		}
		while a != b {
			a = self.step_up(&a)?;
			b = self.step_up(&b)?;
		}
		Ok(a)
	}

	fn step_up(&self, version: &VersionId) -> Result<VersionId> {
		self.node(version)?
			.parent
			.clone()
			.ok_or_else(|| Error::Corrupt(format!("walked past the root at {version}")))
	}

	/// The ordered version path from `u` to `v`: `Backward` entries while
	/// ascending towards the common ancestor (starting with `u` itself),
	/// `Forward` entries while descending from it (ending with `v`). The
	/// common ancestor appears on neither side, and `path(u, u)` is empty.
	pub fn path(&self, u: &VersionId, v: &VersionId) -> Result<Vec<(VersionId, Direction)>> {
		let meet = self.lca(u, v)?;

		let mut ascending = Vec::new();
		let mut cursor = u.clone();
		while cursor != meet {
			ascending.push((cursor.clone(), Direction::Backward));
			cursor = self.step_up(&cursor)?;
		}

		let mut descending = Vec::new();
		let mut cursor = v.clone();
		while cursor != meet {
			descending.push((cursor.clone(), Direction::Forward));
			cursor = self.step_up(&cursor)?;
		}
		descending.reverse();

		ascending.extend(descending);
		Ok(ascending)
	}

	/// All strict ancestors of `version`, nearest first, root last.
	pub fn ancestors(&self, version: &VersionId) -> Result<Vec<VersionId>> {
		let mut out = Vec::new();
		let mut cursor = version.clone();
		while let Some(parent) = self.node(&cursor)?.parent.clone() {
			out.push(parent.clone());
			cursor = parent;
		}
		Ok(out)
	}

	/// All strict descendants of `version`, in preorder.
	pub fn descendants(&self, version: &VersionId) -> Result<Vec<VersionId>> {
		let mut out = Vec::new();
		let mut stack = self.node(version)?.children.to_vec();
		while let Some(next) = stack.pop() {
			stack.extend(self.node(&next)?.children.iter().cloned());
			out.push(next);
		}
		Ok(out)
	}

	/// Looks a version up by its log entry id. Entry ids are preserved by
	/// push/pull replication, so they identify versions across collections
	/// where `(n, branch)` alone cannot tell divergent histories apart.
	pub fn version_by_entry_id(&self, entry_id: ObjectId) -> Option<&VersionId> {
		self.nodes
			.iter()
			.find(|(_, node)| node.entry_id == entry_id)
			.map(|(version, _)| version)
	}

	pub fn entry_ids(&self) -> std::collections::HashSet<ObjectId> {
		self.nodes.values().map(|node| node.entry_id).collect()
	}

	pub fn is_ancestor_or_equal(&self, ancestor: &VersionId, descendant: &VersionId) -> Result<bool> {
		let target_level = self.node(ancestor)?.level;
		let mut cursor = descendant.clone();
		let mut level = self.node(&cursor)?.level;
		while level > target_level {
			cursor = self.step_up(&cursor)?;
			level -= 1;
		}
		Ok(cursor == *ancestor)
	}

	/// Extends the tree with a freshly registered version.
	pub fn insert_child(&mut self, parent: &VersionId, entry: &LogEntry) -> Result<()> {
		let version = VersionId::new(entry.n, &entry.branch);
		let parent_level = self.node(parent)?.level;

		let node = LogNode {
			entry_id: entry.id,
			parent: Some(parent.clone()),
			children: Vec::new(),
			level: parent_level + 1,
			timestamp: entry.timestamp,
			message: entry.message.clone(),
		};
		if self.nodes.insert(version.clone(), node).is_some() {
			return Err(Error::Corrupt(format!("version {version} registered twice")));
		}
		// New registrations carry the latest timestamp, so order is kept by
		// appending.
		self.nodes
			.get_mut(parent)
			.ok_or_else(|| Error::Corrupt(format!("missing parent node {parent}")))?
			.children
			.push(version);
		Ok(())
	}

	/// Removes `version` and its whole subtree, returning the removed
	/// versions (the subtree root first).
	pub fn remove_subtree(&mut self, version: &VersionId) -> Result<Vec<VersionId>> {
		if *version == self.root {
			return Err(Error::Corrupt("cannot remove the log root".into()));
		}
		let mut removed = vec![version.clone()];
		removed.extend(self.descendants(version)?);

		if let Some(parent) = self.node(version)?.parent.clone() {
			if let Some(parent_node) = self.nodes.get_mut(&parent) {
				parent_node.children.retain(|child| child != version);
			}
		}
		for version in &removed {
			self.nodes.remove(version);
		}
		Ok(removed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(id_byte: u8, n: i64, branch: &str, prev: Option<u8>, millis: i64) -> LogEntry {
		LogEntry {
			id: oid(id_byte),
			n,
			branch: branch.to_owned(),
			timestamp: DateTime::from_millis(millis),
			message: format!("{n}_{branch}"),
			prev_id: prev.map(oid),
			next_ids: Vec::new(),
		}
	}

	fn oid(byte: u8) -> ObjectId {
		ObjectId::from_bytes([byte; 12])
	}

	fn v(n: i64, branch: &str) -> VersionId {
		VersionId::new(n, branch)
	}

	/// root(0,main) -> (1,main) -> (2,main)
	///                     \-> (1,b) -> (2,b)
	fn sample_tree() -> LogTree {
		let entries = vec![
			entry(0, 0, "main", None, 0),
			entry(1, 1, "main", Some(0), 10),
			entry(2, 2, "main", Some(1), 20),
			entry(3, 1, "b", Some(1), 30),
			entry(4, 2, "b", Some(3), 40),
		];
		LogTree::from_entries(&entries).unwrap()
	}

	#[test]
	fn levels_are_depths_from_root() {
		let tree = sample_tree();
		assert_eq!(tree.node(&v(0, "main")).unwrap().level, 0);
		assert_eq!(tree.node(&v(1, "main")).unwrap().level, 1);
		assert_eq!(tree.node(&v(2, "main")).unwrap().level, 2);
		assert_eq!(tree.node(&v(2, "b")).unwrap().level, 3);
	}

	#[test]
	fn lca_of_cousins_is_the_fork_point() {
		let tree = sample_tree();
		assert_eq!(tree.lca(&v(2, "main"), &v(2, "b")).unwrap(), v(1, "main"));
		assert_eq!(tree.lca(&v(2, "main"), &v(1, "main")).unwrap(), v(1, "main"));
		assert_eq!(tree.lca(&v(0, "main"), &v(2, "b")).unwrap(), v(0, "main"));
		assert_eq!(tree.lca(&v(2, "b"), &v(2, "b")).unwrap(), v(2, "b"));
	}

	#[test]
	fn path_to_self_is_empty() {
		let tree = sample_tree();
		assert!(tree.path(&v(2, "b"), &v(2, "b")).unwrap().is_empty());
	}

	#[test]
	fn path_to_an_ancestor_is_all_backward() {
		let tree = sample_tree();
		let path = tree.path(&v(2, "b"), &v(1, "main")).unwrap();
		assert_eq!(
			path,
			vec![(v(2, "b"), Direction::Backward), (v(1, "b"), Direction::Backward)],
		);
	}

	#[test]
	fn path_to_a_descendant_is_all_forward() {
		let tree = sample_tree();
		let path = tree.path(&v(0, "main"), &v(2, "b")).unwrap();
		assert_eq!(
			path,
			vec![
				(v(1, "main"), Direction::Forward),
				(v(1, "b"), Direction::Forward),
				(v(2, "b"), Direction::Forward),
			],
		);
	}

	#[test]
	fn path_across_a_fork_ascends_then_descends() {
		let tree = sample_tree();
		let path = tree.path(&v(2, "main"), &v(1, "b")).unwrap();
		assert_eq!(
			path,
			vec![(v(2, "main"), Direction::Backward), (v(1, "b"), Direction::Forward)],
		);
	}

	#[test]
	fn paths_reverse_with_inverted_directions() {
		let tree = sample_tree();
		for (u, w) in [
			(v(2, "main"), v(2, "b")),
			(v(0, "main"), v(2, "b")),
			(v(1, "b"), v(1, "main")),
			(v(2, "main"), v(0, "main")),
		] {
			let forward = tree.path(&u, &w).unwrap();
			let mut reversed: Vec<_> = tree
				.path(&w, &u)
				.unwrap()
				.into_iter()
				.map(|(version, direction)| (version, direction.inverted()))
				.collect();
			reversed.reverse();
			assert_eq!(forward, reversed);
		}
	}

	#[test]
	fn sibling_order_breaks_ties_by_timestamp_then_branch() {
		let entries = vec![
			entry(0, 0, "main", None, 0),
			entry(1, 1, "zeta", Some(0), 10),
			entry(2, 1, "alpha", Some(0), 10),
			entry(3, 1, "main", Some(0), 5),
		];
		let tree = LogTree::from_entries(&entries).unwrap();
		assert_eq!(
			tree.children(&v(0, "main")).unwrap(),
			&[v(1, "main"), v(1, "alpha"), v(1, "zeta")],
		);
	}

	#[test]
	fn descendants_and_ancestors() {
		let tree = sample_tree();
		let mut succ = tree.descendants(&v(1, "main")).unwrap();
		succ.sort();
		assert_eq!(succ, vec![v(1, "b"), v(2, "b"), v(2, "main")]);

		assert_eq!(tree.ancestors(&v(2, "b")).unwrap(), vec![v(1, "b"), v(1, "main"), v(0, "main")]);
	}

	#[test]
	fn insert_child_extends_levels() {
		let mut tree = sample_tree();
		let new = entry(9, 3, "b", Some(4), 50);
		tree.insert_child(&v(2, "b"), &new).unwrap();
		assert_eq!(tree.node(&v(3, "b")).unwrap().level, 4);
		assert_eq!(tree.children(&v(2, "b")).unwrap(), &[v(3, "b")]);
	}

	#[test]
	fn remove_subtree_detaches_and_returns_the_whole_subtree() {
		let mut tree = sample_tree();
		let mut removed = tree.remove_subtree(&v(1, "b")).unwrap();
		removed.sort();
		assert_eq!(removed, vec![v(1, "b"), v(2, "b")]);
		assert!(!tree.contains(&v(2, "b")));
		assert_eq!(tree.children(&v(1, "main")).unwrap(), &[v(2, "main")]);
	}

	#[test]
	fn two_roots_are_rejected() {
		let entries = vec![entry(0, 0, "main", None, 0), entry(1, 0, "other", None, 1)];
		assert!(matches!(LogTree::from_entries(&entries), Err(Error::Corrupt(_))));
	}

	#[test]
	fn unknown_version_is_an_invalid_version() {
		let tree = sample_tree();
		assert!(matches!(
			tree.path(&v(7, "main"), &v(0, "main")),
			Err(Error::InvalidVersion { .. })
		));
	}
}
