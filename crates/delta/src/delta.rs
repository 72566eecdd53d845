// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use std::collections::BTreeMap;

use bson::{Bson, Document};

use crate::{Error, Path, Result, path::set_at};

/// One invertible edit: the value that used to live at a path and the value
/// that lives there now. `None` means the slot is absent on that side, so
/// `before: None` is an insertion and `after: None` a removal.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Edit {
	pub before: Option<Bson>,
	pub after: Option<Bson>,
}

/// An invertible structural diff between two states of one document.
///
/// Edits are keyed by [`Path`] and normalized: no edit path is an ancestor of
/// another, and an edit at the root path (whole-document insertion, removal,
/// or replacement) is the only edit in the delta.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentDelta {
	edits: BTreeMap<Path, Edit>,
}

impl DocumentDelta {
	/// The neutral delta: applies as a no-op and is the unit of
	/// [`compose`](Self::compose).
	pub fn identity() -> Self {
		Self::default()
	}

	pub fn is_identity(&self) -> bool {
		self.edits.is_empty()
	}

	/// True when applying this delta materializes a document that did not
	/// exist before.
	pub fn is_insert(&self) -> bool {
		self.edits
			.get(&Path::root())
			.is_some_and(|edit| edit.before.is_none() && edit.after.is_some())
	}

	/// True when applying this delta removes the document.
	pub fn is_delete(&self) -> bool {
		self.edits
			.get(&Path::root())
			.is_some_and(|edit| edit.before.is_some() && edit.after.is_none())
	}

	/// The changed slots as `(path, before, after)`, in path order.
	pub fn changes(&self) -> impl Iterator<Item = (&Path, Option<&Bson>, Option<&Bson>)> {
		self.edits.iter().map(|(path, edit)| (path, edit.before.as_ref(), edit.after.as_ref()))
	}

	/// Structural diff of two document states, where `None` stands for "the
	/// document does not exist".
	///
	/// Subdocuments are descended into; arrays of equal length are diffed
	/// element-wise and any length-changing array edit is recorded as a
	/// whole-value edit of the array slot.
	pub fn diff(a: Option<&Document>, b: Option<&Document>) -> Self {
		let mut edits = BTreeMap::new();
		match (a, b) {
			(None, None) => {}
			(None, Some(b)) => {
				edits.insert(Path::root(), Edit { before: None, after: Some(Bson::Document(b.clone())) });
			}
			(Some(a), None) => {
				edits.insert(Path::root(), Edit { before: Some(Bson::Document(a.clone())), after: None });
			}
			(Some(a), Some(b)) => diff_document(&Path::root(), a, b, &mut edits),
		}
		Self { edits }
	}

	/// Applies the delta to a document state, producing the new state.
	pub fn apply(&self, doc: Option<Document>) -> Result<Option<Document>> {
		if let Some(edit) = self.edits.get(&Path::root()) {
			return match &edit.after {
				None => Ok(None),
				Some(Bson::Document(after)) => Ok(Some(after.clone())),
				Some(_) => Err(Error::apply(&Path::root(), "root slot must hold a document")),
			};
		}
		if self.edits.is_empty() {
			return Ok(doc);
		}

		let doc = doc.ok_or_else(|| Error::apply(&Path::root(), "document does not exist"))?;
		let mut root = Bson::Document(doc);
		for (path, edit) in &self.edits {
			set_at(&mut root, path, path.segments(), edit.after.clone())?;
		}
		match root {
			Bson::Document(doc) => Ok(Some(doc)),
			_ => unreachable!("root slot stays a document"),
		}
	}

	/// The inverse delta: `apply(apply(x, d), d.invert()) == x`.
	pub fn invert(&self) -> Self {
		let edits = self
			.edits
			.iter()
			.map(|(path, edit)| {
				(path.clone(), Edit { before: edit.after.clone(), after: edit.before.clone() })
			})
			.collect();
		Self { edits }
	}

	/// Sequential composition: applying the result is equivalent to applying
	/// `self` and then `second`. Associative, with [`identity`](Self::identity)
	/// as the unit. No-op edits (equal before and after) are pruned, so a
	/// round trip composes back to the identity.
	pub fn compose(&self, second: &DocumentDelta) -> Result<DocumentDelta> {
		let mut edits = self.edits.clone();

		for (path, next) in &second.edits {
			// Same slot edited twice: chain through the intermediate value.
			if let Some(prior) = edits.remove(path) {
				insert_pruned(
					&mut edits,
					path.clone(),
					Edit { before: prior.before, after: next.after.clone() },
				);
				continue;
			}

			// The later delta edits inside a subtree the earlier one already
			// rewrote: fold the new value into the rewritten subtree.
			if let Some(ancestor) = edits.keys().find(|p| p.is_ancestor_of(path)).cloned() {
				let mut prior = edits.remove(&ancestor).expect("key taken from the map");
				let subtree = prior.after.as_mut().ok_or_else(|| {
					Error::compose(path, "edit descends into a slot the earlier delta removed")
				})?;
				set_at(subtree, path, ancestor.relative_to(path), next.after.clone())?;
				insert_pruned(&mut edits, ancestor, prior);
				continue;
			}

			// The later delta supersedes earlier edits below it: rewind its
			// before-image through those edits so invertibility is preserved.
			let covered: Vec<Path> = edits.keys().filter(|p| path.is_ancestor_of(p)).cloned().collect();
			if covered.is_empty() {
				insert_pruned(&mut edits, path.clone(), next.clone());
				continue;
			}
			let mut before = next.before.clone();
			for sub in covered {
				let prior = edits.remove(&sub).expect("key taken from the map");
				let subtree = before.as_mut().ok_or_else(|| {
					Error::compose(&sub, "edit lies below a slot the later delta claims was absent")
				})?;
				set_at(subtree, &sub, path.relative_to(&sub), prior.before)?;
			}
			insert_pruned(&mut edits, path.clone(), Edit { before, after: next.after.clone() });
		}

		Ok(DocumentDelta { edits })
	}

	pub(crate) fn edits(&self) -> &BTreeMap<Path, Edit> {
		&self.edits
	}

	pub(crate) fn from_edits(edits: BTreeMap<Path, Edit>) -> Self {
		Self { edits }
	}
}

fn insert_pruned(edits: &mut BTreeMap<Path, Edit>, path: Path, edit: Edit) {
	if edit.before != edit.after {
		edits.insert(path, edit);
	}
}

fn diff_document(prefix: &Path, a: &Document, b: &Document, edits: &mut BTreeMap<Path, Edit>) {
	for (key, va) in a {
		match b.get(key) {
			Some(vb) => diff_value(prefix.key(key), va, vb, edits),
			None => {
				edits.insert(prefix.key(key), Edit { before: Some(va.clone()), after: None });
			}
		}
	}
	for (key, vb) in b {
		if !a.contains_key(key) {
			edits.insert(prefix.key(key), Edit { before: None, after: Some(vb.clone()) });
		}
	}
}

fn diff_value(path: Path, a: &Bson, b: &Bson, edits: &mut BTreeMap<Path, Edit>) {
	match (a, b) {
		(Bson::Document(da), Bson::Document(db)) => diff_document(&path, da, db, edits),
		(Bson::Array(xa), Bson::Array(xb)) if xa.len() == xb.len() => {
			for (i, (va, vb)) in xa.iter().zip(xb).enumerate() {
				diff_value(path.index(i), va, vb, edits);
			}
		}
		_ if a == b => {}
		_ => {
			edits.insert(path, Edit { before: Some(a.clone()), after: Some(b.clone()) });
		}
	}
}

#[cfg(test)]
mod tests {
	use bson::doc;

	use super::*;

	fn some(doc: Document) -> Option<Document> {
		Some(doc)
	}

	#[test]
	fn diff_and_apply_round_trip() {
		let a = doc! {"name": "A", "n": 1, "nested": {"x": true, "gone": 3}};
		let b = doc! {"name": "A", "n": 2, "nested": {"x": false, "new": "v"}};

		let delta = DocumentDelta::diff(Some(&a), Some(&b));
		assert_eq!(delta.apply(some(a.clone())).unwrap(), some(b.clone()));
		assert_eq!(delta.invert().apply(some(b)).unwrap(), some(a));
	}

	#[test]
	fn diff_of_equal_documents_is_identity() {
		let a = doc! {"k": [1, {"v": 2}]};
		assert!(DocumentDelta::diff(Some(&a), Some(&a)).is_identity());
	}

	#[test]
	fn equal_length_arrays_diff_element_wise() {
		let a = doc! {"xs": [1, 2, 3]};
		let b = doc! {"xs": [1, 9, 3]};
		let delta = DocumentDelta::diff(Some(&a), Some(&b));

		let changes: Vec<_> = delta.changes().collect();
		assert_eq!(changes.len(), 1);
		assert_eq!(changes[0].0.to_string(), "xs.1");
		assert_eq!(delta.apply(some(a)).unwrap(), some(b));
	}

	#[test]
	fn length_changing_arrays_diff_as_whole_values() {
		let a = doc! {"xs": [1, 2]};
		let b = doc! {"xs": [1, 2, 3]};
		let delta = DocumentDelta::diff(Some(&a), Some(&b));

		let changes: Vec<_> = delta.changes().collect();
		assert_eq!(changes.len(), 1);
		assert_eq!(changes[0].0.to_string(), "xs");
		assert_eq!(delta.invert().apply(some(b)).unwrap(), some(a));
	}

	#[test]
	fn insert_and_delete_round_trip() {
		let d = doc! {"_id": 7, "v": "fresh"};

		let insert = DocumentDelta::diff(None, Some(&d));
		assert!(insert.is_insert());
		assert_eq!(insert.apply(None).unwrap(), some(d.clone()));

		let delete = insert.invert();
		assert!(delete.is_delete());
		assert_eq!(delete.apply(some(d)).unwrap(), None);
	}

	#[test]
	fn identity_is_the_compose_unit() {
		let a = doc! {"n": 1};
		let b = doc! {"n": 2};
		let delta = DocumentDelta::diff(Some(&a), Some(&b));

		assert_eq!(DocumentDelta::identity().compose(&delta).unwrap(), delta);
		assert_eq!(delta.compose(&DocumentDelta::identity()).unwrap(), delta);
	}

	#[test]
	fn compose_chains_successive_diffs() {
		let a = doc! {"n": 1, "s": "x"};
		let b = doc! {"n": 2, "s": "x"};
		let c = doc! {"n": 2, "s": "y", "extra": true};

		let ab = DocumentDelta::diff(Some(&a), Some(&b));
		let bc = DocumentDelta::diff(Some(&b), Some(&c));
		let ac = ab.compose(&bc).unwrap();

		assert_eq!(ac, DocumentDelta::diff(Some(&a), Some(&c)));
		assert_eq!(ac.invert().apply(some(c)).unwrap(), some(a));
	}

	#[test]
	fn compose_prunes_a_round_trip_to_identity() {
		let a = doc! {"n": 1};
		let b = doc! {"n": 2};

		let ab = DocumentDelta::diff(Some(&a), Some(&b));
		assert!(ab.compose(&ab.invert()).unwrap().is_identity());
	}

	#[test]
	fn compose_folds_deeper_edits_into_a_rewritten_subtree() {
		let a = doc! {"sub": 5};
		let b = doc! {"sub": {"y": 2}};
		let c = doc! {"sub": {"y": 3}};

		// a -> b replaces the `sub` slot wholesale, b -> c edits inside it.
		let ab = DocumentDelta::diff(Some(&a), Some(&b));
		let bc = DocumentDelta::diff(Some(&b), Some(&c));
		let ac = ab.compose(&bc).unwrap();

		assert_eq!(ac, DocumentDelta::diff(Some(&a), Some(&c)));
		assert_eq!(ac.apply(some(a.clone())).unwrap(), some(c.clone()));
		assert_eq!(ac.invert().apply(some(c)).unwrap(), some(a));
	}

	#[test]
	fn compose_rewinds_through_superseded_edits() {
		let a = doc! {"sub": {"x": 1}, "n": 0};
		let b = doc! {"sub": {"x": 2}, "n": 0};
		// The second step replaces the whole subdocument that the first step
		// edited inside of.
		let c = doc! {"sub": "flat", "n": 0};

		let ab = DocumentDelta::diff(Some(&a), Some(&b));
		let bc = DocumentDelta::diff(Some(&b), Some(&c));
		let ac = ab.compose(&bc).unwrap();

		assert_eq!(ac, DocumentDelta::diff(Some(&a), Some(&c)));
		assert_eq!(ac.invert().apply(some(c)).unwrap(), some(a));
	}

	#[test]
	fn compose_is_associative() {
		let s0 = doc! {"a": {"x": 1}, "n": 0};
		let s1 = doc! {"a": {"x": 2}, "n": 0};
		let s2 = doc! {"a": "gone", "n": 1};
		let s3 = doc! {"a": {"x": 9}, "n": 1};

		let d1 = DocumentDelta::diff(Some(&s0), Some(&s1));
		let d2 = DocumentDelta::diff(Some(&s1), Some(&s2));
		let d3 = DocumentDelta::diff(Some(&s2), Some(&s3));

		let left = d1.compose(&d2).unwrap().compose(&d3).unwrap();
		let right = d1.compose(&d2.compose(&d3).unwrap()).unwrap();
		assert_eq!(left, right);
		assert_eq!(left.apply(some(s0)).unwrap(), some(s3));
	}

	#[test]
	fn compose_through_delete_and_reinsert() {
		let a = doc! {"v": 1};
		let b = doc! {"v": 2};

		let delete = DocumentDelta::diff(Some(&a), None);
		let insert = DocumentDelta::diff(None, Some(&b));
		let net = delete.compose(&insert).unwrap();

		assert_eq!(net.apply(some(a.clone())).unwrap(), some(b.clone()));
		assert_eq!(net.invert().apply(some(b)).unwrap(), some(a));
	}
}
