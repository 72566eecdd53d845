// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use bson::{Bson, Document};

use crate::{DocumentDelta, Error, Path, Result, path::set_at};

/// The result of a three-way merge of one document.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeOutcome {
	/// The merged state. At conflicted paths it carries the destination
	/// value.
	pub merged: Option<Document>,
	/// Source-side paths whose edits clashed with destination edits. Empty
	/// means the merge is clean.
	pub conflicts: Vec<Path>,
}

impl MergeOutcome {
	pub fn is_clean(&self) -> bool {
		self.conflicts.is_empty()
	}
}

/// Merges two descendants of a common base state.
///
/// A slot edited on exactly one side takes that side's value. A slot edited
/// on both sides keeps the destination value; if the two sides disagree the
/// slot is reported as a conflict. Edits at overlapping paths (one inside
/// the other, including whole-document edits) count as touching the same
/// slot.
pub fn three_way_merge(
	base: Option<&Document>,
	dest: Option<&Document>,
	source: Option<&Document>,
) -> Result<MergeOutcome> {
	let dest_delta = DocumentDelta::diff(base, dest);
	let source_delta = DocumentDelta::diff(base, source);

	let mut merged = dest.cloned();
	let mut conflicts = Vec::new();

	for (path, edit) in source_delta.edits() {
		let overlapping: Vec<_> = dest_delta
			.edits()
			.iter()
			.filter(|(dest_path, _)| {
				*dest_path == path || dest_path.is_ancestor_of(path) || path.is_ancestor_of(dest_path)
			})
			.collect();

		if overlapping.is_empty() {
			write_edit(&mut merged, path, edit.after.clone())?;
			continue;
		}

		let agreed = overlapping
			.iter()
			.all(|(dest_path, dest_edit)| *dest_path == path && dest_edit.after == edit.after);
		if !agreed {
			conflicts.push(path.clone());
		}
	}

	Ok(MergeOutcome { merged, conflicts })
}

fn write_edit(merged: &mut Option<Document>, path: &Path, value: Option<Bson>) -> Result<()> {
	if path.is_root() {
		*merged = match value {
			None => None,
			Some(Bson::Document(doc)) => Some(doc),
			Some(_) => return Err(Error::apply(path, "root slot must hold a document")),
		};
		return Ok(());
	}

	let doc = merged.as_mut().ok_or_else(|| Error::apply(path, "document does not exist"))?;
	let mut root = Bson::Document(std::mem::take(doc));
	set_at(&mut root, path, path.segments(), value)?;
	match root {
		Bson::Document(new) => *doc = new,
		_ => unreachable!("root slot stays a document"),
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use bson::doc;

	use super::*;

	#[test]
	fn one_sided_edits_merge_cleanly() {
		let base = doc! {"a": 1, "b": 1};
		let dest = doc! {"a": 2, "b": 1};
		let source = doc! {"a": 1, "b": 3};

		let outcome = three_way_merge(Some(&base), Some(&dest), Some(&source)).unwrap();
		assert!(outcome.is_clean());
		assert_eq!(outcome.merged, Some(doc! {"a": 2, "b": 3}));
	}

	#[test]
	fn agreeing_edits_do_not_conflict() {
		let base = doc! {"a": 1};
		let both = doc! {"a": 5};

		let outcome = three_way_merge(Some(&base), Some(&both), Some(&both)).unwrap();
		assert!(outcome.is_clean());
		assert_eq!(outcome.merged, Some(both));
	}

	#[test]
	fn disagreeing_edits_conflict_and_keep_dest() {
		let base = doc! {"a": 1, "b": 0};
		let dest = doc! {"a": 2, "b": 0};
		let source = doc! {"a": 3, "b": 9};

		let outcome = three_way_merge(Some(&base), Some(&dest), Some(&source)).unwrap();
		assert_eq!(outcome.conflicts.len(), 1);
		assert_eq!(outcome.conflicts[0].to_string(), "a");
		// Dest wins at the conflicted slot, the clean source edit lands.
		assert_eq!(outcome.merged, Some(doc! {"a": 2, "b": 9}));
	}

	#[test]
	fn nested_edit_conflicts_with_enclosing_replacement() {
		let base = doc! {"sub": {"x": 1}};
		let dest = doc! {"sub": "flat"};
		let source = doc! {"sub": {"x": 2}};

		let outcome = three_way_merge(Some(&base), Some(&dest), Some(&source)).unwrap();
		assert_eq!(outcome.conflicts.len(), 1);
		assert_eq!(outcome.merged, Some(dest));
	}

	#[test]
	fn source_deletion_against_dest_edit_conflicts() {
		let base = doc! {"a": 1};
		let dest = doc! {"a": 2};

		let outcome = three_way_merge(Some(&base), Some(&dest), None).unwrap();
		assert_eq!(outcome.conflicts.len(), 1);
		assert!(outcome.conflicts[0].is_root());
		assert_eq!(outcome.merged, Some(dest));
	}

	#[test]
	fn source_addition_lands_untouched_dest() {
		let base = doc! {"a": 1};
		let dest = doc! {"a": 1};
		let source = doc! {"a": 1, "new": {"deep": true}};

		let outcome = three_way_merge(Some(&base), Some(&dest), Some(&source)).unwrap();
		assert!(outcome.is_clean());
		assert_eq!(outcome.merged, Some(source));
	}
}
