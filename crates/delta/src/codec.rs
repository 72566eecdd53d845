// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

//! The persisted form of a delta: a BSON document
//! `{v: <schema tag>, edits: [{p: [..], b?: .., a?: ..}]}` serialized to
//! bytes. `b`/`a` are the before/after values and are absent (not null) when
//! the slot does not exist on that side. The schema tag guards against
//! format drift between engine versions.

use std::collections::BTreeMap;

use bson::{Bson, Document, doc};

use crate::{DocumentDelta, Error, Path, Result, Segment, delta::Edit};

const SCHEMA_VERSION: i32 = 1;

/// Serializes a delta into its stable binary form.
pub fn encode(delta: &DocumentDelta) -> Result<Vec<u8>> {
	let edits: Vec<Bson> = delta
		.edits()
		.iter()
		.map(|(path, edit)| {
			let mut entry = doc! {"p": encode_path(path)};
			if let Some(before) = &edit.before {
				entry.insert("b", before.clone());
			}
			if let Some(after) = &edit.after {
				entry.insert("a", after.clone());
			}
			Bson::Document(entry)
		})
		.collect();

	let envelope = doc! {"v": SCHEMA_VERSION, "edits": edits};
	let mut bytes = Vec::new();
	envelope.to_writer(&mut bytes).map_err(|err| Error::Encode(err.to_string()))?;
	Ok(bytes)
}

/// Deserializes a delta previously produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<DocumentDelta> {
	let envelope = Document::from_reader(bytes).map_err(|err| Error::Decode(err.to_string()))?;

	let version = envelope.get_i32("v").map_err(|_| Error::Decode("missing schema tag".into()))?;
	if version != SCHEMA_VERSION {
		return Err(Error::UnsupportedSchema(version));
	}

	let entries = envelope.get_array("edits").map_err(|_| Error::Decode("missing edit list".into()))?;

	let mut edits = BTreeMap::new();
	for entry in entries {
		let entry = match entry {
			Bson::Document(entry) => entry,
			other => return Err(Error::Decode(format!("edit entry is not a document: {other}"))),
		};
		let segments = entry.get_array("p").map_err(|_| Error::Decode("edit entry without a path".into()))?;
		let path = decode_path(segments)?;
		let edit = Edit { before: entry.get("b").cloned(), after: entry.get("a").cloned() };
		edits.insert(path, edit);
	}
	Ok(DocumentDelta::from_edits(edits))
}

fn encode_path(path: &Path) -> Vec<Bson> {
	path.segments()
		.iter()
		.map(|segment| match segment {
			Segment::Key(key) => Bson::String(key.clone()),
			Segment::Index(index) => Bson::Int64(*index as i64),
		})
		.collect()
}

fn decode_path(segments: &[Bson]) -> Result<Path> {
	segments
		.iter()
		.map(|segment| match segment {
			Bson::String(key) => Ok(Segment::Key(key.clone())),
			Bson::Int64(index) if *index >= 0 => Ok(Segment::Index(*index as usize)),
			Bson::Int32(index) if *index >= 0 => Ok(Segment::Index(*index as usize)),
			other => Err(Error::Decode(format!("invalid path segment: {other}"))),
		})
		.collect::<Result<Vec<_>>>()
		.map(Path::from)
}

#[cfg(test)]
mod tests {
	use bson::doc;

	use super::*;

	#[test]
	fn encode_decode_round_trip() {
		let a = doc! {"name": "A", "nested": {"x": [1, 2]}, "gone": true};
		let b = doc! {"name": "B", "nested": {"x": [1, 5]}, "fresh": Bson::Null};

		let delta = DocumentDelta::diff(Some(&a), Some(&b));
		let decoded = decode(&encode(&delta).unwrap()).unwrap();
		assert_eq!(decoded, delta);
	}

	#[test]
	fn null_values_survive_the_round_trip() {
		let a = doc! {"v": 1};
		let b = doc! {"v": Bson::Null};

		let delta = DocumentDelta::diff(Some(&a), Some(&b));
		let decoded = decode(&encode(&delta).unwrap()).unwrap();
		assert_eq!(decoded, delta);
		assert_eq!(decoded.apply(Some(a)).unwrap(), Some(b));
	}

	#[test]
	fn whole_document_deltas_round_trip() {
		let d = doc! {"_id": 1, "v": "x"};
		let insert = DocumentDelta::diff(None, Some(&d));

		let decoded = decode(&encode(&insert).unwrap()).unwrap();
		assert!(decoded.is_insert());
		assert_eq!(decoded.apply(None).unwrap(), Some(d));
	}

	#[test]
	fn identity_round_trips_to_identity() {
		let decoded = decode(&encode(&DocumentDelta::identity()).unwrap()).unwrap();
		assert!(decoded.is_identity());
	}

	#[test]
	fn unknown_schema_tag_is_rejected() {
		let envelope = doc! {"v": 99, "edits": []};
		let mut bytes = Vec::new();
		envelope.to_writer(&mut bytes).unwrap();

		assert!(matches!(decode(&bytes), Err(Error::UnsupportedSchema(99))));
	}
}
