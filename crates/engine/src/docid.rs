// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use bson::{Bson, Document, doc};

use crate::{Error, Result};

/// A document identity: the `_id` value of a tracked document, usable as a
/// map key. BSON values are not hashable directly, so the id keeps its own
/// canonical byte encoding alongside the raw value.
#[derive(Clone, Debug)]
pub struct DocId {
	value: Bson,
	key: Vec<u8>,
}

impl DocId {
	pub fn new(value: Bson) -> Result<Self> {
		let wrapper = doc! {"_id": value.clone()};
		let mut key = Vec::new();
		wrapper
			.to_writer(&mut key)
			.map_err(|err| Error::InvalidDocumentId(err.to_string()))?;
		Ok(Self { value, key })
	}

	pub fn value(&self) -> &Bson {
		&self.value
	}

	/// The query filter selecting this document.
	pub fn filter(&self) -> Document {
		doc! {"_id": self.value.clone()}
	}
}

impl PartialEq for DocId {
	fn eq(&self, other: &Self) -> bool {
		self.key == other.key
	}
}

impl Eq for DocId {}

impl Hash for DocId {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.key.hash(state);
	}
}

impl Display for DocId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Display::fmt(&self.value, f)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use bson::oid::ObjectId;

	use super::*;

	#[test]
	fn equal_values_are_equal_keys() {
		let a = DocId::new(Bson::Int64(7)).unwrap();
		let b = DocId::new(Bson::Int64(7)).unwrap();
		assert_eq!(a, b);

		let mut map = HashMap::new();
		map.insert(a, "x");
		assert_eq!(map.get(&b), Some(&"x"));
	}

	#[test]
	fn distinct_types_are_distinct_keys() {
		let int32 = DocId::new(Bson::Int32(7)).unwrap();
		let int64 = DocId::new(Bson::Int64(7)).unwrap();
		assert_ne!(int32, int64);
	}

	#[test]
	fn object_ids_round_trip_through_filters() {
		let oid = ObjectId::new();
		let id = DocId::new(Bson::ObjectId(oid)).unwrap();
		assert_eq!(id.filter(), doc! {"_id": oid});
	}
}
