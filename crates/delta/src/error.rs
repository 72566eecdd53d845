// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("delta does not apply at `{path}`: {reason}")]
	Apply { path: String, reason: String },

	#[error("deltas do not compose at `{path}`: {reason}")]
	Compose { path: String, reason: String },

	#[error("failed to encode delta: {0}")]
	Encode(String),

	#[error("malformed delta encoding: {0}")]
	Decode(String),

	#[error("unsupported delta schema version {0}")]
	UnsupportedSchema(i32),
}

impl Error {
	pub(crate) fn apply(path: &crate::Path, reason: impl Into<String>) -> Self {
		Self::Apply { path: path.to_string(), reason: reason.into() }
	}

	pub(crate) fn compose(path: &crate::Path, reason: impl Into<String>) -> Self {
		Self::Compose { path: path.to_string(), reason: reason.into() }
	}
}
