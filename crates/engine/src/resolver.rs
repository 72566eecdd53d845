// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

//! The external conflict resolver seam.
//!
//! `resolve_conflicts` hands each conflicted document to a [`Resolver`] and
//! writes whatever it returns. The bundled [`MergeTool`] shells out to a
//! configured three-way merge program; tests plug in an in-process resolver
//! instead.

use std::path::Path;

use bson::{Bson, Document};
use futures_util::future::BoxFuture;
use tracing::debug;

use crate::{Error, Result};

/// Resolves one conflicted document. `destination` and `source` are the two
/// sides, `merged` the auto-merge result carrying the destination value at
/// conflicted fields. Returning `None` leaves the conflict standing.
pub trait Resolver: Send + Sync {
	fn resolve<'a>(
		&'a self,
		destination: Option<&'a Document>,
		source: Option<&'a Document>,
		merged: Option<&'a Document>,
	) -> BoxFuture<'a, Result<Option<Document>>>;
}

/// Invokes an external merge program with three files — `destination`,
/// `merged`, `source` — serialized as relaxed extended JSON. When the
/// program exits zero, the `merged` file is read back as the resolution;
/// a non-zero exit or an unreadable file aborts this document's resolution
/// without advancing.
pub struct MergeTool {
	program: String,
	args: Vec<String>,
}

impl MergeTool {
	pub fn new(program: impl Into<String>) -> Self {
		Self { program: program.into(), args: Vec::new() }
	}

	pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
		self.args.extend(args);
		self
	}

	async fn run(
		&self,
		destination: Option<&Document>,
		source: Option<&Document>,
		merged: Option<&Document>,
	) -> Result<Option<Document>> {
		let dir = std::env::temp_dir().join(format!("vc-merge-{}", uuid::Uuid::new_v4()));
		std::fs::create_dir_all(&dir).map_err(|err| Error::Resolver(err.to_string()))?;

		let destination_path = dir.join("destination.json");
		let merged_path = dir.join("merged.json");
		let source_path = dir.join("source.json");
		write_side(&destination_path, destination)?;
		write_side(&merged_path, merged)?;
		write_side(&source_path, source)?;

		let status = tokio::process::Command::new(&self.program)
			.args(&self.args)
			.arg(&destination_path)
			.arg(&merged_path)
			.arg(&source_path)
			.status()
			.await
			.map_err(|err| Error::Resolver(format!("launching `{}`: {err}", self.program)))?;

		let resolution = if status.success() {
			read_side(&merged_path)?
		} else {
			debug!(program = %self.program, ?status, "merge tool declined the resolution");
			None
		};

		let _ = std::fs::remove_dir_all(&dir);
		Ok(resolution)
	}
}

impl Resolver for MergeTool {
	fn resolve<'a>(
		&'a self,
		destination: Option<&'a Document>,
		source: Option<&'a Document>,
		merged: Option<&'a Document>,
	) -> BoxFuture<'a, Result<Option<Document>>> {
		Box::pin(self.run(destination, source, merged))
	}
}

fn write_side(path: &Path, side: Option<&Document>) -> Result<()> {
	let json = match side {
		Some(doc) => {
			let value = Bson::Document(doc.clone()).into_relaxed_extjson();
			serde_json::to_string_pretty(&value).map_err(|err| Error::Resolver(err.to_string()))?
		}
		None => "null".to_owned(),
	};
	std::fs::write(path, json).map_err(|err| Error::Resolver(err.to_string()))
}

fn read_side(path: &Path) -> Result<Option<Document>> {
	let json = match std::fs::read_to_string(path) {
		Ok(json) => json,
		Err(err) => {
			debug!(%err, "merge tool left no readable result");
			return Ok(None);
		}
	};
	let value: serde_json::Value =
		serde_json::from_str(&json).map_err(|err| Error::Resolver(format!("merge result: {err}")))?;
	if value.is_null() {
		return Ok(None);
	}
	match Bson::try_from(value).map_err(|err| Error::Resolver(format!("merge result: {err}")))? {
		Bson::Document(doc) => Ok(Some(doc)),
		other => Err(Error::Resolver(format!("merge result is not a document: {other}"))),
	}
}

#[cfg(test)]
mod tests {
	use bson::doc;

	use super::*;

	#[tokio::test]
	async fn accepting_tool_returns_the_merged_file() {
		// `true` exits zero without touching the files, so the auto-merged
		// document comes back unchanged.
		let tool = MergeTool::new("true");
		let merged = doc! {"_id": 1, "v": "merged"};
		let resolved = tool
			.resolve(Some(&doc! {"_id": 1, "v": "dest"}), Some(&doc! {"_id": 1, "v": "src"}), Some(&merged))
			.await
			.unwrap();
		assert_eq!(resolved, Some(merged));
	}

	#[tokio::test]
	async fn declining_tool_aborts_the_resolution() {
		let tool = MergeTool::new("false");
		let resolved = tool
			.resolve(Some(&doc! {"_id": 1}), Some(&doc! {"_id": 1}), Some(&doc! {"_id": 1}))
			.await
			.unwrap();
		assert_eq!(resolved, None);
	}

	#[tokio::test]
	async fn missing_program_is_a_resolver_error() {
		let tool = MergeTool::new("/nonexistent/merge-tool");
		let result = tool.resolve(None, None, Some(&doc! {"_id": 1})).await;
		assert!(matches!(result, Err(Error::Resolver(_))));
	}
}
