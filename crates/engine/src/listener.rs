// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

//! The background consumer of the tracked collection's change stream.
//!
//! The listener turns change events into `modified` trackers and persists
//! the stream's resume token on the metadata singleton after every event.
//! Operations synchronize with it through the fence protocol: they insert a
//! sentinel document under a reserved id prefix and wait until the listener
//! has observed it, which proves every earlier event has been drained.

use std::sync::{Arc, Mutex};

use bson::{Bson, Document, doc};
use futures_util::StreamExt;
use mongodb::{
	Collection,
	change_stream::{
		ChangeStream,
		event::{ChangeStreamEvent, OperationType, ResumeToken},
	},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, trace, warn};

use crate::{
	EngineConfig, Result,
	store::{MetadataStore, ModifiedStore, TrackedOp},
};

/// Reserved id prefix of fence sentinel documents. Ids under this prefix
/// never appear in versions, replicas, or trackers.
pub const FENCE_PREFIX: &str = "__vc.fence.";

pub(crate) fn fence_marker_id() -> String {
	format!("{FENCE_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Filter matching only user documents (everything but fence sentinels).
pub(crate) fn user_docs_filter() -> Document {
	// The regex only ever matches string ids; any other id type passes.
	doc! {"_id": {"$not": {"$regex": "^__vc\\.fence\\."}}}
}

pub(crate) struct ChangeListener {
	shutdown_tx: watch::Sender<bool>,
	fence_tx: watch::Sender<Option<String>>,
	status: Arc<Mutex<Option<String>>>,
	task: JoinHandle<()>,
}

impl ChangeListener {
	pub fn spawn(
		collection: Collection<Document>,
		metadata: MetadataStore,
		modified: ModifiedStore,
		config: EngineConfig,
	) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (fence_tx, _) = watch::channel(None);
		let status = Arc::new(Mutex::new(None));

		let task = tokio::spawn(run(
			collection,
			metadata,
			modified,
			config,
			shutdown_rx,
			fence_tx.clone(),
			Arc::clone(&status),
		));

		Self { shutdown_tx, fence_tx, status, task }
	}

	/// A receiver of fence sentinel ids as the listener observes them.
	pub fn subscribe_fence(&self) -> watch::Receiver<Option<String>> {
		self.fence_tx.subscribe()
	}

	/// The fatal error the listener died with, if any. Read by the next
	/// fence attempt.
	pub fn fatal(&self) -> Option<String> {
		self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
	}

	/// Flips the shutdown flag and waits for the task to drain. The resume
	/// token is already persisted per event, so shutdown loses nothing.
	pub async fn shutdown(self) {
		let _ = self.shutdown_tx.send(true);
		let _ = self.task.await;
	}
}

async fn run(
	collection: Collection<Document>,
	metadata: MetadataStore,
	modified: ModifiedStore,
	config: EngineConfig,
	mut shutdown_rx: watch::Receiver<bool>,
	fence_tx: watch::Sender<Option<String>>,
	status: Arc<Mutex<Option<String>>>,
) {
	let mut attempts = 0u32;
	let mut backoff = config.listener_retry_backoff;

	let fatal = 'outer: loop {
		let token = match metadata.resume_token().await {
			Ok(token) => token,
			Err(err) => break 'outer Some(format!("loading resume token: {err}")),
		};
		let mut stream = match open_stream(&collection, token).await {
			Ok(stream) => stream,
			Err(err) => {
				attempts += 1;
				if attempts > config.listener_retry_limit {
					break 'outer Some(format!("opening change stream: {err}"));
				}
				warn!(%err, attempts, "change stream failed to open, retrying");
				tokio::time::sleep(backoff).await;
				backoff *= 2;
				continue;
			}
		};
		attempts = 0;
		backoff = config.listener_retry_backoff;
		debug!("change stream open");

		loop {
			tokio::select! {
				_ = shutdown_rx.changed() => {
					break 'outer None;
				}
				event = stream.next() => match event {
					None => continue 'outer,
					Some(Err(err)) => {
						warn!(%err, "change stream error, reopening");
						tokio::time::sleep(backoff).await;
						continue 'outer;
					}
					Some(Ok(event)) => {
						if let Err(err) = handle_event(event, &metadata, &modified, &fence_tx).await {
							// Store writes are transient database errors;
							// the event will not be redelivered, so give the
							// fence a chance to surface it.
							break 'outer Some(format!("recording change: {err}"));
						}
						if let Some(token) = stream.resume_token() {
							if let Err(err) = metadata.save_resume_token(&token).await {
								warn!(%err, "failed to persist resume token");
							}
						}
					}
				}
			}
		}
	};

	if let Some(message) = fatal {
		warn!(%message, "change listener stopped");
		*status.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message);
	}
}

async fn open_stream(
	collection: &Collection<Document>,
	token: Option<ResumeToken>,
) -> Result<ChangeStream<ChangeStreamEvent<Document>>> {
	let action = collection.watch();
	let stream = match token {
		Some(token) => action.resume_after(token).await?,
		None => action.await?,
	};
	Ok(stream)
}

async fn handle_event(
	event: ChangeStreamEvent<Document>,
	metadata: &MetadataStore,
	modified: &ModifiedStore,
	fence_tx: &watch::Sender<Option<String>>,
) -> Result<()> {
	let op = match event.operation_type {
		OperationType::Insert => TrackedOp::Insert,
		OperationType::Update | OperationType::Replace => TrackedOp::Update,
		OperationType::Delete => TrackedOp::Delete,
		// Collection-level events carry no document to track.
		_ => return Ok(()),
	};
	let Some(id) = event.document_key.as_ref().and_then(|key| key.get("_id")) else {
		return Ok(());
	};

	if let Bson::String(id) = id {
		if id.starts_with(FENCE_PREFIX) {
			// The sentinel's insert proves everything written before it has
			// been drained; its deletion is just cleanup.
			if op == TrackedOp::Insert {
				trace!(marker = %id, "fence sentinel observed");
				let _ = fence_tx.send(Some(id.clone()));
			}
			return Ok(());
		}
	}

	let remains = modified.record(id, op).await?;
	let changed = if remains { true } else { modified.any().await? };
	metadata.set_changed_hint(changed).await?;
	trace!(document_id = %id, op = op.as_str(), "tracked change");
	Ok(())
}
