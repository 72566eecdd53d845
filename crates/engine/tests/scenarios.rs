// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

//! End-to-end scenarios against a live MongoDB deployment.
//!
//! Change streams and multi-document transactions need a replica set, so
//! these tests only run when `VC_TEST_MONGODB_URI` points at one (e.g.
//! `mongodb://localhost:27017/?replicaSet=rs0&directConnection=true`).
//! Without it every test returns early and reports nothing.

use bson::{Document, doc, oid::ObjectId};
use futures_util::future::BoxFuture;
use mongodb::{Client, Collection};
use mongovc_engine::{
	CollectionLocator, EngineConfig, Error, InitOutcome, PullOutcome, PushOutcome, RegisterOutcome,
	Resolver, Result, VersionId, VersionSpec, VersionedCollection,
};

const ENV_URI: &str = "VC_TEST_MONGODB_URI";

struct Fixture {
	client: Client,
	db_name: String,
	engine: VersionedCollection,
}

impl Fixture {
	async fn open(tag: &str) -> Result<Option<Fixture>> {
		let Ok(uri) = std::env::var(ENV_URI) else {
			eprintln!("skipping: {ENV_URI} not set");
			return Ok(None);
		};
		let client = Client::with_uri_str(&uri).await?;
		let db_name = format!("vc_test_{tag}_{}", ObjectId::new().to_hex());
		client.database(&db_name).drop().await?;
		let locator = CollectionLocator::new("local", &db_name, "albums");
		let engine = VersionedCollection::open(client.clone(), locator, EngineConfig::default()).await?;
		Ok(Some(Fixture { client, db_name, engine }))
	}

	fn collection(&self) -> Collection<Document> {
		self.client.database(&self.db_name).collection("albums")
	}

	async fn finish(self) -> Result<()> {
		self.engine.close().await?;
		self.client.database(&self.db_name).drop().await?;
		Ok(())
	}
}

fn version(n: i64, branch: &str) -> VersionId {
	VersionId::new(n, branch)
}

fn at(n: i64) -> VersionSpec {
	VersionSpec { n: Some(n), branch: None }
}

fn at_branch(n: i64, branch: &str) -> VersionSpec {
	VersionSpec { n: Some(n), branch: Some(branch.to_owned()) }
}

#[tokio::test]
async fn basic_register() -> Result<()> {
	let Some(fx) = Fixture::open("basic").await? else {
		return Ok(());
	};
	assert_eq!(fx.engine.init("genesis").await?, InitOutcome::Initialized);
	assert_eq!(fx.engine.init("again").await?, InitOutcome::AlreadyInitialized);

	fx.collection().insert_one(doc! {"_id": 1, "name": "A"}).await?;
	let outcome = fx.engine.register("v1", None).await?;
	assert_eq!(outcome, RegisterOutcome::Registered(version(1, "main")));

	let status = fx.engine.status().await?;
	assert_eq!((status.current_n, status.current_branch.as_str()), (1, "main"));
	assert!(!status.changed, "trackers must be drained after register");
	assert!(!status.detached);

	assert_eq!(fx.engine.log().await?.len(), 2, "root plus one registered version");
	assert!(fx.engine.diff(None).await?.is_empty(), "replica must equal the collection");
	fx.finish().await
}

#[tokio::test]
async fn round_trip_checkout() -> Result<()> {
	let Some(fx) = Fixture::open("roundtrip").await? else {
		return Ok(());
	};
	fx.engine.init("genesis").await?;

	fx.collection().insert_one(doc! {"_id": 1, "name": "A"}).await?;
	fx.engine.register("v1", None).await?;
	fx.collection()
		.update_one(doc! {"_id": 1}, doc! {"$set": {"x": 1}})
		.await?;
	fx.engine.register("v2", None).await?;

	fx.engine.checkout(at(0)).await?;
	assert_eq!(fx.collection().find_one(doc! {"_id": 1}).await?, None);
	assert!(fx.engine.status().await?.detached);

	fx.engine.checkout(at(2)).await?;
	assert_eq!(
		fx.collection().find_one(doc! {"_id": 1}).await?,
		Some(doc! {"_id": 1, "name": "A", "x": 1}),
	);
	assert!(!fx.engine.status().await?.detached);
	fx.finish().await
}

#[tokio::test]
async fn uncommitted_changes_block_checkout() -> Result<()> {
	let Some(fx) = Fixture::open("uncommitted").await? else {
		return Ok(());
	};
	fx.engine.init("genesis").await?;
	fx.collection().insert_one(doc! {"_id": 1}).await?;
	fx.engine.register("v1", None).await?;

	fx.collection().insert_one(doc! {"_id": 2}).await?;
	assert!(matches!(fx.engine.checkout(at(0)).await, Err(Error::UncommittedChanges)));

	fx.engine.discard_changes().await?;
	assert_eq!(fx.collection().find_one(doc! {"_id": 2}).await?, None);
	fx.engine.checkout(at(0)).await?;
	fx.finish().await
}

#[tokio::test]
async fn branch_with_disconnected_delta_trees() -> Result<()> {
	let Some(fx) = Fixture::open("fork").await? else {
		return Ok(());
	};
	fx.engine.init("genesis").await?;

	fx.collection().insert_one(doc! {"_id": "a"}).await?;
	fx.engine.register("v1", None).await?;
	fx.collection().insert_one(doc! {"_id": 3, "who": "main"}).await?;
	fx.engine.register("v2", None).await?;

	fx.engine.checkout(at(1)).await?;
	assert_eq!(fx.collection().find_one(doc! {"_id": 3}).await?, None);

	fx.engine.create_branch("b").await?;
	// The same document id comes into being independently on this branch.
	fx.collection().insert_one(doc! {"_id": 3, "who": "b"}).await?;
	let outcome = fx.engine.register("1_b", None).await?;
	assert_eq!(outcome, RegisterOutcome::Registered(version(1, "b")));

	// Crossing the fork must pass through the synthetic identity delta at
	// (1, main) and swap one incarnation for the other.
	fx.engine.checkout(at_branch(2, "main")).await?;
	assert_eq!(
		fx.collection().find_one(doc! {"_id": 3}).await?,
		Some(doc! {"_id": 3, "who": "main"}),
	);
	fx.engine.checkout(at_branch(1, "b")).await?;
	assert_eq!(
		fx.collection().find_one(doc! {"_id": 3}).await?,
		Some(doc! {"_id": 3, "who": "b"}),
	);
	fx.finish().await
}

#[tokio::test]
async fn push_pull_fast_forward() -> Result<()> {
	let Some(local) = Fixture::open("pushlocal").await? else {
		return Ok(());
	};
	let Some(remote) = Fixture::open("pushremote").await? else {
		return Ok(());
	};
	local.engine.init("genesis").await?;
	remote.engine.init("genesis").await?;

	local.collection().insert_one(doc! {"_id": 1, "v": 1}).await?;
	local.engine.register("v1", None).await?;
	local.collection().insert_one(doc! {"_id": 2, "v": 2}).await?;
	local.engine.register("v2", None).await?;

	let outcome = local.engine.push(&remote.engine, Some("main")).await?;
	assert!(matches!(outcome, PushOutcome::Pushed { tip, .. } if tip == version(2, "main")));

	let local_log: Vec<(i64, String)> =
		local.engine.log().await?.into_iter().map(|e| (e.n, e.branch)).collect();
	let remote_log: Vec<(i64, String)> =
		remote.engine.log().await?.into_iter().map(|e| (e.n, e.branch)).collect();
	assert_eq!(local_log, remote_log);
	assert_eq!(
		remote.collection().find_one(doc! {"_id": 2}).await?,
		Some(doc! {"_id": 2, "v": 2}),
		"push must refresh a remote parked on the branch",
	);

	// Pushing again is a no-op.
	assert_eq!(local.engine.push(&remote.engine, Some("main")).await?, PushOutcome::UpToDate);

	remote.collection().insert_one(doc! {"_id": 3, "v": 3}).await?;
	remote.engine.register("v3", None).await?;

	let outcome = local.engine.pull(&remote.engine, Some("main")).await?;
	assert_eq!(outcome, PullOutcome::FastForwarded(version(3, "main")));
	let status = local.engine.status().await?;
	assert_eq!((status.current_n, status.current_branch.as_str()), (3, "main"));
	assert_eq!(
		local.collection().find_one(doc! {"_id": 3}).await?,
		Some(doc! {"_id": 3, "v": 3}),
	);

	local.finish().await?;
	remote.finish().await
}

/// Resolves every conflict to a fixed document.
struct FixedResolution(Document);

impl Resolver for FixedResolution {
	fn resolve<'a>(
		&'a self,
		_destination: Option<&'a Document>,
		_source: Option<&'a Document>,
		_merged: Option<&'a Document>,
	) -> BoxFuture<'a, Result<Option<Document>>> {
		Box::pin(async move { Ok(Some(self.0.clone())) })
	}
}

#[tokio::test]
async fn conflicting_pull_and_resolution() -> Result<()> {
	let Some(local) = Fixture::open("pulllocal").await? else {
		return Ok(());
	};
	let Some(remote) = Fixture::open("pullremote").await? else {
		return Ok(());
	};
	local.engine.init("genesis").await?;
	remote.engine.init("genesis").await?;

	local.collection().insert_one(doc! {"_id": 1, "x": "base", "y": 0}).await?;
	local.engine.register("v1", None).await?;
	local.engine.push(&remote.engine, Some("main")).await?;

	// Both sides edit the same field from the shared base.
	local.collection().update_one(doc! {"_id": 1}, doc! {"$set": {"x": "left"}}).await?;
	local.engine.register("v2 local", None).await?;
	remote.collection().update_one(doc! {"_id": 1}, doc! {"$set": {"x": "right"}}).await?;
	remote.engine.register("v2 remote", None).await?;

	let result = local.engine.pull(&remote.engine, Some("main")).await;
	assert!(matches!(result, Err(Error::AutoMergeFailed(1))));

	let conflicts = local.engine.conflicts().await?;
	assert_eq!(conflicts.len(), 1);
	let conflict = &conflicts[0];
	assert_eq!(
		conflict.merged.as_ref().and_then(|m| m.get("x")),
		conflict.destination.as_ref().and_then(|d| d.get("x")),
		"the auto-merged document carries the destination value at the conflicted field",
	);
	assert!(local.engine.status().await?.has_conflicts);

	let resolution = doc! {"_id": 1, "x": "settled", "y": 0};
	let report = local.engine.resolve_conflicts(&FixedResolution(resolution.clone())).await?;
	assert_eq!((report.resolved, report.remaining), (1, 0));
	assert!(!local.engine.status().await?.has_conflicts);

	local.engine.register("merge", None).await?;
	assert_eq!(local.collection().find_one(doc! {"_id": 1}).await?, Some(resolution));

	local.finish().await?;
	remote.finish().await
}

#[tokio::test]
async fn listener_fence_catches_a_burst() -> Result<()> {
	let Some(fx) = Fixture::open("fence").await? else {
		return Ok(());
	};
	fx.engine.init("genesis").await?;

	let docs: Vec<Document> = (0..1000).map(|i| doc! {"_id": i as i64}).collect();
	fx.collection().insert_many(docs).await?;
	// Register immediately; the fence must force every insert into this one
	// version.
	let outcome = fx.engine.register("bulk", None).await?;
	assert_eq!(outcome, RegisterOutcome::Registered(version(1, "main")));
	assert!(!fx.engine.status().await?.changed, "no tracker may survive the register");

	fx.engine.checkout(at(0)).await?;
	assert_eq!(fx.collection().count_documents(doc! {}).await?, 0);
	fx.engine.checkout(at(1)).await?;
	assert_eq!(fx.collection().count_documents(doc! {}).await?, 1000);
	fx.finish().await
}

#[tokio::test]
async fn stash_round_trip() -> Result<()> {
	let Some(fx) = Fixture::open("stash").await? else {
		return Ok(());
	};
	fx.engine.init("genesis").await?;
	fx.collection().insert_one(doc! {"_id": 1, "v": "registered"}).await?;
	fx.engine.register("v1", None).await?;

	fx.collection().update_one(doc! {"_id": 1}, doc! {"$set": {"v": "dirty"}}).await?;
	assert!(fx.engine.stash().await?);
	assert_eq!(
		fx.collection().find_one(doc! {"_id": 1}).await?,
		Some(doc! {"_id": 1, "v": "registered"}),
		"stash must restore the registered state",
	);
	assert!(fx.engine.status().await?.has_stash);

	// The collection is clean again, so moving around works.
	fx.engine.checkout(at(0)).await?;
	fx.engine.checkout(at(1)).await?;

	assert!(fx.engine.stash_apply().await?);
	assert_eq!(
		fx.collection().find_one(doc! {"_id": 1}).await?,
		Some(doc! {"_id": 1, "v": "dirty"}),
	);
	assert!(!fx.engine.status().await?.has_stash);
	fx.finish().await
}
