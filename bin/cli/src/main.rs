// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

mod config;
mod output;

use clap::{Parser, Subcommand};
use config::{Connection, Profile, RemoteProfile};
use mongovc_engine::{
	EngineConfig, InitOutcome, MergeTool, PullOutcome, PushOutcome, RegisterOutcome, VersionSpec,
	VersionedCollection,
};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "vc")]
#[command(about = "Git-like version control for MongoDB collections", long_about = None)]
#[command(version)]
struct Cli {
	/// Connection string; overrides the profile
	#[arg(long, global = true, env = "VC_MONGO_URI")]
	uri: Option<String>,

	/// Database holding the tracked collection
	#[arg(long, global = true)]
	database: Option<String>,

	/// The tracked collection
	#[arg(long, global = true)]
	collection: Option<String>,

	/// Username; overrides profile credentials
	#[arg(long, global = true, env = "VC_MONGO_USER")]
	user: Option<String>,

	/// Password for --user
	#[arg(long, global = true, env = "VC_MONGO_PASSWORD", hide_env_values = true)]
	password: Option<String>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Write connection settings to the profile file
	Config {
		#[arg(long)]
		uri: Option<String>,
		#[arg(long)]
		database: Option<String>,
		#[arg(long)]
		collection: Option<String>,
		/// Three-way merge program used by resolve-conflicts
		#[arg(long)]
		merge_tool: Option<String>,
	},
	/// Select the database and collection to work on
	Use { database: String, collection: String },
	/// Show the current version and pending-change flags
	Status,
	/// Start versioning the collection
	Init {
		#[arg(default_value = "initial version")]
		message: String,
	},
	/// Create a branch at the current version and switch to it
	CreateBranch { name: String },
	/// Register the captured changes as a new version
	Register {
		message: String,
		/// Register onto a branch created here
		#[arg(long)]
		branch: Option<String>,
	},
	/// Move the collection to a registered version
	Checkout {
		n: Option<i64>,
		#[arg(long)]
		branch: Option<String>,
	},
	/// List registered versions
	Log,
	/// List branches
	Branches,
	/// Show pending changes, or changes since another version
	Diff {
		n: Option<i64>,
		#[arg(long)]
		branch: Option<String>,
	},
	/// Drop the captured changes and restore the registered state
	DiscardChanges,
	/// Move pending changes aside (apply or discard them later)
	Stash {
		#[command(subcommand)]
		action: Option<StashAction>,
	},
	/// Delete a version and everything registered after it
	DeleteVersion {
		n: i64,
		#[arg(long)]
		branch: Option<String>,
	},
	/// Replicate local history onto the remote collection
	Push {
		#[arg(long)]
		branch: Option<String>,
		#[arg(long)]
		remote_uri: Option<String>,
		#[arg(long)]
		remote_database: Option<String>,
		#[arg(long)]
		remote_collection: Option<String>,
	},
	/// Bring remote history into the local collection
	Pull {
		#[arg(long)]
		branch: Option<String>,
		#[arg(long)]
		remote_uri: Option<String>,
		#[arg(long)]
		remote_database: Option<String>,
		#[arg(long)]
		remote_collection: Option<String>,
	},
	/// Run the configured merge tool over every conflicted document
	ResolveConflicts {
		/// Merge program; overrides the profile's merge_tool
		#[arg(long)]
		tool: Option<String>,
	},
	/// Run the change listener in the foreground until interrupted
	Listen,
}

#[derive(Subcommand)]
enum StashAction {
	/// Write the stashed documents back over the collection
	Apply,
	/// Drop the stash
	Discard,
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
		)
		.init();

	let cli = Cli::parse();
	if let Err(err) = run(cli).await {
		eprintln!("error: {err}");
		std::process::exit(1);
	}
}

async fn run(cli: Cli) -> Result<()> {
	let mut profile = Profile::load()?;

	match &cli.command {
		Command::Config { uri, database, collection, merge_tool } => {
			if let Some(uri) = uri {
				profile.uri = Some(uri.clone());
			}
			if let Some(database) = database {
				profile.database = Some(database.clone());
			}
			if let Some(collection) = collection {
				profile.collection = Some(collection.clone());
			}
			if let Some(merge_tool) = merge_tool {
				profile.merge_tool = Some(merge_tool.clone());
			}
			profile.save()?;
			println!("profile written to {}", config::PROFILE_FILE);
			return Ok(());
		}
		Command::Use { database, collection } => {
			profile.database = Some(database.clone());
			profile.collection = Some(collection.clone());
			profile.save()?;
			println!("using {database}/{collection}");
			return Ok(());
		}
		_ => {}
	}

	let engine = open_engine(&cli, &profile).await?;
	let result = dispatch(&cli, &profile, &engine).await;
	let closed = engine.close().await;
	result?;
	closed?;
	Ok(())
}

async fn open_engine(cli: &Cli, profile: &Profile) -> Result<VersionedCollection> {
	let connection = Connection {
		uri: cli
			.uri
			.clone()
			.or_else(|| profile.uri.clone())
			.unwrap_or_else(|| "mongodb://localhost:27017".to_owned()),
		database: cli
			.database
			.clone()
			.or_else(|| profile.database.clone())
			.ok_or("no database selected; run `vc use <database> <collection>`")?,
		collection: cli
			.collection
			.clone()
			.or_else(|| profile.collection.clone())
			.ok_or("no collection selected; run `vc use <database> <collection>`")?,
	};
	let (client, locator) = connection.connect(cli.user.as_deref(), cli.password.as_deref()).await?;
	Ok(VersionedCollection::open(client, locator, EngineConfig::default()).await?)
}

async fn open_remote(
	cli: &Cli,
	profile: &Profile,
	uri: &Option<String>,
	database: &Option<String>,
	collection: &Option<String>,
) -> Result<VersionedCollection> {
	let remote = profile.remote.clone().unwrap_or(RemoteProfile::default());
	let connection = Connection {
		uri: uri
			.clone()
			.or(remote.uri)
			.or_else(|| profile.uri.clone())
			.unwrap_or_else(|| "mongodb://localhost:27017".to_owned()),
		database: database
			.clone()
			.or(remote.database)
			.or_else(|| cli.database.clone())
			.or_else(|| profile.database.clone())
			.ok_or("no remote database; pass --remote-database")?,
		collection: collection
			.clone()
			.or(remote.collection)
			.or_else(|| cli.collection.clone())
			.or_else(|| profile.collection.clone())
			.ok_or("no remote collection; pass --remote-collection")?,
	};
	let (client, locator) = connection.connect(cli.user.as_deref(), cli.password.as_deref()).await?;
	Ok(VersionedCollection::open(client, locator, EngineConfig::default()).await?)
}

async fn dispatch(cli: &Cli, profile: &Profile, engine: &VersionedCollection) -> Result<()> {
	match &cli.command {
		Command::Config { .. } | Command::Use { .. } => unreachable!("handled before connecting"),

		Command::Status => {
			output::print_status(&engine.status().await?);
		}

		Command::Init { message } => match engine.init(message).await? {
			InitOutcome::Initialized => println!("initialized at (0, main)"),
			InitOutcome::AlreadyInitialized => println!("already initialized; nothing to do"),
		},

		Command::CreateBranch { name } => {
			engine.create_branch(name).await?;
			println!("created branch `{name}`");
		}

		Command::Register { message, branch } => {
			match engine.register(message, branch.as_deref()).await? {
				RegisterOutcome::Registered(version) => println!("registered {version}"),
				RegisterOutcome::NoChanges(version) => println!("nothing to register; still at {version}"),
			}
		}

		Command::Checkout { n, branch } => {
			let version =
				engine.checkout(VersionSpec { n: *n, branch: branch.clone() }).await?;
			println!("checked out {version}");
		}

		Command::Log => {
			let status = engine.status().await?;
			output::print_log(&engine.log().await?, &status);
		}

		Command::Branches => {
			let status = engine.status().await?;
			output::print_branches(&engine.branches().await?, &status.current_branch);
		}

		Command::Diff { n, branch } => {
			let other = if n.is_none() && branch.is_none() {
				None
			} else {
				Some(VersionSpec { n: *n, branch: branch.clone() })
			};
			output::print_diffs(&engine.diff(other).await?);
		}

		Command::DiscardChanges => {
			if engine.discard_changes().await? {
				println!("discarded pending changes");
			} else {
				println!("nothing to discard");
			}
		}

		Command::Stash { action } => match action {
			None => {
				if engine.stash().await? {
					println!("stashed pending changes");
				} else {
					println!("nothing to stash");
				}
			}
			Some(StashAction::Apply) => {
				if engine.stash_apply().await? {
					println!("applied the stash");
				} else {
					println!("no stash to apply");
				}
			}
			Some(StashAction::Discard) => {
				if engine.stash_discard().await? {
					println!("discarded the stash");
				} else {
					println!("no stash to discard");
				}
			}
		},

		Command::DeleteVersion { n, branch } => {
			let branch = match branch {
				Some(branch) => branch.clone(),
				None => engine.status().await?.current_branch,
			};
			let removed = engine.delete_version_subtree(*n, &branch).await?;
			println!("deleted {} version(s)", removed.len());
		}

		Command::Push { branch, remote_uri, remote_database, remote_collection } => {
			let remote = open_remote(cli, profile, remote_uri, remote_database, remote_collection).await?;
			let result = engine.push(&remote, branch.as_deref()).await;
			let closed = remote.close().await;
			match result? {
				PushOutcome::UpToDate => println!("remote is up to date"),
				PushOutcome::Pushed { versions, tip } => {
					println!("pushed {versions} version(s); remote tip {tip}")
				}
			}
			closed?;
		}

		Command::Pull { branch, remote_uri, remote_database, remote_collection } => {
			let remote = open_remote(cli, profile, remote_uri, remote_database, remote_collection).await?;
			let result = engine.pull(&remote, branch.as_deref()).await;
			let closed = remote.close().await;
			match result? {
				PullOutcome::UpToDate => println!("already up to date"),
				PullOutcome::FastForwarded(version) => println!("fast-forwarded to {version}"),
				PullOutcome::Merged { source_tip } => {
					println!("merged remote changes (staged at {source_tip}); register to finish")
				}
			}
			closed?;
		}

		Command::ResolveConflicts { tool } => {
			let program = tool
				.clone()
				.or_else(|| profile.merge_tool.clone())
				.ok_or("no merge tool configured; run `vc config --merge-tool <program>`")?;
			let resolver = MergeTool::new(program);
			let report = engine.resolve_conflicts(&resolver).await?;
			println!("resolved {} conflict(s), {} remaining", report.resolved, report.remaining);
		}

		Command::Listen => {
			engine.status().await?;
			println!("listening for changes; press Ctrl-C to stop");
			tokio::signal::ctrl_c().await?;
		}
	}
	Ok(())
}
