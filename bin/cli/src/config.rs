// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use std::path::PathBuf;

use mongodb::{
	Client,
	options::{ClientOptions, Credential},
};
use mongovc_engine::CollectionLocator;
use serde::{Deserialize, Serialize};

use crate::Result;

pub const PROFILE_FILE: &str = ".mongovc.json";

/// The persisted connection profile. Explicit flags and the
/// `VC_MONGO_USER`/`VC_MONGO_PASSWORD` environment variables take priority
/// over what is stored here.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Profile {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub uri: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub database: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub collection: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub merge_tool: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub remote: Option<RemoteProfile>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoteProfile {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub uri: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub database: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub collection: Option<String>,
}

fn profile_path() -> PathBuf {
	PathBuf::from(PROFILE_FILE)
}

impl Profile {
	pub fn load() -> Result<Self> {
		let path = profile_path();
		if !path.exists() {
			return Ok(Self::default());
		}
		let raw = std::fs::read_to_string(&path)
			.map_err(|err| format!("reading {}: {err}", path.display()))?;
		Ok(serde_json::from_str(&raw).map_err(|err| format!("parsing {}: {err}", path.display()))?)
	}

	pub fn save(&self) -> Result<()> {
		let raw = serde_json::to_string_pretty(self)?;
		std::fs::write(profile_path(), raw)?;
		Ok(())
	}
}

/// Resolved connection settings for one collection.
#[derive(Clone, Debug)]
pub struct Connection {
	pub uri: String,
	pub database: String,
	pub collection: String,
}

impl Connection {
	pub async fn connect(
		&self,
		user: Option<&str>,
		password: Option<&str>,
	) -> Result<(Client, CollectionLocator)> {
		let mut options = ClientOptions::parse(&self.uri).await?;
		if let Some(user) = user {
			let mut credential = Credential::builder().username(user.to_owned()).build();
			credential.password = password.map(str::to_owned);
			options.credential = Some(credential);
		}
		let host = options
			.hosts
			.first()
			.map(ToString::to_string)
			.unwrap_or_else(|| "localhost:27017".to_owned());
		let client = Client::with_options(options)?;
		let locator = CollectionLocator::new(host, &self.database, &self.collection);
		Ok((client, locator))
	}
}
