//! Contains types and functions related to the transfer engine's configuration file

use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Represents the whole configuration of the `pithos-sync` binary.
///
/// The library itself (`pithos_sync`) never reads this file: it is
/// constructed by the caller and handed a `RestGateway` built by hand, or
/// (for the CLI front-end) built from this struct.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Base URL of the Pithos-compatible endpoint, e.g. `https://storage.example.com/v1`
	pub endpoint: String,

	/// Auth token sent as `X-Auth-Token`
	pub token: String,

	/// Account to operate against
	pub account: String,

	/// Default container, if any subcommand omits `--container`
	pub container: Option<String>,

	/// Number of parallel workers per transfer
	#[serde(default = "default_pool_size")]
	pub pool_size: usize,

	/// Network request timeout, in seconds
	#[serde(default = "default_request_timeout_secs")]
	pub request_timeout_secs: u64,
}

fn default_pool_size() -> usize {
	5
}
fn default_request_timeout_secs() -> u64 {
	60
}

/// Read and parse the configuration file
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	toml::from_str(&config).map_err(|e| Error::ConfigError(e.to_string()))
}
