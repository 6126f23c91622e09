//! Thin CLI front-end wiring `Config` + `HttpGateway` + `Uploader`/`Downloader`
//! together. No history file, no shell completion, no interactive prompts —
//! the hard engineering lives in the library, this binary only marshals
//! arguments into it.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::error;

use pithos_sync::gateway::{Attrs, HttpGateway};
use pithos_sync::progress::ProgressReporter;
use pithos_sync::{Downloader, Error, Uploader};

#[derive(Parser, Debug)]
#[command(author, version, about = "Content-addressed object transfer against a Pithos-compatible store")]
struct Args {
	/// Configuration file
	#[arg(short = 'c', long = "config", default_value = "./pithos-sync.toml")]
	config_file: PathBuf,

	/// Container to operate against (overrides the configured default)
	#[arg(long)]
	container: Option<String>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Upload a local file as a chunked object
	Upload {
		/// Path to the local file
		path: PathBuf,
		/// Destination object name
		object: String,
	},
	/// Download an object to a local file, resuming if it already exists
	Download {
		/// Source object name
		object: String,
		/// Destination path
		path: PathBuf,
		/// Resume from a partially-downloaded local file
		#[arg(long)]
		resume: bool,
	},
	/// Print the container's block policy and quota
	ContainerInfo,
}

struct CliProgress {
	bar: ProgressBar,
}

impl ProgressReporter for CliProgress {
	fn init(&mut self, total: u64) {
		self.bar.set_length(total);
	}
	fn tick(&mut self) {
		self.bar.inc(1);
	}
}

fn progress_bar(label: &str) -> CliProgress {
	let bar = ProgressBar::new(0);
	bar.set_style(
		ProgressStyle::with_template(&format!("{{spinner}} {} [{{bar}}] {{pos}}/{{len}}", label))
			.unwrap(),
	);
	CliProgress { bar }
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	if let Err(e) = run().await {
		error!(error = %e, "pithos-sync failed");
		eprintln!("Error: {}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), Error> {
	let args = Args::parse();
	let config = pithos_sync::config::read_config(args.config_file)?;

	let container = args
		.container
		.or_else(|| config.container.clone())
		.ok_or_else(|| Error::PreconditionError("no container specified".to_string()))?;

	let gateway = std::sync::Arc::new(HttpGateway::new(
		config.endpoint.clone(),
		config.token.clone(),
		std::time::Duration::from_secs(config.request_timeout_secs),
	)?);
	gateway.set_container(config.account.clone(), container);

	match args.command {
		Command::Upload { path, object } => {
			let uploader = Uploader::new(gateway, config.pool_size);
			let mut file = tokio::fs::File::open(&path).await?;
			let size = file.metadata().await?.len();
			let mut hash_progress = progress_bar("hashing");
			let mut upload_progress = progress_bar("uploading");
			uploader
				.upload_object(
					&object,
					&mut file,
					size,
					&Attrs::default(),
					&mut hash_progress,
					&mut upload_progress,
				)
				.await?;
			println!("Uploaded {} as {}", path.display(), object);
		}
		Command::Download { object, path, resume } => {
			let downloader = Downloader::new(gateway, config.pool_size);
			let mut file = tokio::fs::OpenOptions::new()
				.create(true)
				.read(true)
				.write(true)
				.open(&path)
				.await?;
			let mut download_progress = progress_bar("downloading");
			downloader
				.download_object(
					&object,
					pithos_sync::Destination::File {
						file: &mut file,
						resume,
					},
					None,
					&Attrs::default(),
					&mut download_progress,
				)
				.await?;
			println!("Downloaded {} to {}", object, path.display());
		}
		Command::ContainerInfo => {
			let info = gateway.container_info().await?;
			println!("block size: {}", info.blocksize);
			println!("block hash: {}", info.blockhash);
			if let Some(quota) = info.quota {
				println!("quota: {}", quota);
			}
		}
	}

	Ok(())
}
