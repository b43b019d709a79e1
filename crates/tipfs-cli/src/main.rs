//! tipfs - browse the tip commit of a remote git repository without cloning it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tipfs_tree::RemoteTree;

mod commands;
mod config;
mod http;
mod logging;

use config::Config;
use http::HttpTransport;
use logging::LogFormat;

/// tipfs - read-only view of a remote git tip
#[derive(Parser, Debug)]
#[command(name = "tipfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a YAML config file; ignored if missing
    #[arg(short, long, env = "TIPFS_CONFIG", default_value = "tipfs.yaml", global = true)]
    config: PathBuf,

    /// Repository URL
    #[arg(short, long, env = "TIPFS_URL", global = true)]
    url: Option<String>,

    /// Branch, tag, ref name or commit id (default: the remote's HEAD)
    #[arg(short, long, global = true)]
    reference: Option<String>,

    /// Fetch blobs with the tree instead of on demand
    #[arg(long, global = true)]
    no_filter: bool,

    /// Log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List advertised refs
    Refs,

    /// List a directory
    Ls {
        /// Directory path
        #[arg(default_value = "/")]
        path: String,
        /// Descend into subdirectories
        #[arg(short = 'R', long)]
        recursive: bool,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a path's metadata
    Stat {
        /// Path
        path: String,
    },

    /// Print a file
    Cat {
        /// File path
        path: String,
    },
}

impl Cli {
    /// Layers command-line flags over the config file.
    fn resolve_config(&self) -> Result<Config> {
        let mut config = Config::load(&self.config)?;
        if let Some(url) = &self.url {
            config.url = Some(url.clone());
        }
        if let Some(reference) = &self.reference {
            config.reference = reference.clone();
        }
        if self.no_filter {
            config.use_filter = false;
        }
        if let Some(format) = &self.log_format {
            config.log_format = format.clone();
        }
        Ok(config)
    }
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let url = config
        .url
        .as_deref()
        .context("no repository URL; pass --url or set url in the config file")?;
    let transport = Arc::new(HttpTransport::new(
        url,
        &config.user_agent,
        Duration::from_secs(config.timeout_secs),
    )?);
    tracing::info!(url, reference = %config.reference, "opening remote");

    let tree = || RemoteTree::new(Arc::clone(&transport), config.remote());
    match cli.command {
        Commands::Refs => commands::refs(&*transport).await,
        Commands::Ls {
            path,
            recursive,
            json,
        } => commands::ls(&tree(), &path, recursive, json).await,
        Commands::Stat { path } => commands::stat(&tree(), &path).await,
        Commands::Cat { path } => commands::cat(&tree(), &path).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };

    logging::init_logging(
        logging::level_for(cli.verbose),
        LogFormat::parse(&config.log_format),
    );

    if let Err(e) = run(cli, config).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
