//! dsvnsync — Repository mirroring tool for dsvn.
//!
//! # Usage
//!
//! ```bash
//! # Create an empty repository to mirror into
//! dsvnsync create /srv/mirror
//!
//! # Point the mirror at its source and copy everything
//! dsvnsync init /srv/mirror file:///srv/master
//! dsvnsync sync /srv/mirror
//!
//! # Re-copy revision properties edited on the source
//! dsvnsync copy-revprops /srv/mirror 42
//!
//! # Show the mirror's sync state
//! dsvnsync info /srv/mirror
//!
//! # Release a lock left behind by a crashed run
//! dsvnsync unlock /srv/mirror
//! ```
//!
//! Repository arguments are URLs or local repository directories.

use anyhow::Result;
use clap::{Parser, Subcommand};
use dsvn_client::{ClientConfig, Replicator, SyncEngine};
use dsvn_core::path;
use dsvn_core::{CancelToken, EventDispatcher, Repositories, SessionFactory, SqliteRepository, TracingHandler};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "dsvnsync")]
#[command(author = "DSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "DSvn repository mirroring tool")]
struct Cli {
    /// Directory holding dsvn-client.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Author recorded on mirrored commits
    #[arg(long, global = true)]
    username: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty SQLite-backed repository
    Create {
        /// Repository directory
        path: PathBuf,
    },

    /// Turn an empty destination into a mirror of the source
    Init {
        /// Destination (mirror) repository
        dest: String,
        /// Source repository
        source: String,
    },

    /// Copy all source revisions the mirror lacks
    Sync {
        /// Destination (mirror) repository
        dest: String,
    },

    /// Re-copy the revision properties of one mirrored revision
    #[command(name = "copy-revprops")]
    CopyRevprops {
        /// Destination (mirror) repository
        dest: String,
        /// Revision to copy
        revision: u64,
    },

    /// Display the mirror's sync state
    Info {
        /// Destination (mirror) repository
        dest: String,
    },

    /// Copy revisions one by one, for sources that cannot replay
    Replicate {
        /// Source repository
        source: String,
        /// Destination repository
        dest: String,
        /// First revision to copy (default: destination HEAD + 1)
        #[arg(long)]
        from: Option<u64>,
        /// Last revision to copy (default: source HEAD)
        #[arg(long)]
        to: Option<u64>,
    },

    /// Remove the mirror lock, whoever holds it
    Unlock {
        /// Destination (mirror) repository
        dest: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dsvnsync=info".parse()?)
                .add_directive("dsvn_client=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let token = CancelToken::new();
    let events = EventDispatcher::new(Some(Arc::new(TracingHandler))).with_cancel_token(token.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping after the current revision");
            token.cancel();
        }
    });

    tokio::task::spawn_blocking(move || run(cli, events)).await?
}

/// Accept a URL as is; anything else names a local repository directory.
fn repository_url(arg: &str) -> Result<String> {
    if arg.contains("://") {
        Ok(path::canonicalize_url(arg)?)
    } else {
        Ok(SqliteRepository::root_url(Path::new(arg))?)
    }
}

fn run(cli: Cli, events: EventDispatcher) -> Result<()> {
    let config = match &cli.config {
        Some(dir) => ClientConfig::load(dir)?,
        None => ClientConfig::default(),
    };
    let repos = match cli.username {
        Some(name) => Repositories::new().with_username(name),
        None => Repositories::new(),
    };
    let repos = Arc::new(repos);
    let engine = || -> Result<SyncEngine> {
        Ok(SyncEngine::new(repos.clone(), config.clone())?.with_events(events.clone()))
    };

    match cli.command {
        Commands::Create { path } => {
            SqliteRepository::create(&path)?;
            println!("Created repository at {}", SqliteRepository::root_url(&path)?);
        }

        Commands::Init { dest, source } => {
            let (dest, source) = (repository_url(&dest)?, repository_url(&source)?);
            engine()?.initialize(&source, &dest)?;
            println!("Initialized {} as a mirror of {}", dest, source);
        }

        Commands::Sync { dest } => {
            let last = engine()?.synchronize(&repository_url(&dest)?)?;
            println!("Mirror is at revision {}.", last);
        }

        Commands::CopyRevprops { dest, revision } => {
            engine()?.copy_revision_properties(&repository_url(&dest)?, revision)?;
            println!("Copied properties for revision {}.", revision);
        }

        Commands::Info { dest } => {
            let cursor = engine()?.info(&repository_url(&dest)?)?;
            println!("Source URL:             {}", cursor.from_url);
            println!("Source Repository UUID: {}", cursor.from_uuid);
            println!("Last Merged Revision:   {}", cursor.last_merged_rev);
            if let Some(copying) = cursor.currently_copying {
                println!("Currently Copying:      {}", copying);
            }
        }

        Commands::Replicate { source, dest, from, to } => {
            let source = repos.open(&repository_url(&source)?)?;
            let dest = repos.open(&repository_url(&dest)?)?;
            let from = match from {
                Some(from) => from,
                None => dest.latest_revision()? + 1,
            };
            let count = Replicator::new(events.clone()).replicate(source.as_ref(), dest.as_ref(), from, to)?;
            println!("Replicated {} revisions.", count);
        }

        Commands::Unlock { dest } => {
            let dest = repos.open(&repository_url(&dest)?)?;
            engine()?.unlock(dest.as_ref())?;
            println!("Released the lock on {}.", dest.location());
        }
    }
    Ok(())
}
