//! dsvn — URL-level repository operations.
//!
//! # Usage
//!
//! ```bash
//! dsvn mkdir -m "layout" file:///srv/repo/trunk file:///srv/repo/tags
//! dsvn rm -m "cleanup" file:///srv/repo/tags/old
//! dsvn log -v -r HEAD:1 file:///srv/repo
//! dsvn locate --peg 40 -r 10 file:///srv/repo/branches/b/file.txt
//! dsvn revprop file:///srv/repo 12 svn:log "better message"
//! ```

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dsvn_client::{ClientConfig, CommitClient, RevisionResolver, Target};
use dsvn_core::{
    CommitInfo, EventDispatcher, LogEntry, LogOptions, Repositories, Revision, SessionPool, TracingHandler,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "dsvn")]
#[command(author = "DSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "DSvn repository client")]
struct Cli {
    /// Directory holding dsvn-client.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Author recorded on commits
    #[arg(long, global = true)]
    username: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create directories in the repository
    Mkdir {
        /// Directory URLs
        #[arg(required = true)]
        urls: Vec<String>,
        /// Log message
        #[arg(short, long)]
        message: String,
    },

    /// Delete items from the repository
    Rm {
        /// Item URLs
        #[arg(required = true)]
        urls: Vec<String>,
        /// Log message
        #[arg(short, long)]
        message: String,
    },

    /// Show revision history
    Log {
        url: String,
        /// Revision range START[:END] (default HEAD:0)
        #[arg(short, long)]
        revision: Option<String>,
        /// Stop after this many entries
        #[arg(short, long, default_value_t = 0)]
        limit: usize,
        /// Print changed paths
        #[arg(short, long)]
        verbose: bool,
    },

    /// Find where a node lived at other revisions
    Locate {
        url: String,
        /// Revision at which the URL names the node
        #[arg(long, default_value = "HEAD")]
        peg: Revision,
        /// Revision to locate the node at
        #[arg(short, long)]
        revision: Revision,
        /// Second revision to locate the node at
        #[arg(long)]
        end: Option<Revision>,
    },

    /// Print, set or delete a revision property
    Revprop {
        url: String,
        revision: u64,
        name: String,
        /// New value; prints the current one when omitted
        value: Option<String>,
        /// Delete the property
        #[arg(long, conflicts_with = "value")]
        delete: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dsvn=info".parse()?)
                .add_directive("dsvn_client=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(dir) => ClientConfig::load(dir)?,
        None => ClientConfig::default(),
    };
    let repos = Arc::new(match &cli.username {
        Some(name) => Repositories::new().with_username(name.clone()),
        None => Repositories::new(),
    });
    let pool = SessionPool::new(repos.clone(), config.pool_idle_timeout());
    let token = CancellationToken::new();
    let sweeper = pool.spawn_sweeper(token.clone());

    let context = Context {
        repos,
        pool,
        config,
        events: EventDispatcher::new(Some(Arc::new(TracingHandler))),
    };
    let result = tokio::task::spawn_blocking(move || run(cli.command, &context)).await;

    token.cancel();
    sweeper.await?;
    result?
}

struct Context {
    repos: Arc<Repositories>,
    pool: SessionPool,
    config: ClientConfig,
    events: EventDispatcher,
}

fn parse_range(range: &str) -> Result<(Revision, Revision)> {
    let (start, end) = match range.split_once(':') {
        Some((start, end)) => (start, Some(end)),
        None => (range, None),
    };
    let start: Revision = start.parse()?;
    let end = match end {
        Some(end) => end.parse()?,
        None => start,
    };
    Ok((start, end))
}

fn report(info: &CommitInfo) {
    match info.revision {
        Some(revision) => println!("Committed revision {}.", revision),
        None => println!("Nothing committed."),
    }
}

fn print_entry(entry: &LogEntry, verbose: bool) {
    let date = entry
        .date
        .map(|d: DateTime<Utc>| d.format("%Y-%m-%d %H:%M:%S %z").to_string())
        .unwrap_or_default();
    let message = entry.message.as_deref().unwrap_or_default();
    println!("{}", "-".repeat(72));
    println!(
        "r{} | {} | {} | {} line{}",
        entry.revision,
        entry.author.as_deref().unwrap_or("(no author)"),
        date,
        message.lines().count(),
        if message.lines().count() == 1 { "" } else { "s" }
    );
    if let (true, Some(changed)) = (verbose, &entry.changed_paths) {
        println!("Changed paths:");
        for (p, change) in changed {
            match &change.copy_from {
                Some((src, rev)) => println!("   {} {} (from {}:{})", change.action, p, src, rev),
                None => println!("   {} {}", change.action, p),
            }
        }
    }
    println!();
    println!("{}", message);
}

fn run(command: Commands, ctx: &Context) -> Result<()> {
    let client = || {
        CommitClient::new(ctx.repos.clone())
            .with_config(ctx.config.clone())
            .with_events(ctx.events.clone())
    };

    match command {
        Commands::Mkdir { urls, message } => report(&client().mkdir_urls(&urls, &message)?),

        Commands::Rm { urls, message } => report(&client().delete_urls(&urls, &message)?),

        Commands::Log {
            url,
            revision,
            limit,
            verbose,
        } => {
            let session = ctx.pool.acquire(&url)?;
            let (start, end) = match revision {
                Some(range) => parse_range(&range)?,
                None => (Revision::Head, Revision::Number(0)),
            };
            let resolver = RevisionResolver::new(ctx.repos.clone());
            let start = resolver.resolve(&start, Some(&*session), None)?;
            let end = resolver.resolve(&end, Some(&*session), None)?;
            let options = LogOptions {
                discover_changed_paths: verbose,
                limit,
                ..LogOptions::default()
            };
            session.log(&[String::new()], start, end, &options, &mut |entry| {
                print_entry(entry, verbose);
                Ok(())
            })?;
            println!("{}", "-".repeat(72));
            session.release();
        }

        Commands::Locate {
            url,
            peg,
            revision,
            end,
        } => {
            let resolver = RevisionResolver::new(ctx.repos.clone()).with_events(ctx.events.clone());
            let (start, end) = resolver.locate_historic(
                &Target::Url(url),
                &peg,
                &revision,
                &end.unwrap_or(Revision::Undefined),
            )?;
            println!("{}", start);
            if let Some(end) = end {
                println!("{}", end);
            }
        }

        Commands::Revprop {
            url,
            revision,
            name,
            value,
            delete,
        } => {
            let session = ctx.pool.acquire(&url)?;
            if delete {
                session.set_revision_property(revision, &name, None)?;
                println!("Deleted property '{}' on revision {}", name, revision);
            } else if let Some(value) = value {
                session.set_revision_property(revision, &name, Some(&value))?;
                println!("Set property '{}' on revision {}", name, revision);
            } else {
                let value = session
                    .revision_property(revision, &name)?
                    .ok_or_else(|| anyhow!("Property '{}' not found on revision {}", name, revision))?;
                println!("{}", value);
            }
        }
    }
    Ok(())
}
