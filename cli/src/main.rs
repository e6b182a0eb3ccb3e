//! LCP license tool
//!
//! Inspects Readium LCP licenses and talks to their status servers:
//!
//!   lcp inspect book.lcpl
//!   lcp inspect book.epub
//!   lcp status book.lcpl
//!   lcp crl --refresh
//!   lcp acquire book.lcpl --output ~/Books
//!
//! State (device id, CRL cache, rights counters) lives in a SQLite file in
//! the user's data directory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lcp_cli::Session;
use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lcp")]
#[command(about = "Inspect Readium LCP licenses", version)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the license database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Describe a license file or publication without contacting any server
    Inspect { license: PathBuf },
    /// Fetch the live status of a license
    Status { license: PathBuf },
    /// Show the cached certificate revocation list
    Crl {
        /// Download the list even if the cache is fresh
        #[arg(long)]
        refresh: bool,
    },
    /// Show this device's identity
    Device {
        /// Also report the registration state for this license
        license: Option<PathBuf>,
    },
    /// Show the copy and print rights left for a license
    Rights { license: PathBuf },
    /// Download the publication of a .lcpl file
    Acquire {
        license: PathBuf,
        /// Destination directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

fn print<T: Serialize + Display>(report: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = lcp_cli::load_config(args.config.as_deref())?;
    let json = args.json;
    let data_dir = args.data_dir;

    match args.command {
        Command::Inspect { license } => print(&lcp_cli::inspect(&config, &license)?, json),
        Command::Status { license } => {
            let session = open_session(config, data_dir)?;
            print(&lcp_cli::status(&session, &license).await?, json)
        }
        Command::Crl { refresh } => {
            let session = open_session(config, data_dir)?;
            print(&lcp_cli::crl(&session, refresh).await?, json)
        }
        Command::Device { license } => {
            let session = open_session(config, data_dir)?;
            print(&lcp_cli::device(&session, license.as_deref())?, json)
        }
        Command::Rights { license } => {
            let session = open_session(config, data_dir)?;
            print(&lcp_cli::rights(&session, &license)?, json)
        }
        Command::Acquire { license, output } => {
            let session = open_session(config, data_dir)?;
            print(&lcp_cli::acquire(&session, &license, &output).await?, json)
        }
    }
}

fn open_session(config: lcp_license::LcpConfig, data_dir: Option<PathBuf>) -> Result<Session> {
    let data_dir = match data_dir {
        Some(dir) => dir,
        None => lcp_cli::default_data_dir().context("no data directory on this system")?,
    };
    Session::open(config, &data_dir)
}
