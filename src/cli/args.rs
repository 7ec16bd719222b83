// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use crate::cli::extract;

/// Extract partition images from an Android A/B OTA payload.
///
/// The input may be a raw payload.bin, an OTA zip containing one, or an
/// http(s) URL pointing at an OTA zip on a server that supports byte-range
/// requests.
#[derive(Debug, Parser)]
#[command(version, disable_version_flag = true)]
pub struct Cli {
    /// Input payload: file path or URL.
    #[arg(short, long, value_name = "PATH_OR_URL")]
    pub input: String,

    /// Output directory for extracted images.
    #[arg(short, long, value_name = "DIR", default_value = "out")]
    pub output: PathBuf,

    /// Comma-separated names of partitions to extract (default: all).
    #[arg(short = 'X', long, value_name = "NAMES", value_delimiter = ',')]
    pub partitions: Vec<String>,

    /// Number of decompression worker threads.
    #[arg(short = 'T', long, value_name = "N", default_value_t = 12)]
    pub workers: usize,

    /// Print payload information instead of extracting.
    #[arg(short = 'P', long)]
    pub info: bool,

    /// Print version and exit.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging();
    logging_initialized.store(true, Ordering::SeqCst);

    extract::payload_main(&cli)
}
