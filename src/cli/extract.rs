// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::Read,
    sync::Arc,
};

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    cli::args::Cli,
    format::{
        payload::{extract_partitions, partition_size, ExtractOptions, PayloadHeader},
        zip::ZipPayloadReader,
    },
    http::HttpRangeReader,
    progress::{ConsoleProgress, ProgressSink},
    stream::{CursorReader, FromReader, PSeekFile, ReadAt},
};

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

enum InputKind {
    RawPayload,
    OtaZip,
    Url,
}

/// Decide how to open the input. URLs are always treated as OTA zips;
/// local files are classified by their first four bytes.
fn sniff_input(input: &str) -> Result<InputKind> {
    if input.starts_with("http://") || input.starts_with("https://") {
        return Ok(InputKind::Url);
    }

    let mut file =
        File::open(input).with_context(|| format!("Failed to open input: {input}"))?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .with_context(|| format!("Failed to read input: {input}"))?;

    if magic == *ZIP_MAGIC {
        Ok(InputKind::OtaZip)
    } else {
        Ok(InputKind::RawPayload)
    }
}

fn open_file(path: &str) -> Result<PSeekFile> {
    File::open(path)
        .map(PSeekFile::new)
        .with_context(|| format!("Failed to open input: {path}"))
}

pub fn payload_main(cli: &Cli) -> Result<()> {
    match sniff_input(&cli.input)? {
        InputKind::RawPayload => run(cli, open_file(&cli.input)?),
        InputKind::OtaZip => {
            let source = ZipPayloadReader::new(open_file(&cli.input)?)
                .context("Failed to locate payload in zip")?;
            run(cli, source)
        }
        InputKind::Url => {
            let remote = HttpRangeReader::new(&cli.input)
                .context("Failed to initialize ranged download")?;
            let source = ZipPayloadReader::new(remote)
                .context("Failed to locate payload in remote zip")?;
            run(cli, source)
        }
    }
}

fn run<R: ReadAt>(cli: &Cli, source: R) -> Result<()> {
    let header = {
        let mut reader = CursorReader::new(&source);
        PayloadHeader::from_reader(&mut reader).context("Failed to parse payload")?
    };

    if cli.info {
        return print_info(&header);
    }

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output))?;

    let options = ExtractOptions {
        workers: cli.workers.max(1),
    };
    let progress: Arc<dyn ProgressSink> = Arc::new(ConsoleProgress::new());

    extract_partitions(
        &source,
        &header,
        &cli.output,
        &cli.partitions,
        &options,
        &progress,
    )
    .context("Failed to extract partitions")?;

    info!("Finished, images are in {:?}", cli.output);

    Ok(())
}

fn print_info(header: &PayloadHeader) -> Result<()> {
    let manifest = &header.manifest;

    println!("Payload version:      {}", header.version);
    println!(
        "Security patch level: {}",
        manifest.security_patch_level.as_deref().unwrap_or("-"),
    );
    println!("Block size:           {}", manifest.block_size);
    println!("Minor version:        {}", manifest.minor_version);
    println!(
        "Max timestamp:        {}",
        manifest.max_timestamp.unwrap_or(0),
    );

    if !manifest.apex_info.is_empty() {
        println!();
        println!("APEX packages:");

        for apex in &manifest.apex_info {
            println!(
                "  {} version={} compressed={} decompressed_size={}",
                apex.package_name.as_deref().unwrap_or("?"),
                apex.version.unwrap_or(0),
                apex.is_compressed.unwrap_or(false),
                apex.decompressed_size.unwrap_or(0),
            );
        }
    }

    println!();
    println!("Partitions:");

    for partition in &manifest.partitions {
        let size = partition_size(partition, manifest.block_size)
            .with_context(|| format!("Invalid extents in {}", partition.partition_name))?;

        println!("  {:<24} {:>16} bytes", partition.partition_name, size);
    }

    Ok(())
}
