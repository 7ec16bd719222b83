// SPDX-License-Identifier: GPL-3.0-only

//! Payload parsing and partition extraction.
//!
//! An OTA payload is a big-endian `CrAU` header, a protobuf
//! [`DeltaArchiveManifest`], a metadata signature blob that we skip, and a
//! data-blob region holding every install operation's source bytes. Only
//! full payloads are supported: each destination block is synthesized from
//! in-payload data, never from the device's previous contents.

use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Arc,
};

use byteorder::{BigEndian, ReadBytesExt};
use bzip2::write::BzDecoder;
use num_traits::ToPrimitive;
use thiserror::Error;
use tracing::{debug, error, warn};
use xz2::write::XzDecoder;

use crate::{
    pool::{CompletionTracker, WorkerPool},
    progress::ProgressSink,
    protobuf::chromeos_update_engine::{
        mod_InstallOperation, DeltaArchiveManifest, InstallOperation, PartitionUpdate,
    },
    stream::{
        CountingReader, CursorReader, CursorWriter, FromReader, PSeekFile, ReadAt, ReadDiscardExt,
        Reopen, WriteAt,
    },
    util,
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Manifest length is zero")]
    EmptyManifest,
    #[error("Manifest signature length is zero")]
    EmptySignature,
    #[error("Manifest block size is zero")]
    InvalidBlockSize,
    #[error("delta payloads are not supported, please use a full payload file")]
    DeltaPayload,
    #[error("Unsupported partition operation: {0:?}")]
    UnsupportedOperation(mod_InstallOperation::Type),
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("{0} stream did not decode cleanly")]
    Codec(&'static str, #[source] io::Error),
    #[error("Protobuf error")]
    Protobuf(#[from] quick_protobuf::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Parsed payload header and manifest.
#[derive(Clone, Debug)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    pub metadata_signature_size: u32,
    /// Absolute offset of the data-blob region. Every operation's
    /// `data_offset` is relative to this point.
    pub blob_offset: u64,
}

impl<R: Read> FromReader<R> for PayloadHeader {
    type Error = Error;

    /// Parse the header from an OTA payload file. After this function
    /// returns, the file position is set to the beginning of the blob
    /// section.
    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != *PAYLOAD_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version = reader.read_u64::<BigEndian>()?;
        if version != 2 {
            warn!("Unexpected payload version {version}, continuing anyway");
        }

        let manifest_size = reader.read_u64::<BigEndian>()?;
        if manifest_size == 0 {
            return Err(Error::EmptyManifest);
        }
        let manifest_size = manifest_size
            .to_usize()
            .ok_or(Error::IntegerTooLarge("manifest_size"))?;

        let metadata_signature_size = reader.read_u32::<BigEndian>()?;
        if metadata_signature_size == 0 {
            return Err(Error::EmptySignature);
        }

        let mut manifest_raw = vec![0u8; manifest_size];
        reader.read_exact(&mut manifest_raw)?;
        let manifest: DeltaArchiveManifest = util::read_protobuf(&manifest_raw)?;

        if manifest.minor_version != 0 {
            return Err(Error::DeltaPayload);
        }
        if manifest.block_size == 0 {
            return Err(Error::InvalidBlockSize);
        }

        // Skip the manifest signatures.
        reader.read_discard_exact(metadata_signature_size.into())?;

        Ok(Self {
            version,
            manifest,
            metadata_signature_size,
            blob_offset: reader.stream_position()?,
        })
    }
}

/// Compute the size of a partition's output image: the highest block any
/// operation writes, times the block size. Independent of operation order.
pub fn partition_size(partition: &PartitionUpdate, block_size: u32) -> Result<u64> {
    let mut size = 0u64;

    for op in &partition.operations {
        // Extents are ordered, so the last one ends the furthest out.
        let Some(extent) = op.dst_extents.last() else {
            continue;
        };

        let start_block = extent
            .start_block
            .ok_or(Error::MissingField("start_block"))?;
        let num_blocks = extent.num_blocks.ok_or(Error::MissingField("num_blocks"))?;

        let end = start_block
            .checked_add(num_blocks)
            .and_then(|blocks| blocks.checked_mul(block_size.into()))
            .ok_or(Error::IntegerTooLarge("dst_extents"))?;

        size = size.max(end);
    }

    Ok(size)
}

/// Extraction tuning knobs.
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    /// Number of decompression worker threads.
    pub workers: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self { workers: 12 }
    }
}

/// Extract the selected partitions (all of them when `partition_names` is
/// empty) into `<out_dir>/<name>.img`.
///
/// Input reads happen on the calling thread in ascending `data_offset`
/// order, so compressed and remote sources are only ever advanced forward.
/// Decompression and placement run on a bounded worker pool shared by every
/// partition; the pool drains completely between partitions.
///
/// A failed operation or partition is logged and the remaining work
/// continues, possibly leaving that image incomplete.
pub fn extract_partitions<R: ReadAt>(
    source: &R,
    header: &PayloadHeader,
    out_dir: &Path,
    partition_names: &[String],
    options: &ExtractOptions,
    progress: &Arc<dyn ProgressSink>,
) -> Result<()> {
    let selected = select_partitions(&header.manifest, partition_names);
    let pool = WorkerPool::new(options.workers);
    let mut reader = CursorReader::new(source);

    for partition in selected {
        if let Err(e) = extract_partition(&mut reader, header, partition, out_dir, &pool, progress)
        {
            error!("Failed to extract {}: {e}", partition.partition_name);
        }
    }

    Ok(())
}

fn select_partitions<'a>(
    manifest: &'a DeltaArchiveManifest,
    names: &[String],
) -> Vec<&'a PartitionUpdate> {
    if names.is_empty() {
        return manifest.partitions.iter().collect();
    }

    let mut selected = Vec::with_capacity(names.len());

    for name in names {
        match manifest
            .partitions
            .iter()
            .find(|p| p.partition_name == *name)
        {
            Some(partition) => selected.push(partition),
            None => warn!("Partition not found in payload: {name}"),
        }
    }

    selected
}

fn extract_partition<R: ReadAt>(
    reader: &mut CursorReader<&R>,
    header: &PayloadHeader,
    partition: &PartitionUpdate,
    out_dir: &Path,
    pool: &WorkerPool,
    progress: &Arc<dyn ProgressSink>,
) -> Result<()> {
    let name = partition.partition_name.as_str();
    let block_size = header.manifest.block_size;
    let total_size = partition_size(partition, block_size)?;

    let path = out_dir.join(format!("{name}.img"));
    let output = match create_output(&path, total_size) {
        Ok(output) => output,
        Err(e) => {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }
    };

    debug!("Extracting {name} ({total_size} bytes) to {path:?}");
    progress.begin(name, total_size);

    // Ascending data_offset keeps the serial read phase sequential, which
    // the deflated-zip and HTTP sources depend on.
    let mut operations = partition.operations.iter().collect::<Vec<_>>();
    operations.sort_by_key(|op| op.data_offset.unwrap_or(0));

    let barrier = CompletionTracker::new();

    for op in operations {
        let data = match read_operation_data(reader, header.blob_offset, op) {
            Ok(data) => data,
            Err(e) => {
                warn!("Skipping {name} operation: {e}");
                continue;
            }
        };

        let job_output = output.reopen()?;
        let job_op = op.clone();
        let job_progress = Arc::clone(progress);
        let job_barrier = barrier.clone();
        let job_name = partition.partition_name.clone();

        barrier.register();
        pool.execute(move || {
            match apply_operation(&job_output, block_size, &job_op, &data) {
                Ok(written) => job_progress.add(written),
                Err(e) => warn!("Failed {job_name} operation: {e}"),
            }

            job_barrier.complete();
        });
    }

    barrier.wait();
    progress.finish(name);

    Ok(())
}

fn create_output(path: &Path, size: u64) -> io::Result<PSeekFile> {
    let output = File::create(path).map(PSeekFile::new)?;
    output.set_len(size)?;
    Ok(output)
}

/// Read one operation's source window from the data-blob region. Operations
/// without source data return an empty buffer.
fn read_operation_data<R: ReadAt>(
    reader: &mut CursorReader<&R>,
    blob_offset: u64,
    op: &InstallOperation,
) -> Result<Vec<u8>> {
    use mod_InstallOperation::Type;

    match op.type_pb {
        Type::REPLACE | Type::REPLACE_BZ | Type::REPLACE_XZ => {}
        _ => return Ok(Vec::new()),
    }

    let data_offset = op.data_offset.ok_or(Error::MissingField("data_offset"))?;
    let data_length = op
        .data_length
        .ok_or(Error::MissingField("data_length"))?
        .to_usize()
        .ok_or(Error::IntegerTooLarge("data_length"))?;

    let offset = blob_offset
        .checked_add(data_offset)
        .ok_or(Error::IntegerTooLarge("data_offset"))?;

    reader.seek(SeekFrom::Start(offset))?;

    // The whole window must be read; a short read would corrupt the image.
    let mut data = vec![0u8; data_length];
    reader.read_exact(&mut data)?;

    Ok(data)
}

fn output_offset(op: &InstallOperation, block_size: u32) -> Result<u64> {
    let extent = op
        .dst_extents
        .first()
        .ok_or(Error::MissingField("dst_extents"))?;
    let start_block = extent
        .start_block
        .ok_or(Error::MissingField("start_block"))?;

    start_block
        .checked_mul(block_size.into())
        .ok_or(Error::IntegerTooLarge("out_offset"))
}

/// Apply one install operation to the output image. Returns the number of
/// bytes placed.
///
/// Compressed operations stream their output contiguously from the first
/// extent; the manifest guarantees that a single decompressed stream
/// spanning multiple extents has contiguous extents. ZERO operations handle
/// each extent independently.
fn apply_operation(
    output: &PSeekFile,
    block_size: u32,
    op: &InstallOperation,
    data: &[u8],
) -> Result<u64> {
    use mod_InstallOperation::Type;

    match op.type_pb {
        Type::REPLACE => {
            let offset = output_offset(op, block_size)?;
            output.write_all_at(data, offset)?;

            Ok(data.len() as u64)
        }
        Type::REPLACE_BZ => {
            let offset = output_offset(op, block_size)?;
            let writer = CursorWriter::new(output, offset);

            let mut decoder = BzDecoder::new(writer);
            decoder
                .write_all(data)
                .map_err(|e| Error::Codec("bzip2", e))?;
            let writer = decoder.finish().map_err(|e| Error::Codec("bzip2", e))?;

            Ok(writer.position() - offset)
        }
        Type::REPLACE_XZ => {
            let offset = output_offset(op, block_size)?;
            let writer = CursorWriter::new(output, offset);

            let mut decoder = XzDecoder::new(writer);
            decoder.write_all(data).map_err(|e| Error::Codec("xz", e))?;
            let writer = decoder.finish().map_err(|e| Error::Codec("xz", e))?;

            Ok(writer.position() - offset)
        }
        Type::ZERO => {
            let mut written = 0;

            for extent in &op.dst_extents {
                let start_block = extent
                    .start_block
                    .ok_or(Error::MissingField("start_block"))?;
                let num_blocks = extent.num_blocks.ok_or(Error::MissingField("num_blocks"))?;

                let offset = start_block
                    .checked_mul(block_size.into())
                    .ok_or(Error::IntegerTooLarge("out_offset"))?;
                let length = num_blocks
                    .checked_mul(block_size.into())
                    .ok_or(Error::IntegerTooLarge("out_data_length"))?;

                output.write_zeros_at(length, offset)?;
                written += length;
            }

            Ok(written)
        }
        other => Err(Error::UnsupportedOperation(other)),
    }
}
