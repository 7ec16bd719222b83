// SPDX-License-Identifier: GPL-3.0-only

//! Extraction engine for Android A/B OTA payloads.
//!
//! A `payload.bin` file packages one or more partition images together with
//! a protobuf manifest describing how to materialize them. This crate parses
//! the payload wire format and reconstructs the partition images from any of
//! three sources: a raw payload file, an OTA zip containing the payload, or
//! an HTTP URL pointing at an OTA zip on a server that honors byte-range
//! requests.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic.

// We use pb-rs' nostd mode. See build.rs.
extern crate alloc;

pub mod cli;
pub mod format;
pub mod http;
pub mod pool;
pub mod progress;
pub mod protobuf;
pub mod stream;
pub mod util;
