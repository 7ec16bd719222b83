// SPDX-License-Identifier: GPL-3.0-only

use std::{env, ffi::OsStr, fs, io, path::Path};

use pb_rs::{types::FileDescriptor, ConfigBuilder};

fn main() {
    let out_dir = Path::new(&env::var("OUT_DIR").unwrap()).join("protobuf");
    let in_dir = Path::new(&env::var("CARGO_MANIFEST_DIR").unwrap()).join("protobuf");

    println!("cargo:rerun-if-changed={}", in_dir.to_str().unwrap());

    let mut protos = Vec::new();

    for entry in fs::read_dir(&in_dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension() == Some(OsStr::new("proto")) {
            println!("cargo:rerun-if-changed={}", path.to_str().unwrap());
            protos.push(path);
        }
    }

    match fs::remove_dir_all(&out_dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        r => r.unwrap(),
    }

    fs::create_dir_all(&out_dir).unwrap();

    let config = ConfigBuilder::new(&protos, None, Some(&out_dir), &[in_dir])
        .unwrap()
        .dont_use_cow(true)
        .nostd(true)
        .build();

    FileDescriptor::run(&config).unwrap();

    // pb-rs emits inner attributes (`#![allow(...)]`) at the top of each
    // generated file. These are included into a `mod { ... }` block via
    // `include!`, where inner attributes are not permitted. Strip them;
    // the equivalent allows are applied as outer attributes at the
    // `include!` call site instead.
    for entry in fs::read_dir(&out_dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension() == Some(OsStr::new("rs")) {
            let contents = fs::read_to_string(&path).unwrap();
            let filtered: String = contents
                .lines()
                .filter(|line| !line.trim_start().starts_with("#!["))
                .map(|line| format!("{line}\n"))
                .collect();
            fs::write(&path, filtered).unwrap();
        }
    }
}
