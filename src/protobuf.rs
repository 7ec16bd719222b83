// SPDX-License-Identifier: GPL-3.0-only

#![allow(clippy::all)]

#[allow(non_snake_case)]
#[allow(non_upper_case_globals)]
#[allow(non_camel_case_types)]
#[allow(unused_imports)]
#[allow(unknown_lints)]
pub mod chromeos_update_engine {
    include!(concat!(env!("OUT_DIR"), "/protobuf/chromeos_update_engine.rs"));
}
