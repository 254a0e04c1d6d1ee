// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! Content-addressed archives: deterministic packing and verified parsing

pub mod dag;
pub mod format;
pub mod packer;
pub mod parser;
pub mod store;

pub use format::{CarBlock, CarHeader};
pub use packer::{CarPacker, PackInput, PackedCar};
pub use parser::{
    extract_blocks, get_root_cid, list_blocks, parse_car, unpack, verify_integrity, BlockInfo,
    CarArchive, ExtractedEntry, ParseOptions,
};
pub use store::CarStore;
