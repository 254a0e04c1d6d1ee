// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

pub mod address;
pub mod cid;
pub mod units;

pub use address::{parse_address, parse_miner_id, Network};
pub use cid::{format_for_network, is_valid_cid, parse_cid, to_v0, to_v1, verify_block};
pub use units::{atto_to_fil, fil_to_atto, padded_piece_size};
