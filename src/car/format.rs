// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! CARv1 framing: `varint(len) header` followed by `varint(len) cid bytes`
//! sections.

use cid::Cid;
use serde::{Deserialize, Serialize};
use unsigned_varint::{decode, encode};

use crate::error::{VaultError, VaultResult};

pub const CAR_VERSION: u64 = 1;

/// DAG-CBOR encoded archive header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarHeader {
    pub roots: Vec<Cid>,
    pub version: u64,
}

/// A single content-addressed block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarBlock {
    pub cid: Cid,
    pub data: Vec<u8>,
}

fn write_varint(out: &mut Vec<u8>, n: u64) {
    let mut buf = encode::u64_buffer();
    out.extend_from_slice(encode::u64(n, &mut buf));
}

/// Split a varint-prefixed frame off the front of `input`
fn read_frame(input: &[u8]) -> VaultResult<(&[u8], &[u8])> {
    let (len, rest) = decode::u64(input)
        .map_err(|e| VaultError::validation(format!("bad CAR section length: {e}")))?;
    let len = usize::try_from(len)
        .map_err(|_| VaultError::validation(format!("CAR section length {len} overflows")))?;
    if len > rest.len() {
        return Err(VaultError::validation(format!(
            "truncated CAR section: declared {len} bytes, {} remain",
            rest.len()
        )));
    }
    Ok(rest.split_at(len))
}

/// Serialize roots and blocks in order
pub fn encode_car<'a>(
    roots: &[Cid],
    blocks: impl IntoIterator<Item = &'a CarBlock>,
) -> VaultResult<Vec<u8>> {
    let header = CarHeader {
        roots: roots.to_vec(),
        version: CAR_VERSION,
    };
    let header_bytes = serde_ipld_dagcbor::to_vec(&header)
        .map_err(|e| VaultError::validation(format!("encode CAR header: {e}")))?;

    let mut out = Vec::with_capacity(header_bytes.len() + 16);
    write_varint(&mut out, header_bytes.len() as u64);
    out.extend_from_slice(&header_bytes);

    for block in blocks {
        let cid_bytes = block.cid.to_bytes();
        write_varint(&mut out, (cid_bytes.len() + block.data.len()) as u64);
        out.extend_from_slice(&cid_bytes);
        out.extend_from_slice(&block.data);
    }
    Ok(out)
}

pub fn decode_header(bytes: &[u8]) -> VaultResult<(CarHeader, &[u8])> {
    let (header_bytes, rest) = read_frame(bytes)?;
    let header: CarHeader = serde_ipld_dagcbor::from_slice(header_bytes)
        .map_err(|e| VaultError::validation(format!("decode CAR header: {e}")))?;
    if header.version != CAR_VERSION {
        return Err(VaultError::validation(format!(
            "unsupported CAR version {}",
            header.version
        )));
    }
    Ok((header, rest))
}

/// Decode the header and every block section, without hash checks
pub fn decode_car(bytes: &[u8]) -> VaultResult<(CarHeader, Vec<CarBlock>)> {
    let (header, mut rest) = decode_header(bytes)?;
    let mut blocks = Vec::new();
    while !rest.is_empty() {
        let (section, tail) = read_frame(rest)?;
        let mut reader = section;
        let cid = Cid::read_bytes(&mut reader)
            .map_err(|e| VaultError::validation(format!("bad CID in CAR section: {e}")))?;
        blocks.push(CarBlock {
            cid,
            data: reader.to_vec(),
        });
        rest = tail;
    }
    Ok((header, blocks))
}
