//! Checksum utilities for transfer verification

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Digest algorithms the catalog understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumType {
    /// Catalog default; what DataObjChksum returns
    #[default]
    Md5,
    Sha256,
}

/// Hex digest of a byte slice
pub fn digest_bytes(data: &[u8], checksum_type: ChecksumType) -> String {
    match checksum_type {
        ChecksumType::Md5 => hex(&md5::compute(data).0),
        ChecksumType::Sha256 => {
            let mut h = Sha256::new();
            h.update(data);
            hex(&h.finalize())
        }
    }
}

/// Hex digest of a local file, streamed so large files never sit in
/// memory
pub fn digest_file(path: &Path, checksum_type: ChecksumType) -> Result<String> {
    let mut f = File::open(path)?;
    let mut buf = vec![0u8; 1024 * 1024];
    match checksum_type {
        ChecksumType::Md5 => {
            let mut ctx = md5::Context::new();
            loop {
                let n = f.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                ctx.consume(&buf[..n]);
            }
            Ok(hex(&ctx.compute().0))
        }
        ChecksumType::Sha256 => {
            let mut h = Sha256::new();
            loop {
                let n = f.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                h.update(&buf[..n]);
            }
            Ok(hex(&h.finalize()))
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
