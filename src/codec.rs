//! Framing codec: the fixed-width header plus the four-part frame
//! (structured body, error blob, binary blob) every exchange uses.
//!
//! Header layout, all integers big-endian:
//!
//! ```text
//! [tag_len: u8][tag: ascii][msg_len: u32][err_len: u32][bs_len: u32][int_info: i32]
//! ```

use std::io::{Read, Write};

use crate::error::{IrodsError, Result};
use crate::tag::Tag;

/// Header type tags
pub mod msg_type {
    pub const RODS_CONNECT: &str = "RODS_CONNECT";
    pub const RODS_CS_NEG: &str = "RODS_CS_NEG_T";
    pub const RODS_VERSION: &str = "RODS_VERSION";
    pub const RODS_API_REQ: &str = "RODS_API_REQ";
    pub const RODS_API_REPLY: &str = "RODS_API_REPLY";
    pub const RODS_DISCONNECT: &str = "RODS_DISCONNECT";
    /// One-way envelope carrying cipher parameters and key material,
    /// sent immediately after a TLS upgrade
    pub const RODS_ENCRYPT: &str = "RODS_ENCRYPT";
}

/// Cap on the structured body and error parts. Bulk data rides the bs
/// part, which has its own cap.
pub const MAX_MSG_LEN: u32 = 32 * 1024 * 1024;
/// Cap on one in-band binary blob
pub const MAX_BS_LEN: u32 = 1024 * 1024 * 1024;
const MAX_TYPE_TAG_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: String,
    pub msg_len: u32,
    pub err_len: u32,
    pub bs_len: u32,
    /// API number on requests, signed status on replies
    pub int_info: i32,
}

impl FrameHeader {
    pub fn encode(&self) -> Vec<u8> {
        let tag = self.msg_type.as_bytes();
        debug_assert!(tag.len() <= MAX_TYPE_TAG_LEN);
        let mut buf = Vec::with_capacity(1 + tag.len() + 16);
        buf.push(tag.len() as u8);
        buf.extend_from_slice(tag);
        buf.extend_from_slice(&self.msg_len.to_be_bytes());
        buf.extend_from_slice(&self.err_len.to_be_bytes());
        buf.extend_from_slice(&self.bs_len.to_be_bytes());
        buf.extend_from_slice(&self.int_info.to_be_bytes());
        buf
    }

    pub fn read<R: Read>(r: &mut R) -> Result<FrameHeader> {
        let mut tag_len = [0u8; 1];
        read_exact_framed(r, &mut tag_len)?;
        let tag_len = tag_len[0] as usize;
        if tag_len == 0 || tag_len > MAX_TYPE_TAG_LEN {
            return Err(IrodsError::WireFormat(format!(
                "header type tag length {} out of range",
                tag_len
            )));
        }
        let mut tag = vec![0u8; tag_len];
        read_exact_framed(r, &mut tag)?;
        let msg_type = String::from_utf8(tag)
            .map_err(|_| IrodsError::WireFormat("header type tag is not utf-8".into()))?;

        let mut rest = [0u8; 16];
        read_exact_framed(r, &mut rest)?;
        let msg_len = u32::from_be_bytes(rest[0..4].try_into().unwrap());
        let err_len = u32::from_be_bytes(rest[4..8].try_into().unwrap());
        let bs_len = u32::from_be_bytes(rest[8..12].try_into().unwrap());
        let int_info = i32::from_be_bytes(rest[12..16].try_into().unwrap());

        if msg_len > MAX_MSG_LEN || err_len > MAX_MSG_LEN {
            return Err(IrodsError::WireFormat(format!(
                "header length overflow: msg {} err {}",
                msg_len, err_len
            )));
        }
        if bs_len > MAX_BS_LEN {
            return Err(IrodsError::WireFormat(format!(
                "binary blob length overflow: {}",
                bs_len
            )));
        }
        Ok(FrameHeader {
            msg_type,
            msg_len,
            err_len,
            bs_len,
            int_info,
        })
    }
}

/// A fully-read frame. `body` is absent when msg_len was zero.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: String,
    pub int_info: i32,
    pub body: Option<Tag>,
    pub error: Vec<u8>,
    pub bs: Vec<u8>,
}

/// Truncation inside a frame is a codec fault, not a transport one
fn read_exact_framed<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            IrodsError::WireFormat(format!("truncated frame: {}", e))
        }
        _ => IrodsError::from(e),
    })
}

/// Write a complete frame: header, rendered body, no error part, and
/// an optional in-band blob.
pub fn write_frame<W: Write>(
    w: &mut W,
    msg_type: &str,
    int_info: i32,
    body: Option<&Tag>,
    bs: &[u8],
) -> Result<()> {
    let rendered = body.map(Tag::render).unwrap_or_default();
    if rendered.len() as u64 > u64::from(MAX_MSG_LEN) {
        return Err(IrodsError::WireFormat(format!(
            "message body too large: {} bytes",
            rendered.len()
        )));
    }
    if bs.len() as u64 > u64::from(MAX_BS_LEN) {
        return Err(IrodsError::WireFormat(format!(
            "binary blob too large: {} bytes",
            bs.len()
        )));
    }
    let header = FrameHeader {
        msg_type: msg_type.to_string(),
        msg_len: rendered.len() as u32,
        err_len: 0,
        bs_len: bs.len() as u32,
        int_info,
    };
    w.write_all(&header.encode())?;
    w.write_all(rendered.as_bytes())?;
    w.write_all(bs)?;
    w.flush()?;
    Ok(())
}

/// Write a frame whose binary blob is streamed from `reader` rather
/// than held in memory. Exactly `bs_len` bytes are copied.
pub fn write_frame_streaming<W: Write, R: Read>(
    w: &mut W,
    msg_type: &str,
    int_info: i32,
    body: Option<&Tag>,
    bs_len: u64,
    reader: &mut R,
    copy_buf: &mut [u8],
) -> Result<()> {
    if bs_len > u64::from(MAX_BS_LEN) {
        return Err(IrodsError::WireFormat(format!(
            "binary blob too large: {} bytes",
            bs_len
        )));
    }
    let rendered = body.map(Tag::render).unwrap_or_default();
    let header = FrameHeader {
        msg_type: msg_type.to_string(),
        msg_len: rendered.len() as u32,
        err_len: 0,
        bs_len: bs_len as u32,
        int_info,
    };
    w.write_all(&header.encode())?;
    w.write_all(rendered.as_bytes())?;
    let mut remaining = bs_len;
    while remaining > 0 {
        let want = remaining.min(copy_buf.len() as u64) as usize;
        let n = reader.read(&mut copy_buf[..want])?;
        if n == 0 {
            return Err(IrodsError::WireFormat(format!(
                "blob source ended {} bytes early",
                remaining
            )));
        }
        w.write_all(&copy_buf[..n])?;
        remaining -= n as u64;
    }
    w.flush()?;
    Ok(())
}

/// Read a complete frame, parsing the body and buffering both blobs
pub fn read_frame<R: Read>(r: &mut R) -> Result<Frame> {
    let header = FrameHeader::read(r)?;
    let body = read_body(r, &header)?;
    let error = read_blob(r, header.err_len)?;
    let bs = read_blob(r, header.bs_len)?;
    Ok(Frame {
        msg_type: header.msg_type,
        int_info: header.int_info,
        body,
        error,
        bs,
    })
}

/// Read a frame's header, body and error part, leaving the binary blob
/// on the socket for the caller to stream. Returns the parsed parts
/// and the pending blob length.
pub fn read_frame_streaming<R: Read>(r: &mut R) -> Result<(Frame, u64)> {
    let header = FrameHeader::read(r)?;
    let body = read_body(r, &header)?;
    let error = read_blob(r, header.err_len)?;
    let bs_len = u64::from(header.bs_len);
    Ok((
        Frame {
            msg_type: header.msg_type,
            int_info: header.int_info,
            body,
            error,
            bs: Vec::new(),
        },
        bs_len,
    ))
}

/// Copy a pending binary blob of `bs_len` bytes into `writer`
pub fn copy_blob<R: Read, W: Write>(
    r: &mut R,
    writer: &mut W,
    bs_len: u64,
    copy_buf: &mut [u8],
) -> Result<u64> {
    let mut remaining = bs_len;
    while remaining > 0 {
        let want = remaining.min(copy_buf.len() as u64) as usize;
        read_exact_framed(r, &mut copy_buf[..want])?;
        writer.write_all(&copy_buf[..want])?;
        remaining -= want as u64;
    }
    Ok(bs_len)
}

fn read_body<R: Read>(r: &mut R, header: &FrameHeader) -> Result<Option<Tag>> {
    if header.msg_len == 0 {
        return Ok(None);
    }
    let mut buf = vec![0u8; header.msg_len as usize];
    read_exact_framed(r, &mut buf)?;
    let text = String::from_utf8(buf)
        .map_err(|_| IrodsError::WireFormat("message body is not utf-8".into()))?;
    Ok(Some(Tag::parse(&text)?))
}

fn read_blob<R: Read>(r: &mut R, len: u32) -> Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; len as usize];
    read_exact_framed(r, &mut buf)?;
    Ok(buf)
}
