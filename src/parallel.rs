//! Parallel transfer engine: N concurrent data streams against the
//! host/port endpoints handed out by the server, with offset-addressed
//! local file I/O and optional per-stream AES encryption.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::PipelineConfiguration;
use crate::control::{TransferControlBlock, TransferPhase, TransferStatus, TransferStatusListener};
use crate::error::{IrodsError, Result};
use crate::negotiation::NegotiatedSession;
use crate::packinstr::{opr, PortalEndpoint, PortalOprOut};
use crate::secure::AesCipher;

/// Chunk header on a data socket: operation, flags, offset, length,
/// all big-endian. `DONE_OPR` terminates a stream.
const CHUNK_HEADER_LEN: usize = 4 + 4 + 8 + 8;

struct ChunkHeader {
    opr: i32,
    flags: i32,
    offset: i64,
    length: i64,
}

impl ChunkHeader {
    fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut buf = [0u8; CHUNK_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.opr.to_be_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_be_bytes());
        buf[16..24].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8; CHUNK_HEADER_LEN]) -> ChunkHeader {
        ChunkHeader {
            opr: i32::from_be_bytes(buf[0..4].try_into().unwrap()),
            flags: i32::from_be_bytes(buf[4..8].try_into().unwrap()),
            offset: i64::from_be_bytes(buf[8..16].try_into().unwrap()),
            length: i64::from_be_bytes(buf[16..24].try_into().unwrap()),
        }
    }

    fn done() -> ChunkHeader {
        ChunkHeader {
            opr: opr::DONE_OPR,
            flags: 0,
            offset: 0,
            length: 0,
        }
    }
}

/// One contiguous span of the file assigned to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    offset: u64,
    length: u64,
}

/// Partition `size` bytes into `n` contiguous spans; the last span
/// absorbs the remainder.
fn partition(size: u64, n: usize) -> Vec<Span> {
    debug_assert!(n > 0);
    let n = n as u64;
    let base = size / n;
    (0..n)
        .map(|i| {
            let offset = i * base;
            let length = if i == n - 1 { size - offset } else { base };
            Span { offset, length }
        })
        .collect()
}

/// Everything a worker needs, shared read-only across the pool
struct JobShared {
    config: PipelineConfiguration,
    session: NegotiatedSession,
    local_path: PathBuf,
    tcb: Arc<TransferControlBlock>,
    listener: Option<Arc<dyn TransferStatusListener>>,
    template: TransferStatus,
}

impl JobShared {
    fn cipher(&self) -> Result<Option<AesCipher>> {
        if !self.session.use_ssl {
            return Ok(None);
        }
        AesCipher::new(&self.config, &self.session.shared_secret, &self.session.salt).map(Some)
    }

    /// Progress fires at most once per buffer boundary
    fn report_progress(&self) {
        if let Some(listener) = &self.listener {
            let mut status = self.template.clone();
            status.phase = TransferPhase::InProgress;
            status.bytes_transferred = self.tcb.bytes_transferred();
            status.files_transferred = self.tcb.files_transferred();
            listener.status(&status);
        }
    }
}

/// Stream one file up through the portal endpoints. The caller owns
/// the OprComplete handshake afterwards.
pub(crate) fn parallel_put(
    config: &PipelineConfiguration,
    session: &NegotiatedSession,
    portal: &PortalOprOut,
    local_path: &Path,
    size: u64,
    tcb: &Arc<TransferControlBlock>,
    listener: Option<&Arc<dyn TransferStatusListener>>,
    template: &TransferStatus,
) -> Result<()> {
    run_pool(
        config,
        session,
        portal,
        local_path,
        size,
        tcb,
        listener,
        template,
        Direction::Put,
    )
}

/// Stream one file down through the portal endpoints into
/// `local_path`, which is sized and written at declared offsets.
pub(crate) fn parallel_get(
    config: &PipelineConfiguration,
    session: &NegotiatedSession,
    portal: &PortalOprOut,
    local_path: &Path,
    size: u64,
    tcb: &Arc<TransferControlBlock>,
    listener: Option<&Arc<dyn TransferStatusListener>>,
    template: &TransferStatus,
) -> Result<()> {
    // Pre-size the target so offset writes from any stream land
    {
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(local_path)?;
        f.set_len(size)?;
    }
    run_pool(
        config,
        session,
        portal,
        local_path,
        size,
        tcb,
        listener,
        template,
        Direction::Get,
    )
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Put,
    Get,
}

#[allow(clippy::too_many_arguments)]
fn run_pool(
    config: &PipelineConfiguration,
    session: &NegotiatedSession,
    portal: &PortalOprOut,
    local_path: &Path,
    size: u64,
    tcb: &Arc<TransferControlBlock>,
    listener: Option<&Arc<dyn TransferStatusListener>>,
    template: &TransferStatus,
    direction: Direction,
) -> Result<()> {
    if portal.ports.is_empty() {
        return Err(IrodsError::Protocol("portal reply carries no endpoints".into()));
    }
    let shared = JobShared {
        config: config.clone(),
        session: session.clone(),
        local_path: local_path.to_path_buf(),
        tcb: Arc::clone(tcb),
        listener: listener.cloned(),
        template: template.clone(),
    };
    let spans = partition(size, portal.ports.len());
    debug!(
        streams = portal.ports.len(),
        size, "parallel {} via portal", if direction == Direction::Put { "put" } else { "get" }
    );

    let mut failures: Vec<IrodsError> = Vec::new();
    thread::scope(|scope| {
        let mut handles = Vec::new();
        for (endpoint, span) in portal.ports.iter().zip(spans.iter()) {
            let shared = &shared;
            handles.push(scope.spawn(move || {
                let result = match direction {
                    Direction::Put => put_worker(shared, endpoint, *span),
                    Direction::Get => get_worker(shared, endpoint, *span),
                };
                if let Err(e) = &result {
                    // Bring the peers down at their next frame boundary
                    if !matches!(e, IrodsError::Cancelled) {
                        shared.tcb.record_error(&e.to_string());
                    }
                    shared.tcb.cancel();
                }
                result
            }));
        }
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e),
                Err(_) => failures.push(IrodsError::Internal("transfer worker panicked".into())),
            }
        }
    });

    if failures.is_empty() {
        return Ok(());
    }
    // One primary error surfaces; peers that merely observed the
    // cancellation it triggered ride along
    let mut real: Vec<IrodsError> = failures
        .into_iter()
        .filter(|e| !matches!(e, IrodsError::Cancelled))
        .collect();
    match real.len() {
        0 => Err(IrodsError::Cancelled),
        1 => {
            let primary = real.pop().expect("one failure");
            warn!("parallel transfer failed: {}", primary);
            Err(primary)
        }
        _ => {
            let primary = real.remove(0);
            let secondary: Vec<String> = real.iter().map(|e| e.to_string()).collect();
            let message = format!("{} (also: {})", primary, secondary.join("; "));
            warn!(streams = secondary.len() + 1, "parallel transfer failed: {}", message);
            Err(IrodsError::NetworkFailure(message))
        }
    }
}

fn open_data_socket(
    shared: &JobShared,
    endpoint: &PortalEndpoint,
    direction: Direction,
) -> Result<TcpStream> {
    let addr = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            IrodsError::NetworkFailure(format!(
                "cannot resolve data endpoint {}:{}",
                endpoint.host, endpoint.port
            ))
        })?;
    let timeout = shared
        .config
        .parallel_socket_timeout_duration()
        .unwrap_or(Duration::from_secs(30));
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(shared.config.parallel_socket_timeout_duration())?;
    stream.set_write_timeout(shared.config.parallel_socket_timeout_duration())?;

    // Cookie plus direction identify the stream to the server
    let mut hello = [0u8; 8];
    hello[0..4].copy_from_slice(&endpoint.cookie.to_be_bytes());
    let dir = match direction {
        Direction::Put => opr::PUT_OPR,
        Direction::Get => opr::GET_OPR,
    };
    hello[4..8].copy_from_slice(&dir.to_be_bytes());
    stream.write_all(&hello)?;
    Ok(stream)
}

/// Send one logical message, encrypting when the session calls for it
fn send_message(
    stream: &mut TcpStream,
    cipher: &Option<AesCipher>,
    header: &ChunkHeader,
    payload: &[u8],
) -> Result<()> {
    match cipher {
        Some(cipher) => {
            let mut plain = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
            plain.extend_from_slice(&header.encode());
            plain.extend_from_slice(payload);
            cipher.write_frame(stream, &plain)?;
        }
        None => {
            stream.write_all(&header.encode())?;
            if !payload.is_empty() {
                stream.write_all(payload)?;
            }
        }
    }
    Ok(())
}

/// Receive one logical message: header plus its payload
fn recv_message(
    stream: &mut TcpStream,
    cipher: &Option<AesCipher>,
) -> Result<(ChunkHeader, Vec<u8>)> {
    match cipher {
        Some(cipher) => {
            let plain = cipher.read_frame(stream)?;
            if plain.len() < CHUNK_HEADER_LEN {
                return Err(IrodsError::WireFormat(format!(
                    "decrypted chunk of {} bytes is shorter than its header",
                    plain.len()
                )));
            }
            let header =
                ChunkHeader::decode(&plain[..CHUNK_HEADER_LEN].try_into().unwrap());
            let payload = plain[CHUNK_HEADER_LEN..].to_vec();
            if header.opr != opr::DONE_OPR && payload.len() as i64 != header.length {
                return Err(IrodsError::WireFormat(format!(
                    "chunk header declares {} bytes, frame carries {}",
                    header.length,
                    payload.len()
                )));
            }
            Ok((header, payload))
        }
        None => {
            let mut buf = [0u8; CHUNK_HEADER_LEN];
            stream.read_exact(&mut buf)?;
            let header = ChunkHeader::decode(&buf);
            if header.opr == opr::DONE_OPR {
                return Ok((header, Vec::new()));
            }
            if header.length < 0 || header.length > i64::from(i32::MAX) {
                return Err(IrodsError::WireFormat(format!(
                    "chunk length {} out of range",
                    header.length
                )));
            }
            let mut payload = vec![0u8; header.length as usize];
            stream.read_exact(&mut payload)?;
            Ok((header, payload))
        }
    }
}

fn put_worker(shared: &JobShared, endpoint: &PortalEndpoint, span: Span) -> Result<()> {
    let cipher = shared.cipher()?;
    let mut stream = open_data_socket(shared, endpoint, Direction::Put)?;

    if span.length > 0 {
        let mut file = File::open(&shared.local_path)?;
        file.seek(SeekFrom::Start(span.offset))?;
        let mut buf = vec![0u8; shared.config.local_file_input_stream_buffer_size.max(4096)];
        let mut offset = span.offset;
        let mut remaining = span.length;
        while remaining > 0 {
            if shared.tcb.is_cancelled() {
                let _ = send_message(&mut stream, &cipher, &ChunkHeader::done(), &[]);
                return Err(IrodsError::Cancelled);
            }
            let want = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..want])?;
            let header = ChunkHeader {
                opr: opr::PUT_OPR,
                flags: 0,
                offset: offset as i64,
                length: want as i64,
            };
            send_message(&mut stream, &cipher, &header, &buf[..want])?;
            offset += want as u64;
            remaining -= want as u64;
            shared.tcb.add_bytes(want as u64);
            shared.report_progress();
        }
    }
    send_message(&mut stream, &cipher, &ChunkHeader::done(), &[])?;
    stream.flush()?;
    Ok(())
}

fn get_worker(shared: &JobShared, endpoint: &PortalEndpoint, span: Span) -> Result<()> {
    let cipher = shared.cipher()?;
    let mut stream = open_data_socket(shared, endpoint, Direction::Get)?;
    let mut file = OpenOptions::new().write(true).open(&shared.local_path)?;
    let mut received = 0u64;

    loop {
        if shared.tcb.is_cancelled() {
            return Err(IrodsError::Cancelled);
        }
        let (header, payload) = recv_message(&mut stream, &cipher)?;
        if header.opr == opr::DONE_OPR {
            break;
        }
        if header.offset < 0 {
            return Err(IrodsError::WireFormat(format!(
                "chunk offset {} out of range",
                header.offset
            )));
        }
        // Streams are independent; consistency comes from the declared
        // offsets
        file.seek(SeekFrom::Start(header.offset as u64))?;
        file.write_all(&payload)?;
        received += payload.len() as u64;
        shared.tcb.add_bytes(payload.len() as u64);
        shared.report_progress();
    }
    file.flush()?;
    if received < span.length {
        debug!(
            expected = span.length,
            received, "stream closed under its nominal span; peers may have covered the rest"
        );
    }
    Ok(())
}
