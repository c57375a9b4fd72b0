//! Transfer control block, options, and the status listener surface.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PipelineConfiguration;

/// What kind of bulk movement a status event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Put,
    Get,
    Copy,
    Replicate,
    Move,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferKind::Put => "put",
            TransferKind::Get => "get",
            TransferKind::Copy => "copy",
            TransferKind::Replicate => "replicate",
            TransferKind::Move => "move",
        };
        f.write_str(s)
    }
}

/// Phase of a transfer status event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    OverallInitiation,
    InProgress,
    OverallCompletion,
    Failure,
    Success,
    Restarting,
    Cancelled,
}

/// How the orchestrator reacts to a per-file failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Report through the listener, bump the error counter, continue
    #[default]
    ContinueOnError,
    /// Abort the whole transfer at the first per-file failure
    FailFast,
}

/// Options for one transfer. Captured into the control block at
/// creation and immutable afterwards.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub force_overwrite: bool,
    pub compute_checksum: bool,
    pub verify_checksum: bool,
    pub parallel_threads: u32,
    pub allow_redirect: bool,
    pub error_policy: ErrorPolicy,
    /// Consult and maintain the per-file restart journal
    pub restartable: bool,
}

impl TransferOptions {
    pub fn from_pipeline(config: &PipelineConfiguration) -> TransferOptions {
        TransferOptions {
            force_overwrite: false,
            compute_checksum: false,
            verify_checksum: false,
            parallel_threads: config.parallel_thread_count,
            allow_redirect: true,
            error_policy: ErrorPolicy::ContinueOnError,
            restartable: false,
        }
    }
}

/// Snapshot published to the status listener
#[derive(Debug, Clone)]
pub struct TransferStatus {
    pub kind: TransferKind,
    pub source: String,
    pub target: String,
    pub target_resource: String,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub files_transferred: u64,
    pub files_total: u64,
    pub phase: TransferPhase,
    pub host: String,
    pub zone: String,
    pub failure: Option<String>,
}

/// Callback surface for transfer progress. Invoked from whichever
/// thread observes the event, so implementations must tolerate
/// concurrent calls.
pub trait TransferStatusListener: Send + Sync {
    fn status(&self, _status: &TransferStatus) {}
}

pub struct NoopListener;
impl TransferStatusListener for NoopListener {}

/// Shared listener handle passed through the orchestrator and its
/// parallel workers
pub type ListenerRef = Arc<dyn TransferStatusListener>;

/// Collects every event it sees; test helper and a convenient example
/// implementation.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<TransferStatus>>,
}

impl RecordingListener {
    pub fn new() -> RecordingListener {
        RecordingListener::default()
    }

    pub fn events(&self) -> Vec<TransferStatus> {
        self.events.lock().clone()
    }
}

impl TransferStatusListener for RecordingListener {
    fn status(&self, status: &TransferStatus) {
        self.events.lock().push(status.clone());
    }
}

/// Shared mutable state for one transfer: cancellation flag, counters,
/// options. The orchestrator and its parallel workers update the
/// counters; the initiating caller may read them or request
/// cancellation at any time from any thread.
pub struct TransferControlBlock {
    options: TransferOptions,
    cancelled: AtomicBool,
    files_total: AtomicU64,
    files_transferred: AtomicU64,
    files_skipped: AtomicU64,
    bytes_total: AtomicU64,
    bytes_transferred: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl TransferControlBlock {
    pub fn new(options: TransferOptions) -> Arc<TransferControlBlock> {
        Arc::new(TransferControlBlock {
            options,
            cancelled: AtomicBool::new(false),
            files_total: AtomicU64::new(0),
            files_transferred: AtomicU64::new(0),
            files_skipped: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
        })
    }

    pub fn defaults(config: &PipelineConfiguration) -> Arc<TransferControlBlock> {
        TransferControlBlock::new(TransferOptions::from_pipeline(config))
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_totals(&self, files: u64, bytes: u64) {
        self.files_total.store(files, Ordering::SeqCst);
        self.bytes_total.store(bytes, Ordering::SeqCst);
    }

    pub fn add_file(&self) -> u64 {
        self.files_transferred.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn add_skipped_file(&self) -> u64 {
        self.files_skipped.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn add_bytes(&self, n: u64) -> u64 {
        self.bytes_transferred.fetch_add(n, Ordering::SeqCst) + n
    }

    pub fn record_error(&self, message: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock() = Some(message.to_string());
    }

    pub fn files_total(&self) -> u64 {
        self.files_total.load(Ordering::SeqCst)
    }

    pub fn files_transferred(&self) -> u64 {
        self.files_transferred.load(Ordering::SeqCst)
    }

    pub fn files_skipped(&self) -> u64 {
        self.files_skipped.load(Ordering::SeqCst)
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::SeqCst)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}
