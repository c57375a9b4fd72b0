//! Pipeline configuration: the immutable tuning snapshot captured at
//! connection birth

use std::time::Duration;

/// Cipher selection for the parallel-stream bulk cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    /// AES-256 in CBC mode with PKCS#7 padding
    Aes256Cbc,
}

impl EncryptionAlgorithm {
    /// Token exchanged in the negotiation envelope
    pub fn token(self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes256Cbc => "AES-256-CBC",
        }
    }

    pub fn from_token(s: &str) -> Option<EncryptionAlgorithm> {
        match s {
            "AES-256-CBC" => Some(EncryptionAlgorithm::Aes256Cbc),
            _ => None,
        }
    }
}

/// Options controlling the behavior of the I/O pipeline, captured from
/// the prevailing client properties when a connection is created and
/// immutable afterwards. Sizes are bytes, timeouts seconds.
#[derive(Debug, Clone)]
pub struct PipelineConfiguration {
    pub socket_timeout: u32,
    pub parallel_socket_timeout: u32,
    pub internal_input_stream_buffer_size: usize,
    pub internal_output_stream_buffer_size: usize,
    pub internal_cache_buffer_size: usize,
    pub send_input_stream_buffer_size: usize,
    pub local_file_input_stream_buffer_size: usize,
    pub local_file_output_stream_buffer_size: usize,
    pub input_to_output_copy_buffer_byte_size: usize,
    /// Files at or under this length move in-band; larger files go
    /// through the parallel portal
    pub parallel_threshold: u64,
    /// Parallel streams requested when the portal path is taken;
    /// 0 lets the server decide
    pub parallel_thread_count: u32,
    pub encryption_algorithm: EncryptionAlgorithm,
    pub encryption_key_size: usize,
    pub encryption_salt_size: usize,
    pub encryption_hash_rounds: u32,
    /// Text encoding for string fields; the wire is always utf-8
    pub default_encoding: &'static str,
}

impl Default for PipelineConfiguration {
    fn default() -> Self {
        PipelineConfiguration {
            socket_timeout: 120,
            parallel_socket_timeout: 120,
            internal_input_stream_buffer_size: 64 * 1024,
            internal_output_stream_buffer_size: 64 * 1024,
            internal_cache_buffer_size: 2 * 1024 * 1024,
            send_input_stream_buffer_size: 1024 * 1024,
            local_file_input_stream_buffer_size: 1024 * 1024,
            local_file_output_stream_buffer_size: 1024 * 1024,
            input_to_output_copy_buffer_byte_size: 4 * 1024 * 1024,
            parallel_threshold: 32 * 1024 * 1024,
            parallel_thread_count: 4,
            encryption_algorithm: EncryptionAlgorithm::Aes256Cbc,
            encryption_key_size: 32,
            encryption_salt_size: 8,
            encryption_hash_rounds: 16,
            default_encoding: "utf-8",
        }
    }
}

impl PipelineConfiguration {
    pub fn socket_timeout_duration(&self) -> Option<Duration> {
        (self.socket_timeout > 0).then(|| Duration::from_secs(u64::from(self.socket_timeout)))
    }

    pub fn parallel_socket_timeout_duration(&self) -> Option<Duration> {
        (self.parallel_socket_timeout > 0)
            .then(|| Duration::from_secs(u64::from(self.parallel_socket_timeout)))
    }

    pub fn with_socket_timeout(mut self, seconds: u32) -> Self {
        self.socket_timeout = seconds;
        self
    }

    pub fn with_parallel_socket_timeout(mut self, seconds: u32) -> Self {
        self.parallel_socket_timeout = seconds;
        self
    }

    pub fn with_parallel_threshold(mut self, bytes: u64) -> Self {
        self.parallel_threshold = bytes;
        self
    }

    pub fn with_parallel_thread_count(mut self, n: u32) -> Self {
        self.parallel_thread_count = n;
        self
    }
}
