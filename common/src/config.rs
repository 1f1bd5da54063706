//! Configuration types for transfer and output settings

/// Size of a single read/write on a portal stream (bytes)
pub const TRANS_BUF_SZ: usize = 4 * 1024 * 1024;

/// Upper bound on the number of parallel portal workers for one transfer
pub const MAX_NUM_CONFIG_TRAN_THR: usize = 16;

/// Transfers smaller than this are never checkpointed (bytes)
pub const MIN_RESTART_SIZE: u64 = 32 * 1024 * 1024;

/// Bytes written across all workers between two checkpoint flushes
pub const RESTART_FILE_UPDATE_SIZE: u64 = 10 * 1024 * 1024;

/// Largest payload announced by a single DATA header on the serving side (bytes)
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Settings for the parallel portal transfer
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Size of each read/write on a portal stream; with encryption this is also the
    /// plaintext size of one encrypted chunk
    pub trans_buf_size: usize,
    /// Largest length the serving side announces in one DATA header
    pub chunk_size: u64,
    /// Maximum number of portal workers for one transfer
    pub max_threads: usize,
    /// Minimum object size for which a checkpoint is kept
    pub min_restart_size: u64,
    /// Cumulative bytes between checkpoint flushes
    pub restart_flush_threshold: u64,
    /// Timeout for establishing a portal connection
    pub connect_timeout: std::time::Duration,
    /// Timeout for a single read or write on a portal connection
    pub io_timeout: std::time::Duration,
    /// Socket send buffer size (None = OS default)
    pub tcp_send_buffer: Option<usize>,
    /// Socket receive buffer size (None = OS default)
    pub tcp_recv_buffer: Option<usize>,
    /// Port ranges for portal listeners, e.g. "20000-20199" (None = any port)
    pub port_ranges: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            trans_buf_size: TRANS_BUF_SZ,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_threads: MAX_NUM_CONFIG_TRAN_THR,
            min_restart_size: MIN_RESTART_SIZE,
            restart_flush_threshold: RESTART_FILE_UPDATE_SIZE,
            connect_timeout: std::time::Duration::from_secs(30),
            io_timeout: std::time::Duration::from_secs(600),
            tcp_send_buffer: None,
            tcp_recv_buffer: None,
            port_ranges: None,
        }
    }
}

impl TransferConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.trans_buf_size == 0 {
            return Err("trans_buf_size must be greater than zero".to_string());
        }
        if self.trans_buf_size > u32::MAX as usize / 2 {
            return Err(format!(
                "trans_buf_size {} does not fit an encrypted chunk length prefix",
                self.trans_buf_size
            ));
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be greater than zero".to_string());
        }
        if self.max_threads == 0 || self.max_threads > MAX_NUM_CONFIG_TRAN_THR {
            return Err(format!(
                "max_threads must be between 1 and {MAX_NUM_CONFIG_TRAN_THR}, got {}",
                self.max_threads
            ));
        }
        if self.restart_flush_threshold == 0 {
            return Err("restart_flush_threshold must be greater than zero".to_string());
        }
        if self.connect_timeout.is_zero() || self.io_timeout.is_zero() {
            return Err(format!(
                "timeouts must be non-zero (connect: {}, io: {})",
                humantime::format_duration(self.connect_timeout),
                humantime::format_duration(self.io_timeout)
            ));
        }
        Ok(())
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress all log output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transfer_config_is_valid() {
        assert!(TransferConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_thread_bound_above_cap() {
        let config = TransferConfig {
            max_threads: MAX_NUM_CONFIG_TRAN_THR + 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("max_threads"), "{err}");
    }

    #[test]
    fn rejects_zero_sizes_and_timeouts() {
        let config = TransferConfig {
            trans_buf_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = TransferConfig {
            io_timeout: std::time::Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("timeouts"));
    }
}
