//! Transfer checkpoints.
//!
//! A [`RestartInfo`] records, for every portal worker of one transfer, the contiguous byte range that
//! worker has moved so far. It is persisted next to the local file while the transfer runs and is
//! removed once the transfer completes. After a crash [`RestartInfo::resume`] yields the byte ranges
//! that still need to be moved.
//!
//! On disk the record is an 8-byte little-endian payload length followed by the bincode encoding of
//! [`RestartInfo`]. Any file that does not decode cleanly, or whose contents contradict the transfer
//! being resumed, is reported as [`RestartError::Corrupt`] and callers restart from zero.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

const LEN_PREFIX_SIZE: usize = std::mem::size_of::<u64>();

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("restart file {path:?} is corrupt: {reason}")]
    Corrupt {
        path: std::path::PathBuf,
        reason: String,
    },
    #[error("restart file {path:?} could not be accessed")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RestartError {
    fn corrupt(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartOperation {
    Put,
    Get,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartStatus {
    InProgress,
    Done,
}

/// Contiguous range `[offset, offset + len)` moved by one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartSegment {
    pub offset: u64,
    pub len: u64,
}

impl RestartSegment {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Account `delta` bytes moved starting at `offset`.
    ///
    /// Bytes that extend the current run are appended to it. A write anywhere else starts a new run at
    /// `offset`, which only ever under-reports progress.
    pub fn advance(&mut self, offset: u64, delta: u64) {
        if self.len == 0 || self.end() != offset {
            self.offset = offset;
            self.len = 0;
        }
        self.len += delta;
    }
}

/// One byte range that has to be moved again after an interrupted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub offset: u64,
    pub len: u64,
    /// Segment whose recorded run ends where this gap begins, if any
    pub follows_segment: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartInfo {
    pub file_name: std::path::PathBuf,
    pub obj_path: String,
    pub operation: RestartOperation,
    pub file_size: u64,
    pub status: RestartStatus,
    pub segments: Vec<RestartSegment>,
}

impl RestartInfo {
    /// Start tracking a transfer.
    ///
    /// Tracking is disabled (zero segments) unless `size` reaches `min_restart_size` and
    /// `thread_count` is within `1..=max_threads`. Segment `i` initially points at the start of the
    /// byte range worker `i` is expected to receive.
    pub fn begin(
        operation: RestartOperation,
        local_path: &std::path::Path,
        obj_path: &str,
        size: u64,
        thread_count: usize,
        policy: &RestartPolicy,
    ) -> Self {
        let enabled = size >= policy.min_restart_size
            && thread_count >= 1
            && thread_count <= policy.max_threads;
        let segments = if enabled {
            let seg_size = size / thread_count as u64;
            (0..thread_count as u64)
                .map(|i| RestartSegment {
                    offset: i * seg_size,
                    len: 0,
                })
                .collect()
        } else {
            Vec::new()
        };
        Self {
            file_name: local_path.to_path_buf(),
            obj_path: obj_path.to_string(),
            operation,
            file_size: size,
            status: RestartStatus::InProgress,
            segments,
        }
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn is_tracking(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Record that worker `thread_id` moved `delta` bytes starting at `offset`.
    pub fn record_progress(&mut self, thread_id: usize, offset: u64, delta: u64) {
        if let Some(segment) = self.segments.get_mut(thread_id) {
            segment.advance(offset, delta);
        }
    }

    /// Total bytes covered by the recorded segments.
    pub fn bytes_done(&self) -> u64 {
        self.segments.iter().map(|seg| seg.len).sum()
    }

    /// Byte ranges not yet covered by any segment, in file order.
    ///
    /// Each gap sits either before a segment's recorded offset or after the last segment's end. Their
    /// total length is `file_size` minus the bytes covered by the segments.
    pub fn resume(&self) -> Vec<Gap> {
        let mut order: Vec<usize> = (0..self.segments.len()).collect();
        order.sort_by_key(|&idx| self.segments[idx].offset);
        let mut gaps = Vec::new();
        let mut pos = 0u64;
        let mut previous = None;
        for idx in order {
            let segment = &self.segments[idx];
            let start = segment.offset.min(self.file_size);
            let end = segment.end().min(self.file_size);
            if start > pos {
                gaps.push(Gap {
                    offset: pos,
                    len: start - pos,
                    follows_segment: previous,
                });
            }
            if end > pos {
                pos = end;
                previous = Some(idx);
            }
        }
        if pos < self.file_size {
            gaps.push(Gap {
                offset: pos,
                len: self.file_size - pos,
                follows_segment: previous,
            });
        }
        gaps
    }

    /// Check that this checkpoint describes the transfer about to be resumed.
    pub fn validate_for(
        &self,
        path: &std::path::Path,
        local_path: &std::path::Path,
        obj_path: &str,
        size: u64,
    ) -> Result<(), RestartError> {
        if self.file_name != local_path {
            return Err(RestartError::corrupt(
                path,
                format!(
                    "checkpoint is for {:?}, not {:?}",
                    self.file_name, local_path
                ),
            ));
        }
        if self.obj_path != obj_path {
            return Err(RestartError::corrupt(
                path,
                format!("checkpoint is for object {}, not {obj_path}", self.obj_path),
            ));
        }
        if self.file_size != size {
            return Err(RestartError::corrupt(
                path,
                format!(
                    "checkpoint size {} does not match object size {size}",
                    self.file_size
                ),
            ));
        }
        Ok(())
    }

    fn encode(&self, path: &std::path::Path) -> Result<Vec<u8>, RestartError> {
        let payload = bincode::serialize(self)
            .map_err(|err| RestartError::corrupt(path, format!("failed to encode: {err}")))?;
        let mut buf = Vec::with_capacity(LEN_PREFIX_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    fn decode(path: &std::path::Path, buf: &[u8]) -> Result<Self, RestartError> {
        let Some((prefix, payload)) = buf.split_first_chunk::<LEN_PREFIX_SIZE>() else {
            return Err(RestartError::corrupt(
                path,
                format!("file is {} bytes, too short for a length prefix", buf.len()),
            ));
        };
        let declared = u64::from_le_bytes(*prefix);
        if declared != payload.len() as u64 {
            return Err(RestartError::corrupt(
                path,
                format!(
                    "declared payload length {declared} but found {} bytes",
                    payload.len()
                ),
            ));
        }
        let info: Self = bincode::deserialize(payload)
            .map_err(|err| RestartError::corrupt(path, format!("failed to decode: {err}")))?;
        if info.segments.len() > crate::config::MAX_NUM_CONFIG_TRAN_THR {
            return Err(RestartError::corrupt(
                path,
                format!("{} segments exceeds the worker bound", info.segments.len()),
            ));
        }
        if let Some(segment) = info
            .segments
            .iter()
            .find(|seg| seg.offset.checked_add(seg.len).is_none_or(|end| end > info.file_size))
        {
            return Err(RestartError::corrupt(
                path,
                format!(
                    "segment {segment:?} extends past file size {}",
                    info.file_size
                ),
            ));
        }
        Ok(info)
    }

    /// Persist to `path`, replacing any previous checkpoint atomically.
    pub async fn save(&self, path: &std::path::Path) -> Result<(), RestartError> {
        let buf = self.encode(path)?;
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = std::path::PathBuf::from(tmp_name);
        tokio::fs::write(&tmp_path, &buf)
            .await
            .map_err(|err| RestartError::io(&tmp_path, err))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|err| RestartError::io(path, err))
    }

    pub async fn load(path: &std::path::Path) -> Result<Self, RestartError> {
        let buf = tokio::fs::read(path)
            .await
            .map_err(|err| RestartError::io(path, err))?;
        Self::decode(path, &buf)
    }

    /// Remove the checkpoint at `path`; a missing file is not an error.
    pub async fn clear(path: &std::path::Path) -> Result<(), RestartError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RestartError::io(path, err)),
        }
    }
}

/// Limits deciding when a transfer is checkpointed and how often.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub min_restart_size: u64,
    pub max_threads: usize,
    pub flush_threshold: u64,
}

impl From<&crate::config::TransferConfig> for RestartPolicy {
    fn from(config: &crate::config::TransferConfig) -> Self {
        Self {
            min_restart_size: config.min_restart_size,
            max_threads: config.max_threads,
            flush_threshold: config.restart_flush_threshold,
        }
    }
}

/// Checkpoint shared by the workers of one transfer.
///
/// Each worker updates only its own segment. Flushing is single-writer: whichever worker crosses the
/// byte threshold and wins the flush lock writes the file, others carry on.
#[derive(Debug)]
pub struct Checkpoint {
    info: RestartInfo,
    segments: Vec<std::sync::Mutex<RestartSegment>>,
    path: Option<std::path::PathBuf>,
    flush_threshold: u64,
    written_since_flush: AtomicU64,
    flushing: tokio::sync::Mutex<()>,
}

impl Checkpoint {
    /// `path = None` or a non-tracking `info` disables persistence entirely.
    pub fn new(info: RestartInfo, path: Option<std::path::PathBuf>, flush_threshold: u64) -> Self {
        let segments = info
            .segments
            .iter()
            .map(|seg| std::sync::Mutex::new(*seg))
            .collect();
        let path = if info.is_tracking() { path } else { None };
        Self {
            info,
            segments,
            path,
            flush_threshold,
            written_since_flush: AtomicU64::new(0),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    pub fn record_progress(&self, thread_id: usize, offset: u64, delta: u64) {
        let Some(segment) = self.segments.get(thread_id) else {
            return;
        };
        segment
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .advance(offset, delta);
        self.written_since_flush.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RestartInfo {
        let mut info = self.info.clone();
        info.segments = self
            .segments
            .iter()
            .map(|seg| *seg.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
            .collect();
        info
    }

    /// Write the checkpoint if at least the flush threshold has been moved since the last write.
    ///
    /// Returns whether a write happened. Concurrent callers never write at the same time; a caller
    /// that finds a flush already running returns without waiting.
    pub async fn flush_if_due(&self) -> Result<bool, RestartError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };
        if self.written_since_flush.load(Ordering::Relaxed) < self.flush_threshold {
            return Ok(false);
        }
        let Ok(_guard) = self.flushing.try_lock() else {
            return Ok(false);
        };
        let pending = self.written_since_flush.load(Ordering::Relaxed);
        if pending < self.flush_threshold {
            return Ok(false);
        }
        self.written_since_flush
            .fetch_sub(pending, Ordering::Relaxed);
        let info = self.snapshot();
        tracing::debug!(
            "flushing checkpoint {:?}: {} of {} bytes done",
            path,
            info.bytes_done(),
            info.file_size
        );
        info.save(path).await?;
        Ok(true)
    }

    /// Write the checkpoint now, waiting for any flush already in progress.
    pub async fn flush(&self) -> Result<(), RestartError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let _guard = self.flushing.lock().await;
        self.written_since_flush.store(0, Ordering::Relaxed);
        self.snapshot().save(path).await
    }

    /// Mark the transfer complete and remove the checkpoint file.
    pub async fn finish(&self) -> Result<(), RestartError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let _guard = self.flushing.lock().await;
        RestartInfo::clear(path).await
    }
}
