use crate::config::{Config, UPLOAD_SWEEP_INTERVAL_SECS};
use crate::error::{ApiError, ApiResult};
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use regex::Regex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Chunked upload coordinates, parsed from request fields.
///
/// `byte_offset` is the authoritative write position: chunks are written
/// with seek-then-write semantics, so out-of-order and retried deliveries
/// land in the right place instead of being appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkParams {
    pub session_id: String,
    pub chunk_index: u64,
    pub byte_offset: u64,
    pub total_chunks: u64,
}

impl ChunkParams {
    /// True when this is the final chunk and the caller should finalize.
    pub fn is_last(&self) -> bool {
        self.chunk_index + 1 == self.total_chunks
    }
}

fn session_id_filter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("[^0-9a-zA-Z-]+").expect("static regex"))
}

/// Session ids are client supplied and become filename components, so
/// everything outside `[0-9A-Za-z-]` is stripped.
pub fn sanitize_session_id(raw: &str) -> String {
    session_id_filter().replace_all(raw, "").into_owned()
}

/// Interprets the chunking fields of a request.
///
/// Returns `Ok(None)` when any of the three required parameters
/// (session id, chunk index, total count) is absent: such requests are not
/// chunked and fall through to whole-file ingestion. Present but
/// non-integer or out-of-range values are rejected.
pub fn parse_chunk_params(
    session_id: Option<&str>,
    chunk_index: Option<&str>,
    total_chunks: Option<&str>,
    byte_offset: Option<&str>,
) -> ApiResult<Option<ChunkParams>> {
    let (Some(session_id), Some(chunk_index), Some(total_chunks)) =
        (session_id, chunk_index, total_chunks)
    else {
        return Ok(None);
    };

    let parse = |name: &str, v: &str| -> ApiResult<u64> {
        v.trim().parse::<u64>().map_err(|_| {
            ApiError::InvalidParameter(format!("{} must be a non-negative integer", name))
        })
    };

    let chunk_index = parse("chunkIndex", chunk_index)?;
    let total_chunks = parse("totalChunkCount", total_chunks)?;
    let byte_offset = match byte_offset {
        Some(v) => parse("byteOffset", v)?,
        None => 0,
    };

    if total_chunks == 0 {
        return Err(ApiError::InvalidParameter(
            "totalChunkCount must be at least 1".to_string(),
        ));
    }
    if chunk_index >= total_chunks {
        return Err(ApiError::InvalidParameter(format!(
            "chunkIndex {} exceeds totalChunkCount {}",
            chunk_index, total_chunks
        )));
    }

    let session_id = sanitize_session_id(session_id);
    if session_id.is_empty() {
        return Err(ApiError::InvalidParameter(
            "sessionId is empty after sanitization".to_string(),
        ));
    }

    Ok(Some(ChunkParams {
        session_id,
        chunk_index,
        byte_offset,
        total_chunks,
    }))
}

/// Reassembles chunked uploads into a single file and commits non-chunked
/// payloads. Session state is the temp file itself; finalizing moves it
/// into the task's storage and destroys the session.
pub struct UploadIngestor {
    config: Config,
    /// Per-session write serialization. Writes to distinct offsets are
    /// idempotent, but two racing writers on overlapping ranges could tear.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UploadIngestor {
    pub fn new(config: Config) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.upload_tmp_dir)?;
        Ok(Self {
            config,
            locks: DashMap::new(),
        })
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.config
            .upload_tmp_dir
            .join(format!("{}.upload", session_id))
    }

    /// Establishes the task's private storage root. Called exactly once per
    /// task before the first ingestion.
    pub fn create_task_directories(&self, task_id: &Uuid) -> ApiResult<()> {
        std::fs::create_dir_all(self.config.images_dir(task_id))?;
        std::fs::create_dir_all(self.config.assets_dir(task_id))?;
        Ok(())
    }

    pub fn remove_task_directories(&self, task_id: &Uuid) -> ApiResult<()> {
        let dir = self.config.task_dir(task_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Writes one chunk at its byte offset. Returns true when this chunk
    /// completes the sequence and the caller should finalize the session.
    ///
    /// Chunk index 0 over a pre-existing temp file truncates it first: a
    /// client restarting an upload from scratch discards the stale partial.
    pub async fn write_chunk(&self, params: &ChunkParams, data: &[u8]) -> ApiResult<bool> {
        let lock = self.session_lock(&params.session_id);
        let _guard = lock.lock().await;

        let path = self.session_path(&params.session_id);
        if params.chunk_index == 0 && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(
                "upload session {} restarted, discarding stale temp file",
                params.session_id
            );
            tokio::fs::remove_file(&path).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(params.byte_offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        debug!(
            "session {}: wrote chunk {}/{} ({} bytes at offset {})",
            params.session_id,
            params.chunk_index + 1,
            params.total_chunks,
            data.len(),
            params.byte_offset
        );

        Ok(params.is_last())
    }

    /// Moves the completed session file to `dest` and destroys the session.
    ///
    /// Rename is atomic within a volume; across volumes we copy to a
    /// sibling temp file and rename into place, so a failure never leaves a
    /// half-moved file at the destination.
    pub async fn finalize_chunked_upload(&self, session_id: &str, dest: &Path) -> ApiResult<()> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let src = self.session_path(session_id);
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Err(ApiError::Validation(format!(
                "upload session {} has no data",
                session_id
            )));
        }

        if tokio::fs::rename(&src, dest).await.is_err() {
            let part = sibling_part(dest);
            tokio::fs::copy(&src, &part).await?;
            tokio::fs::rename(&part, dest).await?;
            tokio::fs::remove_file(&src).await?;
        }

        drop(_guard);
        self.locks.remove(session_id);
        debug!("session {} finalized into {}", session_id, dest.display());
        Ok(())
    }

    /// Commits a single-request payload. The bytes land in a sibling temp
    /// file first and are renamed into place.
    pub async fn ingest_whole_file(&self, data: &[u8], dest: &Path) -> ApiResult<()> {
        let part = sibling_part(dest);
        let mut file = tokio::fs::File::create(&part).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;
        Ok(())
    }

    /// Copies a byte stream (e.g. a remote archive body) to `dest` without
    /// buffering it in memory. The caller opens the source.
    pub async fn ingest_stream<S, E>(&self, mut stream: S, dest: &Path) -> ApiResult<()>
    where
        S: futures::Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let part = sibling_part(dest);
        let mut file = tokio::fs::File::create(&part).await?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ApiError::Internal(e.to_string()))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;
        Ok(())
    }

    /// Deletes session temp files that have not been touched within the
    /// configured TTL. Abandoned uploads would otherwise pile up forever.
    pub fn sweep_expired_sessions(&self) -> usize {
        let ttl = Duration::from_secs(self.config.upload_session_ttl_secs);
        let now = SystemTime::now();
        let mut removed = 0usize;

        let Ok(entries) = std::fs::read_dir(&self.config.upload_tmp_dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("upload") {
                continue;
            }
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .map(|age| age > ttl)
                .unwrap_or(false);
            if expired && std::fs::remove_file(&path).is_ok() {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    self.locks.remove(stem);
                }
                removed += 1;
            }
        }
        removed
    }

    /// Background loop for the orphaned-session sweep.
    pub fn start_session_sweep(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(UPLOAD_SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let removed = self.sweep_expired_sessions();
                if removed > 0 {
                    info!("upload sweep removed {} expired session file(s)", removed);
                }
            }
        });
    }
}

fn sibling_part(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| {
            warn!("destination path without file name: {}", dest.display());
            "upload".to_string()
        });
    dest.with_file_name(format!(".{}.part", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_to_restricted_charset() {
        assert_eq!(sanitize_session_id("abc-123"), "abc-123");
        assert_eq!(sanitize_session_id("../../etc"), "etc");
        assert_eq!(sanitize_session_id("a b/c\\d"), "abcd");
    }

    #[test]
    fn missing_params_mean_not_chunked() {
        assert_eq!(
            parse_chunk_params(None, Some("0"), Some("2"), None).unwrap(),
            None
        );
        assert_eq!(
            parse_chunk_params(Some("s"), None, Some("2"), None).unwrap(),
            None
        );
        assert_eq!(
            parse_chunk_params(Some("s"), Some("0"), None, None).unwrap(),
            None
        );
    }

    #[test]
    fn non_integer_params_are_rejected() {
        assert!(parse_chunk_params(Some("s"), Some("zero"), Some("2"), None).is_err());
        assert!(parse_chunk_params(Some("s"), Some("-1"), Some("2"), None).is_err());
        assert!(parse_chunk_params(Some("s"), Some("0"), Some("2"), Some("1.5")).is_err());
        assert!(parse_chunk_params(Some("s"), Some("0"), Some("0"), None).is_err());
        assert!(parse_chunk_params(Some("s"), Some("2"), Some("2"), None).is_err());
    }

    #[test]
    fn byte_offset_defaults_to_zero() {
        let p = parse_chunk_params(Some("s"), Some("0"), Some("2"), None)
            .unwrap()
            .unwrap();
        assert_eq!(p.byte_offset, 0);
        assert!(!p.is_last());
    }
}
