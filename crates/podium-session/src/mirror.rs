//! Durable local mirror of the session document.
//!
//! The full document is written to `.podium/session_state.json` on every
//! mutation, independent of network state. On start, an existing blob seeds
//! the in-memory store so a host resumes its room code after a reload.
//! Writes are best-effort: a failure is logged by the caller and the session
//! carries on.
//!
//! `LocalChannel` is the same-device notification layer underneath the
//! network protocol: the host publishes each snapshot on a process-local
//! broadcast topic so secondary read-only views can mirror state without
//! touching the transport. Non-host processes only ever apply from it.

use podium_core::SessionState;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Directory the mirror file lives in, under the configured data dir.
pub const MIRROR_DIR: &str = ".podium";

/// The single fixed key everything is stored under.
pub const MIRROR_FILE: &str = "session_state.json";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Mirror I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Mirror blob is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Whole-file JSON persistence for the session document.
pub struct FileMirror {
    path: PathBuf,
}

impl FileMirror {
    /// Mirror under `<data_dir>/.podium/session_state.json`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(MIRROR_DIR).join(MIRROR_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the prior document, if one exists.
    ///
    /// A missing file is `Ok(None)`. Partial shapes are absorbed by the
    /// document's serde defaults; only a syntactically broken blob errors.
    pub fn load(&self) -> Result<Option<SessionState>, MirrorError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        let state: SessionState = serde_json::from_str(&contents)?;
        debug!("Loaded session mirror from {:?}", self.path);
        Ok(Some(state))
    }

    /// Overwrite the mirror with the full document.
    pub fn save(&self, state: &SessionState) -> Result<(), MirrorError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }
}

/// Process-local snapshot topic for same-device secondary views.
///
/// Lossy by design: a slow subscriber skips to the newest snapshot, which
/// is correct under whole-document replacement.
#[derive(Clone)]
pub struct LocalChannel {
    tx: broadcast::Sender<SessionState>,
}

impl Default for LocalChannel {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a snapshot. Only the host side calls this.
    pub fn publish(&self, state: &SessionState) {
        // No subscribers is fine
        let _ = self.tx.send(state.clone());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podium_core::RoomCode;
    use tempfile::TempDir;

    fn sample_state() -> SessionState {
        let mut state = SessionState::default();
        state.room_code = Some("AB12".parse().unwrap());
        state.set_prompt("Explain X", 3);
        state.record_response("Alex", "my answer", 1000);
        state
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let mirror = FileMirror::new(dir.path());
        assert!(mirror.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let state = sample_state();

        {
            let mirror = FileMirror::new(dir.path());
            mirror.save(&state).unwrap();
        }

        // A fresh mirror over the same dir sees the saved document
        let mirror = FileMirror::new(dir.path());
        let loaded = mirror.load().unwrap().expect("prior state");
        assert_eq!(loaded, state);
        assert_eq!(loaded.room_code, Some("AB12".parse::<RoomCode>().unwrap()));
    }

    #[test]
    fn test_save_overwrites_whole_file() {
        let dir = TempDir::new().unwrap();
        let mirror = FileMirror::new(dir.path());

        mirror.save(&sample_state()).unwrap();
        let mut next = sample_state();
        next.reset_round();
        mirror.save(&next).unwrap();

        let loaded = mirror.load().unwrap().unwrap();
        assert!(loaded.responses.is_empty());
        assert_eq!(loaded.prompt, "Explain X");
    }

    #[test]
    fn test_partial_blob_loads_with_defaults() {
        let dir = TempDir::new().unwrap();
        let mirror = FileMirror::new(dir.path());
        fs::create_dir_all(mirror.path().parent().unwrap()).unwrap();
        fs::write(mirror.path(), r#"{"prompt":"old shape"}"#).unwrap();

        let loaded = mirror.load().unwrap().unwrap();
        assert_eq!(loaded.prompt, "old shape");
        assert_eq!(loaded.max_score, 1);
    }

    #[test]
    fn test_broken_blob_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mirror = FileMirror::new(dir.path());
        fs::create_dir_all(mirror.path().parent().unwrap()).unwrap();
        fs::write(mirror.path(), "not json").unwrap();

        assert!(matches!(mirror.load(), Err(MirrorError::Parse(_))));
    }

    #[tokio::test]
    async fn test_local_channel_delivers_snapshots() {
        let channel = LocalChannel::new();
        let mut rx = channel.subscribe();

        let state = sample_state();
        channel.publish(&state);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, state);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let channel = LocalChannel::new();
        channel.publish(&sample_state());
    }
}
