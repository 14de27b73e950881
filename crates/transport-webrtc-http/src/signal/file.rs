//! Signalling through a shared directory.
//!
//! Layout: `<dir>/<session>/offer` written by the server, then
//! `<dir>/<session>/answer` written by the client. The server creates
//! session `0` up front and picks up any other directory a client creates.
//!
//! Both sides rescan on a timer (`DEFAULT_POLL_INTERVAL` unless overridden)
//! rather than watching the directory, so a new session or answer is noticed
//! up to one interval late in exchange for not depending on a file watcher.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{
    AnswerOffer, ClientSignaller, OfferHandler, RequestHandler, ServerSignaller,
    DEFAULT_POLL_INTERVAL,
};
use crate::error::{SignalError, TransportError};
use crate::sdp::{Answer, Offer};

pub const OFFER_FILE: &str = "offer";
pub const ANSWER_FILE: &str = "answer";
pub const FIRST_SESSION: &str = "0";

pub struct FileServerSignaller {
    dir: PathBuf,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl FileServerSignaller {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn reset_dir(&self) -> Result<(), SignalError> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(self.dir.join(FIRST_SESSION)).await?;
        Ok(())
    }

    async fn new_sessions(&self, seen: &mut HashSet<String>) -> Result<Vec<String>, SignalError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut fresh = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if seen.insert(name.clone()) {
                fresh.push(name);
            }
        }
        fresh.sort();
        Ok(fresh)
    }
}

#[async_trait]
impl ServerSignaller for FileServerSignaller {
    async fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<(), TransportError> {
        self.reset_dir().await?;
        tracing::info!(target = "webrtc", dir = %self.dir.display(), "file signaller ready");

        let mut seen = HashSet::new();
        loop {
            let sessions = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                sessions = self.new_sessions(&mut seen) => sessions?,
            };
            for session_id in sessions {
                let exchange = Arc::new(FileAnswerOffer {
                    dir: self.dir.join(&session_id),
                    poll_interval: self.poll_interval,
                    cancel: self.cancel.clone(),
                });
                tracing::info!(target = "webrtc", session_id = %session_id, "file session found");
                let result = handler
                    .handle_request(self.cancel.child_token(), session_id.clone(), None, exchange)
                    .await;
                match result {
                    Ok(()) => tracing::info!(target = "webrtc", session_id = %session_id, "session finished"),
                    Err(err) => {
                        tracing::warn!(target = "webrtc", session_id = %session_id, error = %err, "session failed")
                    }
                }
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct FileAnswerOffer {
    dir: PathBuf,
    poll_interval: Duration,
    cancel: CancellationToken,
}

#[async_trait]
impl AnswerOffer for FileAnswerOffer {
    async fn answer_offer(&self, session_id: &str, offer: Offer) -> Result<Answer, TransportError> {
        match fs::remove_file(self.dir.join(ANSWER_FILE)).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(SignalError::from(err).into()),
        }
        write_atomically(&self.dir, OFFER_FILE, &offer.to_json()?).await?;
        tracing::debug!(target = "webrtc", session_id, "offer written, waiting for answer");
        let json = wait_for_file(&self.dir.join(ANSWER_FILE), self.poll_interval, &self.cancel).await?;
        Ok(Answer::from_json(&json)?)
    }
}

pub struct FileClientSignaller {
    session_dir: PathBuf,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl FileClientSignaller {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl ClientSignaller for FileClientSignaller {
    async fn start(&self, handler: Arc<dyn OfferHandler>) -> Result<(), TransportError> {
        let session_id = self
            .session_dir
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(FIRST_SESSION)
            .to_string();
        let json = wait_for_file(&self.session_dir.join(OFFER_FILE), self.poll_interval, &self.cancel).await?;
        let offer = Offer::from_json(&json)?;
        let answer = handler.handle_offer(&session_id, offer, None).await?;
        write_atomically(&self.session_dir, ANSWER_FILE, &answer.to_json()?).await?;
        tracing::debug!(target = "webrtc", session_id = %session_id, "answer written");
        Ok(())
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Writes `name` under `dir` via a temporary file and a rename so readers
/// never see a partial document.
async fn write_atomically(dir: &Path, name: &str, contents: &str) -> Result<(), SignalError> {
    let tmp = dir.join(format!(".{name}.tmp"));
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, dir.join(name)).await?;
    Ok(())
}

async fn wait_for_file(
    path: &Path,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<String, TransportError> {
    loop {
        match fs::read_to_string(path).await {
            Ok(contents) if !contents.trim().is_empty() => return Ok(contents),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(SignalError::from(err).into()),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = sleep(interval) => {}
        }
    }
}
