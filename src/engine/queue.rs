//! Ingest queue between site connectors and the batch pipeline
//!
//! Connectors push raw listings concurrently through cloned senders; the
//! scheduler drains everything queued once per pass. Records of a pass
//! that was aborted are put back and go first on the next drain.

use crate::error::{EngineError, Result};
use crate::types::RawListing;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct IngestQueue {
    tx: mpsc::Sender<RawListing>,
    rx: Mutex<mpsc::Receiver<RawListing>>,
    /// Records returned by an aborted pass
    returned: Mutex<Vec<RawListing>>,
}

impl IngestQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            returned: Mutex::new(Vec::new()),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<RawListing> {
        self.tx.clone()
    }

    /// Take everything queued so far
    pub fn drain(&self) -> Vec<RawListing> {
        let mut batch = std::mem::take(&mut *self.returned.lock());
        let mut rx = self.rx.lock();
        while let Ok(listing) = rx.try_recv() {
            batch.push(listing);
        }
        batch
    }

    /// Put a batch back for the next pass
    pub fn requeue(&self, batch: Vec<RawListing>) {
        if batch.is_empty() {
            return;
        }
        debug!("Requeued {} listings", batch.len());
        let mut returned = self.returned.lock();
        let newer = std::mem::replace(&mut *returned, batch);
        returned.extend(newer);
    }

    /// Records waiting from aborted passes
    pub fn returned_len(&self) -> usize {
        self.returned.lock().len()
    }
}

impl Default for IngestQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Producer of raw listings, e.g. one per marketplace site
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn name(&self) -> &str;

    /// Push whatever is available now; returns the number of listings sent
    async fn collect(&self, tx: mpsc::Sender<RawListing>) -> Result<usize>;
}

/// Read raw listings from a JSON array or a JSON Lines file
pub fn load_listings<P: AsRef<Path>>(path: P) -> Result<Vec<RawListing>> {
    let text = std::fs::read_to_string(path.as_ref())?;
    parse_listings(&text)
}

pub fn parse_listings(text: &str) -> Result<Vec<RawListing>> {
    if text.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(text)?);
    }

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).map_err(EngineError::from))
        .collect()
}

/// Files connectors drop into a directory; each file is moved aside once
/// its listings are queued.
pub struct InboxSource {
    inbox: PathBuf,
    processed: PathBuf,
}

impl InboxSource {
    pub fn new(inbox: impl Into<PathBuf>, processed: impl Into<PathBuf>) -> Self {
        Self {
            inbox: inbox.into(),
            processed: processed.into(),
        }
    }

    fn pending_files(&self) -> Result<Vec<PathBuf>> {
        if !self.inbox.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.inbox)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && matches!(path.extension().and_then(|e| e.to_str()), Some("json") | Some("jsonl"))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ListingSource for InboxSource {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn collect(&self, tx: mpsc::Sender<RawListing>) -> Result<usize> {
        let mut sent = 0;
        for path in self.pending_files()? {
            let listings = match load_listings(&path) {
                Ok(listings) => listings,
                Err(e) => {
                    warn!("Skipping unreadable inbox file {}: {}", path.display(), e);
                    continue;
                }
            };

            let count = listings.len();
            for listing in listings {
                tx.send(listing)
                    .await
                    .map_err(|_| EngineError::Internal("ingest queue closed".to_string()))?;
            }
            sent += count;

            std::fs::create_dir_all(&self.processed)?;
            if let Some(name) = path.file_name() {
                std::fs::rename(&path, self.processed.join(name))?;
            }
            info!("Queued {} listings from {}", count, path.display());
        }
        Ok(sent)
    }
}
