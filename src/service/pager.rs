use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_ATTEMPTS: u32 = 3;

/// Initial delay between delivery attempts.
const BASE_RETRY_DELAY: Duration = Duration::from_millis(400);

/// One undelivered page: the MRN and the raw observation date string exactly
/// as received from LIMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub mrn: String,
    pub date: String,
}

impl PageRequest {
    pub fn body(&self) -> String {
        format!("{},{}", self.mrn, self.date)
    }
}

// ============================================================================
// PAGE SINK
// ============================================================================

/// Where pages are POSTed. Split out so the retry and queue policy are
/// testable without a live pager service.
#[async_trait]
pub trait PageSink: Send + Sync {
    /// Returns the HTTP status code of one delivery attempt.
    async fn post(&self, body: &str) -> std::result::Result<u16, String>;
}

/// Production sink: POST to `http://<host>:<port>/page` as plain text.
pub struct HttpPageSink {
    url: String,
    client: reqwest::Client,
}

impl HttpPageSink {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            url: format!("http://{}:{}/page", host, port),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PageSink for HttpPageSink {
    async fn post(&self, body: &str) -> std::result::Result<u16, String> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "text/plain")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {}", e))?;
        Ok(response.status().as_u16())
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Sends pages with bounded retries and keeps the undelivered ones in a FIFO
/// queue that is written back to disk after every attempt, so an accepted
/// page survives crashes and restarts (at-least-once delivery).
pub struct PagerDispatcher<S: PageSink> {
    sink: S,
    queue: VecDeque<PageRequest>,
    queue_path: PathBuf,
}

impl<S: PageSink> PagerDispatcher<S> {
    /// Restores the pending queue from disk if a queue file exists.
    pub fn load(sink: S, queue_path: &Path) -> Result<Self> {
        let queue = if queue_path.exists() {
            let raw = fs::read_to_string(queue_path)?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::Pager(format!("corrupt pager queue file: {}", e)))?
        } else {
            VecDeque::new()
        };
        if !queue.is_empty() {
            info!("Restored {} pending pages from disk", queue.len());
        }
        Ok(Self {
            sink,
            queue,
            queue_path: queue_path.to_path_buf(),
        })
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Sends one page, then drains as much of the pending queue as the pager
    /// service will take. Returns whether the new page was delivered.
    pub async fn dispatch(&mut self, mrn: &str, date: &str) -> Result<bool> {
        let request = PageRequest {
            mrn: mrn.to_string(),
            date: date.to_string(),
        };
        info!("Sending a page for mrn {}", mrn);
        let delivered = self.attempt(&request).await;
        if delivered {
            self.flush()?;
            debug!("Trying to send remaining pages...");
            while let Some(next) = self.queue.pop_front() {
                if self.attempt(&next).await {
                    self.flush()?;
                } else {
                    // The service stopped taking pages; park this one at the
                    // tail and come back on the next positive.
                    self.queue.push_back(next);
                    self.flush()?;
                    break;
                }
            }
        } else {
            self.queue.push_back(request);
            self.flush()?;
        }
        if !self.queue.is_empty() {
            warn!("{} pages still pending delivery", self.queue.len());
        }
        Ok(delivered)
    }

    /// Up to three attempts; the delay between tries starts at 0.4 s and is
    /// multiplied by the attempt count (0.4 s, then 0.8 s).
    async fn attempt(&self, request: &PageRequest) -> bool {
        let body = request.body();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.sink.post(&body).await {
                Ok(200) => {
                    info!("Page for {} delivered", request.mrn);
                    return true;
                }
                Ok(status) => warn!(
                    "Attempt {}: page for {} rejected with status {}",
                    attempt, request.mrn, status
                ),
                Err(e) => warn!("Attempt {}: page for {} failed: {}", attempt, request.mrn, e),
            }
            if attempt < MAX_ATTEMPTS {
                let delay = BASE_RETRY_DELAY * attempt;
                debug!("Retrying in {:?}...", delay);
                tokio::time::sleep(delay).await;
            }
        }
        false
    }

    /// Rewrites the queue file atomically (write-to-temp + rename).
    pub fn flush(&self) -> Result<()> {
        let serialized =
            serde_json::to_string(&self.queue).map_err(|e| Error::Pager(e.to_string()))?;
        if let Some(parent) = self.queue_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.queue_path.with_extension("tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.queue_path)?;
        Ok(())
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
