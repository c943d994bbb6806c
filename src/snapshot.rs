use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::{thread, time::Duration};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::config::constants;
use crate::error::SnapshotError;

/// Source of webcam frames.
///
/// The monitor only depends on this trait so hosts can plug in their own
/// camera access; [`SnapshotFetcher`] is the HTTP implementation.
pub trait SnapshotSource: Send + Sync {
    /// Fetch a single JPEG frame from `url`.
    fn capture(&self, url: &str) -> Result<Vec<u8>, SnapshotError>;
}

/// Webcam snapshot fetcher with a single bounded retry.
///
/// Each attempt is an HTTP GET with a fixed timeout whose body must decode
/// as a JPEG. One failed attempt is retried after a short pause; a second
/// failure is returned to the caller, which treats it as non-fatal.
pub struct SnapshotFetcher {
    client: Client,
    retry_delay: Duration,
}

impl SnapshotFetcher {
    /// Create a fetcher with the default timeout and retry pause.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialised.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(constants::SNAPSHOT_TIMEOUT_SECONDS))
            .build()
            .context("building snapshot HTTP client")?;
        Ok(Self {
            client,
            retry_delay: Duration::from_millis(constants::SNAPSHOT_RETRY_DELAY_MILLIS),
        })
    }

    /// Override the pause before the retry.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Make a single HTTP request without retry.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The HTTP request fails or times out
    /// - The server returns a non-success status
    /// - The body is empty or not a decodable JPEG
    pub fn attempt_fetch(&self, url: &str) -> Result<Vec<u8>, SnapshotError> {
        let response = self.client.get(url).send().map_err(|e| SnapshotError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(SnapshotError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let data = response.bytes().map_err(|e| SnapshotError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        validate_jpeg(url, &data)?;
        Ok(data.to_vec())
    }
}

impl SnapshotSource for SnapshotFetcher {
    fn capture(&self, url: &str) -> Result<Vec<u8>, SnapshotError> {
        match self.attempt_fetch(url) {
            Ok(data) => Ok(data),
            Err(e) => {
                warn!("Failed to fetch snapshot (attempt 1): {}", e);
                info!("Retrying snapshot in {}ms...", self.retry_delay.as_millis());
                thread::sleep(self.retry_delay);
                self.attempt_fetch(url)
            }
        }
    }
}

/// Check that `data` is a JPEG the `image` crate can decode.
pub fn validate_jpeg(url: &str, data: &[u8]) -> Result<(), SnapshotError> {
    let invalid = |reason: String| SnapshotError::InvalidImage {
        url: url.to_string(),
        reason,
    };

    if data.is_empty() {
        return Err(invalid("empty body".to_string()));
    }
    match image::guess_format(data) {
        Ok(image::ImageFormat::Jpeg) => {}
        Ok(other) => return Err(invalid(format!("got {:?} data", other))),
        Err(e) => return Err(invalid(e.to_string())),
    }
    image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
        .map_err(|e| invalid(e.to_string()))?;
    Ok(())
}

/// Opaque handle to a stored snapshot: the artifact's file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotRef(String);

impl SnapshotRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the name cannot escape the archive directory.
    fn is_plain_file_name(&self) -> bool {
        !self.0.is_empty()
            && !self.0.contains(['/', '\\'])
            && self.0 != "."
            && self.0 != ".."
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// On-disk store for captured frames, addressed by [`SnapshotRef`].
pub struct SnapshotArchive {
    dir: PathBuf,
    counter: AtomicU64,
}

impl SnapshotArchive {
    const PREFIX: &'static str = "monitor_";
    const EXTENSION: &'static str = ".jpg";

    /// Open (and create if needed) the archive directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating snapshot directory {}", dir.display()))?;
        let existing = Self::list(&dir)?.len() as u64;
        Ok(Self {
            dir,
            counter: AtomicU64::new(existing),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a frame and return its reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn store(&self, data: &[u8]) -> Result<SnapshotRef> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let ts = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let reference = SnapshotRef(format!("{}{}_{}{}", Self::PREFIX, ts, n, Self::EXTENSION));
        let path = self.dir.join(reference.as_str());
        fs::write(&path, data).with_context(|| format!("writing snapshot {}", path.display()))?;
        debug!("Stored snapshot {}", reference);
        Ok(reference)
    }

    /// Filesystem path of a stored frame, for thumbnail serving.
    ///
    /// Returns `None` for unknown references and for names that are not
    /// plain file names.
    pub fn path(&self, reference: &SnapshotRef) -> Option<PathBuf> {
        if !reference.is_plain_file_name() {
            return None;
        }
        let path = self.dir.join(reference.as_str());
        path.is_file().then_some(path)
    }

    /// Read a stored frame back.
    pub fn load(&self, reference: &SnapshotRef) -> Option<Vec<u8>> {
        self.path(reference).and_then(|path| fs::read(path).ok())
    }

    /// Release a stored frame. Missing files are not an error.
    pub fn remove(&self, reference: &SnapshotRef) {
        if let Some(path) = self.path(reference) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove snapshot {}: {}", path.display(), e);
            }
        }
    }

    /// Release every stored frame.
    pub fn clear(&self) -> Result<()> {
        for path in Self::list(&self.dir)? {
            fs::remove_file(&path).with_context(|| format!("removing snapshot {}", path.display()))?;
        }
        Ok(())
    }

    fn list(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(Self::PREFIX) && n.ends_with(Self::EXTENSION));
            if is_snapshot {
                files.push(path);
            }
        }
        Ok(files)
    }
}
