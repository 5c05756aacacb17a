//! HTTP transport for streaming playback.
//!
//! Issues one GET and exposes the response body as a plain [`Read`] of byte
//! chunks in arrival order. No seeking, no range requests.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Configuration for the HTTP stream transport.
#[derive(Clone, Debug)]
pub struct HttpSourceConfig {
    /// Bytes requested per read.
    pub chunk_bytes: usize,
    /// Connect and response-header timeout.
    pub timeout: Duration,
    /// Reads taking longer than this are logged.
    pub slow_read: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 16 * 1024,
            timeout: Duration::from_secs(10),
            slow_read: Duration::from_secs(2),
        }
    }
}

/// Response body of a streaming GET.
pub struct HttpStreamSource {
    body: Box<dyn Read>,
    config: HttpSourceConfig,
    cancel: Option<Arc<AtomicBool>>,
    bytes_read: u64,
    content_type: Option<String>,
}

impl HttpStreamSource {
    /// Connect to `url` and wait for the response headers.
    pub fn open(url: &str, config: HttpSourceConfig, cancel: Option<Arc<AtomicBool>>) -> io::Result<Self> {
        let start = Instant::now();
        let resp = ureq::get(url)
            .config()
            .timeout_connect(Some(config.timeout))
            .timeout_recv_response(Some(config.timeout))
            .build()
            .call()
            .map_err(|e| io::Error::other(format!("http request failed: {e}")))?;

        let content_type = resp
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        tracing::info!(
            url,
            status = resp.status().as_u16(),
            content_type = content_type.as_deref().unwrap_or("unknown"),
            took_ms = start.elapsed().as_millis() as u64,
            "stream connected"
        );

        let (_, body) = resp.into_parts();
        Ok(Self::from_reader(Box::new(body.into_reader()), config, cancel, content_type))
    }

    /// Wrap an already-open body.
    pub fn from_reader(
        body: Box<dyn Read>,
        config: HttpSourceConfig,
        cancel: Option<Arc<AtomicBool>>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            body,
            config,
            cancel,
            bytes_read: 0,
            content_type,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn chunk_bytes(&self) -> usize {
        self.config.chunk_bytes
    }

    fn is_canceled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

impl Read for HttpStreamSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.is_canceled() || out.is_empty() {
            return Ok(0);
        }

        let start = Instant::now();
        let n = self
            .body
            .read(out)
            .map_err(|e| io::Error::new(e.kind(), format!("http read failed: {e}")))?;
        let elapsed = start.elapsed();
        self.bytes_read = self.bytes_read.saturating_add(n as u64);

        if elapsed > self.config.slow_read {
            tracing::warn!(
                took_ms = elapsed.as_millis() as u64,
                bytes = n,
                total_bytes = self.bytes_read,
                "http stream read slow"
            );
        }
        Ok(n)
    }
}
