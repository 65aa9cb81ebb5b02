//! Re-importing a subfile from a file another process may still hold.
//!
//! The expected holder is a companion editor finishing a write, so the wait
//! is a fixed short backoff bounded by a deadline, never exponential and
//! never unbounded.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::archive::Archive;
use crate::entry::CompressionState;
use crate::error::{Result, SpcError};

pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(50);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff and deadline for [`Archive::insert_retrying`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total time budget, measured from the first attempt.
    pub timeout: Duration,
    /// Fixed pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { timeout: DEFAULT_TIMEOUT, backoff: DEFAULT_BACKOFF }
    }
}

impl RetryPolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout, ..Self::default() }
    }

    /// Time to sleep before the next attempt, or `None` once the deadline
    /// would be overrun.
    fn next_delay(&self, started: Instant) -> Option<Duration> {
        let remaining = self.timeout.checked_sub(started.elapsed())?;
        if remaining.is_zero() {
            return None;
        }
        Some(self.backoff.min(remaining))
    }
}

fn unavailable(path: &Path, started: Instant, source: io::Error) -> SpcError {
    SpcError::SourceUnavailable {
        path: path.to_owned(),
        waited: started.elapsed(),
        source,
    }
}

/// Read `source`, retrying every `policy.backoff` until `policy.timeout`.
fn read_retrying(name: &str, source: &Path, policy: &RetryPolicy) -> Result<Vec<u8>> {
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match fs::read(source) {
            Ok(bytes) => {
                tracing::debug!(name, attempt, path = %source.display(), "source readable");
                return Ok(bytes);
            }
            Err(e) => {
                let Some(delay) = policy.next_delay(started) else {
                    return Err(unavailable(source, started, e));
                };
                tracing::warn!(name, attempt, error = %e, "source busy, retrying");
                std::thread::sleep(delay);
            }
        }
    }
}

impl Archive {
    /// Read `source` and [`insert`](Archive::insert) it as `name`, retrying
    /// every `policy.backoff` while the read fails.  Gives up with
    /// `SourceUnavailable` once `policy.timeout` has elapsed.
    pub fn insert_retrying<P: AsRef<Path>>(&mut self, name: &str, source: P, policy: &RetryPolicy) -> Result<()> {
        let bytes = read_retrying(name, source.as_ref(), policy)?;
        self.insert(name, bytes)
    }

    /// As [`insert_retrying`](Archive::insert_retrying), storing the entry
    /// with an explicit compression state.
    pub fn insert_retrying_with_state<P: AsRef<Path>>(
        &mut self,
        name: &str,
        source: P,
        state: CompressionState,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let bytes = read_retrying(name, source.as_ref(), policy)?;
        self.insert_with_state(name, bytes, state)
    }

    /// Async form of [`insert_retrying`](Archive::insert_retrying); the wait
    /// yields to the runtime instead of blocking the thread.
    #[cfg(feature = "async")]
    pub async fn insert_retrying_async<P: AsRef<Path>>(
        &mut self,
        name: &str,
        source: P,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let source = source.as_ref();
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match tokio::fs::read(source).await {
                Ok(bytes) => return self.insert(name, bytes),
                Err(e) => {
                    let Some(delay) = policy.next_delay(started) else {
                        return Err(unavailable(source, started, e));
                    };
                    tracing::warn!(name, attempt, error = %e, "source busy, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn missing_source_times_out() {
        let dir = TempDir::new().unwrap();
        let policy = RetryPolicy { timeout: Duration::from_millis(200), backoff: Duration::from_millis(20) };
        let mut ar = Archive::new();
        let started = Instant::now();
        let err = ar.insert_retrying("x.wrd", dir.path().join("never.wrd"), &policy).unwrap_err();
        let took = started.elapsed();
        assert!(matches!(err, SpcError::SourceUnavailable { .. }));
        assert!(took >= Duration::from_millis(200));
        assert!(took < Duration::from_secs(3), "took {took:?}");
        assert!(ar.is_empty());
    }

    #[test]
    fn source_appearing_late_is_picked_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late.wrd");
        let writer_path = path.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            fs::write(writer_path, b"edited").unwrap();
        });

        let mut ar = Archive::new();
        ar.insert_retrying("late.wrd", &path, &RetryPolicy::default()).unwrap();
        handle.join().unwrap();
        assert_eq!(ar.get("late.wrd").unwrap().payload(), b"edited");
    }

    #[test]
    fn zero_timeout_tries_once() {
        let policy = RetryPolicy::with_timeout(Duration::ZERO);
        assert_eq!(policy.next_delay(Instant::now()), None);
        let mut ar = Archive::new();
        let err = ar.insert_retrying("a", "/nonexistent/path/a", &policy).unwrap_err();
        assert!(matches!(err, SpcError::SourceUnavailable { .. }));
    }

    #[test]
    fn explicit_state_variant_retries_and_stores_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late.bin");
        let writer_path = path.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            fs::write(writer_path, b"raw").unwrap();
        });

        let mut ar = Archive::new();
        ar.insert_retrying_with_state("late.bin", &path, CompressionState::Uncompressed, &RetryPolicy::default())
            .unwrap();
        handle.join().unwrap();
        let sub = ar.get("late.bin").unwrap();
        assert_eq!(sub.state(), CompressionState::Uncompressed);
        assert_eq!(sub.payload(), b"raw");

        let policy = RetryPolicy::with_timeout(Duration::from_millis(50));
        let err = ar
            .insert_retrying_with_state("gone", dir.path().join("gone"), CompressionState::Compressed, &policy)
            .unwrap_err();
        assert!(matches!(err, SpcError::SourceUnavailable { .. }));
    }

    #[test]
    fn delay_never_exceeds_remaining_budget() {
        let policy = RetryPolicy { timeout: Duration::from_secs(10), backoff: Duration::from_secs(60) };
        let delay = policy.next_delay(Instant::now()).unwrap();
        assert!(delay <= Duration::from_secs(10));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_variant_times_out() {
        let dir = TempDir::new().unwrap();
        let policy = RetryPolicy { timeout: Duration::from_millis(100), backoff: Duration::from_millis(10) };
        let mut ar = Archive::new();
        let err = ar
            .insert_retrying_async("gone", dir.path().join("gone"), &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, SpcError::SourceUnavailable { .. }));
    }
}
