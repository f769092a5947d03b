//! Single-file download with bounded retries, validation, and temp-file hygiene.

use std::cell::Cell;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::errors::MaterializeError;
use crate::layout::partial_path;
use crate::transport::fs::remove_file_best_effort;
use crate::transport::{RemoteStore, TransferError};
use crate::validate::{ArtifactStats, ArtifactValidator};

/// A successful, validated download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Transfer attempts used, including the successful one.
    pub attempts: u32,
    /// Validation facts for the accepted file.
    pub stats: ArtifactStats,
}

/// Downloads one remote file to one destination path, or fails leaving nothing behind.
///
/// Bytes stream into `<dest>.part`; only a complete, validated transfer is
/// renamed onto `dest`. Transient faults are retried within the policy budget.
/// Corrupt content and permanent rejections are not retried here.
pub struct RetryingFetcher<'a> {
    remote: &'a dyn RemoteStore,
    validator: &'a dyn ArtifactValidator,
    policy: RetryPolicy,
    attempts: Cell<u32>,
}

impl<'a> RetryingFetcher<'a> {
    /// Create a fetcher over a shared remote and validator.
    pub fn new(
        remote: &'a dyn RemoteStore,
        validator: &'a dyn ArtifactValidator,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            validator,
            policy,
            attempts: Cell::new(0),
        }
    }

    /// Transfer attempts issued by this fetcher so far, failed calls included.
    pub fn attempts(&self) -> u32 {
        self.attempts.get()
    }

    /// Download `url` into `dest`.
    pub fn fetch(&self, url: &str, dest: &Path) -> Result<FetchOutcome, MaterializeError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = partial_path(dest);
        remove_file_best_effort(dest);
        remove_file_best_effort(&temp);

        let max_attempts = self.policy.max_attempts();
        let mut last_reason = String::new();
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.delay_before_retry(attempt - 1);
                debug!(url, attempt, delay_ms = delay.as_millis(), "backing off before retry");
                thread::sleep(delay);
            }

            self.attempts.set(self.attempts.get().saturating_add(1));
            let transfer = self.transfer_once(url, &temp);
            let bytes = match transfer {
                Ok(bytes) => bytes,
                Err(AttemptError::Local(err)) => {
                    remove_file_best_effort(&temp);
                    return Err(MaterializeError::Io(err));
                }
                Err(AttemptError::Remote(TransferError::Permanent(reason))) => {
                    remove_file_best_effort(&temp);
                    return Err(MaterializeError::Fetch {
                        url: url.to_string(),
                        reason,
                    });
                }
                Err(AttemptError::Remote(TransferError::Transient(reason))) => {
                    remove_file_best_effort(&temp);
                    warn!(
                        url,
                        attempt,
                        max_attempts,
                        "[lakefetch] transient transfer failure: {reason}"
                    );
                    last_reason = reason;
                    continue;
                }
            };

            let stats = match self.validator.validate(&temp) {
                Ok(stats) => stats,
                Err(reason) => {
                    remove_file_best_effort(&temp);
                    return Err(MaterializeError::CorruptArtifact {
                        path: dest.display().to_string(),
                        reason,
                    });
                }
            };
            if let Err(err) = fs::rename(&temp, dest) {
                remove_file_best_effort(&temp);
                return Err(MaterializeError::Io(err));
            }
            debug!(url, attempt, bytes, "download accepted");
            return Ok(FetchOutcome {
                bytes,
                attempts: attempt,
                stats,
            });
        }

        Err(MaterializeError::RetriesExhausted {
            url: url.to_string(),
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    fn transfer_once(&self, url: &str, temp: &Path) -> Result<u64, AttemptError> {
        let file = File::create(temp).map_err(AttemptError::Local)?;
        let mut writer = BufWriter::new(file);
        let bytes = self
            .remote
            .fetch(url, &mut writer)
            .map_err(AttemptError::Remote)?;
        writer.flush().map_err(AttemptError::Local)?;
        let file = writer
            .into_inner()
            .map_err(|err| AttemptError::Local(err.into_error()))?;
        file.sync_all().map_err(AttemptError::Local)?;
        Ok(bytes)
    }

    fn delay_before_retry(&self, retry: u32) -> Duration {
        let delay = self.policy.backoff.delay_for_retry(retry);
        if self.policy.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..=self.policy.jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + extra)).unwrap_or(Duration::MAX)
    }
}

enum AttemptError {
    Remote(TransferError),
    Local(std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffPolicy;
    use crate::layout::DatasetLayout;
    use crate::partition::PartitionKey;
    use crate::test_support::{FetchStep, ScriptedRemote, parquet_bytes};
    use crate::validate::ParquetFooterValidator;
    use std::time::Instant;
    use tempfile::tempdir;

    fn setup(remote: impl FnOnce(&DatasetLayout, String) -> ScriptedRemote) -> Fixture {
        let temp = tempdir().unwrap();
        let layout = DatasetLayout::new("rides", "http://remote", temp.path(), "parquet");
        let locator = layout.locator(PartitionKey::new(2022, 3).unwrap(), 1);
        let url = layout.remote_url(&locator);
        let dest = layout.local_path(&locator);
        let remote = remote(&layout, url.clone());
        Fixture {
            _temp: temp,
            remote,
            url,
            dest,
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        remote: ScriptedRemote,
        url: String,
        dest: std::path::PathBuf,
    }

    fn body() -> Vec<u8> {
        parquet_bytes(&[(1, "a"), (2, "b")])
    }

    fn with_body(layout: &DatasetLayout) -> ScriptedRemote {
        ScriptedRemote::new().with_partition(
            layout,
            PartitionKey::new(2022, 3).unwrap(),
            vec![body()],
        )
    }

    #[test]
    fn two_transient_failures_then_success_leaves_only_the_valid_artifact() {
        let fx = setup(|layout, url| {
            with_body(layout).with_fetch_script(
                url,
                vec![
                    FetchStep::Fail {
                        prefix: 10,
                        error: TransferError::Transient("connection reset".into()),
                    },
                    FetchStep::Fail {
                        prefix: 0,
                        error: TransferError::Transient("read timeout".into()),
                    },
                ],
            )
        });
        let validator = ParquetFooterValidator;
        let fetcher = RetryingFetcher::new(&fx.remote, &validator, RetryPolicy::immediate(3));
        let outcome = fetcher.fetch(&fx.url, &fx.dest).unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.stats.rows, Some(2));
        assert_eq!(fs::read(&fx.dest).unwrap(), body());
        assert!(!partial_path(&fx.dest).exists());
        let siblings: Vec<_> = fs::read_dir(fx.dest.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(siblings.len(), 1);
    }

    #[test]
    fn exhausted_budget_fails_without_leftovers() {
        let fx = setup(|layout, url| {
            let steps = (0..3)
                .map(|_| FetchStep::Fail {
                    prefix: 5,
                    error: TransferError::Transient("truncated".into()),
                })
                .collect();
            with_body(layout).with_fetch_script(url, steps)
        });
        let validator = ParquetFooterValidator;
        let fetcher = RetryingFetcher::new(&fx.remote, &validator, RetryPolicy::immediate(2));
        let err = fetcher.fetch(&fx.url, &fx.dest).unwrap_err();

        assert!(matches!(
            err,
            MaterializeError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(fx.remote.fetch_log().len(), 3);
        assert_eq!(fetcher.attempts(), 3);
        assert!(!fx.dest.exists());
        assert!(!partial_path(&fx.dest).exists());
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let fx = setup(|layout, url| {
            with_body(layout).with_fetch_script(
                url,
                vec![FetchStep::Fail {
                    prefix: 0,
                    error: TransferError::Permanent("HTTP 403".into()),
                }],
            )
        });
        let validator = ParquetFooterValidator;
        let fetcher = RetryingFetcher::new(&fx.remote, &validator, RetryPolicy::immediate(3));
        let err = fetcher.fetch(&fx.url, &fx.dest).unwrap_err();

        assert!(matches!(err, MaterializeError::Fetch { .. }));
        assert_eq!(fx.remote.fetch_log().len(), 1);
        assert!(!fx.dest.exists());
    }

    #[test]
    fn corrupt_content_is_deleted_and_not_retried() {
        let fx = setup(|layout, url| {
            with_body(layout)
                .with_fetch_script(url, vec![FetchStep::Serve(b"<html>oops</html>".to_vec())])
        });
        let validator = ParquetFooterValidator;
        let fetcher = RetryingFetcher::new(&fx.remote, &validator, RetryPolicy::immediate(3));
        let err = fetcher.fetch(&fx.url, &fx.dest).unwrap_err();

        assert!(matches!(err, MaterializeError::CorruptArtifact { .. }));
        assert_eq!(fx.remote.fetch_log().len(), 1);
        assert!(!fx.dest.exists());
        assert!(!partial_path(&fx.dest).exists());
    }

    #[test]
    fn stale_destination_is_replaced() {
        let fx = setup(|layout, _| with_body(layout));
        fs::create_dir_all(fx.dest.parent().unwrap()).unwrap();
        fs::write(&fx.dest, b"stale").unwrap();
        fs::write(partial_path(&fx.dest), b"stale partial").unwrap();
        let validator = ParquetFooterValidator;
        let fetcher = RetryingFetcher::new(&fx.remote, &validator, RetryPolicy::immediate(0));
        fetcher.fetch(&fx.url, &fx.dest).unwrap();
        assert_eq!(fs::read(&fx.dest).unwrap(), body());
        assert!(!partial_path(&fx.dest).exists());
    }

    #[test]
    fn backoff_delay_is_applied_between_attempts() {
        let fx = setup(|layout, url| {
            with_body(layout).with_fetch_script(
                url,
                vec![
                    FetchStep::Fail {
                        prefix: 0,
                        error: TransferError::Transient("reset".into()),
                    },
                    FetchStep::Fail {
                        prefix: 0,
                        error: TransferError::Transient("reset".into()),
                    },
                ],
            )
        });
        let validator = ParquetFooterValidator;
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: BackoffPolicy::Fixed(Duration::from_millis(20)),
            jitter: 0.5,
        };
        let fetcher = RetryingFetcher::new(&fx.remote, &validator, policy);
        let started = Instant::now();
        fetcher.fetch(&fx.url, &fx.dest).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
