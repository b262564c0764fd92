//! Job status polling.
//!
//! A submitted job is driven through `Submitted -> Polling -> Done | Failed |
//! TimedOut | Cancelled`. Only the status poll is retried, never the job.
//! Cancellation abandons polling and leaves the remote job running.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::api::{JobResource, WarehouseApi};
use crate::config::JobPollConfig;
use crate::error::{BigqueryError, ErrorKind, Result};

#[derive(Debug)]
enum PollState {
    Submitted(JobResource),
    Polling { attempt: u32, backoff: Duration },
    Done(JobResource),
    Failed(BigqueryError),
    TimedOut,
    Cancelled,
}

/// Polls one job until it reaches a terminal state.
pub struct JobPoller<'a> {
    api: &'a dyn WarehouseApi,
    config: &'a JobPollConfig,
    cancel: CancellationToken,
}

impl<'a> JobPoller<'a> {
    pub fn new(api: &'a dyn WarehouseApi, config: &'a JobPollConfig) -> Self {
        Self {
            api,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wait for `job` to finish. A DONE job carrying an error result becomes
    /// `JobFailed` with the remote payload intact.
    pub async fn wait(&self, job: JobResource) -> Result<JobResource> {
        let started = Instant::now();
        let deadline = started + self.config.timeout();
        let job_id = job.job_id.clone();
        let project_id = job.project_id.clone();
        let location = job.location.clone();

        let mut state = PollState::Submitted(job);
        loop {
            state = match state {
                PollState::Submitted(job) => {
                    if job.is_done() {
                        finish(job)
                    } else {
                        PollState::Polling {
                            attempt: 0,
                            backoff: self.config.initial_backoff(),
                        }
                    }
                }
                PollState::Polling { attempt, backoff } => {
                    let now = Instant::now();
                    if now >= deadline {
                        PollState::TimedOut
                    } else {
                        let delay = jitter(backoff).min(deadline - now);
                        let poll = async {
                            tokio::time::sleep(delay).await;
                            self.api
                                .get_job(&project_id, &job_id, location.as_deref())
                                .await
                        };
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => PollState::Cancelled,
                            polled = poll => {
                                let next = PollState::Polling {
                                    attempt: attempt + 1,
                                    backoff: (backoff * 2).min(self.config.max_backoff()),
                                };
                                match polled {
                                    Ok(job) if job.is_done() => finish(job),
                                    Ok(job) => {
                                        debug!(job_id = %job.job_id, state = ?job.state, attempt, "Job still running");
                                        next
                                    }
                                    Err(e) if e.kind() == ErrorKind::Transport
                                        && !matches!(e, BigqueryError::Auth(_)) =>
                                    {
                                        warn!(job_id = %job_id, attempt, error = %e, "Job status poll failed, retrying");
                                        next
                                    }
                                    Err(e) => PollState::Failed(e),
                                }
                            }
                        }
                    }
                }
                PollState::Done(job) => {
                    debug!(job_id = %job.job_id, elapsed = ?started.elapsed(), "Job finished");
                    return Ok(job);
                }
                PollState::Failed(e) => return Err(e),
                PollState::TimedOut => {
                    return Err(BigqueryError::JobTimeout {
                        job_id,
                        waited: started.elapsed(),
                    })
                }
                PollState::Cancelled => return Err(BigqueryError::JobCancelled { job_id }),
            };
        }
    }
}

fn finish(job: JobResource) -> PollState {
    match job.error_result {
        Some(err) => PollState::Failed(BigqueryError::JobFailed {
            job_id: job.job_id,
            reason: err.reason,
            message: err.message,
        }),
        None => PollState::Done(job),
    }
}

/// Random delay in `[backoff / 2, backoff]`.
fn jitter(backoff: Duration) -> Duration {
    let millis = backoff.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::api::JobRequest;
    use crate::client::memory::InMemoryWarehouse;

    fn config(timeout_secs: u64) -> JobPollConfig {
        JobPollConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            timeout_secs,
        }
    }

    async fn submit(warehouse: &InMemoryWarehouse, sql: &str) -> JobResource {
        warehouse
            .insert_job(JobRequest {
                project_id: "p".to_string(),
                job_id: crate::id::generate_job_id(None),
                query: sql.to_string(),
                location: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_done() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.set_polls_until_done(3);
        let job = submit(&warehouse, "SELECT 1").await;
        let cfg = config(60);

        let done = JobPoller::new(&warehouse, &cfg).wait(job).await.unwrap();
        assert!(done.is_done());
        assert_eq!(warehouse.calls().get_job, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_done_job_is_not_polled() {
        let warehouse = InMemoryWarehouse::new();
        let job = submit(&warehouse, "SELECT 1").await;
        let cfg = config(60);

        JobPoller::new(&warehouse, &cfg).wait(job).await.unwrap();
        assert_eq!(warehouse.calls().get_job, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_keeps_remote_payload() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.set_polls_until_done(1);
        warehouse.fail_jobs_matching("bad_table", "notFound", "Not found: Table p:d.bad_table");
        let job = submit(&warehouse, "SELECT * FROM bad_table").await;
        let cfg = config(60);

        let err = JobPoller::new(&warehouse, &cfg).wait(job).await.unwrap_err();
        match err {
            BigqueryError::JobFailed {
                reason, message, ..
            } => {
                assert_eq!(reason, "notFound");
                assert!(message.contains("bad_table"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_job_times_out() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.set_hang_jobs(true);
        let job = submit(&warehouse, "SELECT 1").await;
        let cfg = config(5);

        let err = JobPoller::new(&warehouse, &cfg).wait(job).await.unwrap_err();
        match err {
            BigqueryError::JobTimeout { waited, .. } => {
                assert!(waited >= Duration::from_secs(5));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(warehouse.calls().get_job > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_polling() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.set_hang_jobs(true);
        let job = submit(&warehouse, "SELECT 1").await;
        let cfg = config(600);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let err = JobPoller::new(&warehouse, &cfg)
            .with_cancellation(cancel)
            .wait(job)
            .await
            .unwrap_err();
        assert!(matches!(err, BigqueryError::JobCancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_poll_errors_are_retried() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.set_polls_until_done(1);
        warehouse.fail_next_polls(2);
        let job = submit(&warehouse, "SELECT 1").await;
        let cfg = config(60);

        JobPoller::new(&warehouse, &cfg).wait(job).await.unwrap();
        assert_eq!(warehouse.calls().get_job, 3);
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = jitter(Duration::from_millis(400));
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));
        }
    }
}
