//! Recovers jobs abandoned by crashed workers.
//!
//! A fetched job stays on the in-flight list of storage until its worker
//! resolves it. A worker that dies without resolving its handle, for
//! instance because its process was killed, leaves the entry behind. The
//! [`FetchedJobsWatcher`] periodically requeues entries that have been in
//! flight for longer than the invisibility timeout, so another worker
//! eventually retries them.
//!
//! The invisibility timeout must be longer than the longest job: a job still
//! being performed when its timeout passes is requeued and performed twice.

use std::time::Duration;

use tracing::instrument;

use crate::storage::{JobStorage, Result, StorageConnection};

/// Requeues in-flight jobs whose worker seems to be gone.
#[derive(Debug, Clone)]
pub struct FetchedJobsWatcher {
    invisibility_timeout: Duration,
    check_interval: Duration,
}

impl Default for FetchedJobsWatcher {
    fn default() -> Self {
        Self {
            invisibility_timeout: Duration::from_secs(30 * 60),
            check_interval: Duration::from_secs(60),
        }
    }
}

impl FetchedJobsWatcher {
    /// Creates a watcher with the default timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long a job may stay in flight before it's requeued.
    ///
    /// Default value is 30 minutes.
    pub fn invisibility_timeout(mut self, timeout: Duration) -> Self {
        self.invisibility_timeout = timeout;
        self
    }

    /// Sets how long to wait between checks.
    ///
    /// Default value is 1 minute.
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Runs one check over `storage`, then waits for the check interval.
    pub async fn run_once(&self, storage: &dyn JobStorage) -> Result {
        let connection = storage.connection().await?;
        self.requeue_timed_out_jobs(&*connection).await?;
        tokio::time::sleep(self.check_interval).await;
        Ok(())
    }

    /// Requeues timed out in-flight jobs, returning how many were requeued.
    #[instrument(skip_all, fields(invisibility_timeout = ?self.invisibility_timeout), err)]
    pub async fn requeue_timed_out_jobs(
        &self,
        connection: &dyn StorageConnection,
    ) -> Result<usize> {
        let requeued = connection
            .requeue_timed_out_jobs(self.invisibility_timeout)
            .await?;
        if requeued > 0 {
            tracing::warn!(requeued, "Requeued jobs abandoned by their workers");
        }
        Ok(requeued)
    }
}
