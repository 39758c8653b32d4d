//! Reconciliation of pending downloads.
//!
//! A transfer code handed to the [`Scheduler`] may not be resolvable yet: the registry is eventually consistent and
//! a sender may still be pushing chunks. Pending codes are retried on every synchronization pass until they
//! complete or run out of attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Settings;
use crate::download::Downloader;
use crate::ident::TransferCode;
use crate::registry::Registry;
use crate::Error;

/// A scheduled download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub transfer_code: TransferCode,
    /// Failed attempts so far.
    pub retries: u32,
    pub last_attempt: Option<Instant>,
}

impl DownloadTask {
    fn new(transfer_code: TransferCode) -> Self {
        Self {
            transfer_code,
            retries: 0,
            last_attempt: None,
        }
    }

    #[inline]
    fn is_waiting(&self, now: Instant, retry_delay: Duration) -> bool {
        self.last_attempt.is_some_and(|last| now.saturating_duration_since(last) < retry_delay)
    }
}

/// Outcome of one synchronization pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub completed: usize,
    pub retried: usize,
    pub abandoned: usize,
    /// Tasks left untouched because attempted too recently.
    pub skipped: usize,
}

/// Retries pending downloads until they complete or get abandoned.
#[derive(Debug)]
pub struct Scheduler<R> {
    downloader: Downloader<R>,
    /// Locked for a whole pass, so that passes never overlap.
    tasks: Mutex<HashMap<TransferCode, DownloadTask>>,
    max_retries: u32,
    retry_delay: Duration,
}

impl<R: Registry> Scheduler<R> {
    pub fn new(downloader: Downloader<R>, settings: &Settings) -> Self {
        Self {
            downloader,
            tasks: Mutex::default(),
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay,
        }
    }

    #[inline]
    pub fn downloader(&self) -> &Downloader<R> {
        &self.downloader
    }

    /// Schedule the download of `code` and run a pass right away.
    ///
    /// An already scheduled code keeps its retry count.
    pub async fn add_task(&self, code: TransferCode) -> SyncReport {
        self.tasks
            .lock()
            .await
            .entry(code.clone())
            .or_insert_with(|| DownloadTask::new(code));

        self.sync().await
    }

    /// Pending tasks, ordered by transfer code.
    pub async fn pending(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = self.tasks.lock().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.transfer_code.cmp(&b.transfer_code));
        tasks
    }

    /// Attempt every pending task not attempted within the retry delay.
    pub async fn sync(&self) -> SyncReport {
        let mut tasks = self.tasks.lock().await;
        let mut report = SyncReport::default();

        let mut codes: Vec<_> = tasks.keys().cloned().collect();
        codes.sort();

        let now = Instant::now();

        for code in codes {
            let Some(task) = tasks.get_mut(&code) else {
                continue;
            };

            if task.is_waiting(now, self.retry_delay) {
                report.skipped += 1;
                continue;
            }

            task.last_attempt = Some(Instant::now());

            match self.downloader.download(&code).await {
                Ok(downloaded) => {
                    tracing::debug!("Transfer {code} completed: `{}`", downloaded.path.display());

                    tasks.remove(&code);
                    report.completed += 1;
                }
                Err(err) => {
                    task.retries += 1;

                    if task.retries >= self.max_retries {
                        let retries = task.retries;
                        tasks.remove(&code);

                        tracing::warn!("{} (last error: {err})", Error::Abandoned { code, retries });
                        report.abandoned += 1;
                    } else {
                        tracing::debug!("Transfer {code} attempt {}/{} failed: {err}", task.retries, self.max_retries);
                        report.retried += 1;
                    }
                }
            }
        }

        report
    }
}

impl<R: Registry + 'static> Scheduler<R> {
    /// Run synchronization passes every `period` in the background.
    ///
    /// Submitted codes are scheduled by the same background task, in between passes.
    pub fn start(self: Arc<Self>, period: Duration) -> SchedulerHandle {
        let (sender, mut receiver) = mpsc::unbounded_channel::<TransferCode>();

        tracing::debug!("Starting scheduler, syncing every {period:?}...");

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = self.sync().await;
                        tracing::trace!("Sync pass: {report:?}");
                    }
                    message = receiver.recv() => match message {
                        Some(code) => {
                            tracing::debug!("Scheduling transfer {code}");

                            let report = self.add_task(code).await;
                            tracing::trace!("Sync pass: {report:?}");
                        }
                        None => {
                            tracing::debug!("All submissions handled, shutting down scheduler.");
                            break;
                        }
                    }
                }
            }
        });

        SchedulerHandle {
            sender: Some(sender),
            handle,
        }
    }
}

/// Handle on a running [`Scheduler`].
///
/// Dropping the handle aborts the background task.
#[derive(Debug)]
pub struct SchedulerHandle {
    sender: Option<mpsc::UnboundedSender<TransferCode>>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Schedule the download of `code`.
    pub fn submit(&self, code: TransferCode) {
        let sent = self.sender.as_ref().is_some_and(|sender| sender.send(code.clone()).is_ok());

        if !sent {
            tracing::warn!("Scheduler stopped, transfer {code} not scheduled");
        }
    }

    /// Stop the scheduler once already submitted codes have been handled.
    pub async fn close(mut self) {
        self.sender.take();

        if let Err(err) = (&mut self.handle).await {
            tracing::warn!("Scheduler task failed: {err}");
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
