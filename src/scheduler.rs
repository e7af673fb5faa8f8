//! Batch-synchronous dispatch of image tasks.
//!
//! Tasks are cut into fixed-size batches. Every task of a batch runs
//! concurrently and the whole batch is joined before the next one starts,
//! so at most `batch_size` pipelines are ever in flight and the HTTP client
//! is never swapped under a running task.

use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;

use reqwest::Client;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::SchedulePolicy;
use crate::models::task::ImageTask;
use crate::services::identity::{Identity, IdentityProvider};

/// Where batches get their HTTP client from.
pub enum ClientSource<P> {
    /// One client for the whole run.
    Fixed(Client),
    /// A fresh identity per rotation, cycling through state directories.
    Rotating { provider: P, data_dirs: Vec<PathBuf> },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Tasks not attempted because their batch had no connection.
    pub skipped: usize,
    pub rotations: usize,
}

pub struct BatchScheduler<P> {
    policy: SchedulePolicy,
    source: ClientSource<P>,
    next_data_dir: usize,
    rotations: usize,
    identity: Option<Identity>,
}

impl<P: IdentityProvider> BatchScheduler<P> {
    pub fn new(policy: SchedulePolicy, source: ClientSource<P>) -> Result<Self, SchedulerError> {
        if policy.batch_size == 0 {
            return Err(SchedulerError::ZeroBatchSize);
        }
        if let ClientSource::Rotating { data_dirs, .. } = &source {
            if data_dirs.is_empty() {
                return Err(SchedulerError::NoDataDirs);
            }
        }
        Ok(Self {
            policy,
            source,
            next_data_dir: 0,
            rotations: 0,
            identity: None,
        })
    }

    /// Run every task through `process`, batch by batch.
    ///
    /// A failing task is logged and counted; it never stops its siblings or
    /// later batches. The live identity is torn down before returning.
    pub async fn run<F, Fut, T, E>(&mut self, tasks: Vec<ImageTask>, process: F) -> RunSummary
    where
        F: Fn(Client, ImageTask) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let total = tasks.len().div_ceil(self.policy.batch_size);
        let mut summary = RunSummary {
            batches: total,
            ..RunSummary::default()
        };

        for (index, batch) in tasks.chunks(self.policy.batch_size).enumerate() {
            if self.rotation_due(index) {
                self.rotate().await;
            }

            let Some(client) = self.current_client() else {
                warn!(batch = index + 1, total, size = batch.len(), "No connection, skipping batch");
                summary.skipped += batch.len();
                continue;
            };

            info!(batch = index + 1, total, size = batch.len(), "Dispatching batch");
            let mut workers = JoinSet::new();
            for task in batch {
                let name = task.name.clone();
                let work = process(client.clone(), task.clone());
                workers.spawn(async move { (name, work.await) });
            }

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok((name, Ok(_))) => {
                        info!(image = %name, "Successfully processed image");
                        summary.succeeded += 1;
                    }
                    Ok((name, Err(e))) => {
                        error!(image = %name, error = %e, "Failed to process image");
                        summary.failed += 1;
                    }
                    Err(e) => {
                        error!(error = %e, "Image task panicked");
                        summary.failed += 1;
                    }
                }
            }

            if self.cooldown_due(index, total) {
                info!(seconds = self.policy.cooldown.as_secs(), "Cooling down before next batch");
                tokio::time::sleep(self.policy.cooldown).await;
            }
        }

        self.release().await;
        summary.rotations = self.rotations;
        summary
    }

    fn rotation_due(&self, index: usize) -> bool {
        matches!(self.source, ClientSource::Rotating { .. })
            && self.policy.rotate_every.is_some_and(|k| index % k == 0)
    }

    fn cooldown_due(&self, index: usize, total: usize) -> bool {
        index + 1 < total && self.policy.cooldown_every.is_some_and(|k| (index + 1) % k == 0)
    }

    fn current_client(&self) -> Option<Client> {
        match &self.source {
            ClientSource::Fixed(client) => Some(client.clone()),
            ClientSource::Rotating { .. } => self.identity.as_ref().map(|i| i.client().clone()),
        }
    }

    /// Tear down the live identity, then start one on the next state directory.
    async fn rotate(&mut self) {
        self.release().await;

        let ClientSource::Rotating { provider, data_dirs } = &self.source else {
            return;
        };
        let data_dir = &data_dirs[self.next_data_dir % data_dirs.len()];
        self.next_data_dir += 1;
        self.rotations += 1;

        info!(rotation = self.rotations, data_dir = %data_dir.display(), "Changing identity");
        match provider.rotate(data_dir).await {
            Ok(identity) => self.identity = Some(identity),
            Err(e) => error!(data_dir = %data_dir.display(), error = %e, "Error switching identity"),
        }
    }

    async fn release(&mut self) {
        if let Some(identity) = self.identity.take() {
            identity.shutdown().await;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Batch size must be at least 1")]
    ZeroBatchSize,

    #[error("No data directories found")]
    NoDataDirs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::identity::IdentityError;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct FakeProvider {
        rotated: Arc<Mutex<Vec<PathBuf>>>,
        fail_first: bool,
    }

    impl IdentityProvider for FakeProvider {
        fn rotate(&self, data_dir: &Path) -> impl Future<Output = Result<Identity, IdentityError>> + Send {
            let mut rotated = self.rotated.lock().unwrap();
            rotated.push(data_dir.to_path_buf());
            let result = if self.fail_first && rotated.len() == 1 {
                Err(IdentityError::Exited)
            } else {
                Ok(Identity::direct(Client::new(), data_dir))
            };
            async move { result }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Start(String),
        End(String),
    }

    fn tasks(n: usize) -> Vec<ImageTask> {
        (0..n)
            .map(|i| ImageTask::new(PathBuf::from(format!("img/{i}.jpg"))))
            .collect()
    }

    fn policy(batch_size: usize) -> SchedulePolicy {
        SchedulePolicy {
            batch_size,
            rotate_every: None,
            cooldown_every: None,
            cooldown: Duration::ZERO,
        }
    }

    fn rotating(dirs: &[&str], provider: FakeProvider) -> ClientSource<FakeProvider> {
        ClientSource::Rotating {
            provider,
            data_dirs: dirs.iter().map(PathBuf::from).collect(),
        }
    }

    async fn ok_after(delay: Duration) -> Result<(), String> {
        tokio::time::sleep(delay).await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_joined_before_the_next_starts() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler =
            BatchScheduler::<FakeProvider>::new(policy(2), ClientSource::Fixed(Client::new())).unwrap();

        let recorder = events.clone();
        let summary = scheduler
            .run(tasks(5), move |_, task| {
                let events = recorder.clone();
                async move {
                    events.lock().unwrap().push(Event::Start(task.name.clone()));
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    events.lock().unwrap().push(Event::End(task.name));
                    Ok::<_, String>(())
                }
            })
            .await;

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.succeeded, 5);

        let events = events.lock().unwrap();
        let position = |e: Event| events.iter().position(|x| *x == e).unwrap();
        let batches: [&[&str]; 3] = [&["0.jpg", "1.jpg"], &["2.jpg", "3.jpg"], &["4.jpg"]];
        for pair in batches.windows(2) {
            let last_end = pair[0].iter().map(|n| position(Event::End(n.to_string()))).max().unwrap();
            let first_start = pair[1].iter().map(|n| position(Event::Start(n.to_string()))).min().unwrap();
            assert!(last_end < first_start, "batch overlap in {events:?}");
        }
        // Tasks of one batch run side by side.
        assert!(position(Event::Start("1.jpg".into())) < position(Event::End("0.jpg".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_isolated() {
        let mut scheduler =
            BatchScheduler::<FakeProvider>::new(policy(2), ClientSource::Fixed(Client::new())).unwrap();

        let summary = scheduler
            .run(tasks(4), |_, task| async move {
                if task.name == "1.jpg" {
                    Err("upload failed".to_string())
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_counts_as_failure() {
        let mut scheduler =
            BatchScheduler::<FakeProvider>::new(policy(2), ClientSource::Fixed(Client::new())).unwrap();

        let summary = scheduler
            .run(tasks(2), |_, task| async move {
                if task.name == "0.jpg" {
                    panic!("boom");
                }
                Ok::<_, String>(())
            })
            .await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rotates_round_robin_on_schedule() {
        let provider = FakeProvider::default();
        let rotated = provider.rotated.clone();
        let mut policy = policy(1);
        policy.rotate_every = Some(2);
        let mut scheduler =
            BatchScheduler::new(policy, rotating(&["d1", "d2", "d3"], provider)).unwrap();

        let summary = scheduler
            .run(tasks(9), |_, _| ok_after(Duration::from_millis(1)))
            .await;

        assert_eq!(summary.succeeded, 9);
        assert_eq!(summary.rotations, 5);
        let rotated: Vec<_> = rotated.lock().unwrap().iter().map(|p| p.display().to_string()).collect();
        assert_eq!(rotated, ["d1", "d2", "d3", "d1", "d2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rotation_skips_batches_until_next_rotation() {
        let provider = FakeProvider {
            fail_first: true,
            ..FakeProvider::default()
        };
        let mut policy = policy(2);
        policy.rotate_every = Some(2);
        let mut scheduler = BatchScheduler::new(policy, rotating(&["d1", "d2"], provider)).unwrap();

        let summary = scheduler
            .run(tasks(5), |_, _| ok_after(Duration::from_millis(1)))
            .await;

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.skipped, 4);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.rotations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_every_k_batches_but_not_after_last() {
        let mut policy = policy(1);
        policy.cooldown_every = Some(2);
        policy.cooldown = Duration::from_secs(60);
        let mut scheduler =
            BatchScheduler::<FakeProvider>::new(policy, ClientSource::Fixed(Client::new())).unwrap();

        let started = tokio::time::Instant::now();
        let summary = scheduler.run(tasks(4), |_, _| ok_after(Duration::ZERO)).await;

        assert_eq!(summary.succeeded, 4);
        // Pause after the second batch only; the fourth is last.
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[test]
    fn rotating_without_data_dirs_is_rejected() {
        let result = BatchScheduler::new(policy(2), rotating(&[], FakeProvider::default()));
        assert!(matches!(result, Err(SchedulerError::NoDataDirs)));
    }

    #[tokio::test]
    async fn empty_run_does_nothing() {
        let provider = FakeProvider::default();
        let rotated = provider.rotated.clone();
        let mut policy = policy(2);
        policy.rotate_every = Some(2);
        let mut scheduler = BatchScheduler::new(policy, rotating(&["d1"], provider)).unwrap();

        let summary = scheduler.run(Vec::new(), |_, _| ok_after(Duration::ZERO)).await;
        assert_eq!(summary, RunSummary::default());
        assert!(rotated.lock().unwrap().is_empty());
    }
}
