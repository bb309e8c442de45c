//! The job runner: lifecycle owner for every job.
//!
//! # Lifecycle
//!
//! ```text
//! submit ──► PENDING ──dispatch──► RUNNING ──► SUCCEEDED
//!                                     │
//!                                     └──────► FAILED
//! ```
//!
//! - **Submit** validates parameters, seals any secret into an in-memory
//!   [`Envelope`], creates the record and pushes the id on a FIFO queue.
//! - **Dispatch** is a single loop that pops ids in order and waits for one of
//!   N worker slots before moving a job to `running`. At most N jobs are ever
//!   `running` at once; the rest stay `pending`.
//! - **Execute** resolves defaults from the current settings, unseals the
//!   secret right before the adapter call and drops it once the call has
//!   returned and its progress is stored. Adapter calls run in their own
//!   task so a panic becomes a failure of that job.
//! - **Finalize** writes exactly one of `result` / `error`. Nothing that goes
//!   wrong inside a job escapes this boundary; store errors at this point are
//!   logged.
//!
//! Progress reports travel over a channel and are appended in order by a
//! forwarder task, with the job's secret masked; the forwarder is drained before the job is finalized, so
//! every report lands in the log before the terminal status does.
//!
//! # Restart
//!
//! [`JobRunner::start`] fails every job the previous process left `running`
//! (kind `Interrupted`) and re-queues stored `pending` jobs. Envelopes never
//! outlive the process, so a re-queued job that needed a secret fails with
//! `Interrupted` when it is dispatched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{self, Adapter, AdapterContext, ProgressReporter};
use crate::config::MAX_WORKERS;
use crate::credentials::{redact, redact_update, CredentialGuard, Envelope};
use crate::error::{ErrorKind, JobError, JobFailure, JobResult};
use crate::models::{Job, JobOutput, JobStatus, JobType, ProgressUpdate};
use crate::params::JobParams;
use crate::settings::SettingsStore;
use crate::store::JobStore;

/// Per-process state that must never reach the store.
#[derive(Default)]
struct Ledger {
    /// Sealed secrets of jobs that have not started yet.
    envelopes: HashMap<String, Envelope>,
    /// Cancellation tokens of jobs currently executing.
    active: HashMap<String, CancellationToken>,
    /// Pending jobs to fail as `Cancelled` once dispatched, because no
    /// worker slot was free when cancellation was asked for.
    cancel_requested: HashSet<String>,
}

pub struct JobRunner {
    store: Arc<dyn JobStore>,
    settings: Arc<SettingsStore>,
    adapter: Arc<dyn Adapter>,
    guard: Arc<CredentialGuard>,
    workers: usize,
    slots: Arc<Semaphore>,
    queue: mpsc::UnboundedSender<String>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    ledger: Mutex<Ledger>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobRunner {
    /// Creates a runner with `workers` slots, clamped to `1..=MAX_WORKERS`.
    /// Nothing is dispatched until [`start`](JobRunner::start) is called.
    pub fn new(
        store: Arc<dyn JobStore>,
        settings: Arc<SettingsStore>,
        adapter: Arc<dyn Adapter>,
        guard: Arc<CredentialGuard>,
        workers: usize,
    ) -> Arc<Self> {
        let workers = workers.clamp(1, MAX_WORKERS);
        let (queue, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            settings,
            adapter,
            guard,
            workers,
            slots: Arc::new(Semaphore::new(workers)),
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
            ledger: Mutex::new(Ledger::default()),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Reconciles leftovers from a previous process, re-queues pending jobs
    /// and starts the dispatch loop. Call once, before the first submit.
    pub async fn start(self: &Arc<Self>) -> JobResult<()> {
        let rx = self
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| JobError::Other(anyhow::anyhow!("job runner already started")))?;

        for id in self.store.reconcile_interrupted().await? {
            warn!(job_id = %id, "job was running when the process stopped, marked failed");
        }

        let pending = self.store.pending_ids().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "re-queueing pending jobs");
        }
        for id in pending {
            let _ = self.queue.send(id);
        }

        let runner = Arc::clone(self);
        let handle = tokio::spawn(async move { runner.dispatch_loop(rx).await });
        *self.dispatcher.lock().await = Some(handle);

        info!(workers = self.workers, key_id = %self.guard.key_id(), "job runner started");
        Ok(())
    }

    /// Stops dispatching and waits for every executing job to finish. Jobs
    /// still queued stay `pending` in the store.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatch loop ended abnormally");
            }
        }
        // All slots free means nothing is executing.
        match self.slots.acquire_many(self.workers as u32).await {
            Ok(permits) => drop(permits),
            Err(e) => error!(error = %e, "worker slots closed during shutdown"),
        }
        info!("job runner stopped");
    }

    /// Validates and records a new job, then queues it.
    ///
    /// The only errors are synchronous: an invalid request creates nothing.
    /// The secret, if any, is sealed before this returns and the plaintext
    /// is dropped.
    pub async fn submit(
        &self,
        job_type: JobType,
        parameters: &serde_json::Value,
        secret: Option<SecretString>,
    ) -> JobResult<Job> {
        let params = JobParams::parse(job_type, parameters)?;
        params.check_secret(secret.is_some())?;

        let envelope = match secret {
            Some(secret) => Some(self.guard.seal(&secret)?),
            None => None,
        };

        let job = self
            .store
            .create(job_type, params.to_json(), envelope.is_some())
            .await?;

        if let Some(envelope) = envelope {
            self.ledger
                .lock()
                .await
                .envelopes
                .insert(job.id.clone(), envelope);
        }

        info!(job_id = %job.id, job_type = %job_type, "job submitted");
        if self.queue.send(job.id.clone()).is_err() {
            warn!(job_id = %job.id, "runner is stopped, job stays pending until the next start");
        }
        Ok(job)
    }

    /// Best-effort cancellation.
    ///
    /// A `pending` job is failed with kind `Cancelled` without reaching the
    /// adapter: at once if a worker slot is free, otherwise by the dispatcher
    /// when its turn comes. A `running` job has its adapter's cancellation
    /// token fired; if the adapter then fails the job is recorded as
    /// `Cancelled`, if it succeeds anyway the result stands.
    ///
    /// Returns `false` for jobs that are already terminal, and
    /// `InvalidState` for a job some other process is running.
    pub async fn cancel(&self, id: &str) -> JobResult<bool> {
        if self.store.get(id).await?.status == JobStatus::Pending {
            if let Some(cancelled) = self.cancel_pending(id).await? {
                return Ok(cancelled);
            }
        }

        // The dispatcher claims jobs and registers their tokens under this
        // lock, so a job running here is always in `active`.
        let ledger = self.ledger.lock().await;
        if let Some(token) = ledger.active.get(id) {
            token.cancel();
            info!(job_id = %id, "cancellation requested for running job");
            return Ok(true);
        }
        let job = self.store.get(id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        Err(JobError::InvalidState {
            id: id.to_string(),
            status: job.status.to_string(),
            action: "cancel it outside the process running it",
        })
    }

    /// Cancels a job that was `pending` when looked up. Returns `None` when
    /// it stopped being pending in the meantime.
    async fn cancel_pending(&self, id: &str) -> JobResult<Option<bool>> {
        let Ok(_permit) = self.slots.try_acquire() else {
            let mut ledger = self.ledger.lock().await;
            if let Some(token) = ledger.active.get(id) {
                token.cancel();
                return Ok(Some(true));
            }
            if self.store.get(id).await?.status != JobStatus::Pending {
                return Ok(None);
            }
            ledger.cancel_requested.insert(id.to_string());
            info!(job_id = %id, "every worker slot is busy, job will be cancelled when dispatched");
            return Ok(Some(true));
        };

        match self.store.transition_to_running(id).await {
            Ok(_) => {
                self.ledger.lock().await.envelopes.remove(id);
                self.store
                    .fail(
                        id,
                        JobFailure::new(ErrorKind::Cancelled, "cancelled before it started"),
                    )
                    .await?;
                info!(job_id = %id, "pending job cancelled");
                Ok(Some(true))
            }
            Err(JobError::InvalidState { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        loop {
            let id = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let token = CancellationToken::new();
            let claimed = {
                let mut ledger = self.ledger.lock().await;
                match self.store.transition_to_running(&id).await {
                    Ok(job) => {
                        if ledger.cancel_requested.remove(&id) {
                            token.cancel();
                        }
                        ledger.active.insert(id.clone(), token.clone());
                        Some((job, ledger.envelopes.remove(&id)))
                    }
                    Err(JobError::InvalidState { .. }) => {
                        // Claimed elsewhere: cancelled while queued, queued
                        // twice, or finished by another process.
                        ledger.envelopes.remove(&id);
                        ledger.cancel_requested.remove(&id);
                        debug!(job_id = %id, "skipping job that is no longer pending");
                        None
                    }
                    Err(e) => {
                        error!(job_id = %id, error = %e, "failed to start job");
                        None
                    }
                }
            };
            let Some((job, envelope)) = claimed else {
                continue;
            };

            let runner = Arc::clone(&self);
            tokio::spawn(async move {
                runner.execute(job, token, envelope).await;
                drop(permit);
            });
        }
        debug!("dispatch loop stopped");
    }

    async fn execute(&self, job: Job, token: CancellationToken, envelope: Option<Envelope>) {
        let id = job.id.clone();
        let job_type = job.job_type;
        info!(job_id = %id, job_type = %job_type, "job started");

        let outcome = self.run(job, token, envelope).await;

        let finalized = match outcome {
            Ok(output) => {
                let result = self.store.complete(&id, output).await;
                if result.is_ok() {
                    info!(job_id = %id, job_type = %job_type, "job succeeded");
                }
                result
            }
            Err(failure) => {
                warn!(
                    job_id = %id,
                    job_type = %job_type,
                    error_kind = %failure.kind,
                    error = %failure.message,
                    "job failed"
                );
                self.store.fail(&id, failure).await
            }
        };
        if let Err(e) = finalized {
            error!(job_id = %id, error = %e, "failed to record job outcome");
        }

        let mut ledger = self.ledger.lock().await;
        ledger.active.remove(&id);
        ledger.cancel_requested.remove(&id);
    }

    /// Everything between `running` and the terminal write.
    async fn run(
        &self,
        job: Job,
        token: CancellationToken,
        envelope: Option<Envelope>,
    ) -> Result<JobOutput, JobFailure> {
        if token.is_cancelled() {
            return Err(JobFailure::new(
                ErrorKind::Cancelled,
                "cancelled before the adapter was called",
            ));
        }

        let mut params = JobParams::parse(job.job_type, &job.parameters)
            .map_err(|e| JobFailure::new(ErrorKind::ValidationError, e.to_string()))?;
        let settings = self.settings.get().await;
        params.apply_defaults(&settings);

        let secret = if job.has_credential {
            let envelope = envelope.ok_or_else(|| {
                JobFailure::new(
                    ErrorKind::Interrupted,
                    "credential was lost when the process restarted; resubmit the job",
                )
            })?;
            let secret = self
                .guard
                .unseal(envelope)
                .map_err(|e| JobFailure::new(ErrorKind::DecryptionError, e.to_string()))?;
            Some(Arc::new(secret))
        } else {
            None
        };

        let (progress, rx) = ProgressReporter::channel();
        let done = CancellationToken::new();
        let forwarder = self.spawn_forwarder(job.id.clone(), rx, done.clone(), secret.clone());

        let ctx = AdapterContext {
            progress,
            settings,
            cancel: token.clone(),
        };
        let adapter = Arc::clone(&self.adapter);
        let call = tokio::spawn(async move {
            let outcome =
                adapter::dispatch(adapter.as_ref(), &params, secret.as_deref(), &ctx).await;
            // This task's handle on the secret and the reporter in `ctx` are
            // dropped when it ends.
            outcome.map_err(|e| redact(&format!("{:#}", e), secret.as_deref()))
        });

        let outcome = match call.await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(message)) if token.is_cancelled() => {
                Err(JobFailure::new(ErrorKind::Cancelled, message))
            }
            Ok(Err(message)) => Err(JobFailure::new(ErrorKind::AdapterError, message)),
            Err(e) => Err(JobFailure::new(
                ErrorKind::AdapterError,
                format!("adapter panicked: {}", panic_message(e)),
            )),
        };

        done.cancel();
        if let Err(e) = forwarder.await {
            error!(job_id = %job.id, error = %e, "progress forwarder ended abnormally");
        }
        outcome
    }

    /// Appends reports to the store in arrival order, with the job's secret
    /// masked, until `done` fires and the channel is empty.
    fn spawn_forwarder(
        &self,
        id: String,
        mut rx: mpsc::UnboundedReceiver<ProgressUpdate>,
        done: CancellationToken,
        secret: Option<Arc<SecretString>>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    biased;
                    update = rx.recv() => update,
                    _ = done.cancelled() => {
                        rx.close();
                        rx.recv().await
                    }
                };
                let Some(update) = update else { break };
                let update = redact_update(update, secret.as_deref());
                if let Err(e) = store.append_progress(&id, update).await {
                    warn!(job_id = %id, error = %e, "failed to record progress");
                }
            }
        })
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
