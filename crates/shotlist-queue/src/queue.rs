//! Single-slot job admission queue.
//!
//! Jobs wait in an in-memory FIFO and run one at a time through their
//! pipeline steps. Every state change goes through one serialized
//! read-modify-write path that persists the full record before the next
//! step starts, so pollers only ever see state move forward.
//!
//! While the description step runs, the worker process owns the record
//! file and rewrites it in place. Changes made by the queue in that window
//! (annotations) are kept in memory and merged back when the worker is done.
//!
//! Queue contents do not survive a restart. [`JobQueue::start`] marks
//! records left mid-pipeline by a previous process as failed.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use serde::Serialize;
use shotlist_analyzer::Analyzer;
use shotlist_models::{Annotations, Job, JobId, JobState, PipelineStep, ProgressRecord};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::error::{QueueError, QueueResult};
use crate::finalize::{Finalizer, ReportWriter};
use crate::logging::JobLogger;
use crate::store::ProgressStore;

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Appended to the FIFO with a fresh `Submitted` record
    Accepted,
    /// Same id already waiting or running; nothing changed
    AlreadyQueued,
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub active: Option<JobId>,
    pub pending: Vec<JobId>,
}

struct ActiveJob {
    id: JobId,
    worker_owns_record: bool,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    active: Option<ActiveJob>,
    /// Last record written for each pending or active job
    records: HashMap<JobId, ProgressRecord>,
}

impl QueueState {
    fn is_active(&self, id: &JobId) -> bool {
        self.active.as_ref().map(|a| &a.id == id).unwrap_or(false)
    }

    fn in_flight(&self, id: &JobId) -> bool {
        self.is_active(id) || self.pending.iter().any(|j| &j.id == id)
    }

    fn position(&self, id: &JobId) -> Option<usize> {
        self.pending.iter().position(|j| &j.id == id)
    }

    fn worker_owns(&self, id: &JobId) -> bool {
        self.active
            .as_ref()
            .map(|a| &a.id == id && a.worker_owns_record)
            .unwrap_or(false)
    }

    fn set_worker_owns(&mut self, id: &JobId, owns: bool) {
        if let Some(active) = self.active.as_mut() {
            if &active.id == id {
                active.worker_owns_record = owns;
            }
        }
    }

    fn report_length(&self) {
        gauge!("shotlist_queue_length").set(self.pending.len() as f64);
    }
}

struct Inner {
    analyzer: Arc<dyn Analyzer>,
    finalizer: Arc<dyn Finalizer>,
    store: ProgressStore,
    state: Mutex<QueueState>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    runner: StdMutex<Option<JoinHandle<()>>>,
}

/// Long-lived queue service. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// Queue writing reports with [`ReportWriter`].
    pub fn new(store: ProgressStore, analyzer: Arc<dyn Analyzer>) -> Self {
        let finalizer = Arc::new(ReportWriter::new(store.config().report_file.clone()));
        Self::with_finalizer(store, analyzer, finalizer)
    }

    pub fn with_finalizer(
        store: ProgressStore,
        analyzer: Arc<dyn Analyzer>,
        finalizer: Arc<dyn Finalizer>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                analyzer,
                finalizer,
                store,
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                shutdown,
                started: AtomicBool::new(false),
                runner: StdMutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &ProgressStore {
        &self.inner.store
    }

    /// Job for `input_path` writing into the store's directory for `id`.
    ///
    /// A relative input path is resolved against the current directory.
    pub fn new_job(&self, id: JobId, input_path: impl Into<PathBuf>) -> Job {
        let input_path = input_path.into();
        let input_path = std::path::absolute(&input_path).unwrap_or(input_path);
        let output_dir = self.inner.store.job_dir(&id);
        Job::new(id, input_path, output_dir)
    }

    /// Recover from a previous run and start the runner task.
    ///
    /// Calling it again is a no-op.
    pub async fn start(&self) -> QueueResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let recovered = self.inner.recover().await?;
        if recovered > 0 {
            info!(recovered, "Marked interrupted jobs from a previous run as failed");
        }

        let runner = tokio::spawn(Arc::clone(&self.inner).run_loop());
        *self.inner.runner.lock().unwrap_or_else(|e| e.into_inner()) = Some(runner);
        Ok(())
    }

    /// Runner started and no shutdown requested.
    pub fn is_accepting(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !*self.inner.shutdown.borrow()
    }

    /// Enqueue a job.
    ///
    /// Resubmitting an id that is already waiting or running changes nothing.
    /// Resubmitting a finished job starts it over, keeping its annotations.
    pub async fn submit(&self, job: Job) -> QueueResult<SubmitOutcome> {
        if !job.id.is_valid() {
            return Err(QueueError::invalid_job(format!("invalid job id: {:?}", job.id.as_str())));
        }
        if job.steps.is_empty() {
            return Err(QueueError::invalid_job("no pipeline steps"));
        }
        if *self.inner.shutdown.borrow() {
            return Err(QueueError::ShuttingDown);
        }

        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.in_flight(&job.id) {
            debug!(job_id = %job.id, "Job already queued, ignoring resubmission");
            return Ok(SubmitOutcome::AlreadyQueued);
        }

        let mut record = ProgressRecord::submitted(job.id.clone());
        match inner.store.read(&job.id).await {
            Ok(Some(previous)) => record.apply_annotations(&previous.annotations()),
            Ok(None) => {}
            Err(e) => warn!(job_id = %job.id, "Previous record unreadable, starting fresh: {}", e),
        }
        inner.store.write(&record).await?;

        let job_id = job.id.clone();
        state.records.insert(job_id.clone(), record);
        state.pending.push_back(job);
        state.report_length();
        let position = state.pending.len() - 1;
        drop(state);

        counter!("shotlist_jobs_submitted_total").increment(1);
        info!(job_id = %job_id, position, "Job accepted");
        inner.wake.notify_one();
        Ok(SubmitOutcome::Accepted)
    }

    /// Current record, or `None` if the job was never submitted.
    ///
    /// Waiting jobs carry their FIFO position.
    pub async fn status(&self, id: &JobId) -> QueueResult<Option<ProgressRecord>> {
        let inner = &self.inner;
        let state = inner.state.lock().await;
        let cached = state.records.get(id).cloned();

        let mut record = match cached {
            Some(cached) if state.worker_owns(id) => match inner.store.read(id).await {
                Ok(Some(mut on_disk)) => {
                    on_disk.status = cached.status;
                    on_disk.apply_annotations(&cached.annotations());
                    on_disk
                }
                Ok(None) => cached,
                Err(e) => {
                    debug!(job_id = %id, "Record mid-rewrite, serving last written: {}", e);
                    cached
                }
            },
            Some(cached) => cached,
            None => match inner.store.read(id).await? {
                Some(record) => record,
                None => return Ok(None),
            },
        };

        record.queue_position = state.position(id);
        Ok(Some(record))
    }

    /// Update the user annotation fields. Allowed in any state.
    pub async fn annotate(&self, id: &JobId, annotations: Annotations) -> QueueResult<ProgressRecord> {
        self.inner
            .update(id, move |record| {
                record.apply_annotations(&annotations);
                Ok(())
            })
            .await?;
        self.status(id)
            .await?
            .ok_or_else(|| QueueError::not_found(id.to_string()))
    }

    /// Delete the job's directory: record, screenshots and report.
    pub async fn delete(&self, id: &JobId) -> QueueResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.in_flight(id) {
            return Err(QueueError::conflict(format!("{} is queued or running", id)));
        }

        match inner.store.read(id).await {
            Ok(Some(record)) if record.is_in_progress() => {
                return Err(QueueError::conflict(format!("{} is {}", id, record.status)));
            }
            Ok(_) => {}
            // Nothing writes a record that is not in flight, so a broken one stays broken.
            Err(e) => warn!(job_id = %id, "Deleting job with unreadable record: {}", e),
        }

        if !inner.store.delete(id).await? {
            return Err(QueueError::not_found(id.to_string()));
        }
        state.records.remove(id);
        info!(job_id = %id, "Job deleted");
        Ok(())
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock().await;
        QueueSnapshot {
            active: state.active.as_ref().map(|a| a.id.clone()),
            pending: state.pending.iter().map(|j| j.id.clone()).collect(),
        }
    }

    /// Stop admitting jobs and wait up to `grace` for the active one.
    ///
    /// Jobs still waiting or running afterwards are marked failed.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.inner.shutdown.send(true);

        let runner = self
            .inner
            .runner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut runner) = runner {
            match tokio::time::timeout(grace, &mut runner).await {
                Ok(_) => info!("Job queue runner stopped"),
                Err(_) => {
                    warn!("Active job still running after {:?}, abandoning it", grace);
                    runner.abort();
                    let _ = runner.await;
                }
            }
        }

        self.inner.abandon_in_flight().await;
    }
}

impl Inner {
    async fn run_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        info!("Job queue runner started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.admit_next().await {
                Some(job) => self.run_job(job).await,
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }
    }

    /// Pop the FIFO head into the active slot, if the slot is free.
    async fn admit_next(&self) -> Option<Job> {
        let mut state = self.state.lock().await;
        if state.active.is_some() {
            return None;
        }
        let job = state.pending.pop_front()?;
        state.active = Some(ActiveJob {
            id: job.id.clone(),
            worker_owns_record: false,
        });
        state.report_length();
        Some(job)
    }

    async fn run_job(&self, job: Job) {
        let logger = JobLogger::new(&job.id, "pipeline");
        let span = logger.span();

        async {
            logger.log_start(&job.input_path.display().to_string());
            let started = Instant::now();

            match self.execute(&job, &logger).await {
                Ok(record) => {
                    counter!("shotlist_jobs_completed_total").increment(1);
                    logger.log_completion(&format!(
                        "{} shots in {:.1}s",
                        record.scene_count,
                        started.elapsed().as_secs_f64()
                    ));
                }
                Err(e) => {
                    counter!("shotlist_jobs_failed_total").increment(1);
                    let reason = e.to_string();
                    logger.log_error(&reason);
                    let marked = self
                        .update(&job.id, move |record| Ok(record.fail(reason)?))
                        .await;
                    if let Err(e) = marked {
                        logger.log_warning(&format!("could not record failure: {}", e));
                    }
                }
            }

            self.release(&job.id).await;
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, job: &Job, logger: &JobLogger) -> QueueResult<ProgressRecord> {
        let id = &job.id;
        let mut report_path = None;

        for step in &job.steps {
            let log = logger.step(step.as_str());
            match step {
                PipelineStep::Detect => {
                    self.update(id, |r| Ok(r.advance(JobState::Detecting)?)).await?;
                    log.log_progress("detecting shots");

                    let shots = self.analyzer.detect(job).await?;
                    if shots.is_empty() {
                        log.log_progress("no shots detected");
                        return self
                            .update(id, |r| {
                                r.descriptions_complete = true;
                                Ok(r.advance(JobState::Complete)?)
                            })
                            .await;
                    }

                    log.log_progress(&format!("{} shots detected", shots.len()));
                    self.update(id, move |r| {
                        r.push_scenes(shots);
                        Ok(r.advance(JobState::Queued)?)
                    })
                    .await?;
                }
                PipelineStep::Describe => {
                    let record = self
                        .update(id, |r| {
                            r.advance(JobState::Analyzing)?;
                            let todo = r.scenes.iter().any(|s| !s.is_described());
                            r.processing_index = if todo { 0 } else { -1 };
                            r.descriptions_complete = !todo;
                            Ok(())
                        })
                        .await?;
                    if record.descriptions_complete {
                        log.log_progress("nothing to describe");
                        continue;
                    }

                    self.state.lock().await.set_worker_owns(id, true);
                    let described = self
                        .analyzer
                        .describe_and_finalize(&self.store.record_path(id))
                        .await;
                    let record = self.reclaim(id).await;
                    described?;

                    let record = record?;
                    log.log_progress(&format!(
                        "{}/{} shots described",
                        record.described_count(),
                        record.scenes.len()
                    ));
                }
                PipelineStep::Finalize => {
                    let record = self
                        .update(id, |r| {
                            if r.described_count() == r.scenes.len() {
                                r.descriptions_complete = true;
                            }
                            Ok(r.advance(JobState::Finalizing)?)
                        })
                        .await?;
                    let path = self.finalizer.finalize(job, &record).await?;
                    log.log_progress(&format!("report written to {}", path.display()));
                    report_path = Some(path.to_string_lossy().into_owned());
                }
            }
        }

        self.update(id, move |r| {
            if let Some(path) = report_path {
                r.report_path = Some(path);
                r.report_ready = true;
            }
            Ok(r.advance(JobState::Complete)?)
        })
        .await
    }

    /// Serialized read-modify-write of a job's record.
    ///
    /// The mutation is applied to a copy and only kept if it could be
    /// written, so the cached record always matches what pollers can see.
    async fn update<F>(&self, id: &JobId, mutate: F) -> QueueResult<ProgressRecord>
    where
        F: FnOnce(&mut ProgressRecord) -> QueueResult<()>,
    {
        let mut state = self.state.lock().await;
        let mut record = match state.records.get(id) {
            Some(cached) => cached.clone(),
            None => self
                .store
                .read(id)
                .await?
                .ok_or_else(|| QueueError::not_found(id.to_string()))?,
        };

        mutate(&mut record)?;

        if state.worker_owns(id) {
            debug!(job_id = %id, "Worker owns the record, holding change until it is done");
        } else {
            self.store.write(&record).await?;
        }
        // A finished job leaves the slot under the same lock that published it.
        if record.is_terminal() && state.is_active(id) {
            state.active = None;
            state.records.remove(id);
        } else if state.in_flight(id) {
            state.records.insert(id.clone(), record.clone());
        }
        Ok(record)
    }

    /// Take the record back from the worker after the description step.
    ///
    /// The worker's copy supplies shots, descriptions and its progress
    /// fields; status and annotations come from the queue's copy.
    async fn reclaim(&self, id: &JobId) -> QueueResult<ProgressRecord> {
        let mut state = self.state.lock().await;
        state.set_worker_owns(id, false);
        let cached = state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::not_found(id.to_string()))?;

        let mut record = match self.store.read(id).await {
            Ok(Some(on_disk)) => on_disk,
            Ok(None) => {
                warn!(job_id = %id, "Record disappeared during description");
                cached.clone()
            }
            Err(e) => {
                warn!(job_id = %id, "Worker left an unreadable record: {}", e);
                cached.clone()
            }
        };

        record.status = cached.status;
        record.created_at = cached.created_at;
        record.apply_annotations(&cached.annotations());
        if record.scenes.len() != cached.scenes.len() {
            warn!(
                job_id = %id,
                expected = cached.scenes.len(),
                found = record.scenes.len(),
                "Worker changed the shot list, keeping ours"
            );
            record.scenes = cached.scenes.clone();
        }
        record.touch();

        state.records.insert(id.clone(), record.clone());
        Ok(record)
    }

    /// Free the active slot if the final write did not.
    async fn release(&self, id: &JobId) {
        let mut state = self.state.lock().await;
        if state.is_active(id) {
            state.active = None;
        }
        // The id may have been resubmitted once the final write freed the slot.
        if !state.in_flight(id) {
            state.records.remove(id);
        }
    }

    /// Fail records a previous process left mid-pipeline.
    async fn recover(&self) -> QueueResult<usize> {
        let state = self.state.lock().await;
        let mut recovered = 0;

        for id in self.store.list().await? {
            if state.in_flight(&id) {
                continue;
            }
            let mut record = match self.store.read(&id).await {
                Ok(Some(record)) if !record.is_terminal() => record,
                Ok(_) => continue,
                Err(e) => {
                    warn!(job_id = %id, "Skipping unreadable record: {}", e);
                    continue;
                }
            };
            record.fail("Interrupted by a restart; submit the job again")?;
            self.store.write(&record).await?;
            debug!(job_id = %id, "Marked interrupted job as failed");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Fail everything still waiting or running after the runner stopped.
    async fn abandon_in_flight(&self) {
        let mut state = self.state.lock().await;
        let worker_owned = state
            .active
            .as_ref()
            .filter(|a| a.worker_owns_record)
            .map(|a| a.id.clone());

        let mut ids: Vec<JobId> = state.active.take().map(|a| a.id).into_iter().collect();
        ids.extend(state.pending.drain(..).map(|j| j.id));
        state.report_length();

        for id in ids {
            let Some(mut record) = state.records.remove(&id) else {
                continue;
            };
            // The worker may still write this record; startup recovery handles it.
            if worker_owned.as_ref() == Some(&id) {
                continue;
            }
            if record.fail("Server shut down before the job finished").is_ok() {
                if let Err(e) = self.store.write(&record).await {
                    warn!(job_id = %id, "Could not mark abandoned job: {}", e);
                }
            }
        }
    }
}
