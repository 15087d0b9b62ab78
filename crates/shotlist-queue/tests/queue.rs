//! Queue behavior against a scripted in-process analyzer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shotlist_analyzer::{Analyzer, AnalyzerError, AnalyzerResult};
use shotlist_models::{Annotations, Job, JobId, JobState, ProgressRecord, Shot};
use shotlist_queue::{JobQueue, ProgressStore, QueueConfig, QueueError, SubmitOutcome};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

/// Analyzer whose behavior is keyed by job id.
///
/// - `empty*` detects nothing
/// - `bad-detect*` fails detection with a protocol error
/// - `bad-describe*` crashes during description
/// - `unwritable*` replaces its job directory with a plain file during detection
/// - anything else detects `shots` shots and describes them like the real worker,
///   rewriting the record file in place
#[derive(Default)]
struct ScriptedAnalyzer {
    shots: usize,
    detect_delay: Duration,
    detected: Mutex<Vec<String>>,
    described: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    /// When set, description waits for a permit
    describe_gate: Option<Arc<Semaphore>>,
    describe_entered: Notify,
    /// When set, every call counts records in a running state under this directory
    records_dir: Option<PathBuf>,
    max_running_records: AtomicUsize,
}

impl ScriptedAnalyzer {
    fn new() -> Self {
        Self {
            shots: 2,
            ..Self::default()
        }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            describe_gate: Some(gate),
            ..Self::new()
        }
    }

    fn enter(&self) {
        if let Some(dir) = &self.records_dir {
            let running = std::fs::read_dir(dir)
                .unwrap()
                .filter_map(|entry| std::fs::read(entry.unwrap().path().join("metadata.json")).ok())
                .filter_map(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
                .filter(|record| {
                    matches!(
                        record["status"].as_str(),
                        Some("detecting" | "analyzing" | "finalizing")
                    )
                })
                .count();
            self.max_running_records.fetch_max(running, Ordering::SeqCst);
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn detected(&self) -> Vec<String> {
        self.detected.lock().unwrap().clone()
    }

    fn described(&self) -> Vec<String> {
        self.described.lock().unwrap().clone()
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn detect(&self, job: &Job) -> AnalyzerResult<Vec<Shot>> {
        self.enter();
        self.detected.lock().unwrap().push(job.id.to_string());
        tokio::time::sleep(self.detect_delay).await;
        self.leave();

        let id = job.id.as_str();
        if id.starts_with("empty") {
            return Ok(Vec::new());
        }
        if id.starts_with("bad-detect") {
            return Err(AnalyzerError::protocol("malformed DETECT_DONE frame"));
        }
        if id.starts_with("unwritable") {
            std::fs::remove_dir_all(job.output_dir())?;
            std::fs::write(job.output_dir(), b"not a directory")?;
        }
        Ok((0..self.shots)
            .map(|i| {
                Shot::new(
                    i as f64 * 2.5,
                    format!("/uploads/scenes/{}/scene-{:03}.jpg", id, i + 1),
                )
            })
            .collect())
    }

    async fn describe_and_finalize(&self, record_path: &Path) -> AnalyzerResult<()> {
        self.enter();
        self.describe_entered.notify_one();
        if let Some(gate) = &self.describe_gate {
            let permit = gate.acquire().await.unwrap();
            permit.forget();
        }

        let bytes = std::fs::read(record_path)?;
        let mut record: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let job_id = record["jobId"].as_str().unwrap_or_default().to_string();
        self.described.lock().unwrap().push(job_id.clone());

        if job_id.starts_with("bad-describe") {
            self.leave();
            return Err(AnalyzerError::worker_crashed("worker closed its output"));
        }

        let total = record["scenes"].as_array().map(Vec::len).unwrap_or(0);
        for i in 0..total {
            record["processingIndex"] = i.into();
            record["scenes"][i]["description"] = format!("Shot {} of {}.", i + 1, total).into();
        }
        record["processingIndex"] = (-1).into();
        record["descriptionsComplete"] = true.into();
        record["progress"] = 100.into();
        // Worker-side keys survive the queue reading the record back.
        record["model"] = "test".into();
        std::fs::write(record_path, serde_json::to_vec(&record).unwrap())?;

        self.leave();
        Ok(())
    }
}

fn setup(analyzer: Arc<ScriptedAnalyzer>) -> (TempDir, JobQueue) {
    let dir = TempDir::new().unwrap();
    let store = ProgressStore::new(QueueConfig::with_data_dir(dir.path()));
    (dir, JobQueue::new(store, analyzer))
}

async fn submit(queue: &JobQueue, id: &str) -> SubmitOutcome {
    let job = queue.new_job(JobId::from(id), format!("/videos/{}.mp4", id));
    queue.submit(job).await.unwrap()
}

async fn wait_terminal(queue: &JobQueue, id: &str) -> ProgressRecord {
    let id = JobId::from(id);
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(record) = queue.status(&id).await.unwrap() {
                if record.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish")
}

async fn wait_state(queue: &JobQueue, id: &str, state: JobState) {
    let id = JobId::from(id);
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(record) = queue.status(&id).await.unwrap() {
                if record.status == state {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state not reached")
}

#[tokio::test]
async fn test_jobs_run_in_submission_order() {
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let (_dir, queue) = setup(Arc::clone(&analyzer));

    for id in ["a", "b", "c"] {
        assert_eq!(submit(&queue, id).await, SubmitOutcome::Accepted);
    }
    queue.start().await.unwrap();

    for id in ["a", "b", "c"] {
        let record = wait_terminal(&queue, id).await;
        assert_eq!(record.status, JobState::Complete);
    }
    assert_eq!(analyzer.detected(), vec!["a", "b", "c"]);
    assert_eq!(analyzer.described(), vec!["a", "b", "c"]);

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_completed_job_record() {
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let (dir, queue) = setup(analyzer);

    submit(&queue, "a").await;
    queue.start().await.unwrap();
    let record = wait_terminal(&queue, "a").await;

    assert_eq!(record.status, JobState::Complete);
    assert_eq!(record.scene_count, 2);
    assert_eq!(record.described_count(), 2);
    assert!(record.descriptions_complete);
    assert_eq!(record.processing_index, -1);
    assert_eq!(record.progress, 100);
    assert!(record.report_ready);
    assert!(!record.queued);

    let report = dir.path().join("a").join("report.json");
    assert_eq!(record.report_path.as_deref(), Some(report.to_string_lossy().as_ref()));
    let report: serde_json::Value = serde_json::from_slice(&std::fs::read(report).unwrap()).unwrap();
    assert_eq!(report["shots"][1]["description"], "Shot 2 of 2.");

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_resubmission_while_queued_is_a_noop() {
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let (_dir, queue) = setup(Arc::clone(&analyzer));

    assert_eq!(submit(&queue, "a").await, SubmitOutcome::Accepted);
    assert_eq!(submit(&queue, "a").await, SubmitOutcome::AlreadyQueued);
    assert_eq!(queue.snapshot().await.pending.len(), 1);

    queue.start().await.unwrap();
    wait_terminal(&queue, "a").await;
    assert_eq!(analyzer.detected(), vec!["a"]);

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_resubmission_while_active_is_a_noop() {
    let gate = Arc::new(Semaphore::new(0));
    let analyzer = Arc::new(ScriptedAnalyzer::gated(Arc::clone(&gate)));
    let (_dir, queue) = setup(Arc::clone(&analyzer));
    queue.start().await.unwrap();

    submit(&queue, "a").await;
    analyzer.describe_entered.notified().await;
    assert_eq!(submit(&queue, "a").await, SubmitOutcome::AlreadyQueued);

    gate.add_permits(1);
    wait_terminal(&queue, "a").await;
    assert_eq!(analyzer.detected(), vec!["a"]);

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_empty_detection_completes_without_describing() {
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let (_dir, queue) = setup(Arc::clone(&analyzer));

    submit(&queue, "empty-1").await;
    queue.start().await.unwrap();
    let record = wait_terminal(&queue, "empty-1").await;

    assert_eq!(record.status, JobState::Complete);
    assert_eq!(record.scene_count, 0);
    assert!(record.scenes.is_empty());
    assert!(!record.report_ready);
    assert!(analyzer.described().is_empty());

    // Nothing is in progress, so the job can be cleaned up.
    queue.delete(&JobId::from("empty-1")).await.unwrap();

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_failure_does_not_block_the_queue() {
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let (_dir, queue) = setup(Arc::clone(&analyzer));

    for id in ["bad-detect", "bad-describe", "good"] {
        submit(&queue, id).await;
    }
    queue.start().await.unwrap();

    let detect_failed = wait_terminal(&queue, "bad-detect").await;
    assert_eq!(detect_failed.status, JobState::Failed);
    assert!(detect_failed.error.unwrap().contains("Protocol error"));
    assert!(detect_failed.scenes.is_empty());

    let describe_failed = wait_terminal(&queue, "bad-describe").await;
    assert_eq!(describe_failed.status, JobState::Failed);
    assert_eq!(describe_failed.scene_count, 2);
    assert!(!describe_failed.report_ready);

    let good = wait_terminal(&queue, "good").await;
    assert_eq!(good.status, JobState::Complete);

    // Failed jobs are not retried.
    assert_eq!(analyzer.detected(), vec!["bad-detect", "bad-describe", "good"]);

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_persistence_failure_fails_job_and_queue_moves_on() {
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let (_dir, queue) = setup(Arc::clone(&analyzer));

    for id in ["unwritable", "after"] {
        submit(&queue, id).await;
    }
    queue.start().await.unwrap();

    let after = wait_terminal(&queue, "after").await;
    assert_eq!(after.status, JobState::Complete);
    assert_eq!(after.scene_count, 2);
    assert!(after.report_ready);
    assert_eq!(analyzer.detected(), vec!["unwritable", "after"]);
    // Only the job whose record could be written reached description.
    assert_eq!(analyzer.described(), vec!["after"]);

    // Its record could not be written, so there is nothing readable left.
    let unwritable = queue.status(&JobId::from("unwritable")).await;
    assert!(matches!(unwritable, Err(QueueError::Store(_))), "{:?}", unwritable);
    assert!(queue.snapshot().await.active.is_none());

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_single_slot_and_monotonic_progress() {
    let dir = TempDir::new().unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer {
        detect_delay: Duration::from_millis(20),
        records_dir: Some(dir.path().to_path_buf()),
        ..ScriptedAnalyzer::new()
    });
    let store = ProgressStore::new(QueueConfig::with_data_dir(dir.path()));
    let queue = JobQueue::new(store, Arc::clone(&analyzer) as Arc<dyn Analyzer>);

    let ids = ["j1", "j2", "bad-detect-3", "j4", "empty-5"];
    for id in ids {
        submit(&queue, id).await;
    }

    let poller = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut last: HashMap<&str, u8> = HashMap::new();
            loop {
                let mut finished = 0;
                for id in ids {
                    let record = queue.status(&JobId::from(id)).await.unwrap().unwrap();
                    if record.is_terminal() {
                        finished += 1;
                    }
                    if let Some(rank) = record.status.rank() {
                        let previous = last.insert(id, rank).unwrap_or(0);
                        assert!(rank >= previous, "{} went from rank {} to {}", id, previous, rank);
                    }
                }
                if finished == ids.len() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    queue.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), poller)
        .await
        .expect("jobs did not finish")
        .unwrap();

    assert_eq!(analyzer.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(analyzer.max_running_records.load(Ordering::SeqCst), 1);
    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_destructive_operations_conflict_while_in_progress() {
    let gate = Arc::new(Semaphore::new(0));
    let analyzer = Arc::new(ScriptedAnalyzer::gated(Arc::clone(&gate)));
    let (dir, queue) = setup(Arc::clone(&analyzer));
    queue.start().await.unwrap();

    submit(&queue, "a").await;
    submit(&queue, "b").await;
    analyzer.describe_entered.notified().await;
    wait_state(&queue, "a", JobState::Analyzing).await;

    let before = queue.status(&JobId::from("a")).await.unwrap().unwrap();
    let err = queue.delete(&JobId::from("a")).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));
    let err = queue.delete(&JobId::from("b")).await.unwrap_err();
    assert!(matches!(err, QueueError::Conflict(_)));

    let after = queue.status(&JobId::from("a")).await.unwrap().unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.scenes, before.scenes);
    assert!(dir.path().join("a").join("metadata.json").exists());
    assert_eq!(queue.status(&JobId::from("b")).await.unwrap().unwrap().queue_position, Some(0));

    gate.add_permits(2);
    wait_terminal(&queue, "a").await;
    wait_terminal(&queue, "b").await;

    queue.delete(&JobId::from("a")).await.unwrap();
    assert!(!dir.path().join("a").exists());
    assert!(queue.status(&JobId::from("a")).await.unwrap().is_none());
    assert!(matches!(
        queue.delete(&JobId::from("a")).await,
        Err(QueueError::NotFound(_))
    ));

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_record_stuck_mid_pipeline_conflicts() {
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let (_dir, queue) = setup(analyzer);

    // Written by someone else; not in this queue.
    let mut record = ProgressRecord::submitted(JobId::from("x"));
    record.advance(JobState::Detecting).unwrap();
    record.push_scenes(vec![Shot::new(0.0, "/uploads/scenes/x/a.jpg")]);
    record.advance(JobState::Queued).unwrap();
    queue.store().write(&record).await.unwrap();

    assert!(matches!(
        queue.delete(&JobId::from("x")).await,
        Err(QueueError::Conflict(_))
    ));

    record.advance(JobState::Complete).unwrap();
    queue.store().write(&record).await.unwrap();
    assert!(matches!(
        queue.delete(&JobId::from("x")).await,
        Err(QueueError::Conflict(_))
    ));

    record.report_ready = true;
    queue.store().write(&record).await.unwrap();
    queue.delete(&JobId::from("x")).await.unwrap();
}

#[tokio::test]
async fn test_annotations_survive_worker_rewrite() {
    let gate = Arc::new(Semaphore::new(0));
    let analyzer = Arc::new(ScriptedAnalyzer::gated(Arc::clone(&gate)));
    let (dir, queue) = setup(Arc::clone(&analyzer));
    queue.start().await.unwrap();

    submit(&queue, "a").await;
    analyzer.describe_entered.notified().await;

    let annotated = queue
        .annotate(
            &JobId::from("a"),
            Annotations {
                video_title: Some("Launch teaser".into()),
                video_description: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(annotated.video_title.as_deref(), Some("Launch teaser"));
    assert_eq!(annotated.status, JobState::Analyzing);

    gate.add_permits(1);
    let record = wait_terminal(&queue, "a").await;
    assert_eq!(record.video_title.as_deref(), Some("Launch teaser"));
    assert_eq!(record.described_count(), 2);

    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("a").join("report.json")).unwrap()).unwrap();
    assert_eq!(report["title"], "Launch teaser");

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_annotate_after_completion_and_resubmit() {
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let (_dir, queue) = setup(Arc::clone(&analyzer));
    queue.start().await.unwrap();

    assert!(matches!(
        queue.annotate(&JobId::from("a"), Annotations::default()).await,
        Err(QueueError::NotFound(_))
    ));

    submit(&queue, "a").await;
    wait_terminal(&queue, "a").await;

    let record = queue
        .annotate(
            &JobId::from("a"),
            Annotations {
                video_title: None,
                video_description: Some("Director's cut".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(record.status, JobState::Complete);
    assert_eq!(record.video_description.as_deref(), Some("Director's cut"));

    // A finished job can be submitted again and keeps its annotations.
    assert_eq!(submit(&queue, "a").await, SubmitOutcome::Accepted);
    let record = wait_terminal(&queue, "a").await;
    assert_eq!(record.status, JobState::Complete);
    assert_eq!(record.video_description.as_deref(), Some("Director's cut"));
    assert_eq!(analyzer.detected(), vec!["a", "a"]);

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_fails_waiting_jobs() {
    let gate = Arc::new(Semaphore::new(0));
    let analyzer = Arc::new(ScriptedAnalyzer::gated(Arc::clone(&gate)));
    let (_dir, queue) = setup(Arc::clone(&analyzer));
    queue.start().await.unwrap();

    submit(&queue, "a").await;
    submit(&queue, "b").await;
    analyzer.describe_entered.notified().await;

    queue.shutdown(Duration::from_millis(100)).await;

    let b = queue.status(&JobId::from("b")).await.unwrap().unwrap();
    assert_eq!(b.status, JobState::Failed);
    assert_eq!(queue.snapshot().await.pending.len(), 0);
    assert_eq!(analyzer.detected(), vec!["a"]);
}
