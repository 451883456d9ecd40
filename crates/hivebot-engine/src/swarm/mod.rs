//! Swarm engine — data-parallel map / shuffle / reduce over agent workers.
//!
//! One swarm invocation runs a full pipeline: resolve input items, split them
//! into batches, map each batch through a worker agent under a bounded pool,
//! optionally re-partition the results by key, reduce, and emit one final
//! response. A swarm runs to completion or fails; observers get events and an
//! in-memory job table, but no durable checkpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use hivebot_core::config::{
    Config, ReduceStrategy, SwarmSpec, HIERARCHICAL_REDUCE_FANIN, MAX_SWARM_ITEMS,
};
use hivebot_core::events::{Event, EventSink};
use hivebot_core::layout::HiveLayout;
use hivebot_core::types::{QueueMessage, QueueResponse, RESPONSE_MAX_CHARS};
use hivebot_core::utils;
use hivebot_workers::WorkerInvoker;

use crate::queue::QueueStore;

pub mod input;
pub mod reduce;
pub mod shuffle;

/// Extra map attempts after the first failure.
const BATCH_EXTRA_ATTEMPTS: usize = 2;

/// Admission bound on the worker pool's waiting queue.
const MAX_POOL_WAITERS: usize = 4096;

/// How long finished jobs stay visible in the job table.
const JOB_RETENTION: Duration = Duration::from_secs(300);

// ─────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────

/// Terminal swarm failures, surfaced to the user as a stated failure.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("unknown swarm `{0}`")]
    UnknownSwarm(String),
    #[error("no input items could be resolved from the message")]
    NoInput,
    #[error("resolved {count} items, exceeding the {max}-item cap")]
    TooManyItems { count: usize, max: usize },
    #[error("input command failed: {0}")]
    InputCommand(String),
    #[error("input could not be parsed: {0}")]
    InputParse(String),
    #[error("all {total} batches failed; nothing to reduce")]
    AllBatchesFailed { total: usize },
}

// ─────────────────────────────────────────────
// Job tracking
// ─────────────────────────────────────────────

/// Lifecycle of a swarm job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Initializing,
    FetchingInput,
    Splitting,
    Processing,
    Shuffling,
    Reducing,
    Completed,
    Failed,
}

/// In-memory record of one swarm invocation.
#[derive(Clone, Debug)]
pub struct SwarmJob {
    pub id: String,
    pub swarm_id: String,
    pub status: JobStatus,
    pub total_items: usize,
    pub total_batches: usize,
    pub completed_batches: usize,
    pub failed_batches: usize,
    pub error: Option<String>,
    pub channel: String,
    pub sender: String,
    pub message_id: String,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
}

/// Final swarm output: response text plus report attachments.
#[derive(Clone, Debug)]
pub struct SwarmOutcome {
    pub message: String,
    pub files: Vec<String>,
}

// ─────────────────────────────────────────────
// SwarmEngine
// ─────────────────────────────────────────────

/// Owns the job table and runs swarm pipelines.
pub struct SwarmEngine {
    config: Arc<Config>,
    layout: HiveLayout,
    invoker: Arc<dyn WorkerInvoker>,
    events: Arc<dyn EventSink>,
    store: Arc<QueueStore>,
    jobs: Mutex<HashMap<String, SwarmJob>>,
}

impl SwarmEngine {
    pub fn new(
        config: Arc<Config>,
        layout: HiveLayout,
        invoker: Arc<dyn WorkerInvoker>,
        events: Arc<dyn EventSink>,
        store: Arc<QueueStore>,
    ) -> Self {
        Self {
            config,
            layout,
            invoker,
            events,
            store,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Consistent snapshot of the job table.
    pub fn jobs(&self) -> Vec<SwarmJob> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    /// Run one swarm invocation end to end.
    pub async fn run(
        self: &Arc<Self>,
        swarm_id: &str,
        origin: &QueueMessage,
        payload: &str,
    ) -> Result<SwarmOutcome, SwarmError> {
        self.cleanup_jobs();

        let Some(spec) = self.config.find_swarm(swarm_id) else {
            return Err(SwarmError::UnknownSwarm(swarm_id.to_string()));
        };
        let spec = Arc::new(spec.clone());

        let job_id = format!(
            "{}-{}",
            swarm_id,
            utils::safe_filename(&origin.message_id)
        );
        self.jobs.lock().unwrap().insert(
            job_id.clone(),
            SwarmJob {
                id: job_id.clone(),
                swarm_id: swarm_id.to_string(),
                status: JobStatus::Initializing,
                total_items: 0,
                total_batches: 0,
                completed_batches: 0,
                failed_batches: 0,
                error: None,
                channel: origin.channel.clone(),
                sender: origin.sender.clone(),
                message_id: origin.message_id.clone(),
                started_at: Instant::now(),
                finished_at: None,
            },
        );

        self.events.emit(Event::info(
            "swarm",
            "swarm_job_start",
            json!({"job": job_id, "swarm": swarm_id, "messageId": origin.message_id}),
        ));

        let result = self.execute(&spec, &job_id, origin, payload).await;

        match &result {
            Ok(_) => {
                self.update_job(&job_id, |job| {
                    job.status = JobStatus::Completed;
                    job.finished_at = Some(Instant::now());
                });
                self.events.emit(Event::info(
                    "swarm",
                    "swarm_job_done",
                    json!({"job": job_id, "swarm": swarm_id}),
                ));
                info!(job = %job_id, "swarm job completed");
            }
            Err(e) => {
                let message = e.to_string();
                self.update_job(&job_id, |job| {
                    job.status = JobStatus::Failed;
                    job.error = Some(message.clone());
                    job.finished_at = Some(Instant::now());
                });
                self.events.emit(Event::error(
                    "swarm",
                    "swarm_job_failed",
                    json!({"job": job_id, "swarm": swarm_id, "error": message}),
                ));
                warn!(job = %job_id, error = %e, "swarm job failed");
            }
        }

        result
    }

    async fn execute(
        self: &Arc<Self>,
        spec: &Arc<SwarmSpec>,
        job_id: &str,
        origin: &QueueMessage,
        payload: &str,
    ) -> Result<SwarmOutcome, SwarmError> {
        let started = Instant::now();

        // Input resolution
        self.update_job(job_id, |job| job.status = JobStatus::FetchingInput);
        let items = input::resolve_items(spec, payload, &origin.files).await?;
        if items.is_empty() {
            return Err(SwarmError::NoInput);
        }
        if items.len() > MAX_SWARM_ITEMS {
            return Err(SwarmError::TooManyItems {
                count: items.len(),
                max: MAX_SWARM_ITEMS,
            });
        }
        let item_count = items.len();
        self.update_job(job_id, |job| job.total_items = item_count);

        // Batch split
        self.update_job(job_id, |job| job.status = JobStatus::Splitting);
        let batches: Vec<Vec<String>> = items
            .chunks(spec.batch_size)
            .map(<[String]>::to_vec)
            .collect();
        let total_batches = batches.len();
        self.update_job(job_id, |job| job.total_batches = total_batches);
        self.events.emit(Event::info(
            "swarm",
            "swarm_split_done",
            json!({"job": job_id, "items": item_count, "batches": total_batches}),
        ));

        // Map under the bounded pool
        self.update_job(job_id, |job| job.status = JobStatus::Processing);
        let semaphore = Arc::new(Semaphore::new(spec.concurrency));
        let (successes, failed) = self
            .map_phase(spec, job_id, origin, payload, batches, Arc::clone(&semaphore))
            .await;
        if successes.is_empty() {
            return Err(SwarmError::AllBatchesFailed {
                total: total_batches,
            });
        }
        let ordered: Vec<String> = successes.into_iter().map(|(_, text)| text).collect();
        let succeeded = ordered.len();

        // Shuffle or reduce
        let body = if spec.shuffle.is_some() {
            self.update_job(job_id, |job| job.status = JobStatus::Shuffling);
            self.shuffle_phase(spec, job_id, payload, &ordered, Arc::clone(&semaphore))
                .await
        } else {
            self.update_job(job_id, |job| job.status = JobStatus::Reducing);
            self.reduce_phase(spec, payload, ordered, Arc::clone(&semaphore))
                .await
        };

        // Final assembly
        let header = stats_header(
            &spec.name,
            item_count,
            succeeded,
            total_batches,
            failed,
            spec.concurrency,
            started.elapsed().as_secs(),
        );
        let full = format!("{header}\n\n{body}");

        if full.chars().count() > RESPONSE_MAX_CHARS {
            let report_path = self
                .layout
                .files()
                .join(format!("swarm-{job_id}-{}.md", utils::file_timestamp()));
            match std::fs::create_dir_all(self.layout.files())
                .and_then(|_| std::fs::write(&report_path, &full))
            {
                Ok(_) => {
                    let chars = full.chars().count();
                    return Ok(SwarmOutcome {
                        message: format!(
                            "{header}\n\nThe full report is {chars} characters; attached as a file."
                        ),
                        files: vec![report_path.display().to_string()],
                    });
                }
                Err(e) => {
                    // Inline text survives; the outgoing writer truncates it.
                    warn!(path = %report_path.display(), error = %e, "failed to persist swarm report");
                }
            }
        }

        Ok(SwarmOutcome {
            message: full,
            files: Vec::new(),
        })
    }

    // ────────────── Map ──────────────

    /// Run every batch under the pool. Returns successful results in batch
    /// order plus the failed-batch count.
    async fn map_phase(
        self: &Arc<Self>,
        spec: &Arc<SwarmSpec>,
        job_id: &str,
        origin: &QueueMessage,
        payload: &str,
        batches: Vec<Vec<String>>,
        semaphore: Arc<Semaphore>,
    ) -> (Vec<(usize, String)>, usize) {
        let total = batches.len();
        let waiters = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();
        let mut join_set = JoinSet::new();

        for (index, items) in batches.into_iter().enumerate() {
            let engine = Arc::clone(self);
            let spec = Arc::clone(spec);
            let semaphore = Arc::clone(&semaphore);
            let waiters = Arc::clone(&waiters);
            let payload = payload.to_string();

            join_set.spawn(async move {
                if waiters.fetch_add(1, Ordering::SeqCst) >= MAX_POOL_WAITERS {
                    waiters.fetch_sub(1, Ordering::SeqCst);
                    return (index, Err("worker pool admission queue is full".to_string()));
                }
                let permit = semaphore.acquire_owned().await;
                waiters.fetch_sub(1, Ordering::SeqCst);
                let Ok(_permit) = permit else {
                    return (index, Err("worker pool closed".to_string()));
                };

                let prompt = render_map_prompt(&spec, index, total, &items, &payload);
                let outcome = engine.invoke_with_retries(&spec.agent, &prompt).await;
                (index, outcome)
            });
        }

        let mut successes: Vec<(usize, String)> = Vec::new();
        let mut failed = 0usize;
        let mut terminal = 0usize;

        while let Some(joined) = join_set.join_next().await {
            let Ok((index, outcome)) = joined else {
                failed += 1;
                terminal += 1;
                continue;
            };
            terminal += 1;
            match outcome {
                Ok(text) => successes.push((index, text)),
                Err(e) => {
                    debug!(batch = index, error = %e, "batch failed terminally");
                    failed += 1;
                }
            }
            let done = successes.len();
            self.update_job(job_id, |job| {
                job.completed_batches = done;
                job.failed_batches = failed;
            });

            if spec.progress_interval > 0
                && terminal % spec.progress_interval == 0
                && terminal < total
            {
                self.emit_progress(spec, origin, terminal, total, failed, started);
            }
        }

        successes.sort_by_key(|(index, _)| *index);
        (successes, failed)
    }

    /// Drop a progress message into the outgoing queue.
    fn emit_progress(
        &self,
        spec: &SwarmSpec,
        origin: &QueueMessage,
        terminal: usize,
        total: usize,
        failed: usize,
        started: Instant,
    ) {
        let elapsed = started.elapsed().as_secs_f64();
        let remaining = (total - terminal) as f64;
        let eta_secs = (elapsed / terminal as f64 * remaining) as u64;

        let text = format!(
            "⏳ {}: {terminal}/{total} batches done, {failed} failed, ETA {}",
            spec.name,
            utils::format_elapsed(eta_secs)
        );

        let mut progress = QueueResponse::reply(origin, None, text);
        progress.message_id = format!("{}-progress-{terminal}", origin.message_id);
        if let Err(e) = self.store.write_response(&progress) {
            warn!(error = %e, "failed to write progress message");
        }
    }

    // ────────────── Shuffle ──────────────

    async fn shuffle_phase(
        self: &Arc<Self>,
        spec: &Arc<SwarmSpec>,
        job_id: &str,
        payload: &str,
        results: &[String],
        semaphore: Arc<Semaphore>,
    ) -> String {
        let shuffle_spec = spec.shuffle.as_ref().expect("shuffle configured");

        let (partitions, stats) = shuffle::group(results, shuffle_spec);
        let partitions = shuffle::sub_split(partitions, shuffle_spec.max_partition_size);
        self.events.emit(Event::info(
            "swarm",
            "swarm_shuffle_done",
            json!({
                "job": job_id,
                "partitions": partitions.len(),
                "duplicatedItems": stats.duplicated_items,
                "droppedResults": stats.dropped_results,
            }),
        ));

        // Partition reduce under the same bounded pool.
        let reduce_template = shuffle_spec
            .reduce_prompt
            .clone()
            .unwrap_or_else(|| shuffle::DEFAULT_REDUCE_PROMPT.to_string());

        let mut join_set = JoinSet::new();
        for (index, partition) in partitions.into_iter().enumerate() {
            let engine = Arc::clone(self);
            let spec = Arc::clone(spec);
            let semaphore = Arc::clone(&semaphore);
            let template = reduce_template.clone();
            let payload = payload.to_string();
            let job = job_id.to_string();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, partition.key.clone(), partition_failure(&partition.key, "worker pool closed"));
                };

                engine.events.emit(Event::info(
                    "swarm",
                    "swarm_shuffle_reduce_start",
                    json!({"job": job, "partition": partition.key, "items": partition.items.len()}),
                ));

                let prompt = render_template(
                    &template,
                    &[
                        ("partition_key", partition.key.clone()),
                        ("items", shuffle::render_items(&partition.items)),
                        ("item_count", partition.items.len().to_string()),
                        ("user_message", payload),
                    ],
                );

                let text = match engine.invoke_once(spec.reducer_agent(), &prompt).await {
                    Ok(text) => text,
                    Err(e) => partition_failure(&partition.key, &e),
                };

                engine.events.emit(Event::info(
                    "swarm",
                    "swarm_shuffle_reduce_done",
                    json!({"job": job, "partition": partition.key}),
                ));

                (index, partition.key, text)
            });
        }

        let mut reduced: Vec<(usize, String, String)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(entry) = joined {
                reduced.push(entry);
            }
        }
        // Partition order is already lexicographic by key; restore it after
        // the unordered join.
        reduced.sort_by_key(|(index, _, _)| *index);

        // Final merge
        let sections: Vec<String> = reduced
            .iter()
            .map(|(_, key, text)| format!("## Partition: {key}\n\n{text}"))
            .collect();
        let concatenated = sections.join(reduce::RESULT_SEPARATOR);

        if sections.len() > HIERARCHICAL_REDUCE_FANIN {
            warn!(
                partitions = sections.len(),
                "partition count exceeds merge fan-in, returning concatenated partitions"
            );
            self.events.emit(Event::warn(
                "swarm",
                "swarm_merge_skipped",
                json!({"job": job_id, "partitions": sections.len()}),
            ));
            return concatenated;
        }

        let merge_template = shuffle_spec
            .merge_prompt
            .clone()
            .unwrap_or_else(|| shuffle::DEFAULT_MERGE_PROMPT.to_string());
        let merge_prompt = render_template(
            &merge_template,
            &[
                ("partition_count", sections.len().to_string()),
                ("items", concatenated.clone()),
                ("user_message", payload.to_string()),
            ],
        );

        match self.invoke_once(spec.reducer_agent(), &merge_prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "final merge failed, returning concatenated partitions");
                concatenated
            }
        }
    }

    // ────────────── Reduce ──────────────

    async fn reduce_phase(
        self: &Arc<Self>,
        spec: &Arc<SwarmSpec>,
        payload: &str,
        ordered: Vec<String>,
        semaphore: Arc<Semaphore>,
    ) -> String {
        let strategy = spec
            .reduce
            .as_ref()
            .map(|r| r.strategy)
            .unwrap_or(ReduceStrategy::Concatenate);

        match strategy {
            ReduceStrategy::Concatenate => reduce::concatenate(&ordered),
            ReduceStrategy::Summarize => {
                let template = spec
                    .reduce
                    .as_ref()
                    .and_then(|r| r.prompt.clone())
                    .unwrap_or_else(|| reduce::DEFAULT_SUMMARIZE_PROMPT.to_string());
                let prompt = render_template(
                    &template,
                    &[
                        ("items", reduce::concatenate(&ordered)),
                        ("user_message", payload.to_string()),
                    ],
                );
                match self.invoke_once(spec.reducer_agent(), &prompt).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "summarize reduce failed, returning concatenated results");
                        reduce::concatenate(&ordered)
                    }
                }
            }
            ReduceStrategy::Hierarchical => {
                self.hierarchical_reduce(spec, payload, ordered, semaphore)
                    .await
            }
        }
    }

    /// Reduce in rounds of at most the fan-in until one summary remains.
    async fn hierarchical_reduce(
        self: &Arc<Self>,
        spec: &Arc<SwarmSpec>,
        payload: &str,
        mut current: Vec<String>,
        semaphore: Arc<Semaphore>,
    ) -> String {
        let template = spec
            .reduce
            .as_ref()
            .and_then(|r| r.prompt.clone())
            .unwrap_or_else(|| reduce::DEFAULT_SUMMARIZE_PROMPT.to_string());

        while current.len() > 1 {
            let chunks = reduce::chunk(&current, HIERARCHICAL_REDUCE_FANIN);
            let mut join_set = JoinSet::new();

            for (index, chunk) in chunks.into_iter().enumerate() {
                let engine = Arc::clone(self);
                let spec = Arc::clone(spec);
                let semaphore = Arc::clone(&semaphore);
                let template = template.clone();
                let payload = payload.to_string();

                join_set.spawn(async move {
                    let fallback = reduce::concatenate(&chunk);
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (index, fallback);
                    };
                    let prompt = render_template(
                        &template,
                        &[
                            ("items", reduce::concatenate(&chunk)),
                            ("user_message", payload),
                        ],
                    );
                    match engine.invoke_once(spec.reducer_agent(), &prompt).await {
                        Ok(text) => (index, text),
                        Err(e) => {
                            warn!(chunk = index, error = %e, "chunk reduce failed, passing chunk through");
                            (index, fallback)
                        }
                    }
                });
            }

            let mut summaries: Vec<(usize, String)> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                if let Ok(entry) = joined {
                    summaries.push(entry);
                }
            }
            summaries.sort_by_key(|(index, _)| *index);
            current = summaries.into_iter().map(|(_, text)| text).collect();
        }

        current.pop().unwrap_or_default()
    }

    // ────────────── Worker invocation ──────────────

    /// Map batches retry transient failures; a terminal failure stops early.
    async fn invoke_with_retries(&self, agent_id: &str, prompt: &str) -> Result<String, String> {
        let Some(agent) = self.config.find_agent(agent_id) else {
            return Err(format!("agent `{agent_id}` is not configured"));
        };

        let mut last_error = String::new();
        for attempt in 0..=BATCH_EXTRA_ATTEMPTS {
            match self.invoker.invoke(agent, prompt, true).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    last_error = e.to_string();
                    if !e.is_transient() {
                        break;
                    }
                    debug!(agent = agent_id, attempt = attempt, error = %e, "map attempt failed");
                }
            }
        }
        Err(last_error)
    }

    /// Reducers get a single attempt; callers supply the fallback.
    async fn invoke_once(&self, agent_id: &str, prompt: &str) -> Result<String, String> {
        let Some(agent) = self.config.find_agent(agent_id) else {
            return Err(format!("agent `{agent_id}` is not configured"));
        };
        self.invoker
            .invoke(agent, prompt, true)
            .await
            .map_err(|e| e.to_string())
    }

    // ────────────── Job table ──────────────

    fn update_job(&self, job_id: &str, mutate: impl FnOnce(&mut SwarmJob)) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(job_id) {
            mutate(job);
        }
    }

    /// Drop finished jobs older than the retention window.
    fn cleanup_jobs(&self) {
        self.jobs.lock().unwrap().retain(|_, job| match job.finished_at {
            Some(finished) => finished.elapsed() < JOB_RETENTION,
            None => true,
        });
    }
}

// ─────────────────────────────────────────────
// Rendering helpers
// ─────────────────────────────────────────────

/// Replace `{{name}}` placeholders; unknown placeholders stay untouched.
pub(crate) fn render_template(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

fn render_map_prompt(
    spec: &SwarmSpec,
    index: usize,
    total: usize,
    items: &[String],
    user_message: &str,
) -> String {
    render_template(
        &spec.prompt_template,
        &[
            ("items", items.join("\n")),
            (
                "items_json",
                serde_json::to_string(items).unwrap_or_default(),
            ),
            ("batch_number", (index + 1).to_string()),
            ("batch_index", index.to_string()),
            ("total_batches", total.to_string()),
            ("batch_size", spec.batch_size.to_string()),
            ("user_message", user_message.to_string()),
        ],
    )
}

fn partition_failure(key: &str, error: &str) -> String {
    format!("[Partition \"{key}\" failed: {error}]")
}

fn stats_header(
    name: &str,
    items: usize,
    succeeded: usize,
    total_batches: usize,
    failed: usize,
    workers: usize,
    elapsed_secs: u64,
) -> String {
    let failed_note = if failed > 0 {
        format!(", {failed} failed")
    } else {
        String::new()
    };
    format!(
        "🐝 {name}: {items} items, {succeeded}/{total_batches} batches{failed_note}, {workers} workers, {}",
        utils::format_elapsed(elapsed_secs)
    )
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
