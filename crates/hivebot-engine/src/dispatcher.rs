//! Queue dispatcher — the polling loop that turns message files into work.
//!
//! Every tick lists `queue/incoming/*.json` oldest-first, peeks each untracked
//! file for its target key, and appends a processing task to that key's FIFO
//! chain. Chains are independent tokio tasks fed over unbounded channels: one
//! message per key runs at a time, keys run beside each other, and a chain
//! that stays idle past the quiescence period is reaped (the next message
//! allocates a fresh one). The dispatcher never awaits task completion.
//!
//! Failure handling follows the file's location: worker failures produce a
//! user-visible response and the file completes; framework failures roll the
//! file back to `incoming/` for a later tick, and a file rolled back too many
//! times is quarantined under `queue/deadletter/`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use hivebot_core::config::Config;
use hivebot_core::events::{Event, EventSink};
use hivebot_core::layout::HiveLayout;
use hivebot_core::types::{prepare_outbound, QueueMessage, QueueResponse};
use hivebot_workers::invoker::resolve_workdir;
use hivebot_workers::{memory, ResetFlags, WorkerInvoker};

use crate::queue::QueueStore;
use crate::routing::{self, Route, AMBIGUOUS_ROUTE_REPLY, NO_TARGET_REPLY};
use crate::swarm::SwarmEngine;
use crate::team::TeamChainExecutor;

/// User-visible reply for transient worker failures.
pub const TRANSIENT_APOLOGY: &str =
    "Sorry, something went wrong while handling that. Please try again in a moment.";

type ChainTask = Pin<Box<dyn Future<Output = ()> + Send>>;

struct ChainHandle {
    tx: mpsc::UnboundedSender<ChainTask>,
}

// ─────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────

/// The queue dispatcher. Cheap to clone; all state lives behind one `Arc`.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Config>,
    layout: HiveLayout,
    store: Arc<QueueStore>,
    invoker: Arc<dyn WorkerInvoker>,
    events: Arc<dyn EventSink>,
    teams: Arc<TeamChainExecutor>,
    swarms: Arc<SwarmEngine>,
    /// Per-key FIFO chains.
    chains: Mutex<HashMap<String, ChainHandle>>,
    /// Filenames queued into some chain but not yet settled.
    processing: Mutex<HashSet<String>>,
    /// Rollback counts per filename, for dead-letter quarantine.
    rollbacks: Mutex<HashMap<String, u32>>,
    shutdown: Notify,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        layout: HiveLayout,
        invoker: Arc<dyn WorkerInvoker>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let store = Arc::new(QueueStore::new(layout.clone()));
        let teams = Arc::new(TeamChainExecutor::new(
            Arc::clone(&config),
            layout.clone(),
            Arc::clone(&invoker),
            Arc::clone(&events),
        ));
        let swarms = Arc::new(SwarmEngine::new(
            Arc::clone(&config),
            layout.clone(),
            Arc::clone(&invoker),
            Arc::clone(&events),
            Arc::clone(&store),
        ));

        Dispatcher {
            inner: Arc::new(Inner {
                config,
                layout,
                store,
                invoker,
                events,
                teams,
                swarms,
                chains: Mutex::new(HashMap::new()),
                processing: Mutex::new(HashSet::new()),
                rollbacks: Mutex::new(HashMap::new()),
                shutdown: Notify::new(),
            }),
        }
    }

    /// The swarm engine (job table access for status displays).
    pub fn swarm_engine(&self) -> Arc<SwarmEngine> {
        Arc::clone(&self.inner.swarms)
    }

    /// Startup recovery: restore stranded `processing/` files to `incoming/`.
    pub fn recover(&self) {
        if let Err(e) = self.inner.store.recover() {
            warn!(error = %e, "queue recovery failed");
        }
    }

    /// Run the dispatcher until `stop()` is called.
    pub async fn run(&self) {
        self.recover();
        self.inner.events.emit(Event::info(
            "dispatcher",
            "processor_start",
            json!({"pollIntervalMs": self.inner.config.queue.poll_interval_ms}),
        ));
        info!(
            interval_ms = self.inner.config.queue.poll_interval_ms,
            "dispatcher started"
        );

        let interval = Duration::from_millis(self.inner.config.queue.poll_interval_ms.max(10));
        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.inner.shutdown.notified() => {
                    info!("dispatcher stopping");
                    return;
                }
            }
        }
    }

    pub fn stop(&self) {
        // notify_one stores a permit, so a stop raised outside the select
        // window is not lost.
        self.inner.shutdown.notify_one();
    }

    /// One poll pass: track new incoming files and enqueue them on chains.
    ///
    /// Never awaits task completion; chains drain on their own.
    pub async fn tick(&self) {
        let files = match self.inner.store.list_incoming() {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "failed to list incoming queue");
                return;
            }
        };

        for path in files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };

            {
                let mut processing = self.inner.processing.lock().unwrap();
                if processing.contains(&name) {
                    continue;
                }
                processing.insert(name.clone());
            }

            // Peek to pick the chain key; the claim happens inside the task.
            let key = match self.inner.store.peek(&path) {
                Ok(msg) => routing::resolve(&self.inner.config, &msg).target_key(),
                Err(e) => {
                    warn!(file = %name, error = %e, "unreadable incoming message");
                    self.inner.rollback_or_deadletter(&path, &name);
                    self.inner.release(&name);
                    continue;
                }
            };

            debug!(file = %name, key = %key, "enqueueing message");
            let inner = Arc::clone(&self.inner);
            let task_name = name.clone();
            let task: ChainTask = Box::pin(async move {
                inner.process_file(path, task_name).await;
            });
            self.enqueue(&key, task);
        }
    }

    /// Append a task to a key's chain, allocating a fresh chain when the old
    /// one has been reaped.
    fn enqueue(&self, key: &str, task: ChainTask) {
        let mut chains = self.inner.chains.lock().unwrap();
        chains.retain(|_, handle| !handle.tx.is_closed());

        let task = match chains.get(key) {
            Some(handle) => match handle.tx.send(task) {
                Ok(()) => return,
                // Chain reaped between retain and send; take the task back.
                Err(err) => err.0,
            },
            None => task,
        };

        let handle = self.spawn_chain(key);
        let _ = handle.tx.send(task);
        chains.insert(key.to_string(), handle);
    }

    fn spawn_chain(&self, key: &str) -> ChainHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChainTask>();
        let idle = Duration::from_secs(self.inner.config.queue.chain_idle_secs.max(1));
        let key = key.to_string();

        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(idle, rx.recv()).await {
                    Ok(Some(task)) => task.await,
                    Ok(None) => break,
                    Err(_) => {
                        debug!(key = %key, "chain idle, reaping");
                        break;
                    }
                }
            }
        });

        ChainHandle { tx }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.processing.lock().unwrap().len()
    }
}

// ─────────────────────────────────────────────
// Task body
// ─────────────────────────────────────────────

impl Inner {
    /// Process one claimed message to completion or rollback.
    async fn process_file(self: Arc<Self>, incoming_path: PathBuf, name: String) {
        let (processing_path, msg) = match self.store.claim(&incoming_path) {
            Ok(pair) => pair,
            Err(e) => {
                // A failed parse leaves the file in processing; a failed
                // rename leaves it in incoming (or it vanished underneath us).
                let stranded = self.layout.processing().join(&name);
                if stranded.exists() {
                    warn!(file = %name, error = %e, "claim failed after move, rolling back");
                    self.rollback_or_deadletter(&stranded, &name);
                } else if incoming_path.exists() {
                    warn!(file = %name, error = %e, "claim failed, leaving for retry");
                } else {
                    debug!(file = %name, "file disappeared before claim");
                }
                self.release(&name);
                return;
            }
        };

        self.events.emit(Event::info(
            "dispatcher",
            "message_received",
            json!({"messageId": msg.message_id, "channel": msg.channel}),
        ));

        let route = routing::resolve(&self.config, &msg);
        self.events.emit(Event::info(
            "dispatcher",
            "agent_routed",
            json!({"messageId": msg.message_id, "key": route.target_key()}),
        ));

        let response = self.execute_route(route, &msg).await;

        match self
            .store
            .write_response(&response)
            .and_then(|_| self.store.finish(&processing_path))
        {
            Ok(()) => {
                self.rollbacks.lock().unwrap().remove(&name);
                debug!(file = %name, "message completed");
            }
            Err(e) => {
                error!(file = %name, error = %e, "failed to complete message, rolling back");
                self.rollback_or_deadletter(&processing_path, &name);
            }
        }

        self.release(&name);
    }

    /// Execute the routed work and build the outgoing response. Worker
    /// failures never escape this function; they become response text.
    async fn execute_route(&self, route: Route, msg: &QueueMessage) -> QueueResponse {
        match route {
            Route::Ambiguous => QueueResponse::reply(msg, None, AMBIGUOUS_ROUTE_REPLY),
            Route::NoTarget => QueueResponse::reply(msg, None, NO_TARGET_REPLY),
            Route::UnknownSwarm { swarm_id } => QueueResponse::reply(
                msg,
                None,
                format!("Swarm `{swarm_id}` is not configured."),
            ),
            Route::Agent { agent_id, payload } => self.run_agent(&agent_id, &payload, msg).await,
            Route::Team {
                team_id,
                leader,
                payload,
            } => {
                let outcome = self.teams.run(&team_id, &leader, &payload, msg).await;
                let prepared = prepare_outbound(&outcome.message);
                let mut response = QueueResponse::reply(msg, Some(&leader), prepared.message);
                response.files = merge_files(outcome.files, prepared.files);
                response
            }
            Route::Swarm { swarm_id, payload } => {
                match self.swarms.run(&swarm_id, msg, &payload).await {
                    Ok(outcome) => {
                        let prepared = prepare_outbound(&outcome.message);
                        let mut response = QueueResponse::reply(msg, None, prepared.message);
                        response.files = merge_files(outcome.files, prepared.files);
                        response
                    }
                    Err(e) => QueueResponse::reply(msg, None, format!("Swarm failed: {e}")),
                }
            }
        }
    }

    /// Single conversational agent invocation.
    async fn run_agent(&self, agent_id: &str, payload: &str, msg: &QueueMessage) -> QueueResponse {
        let Some(agent) = self.config.find_agent(agent_id) else {
            return QueueResponse::reply(
                msg,
                None,
                format!("Agent `{agent_id}` is not configured."),
            );
        };

        let fresh = ResetFlags::new(self.layout.flags()).consume_any(agent_id);
        let workdir = resolve_workdir(self.layout.root(), agent);
        let prompt = memory::compose_prompt(&workdir, payload);

        let text = match self.invoker.invoke(agent, &prompt, fresh).await {
            Ok(text) => text,
            Err(e) if e.is_transient() => {
                warn!(agent = agent_id, error = %e, "worker failed transiently");
                TRANSIENT_APOLOGY.to_string()
            }
            Err(e) => {
                error!(agent = agent_id, error = %e, "worker failed terminally");
                format!("Agent `{agent_id}` could not be run: {e}")
            }
        };

        let prepared = prepare_outbound(&text);
        let mut response = QueueResponse::reply(msg, Some(agent_id), prepared.message);
        response.files = prepared.files;
        response
    }

    /// Roll a file back, or quarantine it once the rollback budget is spent.
    fn rollback_or_deadletter(&self, path: &Path, name: &str) {
        let count = {
            let mut rollbacks = self.rollbacks.lock().unwrap();
            let entry = rollbacks.entry(name.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if count >= self.config.queue.deadletter_after {
            match self.store.deadletter(path) {
                Ok(parked) => {
                    self.rollbacks.lock().unwrap().remove(name);
                    self.events.emit(Event::error(
                        "dispatcher",
                        "message_deadlettered",
                        json!({"file": name, "rollbacks": count, "path": parked.display().to_string()}),
                    ));
                }
                Err(e) => error!(file = %name, error = %e, "failed to quarantine message"),
            }
        } else if path.starts_with(self.layout.processing()) {
            if let Err(e) = self.store.rollback(path) {
                error!(file = %name, error = %e, "rollback failed");
            }
        }
        // Files still in incoming stay where they are for the next tick.
    }

    fn release(&self, name: &str) {
        self.processing.lock().unwrap().remove(name);
    }
}

fn merge_files(mut base: Vec<String>, extra: Vec<String>) -> Vec<String> {
    for file in extra {
        if !base.contains(&file) {
            base.push(file);
        }
    }
    base
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use hivebot_core::config::{AgentSpec, Provider, TeamSpec};
    use hivebot_core::events::NullEventSink;
    use hivebot_core::types::incoming_filename;
    use hivebot_workers::WorkerError;

    /// Records invocations; replies per agent id, echoing the prompt.
    struct RecordingInvoker {
        calls: Mutex<Vec<(AgentSpec, String, bool)>>,
        /// Responses by agent id; missing agents echo `echo: <prompt>`.
        replies: HashMap<String, Result<String, i32>>,
    }

    impl RecordingInvoker {
        fn echo() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                replies: HashMap::new(),
            })
        }

        fn with_reply(agent: &str, reply: Result<&str, i32>) -> Arc<Self> {
            let mut replies = HashMap::new();
            replies.insert(
                agent.to_string(),
                reply.map(str::to_string),
            );
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                replies,
            })
        }

        fn calls(&self) -> Vec<(AgentSpec, String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerInvoker for RecordingInvoker {
        async fn invoke(
            &self,
            agent: &AgentSpec,
            prompt: &str,
            fresh: bool,
        ) -> Result<String, WorkerError> {
            self.calls
                .lock()
                .unwrap()
                .push((agent.clone(), prompt.to_string(), fresh));
            match self.replies.get(&agent.id) {
                Some(Ok(reply)) => Ok(reply.clone()),
                Some(Err(code)) => Err(WorkerError::Failed {
                    code: *code,
                    stderr: "scripted failure".into(),
                }),
                None => Ok(format!("echo: {prompt}")),
            }
        }
    }

    fn single_agent_config() -> Arc<Config> {
        Arc::new(Config::default())
    }

    fn make_dispatcher(config: Arc<Config>, invoker: Arc<dyn WorkerInvoker>) -> (tempfile::TempDir, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let layout = HiveLayout::new(dir.path());
        layout.ensure().unwrap();
        let dispatcher = Dispatcher::new(config, layout, invoker, Arc::new(NullEventSink));
        (dir, dispatcher)
    }

    fn deposit(dir: &Path, msg: &QueueMessage) -> PathBuf {
        let layout = HiveLayout::new(dir);
        let path = layout
            .incoming()
            .join(incoming_filename(&msg.channel, &msg.message_id, msg.timestamp));
        std::fs::write(&path, serde_json::to_string(msg).unwrap()).unwrap();
        path
    }

    async fn drain(dispatcher: &Dispatcher) {
        for _ in 0..300 {
            if dispatcher.tracked() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dispatcher did not drain");
    }

    fn outgoing_messages(dir: &Path) -> Vec<QueueResponse> {
        let layout = HiveLayout::new(dir);
        let mut entries: Vec<_> = std::fs::read_dir(layout.outgoing())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();
        entries
            .iter()
            .map(|p| serde_json::from_str(&std::fs::read_to_string(p).unwrap()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_single_message_end_to_end() {
        let invoker = RecordingInvoker::echo();
        let (dir, dispatcher) = make_dispatcher(single_agent_config(), invoker.clone());

        deposit(dir.path(), &QueueMessage::new("t", "u", "hello", "m1"));
        dispatcher.tick().await;
        drain(&dispatcher).await;

        let responses = outgoing_messages(dir.path());
        assert_eq!(responses.len(), 1);
        assert!(responses[0].message.contains("hello"));
        assert_eq!(responses[0].message_id, "m1");
        assert_eq!(responses[0].agent.as_deref(), Some("default"));

        // Processing and incoming are both empty at completion
        let layout = HiveLayout::new(dir.path());
        assert_eq!(std::fs::read_dir(layout.processing()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(layout.incoming()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_prefix_routing_strips_and_targets() {
        let mut alice = AgentSpec::new("alice", "Alice", Provider::Anthropic);
        alice.working_directory = Some("alice-land".into());
        let mut bob = AgentSpec::new("bob", "Bob", Provider::Anthropic);
        bob.working_directory = Some("bob-land".into());
        let config = Arc::new(Config {
            agents: vec![alice, bob],
            teams: Vec::new(),
            swarms: Vec::new(),
            queue: Default::default(),
        });

        let invoker = RecordingInvoker::echo();
        let (dir, dispatcher) = make_dispatcher(config, invoker.clone());

        deposit(dir.path(), &QueueMessage::new("t", "u", "@bob do thing", "m2"));
        dispatcher.tick().await;
        drain(&dispatcher).await;

        let calls = invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.id, "bob");
        assert_eq!(calls[0].0.working_directory.as_deref(), Some("bob-land"));
        assert_eq!(calls[0].1, "do thing");

        let responses = outgoing_messages(dir.path());
        assert_eq!(responses[0].agent.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_ambiguous_mentions_get_fixed_reply() {
        let config = Arc::new(Config {
            agents: vec![
                AgentSpec::new("alice", "Alice", Provider::Anthropic),
                AgentSpec::new("bob", "Bob", Provider::Anthropic),
            ],
            teams: Vec::new(),
            swarms: Vec::new(),
            queue: Default::default(),
        });
        let invoker = RecordingInvoker::echo();
        let (dir, dispatcher) = make_dispatcher(config, invoker.clone());

        deposit(
            dir.path(),
            &QueueMessage::new("t", "u", "@alice @bob both", "m3"),
        );
        dispatcher.tick().await;
        drain(&dispatcher).await;

        let responses = outgoing_messages(dir.path());
        assert_eq!(responses[0].message, AMBIGUOUS_ROUTE_REPLY);
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_crash_recovery_restores_processing() {
        let invoker = RecordingInvoker::echo();
        let (dir, dispatcher) = make_dispatcher(single_agent_config(), invoker);

        let layout = HiveLayout::new(dir.path());
        let stranded = layout.processing().join("x.json");
        std::fs::write(
            &stranded,
            serde_json::to_string(&QueueMessage::new("t", "u", "m", "x")).unwrap(),
        )
        .unwrap();

        dispatcher.recover();

        assert!(!stranded.exists());
        assert!(layout.incoming().join("x.json").exists());
    }

    #[tokio::test]
    async fn test_same_key_fifo_order() {
        let invoker = RecordingInvoker::echo();
        let (dir, dispatcher) = make_dispatcher(single_agent_config(), invoker.clone());

        deposit(dir.path(), &QueueMessage::new("t", "u", "first", "m1"));
        tokio::time::sleep(Duration::from_millis(15)).await;
        deposit(dir.path(), &QueueMessage::new("t", "u", "second", "m2"));

        dispatcher.tick().await;
        drain(&dispatcher).await;

        let calls = invoker.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, "first");
        assert_eq!(calls[1].1, "second");
    }

    #[tokio::test]
    async fn test_duplicate_tick_does_not_double_track() {
        // Slow invoker so the file is still tracked when tick runs again.
        struct SlowInvoker {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl WorkerInvoker for SlowInvoker {
            async fn invoke(
                &self,
                _agent: &AgentSpec,
                _prompt: &str,
                _fresh: bool,
            ) -> Result<String, WorkerError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok("done".into())
            }
        }

        let invoker = Arc::new(SlowInvoker {
            calls: AtomicUsize::new(0),
        });
        let (dir, dispatcher) = make_dispatcher(single_agent_config(), invoker.clone());

        deposit(dir.path(), &QueueMessage::new("t", "u", "hello", "m1"));
        dispatcher.tick().await;
        dispatcher.tick().await;
        dispatcher.tick().await;
        drain(&dispatcher).await;

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outgoing_messages(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_transient_worker_failure_apologizes() {
        let invoker = RecordingInvoker::with_reply("default", Err(1));
        let (dir, dispatcher) = make_dispatcher(single_agent_config(), invoker);

        deposit(dir.path(), &QueueMessage::new("t", "u", "hello", "m1"));
        dispatcher.tick().await;
        drain(&dispatcher).await;

        let responses = outgoing_messages(dir.path());
        assert_eq!(responses[0].message, TRANSIENT_APOLOGY);

        // Completed response, no re-enqueue
        let layout = HiveLayout::new(dir.path());
        assert_eq!(std::fs::read_dir(layout.incoming()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(layout.processing()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_message_deadletters_after_budget() {
        let mut config = Config::default();
        config.queue.deadletter_after = 2;
        let invoker = RecordingInvoker::echo();
        let (dir, dispatcher) = make_dispatcher(Arc::new(config), invoker);

        let layout = HiveLayout::new(dir.path());
        std::fs::write(layout.incoming().join("bad.json"), "not json at all").unwrap();

        dispatcher.tick().await;
        drain(&dispatcher).await;
        assert!(layout.incoming().join("bad.json").exists());

        dispatcher.tick().await;
        drain(&dispatcher).await;
        assert!(!layout.incoming().join("bad.json").exists());
        assert!(layout.deadletter().join("bad.json").exists());
    }

    #[tokio::test]
    async fn test_team_route_through_dispatcher() {
        let config = Arc::new(Config {
            agents: vec![
                AgentSpec::new("alice", "Alice", Provider::Anthropic),
                AgentSpec::new("bob", "Bob", Provider::Anthropic),
            ],
            teams: vec![TeamSpec {
                id: "eng".into(),
                name: "Engineering".into(),
                agents: vec!["alice".into(), "bob".into()],
                leader_agent: "alice".into(),
            }],
            swarms: Vec::new(),
            queue: Default::default(),
        });

        let invoker = RecordingInvoker::with_reply("alice", Ok("all handled"));
        let (dir, dispatcher) = make_dispatcher(config, invoker.clone());

        deposit(dir.path(), &QueueMessage::new("t", "u", "@eng start", "m4"));
        dispatcher.tick().await;
        drain(&dispatcher).await;

        let responses = outgoing_messages(dir.path());
        assert_eq!(responses[0].message, "all handled");
        assert_eq!(responses[0].agent.as_deref(), Some("alice"));

        // Transcript written under chats/eng/
        let chats = HiveLayout::new(dir.path()).team_chats("eng");
        assert_eq!(std::fs::read_dir(chats).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_swarm_route_through_dispatcher() {
        let mut config = Config::default();
        config.swarms.push(
            serde_json::from_value(serde_json::json!({
                "id": "scan", "name": "Scan", "agent": "default",
                "batchSize": 2, "promptTemplate": "scan: {{items}}",
                "reduce": {"strategy": "concatenate"}
            }))
            .unwrap(),
        );

        let invoker = RecordingInvoker::echo();
        let (dir, dispatcher) = make_dispatcher(Arc::new(config), invoker);

        deposit(
            dir.path(),
            &QueueMessage::new("t", "u", "@swarm scan [\"a\",\"b\",\"c\"]", "m5"),
        );
        dispatcher.tick().await;
        drain(&dispatcher).await;

        let responses = outgoing_messages(dir.path());
        assert_eq!(responses.len(), 1);
        assert!(responses[0].message.starts_with("🐝 Scan: 3 items"));
        assert!(responses[0].message.contains("echo: scan: a\nb"));
    }

    #[tokio::test]
    async fn test_unknown_swarm_reply() {
        let invoker = RecordingInvoker::echo();
        let (dir, dispatcher) = make_dispatcher(single_agent_config(), invoker);

        deposit(
            dir.path(),
            &QueueMessage::new("t", "u", "@swarm nosuch [1]", "m6"),
        );
        dispatcher.tick().await;
        drain(&dispatcher).await;

        let responses = outgoing_messages(dir.path());
        assert!(responses[0].message.contains("`nosuch` is not configured"));
    }

    #[tokio::test]
    async fn test_reset_flag_consumed_for_conversation() {
        let invoker = RecordingInvoker::echo();
        let (dir, dispatcher) = make_dispatcher(single_agent_config(), invoker.clone());

        ResetFlags::new(HiveLayout::new(dir.path()).flags())
            .request_global()
            .unwrap();

        deposit(dir.path(), &QueueMessage::new("t", "u", "hello", "m1"));
        dispatcher.tick().await;
        drain(&dispatcher).await;

        let calls = invoker.calls();
        assert!(calls[0].2, "first invocation after reset starts fresh");

        deposit(dir.path(), &QueueMessage::new("t", "u", "again", "m2"));
        dispatcher.tick().await;
        drain(&dispatcher).await;
        assert!(!invoker.calls()[1].2, "flag was consumed");
    }

    #[tokio::test]
    async fn test_stop_ends_run_loop() {
        let invoker = RecordingInvoker::echo();
        let (_dir, dispatcher) = make_dispatcher(single_agent_config(), invoker);

        let runner = dispatcher.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run loop should stop")
            .unwrap();
    }
}
