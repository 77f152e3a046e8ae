//! Daemon runner: the single pipeline every trigger event flows through.
//!
//! Admission (concurrency gate, then budget reservation) happens on the
//! receive loop so saturation drops events instead of queueing them; each
//! admitted event is processed on its own task holding the semaphore permit
//! and an in-flight guard, so both release on every exit path.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};

use vigil_audit::AuditLogger;
use vigil_config::RoleDefinition;
use vigil_llm::{AgentExecutor, ExecuteRequest, Toolset};
use vigil_memory::EpisodeStore;
use vigil_sinks::SinkDispatcher;
use vigil_triggers::{
    is_conversational, spawn_triggers, EventSender, ScheduleQueue, TriggerEvent,
};

use crate::autonomous::{run_autonomous, AutonomousOptions};
use crate::budget::TokenTracker;
use crate::conversations::ConversationStore;
use crate::display;
use crate::history::trim_message_history;
use crate::inflight::InFlight;
use crate::scheduling::SchedulingToolset;
use crate::signal::install_shutdown_handler;

pub const MAX_CONCURRENT: usize = 4;

const EVENT_CHANNEL_CAP: usize = 64;
const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

pub struct DaemonRunner {
    inner: Arc<DaemonInner>,
    events_rx: Mutex<Option<mpsc::Receiver<TriggerEvent>>>,
}

struct DaemonInner {
    executor: Arc<dyn AgentExecutor>,
    role: RoleDefinition,
    audit: Option<AuditLogger>,
    sinks: Option<SinkDispatcher>,
    episodes: Option<EpisodeStore>,
    tracker: TokenTracker,
    conversations: ConversationStore,
    schedule_queue: Option<Arc<ScheduleQueue>>,
    autonomous_trigger_types: HashSet<String>,
    semaphore: Arc<Semaphore>,
    in_flight: InFlight,
    events_tx: EventSender,
}

impl DaemonRunner {
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        role: RoleDefinition,
        audit: Option<AuditLogger>,
        sinks: Option<SinkDispatcher>,
        episodes: Option<EpisodeStore>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAP);

        let guardrails = &role.spec.guardrails;
        let tracker = TokenTracker::new(
            guardrails.daemon_token_budget,
            guardrails.daemon_daily_token_budget,
        );

        let schedule_queue = role.spec.autonomy.as_ref().map(|autonomy| {
            ScheduleQueue::new(events_tx.clone(), autonomy.max_scheduled_total)
        });

        let autonomous_trigger_types: HashSet<String> =
            role.autonomous_trigger_types().into_iter().collect();

        Self {
            inner: Arc::new(DaemonInner {
                executor,
                role,
                audit,
                sinks,
                episodes,
                tracker,
                conversations: ConversationStore::default(),
                schedule_queue,
                autonomous_trigger_types,
                semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT)),
                in_flight: InFlight::new(),
                events_tx,
            }),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Sender for injecting events outside the trigger drivers (tests,
    /// embedding hosts).
    pub fn event_sender(&self) -> EventSender {
        self.inner.events_tx.clone()
    }

    /// Start triggers, handle events until a stop signal, then drain.
    pub async fn run(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        if inner.role.spec.triggers.is_empty() {
            anyhow::bail!("no triggers configured in role definition");
        }

        let (stop_tx, stop_rx) = watch::channel(false);

        display::daemon_header(
            &inner.role,
            &inner.role.spec.guardrails,
            &inner.autonomous_trigger_types,
            inner.role.spec.triggers.len(),
        );
        if inner.schedule_queue.is_some() {
            println!("  Scheduling enabled (in-memory, lost on restart).");
        }

        let triggers = spawn_triggers(
            &inner.role.spec.triggers,
            inner.events_tx.clone(),
            stop_rx.clone(),
        );

        {
            let inner = Arc::clone(inner);
            install_shutdown_handler(stop_tx.clone(), move || inner.on_first_signal());
        }

        let mut events_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("daemon already running"))?;

        let mut stop = stop_rx.clone();
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    Arc::clone(inner).admit(event);
                }
            }
        }

        triggers.join_all().await;
        if !inner.in_flight.wait_idle(SHUTDOWN_WAIT).await {
            warn!("in-flight work did not drain within {SHUTDOWN_WAIT:?}");
        }
        println!("Daemon stopped.");
        Ok(())
    }
}

impl DaemonInner {
    fn on_first_signal(&self) {
        println!("\nShutting down...");
        if self.in_flight.count() > 0 {
            println!("  Waiting for in-flight execution to complete...");
        }
        if let Some(queue) = &self.schedule_queue {
            let cancelled = queue.cancel_all();
            if cancelled > 0 {
                println!("  Cancelled {cancelled} pending scheduled task(s).");
            }
        }
    }

    /// Admission control, then hand the event to its own task. Refusals
    /// drop the event; nothing is queued or retried.
    fn admit(self: Arc<Self>, event: TriggerEvent) {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    trigger_type = %event.trigger_type,
                    "max concurrent triggers ({MAX_CONCURRENT}) reached, skipping trigger"
                );
                return;
            }
        };

        if let Err(reason) = self.tracker.check_before_run() {
            warn!(trigger_type = %event.trigger_type, %reason, "budget exceeded, skipping trigger");
            drop(permit);
            return;
        }

        // Take the gauge before spawning so the shutdown wait sees this
        // event even if the task has not been polled yet.
        let guard = self.in_flight.enter();
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            self.process(event).await;
        });
    }

    async fn process(&self, event: TriggerEvent) {
        info!(
            trigger_type = %event.trigger_type,
            prompt = %truncate(&event.prompt, 80),
            "trigger event"
        );

        let autonomy = self.role.spec.autonomy.clone().unwrap_or_default();

        let scheduling_toolset: Option<Arc<dyn Toolset>> =
            self.schedule_queue.as_ref().map(|queue| {
                // Fresh binding per event so the per-run quota resets.
                Arc::new(SchedulingToolset::new(&autonomy, Arc::clone(queue))) as Arc<dyn Toolset>
            });

        let use_autonomous = self.autonomous_trigger_types.contains(&event.trigger_type)
            && self.role.spec.autonomy.is_some()
            // Conversational UIs want exactly one reply per user turn.
            && !is_conversational(&event.trigger_type);

        let conv_key = event.conversation_key();
        let prior_history = self.conversations.get(conv_key.as_deref());

        if use_autonomous {
            self.process_autonomous(&event, &autonomy, scheduling_toolset, conv_key, prior_history)
                .await;
        } else {
            self.process_single(&event, &autonomy, scheduling_toolset, conv_key, prior_history)
                .await;
        }
    }

    async fn process_autonomous(
        &self,
        event: &TriggerEvent,
        autonomy: &vigil_config::AutonomyConfig,
        scheduling_toolset: Option<Arc<dyn Toolset>>,
        conv_key: Option<String>,
        prior_history: Option<Vec<vigil_llm::ChatMessage>>,
    ) {
        let options = AutonomousOptions {
            trigger_type: Some(event.trigger_type.clone()),
            trigger_metadata: event.metadata.clone(),
            message_history: prior_history,
            extra_toolsets: scheduling_toolset.into_iter().collect(),
            max_iterations_override: None,
        };
        let result = run_autonomous(
            Arc::clone(&self.executor),
            &self.role,
            &event.prompt,
            options,
            self.sinks.as_ref(),
            self.episodes.as_ref(),
        )
        .await;

        self.tracker.record_usage(result.total_tokens);
        self.audit_run(&result.run_id, &event.trigger_type, result.total_tokens, result.success);

        if conv_key.is_some() && !result.final_messages.is_empty() {
            let trimmed = trim_message_history(
                result.final_messages.clone(),
                autonomy.max_history_messages,
                false,
            );
            self.conversations.put(conv_key.as_deref(), trimmed);
        }

        if let Some(reply_fn) = &event.reply_fn {
            let reply_text = if conv_key.is_some() {
                // Conversational: only the final iteration's output.
                result.final_output.clone()
            } else {
                // Scheduled / cron-autonomous: join every non-empty output.
                result
                    .iterations
                    .iter()
                    .filter(|r| !r.output.is_empty())
                    .map(|r| r.output.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n")
            };
            if !reply_text.is_empty() {
                if let Err(err) = reply_fn(reply_text).await {
                    warn!(trigger_type = %event.trigger_type, %err, "failed to deliver reply");
                }
            }
        }
    }

    async fn process_single(
        &self,
        event: &TriggerEvent,
        autonomy: &vigil_config::AutonomyConfig,
        scheduling_toolset: Option<Arc<dyn Toolset>>,
        conv_key: Option<String>,
        prior_history: Option<Vec<vigil_llm::ChatMessage>>,
    ) {
        let request = ExecuteRequest {
            system_prompt: self.role.spec.role.clone(),
            prompt: event.prompt.clone(),
            message_history: prior_history,
            trigger_type: event.trigger_type.clone(),
            trigger_metadata: event.metadata.clone(),
            toolsets: scheduling_toolset.into_iter().collect(),
        };

        let (result, new_messages) = match self.executor.execute(request).await {
            Ok(pair) => pair,
            Err(err) => {
                error!(trigger_type = %event.trigger_type, %err, "executor failed");
                // Reconcile the admission reservation even though nothing ran.
                self.tracker.record_usage(0);
                return;
            }
        };

        self.tracker.record_usage(result.total_tokens);

        // Reply first, post-process after.
        if let Some(reply_fn) = &event.reply_fn {
            if !result.output.is_empty() {
                if let Err(err) = reply_fn(result.output.clone()).await {
                    warn!(trigger_type = %event.trigger_type, %err, "failed to deliver reply");
                }
            }
        }

        display::result_line(&result);
        if let Some(sinks) = &self.sinks {
            sinks.dispatch(
                &result.run_id,
                &event.prompt,
                &result.output,
                result.total_tokens,
                &event.trigger_type,
                &event.metadata,
            );
        }
        self.capture_episode(&result.output, &event.trigger_type);
        self.audit_run(&result.run_id, &event.trigger_type, result.total_tokens, result.success);

        if conv_key.is_some() && !new_messages.is_empty() {
            let trimmed =
                trim_message_history(new_messages, autonomy.max_history_messages, false);
            self.conversations.put(conv_key.as_deref(), trimmed);
        }
    }

    fn capture_episode(&self, output: &str, trigger_type: &str) {
        let (Some(store), Some(memory)) = (&self.episodes, &self.role.spec.memory) else {
            return;
        };
        if !memory.enabled {
            return;
        }
        let summary = format!("Daemon trigger ({trigger_type}): {}", truncate(output, 500));
        if let Err(err) = store.capture("daemon_run", summary, Some(trigger_type.to_string())) {
            warn!(?err, "failed to capture episode");
        }
        if let Err(err) = store.prune_older_than(memory.retain_episodes_days) {
            warn!(?err, "episode retention pass failed");
        }
    }

    fn audit_run(&self, run_id: &str, trigger_type: &str, total_tokens: u64, success: bool) {
        if let Some(audit) = &self.audit {
            let event = vigil_audit::run_event(run_id, trigger_type, total_tokens, success, "");
            if let Err(err) = audit.record(&event) {
                warn!(?err, "failed to write audit event");
            }
        }
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptStep, ScriptedExecutor};
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    fn make_role(yaml: &str) -> RoleDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn plain_role() -> RoleDefinition {
        make_role(
            r#"
apiVersion: v1
kind: Agent
metadata:
  name: test-agent
spec:
  role: You are a test agent.
  triggers:
    - type: cron
      schedule: "* * * * *"
      prompt: tick
"#,
        )
    }

    fn autonomous_role() -> RoleDefinition {
        make_role(
            r#"
apiVersion: v1
kind: Agent
metadata:
  name: test-agent
spec:
  role: You are a test agent.
  autonomy: {}
  guardrails:
    max_iterations: 5
  triggers:
    - type: cron
      schedule: "* * * * *"
      prompt: tick
      autonomous: true
"#,
        )
    }

    fn runner_with(
        script: Vec<ScriptStep>,
        role: RoleDefinition,
    ) -> (DaemonRunner, Arc<ScriptedExecutor>) {
        let executor = Arc::new(ScriptedExecutor::new(script));
        let runner = DaemonRunner::new(
            Arc::clone(&executor) as Arc<dyn AgentExecutor>,
            role,
            None,
            None,
            None,
        );
        (runner, executor)
    }

    /// Collects reply_fn deliveries for assertions.
    fn capture_reply() -> (vigil_triggers::ReplyFn, Arc<PlMutex<Vec<String>>>) {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reply: vigil_triggers::ReplyFn = Arc::new(move |text: String| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().push(text);
                Ok(())
            })
        });
        (reply, seen)
    }

    async fn drain(runner: &DaemonRunner) {
        // Permits are taken synchronously at admission and released when the
        // handler task finishes, so a full set means everything drained.
        for _ in 0..200 {
            tokio::task::yield_now().await;
            if runner.inner.semaphore.available_permits() == MAX_CONCURRENT
                && runner.inner.in_flight.count() == 0
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("daemon work did not drain");
    }

    #[tokio::test]
    async fn single_shot_event_executes_and_reconciles_budget() {
        let (runner, executor) = runner_with(vec![ScriptStep::respond("pong").with_tokens(50)], plain_role());
        runner.inner.clone().admit(TriggerEvent::new("cron", "ping"));
        drain(&runner).await;
        assert_eq!(executor.call_count(), 1);
        assert_eq!(runner.inner.tracker.total_consumed(), 50);
        assert_eq!(runner.inner.tracker.pending_reservations(), 0);
        assert_eq!(runner.inner.semaphore.available_permits(), MAX_CONCURRENT);
    }

    #[tokio::test]
    async fn concurrency_saturation_drops_events() {
        let slow = ScriptStep::respond("slow").with_latency(Duration::from_millis(200));
        let (runner, executor) = runner_with(vec![slow], plain_role());
        for _ in 0..10 {
            runner.inner.clone().admit(TriggerEvent::new("cron", "tick"));
        }
        // Only MAX_CONCURRENT admitted; the rest dropped at the gate.
        tokio::task::yield_now().await;
        assert!(runner.inner.in_flight.count() <= MAX_CONCURRENT);
        drain(&runner).await;
        assert_eq!(executor.call_count(), MAX_CONCURRENT);
        assert_eq!(runner.inner.semaphore.available_permits(), MAX_CONCURRENT);
    }

    #[tokio::test]
    async fn budget_refusal_drops_event_and_releases_permit() {
        let mut role = plain_role();
        role.spec.guardrails.daemon_token_budget = Some(10);
        let (runner, executor) = runner_with(vec![ScriptStep::respond("out").with_tokens(10)], role);

        runner.inner.clone().admit(TriggerEvent::new("cron", "one"));
        drain(&runner).await;
        assert_eq!(runner.inner.tracker.total_consumed(), 10);

        runner.inner.clone().admit(TriggerEvent::new("cron", "two"));
        drain(&runner).await;
        // Second event refused at the budget gate; permit returned.
        assert_eq!(executor.call_count(), 1);
        assert_eq!(runner.inner.semaphore.available_permits(), MAX_CONCURRENT);
        assert_eq!(runner.inner.tracker.pending_reservations(), 0);
    }

    #[tokio::test]
    async fn executor_error_still_releases_everything() {
        struct ExplodingExecutor;
        #[async_trait::async_trait]
        impl AgentExecutor for ExplodingExecutor {
            async fn execute(
                &self,
                _request: ExecuteRequest,
            ) -> anyhow::Result<(vigil_llm::RunResult, Vec<vigil_llm::ChatMessage>)> {
                anyhow::bail!("connection refused")
            }
        }
        let runner = DaemonRunner::new(Arc::new(ExplodingExecutor), plain_role(), None, None, None);
        runner.inner.clone().admit(TriggerEvent::new("cron", "tick"));
        drain(&runner).await;
        assert_eq!(runner.inner.semaphore.available_permits(), MAX_CONCURRENT);
        assert_eq!(runner.inner.in_flight.count(), 0);
        // Reservation reconciled to zero actual usage.
        assert_eq!(runner.inner.tracker.pending_reservations(), 0);
        assert_eq!(runner.inner.tracker.total_consumed(), 0);
    }

    #[tokio::test]
    async fn conversational_event_gets_reply_and_history() {
        let (runner, executor) = runner_with(vec![ScriptStep::respond("hello there")], plain_role());
        let (reply, seen) = capture_reply();
        let event = TriggerEvent::new("telegram", "hi")
            .with_metadata("chat_id", "123")
            .with_reply(reply);
        runner.inner.clone().admit(event);
        drain(&runner).await;

        assert_eq!(*seen.lock(), ["hello there"]);
        let history = runner.inner.conversations.get(Some("telegram:123")).unwrap();
        assert!(!history.is_empty());

        // A follow-up on the same chat sees the stored history.
        let event = TriggerEvent::new("telegram", "again").with_metadata("chat_id", "123");
        runner.inner.clone().admit(event);
        drain(&runner).await;
        let calls = executor.calls.lock();
        assert_eq!(calls[1].history_len, history.len());
    }

    #[tokio::test]
    async fn reply_failure_is_swallowed() {
        let (runner, _) = runner_with(vec![ScriptStep::respond("out")], plain_role());
        let reply: vigil_triggers::ReplyFn =
            Arc::new(|_text| Box::pin(async { anyhow::bail!("network down") }));
        let event = TriggerEvent::new("telegram", "hi")
            .with_metadata("chat_id", "5")
            .with_reply(reply);
        runner.inner.clone().admit(event);
        drain(&runner).await;
        // The run still counts as successful; budget reconciled.
        assert_eq!(runner.inner.tracker.pending_reservations(), 0);
        assert_eq!(runner.inner.semaphore.available_permits(), MAX_CONCURRENT);
    }

    #[tokio::test]
    async fn empty_output_sends_no_reply() {
        let (runner, _) = runner_with(vec![ScriptStep::respond("")], plain_role());
        let (reply, seen) = capture_reply();
        let event = TriggerEvent::new("telegram", "hi")
            .with_metadata("chat_id", "9")
            .with_reply(reply);
        runner.inner.clone().admit(event);
        drain(&runner).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn autonomous_trigger_routes_to_loop() {
        let script = vec![
            ScriptStep::respond("step one").with_tool_calls(1),
            ScriptStep::respond("all done")
                .invoking("finish_task", json!({"summary": "done", "status": "completed"})),
        ];
        let (runner, executor) = runner_with(script, autonomous_role());
        runner.inner.clone().admit(TriggerEvent::new("cron", "tick"));
        drain(&runner).await;
        assert_eq!(executor.call_count(), 2);
        // Total usage reconciled once for the whole run.
        assert_eq!(runner.inner.tracker.total_consumed(), 20);
        assert_eq!(runner.inner.tracker.pending_reservations(), 0);
    }

    #[tokio::test]
    async fn conversational_never_routes_autonomous() {
        let role = make_role(
            r#"
apiVersion: v1
kind: Agent
metadata:
  name: test-agent
spec:
  role: r
  autonomy: {}
  triggers:
    - type: telegram
      autonomous: true
"#,
        );
        let (runner, executor) = runner_with(vec![ScriptStep::respond("one reply")], role);
        let (reply, seen) = capture_reply();
        let event = TriggerEvent::new("telegram", "hi")
            .with_metadata("chat_id", "1")
            .with_reply(reply);
        runner.inner.clone().admit(event);
        drain(&runner).await;
        // Single-shot path: exactly one executor call, one reply.
        assert_eq!(executor.call_count(), 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn scheduled_event_replies_with_joined_outputs() {
        let script = vec![
            ScriptStep::respond("first part").with_tool_calls(1),
            ScriptStep::respond("").with_tool_calls(1),
            ScriptStep::respond("second part")
                .invoking("finish_task", json!({"summary": "s"})),
        ];
        let (runner, _) = runner_with(script, autonomous_role());
        let (reply, seen) = capture_reply();
        let event = TriggerEvent::new("scheduled", "follow up").with_reply(reply);
        runner.inner.clone().admit(event);
        drain(&runner).await;
        assert_eq!(*seen.lock(), ["first part\n\nsecond part"]);
    }

    #[tokio::test]
    async fn scheduling_tools_reach_the_agent() {
        let script = vec![ScriptStep::respond("queued")
            .invoking("schedule_followup", json!({"prompt": "later", "delay_seconds": 60}))
            .invoking("finish_task", json!({"summary": "s"}))];
        let (runner, _) = runner_with(script, autonomous_role());
        runner.inner.clone().admit(TriggerEvent::new("scheduled", "go"));
        drain(&runner).await;
        let queue = runner.inner.schedule_queue.as_ref().unwrap();
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.cancel_all(), 1);
    }

    #[tokio::test]
    async fn run_fails_without_triggers() {
        let role = make_role(
            r#"
apiVersion: v1
kind: Agent
metadata:
  name: t
spec:
  role: r
"#,
        );
        let (runner, _) = runner_with(vec![ScriptStep::respond("x")], role);
        assert!(runner.run().await.is_err());
    }
}
