//! Agent shell: lifecycle, inbox loop, dispatch and fault isolation

use super::breaker::{BreakerSnapshot, CircuitBreaker};
use super::context::{AgentContext, ToolSet};
use super::handler::{ErrorHandlers, HandlerTable, payload_of};
use super::metrics::{AgentMetrics, sample_memory_mb};
use super::specialist::Specialist;
use super::state::AgentState;
use crate::bus::SubscriptionId;
use crate::config::{AgentConfig, AgentSettings};
use crate::error::{AgentError, AgentResult, ErrorKind, Result, ToolError};
use crate::messages::{Message, kinds};
use crate::runtime::RuntimeHandle;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Lifecycle state plus what is currently running, kept under one lock so
/// the busy/idle flip and session tracking never disagree.
struct Activity {
    state: AgentState,
    in_flight: usize,
    sessions: HashMap<String, usize>,
}

/// Releases a slot taken by [`Agent::begin`], also when a handler unwinds
struct ActivityGuard<'a> {
    agent: &'a Agent,
    session: Option<String>,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        let mut activity = lock(&self.agent.activity);
        activity.in_flight = activity.in_flight.saturating_sub(1);
        if activity.in_flight == 0 && activity.state == AgentState::Busy {
            activity.state = AgentState::Idle;
        }
        if let Some(session) = &self.session
            && let Some(count) = activity.sessions.get_mut(session)
        {
            *count -= 1;
            if *count == 0 {
                activity.sessions.remove(session);
            }
        }
    }
}

/// Health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_name: String,
    pub state: AgentState,
    pub healthy: bool,
    pub uptime_seconds: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub active_sessions: usize,
    pub message_queue_size: usize,
    pub circuit_breaker: BreakerSnapshot,
    pub metrics: AgentMetrics,
}

/// Status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_name: String,
    pub class: String,
    pub description: String,
    pub state: AgentState,
    pub uptime_seconds: f64,
    pub active_sessions: usize,
    pub in_flight: usize,
    pub tools: Vec<String>,
    pub message_handlers: Vec<String>,
    pub metrics: AgentMetrics,
}

/// A named actor on the bus.
///
/// `Agent` wraps a [`Specialist`] with everything generic: the lifecycle
/// state machine, the inbox loop with bounded handler concurrency, the
/// circuit breaker, metrics and the periodic health check. [`handle`]
/// never fails; every error comes back as an error reply.
///
/// [`handle`]: Agent::handle
pub struct Agent {
    name: String,
    class: String,
    me: Weak<Agent>,
    specialist: Arc<dyn Specialist>,
    runtime: RuntimeHandle,
    settings: AgentSettings,
    message_timeout: Duration,
    activity: Mutex<Activity>,
    handlers: RwLock<HandlerTable>,
    error_handlers: RwLock<ErrorHandlers>,
    breaker: Mutex<CircuitBreaker>,
    metrics: Mutex<AgentMetrics>,
    tools: RwLock<ToolSet>,
    created_at: Instant,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    loop_token: CancellationToken,
    health_token: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Agent {
    pub fn new(
        config: &AgentConfig,
        specialist: Arc<dyn Specialist>,
        runtime: RuntimeHandle,
    ) -> Arc<Self> {
        let settings = config.settings.clone();
        let message_timeout = settings
            .message_timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| runtime.message_timeout());

        Arc::new_cyclic(|me: &Weak<Agent>| {
            let mut table = HandlerTable::new();
            register_builtin_handlers(&mut table, me.clone());
            Arc::clone(&specialist).register_handlers(&mut table);

            Self {
                name: config.name.clone(),
                class: config.class.clone(),
                me: me.clone(),
                specialist,
                runtime,
                message_timeout,
                activity: Mutex::new(Activity {
                    state: AgentState::Initializing,
                    in_flight: 0,
                    sessions: HashMap::new(),
                }),
                handlers: RwLock::new(table),
                error_handlers: RwLock::new(ErrorHandlers::with_defaults()),
                breaker: Mutex::new(CircuitBreaker::new(
                    settings.breaker_threshold,
                    Duration::from_secs(settings.breaker_reset_timeout),
                )),
                metrics: Mutex::new(AgentMetrics::default()),
                tools: RwLock::new(Arc::new(HashMap::new())),
                created_at: Instant::now(),
                last_heartbeat: Mutex::new(None),
                subscription: Mutex::new(None),
                semaphore: Arc::new(Semaphore::new(settings.max_concurrent_handlers.max(1))),
                tracker: TaskTracker::new(),
                loop_token: CancellationToken::new(),
                health_token: CancellationToken::new(),
                loop_handle: Mutex::new(None),
                health_handle: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                settings,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn state(&self) -> AgentState {
        lock(&self.activity).state
    }

    pub fn active_sessions(&self) -> usize {
        lock(&self.activity).sessions.len()
    }

    pub fn metrics(&self) -> AgentMetrics {
        lock(&self.metrics).clone()
    }

    /// Register or replace the handler for one message type
    pub fn register_handler<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(AgentContext, Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = AgentResult<Message>> + Send + 'static,
    {
        write(&self.handlers).register(kind, handler);
    }

    pub fn unregister_handler(&self, kind: &str) -> bool {
        write(&self.handlers).unregister(kind)
    }

    pub fn register_error_handler<F>(&self, kind: ErrorKind, handler: F)
    where
        F: Fn(&str, &Message, &AgentError) -> Message + Send + Sync + 'static,
    {
        write(&self.error_handlers).register(kind, handler);
    }

    /// Validate settings, resolve tools, restore metrics and become idle.
    ///
    /// Any failure leaves the agent in [`AgentState::Error`].
    pub async fn initialize(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let state = self.state();
        if state != AgentState::Initializing {
            return Err(AgentError::State(format!(
                "{} cannot initialize from {}",
                self.name, state
            ))
            .into());
        }

        info!("Initializing agent {} ({})", self.name, self.class);

        if let Err(e) = self.prepare().await {
            error!("Agent {} failed to initialize: {}", self.name, e);
            self.force_state(AgentState::Error);
            return Err(e);
        }

        self.transition(AgentState::Idle)?;
        self.spawn_health_loop();

        info!("Agent {} initialized", self.name);
        Ok(())
    }

    async fn prepare(&self) -> Result<()> {
        self.settings.validate()?;

        let registry = self.runtime.tools();
        let mut resolved = HashMap::new();
        for tool_name in self.specialist.required_tools() {
            let tool = registry
                .get(&tool_name)
                .await
                .ok_or_else(|| ToolError::NotFound(tool_name.clone()))?;
            resolved.insert(tool_name, tool);
        }
        *write(&self.tools) = Arc::new(resolved);

        self.restore_metrics().await;

        let name = self.name.clone();
        let id = self
            .runtime
            .bus()
            .subscribe(self.name.clone(), move |msg: Message| {
                let name = name.clone();
                async move {
                    debug!("{} has mail: {} from {}", name, msg.kind(), msg.sender());
                    Ok(())
                }
            })
            .await;
        *lock(&self.subscription) = Some(id);

        let ctx = self.context();
        self.specialist.on_initialize(&ctx).await?;
        Ok(())
    }

    /// Start the inbox loop
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let state = self.state();
        if state != AgentState::Idle {
            return Err(AgentError::State(format!("{} cannot start from {}", self.name, state)).into());
        }
        if lock(&self.loop_handle).is_some() {
            return Ok(());
        }

        self.specialist.on_start(&self.context()).await?;

        let Some(agent) = self.me.upgrade() else {
            return Err(AgentError::State(format!("{} is being dropped", self.name)).into());
        };
        let handle = tokio::spawn(agent.inbox_loop());
        *lock(&self.loop_handle) = Some(handle);

        info!("Agent {} started", self.name);
        Ok(())
    }

    async fn inbox_loop(self: Arc<Self>) {
        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        let token = self.loop_token.clone();
        let bus = self.runtime.bus().clone();

        debug!("{} inbox loop running", self.name);

        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                next = bus.receive(&self.name, poll) => match next {
                    Some(message) => message,
                    None => continue,
                },
            };

            let permit = tokio::select! {
                _ = token.cancelled() => {
                    warn!("{} dropping {} received during shutdown", self.name, message.kind());
                    break;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
            };
            let Ok(permit) = permit else { break };

            let agent = Arc::clone(&self);
            self.tracker.spawn(async move {
                let _permit = permit;
                agent.process_inbound(message).await;
            });
        }

        debug!("{} inbox loop exited", self.name);
    }

    async fn process_inbound(&self, message: Message) {
        let response = self.handle_admitted(message, true).await;
        let bus = self.runtime.bus();

        if bus.subscriber_count(response.recipient()).await == 0 {
            debug!(
                "{}: no route for {} to {}",
                self.name,
                response.kind(),
                response.recipient()
            );
            return;
        }
        if !bus.send(response).await {
            warn!("{}: failed to deliver reply", self.name);
        }
    }

    /// Stop the inbox loop and wait for in-flight handlers to drain
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_inner().await
    }

    async fn stop_inner(&self) -> Result<()> {
        let state = self.state();
        if matches!(state, AgentState::ShuttingDown | AgentState::Shutdown) {
            return Ok(());
        }
        self.transition(AgentState::ShuttingDown)?;
        info!("Stopping agent {}", self.name);

        self.loop_token.cancel();
        let handle = lock(&self.loop_handle).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!("{} inbox loop ended abnormally: {}", self.name, e);
        }

        self.tracker.close();
        let drain = self.runtime.drain_timeout();
        if tokio::time::timeout(drain, self.tracker.wait()).await.is_err() {
            warn!(
                "{}: abandoning {} handler task(s) after {:?}",
                self.name,
                self.tracker.len(),
                drain
            );
        }

        self.specialist.on_stop(&self.context()).await;
        Ok(())
    }

    /// Release everything and enter [`AgentState::Shutdown`]. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() == AgentState::Shutdown {
            return Ok(());
        }
        self.stop_inner().await?;

        self.health_token.cancel();
        let handle = lock(&self.health_handle).take();
        if let Some(handle) = handle {
            handle.abort();
        }

        self.persist_metrics().await;

        let ctx = self.context();
        self.specialist.on_shutdown(&ctx).await;
        *write(&self.tools) = Arc::new(HashMap::new());

        let subscription = lock(&self.subscription).take();
        if let Some(id) = subscription {
            self.runtime.bus().unsubscribe(&self.name, id).await;
        }

        self.transition(AgentState::Shutdown)?;
        info!("Agent {} shut down", self.name);
        Ok(())
    }

    /// Process one message and return the reply.
    ///
    /// Messages are refused without invoking any handler while the agent is
    /// not idle or busy, or while the circuit breaker is open.
    pub async fn handle(&self, message: Message) -> Message {
        self.handle_admitted(message, false).await
    }

    /// `draining` also admits messages the inbox loop took before a stop
    /// began, so they finish during the drain instead of being refused.
    async fn handle_admitted(&self, message: Message, draining: bool) -> Message {
        let state = self.state();
        if !admits(state, draining) {
            let err = AgentError::State(format!("{} is {}", self.name, state));
            return self.error_reply(&message, &err);
        }

        if lock(&self.breaker).is_open() {
            debug!("{}: breaker open, refusing {}", self.name, message.kind());
            let err = AgentError::CircuitOpen(self.name.clone());
            return self.error_reply(&message, &err);
        }

        let _guard = match self.begin(message.session_id(), draining) {
            Ok(guard) => guard,
            Err(err) => return self.error_reply(&message, &err),
        };

        let started = Instant::now();
        let timeout = message.timeout().unwrap_or(self.message_timeout);
        let outcome = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(self.dispatch(message.clone())).catch_unwind(),
        )
        .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(AgentError::Internal(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(AgentError::Timeout(format!(
                "{} did not finish within {:?}",
                message.kind(),
                timeout
            ))),
        };

        match result {
            Ok(response) => {
                lock(&self.metrics).record_success(started.elapsed());
                lock(&self.breaker).record_success();
                response
            }
            Err(err) => {
                lock(&self.metrics).record_failure();
                lock(&self.breaker).record_failure();
                warn!("{} failed to handle {}: {}", self.name, message.kind(), err);
                self.error_reply(&message, &err)
            }
        }
    }

    fn begin(&self, session: Option<&str>, draining: bool) -> AgentResult<ActivityGuard<'_>> {
        let mut activity = lock(&self.activity);
        if !admits(activity.state, draining) {
            return Err(AgentError::State(format!(
                "{} is {}",
                self.name, activity.state
            )));
        }

        activity.in_flight += 1;
        if activity.state == AgentState::Idle {
            activity.state = AgentState::Busy;
        }
        if let Some(session) = session {
            *activity.sessions.entry(session.to_string()).or_insert(0) += 1;
        }

        Ok(ActivityGuard {
            agent: self,
            session: session.map(str::to_string),
        })
    }

    async fn dispatch(&self, message: Message) -> AgentResult<Message> {
        let ctx = self.context();
        let handler = read(&self.handlers).get(message.kind());

        match handler {
            Some(handler) => handler(ctx, message).await,
            None => {
                let input = self.specialist.validate(&ctx, &message).await?;
                let output = self.specialist.process(&ctx, &message, input).await?;
                let payload = self.specialist.generate(&ctx, &message, output).await?;
                Ok(message
                    .reply(format!("{}_response", message.kind()))
                    .with_payload(payload))
            }
        }
    }

    fn error_reply(&self, message: &Message, error: &AgentError) -> Message {
        read(&self.error_handlers).respond(&self.name, message, error)
    }

    fn context(&self) -> AgentContext {
        AgentContext::new(
            self.name.clone(),
            self.runtime.clone(),
            Arc::clone(&read(&self.tools)),
        )
    }

    fn transition(&self, next: AgentState) -> AgentResult<()> {
        let mut activity = lock(&self.activity);
        if !activity.state.can_transition_to(next) {
            return Err(AgentError::State(format!(
                "{}: illegal transition {} -> {}",
                self.name, activity.state, next
            )));
        }
        debug!("{}: {} -> {}", self.name, activity.state, next);
        activity.state = next;
        Ok(())
    }

    fn force_state(&self, next: AgentState) {
        lock(&self.activity).state = next;
    }

    fn spawn_health_loop(&self) {
        let me = self.me.clone();
        let token = self.health_token.clone();
        let interval = Duration::from_secs(self.settings.health_check_interval);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(agent) = me.upgrade() else { break };
                        agent.health_tick().await;
                    }
                }
            }
        });
        *lock(&self.health_handle) = Some(handle);
    }

    /// One health-check pass; the only place load warnings are logged
    async fn health_tick(&self) {
        *lock(&self.last_heartbeat) = Some(Utc::now());

        let memory = sample_memory_mb().await;
        {
            let mut metrics = lock(&self.metrics);
            metrics.uptime_seconds = self.created_at.elapsed().as_secs_f64();
            metrics.memory_usage_mb = memory;
        }

        let tools: Vec<_> = read(&self.tools).values().cloned().collect();
        for tool in tools {
            let health = tool.health_check().await;
            if !health.healthy {
                warn!("{}: tool {} is unhealthy: {}", self.name, tool.name(), health.details);
            }
        }

        let queue = self.runtime.bus().queue_len(&self.name).await;
        if queue > self.settings.queue_warn_threshold {
            warn!("{}: message queue size is high: {}", self.name, queue);
        }

        let sessions = self.active_sessions();
        if sessions > self.settings.session_warn_threshold {
            warn!("{}: high number of active sessions: {}", self.name, sessions);
        }
    }

    pub async fn health(&self) -> AgentHealth {
        let state = self.state();
        let message_queue_size = self.runtime.bus().queue_len(&self.name).await;
        let mut metrics = self.metrics();
        metrics.uptime_seconds = self.created_at.elapsed().as_secs_f64();
        let last_heartbeat = *lock(&self.last_heartbeat);
        let circuit_breaker = lock(&self.breaker).snapshot();

        AgentHealth {
            agent_name: self.name.clone(),
            state,
            healthy: state.accepts_messages(),
            uptime_seconds: metrics.uptime_seconds,
            last_heartbeat,
            active_sessions: self.active_sessions(),
            message_queue_size,
            circuit_breaker,
            metrics,
        }
    }

    pub fn status(&self) -> AgentStatus {
        let (state, in_flight, active_sessions) = {
            let activity = lock(&self.activity);
            (activity.state, activity.in_flight, activity.sessions.len())
        };
        let mut metrics = self.metrics();
        metrics.uptime_seconds = self.created_at.elapsed().as_secs_f64();

        let mut tools: Vec<String> = read(&self.tools).keys().cloned().collect();
        tools.sort();

        AgentStatus {
            agent_name: self.name.clone(),
            class: self.class.clone(),
            description: self.specialist.description().to_string(),
            state,
            uptime_seconds: metrics.uptime_seconds,
            active_sessions,
            in_flight,
            tools,
            message_handlers: read(&self.handlers).kinds(),
            metrics,
        }
    }

    async fn restore_metrics(&self) {
        if !self.runtime.persist_state() {
            return;
        }
        let Some(snapshot) = self.runtime.sessions().load_agent_snapshot(&self.name).await else {
            return;
        };

        match serde_json::from_value::<AgentMetrics>(snapshot) {
            Ok(saved) => {
                let mut metrics = lock(&self.metrics);
                metrics.messages_processed = saved.messages_processed;
                metrics.messages_failed = saved.messages_failed;
                metrics.average_response_time = saved.average_response_time;
                metrics.last_activity = saved.last_activity;
                debug!("{}: restored metrics ({} processed)", self.name, saved.messages_processed);
            }
            Err(e) => warn!("{}: ignoring saved metrics: {}", self.name, e),
        }
    }

    async fn persist_metrics(&self) {
        if !self.runtime.persist_state() {
            return;
        }
        let snapshot = match serde_json::to_value(self.metrics()) {
            Ok(value) => value,
            Err(e) => {
                error!("{}: cannot serialize metrics: {}", self.name, e);
                return;
            }
        };
        if let Err(e) = self
            .runtime
            .sessions()
            .save_agent_snapshot(&self.name, &snapshot)
            .await
        {
            error!("{}: failed to persist metrics: {}", self.name, e);
        }
    }
}

fn register_builtin_handlers(table: &mut HandlerTable, me: Weak<Agent>) {
    table.register(kinds::PING, |_ctx, msg: Message| async move {
        Ok(msg
            .reply(kinds::PONG)
            .with_value("timestamp", json!(Utc::now().to_rfc3339())))
    });

    let agent = me.clone();
    table.register(kinds::HEALTH_CHECK, move |_ctx, msg: Message| {
        let agent = agent.clone();
        async move {
            let agent = upgrade(&agent)?;
            let health = agent.health().await;
            Ok(msg
                .reply(kinds::HEALTH_CHECK_RESPONSE)
                .with_payload(payload_of(&health)?))
        }
    });

    table.register(kinds::GET_STATUS, move |_ctx, msg: Message| {
        let agent = me.clone();
        async move {
            let agent = upgrade(&agent)?;
            let status = agent.status();
            Ok(msg
                .reply(kinds::STATUS_RESPONSE)
                .with_payload(payload_of(&status)?))
        }
    });
}

fn admits(state: AgentState, draining: bool) -> bool {
    state.accepts_messages() || (draining && state == AgentState::ShuttingDown)
}

fn upgrade(agent: &Weak<Agent>) -> AgentResult<Arc<Agent>> {
    agent
        .upgrade()
        .ok_or_else(|| AgentError::State("agent has been dropped".into()))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::config::{RuntimeConfig, SessionsConfig};
    use crate::messages::Payload;
    use crate::session::SessionStore;
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Echoes pipeline input and exposes a few misbehaving handlers
    #[derive(Default)]
    struct Stub {
        tools: Vec<String>,
        counted: AtomicUsize,
    }

    #[async_trait]
    impl Specialist for Stub {
        fn description(&self) -> &str {
            "test stub"
        }

        fn required_tools(&self) -> Vec<String> {
            self.tools.clone()
        }

        fn register_handlers(self: Arc<Self>, table: &mut HandlerTable) {
            table.register("explode", |_ctx, msg: Message| async move {
                if msg.kind() == "explode" {
                    panic!("handler exploded");
                }
                Ok(msg.reply("unreachable"))
            });
            table.register("slow", |_ctx, msg: Message| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(msg.reply("slow_response"))
            });
            table.register("fail", |_ctx, _msg: Message| async move {
                Err::<Message, _>(AgentError::Internal("nope".into()))
            });
            table.register("stall", |_ctx, msg: Message| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(msg.reply("stall_response"))
            });

            let this = Arc::clone(&self);
            table.register("count", move |_ctx, msg: Message| {
                let this = Arc::clone(&this);
                async move {
                    this.counted.fetch_add(1, Ordering::SeqCst);
                    Ok(msg.reply("count_response"))
                }
            });
        }

        async fn process(
            &self,
            _ctx: &AgentContext,
            _message: &Message,
            input: Payload,
        ) -> AgentResult<Payload> {
            Ok(input)
        }
    }

    async fn stub_agent(dir: &TempDir, configure: impl FnOnce(&mut AgentConfig)) -> Arc<Agent> {
        stub_agent_with(dir, &RuntimeConfig::default(), Arc::new(Stub::default()), configure).await
    }

    async fn stub_agent_with(
        dir: &TempDir,
        runtime_config: &RuntimeConfig,
        stub: Arc<Stub>,
        configure: impl FnOnce(&mut AgentConfig),
    ) -> Arc<Agent> {
        let bus = MessageBus::new();
        bus.start().await;
        let sessions = SessionStore::new(&SessionsConfig::in_dir(dir.path()));
        let runtime = RuntimeHandle::new(bus, sessions, ToolRegistry::new(), runtime_config);

        let mut config = AgentConfig::new("stub_agent", "stub");
        config.settings.poll_interval_ms = 20;
        configure(&mut config);
        Agent::new(&config, stub, runtime)
    }

    /// Wait until the inbox loop has a handler running
    async fn wait_in_flight(agent: &Agent) {
        for _ in 0..200 {
            if agent.status().in_flight > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no handler started");
    }

    #[tokio::test]
    async fn test_lifecycle_and_refusal_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, |_| {}).await;
        assert_eq!(agent.state(), AgentState::Initializing);

        let early = agent.handle(Message::new(kinds::PING, "client", "stub_agent")).await;
        assert_eq!(early.get_str("error_type"), Some("state"));

        agent.initialize().await.unwrap();
        assert_eq!(agent.state(), AgentState::Idle);
        assert!(agent.initialize().await.is_err());

        agent.start().await.unwrap();
        let pong = agent.handle(Message::new(kinds::PING, "client", "stub_agent")).await;
        assert_eq!(pong.kind(), kinds::PONG);
        assert_eq!(agent.state(), AgentState::Idle);

        agent.shutdown().await.unwrap();
        agent.shutdown().await.unwrap();
        assert_eq!(agent.state(), AgentState::Shutdown);

        let refused = agent.handle(Message::new(kinds::PING, "client", "stub_agent")).await;
        assert_eq!(refused.kind(), kinds::ERROR_RESPONSE);
        assert_eq!(refused.get_str("error_type"), Some("state"));
    }

    #[tokio::test]
    async fn test_pipeline_echoes_into_typed_reply() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, |_| {}).await;
        agent.initialize().await.unwrap();

        let reply = agent
            .handle(
                Message::new("echo", "client", "stub_agent")
                    .with_session("s1")
                    .with_value("n", 7),
            )
            .await;
        assert_eq!(reply.kind(), "echo_response");
        assert_eq!(reply.get("n"), Some(&json!(7)));
        assert_eq!(reply.session_id(), Some("s1"));
        assert_eq!(agent.active_sessions(), 0);
        assert_eq!(agent.metrics().messages_processed, 1);

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, |_| {}).await;
        agent.initialize().await.unwrap();

        let reply = agent.handle(Message::new("explode", "client", "stub_agent")).await;
        assert_eq!(reply.kind(), kinds::ERROR_RESPONSE);
        assert_eq!(reply.get_str("error_type"), Some("internal"));
        assert!(reply.get_str("error").unwrap().contains("handler exploded"));

        assert_eq!(agent.state(), AgentState::Idle);
        let pong = agent.handle(Message::new(kinds::PING, "client", "stub_agent")).await;
        assert_eq!(pong.kind(), kinds::PONG);
        assert_eq!(agent.metrics().messages_failed, 1);

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_timeout() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, |_| {}).await;
        agent.initialize().await.unwrap();

        let reply = agent
            .handle(
                Message::new("slow", "client", "stub_agent")
                    .with_timeout(Duration::from_millis(20)),
            )
            .await;
        assert_eq!(reply.kind(), kinds::TIMEOUT_ERROR_RESPONSE);
        assert_eq!(reply.get("recoverable"), Some(&json!(true)));

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_breaker_refuses_after_threshold() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, |config| config.settings.breaker_threshold = 3).await;
        agent.initialize().await.unwrap();

        for _ in 0..3 {
            let reply = agent.handle(Message::new("fail", "client", "stub_agent")).await;
            assert_eq!(reply.get_str("error_type"), Some("internal"));
        }

        let refused = agent.handle(Message::new(kinds::PING, "client", "stub_agent")).await;
        assert_eq!(refused.get_str("error_type"), Some("circuit_open"));
        assert_eq!(refused.get("recoverable"), Some(&json!(true)));
        let health = agent.health().await;
        assert!(health.circuit_breaker.open);
        assert!(health.healthy);

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_breaker_skips_handler() {
        let dir = TempDir::new().unwrap();
        let stub = Arc::new(Stub::default());
        let agent = stub_agent_with(&dir, &RuntimeConfig::default(), Arc::clone(&stub), |config| {
            config.settings.breaker_threshold = 3
        })
        .await;
        agent.initialize().await.unwrap();

        let counted = agent.handle(Message::new("count", "client", "stub_agent")).await;
        assert_eq!(counted.kind(), "count_response");
        assert_eq!(stub.counted.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            agent.handle(Message::new("fail", "client", "stub_agent")).await;
        }

        let refused = agent.handle(Message::new("count", "client", "stub_agent")).await;
        assert_eq!(refused.get_str("error_type"), Some("circuit_open"));
        assert_eq!(stub.counted.load(Ordering::SeqCst), 1);
        assert_eq!(agent.metrics().messages_failed, 3);

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_handler() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, |_| {}).await;
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        let bus = agent.runtime.bus().clone();
        bus.subscribe("client", |_| async { Ok(()) }).await;
        assert!(bus.send(Message::new("slow", "client", "stub_agent")).await);
        wait_in_flight(&agent).await;

        agent.stop().await.unwrap();
        assert_eq!(agent.state(), AgentState::ShuttingDown);
        assert_eq!(agent.status().in_flight, 0);

        let reply = bus.receive("client", Duration::from_millis(100)).await.unwrap();
        assert_eq!(reply.kind(), "slow_response");

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_abandons_handler_after_drain_timeout() {
        let dir = TempDir::new().unwrap();
        let runtime_config = RuntimeConfig {
            drain_timeout: 0,
            ..RuntimeConfig::default()
        };
        let agent = stub_agent_with(&dir, &runtime_config, Arc::new(Stub::default()), |_| {}).await;
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        let bus = agent.runtime.bus().clone();
        bus.subscribe("client", |_| async { Ok(()) }).await;
        assert!(bus.send(Message::new("stall", "client", "stub_agent")).await);
        wait_in_flight(&agent).await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), agent.stop()).await;
        assert!(matches!(stopped, Ok(Ok(()))));
        assert_eq!(agent.status().in_flight, 1);
        assert!(bus.receive("client", Duration::from_millis(20)).await.is_none());

        agent.shutdown().await.unwrap();
        assert_eq!(agent.state(), AgentState::Shutdown);
    }

    #[tokio::test]
    async fn test_dequeued_message_is_served_while_shutting_down() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, |_| {}).await;
        agent.initialize().await.unwrap();
        agent.stop().await.unwrap();
        assert_eq!(agent.state(), AgentState::ShuttingDown);

        let refused = agent.handle(Message::new(kinds::PING, "client", "stub_agent")).await;
        assert_eq!(refused.get_str("error_type"), Some("state"));

        let served = agent
            .handle_admitted(Message::new(kinds::PING, "client", "stub_agent"), true)
            .await;
        assert_eq!(served.kind(), kinds::PONG);
        assert_eq!(agent.state(), AgentState::ShuttingDown);

        agent.shutdown().await.unwrap();
        let late = agent
            .handle_admitted(Message::new(kinds::PING, "client", "stub_agent"), true)
            .await;
        assert_eq!(late.get_str("error_type"), Some("state"));
    }

    #[tokio::test]
    async fn test_inbox_loop_replies_over_bus() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, |_| {}).await;
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        let bus = agent.runtime.bus().clone();
        bus.subscribe("client", |_| async { Ok(()) }).await;
        assert!(bus.send(Message::new(kinds::GET_STATUS, "client", "stub_agent")).await);

        let reply = bus.receive("client", Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply.kind(), kinds::STATUS_RESPONSE);
        assert_eq!(reply.get_str("agent_name"), Some("stub_agent"));
        assert!(reply.get("message_handlers").is_some());

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_tool_leaves_error_state() {
        let dir = TempDir::new().unwrap();
        let bus = MessageBus::new();
        let sessions = SessionStore::new(&SessionsConfig::in_dir(dir.path()));
        let runtime = RuntimeHandle::new(bus, sessions, ToolRegistry::new(), &RuntimeConfig::default());

        let stub = Stub {
            tools: vec!["llm_tool".to_string()],
            ..Stub::default()
        };
        let agent = Agent::new(&AgentConfig::new("stub_agent", "stub"), Arc::new(stub), runtime);
        assert!(agent.initialize().await.is_err());
        assert_eq!(agent.state(), AgentState::Error);

        agent.shutdown().await.unwrap();
        assert_eq!(agent.state(), AgentState::Shutdown);
    }

    #[test]
    fn test_panic_message_extraction() {
        let text: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(text.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
