//! Runtime: the dispatcher loops that drive orchestrations forward.
//!
//! Three dispatchers poll the provider queues under peek-lock. The
//! orchestrator dispatcher appends the stimulus event for a work item,
//! replays the instance's orchestration function for one turn, persists
//! the turn's history delta and fans the emitted actions back out to
//! the worker and timer queues. The worker dispatcher executes
//! activities and enqueues their completions; the timer dispatcher
//! feeds the in-process [`timers::TimerService`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use semver::Version;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::{history_is_terminal, max_correlation_id, run_turn, Action, Event, OrchestrationContext};

pub mod registry;
mod status;
mod timers;

pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder, Registry,
    RegistryBuilder, VersionPolicy, DEFAULT_VERSION,
};
pub use status::{status_from_history, OrchestrationStatus};

use timers::TimerService;

/// Configuration options for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Polling interval when dispatcher queues are empty.
    pub dispatcher_idle_sleep_ms: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
        }
    }
}

/// Error returned by client wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("timed out waiting for orchestration"),
            WaitError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Per-invocation context handed to activity handlers.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance: String,
    pub activity_id: u64,
}

#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing [`OrchestrationHandler`].
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing [`ActivityHandler`].
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// A started runtime. Dropping it detaches the dispatchers; call
/// [`Runtime::shutdown`] for an orderly stop.
pub struct Runtime {
    shutdown: watch::Sender<bool>,
    dispatchers: Vec<JoinHandle<()>>,
    timer_task: JoinHandle<()>,
}

impl Runtime {
    pub fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
    ) -> Self {
        Self::start_with_options(store, activities, orchestrations, RuntimeOptions::default())
    }

    pub fn start_with_options(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Self {
        init_tracing();
        let idle = Duration::from_millis(options.dispatcher_idle_sleep_ms);
        let (shutdown, _) = watch::channel(false);
        let (timer_task, timer_tx) = TimerService::start(store.clone(), options.dispatcher_idle_sleep_ms);
        let dispatchers = vec![
            tokio::spawn(orchestrator_dispatcher(
                store.clone(),
                orchestrations,
                shutdown.subscribe(),
                idle,
            )),
            tokio::spawn(worker_dispatcher(store.clone(), activities, shutdown.subscribe(), idle)),
            tokio::spawn(timer_dispatcher(store, timer_tx, shutdown.subscribe(), idle)),
        ];
        Self {
            shutdown,
            dispatchers,
            timer_task,
        }
    }

    /// Stop the dispatchers and the timer service. In-flight items are
    /// finished first; unconsumed queue items stay in the provider.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.dispatchers {
            let _ = handle.await;
        }
        self.timer_task.abort();
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn orchestrator_dispatcher(
    store: Arc<dyn HistoryStore>,
    orchestrations: OrchestrationRegistry,
    shutdown: watch::Receiver<bool>,
    idle: Duration,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match store.dequeue_peek_lock(QueueKind::Orchestrator).await {
            Some((item, token)) => {
                let instance = item.instance().to_string();
                match handle_orchestrator_item(&store, &orchestrations, item).await {
                    Ok(()) => {
                        if let Err(e) = store.ack(QueueKind::Orchestrator, &token).await {
                            error!(instance, error = %e, "failed to ack orchestrator item");
                        }
                    }
                    Err(e) => {
                        warn!(instance, error = %e, "orchestrator item failed, abandoning");
                        if let Err(e) = store.abandon(QueueKind::Orchestrator, &token).await {
                            error!(instance, error = %e, "failed to abandon orchestrator item");
                        }
                    }
                }
            }
            None => tokio::time::sleep(idle).await,
        }
    }
}

async fn handle_orchestrator_item(
    store: &Arc<dyn HistoryStore>,
    orchestrations: &OrchestrationRegistry,
    item: WorkItem,
) -> Result<(), String> {
    match item {
        WorkItem::StartOrchestration {
            instance,
            orchestration,
            input,
        } => start_instance(store, orchestrations, &instance, &orchestration, input).await,
        WorkItem::ActivityCompleted { instance, id, result } => {
            apply_completion(store, orchestrations, &instance, Event::ActivityCompleted { id, result }).await
        }
        WorkItem::ActivityFailed { instance, id, error } => {
            apply_completion(store, orchestrations, &instance, Event::ActivityFailed { id, error }).await
        }
        WorkItem::TimerFired {
            instance,
            id,
            fire_at_ms,
        } => apply_completion(store, orchestrations, &instance, Event::TimerFired { id, fire_at_ms }).await,
        WorkItem::ExternalRaised { instance, name, data } => {
            apply_external(store, orchestrations, &instance, &name, data).await
        }
        WorkItem::CancelInstance { instance, reason } => apply_cancel(store, &instance, &reason).await,
        other @ (WorkItem::ActivityExecute { .. } | WorkItem::TimerSchedule { .. }) => {
            warn!(item = ?other, "unexpected item on orchestrator queue, dropping");
            Ok(())
        }
    }
}

async fn start_instance(
    store: &Arc<dyn HistoryStore>,
    orchestrations: &OrchestrationRegistry,
    instance: &str,
    orchestration: &str,
    input: String,
) -> Result<(), String> {
    if !store.exists(instance).await {
        warn!(instance, "start for unknown instance, dropping");
        return Ok(());
    }
    if !store.read(instance).await.is_empty() {
        debug!(instance, "start redelivered for a started instance, dropping");
        return Ok(());
    }
    let Some((version, _)) = orchestrations.resolve(orchestration) else {
        warn!(instance, orchestration, "orchestration not registered");
        store
            .append(
                instance,
                vec![
                    Event::OrchestrationStarted {
                        name: orchestration.to_string(),
                        version: DEFAULT_VERSION.to_string(),
                        input,
                    },
                    Event::OrchestrationFailed {
                        error: format!("unregistered orchestration: {orchestration}"),
                    },
                ],
            )
            .await?;
        return Ok(());
    };
    info!(instance, orchestration, version = %version, "starting orchestration");
    store
        .append(
            instance,
            vec![Event::OrchestrationStarted {
                name: orchestration.to_string(),
                version: version.to_string(),
                input,
            }],
        )
        .await?;
    run_instance_turn(store, orchestrations, instance).await
}

async fn apply_completion(
    store: &Arc<dyn HistoryStore>,
    orchestrations: &OrchestrationRegistry,
    instance: &str,
    event: Event,
) -> Result<(), String> {
    if !store.exists(instance).await {
        warn!(instance, event = ?event, "completion for unknown instance, dropping");
        return Ok(());
    }
    let history = store.read(instance).await;
    if history_is_terminal(&history) {
        debug!(instance, event = ?event, "completion after terminal state, dropping");
        return Ok(());
    }
    store.append(instance, vec![event]).await?;
    run_instance_turn(store, orchestrations, instance).await
}

async fn apply_external(
    store: &Arc<dyn HistoryStore>,
    orchestrations: &OrchestrationRegistry,
    instance: &str,
    name: &str,
    data: String,
) -> Result<(), String> {
    if !store.exists(instance).await {
        warn!(instance, event_name = name, "external event for unknown instance, dropping");
        return Ok(());
    }
    let history = store.read(instance).await;
    if history_is_terminal(&history) {
        debug!(instance, event_name = name, "external event after terminal state, dropping");
        return Ok(());
    }
    // Claim the oldest open subscription for this name. Without one the
    // event still lands in history under a fresh id no subscription can
    // ever claim, keeping raises append-only but never retroactive.
    let id = match oldest_open_subscription(&history, name) {
        Some(id) => id,
        None => {
            debug!(instance, event_name = name, "external event with no open subscription");
            max_correlation_id(&history) + 1
        }
    };
    store
        .append(
            instance,
            vec![Event::ExternalEvent {
                id,
                name: name.to_string(),
                data,
            }],
        )
        .await?;
    run_instance_turn(store, orchestrations, instance).await
}

/// Oldest `ExternalSubscribed` for `name` with no `ExternalEvent` of
/// the same id yet.
fn oldest_open_subscription(history: &[Event], name: &str) -> Option<u64> {
    let resolved: HashSet<u64> = history
        .iter()
        .filter_map(|e| match e {
            Event::ExternalEvent { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    history.iter().find_map(|e| match e {
        Event::ExternalSubscribed { id, name: sub } if sub == name && !resolved.contains(id) => Some(*id),
        _ => None,
    })
}

async fn apply_cancel(store: &Arc<dyn HistoryStore>, instance: &str, reason: &str) -> Result<(), String> {
    if !store.exists(instance).await {
        warn!(instance, "cancel for unknown instance, dropping");
        return Ok(());
    }
    let history = store.read(instance).await;
    if history_is_terminal(&history) {
        debug!(instance, "cancel after terminal state, dropping");
        return Ok(());
    }
    store
        .append(
            instance,
            vec![
                Event::OrchestrationCancelRequested {
                    reason: reason.to_string(),
                },
                Event::OrchestrationCancelled {
                    reason: reason.to_string(),
                },
            ],
        )
        .await?;
    info!(instance, reason, "orchestration cancelled");
    Ok(())
}

/// Replay one turn for `instance` and persist its outcome: history
/// delta first, then dispatched actions, then any terminal event.
async fn run_instance_turn(
    store: &Arc<dyn HistoryStore>,
    orchestrations: &OrchestrationRegistry,
    instance: &str,
) -> Result<(), String> {
    let history = store.read(instance).await;
    if history_is_terminal(&history) {
        return Ok(());
    }
    let (name, version, input) = match history.first() {
        Some(Event::OrchestrationStarted { name, version, input }) => {
            (name.clone(), version.clone(), input.clone())
        }
        _ => return Err(format!("instance {instance} has no start event")),
    };
    let parsed = Version::parse(&version).map_err(|e| format!("bad recorded version {version}: {e}"))?;
    let Some(handler) = orchestrations.resolve_exact(&name, &parsed) else {
        warn!(instance, orchestration = %name, version, "pinned version no longer registered");
        store
            .append(
                instance,
                vec![Event::OrchestrationFailed {
                    error: format!("unregistered orchestration: {name}@{version}"),
                }],
            )
            .await?;
        return Ok(());
    };

    let turn = run_turn(history, |ctx| handler.invoke(ctx, input));
    if let Some(msg) = turn.nondeterminism {
        error!(instance, error = %msg, "nondeterministic execution");
        store
            .append(
                instance,
                vec![Event::OrchestrationFailed {
                    error: format!("nondeterministic execution: {msg}"),
                }],
            )
            .await?;
        return Ok(());
    }
    if !turn.new_events.is_empty() {
        store.append(instance, turn.new_events).await?;
    }
    for action in turn.actions {
        match action {
            Action::CallActivity { id, name, input } => {
                store
                    .enqueue_work(
                        QueueKind::Worker,
                        WorkItem::ActivityExecute {
                            instance: instance.to_string(),
                            id,
                            name,
                            input,
                        },
                    )
                    .await?;
            }
            Action::CreateTimer { id, fire_at_ms } => {
                store
                    .enqueue_work(
                        QueueKind::Timer,
                        WorkItem::TimerSchedule {
                            instance: instance.to_string(),
                            id,
                            fire_at_ms,
                        },
                    )
                    .await?;
            }
            // Subscriptions are satisfied by raises, nothing to dispatch.
            Action::WaitExternal { .. } => {}
        }
    }
    match turn.output {
        Some(Ok(output)) => {
            info!(instance, "orchestration completed");
            store
                .append(instance, vec![Event::OrchestrationCompleted { output }])
                .await?;
        }
        Some(Err(error)) => {
            warn!(instance, error = %error, "orchestration failed");
            store.append(instance, vec![Event::OrchestrationFailed { error }]).await?;
        }
        None => {}
    }
    Ok(())
}

async fn worker_dispatcher(
    store: Arc<dyn HistoryStore>,
    activities: ActivityRegistry,
    shutdown: watch::Receiver<bool>,
    idle: Duration,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match store.dequeue_peek_lock(QueueKind::Worker).await {
            Some((item, token)) => {
                let instance = item.instance().to_string();
                match handle_worker_item(&store, &activities, item).await {
                    Ok(()) => {
                        if let Err(e) = store.ack(QueueKind::Worker, &token).await {
                            error!(instance, error = %e, "failed to ack worker item");
                        }
                    }
                    Err(e) => {
                        warn!(instance, error = %e, "worker item failed, abandoning");
                        if let Err(e) = store.abandon(QueueKind::Worker, &token).await {
                            error!(instance, error = %e, "failed to abandon worker item");
                        }
                    }
                }
            }
            None => tokio::time::sleep(idle).await,
        }
    }
}

async fn handle_worker_item(
    store: &Arc<dyn HistoryStore>,
    activities: &ActivityRegistry,
    item: WorkItem,
) -> Result<(), String> {
    let (instance, id, name, input) = match item {
        WorkItem::ActivityExecute {
            instance,
            id,
            name,
            input,
        } => (instance, id, name, input),
        other => {
            warn!(item = ?other, "unexpected item on worker queue, dropping");
            return Ok(());
        }
    };
    let completion = match activities.resolve(&name) {
        Some((_, handler)) => {
            let ctx = ActivityContext {
                instance: instance.clone(),
                activity_id: id,
            };
            match handler.invoke(ctx, input).await {
                Ok(result) => {
                    debug!(instance, id, activity = %name, "activity completed");
                    WorkItem::ActivityCompleted { instance, id, result }
                }
                Err(error) => {
                    warn!(instance, id, activity = %name, error = %error, "activity failed");
                    WorkItem::ActivityFailed { instance, id, error }
                }
            }
        }
        None => {
            warn!(instance, activity = %name, "activity not registered");
            WorkItem::ActivityFailed {
                instance,
                id,
                error: format!("unregistered activity: {name}"),
            }
        }
    };
    store.enqueue_work(QueueKind::Orchestrator, completion).await
}

async fn timer_dispatcher(
    store: Arc<dyn HistoryStore>,
    timer_tx: tokio::sync::mpsc::UnboundedSender<WorkItem>,
    shutdown: watch::Receiver<bool>,
    idle: Duration,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match store.dequeue_peek_lock(QueueKind::Timer).await {
            Some((item, token)) => {
                match &item {
                    WorkItem::TimerSchedule { .. } => {
                        if timer_tx.send(item.clone()).is_err() {
                            error!("timer service channel closed");
                        }
                    }
                    other => warn!(item = ?other, "unexpected item on timer queue, dropping"),
                }
                if let Err(e) = store.ack(QueueKind::Timer, &token).await {
                    error!(error = %e, "failed to ack timer item");
                }
            }
            None => tokio::time::sleep(idle).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryHistoryStore;

    async fn wait_for_terminal(store: &Arc<dyn HistoryStore>, instance: &str) -> OrchestrationStatus {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let status = status_from_history(&store.read(instance).await);
            if status.is_terminal() {
                return status;
            }
            assert!(std::time::Instant::now() < deadline, "instance never reached a terminal state");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn runs_an_activity_orchestration_to_completion() {
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
        let activities = ActivityRegistry::builder()
            .register("Echo", |_ctx: ActivityContext, input: String| async move { Ok(input) })
            .build();
        let orchestrations = OrchestrationRegistry::builder()
            .register("EchoFlow", |ctx: OrchestrationContext, input: String| async move {
                ctx.call_activity("Echo", input).await
            })
            .build();
        let rt = Runtime::start_with_store(store.clone(), activities, orchestrations);

        store.create_instance("i1").await.unwrap();
        store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: "i1".into(),
                    orchestration: "EchoFlow".into(),
                    input: "hi".into(),
                },
            )
            .await
            .unwrap();

        let status = wait_for_terminal(&store, "i1").await;
        assert_eq!(status, OrchestrationStatus::Completed { output: "hi".into() });
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn unregistered_orchestration_fails_the_instance() {
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
        let rt = Runtime::start_with_store(
            store.clone(),
            ActivityRegistry::builder().build(),
            OrchestrationRegistry::builder().build(),
        );

        store.create_instance("i1").await.unwrap();
        store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: "i1".into(),
                    orchestration: "Nope".into(),
                    input: String::new(),
                },
            )
            .await
            .unwrap();

        let status = wait_for_terminal(&store, "i1").await;
        assert_eq!(
            status,
            OrchestrationStatus::Failed {
                error: "unregistered orchestration: Nope".into()
            }
        );
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn unregistered_activity_surfaces_as_an_error() {
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
        let orchestrations = OrchestrationRegistry::builder()
            .register("Flow", |ctx: OrchestrationContext, _input: String| async move {
                ctx.call_activity("Missing", "x").await
            })
            .build();
        let rt = Runtime::start_with_store(store.clone(), ActivityRegistry::builder().build(), orchestrations);

        store.create_instance("i1").await.unwrap();
        store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: "i1".into(),
                    orchestration: "Flow".into(),
                    input: String::new(),
                },
            )
            .await
            .unwrap();

        let status = wait_for_terminal(&store, "i1").await;
        assert_eq!(
            status,
            OrchestrationStatus::Failed {
                error: "unregistered activity: Missing".into()
            }
        );
        rt.shutdown().await;
    }
}
