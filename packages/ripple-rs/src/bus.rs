//! Ordered signal bus with synchronous and detached receivers.
//!
//! # Guarantees
//!
//! - **Registration order**: receivers run in the order they subscribed
//! - **Synchronous by default**: `publish` returns after every synchronous
//!   receiver finished, so a slow receiver delays the writer
//! - **No implicit timeout**: wrap the write in `tokio::time::timeout` if
//!   bounded latency is needed
//! - **Detached receivers** are spawned and never awaited; their failures are
//!   logged, never propagated. Published inside a unit of work, they are
//!   spawned when it commits and dropped when it rolls back
//!
//! # Failure Policy
//!
//! With [`FailurePolicy::Propagate`] (the default) dispatch stops at the first
//! failing receiver and the error reaches the writer, which rolls back its
//! unit of work. With [`FailurePolicy::Isolate`] failures are logged, the
//! failed receiver's own writes are undone, and the remaining receivers still
//! run.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::core::{ExecutionMode, Signal, SignalKind};
use crate::error::{panic_message, SignalError};
use crate::receiver::{Receiver, ReceiverContext};
use crate::store::Store;

/// What the bus does when a synchronous receiver fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop dispatching and return the error to the publisher.
    #[default]
    Propagate,
    /// Undo the failed receiver's writes, log the error and keep dispatching.
    Isolate,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "propagate" => Ok(FailurePolicy::Propagate),
            "isolate" => Ok(FailurePolicy::Isolate),
            other => Err(format!(
                "unknown failure policy '{other}', expected 'propagate' or 'isolate'"
            )),
        }
    }
}

/// Bus configuration.
#[derive(Debug, Clone, Default)]
pub struct BusConfig {
    /// Policy for synchronous receiver failures.
    pub failure_policy: FailurePolicy,
}

impl BusConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Describes which signals a receiver gets and how it runs.
///
/// # Example
///
/// ```ignore
/// let id = bus.subscribe_with(
///     Subscription::to(SignalKind::PostSave)
///         .from_sender("User")
///         .detached()
///         .named("welcome_email"),
///     SendWelcomeEmail,
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Subscription {
    kind: SignalKind,
    sender: Option<String>,
    mode: ExecutionMode,
    name: Option<String>,
}

impl Subscription {
    /// Subscribe to a signal kind from any sender.
    pub fn to(kind: SignalKind) -> Self {
        Self {
            kind,
            sender: None,
            mode: ExecutionMode::Synchronous,
            name: None,
        }
    }

    /// Only receive signals about entities of this model.
    pub fn from_sender(mut self, model: impl Into<String>) -> Self {
        self.sender = Some(model.into());
        self
    }

    /// Set the execution mode.
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Run the receiver on a separate task.
    pub fn detached(self) -> Self {
        self.mode(ExecutionMode::Detached)
    }

    /// Name used in logs and errors. Defaults to the receiver's type name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn matches(&self, signal: &Signal) -> bool {
        self.kind == signal.kind
            && self
                .sender
                .as_deref()
                .map_or(true, |sender| sender == signal.sender)
    }
}

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    name: String,
    subscription: Subscription,
    receiver: Arc<dyn Receiver>,
}

struct BusInner {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    config: BusConfig,
}

/// Registry of receivers keyed by signal kind.
///
/// The bus is owned by the application context (usually the [`Store`]).
/// Clones share the same registry, so a bus can be handed to setup code while
/// the store keeps publishing on it.
///
/// # Example
///
/// ```ignore
/// let bus = EventBus::new();
/// bus.subscribe(SignalKind::PostSave, CreateProfile);
///
/// let store = Store::with_bus(bus);
/// store.create("User", json!({ "username": "testuser" })).await?;
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the default configuration.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with the given configuration.
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registrations: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    /// The bus configuration.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Register a synchronous receiver for every signal of `kind`.
    ///
    /// Multiple receivers per kind are allowed, including the same one twice.
    pub fn subscribe<R: Receiver>(&self, kind: SignalKind, receiver: R) -> SubscriptionId {
        self.subscribe_with(Subscription::to(kind), receiver)
    }

    /// Register a receiver with a full subscription description.
    pub fn subscribe_with<R: Receiver>(
        &self,
        subscription: Subscription,
        receiver: R,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let name = subscription
            .name
            .clone()
            .unwrap_or_else(|| std::any::type_name::<R>().to_string());

        debug!(
            subscription = id.0,
            receiver = %name,
            kind = %subscription.kind,
            mode = ?subscription.mode,
            "receiver subscribed"
        );

        self.inner
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                name,
                subscription,
                receiver: Arc::new(receiver),
            });
        id
    }

    /// Remove a receiver. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registrations = self
            .inner
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// Returns the number of registered receivers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Snapshot of the receivers matching a signal, in registration order.
    ///
    /// Taken before dispatch so receivers may subscribe or unsubscribe while
    /// running; changes apply to the next publish.
    fn matching(&self, signal: &Signal) -> Vec<Registration> {
        self.inner
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.subscription.matches(signal))
            .cloned()
            .collect()
    }

    /// Dispatch a signal to every matching receiver.
    ///
    /// Synchronous receivers run one after another in registration order and
    /// share `ctx`, so their writes join its unit of work. Detached receivers
    /// get their own autocommit context and are spawned once that unit
    /// commits, or right away when `ctx` has no unit.
    pub fn publish<'a, 'c: 'a>(
        &'a self,
        signal: &'a Signal,
        ctx: &'a mut ReceiverContext<'c>,
    ) -> BoxFuture<'a, Result<(), SignalError>> {
        async move {
            let registrations = self.matching(signal);
            debug!(
                kind = %signal.kind,
                sender = %signal.sender,
                receivers = registrations.len(),
                "publishing signal"
            );

            for registration in registrations {
                match registration.subscription.mode {
                    ExecutionMode::Detached => {
                        let launch = detached(&registration, signal, ctx.store())?;
                        match ctx.unit_of_work() {
                            Some(unit) => {
                                debug!(
                                    uow = %unit.id(),
                                    receiver = %registration.name,
                                    "detached receiver deferred until commit"
                                );
                                unit.on_commit(launch);
                            }
                            None => launch(),
                        }
                    }
                    ExecutionMode::Synchronous => {
                        let savepoint = ctx.unit_of_work().map(|unit| unit.savepoint());
                        let Err(err) = run_inline(&registration, signal, ctx).await else {
                            continue;
                        };
                        match self.inner.config.failure_policy {
                            FailurePolicy::Propagate => {
                                warn!(
                                    receiver = %registration.name,
                                    kind = %signal.kind,
                                    error = %err,
                                    "receiver failed, aborting dispatch"
                                );
                                return Err(err);
                            }
                            FailurePolicy::Isolate => {
                                warn!(
                                    receiver = %registration.name,
                                    kind = %signal.kind,
                                    error = %err,
                                    "receiver failed, continuing dispatch"
                                );
                                // Drop whatever the failed receiver wrote.
                                if let (Some(savepoint), Some(unit)) =
                                    (savepoint, ctx.unit_of_work())
                                {
                                    unit.rollback_to(savepoint)?;
                                }
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }
}

async fn run_inline(
    registration: &Registration,
    signal: &Signal,
    ctx: &mut ReceiverContext<'_>,
) -> Result<(), SignalError> {
    // A panicking receiver fails the dispatch like an error would.
    let outcome = AssertUnwindSafe(registration.receiver.receive(signal, ctx))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(SignalError::ReceiverFailed {
            receiver: registration.name.clone(),
            kind: signal.kind,
            source,
        }),
        Err(payload) => {
            let message = panic_message(&payload);
            error!(receiver = %registration.name, panic = %message, "receiver panicked");
            Err(SignalError::ReceiverPanicked {
                receiver: registration.name.clone(),
                kind: signal.kind,
                message,
            })
        }
    }
}

/// Prepare a detached run of `registration`.
///
/// The returned closure spawns the receiver on the runtime that was current
/// when the signal was published. Inside a unit of work it is registered as a
/// commit hook, so the receiver only ever sees committed entities.
fn detached(
    registration: &Registration,
    signal: &Signal,
    store: &Store,
) -> Result<impl FnOnce() + Send + 'static, SignalError> {
    let runtime =
        tokio::runtime::Handle::try_current().map_err(|_| SignalError::NoRuntime {
            receiver: registration.name.clone(),
        })?;

    let receiver = Arc::clone(&registration.receiver);
    let name = registration.name.clone();
    let signal = signal.clone();
    let store = store.clone();

    Ok(move || {
        runtime.spawn(async move {
            let mut ctx = ReceiverContext::new(store);
            let outcome = AssertUnwindSafe(receiver.receive(&signal, &mut ctx))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {
                    debug!(receiver = %name, kind = %signal.kind, "detached receiver finished")
                }
                Ok(Err(e)) => warn!(
                    receiver = %name,
                    kind = %signal.kind,
                    error = %e,
                    "detached receiver failed"
                ),
                Err(payload) => error!(
                    receiver = %name,
                    kind = %signal.kind,
                    panic = %panic_message(&payload),
                    "detached receiver panicked"
                ),
            }
        });
    })
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("failure_policy", &self.inner.config.failure_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Entity;
    use crate::receiver::receiver_fn;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn user_signal(kind: SignalKind) -> Signal {
        let mut fields = serde_json::Map::new();
        fields.insert("username".into(), "testuser".into());
        Signal::new(kind, Entity::new("User".into(), fields))
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> impl Receiver {
        let log = log.clone();
        receiver_fn(move |_| {
            log.lock().unwrap().push(label);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_receivers_fire_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(SignalKind::PostSave, recorder(&log, "a"));
        bus.subscribe(SignalKind::PostSave, recorder(&log, "b"));
        bus.subscribe(SignalKind::PostSave, recorder(&log, "c"));

        let mut ctx = ReceiverContext::new(Store::new());
        bus.publish(&user_signal(SignalKind::PostSave), &mut ctx)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_only_matching_kind_and_sender_receive() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(SignalKind::PreSave, recorder(&log, "pre"));
        bus.subscribe_with(
            Subscription::to(SignalKind::PostSave).from_sender("Profile"),
            recorder(&log, "profile_only"),
        );
        bus.subscribe_with(
            Subscription::to(SignalKind::PostSave).from_sender("User"),
            recorder(&log, "user_only"),
        );

        let mut ctx = ReceiverContext::new(Store::new());
        bus.publish(&user_signal(SignalKind::PostSave), &mut ctx)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["user_only"]);
    }

    #[tokio::test]
    async fn test_duplicate_subscriptions_both_fire() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let count = count.clone();
            bus.subscribe(
                SignalKind::PostSave,
                receiver_fn(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        let mut ctx = ReceiverContext::new(Store::new());
        bus.publish(&user_signal(SignalKind::PostSave), &mut ctx)
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_propagate_stops_at_first_failure() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(SignalKind::PostSave, recorder(&log, "first"));
        bus.subscribe_with(
            Subscription::to(SignalKind::PostSave).named("failing"),
            receiver_fn(|_| Err(anyhow::anyhow!("nope"))),
        );
        bus.subscribe(SignalKind::PostSave, recorder(&log, "never"));

        let mut ctx = ReceiverContext::new(Store::new());
        let err = bus
            .publish(&user_signal(SignalKind::PostSave), &mut ctx)
            .await
            .unwrap_err();

        match err {
            SignalError::ReceiverFailed { receiver, kind, .. } => {
                assert_eq!(receiver, "failing");
                assert_eq!(kind, SignalKind::PostSave);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_isolate_continues_after_failure() {
        let bus = EventBus::with_config(
            BusConfig::new().with_failure_policy(FailurePolicy::Isolate),
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(SignalKind::PostSave, receiver_fn(|_| Err(anyhow::anyhow!("nope"))));
        bus.subscribe(SignalKind::PostSave, recorder(&log, "after"));

        let mut ctx = ReceiverContext::new(Store::new());
        bus.publish(&user_signal(SignalKind::PostSave), &mut ctx)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_panicking_receiver_becomes_error() {
        let bus = EventBus::new();
        bus.subscribe_with(
            Subscription::to(SignalKind::PostSave).named("panicky"),
            receiver_fn(|_| panic!("receiver blew up")),
        );

        let mut ctx = ReceiverContext::new(Store::new());
        let err = bus
            .publish(&user_signal(SignalKind::PostSave), &mut ctx)
            .await
            .unwrap_err();

        match err {
            SignalError::ReceiverPanicked { receiver, message, .. } => {
                assert_eq!(receiver, "panicky");
                assert!(message.contains("receiver blew up"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_receiver() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe(SignalKind::PostSave, recorder(&log, "gone"));
        bus.subscribe(SignalKind::PostSave, recorder(&log, "kept"));
        assert_eq!(bus.subscriber_count(), 2);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 1);

        let mut ctx = ReceiverContext::new(Store::new());
        bus.publish(&user_signal(SignalKind::PostSave), &mut ctx)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_detached_does_not_block_publisher() {
        let bus = EventBus::new();
        let done = Arc::new(Notify::new());
        let finished = Arc::new(AtomicUsize::new(0));

        struct SlowDetached {
            done: Arc<Notify>,
            finished: Arc<AtomicUsize>,
        }

        #[async_trait::async_trait]
        impl Receiver for SlowDetached {
            async fn receive(
                &self,
                _signal: &Signal,
                _ctx: &mut ReceiverContext<'_>,
            ) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                self.finished.fetch_add(1, Ordering::SeqCst);
                self.done.notify_one();
                Ok(())
            }
        }

        bus.subscribe_with(
            Subscription::to(SignalKind::PostSave).detached(),
            SlowDetached {
                done: done.clone(),
                finished: finished.clone(),
            },
        );

        let mut ctx = ReceiverContext::new(Store::new());
        bus.publish(&user_signal(SignalKind::PostSave), &mut ctx)
            .await
            .unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detached_failure_is_not_propagated() {
        let bus = EventBus::new();
        bus.subscribe_with(
            Subscription::to(SignalKind::PostSave).detached(),
            receiver_fn(|_| Err(anyhow::anyhow!("ignored"))),
        );

        let mut ctx = ReceiverContext::new(Store::new());
        assert!(bus
            .publish(&user_signal(SignalKind::PostSave), &mut ctx)
            .await
            .is_ok());
    }

    struct CountDetached {
        runs: Arc<AtomicUsize>,
        done: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl Receiver for CountDetached {
        async fn receive(
            &self,
            _signal: &Signal,
            _ctx: &mut ReceiverContext<'_>,
        ) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.done.notify_one();
            Ok(())
        }
    }

    fn counting_store() -> (Store, Arc<AtomicUsize>, Arc<Notify>) {
        let store = Store::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());
        store.bus().subscribe_with(
            Subscription::to(SignalKind::PostSave).detached(),
            CountDetached {
                runs: runs.clone(),
                done: done.clone(),
            },
        );
        (store, runs, done)
    }

    #[tokio::test]
    async fn test_detached_waits_for_commit() {
        let (store, runs, done) = counting_store();

        let mut uow = store.begin();
        uow.create("User", serde_json::json!({ "username": "a" }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        uow.commit();
        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detached_is_dropped_on_rollback() {
        let (store, runs, _done) = counting_store();

        let mut uow = store.begin();
        uow.create("User", serde_json::json!({ "username": "a" }))
            .await
            .unwrap();
        uow.rollback("abort").unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_isolate_undoes_writes_of_failed_receiver() {
        struct HalfDone;

        #[async_trait::async_trait]
        impl Receiver for HalfDone {
            async fn receive(
                &self,
                _signal: &Signal,
                ctx: &mut ReceiverContext<'_>,
            ) -> anyhow::Result<()> {
                ctx.create("Audit", serde_json::json!({ "step": 1 }))
                    .await?;
                anyhow::bail!("step 2 failed")
            }
        }

        let bus = EventBus::with_config(
            BusConfig::new().with_failure_policy(FailurePolicy::Isolate),
        );
        bus.subscribe_with(
            Subscription::to(SignalKind::PostSave).from_sender("User"),
            HalfDone,
        );
        bus.subscribe_with(
            Subscription::to(SignalKind::PostSave).from_sender("User"),
            receiver_fn(|_| Ok(())),
        );
        let store = Store::with_bus(bus);

        let mut uow = store.begin();
        uow.create("User", serde_json::json!({ "username": "a" }))
            .await
            .unwrap();
        assert_eq!(uow.pending_writes(), 1);
        assert_eq!(store.count("Audit"), 0);
        uow.commit();

        assert_eq!(store.count("User"), 1);
        assert_eq!(store.count("Audit"), 0);
    }

    #[test]
    fn test_detached_outside_runtime_is_an_error() {
        let bus = EventBus::new();
        bus.subscribe_with(
            Subscription::to(SignalKind::PostSave).detached().named("orphan"),
            receiver_fn(|_| Ok(())),
        );

        let mut ctx = ReceiverContext::new(Store::new());
        let signal = user_signal(SignalKind::PostSave);
        let err = futures::executor::block_on(bus.publish(&signal, &mut ctx)).unwrap_err();
        assert!(matches!(err, SignalError::NoRuntime { receiver } if receiver == "orphan"));
    }

    #[test]
    fn test_failure_policy_from_str() {
        assert_eq!("propagate".parse::<FailurePolicy>(), Ok(FailurePolicy::Propagate));
        assert_eq!("ISOLATE".parse::<FailurePolicy>(), Ok(FailurePolicy::Isolate));
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn test_debug_impl() {
        let bus = EventBus::new();
        bus.subscribe(SignalKind::PostSave, receiver_fn(|_| Ok(())));
        let debug_str = format!("{:?}", bus);
        assert!(debug_str.contains("EventBus"));
        assert!(debug_str.contains("subscriber_count: 1"));
    }
}
