//! The three signal scenarios: a slow receiver, receiver thread placement, and
//! rollback of a receiver's writes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use ripple::{
    async_trait, BusConfig, Criteria, EventBus, Receiver, ReceiverContext, Signal, SignalKind,
    Store, Subscription,
};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::info;

use crate::config::Config;

#[derive(Debug, Serialize)]
struct NewUser<'a> {
    username: &'a str,
}

#[derive(Debug, Serialize)]
struct NewProfile<'a> {
    user: &'a str,
    bio: &'a str,
}

fn thread_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string()
}

fn store_for(config: &Config) -> Store {
    Store::with_bus(EventBus::with_config(
        BusConfig::new().with_failure_policy(config.failure_policy),
    ))
}

// =============================================================================
// Slow receiver
// =============================================================================

struct SlowReceiver {
    delay: Duration,
}

#[async_trait]
impl Receiver for SlowReceiver {
    async fn receive(&self, signal: &Signal, _ctx: &mut ReceiverContext<'_>) -> Result<()> {
        let username = signal.instance.get_str("username").unwrap_or_default();
        info!(%username, at = %Utc::now(), "signal triggered");
        tokio::time::sleep(self.delay).await;
        info!(at = %Utc::now(), "signal processed");
        Ok(())
    }
}

/// A synchronous receiver delays the write that triggered it.
pub async fn slow_receiver(config: &Config) -> Result<()> {
    let store = store_for(config);
    store.bus().subscribe_with(
        Subscription::to(SignalKind::PostSave)
            .from_sender("User")
            .named("slow_signal_receiver"),
        SlowReceiver {
            delay: config.slow_receiver_delay,
        },
    );

    info!(at = %Utc::now(), "user creation started");
    store
        .create_from("User", &NewUser { username: "testuser" })
        .await
        .context("creating user")?;
    info!(at = %Utc::now(), "user creation completed");
    Ok(())
}

// =============================================================================
// Worker placement
// =============================================================================

struct ReportThread {
    label: &'static str,
    done: Option<Arc<Notify>>,
}

#[async_trait]
impl Receiver for ReportThread {
    async fn receive(&self, _signal: &Signal, _ctx: &mut ReceiverContext<'_>) -> Result<()> {
        info!(receiver = self.label, thread = %thread_name(), "signal triggered");
        if let Some(done) = &self.done {
            done.notify_one();
        }
        Ok(())
    }
}

/// Synchronous receivers run on the writer's thread, detached ones on a worker.
pub async fn worker(config: &Config) -> Result<()> {
    let store = store_for(config);
    let done = Arc::new(Notify::new());

    store.bus().subscribe_with(
        Subscription::to(SignalKind::PostSave).named("inline"),
        ReportThread {
            label: "inline",
            done: None,
        },
    );
    store.bus().subscribe_with(
        Subscription::to(SignalKind::PostSave)
            .detached()
            .named("detached"),
        ReportThread {
            label: "detached",
            done: Some(done.clone()),
        },
    );

    info!(thread = %thread_name(), "user creation running");
    store
        .create_from("User", &NewUser { username: "testuser" })
        .await
        .context("creating user")?;

    tokio::time::timeout(Duration::from_secs(5), done.notified())
        .await
        .context("detached receiver did not run")?;
    Ok(())
}

// =============================================================================
// Rollback
// =============================================================================

struct CreateProfile;

#[async_trait]
impl Receiver for CreateProfile {
    async fn receive(&self, signal: &Signal, ctx: &mut ReceiverContext<'_>) -> Result<()> {
        if !signal.created {
            return Ok(());
        }
        let username = signal.instance.get_str("username").unwrap_or_default();
        info!(%username, "signal triggered for user");

        let unit = ctx
            .unit_of_work()
            .context("profile creation requires a unit of work")?;
        unit.create_from(
            "Profile",
            &NewProfile {
                user: username,
                bio: "",
            },
        )
        .await?;
        Ok(())
    }
}

/// A failing region undoes the profile its receiver created.
///
/// Returns whether the profile still exists afterwards.
pub async fn rollback(config: &Config) -> Result<bool> {
    let store = store_for(config);
    store.bus().subscribe_with(
        Subscription::to(SignalKind::PostSave)
            .from_sender("User")
            .named("create_profile"),
        CreateProfile,
    );

    let outcome: Result<()> = store
        .atomic(|uow| {
            async move {
                info!(uow = %uow.id(), "transaction started");
                uow.create_from("User", &NewUser { username: "testuser" })
                    .await?;
                info!(pending_writes = uow.pending_writes(), "user created");
                Err::<(), _>(anyhow::anyhow!("Forcing rollback!"))
            }
            .boxed()
        })
        .await;

    if let Err(e) = outcome {
        info!(reason = %e, "transaction rolled back");
    }

    let exists = store.exists(&Criteria::model("Profile").eq("user", "testuser"));
    info!(exists, "profile exists after rollback");
    Ok(exists)
}
