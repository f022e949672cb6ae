//! Per-principal bus session
//!
//! Drives one principal's connection through
//! `Disconnected → Connecting → Subscribing → Seeding → Idle`, handles
//! inbound commands while idle, and falls back to `Disconnected` when the
//! transport goes away. Reconnection retries with exponential backoff and
//! always reseeds in full.

use crate::error::Result;
use crate::events::{MessageBus, QoS, Subscription};
use crate::store::models::Principal;
use crate::sync::commands::CommandProcessor;
use crate::sync::seeder::Seeder;
use crate::sync::topics::command_filters;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribing,
    Seeding,
    Idle,
    /// Terminal: the session was disconnected explicitly
    Closed,
}

/// Observable session status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Completed connect-and-seed cycles
    pub connections: u64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub qos: QoS,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            reconnect_min: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

pub struct Session {
    id: Uuid,
    principal: Principal,
    bus: Arc<dyn MessageBus>,
    seeder: Seeder,
    processor: CommandProcessor,
    config: SessionConfig,
    status: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        seeder: Seeder,
        processor: CommandProcessor,
        config: SessionConfig,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            state: SessionState::Disconnected,
            connections: 0,
        });
        Self {
            id: Uuid::new_v4(),
            principal: processor.principal().clone(),
            bus,
            seeder,
            processor,
            config,
            status,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the session in the background
    pub fn spawn(self) -> SessionHandle {
        let handle_status = self.status.subscribe();
        let cancel = self.cancel.clone();
        let id = self.id;
        let username = self.principal.username.clone();
        let task = tokio::spawn(self.run());

        SessionHandle {
            id,
            username,
            status: handle_status,
            cancel,
            task: Some(task),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.status.send_modify(|status| status.state = state);
        debug!(session = %self.id, username = %self.principal.username, ?state, "Session state");
    }

    async fn run(self) {
        let mut backoff = self.config.reconnect_min;
        info!(session = %self.id, username = %self.principal.username, "Session started");

        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = self.establish() => attempt,
            };

            match attempt {
                Ok(subscription) => {
                    backoff = self.config.reconnect_min;
                    self.status.send_modify(|status| {
                        status.state = SessionState::Idle;
                        status.connections += 1;
                    });
                    info!(session = %self.id, username = %self.principal.username, "Session synchronized");

                    self.serve(subscription).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    warn!(session = %self.id, username = %self.principal.username, "Transport lost");
                }
                Err(e) => {
                    warn!(
                        session = %self.id,
                        username = %self.principal.username,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Session connect failed: {}",
                        e
                    );
                }
            }

            self.set_state(SessionState::Disconnected);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.reconnect_max);
        }

        self.set_state(SessionState::Closed);
        info!(session = %self.id, username = %self.principal.username, "Session closed");
    }

    /// Connect, subscribe to the principal's command topics, then seed
    async fn establish(&self) -> Result<Subscription> {
        self.set_state(SessionState::Connecting);
        self.bus.connect().await?;

        self.set_state(SessionState::Subscribing);
        let subscription = self
            .bus
            .subscribe(&command_filters(&self.principal.username))
            .await?;

        self.set_state(SessionState::Seeding);
        self.seeder.seed(&self.principal).await?;
        Ok(subscription)
    }

    /// Handle commands until the subscription ends or the session is cancelled
    async fn serve(&self, mut subscription: Subscription) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return,
                message = subscription.next() => match message {
                    Some(message) => message,
                    None => return,
                },
            };
            self.processor.handle(&message);
        }
    }
}

/// Handle to a running session. Dropping it cancels the session.
pub struct SessionHandle {
    id: Uuid,
    username: String,
    status: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }

    /// Wait until the session reaches `state`; false if the session ended first
    pub async fn wait_for_state(&mut self, state: SessionState) -> bool {
        self.status.wait_for(|s| s.state == state).await.is_ok()
    }

    /// Wait until the session is idle after at least `connections` completed
    /// connect-and-seed cycles
    pub async fn wait_synchronized(&mut self, connections: u64) -> bool {
        self.status
            .wait_for(|s| s.state == SessionState::Idle && s.connections >= connections)
            .await
            .is_ok()
    }

    /// Cancel the session and wait for its background task to finish
    pub async fn disconnect(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(session = %self.id, "Session task failed: {}", e);
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
