//! Background access-token refresh.
//!
//! `RefreshMachine` is the pure state machine; `TokenRefreshScheduler` is the
//! actor task that owns one machine, its timer and the refresh calls. Callers
//! talk to the actor through a [`TokenRefreshHandle`]. Commands are
//! fire-and-forget with at-most-once delivery: if the actor is gone the
//! command is dropped with a warning.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{clamp_expires_in, AuthStore};
use crate::connectivity::ConnectivityMonitor;
use crate::remote::RemoteApi;

/// Refresh when this share of the token lifetime has elapsed.
pub const REFRESH_RATIO: f64 = 0.9;
pub const MIN_REFRESH_DELAY: Duration = Duration::from_secs(60);
pub const OFFLINE_RETRY_INTERVAL: Duration = Duration::from_secs(50);
/// Roughly 30 minutes of offline retries.
pub const MAX_OFFLINE_RETRIES: u32 = 36;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshPolicy {
    pub ratio: f64,
    pub min_delay: Duration,
    pub retry_interval: Duration,
    pub max_retries: u32,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            ratio: REFRESH_RATIO,
            min_delay: MIN_REFRESH_DELAY,
            retry_interval: OFFLINE_RETRY_INTERVAL,
            max_retries: MAX_OFFLINE_RETRIES,
        }
    }
}

impl RefreshPolicy {
    /// Delay before refreshing a token that expires in `expires_in`.
    pub fn refresh_delay(&self, expires_in: Duration) -> Duration {
        expires_in.mul_f64(self.ratio).max(self.min_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Idle,
    Scheduled { refresh_in: Duration },
    Firing,
    /// Offline failure; `attempt` retries have been scheduled so far.
    RetryWaiting { attempt: u32 },
    /// Session cleared. The user must sign in again.
    Cleared,
}

/// What the actor should do with its timer after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Arm(Duration),
    Disarm,
    FireNow,
    Keep,
}

#[derive(Debug)]
pub struct RefreshMachine {
    policy: RefreshPolicy,
    state: TokenState,
    retries: u32,
}

impl RefreshMachine {
    pub fn new(policy: RefreshPolicy) -> Self {
        Self {
            policy,
            state: TokenState::Idle,
            retries: 0,
        }
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// A token was issued that expires in `expires_in`.
    pub fn schedule(&mut self, expires_in: Duration) -> Timer {
        let refresh_in = self.policy.refresh_delay(expires_in);
        self.retries = 0;
        self.state = TokenState::Scheduled { refresh_in };
        Timer::Arm(refresh_in)
    }

    /// The token has already expired.
    pub fn due_now(&mut self) -> Timer {
        self.retries = 0;
        self.state = TokenState::Scheduled {
            refresh_in: Duration::ZERO,
        };
        Timer::FireNow
    }

    pub fn cancel(&mut self) -> Timer {
        self.retries = 0;
        self.state = TokenState::Idle;
        Timer::Disarm
    }

    /// Timer went off. Returns whether a refresh should be attempted.
    pub fn begin_fire(&mut self) -> bool {
        match self.state {
            TokenState::Scheduled { .. } | TokenState::RetryWaiting { .. } => {
                self.state = TokenState::Firing;
                true
            }
            _ => false,
        }
    }

    pub fn on_success(&mut self, expires_in: Duration) -> Timer {
        self.schedule(expires_in)
    }

    /// A refresh failed. Offline failures retry on a fixed interval until the
    /// budget is spent; anything else clears the session.
    pub fn on_failure(&mut self, offline: bool) -> Timer {
        if offline && self.retries < self.policy.max_retries {
            self.retries += 1;
            self.state = TokenState::RetryWaiting {
                attempt: self.retries,
            };
            return Timer::Arm(self.policy.retry_interval);
        }
        self.retries = 0;
        self.state = TokenState::Cleared;
        Timer::Disarm
    }

    /// Skip the fixed-interval wait when the network comes back.
    pub fn connectivity_restored(&mut self) -> Timer {
        match self.state {
            TokenState::RetryWaiting { .. } => Timer::FireNow,
            _ => Timer::Keep,
        }
    }
}

enum Command {
    Schedule { expires_in: u64 },
    Cancel,
    ConnectivityRestored,
}

/// Cheap handle to a running [`TokenRefreshScheduler`].
#[derive(Clone)]
pub struct TokenRefreshHandle {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TokenState>,
}

impl TokenRefreshHandle {
    /// A token was issued that expires in `expires_in` seconds.
    pub fn schedule(&self, expires_in: u64) {
        self.send(Command::Schedule { expires_in });
    }

    pub fn cancel(&self) {
        self.send(Command::Cancel);
    }

    pub fn connectivity_restored(&self) {
        self.send(Command::ConnectivityRestored);
    }

    pub fn state(&self) -> TokenState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TokenState> {
        self.state.clone()
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("Token refresh scheduler is not running, dropping command");
        }
    }
}

pub struct TokenRefreshScheduler {
    remote: Arc<dyn RemoteApi>,
    auth: Arc<AuthStore>,
    connectivity: Arc<ConnectivityMonitor>,
    machine: RefreshMachine,
    state_tx: watch::Sender<TokenState>,
    commands: mpsc::UnboundedReceiver<Command>,
    deadline: Option<Instant>,
}

impl TokenRefreshScheduler {
    /// Start the actor. It resumes from the persisted expiry, if any.
    pub fn spawn(
        remote: Arc<dyn RemoteApi>,
        auth: Arc<AuthStore>,
        connectivity: Arc<ConnectivityMonitor>,
        policy: RefreshPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> TokenRefreshHandle {
        let (tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(TokenState::Idle);
        let scheduler = Self {
            remote,
            auth,
            connectivity,
            machine: RefreshMachine::new(policy),
            state_tx,
            commands,
            deadline: None,
        };
        tokio::spawn(scheduler.run(shutdown));
        TokenRefreshHandle { tx, state }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let timer = self.resume().await;
        self.apply(timer);

        let mut commands_open = true;
        loop {
            let deadline = self.deadline;
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = timer => {
                    self.deadline = None;
                    let timer = self.fire().await;
                    self.apply(timer);
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => {
                        let timer = self.handle(command).await;
                        self.apply(timer);
                    }
                    None => commands_open = false,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Token refresh scheduler stopped");
    }

    async fn resume(&mut self) -> Timer {
        let expires_at = match self.auth.expires_at().await {
            Ok(Some(at)) => at,
            Ok(None) => return Timer::Keep,
            Err(e) => {
                warn!("Could not read token expiry: {}", e);
                return Timer::Keep;
            }
        };
        match (expires_at - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => {
                info!("Resuming token refresh, token expires at {}", expires_at);
                self.machine.schedule(remaining)
            }
            _ => {
                info!("Access token expired at {}, refreshing now", expires_at);
                self.machine.due_now()
            }
        }
    }

    async fn handle(&mut self, command: Command) -> Timer {
        match command {
            Command::Schedule { expires_in } => {
                if let Err(e) = self.auth.set_expires_in(expires_in).await {
                    warn!("Failed to persist token expiry: {}", e);
                }
                let timer = self
                    .machine
                    .schedule(Duration::from_secs(clamp_expires_in(expires_in)));
                if let TokenState::Scheduled { refresh_in } = self.machine.state() {
                    info!("Token refresh scheduled in {}s", refresh_in.as_secs());
                }
                timer
            }
            Command::Cancel => {
                info!("Token refresh cancelled");
                self.machine.cancel()
            }
            Command::ConnectivityRestored => {
                let timer = self.machine.connectivity_restored();
                if timer == Timer::FireNow {
                    info!("Connectivity restored, refreshing token now");
                }
                timer
            }
        }
    }

    async fn fire(&mut self) -> Timer {
        if !self.machine.begin_fire() {
            return Timer::Keep;
        }
        self.publish();

        let error = match self.remote.refresh_token().await {
            Ok(grant) => {
                if let Err(e) = self.auth.store_grant(&grant).await {
                    warn!("Failed to persist refreshed token: {}", e);
                }
                info!("Access token refreshed, expires in {}s", grant.expires_in);
                return self
                    .machine
                    .on_success(Duration::from_secs(clamp_expires_in(grant.expires_in)));
            }
            Err(e) => e,
        };

        let offline = !error.is_auth() && (error.is_connectivity() || !self.connectivity.is_online());
        let timer = self.machine.on_failure(offline);
        match self.machine.state() {
            TokenState::RetryWaiting { attempt } => {
                warn!(
                    "Token refresh failed while offline ({}), retry {} of {}",
                    error, attempt, self.machine.policy.max_retries
                );
            }
            _ => {
                warn!("Token refresh failed ({}), clearing session", error);
                if let Err(e) = self.auth.clear().await {
                    warn!("Failed to clear authentication state: {}", e);
                }
            }
        }
        timer
    }

    fn apply(&mut self, timer: Timer) {
        match timer {
            Timer::Arm(delay) => {
                self.deadline = Instant::now().checked_add(delay);
                if self.deadline.is_none() {
                    warn!("Refresh delay of {:?} is out of range, timer not armed", delay);
                }
            }
            Timer::Disarm => self.deadline = None,
            Timer::FireNow => self.deadline = Some(Instant::now()),
            Timer::Keep => {}
        }
        self.publish();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.machine.state());
    }
}
