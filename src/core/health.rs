use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Health of a single server as seen by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Alive,
    /// Failing, still routable
    Suspected,
    /// Excluded from routing until the cooldown elapses and a probe succeeds
    Dead,
}

/// How an attempt against a server failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network error or timeout on an established exchange
    Transient,
    /// The pool could not open any connection
    Unavailable,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// Consecutive failures that turn Alive into Suspected
    pub failure_threshold: u32,
    /// How long a dead server is skipped before a probe is let through
    pub dead_timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            dead_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct ServerHealth {
    state: HealthState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    dead_since: Option<Instant>,
    probe_started: Option<Instant>,
}

impl ServerHealth {
    fn new() -> Self {
        Self {
            state: HealthState::Alive,
            consecutive_failures: 0,
            last_failure: None,
            dead_since: None,
            probe_started: None,
        }
    }
}

/// Point-in-time view of one server's health
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub address: String,
    pub state: HealthState,
    pub alive: bool,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
}

/// Per-server health state machine shared by the selector and the client.
///
/// Alive -> (threshold consecutive failures) -> Suspected -> (one more
/// failure, or the pool cannot connect) -> Dead -> (cooldown, successful
/// probe) -> Alive. Any success returns a server to Alive.
#[derive(Debug)]
pub struct HealthRegistry {
    policy: HealthPolicy,
    servers: RwLock<HashMap<String, Mutex<ServerHealth>>>,
}

impl HealthRegistry {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn register(&self, address: &str) {
        self.servers
            .write()
            .entry(address.to_string())
            .or_insert_with(|| Mutex::new(ServerHealth::new()));
    }

    pub fn unregister(&self, address: &str) {
        self.servers.write().remove(address);
    }

    /// Whether requests may be routed to `address` right now.
    ///
    /// A dead server whose cooldown has elapsed is admitted for exactly one
    /// probe at a time; the outcome of that request decides whether it comes
    /// back. A probe that never reports back is abandoned after another
    /// cooldown period.
    pub fn is_available(&self, address: &str) -> bool {
        self.is_available_at(address, Instant::now())
    }

    fn is_available_at(&self, address: &str, now: Instant) -> bool {
        let servers = self.servers.read();
        let Some(health) = servers.get(address) else {
            return false;
        };
        let mut health = health.lock();
        match health.state {
            HealthState::Alive | HealthState::Suspected => true,
            HealthState::Dead => {
                let cooled_down = health
                    .dead_since
                    .map_or(true, |since| now.duration_since(since) >= self.policy.dead_timeout);
                if !cooled_down {
                    return false;
                }
                let probe_pending = health.probe_started.is_some_and(|started| {
                    now.duration_since(started) < self.policy.dead_timeout
                });
                if probe_pending {
                    return false;
                }
                info!("Probing dead server {}", address);
                health.probe_started = Some(now);
                true
            }
        }
    }

    pub fn record_success(&self, address: &str) {
        let servers = self.servers.read();
        let Some(health) = servers.get(address) else {
            return;
        };
        let mut health = health.lock();
        if health.state != HealthState::Alive {
            info!("Server {} is alive again (was {:?})", address, health.state);
        }
        health.state = HealthState::Alive;
        health.consecutive_failures = 0;
        health.dead_since = None;
        health.probe_started = None;
    }

    pub fn record_failure(&self, address: &str, kind: FailureKind) {
        self.record_failure_at(address, kind, Instant::now())
    }

    fn record_failure_at(&self, address: &str, kind: FailureKind, now: Instant) {
        let servers = self.servers.read();
        let Some(health) = servers.get(address) else {
            return;
        };
        let mut health = health.lock();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_failure = Some(now);
        health.probe_started = None;

        let next = match (health.state, kind) {
            (_, FailureKind::Unavailable) => HealthState::Dead,
            (HealthState::Alive, FailureKind::Transient) => {
                if health.consecutive_failures >= self.policy.failure_threshold {
                    HealthState::Suspected
                } else {
                    HealthState::Alive
                }
            }
            (HealthState::Suspected, FailureKind::Transient) => HealthState::Dead,
            (HealthState::Dead, FailureKind::Transient) => HealthState::Dead,
        };

        if next == HealthState::Dead {
            // Every failure while dead (including a failed probe) restarts the cooldown
            health.dead_since = Some(now);
        }
        if next != health.state {
            warn!(
                "Server {} is now {:?} after {} consecutive failure(s)",
                address, next, health.consecutive_failures
            );
            health.state = next;
        }
    }

    pub fn state(&self, address: &str) -> Option<HealthState> {
        self.servers
            .read()
            .get(address)
            .map(|health| health.lock().state)
    }

    pub fn snapshot(&self) -> Vec<ServerStatus> {
        let servers = self.servers.read();
        let mut statuses: Vec<ServerStatus> = servers
            .iter()
            .map(|(address, health)| {
                let health = health.lock();
                ServerStatus {
                    address: address.clone(),
                    state: health.state,
                    alive: health.state != HealthState::Dead,
                    consecutive_failures: health.consecutive_failures,
                    last_failure: health.last_failure,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.address.cmp(&b.address));
        statuses
    }
}
