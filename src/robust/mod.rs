//! Robust Layer (C9): wraps multi-peer sends with retry, a circuit
//! breaker, and pluggable edge-case handlers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::time::timeout as tokio_timeout;
use tracing::{info, warn};

use crate::channel::{ChannelPool, Priority};
use crate::codec;
use crate::error::{ChannelError, RobustError};
use crate::frame::{FrameType, MeshFrame, PeerId};
use crate::optimizer::ConnectionOptimizer;
use crate::security::SecurityProvider;
use crate::transport::Transport;

const CONTENTION_WINDOW: Duration = Duration::from_secs(30);
const CONTENTION_RATIO_THRESHOLD: f64 = 0.8;
const FAILURE_RATIO_THRESHOLD: f64 = 0.8;

const FAILURE_THRESHOLD: u32 = 5;
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);
const HALF_OPEN_SUCCESS_TARGET: u32 = 3;
const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_SECS: f64 = 0.5;
const MAX_BACKOFF_SECS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    transitions: u32,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            transitions: 0,
        }
    }

    /// Call before attempting work; returns true if the gate is open and
    /// the caller should fail fast.
    fn should_reject(&mut self) -> bool {
        if self.state == BreakerState::Open {
            if self.opened_at.is_some_and(|t| t.elapsed() >= RECOVERY_TIMEOUT) {
                self.state = BreakerState::HalfOpen;
                self.half_open_successes = 0;
                self.transitions += 1;
                info!("circuit breaker: entering half-open probe state");
                return false;
            }
            return true;
        }
        false
    }

    fn record_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= HALF_OPEN_SUCCESS_TARGET {
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                    self.transitions += 1;
                    info!("circuit breaker: closed after successful probes");
                }
            }
            BreakerState::Closed => {
                self.consecutive_failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
                self.transitions += 1;
                warn!("circuit breaker: re-opened after probe failure");
            }
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= FAILURE_THRESHOLD {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                    self.transitions += 1;
                    warn!("circuit breaker: opened after consecutive failures");
                }
            }
            BreakerState::Open => {}
        }
    }
}

/// Sliding window of recent send attempt outcomes, used to detect a
/// sustained failure burst rather than reacting to one bad send.
#[derive(Default)]
struct AttemptWindow {
    events: VecDeque<(Instant, bool)>,
}

impl AttemptWindow {
    fn record(&mut self, now: Instant, success: bool) {
        self.events.push_back((now, success));
        while let Some(&(t, _)) = self.events.front() {
            if now.duration_since(t) > CONTENTION_WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_ratio(&self) -> f64 {
        if self.events.is_empty() {
            return 0.0;
        }
        let failures = self.events.iter().filter(|(_, success)| !success).count();
        failures as f64 / self.events.len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeCase {
    SimultaneousConnection,
    RapidDisconnection,
    BackgroundTransition,
    ForegroundTransition,
    MemoryPressure,
    ChannelContention,
    ResourceExhaustion,
}

#[derive(Debug, Clone, Copy)]
pub enum HandlerAction {
    Retry { delay: Duration },
    Fallback,
    Isolate { duration: Duration },
    Restart,
    None,
}

pub trait EdgeCaseHandler: Send + Sync {
    fn edge_case(&self) -> EdgeCase;
    fn priority(&self) -> u8;
    fn handle(&self) -> HandlerAction;
}

pub struct ConcurrencyCapHandler {
    pub case: EdgeCase,
    pub priority: u8,
    pub cap: Arc<AtomicU32>,
}

impl EdgeCaseHandler for ConcurrencyCapHandler {
    fn edge_case(&self) -> EdgeCase {
        self.case
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn handle(&self) -> HandlerAction {
        match self.case {
            EdgeCase::BackgroundTransition => {
                let current = self.cap.load(Ordering::SeqCst).max(1);
                self.cap.store(current.div_ceil(3), Ordering::SeqCst);
                HandlerAction::None
            }
            EdgeCase::ChannelContention => HandlerAction::Retry {
                delay: jittered(0.1, 0.5),
            },
            EdgeCase::ResourceExhaustion => HandlerAction::None,
            _ => HandlerAction::None,
        }
    }
}

fn jittered(lo: f64, hi: f64) -> Duration {
    let jitter = rand::thread_rng().gen_range(lo..hi);
    Duration::from_secs_f64(jitter)
}

#[derive(Debug)]
pub enum SendOutcome {
    Success,
    PartialSuccess(std::collections::HashMap<PeerId, String>),
    Failure(FailureKind),
    Timeout,
    Cancelled,
}

#[derive(Debug)]
pub enum FailureKind {
    SystemUnavailable,
    AllPeersUnreachable,
}

pub struct RobustLayer {
    channels: Arc<ChannelPool>,
    security: Arc<dyn SecurityProvider>,
    transport: Arc<dyn Transport>,
    optimizer: Arc<ConnectionOptimizer>,
    breaker: Mutex<CircuitBreaker>,
    attempts: Mutex<AttemptWindow>,
    handlers: RwLock<Vec<Arc<dyn EdgeCaseHandler>>>,
    pub concurrency_cap: Arc<AtomicU32>,
}

impl RobustLayer {
    pub fn new(
        channels: Arc<ChannelPool>,
        security: Arc<dyn SecurityProvider>,
        transport: Arc<dyn Transport>,
        optimizer: Arc<ConnectionOptimizer>,
    ) -> Self {
        let concurrency_cap = Arc::new(AtomicU32::new(20));
        let layer = Self {
            channels,
            security,
            transport,
            optimizer,
            breaker: Mutex::new(CircuitBreaker::new()),
            attempts: Mutex::new(AttemptWindow::default()),
            handlers: RwLock::new(Vec::new()),
            concurrency_cap,
        };
        layer.register_handler(Arc::new(ConcurrencyCapHandler {
            case: EdgeCase::ChannelContention,
            priority: 50,
            cap: layer.concurrency_cap.clone(),
        }));
        layer.register_handler(Arc::new(ConcurrencyCapHandler {
            case: EdgeCase::ResourceExhaustion,
            priority: 40,
            cap: layer.concurrency_cap.clone(),
        }));
        layer
    }

    pub fn breaker_is_open(&self) -> bool {
        self.breaker.lock().state == BreakerState::Open
    }

    pub fn breaker_transition_count(&self) -> u32 {
        self.breaker.lock().transitions
    }

    pub fn register_handler(&self, handler: Arc<dyn EdgeCaseHandler>) {
        let mut handlers = self.handlers.write();
        handlers.push(handler);
        handlers.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    fn run_handlers(&self, detected: &[EdgeCase]) {
        let handlers = self.handlers.read();
        for case in detected {
            if let Some(handler) = handlers.iter().find(|h| h.edge_case() == *case) {
                let _ = handler.handle();
            }
        }
    }

    pub async fn robust_send(&self, frame: &MeshFrame, peers: &[PeerId], timeout: Duration) -> SendOutcome {
        if self.breaker.lock().should_reject() {
            return SendOutcome::Failure(FailureKind::SystemUnavailable);
        }

        self.run_handlers(&self.detect_edge_cases());

        let work = self.execute_fanout(frame, peers);
        match tokio_timeout(timeout, work).await {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::Timeout,
        }
    }

    fn detect_edge_cases(&self) -> Vec<EdgeCase> {
        let mut detected = Vec::new();
        if let Some((_, ratio)) = self.channels.contention_ratio() {
            if ratio >= CONTENTION_RATIO_THRESHOLD {
                detected.push(EdgeCase::ChannelContention);
            }
        }
        if self.attempts.lock().failure_ratio() >= FAILURE_RATIO_THRESHOLD {
            detected.push(EdgeCase::ResourceExhaustion);
        }
        detected
    }

    async fn execute_fanout(&self, frame: &MeshFrame, peers: &[PeerId]) -> SendOutcome {
        let mut handles = Vec::with_capacity(peers.len());
        for peer in peers {
            let peer = peer.clone();
            let frame = frame.clone();
            let channels = self.channels.clone();
            let security = self.security.clone();
            let transport = self.transport.clone();
            let optimizer = self.optimizer.clone();
            handles.push(tokio::spawn(async move {
                let result = send_with_retry(&channels, &security, &transport, &optimizer, &frame, &peer).await;
                (peer, result)
            }));
        }

        let mut errors = std::collections::HashMap::new();
        let mut success_count = 0usize;
        let now = Instant::now();
        for handle in handles {
            match handle.await {
                Ok((peer, Ok(()))) => {
                    success_count += 1;
                    self.attempts.lock().record(now, true);
                    let _ = peer;
                }
                Ok((peer, Err(e))) => {
                    self.attempts.lock().record(now, false);
                    errors.insert(peer, e.to_string());
                }
                Err(_) => {}
            }
        }

        if success_count == peers.len() {
            self.breaker.lock().record_success();
            SendOutcome::Success
        } else if success_count > 0 {
            self.breaker.lock().record_success();
            SendOutcome::PartialSuccess(errors)
        } else {
            self.breaker.lock().record_failure();
            SendOutcome::Failure(FailureKind::AllPeersUnreachable)
        }
    }
}

async fn send_with_retry(
    channels: &Arc<ChannelPool>,
    security: &Arc<dyn SecurityProvider>,
    transport: &Arc<dyn Transport>,
    optimizer: &Arc<ConnectionOptimizer>,
    frame: &MeshFrame,
    peer: &PeerId,
) -> Result<(), RobustError> {
    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match send_once(channels, security, transport, optimizer, frame, peer).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(RobustError::Channel(ChannelError::Unavailable(peer.clone()))))
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_SECS * 2f64.powi(attempt as i32 - 1);
    let jitter = rand::thread_rng().gen_range(0.0..(0.1 * BASE_BACKOFF_SECS));
    Duration::from_secs_f64((base + jitter).min(MAX_BACKOFF_SECS))
}

async fn send_once(
    channels: &Arc<ChannelPool>,
    security: &Arc<dyn SecurityProvider>,
    transport: &Arc<dyn Transport>,
    optimizer: &Arc<ConnectionOptimizer>,
    frame: &MeshFrame,
    peer: &PeerId,
) -> Result<(), RobustError> {
    let priority = if frame.frame_type.is_emergency() { Priority::Emergency } else { Priority::Normal };
    let handle = channels.acquire(peer, priority).await?;

    let encoded = codec::encode(frame).map_err(|_| ChannelError::Unavailable(peer.clone()))?;
    let to_send = if security.has_session_key(peer) {
        security.encrypt(&encoded, peer).unwrap_or(encoded)
    } else {
        encoded
    };
    let len = to_send.len();

    let started = Instant::now();
    let result = transport.send(to_send, std::slice::from_ref(peer)).await;
    let success = result.is_ok();
    channels.release(handle, success, len);
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    optimizer.record_send_result(peer, success, elapsed_ms, len);
    result.map_err(RobustError::from)
}
