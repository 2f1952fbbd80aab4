//! State Coordinator (C10): composes per-layer readiness into a single
//! overall state with a stability timer.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

const STABILITY_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Reconnecting,
    Failed,
}

impl LayerState {
    fn is_active(self) -> bool {
        matches!(self, Self::Connected | Self::Ready)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerStates {
    pub physical: LayerState,
    pub mesh: LayerState,
    pub application: LayerState,
}

struct Inner {
    layers: LayerStates,
    overall: LayerState,
    last_change: Instant,
}

/// Composes `physical`/`mesh`/`application` into `overall` per a fixed
/// precedence order; `can_send` requires both readiness and stability.
pub struct StateCoordinator {
    inner: Mutex<Inner>,
}

impl StateCoordinator {
    pub fn new() -> Self {
        let layers = LayerStates {
            physical: LayerState::Disconnected,
            mesh: LayerState::Disconnected,
            application: LayerState::Disconnected,
        };
        Self {
            inner: Mutex::new(Inner {
                overall: compose(layers),
                layers,
                last_change: Instant::now(),
            }),
        }
    }

    pub fn set_physical(&self, state: LayerState) {
        self.update(|l| l.physical = state);
    }

    pub fn set_mesh(&self, state: LayerState) {
        self.update(|l| l.mesh = state);
    }

    pub fn set_application(&self, state: LayerState) {
        self.update(|l| l.application = state);
    }

    fn update(&self, f: impl FnOnce(&mut LayerStates)) {
        let mut inner = self.inner.lock();
        f(&mut inner.layers);
        let new_overall = compose(inner.layers);
        if new_overall != inner.overall {
            inner.overall = new_overall;
            inner.last_change = Instant::now();
        }
    }

    pub fn overall(&self) -> LayerState {
        self.inner.lock().overall
    }

    pub fn is_stable(&self) -> bool {
        self.inner.lock().last_change.elapsed() >= STABILITY_WINDOW
    }

    pub fn can_send(&self) -> bool {
        let inner = self.inner.lock();
        inner.overall == LayerState::Ready && inner.last_change.elapsed() >= STABILITY_WINDOW
    }
}

impl Default for StateCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn compose(layers: LayerStates) -> LayerState {
    let all = [layers.physical, layers.mesh, layers.application];
    if all.iter().any(|s| *s == LayerState::Failed) {
        return LayerState::Failed;
    }
    if all.iter().any(|s| *s == LayerState::Reconnecting) {
        return LayerState::Reconnecting;
    }
    if all.iter().any(|s| *s == LayerState::Connecting) {
        return LayerState::Connecting;
    }
    if all.iter().all(|s| *s == LayerState::Ready) {
        return LayerState::Ready;
    }
    if all.iter().all(|s| s.is_active()) {
        return LayerState::Connected;
    }
    LayerState::Disconnected
}
