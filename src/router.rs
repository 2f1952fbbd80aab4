//! Router (C7): path selection with emergency-path caching and
//! vertex-disjoint candidate scoring, layered over [`Topology`]'s BFS.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::frame::PeerId;
use crate::topology::Topology;

const STALE_AFTER: Duration = Duration::from_secs(60);
const MAX_CANDIDATE_PATHS: usize = 3;
const HOP_PENALTY: f64 = 0.9;

#[derive(Debug, Clone, Copy)]
pub struct RouteMetrics {
    pub signal_strength_dbm: f64,
    pub packet_loss: f64,
    pub is_reachable: bool,
    pub last_heartbeat: Instant,
}

impl RouteMetrics {
    fn fresh() -> Self {
        Self {
            signal_strength_dbm: -60.0,
            packet_loss: 0.0,
            is_reachable: true,
            last_heartbeat: Instant::now(),
        }
    }

    fn is_stale(&self) -> bool {
        self.last_heartbeat.elapsed() > STALE_AFTER
    }

    /// Normalizes signal/loss/freshness into a single `[0,1]` score; 0 for
    /// stale or unreachable peers.
    pub fn route_score(&self) -> f64 {
        if self.is_stale() || !self.is_reachable {
            return 0.0;
        }
        let signal_norm = ((self.signal_strength_dbm + 100.0) / 100.0).clamp(0.0, 1.0);
        let loss_penalty = 1.0 - self.packet_loss.clamp(0.0, 1.0);
        (0.6 * signal_norm + 0.4 * loss_penalty).clamp(0.0, 1.0)
    }
}

struct CachedEmergencyPath {
    path: Vec<PeerId>,
}

pub struct Router {
    topology: std::sync::Arc<Topology>,
    failed: RwLock<HashSet<PeerId>>,
    metrics: RwLock<HashMap<PeerId, RouteMetrics>>,
    emergency_cache: RwLock<HashMap<PeerId, CachedEmergencyPath>>,
    cache_hits: AtomicU32,
    cache_misses: AtomicU32,
}

impl Router {
    pub fn new(topology: std::sync::Arc<Topology>) -> Self {
        Self {
            topology,
            failed: RwLock::new(HashSet::new()),
            metrics: RwLock::new(HashMap::new()),
            emergency_cache: RwLock::new(HashMap::new()),
            cache_hits: AtomicU32::new(0),
            cache_misses: AtomicU32::new(0),
        }
    }

    pub fn cache_hits(&self) -> u32 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u32 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn mark_failed(&self, peer: &PeerId) {
        self.failed.write().insert(peer.clone());
        self.invalidate_cache_containing(peer);
    }

    pub fn mark_recovered(&self, peer: &PeerId) {
        self.failed.write().remove(peer);
    }

    pub fn update_metrics(&self, peer: &PeerId, signal_strength_dbm: f64, packet_loss: f64) {
        let mut metrics = self.metrics.write();
        let entry = metrics.entry(peer.clone()).or_insert_with(RouteMetrics::fresh);
        entry.signal_strength_dbm = signal_strength_dbm;
        entry.packet_loss = packet_loss;
        entry.is_reachable = true;
        entry.last_heartbeat = Instant::now();

        if entry.route_score() <= 0.0 {
            self.invalidate_cache_containing(peer);
        }
    }

    fn invalidate_cache_containing(&self, peer: &PeerId) {
        self.emergency_cache.write().retain(|_, cached| !cached.path.contains(peer));
    }

    fn excluded_set(&self) -> HashSet<PeerId> {
        self.failed.read().clone()
    }

    fn route_score_for(&self, peer: &PeerId) -> f64 {
        self.metrics.read().get(peer).map_or(0.5, RouteMetrics::route_score)
    }

    fn path_reliability(&self, path: &[PeerId]) -> f64 {
        if path.len() < 2 {
            return 1.0;
        }
        let mut score = 1.0;
        for interior in &path[1..path.len() - 1] {
            let s = self.route_score_for(interior);
            if s <= 0.0 {
                return 0.0;
            }
            score *= s;
        }
        score
    }

    fn cached_emergency_path_valid(&self, dst: &PeerId) -> Option<Vec<PeerId>> {
        let cache = self.emergency_cache.read();
        let cached = cache.get(dst)?;
        let excluded = self.excluded_set();
        if cached.path.iter().any(|p| excluded.contains(p)) {
            return None;
        }
        if cached.path[1..cached.path.len().saturating_sub(1)]
            .iter()
            .any(|p| self.route_score_for(p) <= 0.0)
        {
            return None;
        }
        Some(cached.path.clone())
    }

    pub fn find_best_route(&self, src: &PeerId, dst: &PeerId, is_emergency: bool) -> Option<Vec<PeerId>> {
        if is_emergency {
            if let Some(path) = self.cached_emergency_path_valid(dst) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(dst = %dst, "router: emergency cache hit");
                return Some(path);
            }
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let excluded = self.excluded_set();
        let candidates = self.vertex_disjoint_candidates(src, dst, &excluded);
        if candidates.is_empty() {
            return None;
        }

        let best = if is_emergency {
            self.pick_best_emergency(&candidates)
        } else {
            self.pick_best_normal(&candidates)
        }?;

        if is_emergency {
            self.emergency_cache.write().insert(
                dst.clone(),
                CachedEmergencyPath { path: best.clone() },
            );
        }
        Some(best)
    }

    fn vertex_disjoint_candidates(&self, src: &PeerId, dst: &PeerId, excluded: &HashSet<PeerId>) -> Vec<Vec<PeerId>> {
        let mut candidates = Vec::new();
        let mut exclusion = excluded.clone();
        for _ in 0..MAX_CANDIDATE_PATHS {
            let Some(path) = self.topology.find_route(src, dst, &exclusion) else { break };
            for interior in &path[1..path.len().saturating_sub(1)] {
                exclusion.insert(interior.clone());
            }
            candidates.push(path);
        }
        candidates
    }

    fn pick_best_normal(&self, candidates: &[Vec<PeerId>]) -> Option<Vec<PeerId>> {
        candidates
            .iter()
            .map(|p| {
                let reliability = self.path_reliability(p);
                let hops = p.len().saturating_sub(2) as i32;
                let score = reliability * HOP_PENALTY.powi(hops.max(0));
                (score, p)
            })
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, p)| p.clone())
    }

    fn pick_best_emergency(&self, candidates: &[Vec<PeerId>]) -> Option<Vec<PeerId>> {
        let scored: Vec<(f64, usize, &Vec<PeerId>)> = candidates
            .iter()
            .map(|p| (self.path_reliability(p), p.len(), p))
            .collect();
        scored
            .into_iter()
            .reduce(|best, cand| {
                if (cand.0 - best.0).abs() <= 0.1 {
                    if cand.1 < best.1 { cand } else { best }
                } else if cand.0 > best.0 {
                    cand
                } else {
                    best
                }
            })
            .map(|(_, _, p)| p.clone())
    }
}
