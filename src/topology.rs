//! Topology (C6): the undirected adjacency graph of known peers, with a
//! BFS shortest-path search.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::RwLock;

use crate::frame::PeerId;

#[derive(Default)]
pub struct Topology {
    adjacency: RwLock<HashMap<PeerId, HashSet<PeerId>>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&self, a: &PeerId, b: &PeerId) {
        if a == b {
            return;
        }
        let mut graph = self.adjacency.write();
        graph.entry(a.clone()).or_default().insert(b.clone());
        graph.entry(b.clone()).or_default().insert(a.clone());
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        let mut graph = self.adjacency.write();
        if let Some(neighbors) = graph.remove(peer) {
            for neighbor in neighbors {
                if let Some(set) = graph.get_mut(&neighbor) {
                    set.remove(peer);
                }
            }
        }
    }

    pub fn neighbors(&self, peer: &PeerId) -> Vec<PeerId> {
        self.adjacency
            .read()
            .get(peer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Merges a remote adjacency snapshot (from a routing_update frame) into
    /// the local graph.
    pub fn merge_adjacency(&self, peer: &PeerId, neighbors: &[PeerId]) {
        for n in neighbors {
            self.add_edge(peer, n);
        }
    }

    /// Shortest path `[src, .., dst]` via BFS, excluding `excluded` vertices
    /// (interior only; src/dst are never excluded by the caller's
    /// contract). Returns `None` if unreachable.
    pub fn find_route(&self, src: &PeerId, dst: &PeerId, excluded: &HashSet<PeerId>) -> Option<Vec<PeerId>> {
        if src == dst {
            return Some(vec![src.clone()]);
        }
        let graph = self.adjacency.read();
        let mut visited: HashSet<PeerId> = HashSet::new();
        visited.insert(src.clone());
        let mut queue: VecDeque<PeerId> = VecDeque::new();
        queue.push_back(src.clone());
        let mut parent: HashMap<PeerId, PeerId> = HashMap::new();

        while let Some(current) = queue.pop_front() {
            let Some(neighbors) = graph.get(&current) else { continue };
            for neighbor in neighbors {
                if visited.contains(neighbor) {
                    continue;
                }
                if neighbor != dst && excluded.contains(neighbor) {
                    continue;
                }
                visited.insert(neighbor.clone());
                parent.insert(neighbor.clone(), current.clone());
                if neighbor == dst {
                    return Some(reconstruct(&parent, src, dst));
                }
                queue.push_back(neighbor.clone());
            }
        }
        None
    }

    pub fn peer_count(&self) -> usize {
        self.adjacency.read().len()
    }
}

fn reconstruct(parent: &HashMap<PeerId, PeerId>, src: &PeerId, dst: &PeerId) -> Vec<PeerId> {
    let mut path = vec![dst.clone()];
    let mut cur = dst.clone();
    while &cur != src {
        let prev = parent.get(&cur).expect("parent chain is complete for reachable node");
        path.push(prev.clone());
        cur = prev.clone();
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_shortest_path_in_a_diamond() {
        let topo = Topology::new();
        topo.add_edge(&"a".into(), &"b".into());
        topo.add_edge(&"a".into(), &"c".into());
        topo.add_edge(&"b".into(), &"d".into());
        topo.add_edge(&"c".into(), &"d".into());

        let excluded = HashSet::new();
        let path = topo.find_route(&"a".into(), &"d".into(), &excluded).unwrap();
        assert_eq!(path.first().unwrap(), "a");
        assert_eq!(path.last().unwrap(), "d");
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn routes_around_an_excluded_node() {
        let topo = Topology::new();
        topo.add_edge(&"a".into(), &"b".into());
        topo.add_edge(&"a".into(), &"c".into());
        topo.add_edge(&"b".into(), &"d".into());
        topo.add_edge(&"c".into(), &"d".into());

        let mut excluded = HashSet::new();
        excluded.insert("b".to_string());
        let path = topo.find_route(&"a".into(), &"d".into(), &excluded).unwrap();
        assert_eq!(path, vec!["a".to_string(), "c".to_string(), "d".to_string()]);
    }

    #[test]
    fn removing_a_peer_drops_incident_edges() {
        let topo = Topology::new();
        topo.add_edge(&"a".into(), &"b".into());
        topo.remove_peer(&"a".into());
        assert!(topo.neighbors(&"b".into()).is_empty());
    }

    #[test]
    fn unreachable_returns_none() {
        let topo = Topology::new();
        topo.add_edge(&"a".into(), &"b".into());
        let excluded = HashSet::new();
        assert!(topo.find_route(&"a".into(), &"z".into(), &excluded).is_none());
    }
}
