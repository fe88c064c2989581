//! Node selection strategies.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use rand::Rng as _;

use crate::registry::Node;

/// Picks one node among the candidates of a transport.
pub trait Selector: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// `None` when `nodes` is empty.
    fn select<'a>(&self, service: &str, nodes: &'a [Node]) -> Option<&'a Node>;
}

/// Cycles through the nodes of every service independently.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select<'a>(&self, service: &str, nodes: &'a [Node]) -> Option<&'a Node> {
        if nodes.is_empty() {
            return None;
        }
        let idx = match self.cursors.get(service) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed),
            None => self
                .cursors
                .entry(service.to_owned())
                .or_default()
                .fetch_add(1, Ordering::Relaxed),
        };
        nodes.get(idx % nodes.len())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Random;

impl Selector for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select<'a>(&self, _service: &str, nodes: &'a [Node]) -> Option<&'a Node> {
        if nodes.is_empty() {
            return None;
        }
        nodes.get(rand::rng().random_range(0..nodes.len()))
    }
}

/// Looks a selector up by its configured name.
#[must_use]
pub fn by_name(name: &str) -> Option<std::sync::Arc<dyn Selector>> {
    match name {
        "round_robin" | "roundrobin" | "" => Some(std::sync::Arc::new(RoundRobin::new())),
        "random" => Some(std::sync::Arc::new(Random)),
        _ => None,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn nodes() -> Vec<Node> {
        (0..3)
            .map(|i| Node::new(format!("n{i}"), format!("h:{i}"), "grpc"))
            .collect()
    }

    #[test]
    fn test_round_robin_cycles_per_service() {
        let rr = RoundRobin::new();
        let nodes = nodes();
        let picked: Vec<_> = (0..4)
            .map(|_| rr.select("a", &nodes).unwrap().id.clone())
            .collect();
        assert_eq!(picked, ["n0", "n1", "n2", "n0"]);
        assert_eq!(rr.select("b", &nodes).unwrap().id, "n0");
    }

    #[test]
    fn test_empty_candidates() {
        assert!(RoundRobin::new().select("a", &[]).is_none());
        assert!(Random.select("a", &[]).is_none());
    }

    #[test]
    fn test_by_name() {
        assert_eq!(by_name("random").unwrap().name(), "random");
        assert!(by_name("nope").is_none());
    }
}
