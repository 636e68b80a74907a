//! Smooth weighted round-robin.

use std::sync::{Mutex, PoisonError};

use crate::error::{ProxyError, ProxyResult};

#[derive(Debug)]
struct Node<T> {
    weight: i64,
    current: i64,
    value: T,
}

/// Weighted round-robin selector over values of type `T`.
#[derive(Debug)]
pub struct WeightedSelector<T> {
    nodes: Mutex<Vec<Node<T>>>,
}

impl<T> Default for WeightedSelector<T> {
    fn default() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> WeightedSelector<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a candidate. Weights must be positive.
    pub fn add_node(&self, weight: i64, value: T) -> ProxyResult<()> {
        if weight <= 0 {
            return Err(ProxyError::InvalidWeight(weight));
        }
        self.lock().push(Node {
            weight,
            current: 0,
            value,
        });
        Ok(())
    }

    /// Drop every candidate matching `pred`. Returns how many were removed.
    pub fn remove_where(&self, pred: impl Fn(&T) -> bool) -> usize {
        let mut nodes = self.lock();
        let before = nodes.len();
        nodes.retain(|n| !pred(&n.value));
        if nodes.len() != before {
            // Restart the cycle so the remaining nodes stay fair.
            nodes.iter_mut().for_each(|n| n.current = 0);
        }
        before - nodes.len()
    }

    /// Pick the next candidate.
    pub fn next(&self) -> ProxyResult<T> {
        let mut nodes = self.lock();
        let total: i64 = nodes.iter().map(|n| n.weight).sum();

        let mut best: Option<(usize, i64)> = None;
        for (i, node) in nodes.iter_mut().enumerate() {
            node.current += node.weight;
            if best.map_or(true, |(_, current)| node.current > current) {
                best = Some((i, node.current));
            }
        }

        let (idx, _) = best.ok_or(ProxyError::EmptySelector)?;
        let winner = &mut nodes[idx];
        winner.current -= total;
        Ok(winner.value.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Node<T>>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_weighted_order() {
        let wrr = WeightedSelector::new();
        wrr.add_node(1, "A").unwrap();
        wrr.add_node(2, "B").unwrap();

        let picks: Vec<_> = (0..3).map(|_| wrr.next().unwrap()).collect();
        assert_eq!(picks, vec!["B", "A", "B"]);
    }

    #[test]
    fn test_fairness_over_full_cycles() {
        let wrr = WeightedSelector::new();
        let weights = [("a", 5), ("b", 1), ("c", 3), ("d", 3)];
        for (name, w) in weights {
            wrr.add_node(w, name).unwrap();
        }

        let k = 7;
        let total: i64 = weights.iter().map(|(_, w)| w).sum();
        let mut counts: HashMap<&str, i64> = HashMap::new();
        for _ in 0..(k * total) {
            *counts.entry(wrr.next().unwrap()).or_default() += 1;
        }
        for (name, w) in weights {
            assert_eq!(counts[name], k * w, "node {name}");
        }
    }

    #[test]
    fn test_equal_weights_alternate() {
        let wrr = WeightedSelector::new();
        wrr.add_node(2, 1).unwrap();
        wrr.add_node(2, 2).unwrap();
        let picks: Vec<_> = (0..4).map(|_| wrr.next().unwrap()).collect();
        assert_eq!(picks, vec![1, 2, 1, 2]);
    }

    #[test]
    fn test_empty_pool() {
        let wrr: WeightedSelector<u8> = WeightedSelector::new();
        assert!(matches!(wrr.next(), Err(ProxyError::EmptySelector)));
    }

    #[test]
    fn test_rejects_non_positive_weight() {
        let wrr = WeightedSelector::new();
        assert!(matches!(wrr.add_node(0, "x"), Err(ProxyError::InvalidWeight(0))));
        assert!(wrr.is_empty());
    }

    #[test]
    fn test_remove_where() {
        let wrr = WeightedSelector::new();
        wrr.add_node(1, "keep").unwrap();
        wrr.add_node(3, "drop").unwrap();
        assert_eq!(wrr.remove_where(|v| *v == "drop"), 1);
        assert_eq!(wrr.next().unwrap(), "keep");
        assert_eq!(wrr.len(), 1);
    }
}
