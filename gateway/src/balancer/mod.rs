use crate::registry::{Instance, Registry};
use dashmap::DashMap;
use http::HeaderMap;
use rand::Rng;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Instance selection policy. Configured once per balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    WeightedRoundRobin,
    WeightedRandom,
    IpHash,
}

impl Strategy {
    /// Parse a strategy name; anything unrecognized falls back to round-robin.
    pub fn from_name(name: &str) -> Self {
        match name {
            "random" => Self::Random,
            "weighted-round-robin" => Self::WeightedRoundRobin,
            "weighted-random" => Self::WeightedRandom,
            "ip-hash" => Self::IpHash,
            _ => Self::RoundRobin,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::WeightedRandom => "weighted-random",
            Self::IpHash => "ip-hash",
        };
        f.write_str(name)
    }
}

/// Selects service instances for forwarding.
///
/// Stateless apart from the per-service round-robin cursors: every `select`
/// fetches a fresh registry snapshot and applies the policy over it. Cursors
/// persist across snapshots, so a stable fleet cycles exactly and a resized
/// one keeps wrapping modulo the new length.
pub struct Balancer {
    strategy: Strategy,
    registry: Arc<Registry>,
    cursors: DashMap<String, Arc<AtomicU64>>,
}

impl Balancer {
    pub fn new(strategy: Strategy, registry: Arc<Registry>) -> Self {
        Self {
            strategy,
            registry,
            cursors: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick an instance for the service, or `None` when it has no live
    /// instances. `headers` and `peer_addr` feed client-IP extraction for the
    /// ip-hash policy; the other policies ignore them.
    pub fn select(
        &self,
        service: &str,
        headers: &HeaderMap,
        peer_addr: SocketAddr,
    ) -> Option<Instance> {
        let instances = self.registry.instances(service);
        if instances.is_empty() {
            return None;
        }

        match self.strategy {
            Strategy::RoundRobin => self.select_round_robin(service, &instances),
            Strategy::Random => select_random(&instances),
            Strategy::WeightedRoundRobin => {
                if has_valid_weights(&instances) {
                    self.select_weighted_round_robin(service, &instances)
                } else {
                    self.select_round_robin(service, &instances)
                }
            }
            Strategy::WeightedRandom => {
                if has_valid_weights(&instances) {
                    select_weighted_random(&instances)
                } else {
                    select_random(&instances)
                }
            }
            Strategy::IpHash => {
                let ip = client_ip(headers, peer_addr);
                let idx = fnv1a_32(ip.as_bytes()) as usize % instances.len();
                Some(instances[idx].clone())
            }
        }
    }

    /// Next value of the per-service counter. The cursor is created lazily;
    /// once present, selection only costs the atomic increment.
    fn next_cursor(&self, service: &str) -> u64 {
        if let Some(cursor) = self.cursors.get(service) {
            return cursor.fetch_add(1, Ordering::Relaxed) + 1;
        }
        let cursor = self
            .cursors
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        cursor.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn select_round_robin(&self, service: &str, instances: &[Instance]) -> Option<Instance> {
        let n = self.next_cursor(service);
        let idx = ((n - 1) % instances.len() as u64) as usize;
        Some(instances[idx].clone())
    }

    fn select_weighted_round_robin(
        &self,
        service: &str,
        instances: &[Instance],
    ) -> Option<Instance> {
        let total: u64 = instances.iter().map(|i| u64::from(i.weight)).sum();
        let n = self.next_cursor(service);
        let mut slot = ((n - 1) % total) as i64;
        for inst in instances {
            slot -= i64::from(inst.weight);
            if slot < 0 {
                return Some(inst.clone());
            }
        }
        instances.last().cloned()
    }
}

fn has_valid_weights(instances: &[Instance]) -> bool {
    instances.iter().all(|i| i.weight >= 1)
}

fn select_random(instances: &[Instance]) -> Option<Instance> {
    let idx = rand::thread_rng().gen_range(0..instances.len());
    Some(instances[idx].clone())
}

fn select_weighted_random(instances: &[Instance]) -> Option<Instance> {
    let total: u64 = instances.iter().map(|i| u64::from(i.weight)).sum();
    let mut r = rand::thread_rng().gen_range(0..total) as i64;
    for inst in instances {
        r -= i64::from(inst.weight);
        if r < 0 {
            return Some(inst.clone());
        }
    }
    instances.last().cloned()
}

/// Client IP for hashing: leftmost `X-Forwarded-For` entry when present
/// (assumes a trusted proxy in front), otherwise the TCP peer address.
fn client_ip(headers: &HeaderMap, peer_addr: SocketAddr) -> String {
    if let Some(xff) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        let first = xff.split(',').next().unwrap_or("");
        return first.trim().to_string();
    }
    peer_addr.ip().to_string()
}

/// 32-bit FNV-1a. Stable across processes, which keeps ip-hash sticky for a
/// fixed snapshot.
fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn peer() -> SocketAddr {
        "10.0.0.1:55555".parse().unwrap()
    }

    fn setup(strategy: Strategy, weights: &[(&str, u32)]) -> Balancer {
        let registry = Arc::new(Registry::new());
        for (id, weight) in weights {
            registry.register(
                "echo",
                Instance {
                    id: id.to_string(),
                    addr: format!("http://{}", id),
                    weight: *weight,
                },
            );
        }
        Balancer::new(strategy, registry)
    }

    #[test]
    fn round_robin_cycles_in_insertion_order() {
        let b = setup(Strategy::RoundRobin, &[("a", 0), ("b", 0), ("c", 0)]);
        let headers = HeaderMap::new();

        let expected = ["a", "b", "c", "a", "b", "c"];
        for want in expected {
            let inst = b.select("echo", &headers, peer()).unwrap();
            assert_eq!(inst.id, want);
        }
    }

    #[test]
    fn empty_service_returns_none() {
        let b = setup(Strategy::RoundRobin, &[]);
        assert!(b.select("echo", &HeaderMap::new(), peer()).is_none());
        assert!(b.select("nonexistent", &HeaderMap::new(), peer()).is_none());
    }

    #[test]
    fn single_instance_always_wins() {
        let b = setup(Strategy::RoundRobin, &[("only", 0)]);
        for _ in 0..3 {
            let inst = b.select("echo", &HeaderMap::new(), peer()).unwrap();
            assert_eq!(inst.id, "only");
        }
    }

    #[test]
    fn cursor_wraps_after_fleet_shrinks() {
        let registry = Arc::new(Registry::new());
        for id in ["a", "b", "c"] {
            registry.register(
                "echo",
                Instance {
                    id: id.to_string(),
                    addr: format!("http://{}", id),
                    weight: 0,
                },
            );
        }
        let b = Balancer::new(Strategy::RoundRobin, registry.clone());
        let headers = HeaderMap::new();

        for _ in 0..4 {
            b.select("echo", &headers, peer());
        }
        registry.unregister("echo", "c");

        // Cursor keeps counting; index stays within the new length.
        for _ in 0..10 {
            let inst = b.select("echo", &headers, peer()).unwrap();
            assert!(inst.id == "a" || inst.id == "b");
        }
    }

    #[test]
    fn random_hits_all_instances() {
        let b = setup(Strategy::Random, &[("a", 0), ("b", 0)]);
        let headers = HeaderMap::new();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            seen.insert(b.select("echo", &headers, peer()).unwrap().id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn weighted_round_robin_distributes_by_weight() {
        let b = setup(Strategy::WeightedRoundRobin, &[("a", 2), ("b", 1)]);
        let headers = HeaderMap::new();

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..6 {
            let inst = b.select("echo", &headers, peer()).unwrap();
            *counts.entry(inst.id).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 4);
        assert_eq!(counts["b"], 2);
    }

    #[test]
    fn weighted_round_robin_interleaves_whole_blocks() {
        let b = setup(Strategy::WeightedRoundRobin, &[("a", 2), ("b", 1)]);
        let headers = HeaderMap::new();

        let picks: Vec<String> = (0..6)
            .map(|_| b.select("echo", &headers, peer()).unwrap().id)
            .collect();
        assert_eq!(picks, vec!["a", "a", "b", "a", "a", "b"]);
    }

    #[test]
    fn weighted_round_robin_falls_back_without_weights() {
        let b = setup(Strategy::WeightedRoundRobin, &[("a", 2), ("b", 0)]);
        let headers = HeaderMap::new();

        let expected = ["a", "b", "a", "b"];
        for want in expected {
            let inst = b.select("echo", &headers, peer()).unwrap();
            assert_eq!(inst.id, want);
        }
    }

    #[test]
    fn weighted_random_respects_weights_roughly() {
        let b = setup(Strategy::WeightedRandom, &[("a", 9), ("b", 1)]);
        let headers = HeaderMap::new();

        let mut a = 0;
        for _ in 0..200 {
            if b.select("echo", &headers, peer()).unwrap().id == "a" {
                a += 1;
            }
        }
        assert!(a > 120, "a picked {} of 200", a);
    }

    #[test]
    fn weighted_random_falls_back_without_weights() {
        let b = setup(Strategy::WeightedRandom, &[("a", 0), ("b", 0)]);
        let headers = HeaderMap::new();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..30 {
            seen.insert(b.select("echo", &headers, peer()).unwrap().id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn ip_hash_is_sticky_per_peer() {
        let b = setup(Strategy::IpHash, &[("a", 0), ("b", 0), ("c", 0)]);
        let headers = HeaderMap::new();
        let addr: SocketAddr = "192.168.1.1:12345".parse().unwrap();

        let first = b.select("echo", &headers, addr).unwrap();
        for _ in 0..5 {
            let inst = b.select("echo", &headers, addr).unwrap();
            assert_eq!(inst.id, first.id);
        }
    }

    #[test]
    fn ip_hash_prefers_forwarded_for() {
        let b = setup(Strategy::IpHash, &[("a", 0), ("b", 0)]);

        let mut h1 = HeaderMap::new();
        h1.insert("x-forwarded-for", " 203.0.113.7 , 10.0.0.2".parse().unwrap());
        let mut h2 = HeaderMap::new();
        h2.insert("x-forwarded-for", "203.0.113.7".parse().unwrap());

        // Same leading entry, different peers — still the same instance.
        let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let z: SocketAddr = "10.9.9.9:2000".parse().unwrap();
        assert_eq!(
            b.select("echo", &h1, a).unwrap().id,
            b.select("echo", &h2, z).unwrap().id
        );
    }

    #[test]
    fn strategy_name_round_trip() {
        for name in [
            "round-robin",
            "random",
            "weighted-round-robin",
            "weighted-random",
            "ip-hash",
        ] {
            assert_eq!(Strategy::from_name(name).to_string(), name);
        }
        assert_eq!(Strategy::from_name("bogus"), Strategy::RoundRobin);
    }

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }
}
