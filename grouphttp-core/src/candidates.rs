//! Discovery candidates: an immutable seed list plus a bounded cache of endpoints
//! learned at runtime.

use std::collections::HashSet;

use crate::endpoint::PeerEndpoint;

/// Default bound of the learned-endpoint cache.
pub const DEFAULT_MAX_DYNAMIC_HOSTS: usize = 2000;

/// Bounded, insertion-ordered set of learned endpoints. When full, new entries are dropped.
#[derive(Debug, Clone)]
pub struct DynamicHosts {
    capacity: usize,
    order: Vec<PeerEndpoint>,
    index: HashSet<PeerEndpoint>,
}

impl DynamicHosts {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::new(),
            index: HashSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if the endpoint was added. Known endpoints and a full cache both return false.
    pub fn insert(&mut self, endpoint: PeerEndpoint) -> bool {
        if self.index.contains(&endpoint) || self.order.len() >= self.capacity {
            return false;
        }
        self.index.insert(endpoint.clone());
        self.order.push(endpoint);
        true
    }

    pub fn remove(&mut self, endpoint: &PeerEndpoint) -> bool {
        if !self.index.remove(endpoint) {
            return false;
        }
        self.order.retain(|e| e != endpoint);
        true
    }

    pub fn contains(&self, endpoint: &PeerEndpoint) -> bool {
        self.index.contains(endpoint)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEndpoint> {
        self.order.iter()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }
}

/// Seeds plus learned endpoints. Seeds never enter the dynamic cache.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    seeds: Vec<PeerEndpoint>,
    dynamic: DynamicHosts,
}

impl CandidateSet {
    /// Duplicate seeds are collapsed, keeping first occurrence order.
    pub fn new(seeds: Vec<PeerEndpoint>, max_dynamic_hosts: usize) -> Self {
        let mut seen = HashSet::new();
        let seeds = seeds.into_iter().filter(|s| seen.insert(s.clone())).collect();
        Self {
            seeds,
            dynamic: DynamicHosts::new(max_dynamic_hosts),
        }
    }

    pub fn seeds(&self) -> &[PeerEndpoint] {
        &self.seeds
    }

    pub fn is_seed(&self, endpoint: &PeerEndpoint) -> bool {
        self.seeds.contains(endpoint)
    }

    pub fn dynamic(&self) -> &DynamicHosts {
        &self.dynamic
    }

    /// Record an endpoint seen at runtime. Returns true if the dynamic cache grew.
    pub fn learn(&mut self, endpoint: PeerEndpoint) -> bool {
        if self.is_seed(&endpoint) {
            return false;
        }
        self.dynamic.insert(endpoint)
    }

    pub fn forget(&mut self, endpoint: &PeerEndpoint) -> bool {
        self.dynamic.remove(endpoint)
    }

    pub fn clear_dynamic(&mut self) {
        self.dynamic.clear();
    }

    /// Probe targets: seeds, then learned endpoints, then `external`, without duplicates.
    pub fn candidates(&self, external: &[PeerEndpoint]) -> Vec<PeerEndpoint> {
        let mut seen = HashSet::new();
        self.seeds
            .iter()
            .chain(self.dynamic.iter())
            .chain(external.iter())
            .filter(|e| seen.insert(*e))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> PeerEndpoint {
        s.parse().unwrap()
    }

    #[test]
    fn full_cache_drops_new_entries() {
        let mut hosts = DynamicHosts::new(2);
        assert!(hosts.insert(ep("10.0.0.1:1")));
        assert!(hosts.insert(ep("10.0.0.2:1")));
        assert!(!hosts.insert(ep("10.0.0.3:1")));
        assert_eq!(hosts.len(), 2);
        assert!(!hosts.contains(&ep("10.0.0.3:1")));
        assert!(hosts.contains(&ep("10.0.0.1:1")));
    }

    #[test]
    fn duplicate_insert_ignored() {
        let mut hosts = DynamicHosts::new(4);
        assert!(hosts.insert(ep("10.0.0.1:1")));
        assert!(!hosts.insert(ep("name/10.0.0.1:1")));
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut hosts = DynamicHosts::new(DEFAULT_MAX_DYNAMIC_HOSTS);
        for i in 0..(DEFAULT_MAX_DYNAMIC_HOSTS as u32 + 100) {
            let ip = std::net::Ipv4Addr::from(0x0a00_0000 + i);
            hosts.insert(PeerEndpoint::new(ip.into(), 7800));
        }
        assert_eq!(hosts.len(), DEFAULT_MAX_DYNAMIC_HOSTS);
    }

    #[test]
    fn removal_frees_a_slot() {
        let mut hosts = DynamicHosts::new(1);
        hosts.insert(ep("10.0.0.1:1"));
        assert!(hosts.remove(&ep("10.0.0.1:1")));
        assert!(hosts.insert(ep("10.0.0.2:1")));
    }

    #[test]
    fn seeds_never_learned() {
        let mut set = CandidateSet::new(vec![ep("10.0.0.1:7800")], 10);
        assert!(!set.learn(ep("seed/10.0.0.1:7800")));
        assert!(set.dynamic().is_empty());
        assert!(set.learn(ep("10.0.0.2:7800")));
        assert_eq!(set.dynamic().len(), 1);
    }

    #[test]
    fn candidates_are_ordered_and_deduplicated() {
        let mut set = CandidateSet::new(
            vec![ep("10.0.0.1:7800"), ep("10.0.0.2:7800"), ep("10.0.0.1:7800")],
            10,
        );
        set.learn(ep("10.0.0.3:7800"));
        let external = [ep("10.0.0.2:7800"), ep("10.0.0.4:7800"), ep("10.0.0.3:7800")];
        let got = set.candidates(&external);
        assert_eq!(
            got,
            vec![
                ep("10.0.0.1:7800"),
                ep("10.0.0.2:7800"),
                ep("10.0.0.3:7800"),
                ep("10.0.0.4:7800"),
            ]
        );
    }

    #[test]
    fn clear_keeps_seeds() {
        let mut set = CandidateSet::new(vec![ep("10.0.0.1:7800")], 10);
        set.learn(ep("10.0.0.2:7800"));
        set.clear_dynamic();
        assert!(set.dynamic().is_empty());
        assert_eq!(set.candidates(&[]), vec![ep("10.0.0.1:7800")]);
    }
}
