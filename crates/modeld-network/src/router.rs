//! Consistent-hash routing of entity names to workers
//!
//! Every endpoint contributes `vnodes` points on a 64-bit ring, each the first
//! eight bytes of a SHA-256 digest. A name maps to the first point at or after
//! its own hash, wrapping around. Adding or removing an endpoint only moves
//! the names that land on its points.

use std::collections::BTreeMap;

use modeld_core::Endpoint;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Points per endpoint
pub const DEFAULT_VNODES: usize = 160;

/// Consistent-hash router over worker endpoints
#[derive(Debug, Clone)]
pub struct Router {
    endpoints: Vec<Endpoint>,
    /// Ring point -> index into `endpoints`
    ring: BTreeMap<u64, usize>,
    vnodes: usize,
}

impl Router {
    /// Create a router with [`DEFAULT_VNODES`] points per endpoint
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self::with_vnodes(endpoints, DEFAULT_VNODES)
    }

    pub fn with_vnodes(endpoints: Vec<Endpoint>, vnodes: usize) -> Self {
        let mut router = Self {
            endpoints: Vec::new(),
            ring: BTreeMap::new(),
            vnodes: vnodes.max(1),
        };
        for endpoint in endpoints {
            router.add(endpoint);
        }
        router
    }

    /// Add an endpoint. Returns false if it was already present.
    pub fn add(&mut self, endpoint: Endpoint) -> bool {
        if self.endpoints.contains(&endpoint) {
            return false;
        }
        self.endpoints.push(endpoint);
        self.rebuild();
        true
    }

    /// Remove an endpoint. Returns false if it was not present.
    pub fn remove(&mut self, endpoint: &Endpoint) -> bool {
        let before = self.endpoints.len();
        self.endpoints.retain(|e| e != endpoint);
        if self.endpoints.len() == before {
            return false;
        }
        self.rebuild();
        true
    }

    /// Endpoint responsible for `name`
    pub fn resolve(&self, name: &str) -> Option<&Endpoint> {
        let point = hash_point(name);
        let (_, &index) = self
            .ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())?;

        let endpoint = self.endpoints.get(index)?;
        debug!(name = name, endpoint = %endpoint, "Resolved entity");
        Some(endpoint)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    fn rebuild(&mut self) {
        self.ring.clear();
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let key = endpoint.url();
            for replica in 0..self.vnodes {
                self.ring
                    .insert(hash_point(&format!("{}-{}", key, replica)), index);
            }
        }
    }
}

fn hash_point(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn create_test_endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::new("127.0.0.1".to_string(), 30000),
            Endpoint::new("127.0.0.1".to_string(), 30001),
            Endpoint::new("127.0.0.1".to_string(), 30002),
        ]
    }

    #[test]
    fn test_empty_router() {
        let router = Router::new(Vec::new());
        assert!(router.is_empty());
        assert!(router.resolve("cpu").is_none());
    }

    #[test]
    fn test_stable_regardless_of_order() {
        let endpoints = create_test_endpoints();
        let mut reversed = endpoints.clone();
        reversed.reverse();

        let a = Router::new(endpoints);
        let b = Router::new(reversed);
        for i in 0..500 {
            let name = format!("entity-{}", i);
            assert_eq!(a.resolve(&name), b.resolve(&name));
            assert_eq!(a.resolve(&name), a.resolve(&name));
        }
    }

    #[test]
    fn test_spread_across_endpoints() {
        let router = Router::new(create_test_endpoints());
        let mut counts: HashMap<u16, usize> = HashMap::new();
        for i in 0..3000 {
            let endpoint = router.resolve(&format!("sensor-{}", i)).unwrap();
            *counts.entry(endpoint.port).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!(*count > 500, "uneven spread: {:?}", counts);
        }
    }

    #[test]
    fn test_removal_only_moves_its_names() {
        let endpoints = create_test_endpoints();
        let full = Router::new(endpoints.clone());
        let mut reduced = full.clone();
        assert!(reduced.remove(&endpoints[2]));
        assert!(!reduced.remove(&endpoints[2]));

        for i in 0..1000 {
            let name = format!("sensor-{}", i);
            let before = full.resolve(&name).unwrap();
            let after = reduced.resolve(&name).unwrap();
            if before != &endpoints[2] {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn test_duplicate_endpoint_ignored() {
        let mut router = Router::new(create_test_endpoints());
        assert!(!router.add(Endpoint::new("127.0.0.1".to_string(), 30000)));
        assert_eq!(router.endpoints().len(), 3);
    }
}
