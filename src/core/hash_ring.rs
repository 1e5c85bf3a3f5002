use crate::core::server::Server;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_POINTS_PER_SERVER: u32 = 160;

/// Upper bound on points per unit of weight
pub const MAX_POINTS_PER_SERVER: u32 = 1000;

/// Immutable ketama ring.
///
/// Every server owns `points_per_server * weight` points. Each MD5 digest of
/// `"<address>-<i>"` yields four little-endian u32 points. A key is hashed the
/// same way (first four digest bytes) and belongs to the first point at or
/// after its hash, wrapping past the end of the ring.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: Vec<(u32, usize)>,
    servers: Vec<Arc<Server>>,
    points_per_server: u32,
}

impl HashRing {
    /// Build a ring. A repeated address keeps its last occurrence.
    pub fn new(servers: Vec<Arc<Server>>, points_per_server: u32) -> Self {
        let mut unique: Vec<Arc<Server>> = Vec::with_capacity(servers.len());
        for server in servers {
            match unique.iter_mut().find(|s| s.address() == server.address()) {
                Some(existing) => *existing = server,
                None => unique.push(server),
            }
        }
        // Index order must not depend on insertion order, or rebuilding the
        // same set would resolve point collisions differently
        unique.sort_by(|a, b| a.address().cmp(b.address()));

        let points_per_server = points_per_server.clamp(1, MAX_POINTS_PER_SERVER);
        let mut points = Vec::new();
        for (index, server) in unique.iter().enumerate() {
            let count = u64::from(points_per_server) * u64::from(server.weight());
            for i in 0..count.div_ceil(4) {
                let digest = md5::compute(format!("{}-{}", server.address(), i));
                // The last digest may only contribute part of its four points
                let take = (count - i * 4).min(4) as usize;
                for chunk in digest.0.chunks_exact(4).take(take) {
                    let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push((point, index));
                }
            }
        }
        points.sort_unstable();

        Self {
            points,
            servers: unique,
            points_per_server,
        }
    }

    pub fn empty(points_per_server: u32) -> Self {
        Self::new(Vec::new(), points_per_server)
    }

    pub fn hash_key(key: &str) -> u32 {
        let digest = md5::compute(key.as_bytes());
        u32::from_le_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]])
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub fn points_per_server(&self) -> u32 {
        self.points_per_server
    }

    pub fn contains(&self, address: &str) -> bool {
        self.servers.iter().any(|s| s.address() == address)
    }

    /// The server owning `key`
    pub fn primary(&self, key: &str) -> Option<&Arc<Server>> {
        self.walk(key).next()
    }

    /// Distinct servers in clockwise order starting at the key's owner
    pub fn walk(&self, key: &str) -> RingWalk<'_> {
        let hash = Self::hash_key(key);
        let start = match self.points.partition_point(|(point, _)| *point < hash) {
            i if i == self.points.len() => 0,
            i => i,
        };
        RingWalk {
            ring: self,
            position: start,
            steps: 0,
            seen: vec![false; self.servers.len()],
            remaining: self.servers.len(),
        }
    }

    /// Ring with `server` added, or its weight replaced if already present
    pub fn with_server(&self, server: Arc<Server>) -> Self {
        let mut servers = self.servers.clone();
        servers.push(server);
        Self::new(servers, self.points_per_server)
    }

    pub fn without_server(&self, address: &str) -> Self {
        let servers = self
            .servers
            .iter()
            .filter(|s| s.address() != address)
            .cloned()
            .collect();
        Self::new(servers, self.points_per_server)
    }
}

/// Iterator returned by [`HashRing::walk`]
pub struct RingWalk<'a> {
    ring: &'a HashRing,
    position: usize,
    steps: usize,
    seen: Vec<bool>,
    remaining: usize,
}

impl<'a> Iterator for RingWalk<'a> {
    type Item = &'a Arc<Server>;

    fn next(&mut self) -> Option<Self::Item> {
        let points = &self.ring.points;
        while self.remaining > 0 && self.steps < points.len() {
            let (_, index) = points[self.position];
            self.position = (self.position + 1) % points.len();
            self.steps += 1;
            if !self.seen[index] {
                self.seen[index] = true;
                self.remaining -= 1;
                return Some(&self.ring.servers[index]);
            }
        }
        None
    }
}

/// Shared, swappable view of the ring.
///
/// Readers clone the current `Arc` and route against that snapshot; topology
/// changes build a fresh ring and replace the pointer in one step.
#[derive(Debug)]
pub struct ServerSelector {
    ring: RwLock<Arc<HashRing>>,
}

impl ServerSelector {
    pub fn new(ring: HashRing) -> Self {
        Self {
            ring: RwLock::new(Arc::new(ring)),
        }
    }

    pub fn snapshot(&self) -> Arc<HashRing> {
        self.ring.read().clone()
    }

    /// Owner of `key`, ignoring health
    pub fn select(&self, key: &str) -> Option<Arc<Server>> {
        self.snapshot().primary(key).cloned()
    }

    /// First server clockwise from the key that `is_available` accepts
    pub fn select_available<F>(&self, key: &str, mut is_available: F) -> Option<Arc<Server>>
    where
        F: FnMut(&Server) -> bool,
    {
        let ring = self.snapshot();
        let found = ring.walk(key).find(|server| is_available(server)).cloned();
        found
    }

    pub fn add_server(&self, server: Arc<Server>) {
        let mut ring = self.ring.write();
        info!("Adding server {} (weight {}) to ring", server, server.weight());
        *ring = Arc::new(ring.with_server(server));
    }

    /// Returns `false` when the address was not part of the ring
    pub fn remove_server(&self, address: &str) -> bool {
        let mut ring = self.ring.write();
        if !ring.contains(address) {
            return false;
        }
        info!("Removing server {} from ring", address);
        *ring = Arc::new(ring.without_server(address));
        true
    }
}
