//! Backends and backend selection.
//!
//! Each frontend owns one [`BackendStrategy`]. The strategy is driven from the
//! frontend's accept loop only, so selection state is never shared between
//! tasks and needs no locking.

use std::fmt;
use std::time::Duration;

use rand::Rng;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// A backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    /// `host:port` to dial. Host names are resolved at dial time.
    pub addr: String,
    /// Upper bound on establishing the TCP connection.
    pub connect_timeout: Duration,
}

impl Backend {
    /// Create a backend with the default connect timeout.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Create a backend with a custom connect timeout.
    pub fn with_timeout(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

/// Policy choosing the backend for the next connection of a frontend.
pub trait BackendStrategy: Send {
    /// Pick the backend for the next incoming connection.
    fn next_backend(&mut self) -> Backend;
}

/// Backend selection policies that can be named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    Random,
}

impl StrategyKind {
    /// Parse a configured strategy name. Empty selects the default.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "" | "round-robin" | "roundrobin" | "round_robin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            _ => None,
        }
    }

    /// Instantiate the policy over `backends`. `backends` must not be empty.
    pub fn build(self, backends: Vec<Backend>) -> Box<dyn BackendStrategy> {
        match self {
            Self::RoundRobin => Box::new(RoundRobin::new(backends)),
            Self::Random => Box::new(RandomChoice::new(backends)),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => f.write_str("round-robin"),
            Self::Random => f.write_str("random"),
        }
    }
}

/// Cycles through backends in configuration order, starting at the first.
#[derive(Debug)]
pub struct RoundRobin {
    backends: Vec<Backend>,
    idx: usize,
}

impl RoundRobin {
    pub fn new(backends: Vec<Backend>) -> Self {
        debug_assert!(!backends.is_empty(), "frontend without backends");
        Self { backends, idx: 0 }
    }

    /// Index the next call will return.
    pub fn cursor(&self) -> usize {
        self.idx
    }
}

impl BackendStrategy for RoundRobin {
    fn next_backend(&mut self) -> Backend {
        let n = self.backends.len();
        if n == 1 {
            return self.backends[0].clone();
        }

        let backend = self.backends[self.idx].clone();
        self.idx = (self.idx + 1) % n;
        backend
    }
}

/// Picks a backend uniformly at random for every connection.
#[derive(Debug)]
pub struct RandomChoice {
    backends: Vec<Backend>,
}

impl RandomChoice {
    pub fn new(backends: Vec<Backend>) -> Self {
        debug_assert!(!backends.is_empty(), "frontend without backends");
        Self { backends }
    }
}

impl BackendStrategy for RandomChoice {
    fn next_backend(&mut self) -> Backend {
        let i = rand::rng().random_range(0..self.backends.len());
        self.backends[i].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn backends(n: usize) -> Vec<Backend> {
        (0..n)
            .map(|i| Backend::new(format!("10.0.0.{}:443", i + 1)))
            .collect()
    }

    #[test]
    fn test_round_robin_visits_each_backend_once() {
        let pool = backends(4);
        let mut rr = RoundRobin::new(pool.clone());

        let picked: Vec<Backend> = (0..4).map(|_| rr.next_backend()).collect();
        assert_eq!(picked, pool);

        // Wraps around.
        assert_eq!(rr.next_backend(), pool[0]);
    }

    #[test]
    fn test_round_robin_first_pick_is_first_backend() {
        let pool = backends(2);
        let mut rr = RoundRobin::new(pool.clone());
        assert_eq!(rr.next_backend(), pool[0]);
        assert_eq!(rr.next_backend(), pool[1]);
    }

    #[test]
    fn test_round_robin_single_backend_never_advances() {
        let pool = backends(1);
        let mut rr = RoundRobin::new(pool.clone());
        for _ in 0..5 {
            assert_eq!(rr.next_backend(), pool[0]);
            assert_eq!(rr.cursor(), 0);
        }
    }

    #[test]
    fn test_random_stays_within_pool() {
        let pool = backends(3);
        let mut strategy = StrategyKind::Random.build(pool.clone());
        let allowed: HashSet<_> = pool.into_iter().collect();
        for _ in 0..50 {
            assert!(allowed.contains(&strategy.next_backend()));
        }
    }

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!(StrategyKind::parse(""), Some(StrategyKind::RoundRobin));
        assert_eq!(
            StrategyKind::parse("Round-Robin"),
            Some(StrategyKind::RoundRobin)
        );
        assert_eq!(StrategyKind::parse("random"), Some(StrategyKind::Random));
        assert_eq!(StrategyKind::parse("least-conn"), None);
        assert_eq!(StrategyKind::default().to_string(), "round-robin");
        assert_eq!(StrategyKind::Random.to_string(), "random");
    }

    #[test]
    fn test_backend_default_timeout() {
        let backend = Backend::new("backend.internal:8443");
        assert_eq!(backend.connect_timeout, Duration::from_secs(10));
    }
}
