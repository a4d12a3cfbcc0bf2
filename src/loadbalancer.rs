//! Instance selection for forwarded requests
//!
//! Instance lists are short-lived values fetched from the registry per
//! request, so the balancer holds no instance state of its own. The only
//! state is the round-robin cursor per service type.

use crate::config::LoadBalancerStrategy;
use crate::registry::Instance;
use dashmap::DashMap;
use rand::Rng;
use tracing::debug;

pub struct LoadBalancer {
    strategy: LoadBalancerStrategy,
    /// Next-index cursor per service type (round-robin only)
    cursors: DashMap<String, usize>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancerStrategy) -> Self {
        Self {
            strategy,
            cursors: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> LoadBalancerStrategy {
        self.strategy
    }

    /// Pick one instance from a candidate list. Returns `None` only for an
    /// empty list; callers surface that as a no-instances gateway error.
    pub fn select<'a>(
        &self,
        service_type: &str,
        instances: &'a [Instance],
    ) -> Option<&'a Instance> {
        if instances.is_empty() {
            return None;
        }

        let index = match self.strategy {
            LoadBalancerStrategy::Random => rand::thread_rng().gen_range(0..instances.len()),
            LoadBalancerStrategy::RoundRobin => self.next_index(service_type, instances.len()),
        };

        let selected = &instances[index];
        debug!(
            service_type,
            instance_id = %selected.id,
            host = %selected.host,
            port = selected.port,
            strategy = ?self.strategy,
            "Selected instance"
        );
        Some(selected)
    }

    /// Read-clamp-advance the cursor for one service type.
    ///
    /// The entry guard makes the read-modify-write atomic per key. The
    /// clamp on read handles instance lists shrinking between selections;
    /// the stored cursor always lands inside the last-observed range.
    fn next_index(&self, service_type: &str, len: usize) -> usize {
        let mut cursor = self.cursors.entry(service_type.to_string()).or_insert(0);
        let index = if *cursor >= len { 0 } else { *cursor };
        *cursor = (index + 1) % len;
        index
    }
}
