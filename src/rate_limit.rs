/// Message Rate Limiting Module
///
/// Per-nodeID token bucket over inbound peer messages. A limited sender gets
/// an RPC error reply and its message is dropped; the limiter itself never
/// errors.
use std::num::NonZeroU32;

use governor::{DefaultKeyedRateLimiter, Quota};

/// Keyed token bucket, one bucket per sender nodeID.
pub struct MessageRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl MessageRateLimiter {
    /// Allow `per_minute` messages per nodeID, with the same burst.
    pub fn new(per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute.max(1)).expect("nonzero"));
        Self {
            limiter: DefaultKeyedRateLimiter::keyed(quota),
        }
    }

    /// Whether a message from `node_id` may be processed right now.
    pub fn check(&self, node_id: &str) -> bool {
        self.limiter.check_key(&node_id.to_string()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_limited() {
        let limiter = MessageRateLimiter::new(2);
        assert!(limiter.check("node-a"));
        assert!(limiter.check("node-a"));
        assert!(!limiter.check("node-a"));
    }

    #[test]
    fn test_buckets_are_per_node() {
        let limiter = MessageRateLimiter::new(1);
        assert!(limiter.check("node-a"));
        assert!(!limiter.check("node-a"));
        assert!(limiter.check("node-b"));
    }
}
