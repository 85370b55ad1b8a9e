//! # timer
//!
//! why: stagger elections so split votes resolve on their own
//! relations: read by raft-runtime whenever it arms an election timer
//! what: randomized election timeout drawn from RaftConfig's range

use rand::Rng;
use std::time::Duration;

use crate::config::RaftConfig;

/// Generates a random election timeout in `[min_ms, max_ms)`
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..max_ms))
}

pub fn election_timeout(config: &RaftConfig) -> Duration {
    random_election_timeout(config.election_timeout_min, config.election_timeout_max)
}
