//! Balancer configuration.
//!
//! Tunables loaded from environment variables with cluster defaults.

use std::time::Duration;

const GIB: u64 = 1 << 30;
const MIB: u64 = 1 << 20;

/// Balancer configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of concurrent per-source dispatcher tasks.
    pub dispatcher_threads: usize,

    /// Number of concurrent block-move tasks.
    pub mover_threads: usize,

    /// Maximum concurrent block moves a single node may be party to.
    pub max_concurrent_moves_per_node: usize,

    /// Width of the moved-blocks dedup window.
    pub moved_win_width: Duration,

    /// Cluster heartbeat interval; the outer loop sleeps twice this between
    /// rounds.
    pub heartbeat_interval: Duration,

    /// Bandwidth cap per transfer peer in bytes/s. Enforced peer-side;
    /// reported at startup for the operator.
    pub bandwidth_per_sec: u64,

    /// Sleep between pending-move completion checks. Tests shrink this.
    pub block_move_wait_time: Duration,

    /// Read timeout for a single block-move exchange.
    pub block_move_read_timeout: Duration,

    /// Hard cap on the per-source dispatch loop.
    pub max_iteration_time: Duration,

    /// Back-off applied to proxy and target nodes after a failed move.
    pub delay_after_error: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatcher_threads: 200,
            mover_threads: 1000,
            max_concurrent_moves_per_node: 5,
            moved_win_width: Duration::from_millis(5_400_000),
            heartbeat_interval: Duration::from_secs(3),
            bandwidth_per_sec: MIB,
            block_move_wait_time: Duration::from_secs(30),
            block_move_read_timeout: Duration::from_secs(20 * 60),
            max_iteration_time: Duration::from_secs(20 * 60),
            delay_after_error: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            dispatcher_threads: env_parse(
                "BALANCER_DISPATCHER_THREADS",
                defaults.dispatcher_threads,
            ),
            mover_threads: env_parse("BALANCER_MOVER_THREADS", defaults.mover_threads),
            max_concurrent_moves_per_node: env_parse(
                "BALANCER_MAX_CONCURRENT_MOVES",
                defaults.max_concurrent_moves_per_node,
            ),
            moved_win_width: Duration::from_millis(env_parse(
                "BALANCER_MOVED_WIN_WIDTH_MS",
                defaults.moved_win_width.as_millis() as u64,
            )),
            heartbeat_interval: Duration::from_secs(env_parse(
                "BALANCER_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )),
            bandwidth_per_sec: env_parse("BALANCER_BANDWIDTH_PER_SEC", defaults.bandwidth_per_sec),
            block_move_wait_time: Duration::from_millis(env_parse(
                "BALANCER_BLOCK_MOVE_WAIT_MS",
                defaults.block_move_wait_time.as_millis() as u64,
            )),
            block_move_read_timeout: defaults.block_move_read_timeout,
            max_iteration_time: defaults.max_iteration_time,
            delay_after_error: defaults.delay_after_error,
        }
    }

    /// Sleep between outer rounds.
    pub fn round_sleep(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// Maximum bytes a single storage group may move per iteration.
pub const MAX_SIZE_TO_MOVE: u64 = 10 * GIB;

/// Maximum bytes of block metadata fetched per listing round.
pub const MAX_BLOCKS_TO_FETCH: u64 = 2 * GIB;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.dispatcher_threads, 200);
        assert_eq!(config.mover_threads, 1000);
        assert_eq!(config.max_concurrent_moves_per_node, 5);
        assert_eq!(config.bandwidth_per_sec, 1024 * 1024);
        assert_eq!(config.block_move_wait_time, Duration::from_secs(30));
        assert_eq!(config.delay_after_error, Duration::from_secs(10));
        assert_eq!(config.round_sleep(), Duration::from_secs(6));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("BALANCER_MAX_CONCURRENT_MOVES", "12");
        let config = Config::from_env();
        assert_eq!(config.max_concurrent_moves_per_node, 12);
        std::env::remove_var("BALANCER_MAX_CONCURRENT_MOVES");
    }

    #[test]
    fn test_env_bad_value_falls_back() {
        std::env::set_var("BALANCER_MOVER_THREADS", "not-a-number");
        let config = Config::from_env();
        assert_eq!(config.mover_threads, 1000);
        std::env::remove_var("BALANCER_MOVER_THREADS");
    }

    #[test]
    fn test_move_size_constants() {
        assert_eq!(MAX_SIZE_TO_MOVE, 10 * (1 << 30));
        assert_eq!(MAX_BLOCKS_TO_FETCH, 2 * (1 << 30));
    }
}
