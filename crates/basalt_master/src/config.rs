//! Tuning knobs for the backfill controller.

use std::time::Duration;

/// Configuration for index backfill orchestration.
///
/// One record is passed to the master context at construction.
/// `test_slowdown_alter_table_rpcs` exists so failover tests can stop the
/// master between permission phases; it stays zero in production.
#[derive(Clone, Copy, Debug)]
pub struct BackfillConfig {
    /// Per-attempt deadline for backfill RPCs to tablet servers.
    pub rpc_timeout: Duration,
    /// Attempt cap for one tablet RPC.
    pub rpc_max_retries: u32,
    /// Upper bound on the backoff between retries.
    pub rpc_max_delay: Duration,
    /// Poll interval while waiting for the index table's alter to finish
    /// before allowing compactions to GC delete markers.
    pub wait_for_alter_table_completion: Duration,
    /// Test injection: sleep before and after each permission bump.
    pub test_slowdown_alter_table_rpcs: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(60),
            rpc_max_retries: 150,
            rpc_max_delay: Duration::from_secs(600),
            wait_for_alter_table_completion: Duration::from_millis(100),
            test_slowdown_alter_table_rpcs: Duration::ZERO,
        }
    }
}
