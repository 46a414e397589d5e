//! Runtime configuration shared by migration and replication code.

/// Tunables recognized by the chunk migration pathway.
///
/// Wire-protocol constants (snapshot batch size, per-batch ack timeouts, the
/// catch-up iteration budget) are deliberately not configurable; they live as
/// named constants next to the code that sends them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateConfig {
    /// Convergence threshold for binlog catch-up, in log entries.
    ///
    /// Once the residual lag behind the log head drops below this distance
    /// the sender is willing to take the cluster-wide slot lock and drain the
    /// remaining tail inside the quiescent window.
    pub migrate_distance: u64,
    /// Seconds to wait for the destination's reply to `migrateend`.
    pub binlog_rsp_timeout_secs: u64,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            migrate_distance: 10_000,
            binlog_rsp_timeout_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MigrateConfig;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn default_distance_is_positive() {
        let config = MigrateConfig::default();
        assert_that!(config.migrate_distance > 0, eq(true));
        assert_that!(config.binlog_rsp_timeout_secs > 0, eq(true));
    }
}
