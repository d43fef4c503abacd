pub mod snowflake;

/// Identifier of a physical node in the cluster.
pub type NodeId = String;

/// Snowflake-backed entity identifiers.
pub type UserId = u64;
pub type PostId = u64;

/// Current time in milliseconds since Unix epoch.
pub fn current_time_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
