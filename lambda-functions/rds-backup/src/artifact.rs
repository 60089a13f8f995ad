use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ARTIFACT_EXTENSION: &str = "sql.gz";

/// The committed, visible result of one backup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupArtifact {
    pub bucket: String,
    pub key: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the stored (compressed) object.
    pub checksum_sha256: String,
    pub parts: usize,
}

/// Object key for a backup started at `timestamp`.
///
/// Second granularity keeps keys of invocations started in different seconds apart.
pub fn artifact_key(prefix: &str, database: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}{}-{}.{}",
        prefix,
        database,
        timestamp.format("%Y%m%d%H%M%S"),
        ARTIFACT_EXTENSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_format() {
        let ts = Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 7).unwrap();
        assert_eq!(artifact_key("", "orders", ts), "orders-20261019000007.sql.gz");
        assert_eq!(
            artifact_key("prod-mysql/", "orders", ts),
            "prod-mysql/orders-20261019000007.sql.gz"
        );
    }

    #[test]
    fn test_keys_differ_one_second_apart() {
        let first = Utc.with_ymd_and_hms(2026, 10, 19, 23, 59, 59).unwrap();
        let second = first + chrono::Duration::seconds(1);
        assert_ne!(
            artifact_key("", "orders", first),
            artifact_key("", "orders", second)
        );
    }
}
