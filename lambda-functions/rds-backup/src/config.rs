use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bon::Builder;

use crate::error::ConfigurationError;
use crate::retry::RetryPolicy;

pub const DEFAULT_MYSQL_PORT: u16 = 3306;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SCHEDULE: &str = "cron(0 0 * * ? *)";
pub const DEFAULT_MYSQLDUMP: &str = "mysqldump";

/// Object storage rejects non-final parts smaller than this.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Largest part object storage accepts (5 GiB).
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Each dump read allocates a buffer of this size at most.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Unvalidated settings as they arrive from the function environment.
///
/// Every field is optional here; [`RawConfig::resolve`] decides which ones are
/// required and substitutes defaults for the rest.
#[derive(Builder, Debug, Clone, Default, PartialEq)]
pub struct RawConfig {
    #[builder(into)]
    pub instance_name: Option<String>,
    #[builder(into)]
    pub db_host: Option<String>,
    #[builder(into)]
    pub db_port: Option<String>,
    #[builder(into)]
    pub db_user: Option<String>,
    #[builder(into)]
    pub db_password: Option<String>,
    #[builder(into)]
    pub db_name: Option<String>,
    #[builder(into)]
    pub security_group_id: Option<String>,
    #[builder(into)]
    pub bucket_name: Option<String>,
    #[builder(into)]
    pub bucket_region: Option<String>,
    #[builder(into)]
    pub key_prefix: Option<String>,
    #[builder(into)]
    pub timeout_secs: Option<String>,
    #[builder(into)]
    pub schedule: Option<String>,
    #[builder(into)]
    pub function_name: Option<String>,
    #[builder(into)]
    pub mysqldump_path: Option<String>,
    #[builder(into)]
    pub chunk_size_kib: Option<String>,
    #[builder(into)]
    pub part_size_mib: Option<String>,
    #[builder(into)]
    pub channel_capacity: Option<String>,
    #[builder(into)]
    pub connect_attempts: Option<String>,
    #[builder(into)]
    pub part_attempts: Option<String>,
    #[builder(into)]
    pub safety_margin_secs: Option<String>,
}

impl RawConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            instance_name: lookup("RDS_INSTANCE_NAME"),
            db_host: lookup("DB_HOST"),
            db_port: lookup("DB_PORT"),
            db_user: lookup("DB_USER"),
            db_password: lookup("DB_PASSWORD"),
            db_name: lookup("DB_NAME"),
            security_group_id: lookup("RDS_SECURITY_GROUP_ID"),
            bucket_name: lookup("BUCKET_NAME"),
            bucket_region: lookup("BUCKET_REGION"),
            key_prefix: lookup("BACKUP_KEY_PREFIX"),
            timeout_secs: lookup("BACKUP_TIMEOUT_SECS"),
            schedule: lookup("BACKUP_SCHEDULE"),
            function_name: lookup("LAMBDA_FUNCTION_NAME")
                .or_else(|| lookup("AWS_LAMBDA_FUNCTION_NAME")),
            mysqldump_path: lookup("MYSQLDUMP_PATH"),
            chunk_size_kib: lookup("BACKUP_CHUNK_SIZE_KIB"),
            part_size_mib: lookup("BACKUP_PART_SIZE_MIB"),
            channel_capacity: lookup("BACKUP_CHANNEL_CAPACITY"),
            connect_attempts: lookup("BACKUP_CONNECT_ATTEMPTS"),
            part_attempts: lookup("BACKUP_PART_ATTEMPTS"),
            safety_margin_secs: lookup("BACKUP_SAFETY_MARGIN_SECS"),
        }
    }

    pub fn resolve(&self) -> Result<BackupJobConfig, ConfigurationError> {
        let instance_name = present(&self.instance_name);

        let database = DatabaseConfig {
            host: required(&self.db_host, "DB_HOST")?,
            port: parse_or(&self.db_port, "DB_PORT", DEFAULT_MYSQL_PORT)?,
            user: required(&self.db_user, "DB_USER")?,
            password: Secret(required(&self.db_password, "DB_PASSWORD")?),
            name: required(&self.db_name, "DB_NAME")?,
        };
        if database.port == 0 {
            return Err(invalid("DB_PORT", "port must be non-zero"));
        }

        let bucket = match (present(&self.bucket_name), &instance_name) {
            (Some(bucket), _) => bucket,
            (None, Some(instance)) => format!("{instance}-rds-backup"),
            (None, None) => return Err(ConfigurationError::Missing("BUCKET_NAME")),
        };

        let key_prefix = match (&self.key_prefix, &instance_name) {
            (Some(prefix), _) => normalize_prefix(prefix),
            (None, Some(instance)) => normalize_prefix(instance),
            (None, None) => String::new(),
        };

        let function_name = present(&self.function_name).unwrap_or_else(|| {
            format!(
                "{}-rds-backup-lambda",
                instance_name.as_deref().unwrap_or(&database.name)
            )
        });

        let timeout = Duration::from_secs(parse_or(
            &self.timeout_secs,
            "BACKUP_TIMEOUT_SECS",
            DEFAULT_TIMEOUT.as_secs(),
        )?);
        let tuning = self.resolve_tuning()?;
        if timeout <= tuning.safety_margin {
            return Err(invalid(
                "BACKUP_TIMEOUT_SECS",
                format!(
                    "timeout of {}s leaves no room for the {}s safety margin",
                    timeout.as_secs(),
                    tuning.safety_margin.as_secs()
                ),
            ));
        }

        Ok(BackupJobConfig {
            instance_name,
            database,
            security_group_id: present(&self.security_group_id),
            bucket,
            bucket_region: present(&self.bucket_region),
            key_prefix,
            schedule: present(&self.schedule).unwrap_or_else(|| DEFAULT_SCHEDULE.to_string()),
            function_name,
            timeout,
            mysqldump_path: PathBuf::from(
                present(&self.mysqldump_path).unwrap_or_else(|| DEFAULT_MYSQLDUMP.to_string()),
            ),
            tuning,
        })
    }

    fn resolve_tuning(&self) -> Result<Tuning, ConfigurationError> {
        let defaults = Tuning::default();

        let chunk_kib: usize = parse_or(
            &self.chunk_size_kib,
            "BACKUP_CHUNK_SIZE_KIB",
            defaults.chunk_size / 1024,
        )?;
        let part_mib: usize = parse_or(
            &self.part_size_mib,
            "BACKUP_PART_SIZE_MIB",
            defaults.part_size / (1024 * 1024),
        )?;
        let channel_capacity = parse_or(
            &self.channel_capacity,
            "BACKUP_CHANNEL_CAPACITY",
            defaults.channel_capacity,
        )?;
        let connect_attempts = parse_or(
            &self.connect_attempts,
            "BACKUP_CONNECT_ATTEMPTS",
            defaults.connect_retry.max_attempts,
        )?;
        let part_attempts = parse_or(
            &self.part_attempts,
            "BACKUP_PART_ATTEMPTS",
            defaults.part_retry.max_attempts,
        )?;
        let safety_margin = parse_or(
            &self.safety_margin_secs,
            "BACKUP_SAFETY_MARGIN_SECS",
            defaults.safety_margin.as_secs(),
        )?;

        let chunk_size = match chunk_kib.checked_mul(1024) {
            Some(size) if size > 0 && size <= MAX_CHUNK_SIZE => size,
            _ => {
                return Err(invalid(
                    "BACKUP_CHUNK_SIZE_KIB",
                    format!("must be between 1 and {} KiB", MAX_CHUNK_SIZE / 1024),
                ))
            }
        };
        let part_size = (part_mib as u64)
            .checked_mul(1024 * 1024)
            .filter(|size| (MIN_PART_SIZE as u64..=MAX_PART_SIZE).contains(size))
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| {
                invalid(
                    "BACKUP_PART_SIZE_MIB",
                    format!(
                        "must be between {} and {} MiB",
                        MIN_PART_SIZE / (1024 * 1024),
                        MAX_PART_SIZE / (1024 * 1024)
                    ),
                )
            })?;
        if channel_capacity == 0 {
            return Err(invalid("BACKUP_CHANNEL_CAPACITY", "must be at least 1"));
        }
        if connect_attempts == 0 {
            return Err(invalid("BACKUP_CONNECT_ATTEMPTS", "must be at least 1"));
        }
        if part_attempts == 0 {
            return Err(invalid("BACKUP_PART_ATTEMPTS", "must be at least 1"));
        }

        Ok(Tuning {
            chunk_size,
            part_size,
            channel_capacity,
            connect_retry: RetryPolicy {
                max_attempts: connect_attempts,
                ..defaults.connect_retry
            },
            part_retry: RetryPolicy {
                max_attempts: part_attempts,
                ..defaults.part_retry
            },
            safety_margin: Duration::from_secs(safety_margin),
            ..defaults
        })
    }
}

/// Validated, immutable settings for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupJobConfig {
    pub instance_name: Option<String>,
    pub database: DatabaseConfig,
    pub security_group_id: Option<String>,
    pub bucket: String,
    pub bucket_region: Option<String>,
    pub key_prefix: String,
    /// Owned by the external scheduler; carried for logging only.
    pub schedule: String,
    pub function_name: String,
    pub timeout: Duration,
    pub mysqldump_path: PathBuf,
    pub tuning: Tuning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret,
    pub name: String,
}

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Buffer sizes, retry bounds and timing knobs for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    /// Upper bound on a single chunk read from the dump.
    pub chunk_size: usize,
    /// Size of every non-final multipart part.
    pub part_size: usize,
    /// Chunks buffered between the dump and the upload.
    pub channel_capacity: usize,
    pub connect_retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub part_retry: RetryPolicy,
    pub safety_margin: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            part_size: 8 * 1024 * 1024,
            channel_capacity: 4,
            connect_retry: RetryPolicy::new(4, Duration::from_millis(500), Duration::from_secs(8)),
            connect_timeout: Duration::from_secs(10),
            part_retry: RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(8)),
            safety_margin: Duration::from_secs(10),
        }
    }
}

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, ConfigurationError> {
    present(value).ok_or(ConfigurationError::Missing(field))
}

fn parse_or<T>(value: &Option<String>, field: &'static str, default: T) -> Result<T, ConfigurationError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match present(value) {
        Some(raw) => raw.parse().map_err(|e: T::Err| invalid(field, e.to_string())),
        None => Ok(default),
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn minimal() -> RawConfig {
        RawConfig::builder()
            .db_host("db.internal")
            .db_user("bak")
            .db_password("x")
            .db_name("orders")
            .bucket_name("orders-rds-backup")
            .build()
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = minimal().resolve().unwrap();

        assert_eq!(config.database.port, 3306);
        assert_eq!(config.bucket, "orders-rds-backup");
        assert_eq!(config.key_prefix, "");
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.schedule, DEFAULT_SCHEDULE);
        assert_eq!(config.function_name, "orders-rds-backup-lambda");
        assert_eq!(config.mysqldump_path, PathBuf::from("mysqldump"));
        assert_eq!(config.tuning, Tuning::default());
    }

    #[test]
    fn test_defaults_derived_from_instance_name() {
        let raw = RawConfig {
            instance_name: Some("prod-mysql".to_string()),
            bucket_name: None,
            ..minimal()
        };
        let config = raw.resolve().unwrap();

        assert_eq!(config.bucket, "prod-mysql-rds-backup");
        assert_eq!(config.key_prefix, "prod-mysql/");
        assert_eq!(config.function_name, "prod-mysql-rds-backup-lambda");
    }

    #[test]
    fn test_missing_required_fields_are_named() {
        let cases: [(fn(&mut RawConfig), &str); 4] = [
            (|r| r.db_host = None, "DB_HOST"),
            (|r| r.db_user = Some("  ".to_string()), "DB_USER"),
            (|r| r.db_password = None, "DB_PASSWORD"),
            (|r| r.db_name = Some(String::new()), "DB_NAME"),
        ];

        for (mutate, field) in cases {
            let mut raw = minimal();
            mutate(&mut raw);
            assert_eq!(raw.resolve(), Err(ConfigurationError::Missing(field)));
        }
    }

    #[test]
    fn test_bucket_required_without_instance_name() {
        let raw = RawConfig {
            bucket_name: None,
            ..minimal()
        };
        assert_eq!(raw.resolve(), Err(ConfigurationError::Missing("BUCKET_NAME")));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let raw = RawConfig {
            db_port: Some("mysql".to_string()),
            ..minimal()
        };
        assert!(matches!(
            raw.resolve(),
            Err(ConfigurationError::Invalid { field: "DB_PORT", .. })
        ));

        let raw = RawConfig {
            db_port: Some("0".to_string()),
            ..minimal()
        };
        assert!(matches!(
            raw.resolve(),
            Err(ConfigurationError::Invalid { field: "DB_PORT", .. })
        ));

        let raw = RawConfig {
            part_size_mib: Some("4".to_string()),
            ..minimal()
        };
        assert!(matches!(
            raw.resolve(),
            Err(ConfigurationError::Invalid { field: "BACKUP_PART_SIZE_MIB", .. })
        ));

        for (field, value) in [
            ("BACKUP_PART_SIZE_MIB", "5121"),
            ("BACKUP_PART_SIZE_MIB", "18446744073709551615"),
            ("BACKUP_CHUNK_SIZE_KIB", "0"),
            ("BACKUP_CHUNK_SIZE_KIB", "16385"),
            ("BACKUP_CHUNK_SIZE_KIB", "18446744073709551615"),
        ] {
            let mut raw = minimal();
            if field == "BACKUP_PART_SIZE_MIB" {
                raw.part_size_mib = Some(value.to_string());
            } else {
                raw.chunk_size_kib = Some(value.to_string());
            }
            match raw.resolve() {
                Err(ConfigurationError::Invalid { field: got, .. }) => assert_eq!(got, field, "{value}"),
                other => panic!("{field}={value} resolved to {other:?}"),
            }
        }

        let raw = RawConfig {
            part_size_mib: Some("5120".to_string()),
            chunk_size_kib: Some("16384".to_string()),
            ..minimal()
        };
        let tuning = raw.resolve().unwrap().tuning;
        assert_eq!(tuning.part_size as u64, MAX_PART_SIZE);
        assert_eq!(tuning.chunk_size, MAX_CHUNK_SIZE);

        let raw = RawConfig {
            timeout_secs: Some("10".to_string()),
            ..minimal()
        };
        assert!(matches!(
            raw.resolve(),
            Err(ConfigurationError::Invalid { field: "BACKUP_TIMEOUT_SECS", .. })
        ));
    }

    #[test]
    fn test_from_lookup_reads_environment_names() {
        let vars: HashMap<&str, &str> = [
            ("DB_HOST", "db.internal"),
            ("DB_PORT", "3307"),
            ("DB_USER", "bak"),
            ("DB_PASSWORD", "x"),
            ("DB_NAME", "orders"),
            ("BUCKET_NAME", "orders-rds-backup"),
            ("BACKUP_KEY_PREFIX", "/nightly"),
            ("BACKUP_TIMEOUT_SECS", "600"),
            ("AWS_LAMBDA_FUNCTION_NAME", "orders-backup"),
            ("BACKUP_PART_SIZE_MIB", "16"),
            ("BACKUP_CONNECT_ATTEMPTS", "2"),
        ]
        .into_iter()
        .collect();

        let raw = RawConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        let config = raw.resolve().unwrap();

        assert_eq!(config.database.port, 3307);
        assert_eq!(config.key_prefix, "nightly/");
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.function_name, "orders-backup");
        assert_eq!(config.tuning.part_size, 16 * 1024 * 1024);
        assert_eq!(config.tuning.connect_retry.max_attempts, 2);
    }

    #[test]
    fn test_password_is_redacted_in_debug() {
        let config = minimal().resolve().unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("password: Secret(\"x\")"));
        assert!(debug.contains("Secret(***)"));
        assert_eq!(config.database.password.expose(), "x");
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("backups"), "backups/");
        assert_eq!(normalize_prefix("/backups/daily/"), "backups/daily/");
    }
}
