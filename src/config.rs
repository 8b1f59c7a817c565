use std::path::PathBuf;

use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "Clinic Ingest";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const ENV_DATABASE_PATH: &str = "CLINIC_INGEST_DB";
pub const ENV_BATCH_SIZE: &str = "CLINIC_INGEST_BATCH_SIZE";
pub const ENV_PHYSICIAN_DOMAIN: &str = "CLINIC_INGEST_PHYSICIAN_DOMAIN";
pub const ENV_STUDENT_DOMAIN: &str = "CLINIC_INGEST_STUDENT_DOMAIN";
pub const ENV_STAFF_DOMAIN: &str = "CLINIC_INGEST_STAFF_DOMAIN";

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_PHYSICIAN_DOMAIN: &str = "clinic.org";
pub const DEFAULT_STUDENT_DOMAIN: &str = "emory.edu";
pub const DEFAULT_STAFF_DOMAIN: &str = "clinic.org";

/// Seed for the placeholder credential hash written to new person rows.
pub const PLACEHOLDER_CREDENTIAL: &str = "TempPass123!";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No database path configured and no data directory available; set CLINIC_INGEST_DB")]
    MissingDatabasePath,

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Tracing filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "clinic_ingest_lib=info,clinic_ingest=info"
}

/// Default database location: `<data dir>/ClinicIngest/clinic.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("ClinicIngest").join("clinic.db"))
}

/// Everything an import run needs from its environment. Passed explicitly
/// into the pipeline entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub database_path: PathBuf,
    /// Rows per bulk existence check / bulk insert.
    pub batch_size: usize,
    pub physician_email_domain: String,
    pub student_email_domain: String,
    pub staff_email_domain: String,
    pub placeholder_credential: String,
}

impl IngestConfig {
    pub fn new(database_path: PathBuf) -> Self {
        Self {
            database_path,
            batch_size: DEFAULT_BATCH_SIZE,
            physician_email_domain: DEFAULT_PHYSICIAN_DOMAIN.into(),
            student_email_domain: DEFAULT_STUDENT_DOMAIN.into(),
            staff_email_domain: DEFAULT_STAFF_DOMAIN.into(),
            placeholder_credential: PLACEHOLDER_CREDENTIAL.into(),
        }
    }

    /// Build from a key lookup, falling back to defaults for absent keys.
    /// The binary passes the process environment overlaid with CLI flags.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_path = match lookup(ENV_DATABASE_PATH) {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
            Some(path) => {
                return Err(ConfigError::InvalidValue {
                    key: ENV_DATABASE_PATH.into(),
                    value: path,
                })
            }
            None => default_database_path().ok_or(ConfigError::MissingDatabasePath)?,
        };

        let mut config = Self::new(database_path);

        if let Some(raw) = lookup(ENV_BATCH_SIZE) {
            config.batch_size = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_BATCH_SIZE.into(),
                value: raw.clone(),
            })?;
        }
        if let Some(domain) = lookup(ENV_PHYSICIAN_DOMAIN) {
            config.physician_email_domain = domain.trim().to_string();
        }
        if let Some(domain) = lookup(ENV_STUDENT_DOMAIN) {
            config.student_email_domain = domain.trim().to_string();
        }
        if let Some(domain) = lookup(ENV_STAFF_DOMAIN) {
            config.staff_email_domain = domain.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingDatabasePath);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_BATCH_SIZE.into(),
                value: "0".into(),
            });
        }
        for (key, domain) in [
            (ENV_PHYSICIAN_DOMAIN, &self.physician_email_domain),
            (ENV_STUDENT_DOMAIN, &self.student_email_domain),
            (ENV_STAFF_DOMAIN, &self.staff_email_domain),
        ] {
            if !is_valid_domain(domain) {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    value: domain.clone(),
                });
            }
        }
        Ok(())
    }
}

fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains(|c: char| c == '@' || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn explicit_database_path_used() {
        let lookup = lookup_from(&[(ENV_DATABASE_PATH, "/tmp/clinic.db")]);
        let config = IngestConfig::from_lookup(lookup).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/clinic.db"));
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.physician_email_domain, "clinic.org");
        assert_eq!(config.student_email_domain, "emory.edu");
    }

    #[test]
    fn blank_database_path_is_invalid() {
        let err = IngestConfig::from_lookup(lookup_from(&[(ENV_DATABASE_PATH, "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_batch_size_is_invalid() {
        let err = IngestConfig::from_lookup(lookup_from(&[
            (ENV_DATABASE_PATH, "/tmp/clinic.db"),
            (ENV_BATCH_SIZE, "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn non_numeric_batch_size_is_invalid() {
        let err = IngestConfig::from_lookup(lookup_from(&[
            (ENV_DATABASE_PATH, "/tmp/clinic.db"),
            (ENV_BATCH_SIZE, "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn domain_override_validated() {
        let ok = IngestConfig::from_lookup(lookup_from(&[
            (ENV_DATABASE_PATH, "/tmp/clinic.db"),
            (ENV_STUDENT_DOMAIN, "school.edu"),
        ]))
        .unwrap();
        assert_eq!(ok.student_email_domain, "school.edu");

        let err = IngestConfig::from_lookup(lookup_from(&[
            (ENV_DATABASE_PATH, "/tmp/clinic.db"),
            (ENV_PHYSICIAN_DOMAIN, "@clinic.org"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn app_name_is_set() {
        assert_eq!(APP_NAME, "Clinic Ingest");
    }
}
