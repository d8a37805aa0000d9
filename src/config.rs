use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::generator::GeneratorConfig;
use crate::worker::WorkerConfig;

/// File read into the process environment before configuration is parsed.
pub const ENV_FILE: &str = "envfile";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    /// Static file root served for every path the API does not claim.
    pub document_root: PathBuf,
    /// Prefix the database file name is appended to.
    pub db_prefix: String,
    pub generator: GeneratorConfig,
    pub worker: WorkerConfig,
    /// Number of tasks returned by `get_history` and `GET /api/tasks`.
    pub history_limit: usize,
}

impl Config {
    /// Load `envfile` into the environment, then read configuration from it.
    ///
    /// | Env Var                   | Default                 |
    /// |---------------------------|-------------------------|
    /// | `PORT`                    | `80`                    |
    /// | `DocumentRoot`            | `www/html`              |
    /// | `OUTPUT_DIR`              | `<DocumentRoot>/images` |
    /// | `DBPath`                  | empty                   |
    /// | `GENERATOR_PROGRAM`       | `python`                |
    /// | `GENERATOR_DIR`           | `./Z-Image`             |
    /// | `GENERATOR_SCRIPT`        | `run_z_image.py`        |
    /// | `POLL_INTERVAL_MS`        | `2000`                  |
    /// | `WAKE_ON_ENQUEUE`         | `true`                  |
    /// | `GENERATION_TIMEOUT_SECS` | unset                   |
    /// | `HISTORY_LIMIT`           | `20`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::from_filename(ENV_FILE) {
            tracing::warn!("Could not load {}: {}", ENV_FILE, e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let document_root = PathBuf::from(get("DocumentRoot").unwrap_or_else(|| "www/html".into()));
        let output_dir = get("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| document_root.join("images"));

        let generator = GeneratorConfig {
            program: get("GENERATOR_PROGRAM").unwrap_or_else(|| "python".into()),
            working_dir: PathBuf::from(get("GENERATOR_DIR").unwrap_or_else(|| "./Z-Image".into())),
            script: get("GENERATOR_SCRIPT").unwrap_or_else(|| "run_z_image.py".into()),
            output_dir,
        };

        let worker = WorkerConfig {
            poll_interval: Duration::from_millis(parse_or(&get, "POLL_INTERVAL_MS", 2000u64)?),
            wake_on_enqueue: parse_bool_or(&get, "WAKE_ON_ENQUEUE", true)?,
            generation_timeout: parse_opt::<u64>(&get, "GENERATION_TIMEOUT_SECS")?
                .map(Duration::from_secs),
        };

        Ok(Self {
            port: parse_or(&get, "PORT", 80u16)?,
            document_root,
            db_prefix: lookup("DBPath").unwrap_or_default(),
            generator,
            worker,
            history_limit: parse_or(&get, "HISTORY_LIMIT", 20usize)?,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(format!("{}queue.db", self.db_prefix))
    }
}

fn parse_opt<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = get(key) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    match parsed {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => Err(ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn parse_bool_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(value) = get(key) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected a boolean".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.port, 80);
        assert_eq!(config.document_root, PathBuf::from("www/html"));
        assert_eq!(config.generator.output_dir, PathBuf::from("www/html/images"));
        assert_eq!(config.generator.program, "python");
        assert_eq!(config.generator.script, "run_z_image.py");
        assert_eq!(config.db_path(), PathBuf::from("queue.db"));
        assert_eq!(config.worker, WorkerConfig::default());
        assert_eq!(config.history_limit, 20);
    }

    #[test]
    fn output_dir_follows_document_root() {
        let config = from_pairs(&[("DocumentRoot", "/srv/site"), ("DBPath", "/var/lib/gen/")]).unwrap();
        assert_eq!(config.generator.output_dir, PathBuf::from("/srv/site/images"));
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/gen/queue.db"));

        let config = from_pairs(&[("DocumentRoot", "/srv/site"), ("OUTPUT_DIR", "/data/out")]).unwrap();
        assert_eq!(config.generator.output_dir, PathBuf::from("/data/out"));
    }

    #[test]
    fn worker_settings_are_parsed() {
        let config = from_pairs(&[
            ("POLL_INTERVAL_MS", "250"),
            ("WAKE_ON_ENQUEUE", "off"),
            ("GENERATION_TIMEOUT_SECS", "600"),
        ])
        .unwrap();
        assert_eq!(config.worker.poll_interval, Duration::from_millis(250));
        assert!(!config.worker.wake_on_enqueue);
        assert_eq!(config.worker.generation_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn bad_values_are_rejected() {
        let err = from_pairs(&[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));

        let err = from_pairs(&[("WAKE_ON_ENQUEUE", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WAKE_ON_ENQUEUE", .. }));
    }
}
