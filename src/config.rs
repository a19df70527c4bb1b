// ABOUTME: Job definitions and the loader that reads them from the config directory
// ABOUTME: Accepts JSON or TOML job files and validates them before use

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::scheduler::parse_trigger_time;

pub const DEFAULT_PG_PORT: u16 = 5432;
const CONFIG_SUBDIR: &str = "config";
const LOG_FILE_NAME: &str = "backup.log";

/// One backup job, as written by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(rename = "folders", default)]
    pub folder_pairs: Vec<SyncPair>,
    #[serde(flatten)]
    pub database: DatabaseTarget,
    #[serde(rename = "db_dest_folder", default)]
    pub destination_folder: PathBuf,
    #[serde(rename = "rclone_sync", default)]
    pub remote_sync_pairs: Vec<SyncPair>,
    /// Days an artifact is kept; 0 disables the sweep.
    #[serde(rename = "days_before_delete", default)]
    pub retention_days: i64,
    #[serde(rename = "backup_times", default)]
    pub trigger_times: Vec<String>,
    #[serde(rename = "backup_at_startup", default)]
    pub run_at_startup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPair {
    pub from: String,
    pub to: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseTarget {
    /// Host the dump is run on through ssh, when the database is not reachable directly.
    #[serde(rename = "db_ssh", default, deserialize_with = "empty_as_none")]
    pub remote_host: Option<String>,
    #[serde(rename = "db_container_name", default, deserialize_with = "empty_as_none")]
    pub container: Option<String>,
    #[serde(rename = "pg_user", default)]
    pub user: String,
    #[serde(rename = "pg_password", default, deserialize_with = "empty_as_none")]
    pub password: Option<String>,
    #[serde(rename = "pg_host", default = "default_pg_host")]
    pub host: String,
    #[serde(rename = "pg_port", default = "default_pg_port", deserialize_with = "port_from_any")]
    pub port: u16,
    #[serde(rename = "pg_db", default)]
    pub database: String,
}

impl DatabaseTarget {
    /// A job with neither a database name nor a container has no dump step.
    /// A container alone still counts, so it is reported as unsupported
    /// instead of being silently skipped.
    pub fn is_configured(&self) -> bool {
        !self.database.trim().is_empty() || self.container.is_some()
    }
}

impl Default for DatabaseTarget {
    fn default() -> Self {
        Self {
            remote_host: None,
            container: None,
            user: String::new(),
            password: None,
            host: default_pg_host(),
            port: DEFAULT_PG_PORT,
            database: String::new(),
        }
    }
}

// Keeps the password out of log lines that print a job.
impl fmt::Debug for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseTarget")
            .field("remote_host", &self.remote_host)
            .field("container", &self.container)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    DEFAULT_PG_PORT
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

// Older job files store the port as a string.
fn port_from_any<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) if text.trim().is_empty() => Ok(DEFAULT_PG_PORT),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid pg_port '{}'", text))),
    }
}

impl JobDefinition {
    /// Minimal job with no steps; handy as a base for tests and tooling.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folder_pairs: Vec::new(),
            database: DatabaseTarget::default(),
            destination_folder: PathBuf::new(),
            remote_sync_pairs: Vec::new(),
            retention_days: 0,
            trigger_times: Vec::new(),
            run_at_startup: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("job name must not be empty");
        }
        if self.retention_days < 0 {
            bail!(
                "job '{}': days_before_delete must not be negative (got {})",
                self.name,
                self.retention_days
            );
        }
        for time in &self.trigger_times {
            parse_trigger_time(time)
                .with_context(|| format!("job '{}': invalid backup time '{}'", self.name, time))?;
        }
        if !self.database.database.trim().is_empty()
            && self.destination_folder.as_os_str().is_empty()
        {
            bail!(
                "job '{}': db_dest_folder is required when pg_db is set",
                self.name
            );
        }
        Ok(())
    }
}

/// Where the application keeps its job files and log.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub app_dir: PathBuf,
}

impl AppPaths {
    pub fn new(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_dir: app_dir.into(),
        }
    }

    /// Directory of the running executable, the default location.
    pub fn from_executable() -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate the running executable")?;
        let dir = exe
            .parent()
            .context("Executable path has no parent directory")?
            .to_path_buf();
        Ok(Self::new(dir))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.app_dir.join(CONFIG_SUBDIR)
    }

    pub fn log_file(&self) -> PathBuf {
        self.app_dir.join(LOG_FILE_NAME)
    }
}

enum Format {
    Json,
    Toml,
}

fn format_of(path: &Path) -> Option<Format> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Some(Format::Json),
        Some("toml") => Some(Format::Toml),
        _ => None,
    }
}

/// Parse and validate a single job file.
pub fn parse_job_file(path: &Path) -> Result<JobDefinition> {
    let format = format_of(path)
        .with_context(|| format!("Unsupported job file type: {}", path.display()))?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;

    let job: JobDefinition = match format {
        Format::Json => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON job file {}", path.display()))?,
        Format::Toml => toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML job file {}", path.display()))?,
    };

    job.validate()?;
    Ok(job)
}

/// Load the job stored as `<name>.json` or `<name>.toml`.
pub fn load_job(config_dir: &Path, name: &str) -> Result<JobDefinition> {
    for ext in ["json", "toml"] {
        let path = config_dir.join(format!("{}.{}", name, ext));
        if path.is_file() {
            return parse_job_file(&path);
        }
    }
    bail!(
        "No job named '{}' in {} (expected {}.json or {}.toml)",
        name,
        config_dir.display(),
        name,
        name
    )
}

/// Load every job file in `config_dir`, sorted by file name.
pub fn load_jobs(config_dir: &Path) -> Result<Vec<JobDefinition>> {
    let entries = std::fs::read_dir(config_dir)
        .with_context(|| format!("Failed to read config directory {}", config_dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("Failed to list config directory {}", config_dir.display()))?;
        let path = entry.path();
        if path.is_file() && format_of(&path).is_some() {
            paths.push(path);
        }
    }
    paths.sort();

    let jobs = paths
        .iter()
        .map(|path| parse_job_file(path))
        .collect::<Result<Vec<_>>>()?;

    ensure_unique_names(&jobs)?;
    Ok(jobs)
}

fn ensure_unique_names(jobs: &[JobDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for job in jobs {
        if !seen.insert(job.name.as_str()) {
            bail!("Duplicate job name '{}'", job.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ERP_JSON: &str = r#"{
        "name": "erp",
        "folders": [{"from": "/srv/erp/media", "to": "/backups/erp/media"}],
        "db_ssh": "",
        "db_dest_folder": "/backups/erp/db",
        "db_container_name": "",
        "pg_user": "erp",
        "pg_password": "secret",
        "pg_host": "10.0.0.5",
        "pg_port": "5433",
        "pg_db": "erp",
        "backup_times": ["03:00:00", "15:30:00"],
        "backup_at_startup": true,
        "days_before_delete": 7,
        "rclone_sync": [{"from": "/backups/erp", "to": "b2:erp"}]
    }"#;

    #[test]
    fn test_parse_json_job() {
        let job: JobDefinition = serde_json::from_str(ERP_JSON).unwrap();
        assert_eq!(job.name, "erp");
        assert_eq!(job.folder_pairs.len(), 1);
        assert_eq!(job.database.remote_host, None);
        assert_eq!(job.database.container, None);
        assert_eq!(job.database.port, 5433);
        assert_eq!(job.database.password.as_deref(), Some("secret"));
        assert_eq!(job.destination_folder, PathBuf::from("/backups/erp/db"));
        assert_eq!(job.retention_days, 7);
        assert_eq!(job.trigger_times, vec!["03:00:00", "15:30:00"]);
        assert!(job.run_at_startup);
        assert_eq!(job.remote_sync_pairs[0].to, "b2:erp");
        job.validate().unwrap();
    }

    #[test]
    fn test_parse_toml_with_defaults() {
        let job: JobDefinition = toml::from_str(
            r#"
            name = "files-only"
            backup_times = ["01:00"]

            [[folders]]
            from = "/home"
            to = "/mnt/backup/home"
            "#,
        )
        .unwrap();
        assert_eq!(job.database.port, DEFAULT_PG_PORT);
        assert_eq!(job.database.host, "localhost");
        assert!(!job.database.is_configured());
        assert_eq!(job.retention_days, 0);
        job.validate().unwrap();
    }

    #[test]
    fn test_debug_redacts_password() {
        let job: JobDefinition = serde_json::from_str(ERP_JSON).unwrap();
        let printed = format!("{:?}", job);
        assert!(!printed.contains("secret"));
    }

    #[test]
    fn test_validate_rejects_negative_retention() {
        let mut job = JobDefinition::named("x");
        job.retention_days = -1;
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_trigger_time() {
        let mut job = JobDefinition::named("x");
        job.trigger_times = vec!["25:00:00".to_string()];
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_validate_requires_destination_for_database() {
        let mut job = JobDefinition::named("x");
        job.database.database = "app".to_string();
        assert!(job.validate().is_err());
        job.destination_folder = PathBuf::from("/backups");
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_container_alone_keeps_the_dump_step() {
        let job: JobDefinition = serde_json::from_str(
            r#"{"name": "boxed", "db_container_name": "pg", "pg_db": ""}"#,
        )
        .unwrap();
        assert!(job.database.is_configured());
        job.validate().unwrap();
    }

    #[test]
    fn test_load_jobs_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.json"), r#"{"name": "b"}"#).unwrap();
        std::fs::write(dir.path().join("a.toml"), "name = \"a\"\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let jobs = load_jobs(dir.path()).unwrap();
        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_load_jobs_rejects_duplicate_names() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("one.json"), r#"{"name": "same"}"#).unwrap();
        std::fs::write(dir.path().join("two.json"), r#"{"name": "same"}"#).unwrap();
        assert!(load_jobs(dir.path()).is_err());
    }

    #[test]
    fn test_load_job_by_name() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("erp.json"), ERP_JSON).unwrap();
        assert_eq!(load_job(dir.path(), "erp").unwrap().name, "erp");
        assert!(load_job(dir.path(), "missing").is_err());
    }

    #[test]
    fn test_app_paths_layout() {
        let paths = AppPaths::new("/opt/backup");
        assert_eq!(paths.config_dir(), PathBuf::from("/opt/backup/config"));
        assert_eq!(paths.log_file(), PathBuf::from("/opt/backup/backup.log"));
    }
}
