//! Uploader configuration management.
//!
//! Configuration is stored as TOML, by default at
//! `~/.config/mydata/uploader.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mydata_pipeline::{FolderStructure, PipelineConfig, ScanOptions};
use mydata_scheduler::Schedule;
use mydata_transfer::SshConfig;
use serde::{Deserialize, Serialize};

/// Uploader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory scanned for new files.
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    /// How leading directories map to datasets.
    #[serde(default)]
    pub folder_structure: FolderStructure,

    /// File name globs a file must match (empty = everything).
    #[serde(default)]
    pub includes: Vec<String>,

    /// File name globs that exclude a file.
    #[serde(default)]
    pub excludes: Vec<String>,

    #[serde(default = "default_true")]
    pub skip_hidden: bool,

    /// Skip files modified less than this many minutes ago (0 = off).
    #[serde(default)]
    pub ignore_newer_than_minutes: u64,

    #[serde(default = "default_verification_workers")]
    pub verification_workers: usize,

    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,

    /// Seconds in-flight uploads get to stop before they are aborted.
    #[serde(default = "default_grace_period")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub schedule: Schedule,
}

/// Remote host receiving the files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_remote_user")]
    pub username: String,

    /// Private key; the ssh agent and defaults are used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    /// Directory receiving the datasets.
    #[serde(default = "default_remote_root")]
    pub remote_root: String,

    /// Where chunks are staged before being appended.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound for one remote command.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

/// MyData server API access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_data_directory() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join("MyData")
}

fn default_true() -> bool {
    true
}

fn default_verification_workers() -> usize {
    25
}

fn default_upload_workers() -> usize {
    5
}

fn default_grace_period() -> u64 {
    10
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_user() -> String {
    "mydata".into()
}

fn default_remote_root() -> String {
    "/var/lib/mydata/receiving".into()
}

fn default_scratch_dir() -> String {
    "/tmp".into()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_command_timeout() -> u64 {
    600
}

fn default_base_url() -> String {
    "http://localhost:8000".into()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            username: default_remote_user(),
            identity_file: None,
            remote_root: default_remote_root(),
            scratch_dir: default_scratch_dir(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            username: String::new(),
            api_key: String::new(),
            timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            folder_structure: FolderStructure::default(),
            includes: Vec::new(),
            excludes: Vec::new(),
            skip_hidden: default_true(),
            ignore_newer_than_minutes: 0,
            verification_workers: default_verification_workers(),
            upload_workers: default_upload_workers(),
            shutdown_grace_secs: default_grace_period(),
            remote: RemoteConfig::default(),
            metadata: MetadataConfig::default(),
            schedule: Schedule::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, writing the defaults there if the
    /// file does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // The file holds the API key.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            structure: self.folder_structure,
            includes: self.includes.clone(),
            excludes: self.excludes.clone(),
            skip_hidden: self.skip_hidden,
            ignore_newer_than: (self.ignore_newer_than_minutes > 0)
                .then(|| Duration::from_secs(self.ignore_newer_than_minutes * 60)),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            verification_workers: self.verification_workers,
            upload_workers: self.upload_workers,
            remote_root: self.remote.remote_root.clone(),
            scan: self.scan_options(),
            grace_period: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            host: self.remote.host.clone(),
            port: self.remote.port,
            username: self.remote.username.clone(),
            identity_file: self.remote.identity_file.clone(),
            connect_timeout: Duration::from_secs(self.remote.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.remote.command_timeout_secs),
            ..SshConfig::default()
        }
    }
}

/// Returns the default configuration file path.
pub fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(unix)]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("mydata")
            .join("uploader.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("mydata").join("uploader.toml"))
    }

    #[cfg(not(any(unix, target_os = "windows")))]
    {
        Ok(PathBuf::from("mydata/uploader.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.folder_structure, FolderStructure::UsernameDataset);
        assert_eq!(config.verification_workers, 25);
        assert_eq!(config.upload_workers, 5);
        assert_eq!(config.remote.port, 22);
        assert_eq!(config.remote.scratch_dir, "/tmp");
        assert_eq!(config.schedule, Schedule::Manually);
        assert!(config.skip_hidden);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
            data_directory = "/data/instrument"
            upload_workers = 2

            [remote]
            host = "store.example.org"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data_directory, PathBuf::from("/data/instrument"));
        assert_eq!(config.upload_workers, 2);
        assert_eq!(config.verification_workers, 25);
        assert_eq!(config.remote.host, "store.example.org");
        assert_eq!(config.remote.username, "mydata");
        assert_eq!(config.metadata.timeout_secs, 30);
    }

    #[test]
    fn timer_schedule_with_window() {
        let toml_str = r#"
            folder_structure = "experiment_dataset"

            [schedule]
            kind = "timer"
            interval_minutes = 15

            [schedule.window]
            from = "08:00:00"
            to = "18:30:00"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.folder_structure, FolderStructure::ExperimentDataset);
        let Schedule::Timer {
            interval_minutes,
            window: Some(window),
        } = config.schedule
        else {
            panic!("expected a windowed timer, got {:?}", config.schedule);
        };
        assert_eq!(interval_minutes, 15);
        assert_eq!(window.from, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(window.to, NaiveTime::from_hms_opt(18, 30, 0).unwrap());
    }

    #[test]
    fn pipeline_settings_follow_config() {
        let config = Config {
            ignore_newer_than_minutes: 5,
            shutdown_grace_secs: 3,
            excludes: vec!["*.tmp".into()],
            ..Config::default()
        };
        let pipeline = config.pipeline_config();
        assert_eq!(
            pipeline.scan.ignore_newer_than,
            Some(Duration::from_secs(300))
        );
        assert_eq!(pipeline.scan.excludes, vec!["*.tmp".to_string()]);
        assert_eq!(pipeline.grace_period, Duration::from_secs(3));
        assert_eq!(pipeline.remote_root, "/var/lib/mydata/receiving");

        assert_eq!(Config::default().scan_options().ignore_newer_than, None);
    }

    #[test]
    fn ssh_settings_follow_config() {
        let mut config = Config::default();
        config.remote.host = "store".into();
        config.remote.identity_file = Some(PathBuf::from("/keys/mydata"));
        config.remote.command_timeout_secs = 60;
        let ssh = config.ssh_config();
        assert_eq!(ssh.host, "store");
        assert_eq!(ssh.identity_file, Some(PathBuf::from("/keys/mydata")));
        assert_eq!(ssh.command_timeout, Duration::from_secs(60));
        assert_eq!(ssh.ssh_binary, PathBuf::from("ssh"));
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("uploader.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.upload_workers, 5);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("uploader.toml");

        let mut config = Config {
            upload_workers: 9,
            schedule: Schedule::Daily {
                time: NaiveTime::from_hms_opt(22, 15, 0).unwrap(),
            },
            ..Config::default()
        };
        config.metadata.api_key = "secret".into();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.upload_workers, 9);
        assert_eq!(loaded.metadata.api_key, "secret");
        assert_eq!(loaded.schedule, config.schedule);
    }

    #[test]
    fn config_path_not_empty() {
        let path = config_path().unwrap();
        assert!(path.to_string_lossy().contains("mydata"));
    }
}
