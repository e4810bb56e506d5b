//! Layered configuration.
//!
//! Precedence, lowest first: built-in defaults, TOML file, `PODVAULT_*`
//! environment variables (`__` separates nested keys), command-line flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::orchestrator::FLUSH_SETTLE;
use crate::core::remote::{RemoteCommand, validate_file_name, validate_remote_path};
use crate::core::transfer_engine::TransferEngineType;

pub const DEFAULT_CONFIG_FILE: &str = "podvault.toml";
pub const ENV_PREFIX: &str = "PODVAULT_";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub namespace: String,
    pub kubeconfig: Option<PathBuf>,
    pub kubectl_binary: String,
    pub pods: Vec<String>,
    pub containers: Vec<String>,
    /// Directory archived inside each container.
    pub data_dir: String,
    /// Directory inside the container where the archive is written.
    pub remote_dir: String,
    pub out_name: Option<String>,
    /// Local staging directory for the relay strategy.
    pub local_dir: PathBuf,
    pub cluster_name: Option<String>,
    pub strategy: TransferEngineType,
    pub upload: bool,
    pub keep_local: bool,
    pub keep_remote: bool,
    pub verify: bool,
    pub chunk_size: u64,
    /// Defaults to `chunk_size`.
    pub part_size: Option<u64>,
    pub concurrency: usize,
    pub expiry_days: u32,
    pub command_timeout_secs: u64,
    pub flush: FlushConfig,
    pub storage: StorageConfig,
    pub remote_tool: RemoteToolConfig,
    pub notification: NotificationConfig,
    pub restore: RestoreConfig,
    pub log: LogSettings,
    pub simulation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// argv run in the container before archiving. Empty skips the flush.
    pub command: Vec<String>,
    /// Fixed wait after the flush when no check is configured.
    pub settle_secs: u64,
    /// argv polled until it exits zero, replacing the fixed wait.
    pub check: Option<Vec<String>>,
    pub check_interval_secs: u64,
    pub check_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    /// Base of public object URLs in reports, e.g. `https://bucket.oss-cn-hangzhou.aliyuncs.com`.
    pub public_url_base: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteToolConfig {
    /// Path of the upload utility inside the container.
    pub binary: String,
    /// Where to fetch the utility from when it is missing.
    pub install_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Object key of the archive to restore.
    pub archive: Option<String>,
    /// Directory inside the container the archive is unpacked into.
    pub extract_dir: String,
    pub load: LoadConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// argv run once per unpacked file matching `pattern`. `{file}` and
    /// `{pod}` are substituted. Empty skips loading.
    pub command: Vec<String>,
    /// `find -name` pattern selecting the files to load.
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub json: bool,
    pub verbose: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kubeconfig: None,
            kubectl_binary: "kubectl".to_string(),
            pods: Vec::new(),
            containers: vec!["iotdb-datanode".to_string()],
            data_dir: "/iotdb/data/".to_string(),
            remote_dir: "/tmp".to_string(),
            out_name: None,
            local_dir: PathBuf::from("."),
            cluster_name: None,
            strategy: TransferEngineType::default(),
            upload: true,
            keep_local: false,
            keep_remote: false,
            verify: true,
            chunk_size: 10 * MIB,
            part_size: None,
            concurrency: 3,
            expiry_days: 7,
            command_timeout_secs: 600,
            flush: FlushConfig::default(),
            storage: StorageConfig {
                region: "us-east-1".to_string(),
                ..Default::default()
            },
            remote_tool: RemoteToolConfig::default(),
            notification: NotificationConfig::default(),
            restore: RestoreConfig::default(),
            log: LogSettings::default(),
            simulation: false,
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            command: [
                "/iotdb/sbin/start-cli.sh",
                "-h",
                "iotdb-datanode",
                "-e",
                "flush on cluster",
            ]
            .map(String::from)
            .to_vec(),
            settle_secs: FLUSH_SETTLE.as_secs(),
            check: None,
            check_interval_secs: 1,
            check_attempts: 30,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            archive: None,
            extract_dir: "/tmp/podvault-restore".to_string(),
            load: LoadConfig::default(),
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            command: [
                "/iotdb/sbin/start-cli.sh",
                "-h",
                "{pod}",
                "-e",
                "load '{file}' verify=false",
            ]
            .map(String::from)
            .to_vec(),
            pattern: "*.tsfile".to_string(),
        }
    }
}

impl Default for RemoteToolConfig {
    fn default() -> Self {
        Self {
            binary: "./ossutil64".to_string(),
            install_url: "http://gosspublic.alicdn.com/ossutil/1.7.7/ossutil64".to_string(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the TOML file, then the environment.
    ///
    /// An explicitly named file must exist; the default file is optional.
    pub fn figment(config_file: Option<&Path>) -> Result<Figment> {
        let file = match config_file {
            Some(path) => {
                ensure!(path.exists(), "Config file {} does not exist", path.display());
                path.to_path_buf()
            }
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        Ok(Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config = Self::extract(figment)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge the layers without validating, for display.
    pub fn extract(figment: Figment) -> Result<Self> {
        figment.extract().context("Failed to load configuration")
    }

    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(config_file)?)
    }

    pub fn part_size(&self) -> u64 {
        self.part_size.unwrap_or(self.chunk_size)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.chunk_size > 0, "chunk_size must be greater than zero");
        ensure!(self.part_size() > 0, "part_size must be greater than zero");
        ensure!(self.concurrency >= 1, "concurrency must be at least 1");
        ensure!(!self.containers.is_empty(), "at least one container is required");

        validate_remote_path(&self.data_dir).context("invalid data_dir")?;
        validate_remote_path(&self.remote_dir).context("invalid remote_dir")?;
        if let Some(name) = &self.out_name {
            validate_file_name(name).context("invalid out_name")?;
        }
        for pod in &self.pods {
            validate_file_name(pod).with_context(|| format!("invalid pod name {pod:?}"))?;
        }
        if !self.flush.command.is_empty() {
            RemoteCommand::from_argv(self.flush.command.iter().cloned())
                .context("invalid flush.command")?;
        }
        if let Some(check) = &self.flush.check {
            RemoteCommand::from_argv(check.iter().cloned()).context("invalid flush.check")?;
        }

        if self.upload {
            ensure!(
                !self.storage.bucket.is_empty(),
                "storage.bucket is required when upload is enabled"
            );
            ensure!(
                !self.storage.bucket.contains('/'),
                "storage.bucket must not contain '/'"
            );
        } else if self.strategy != TransferEngineType::Relay {
            bail!("strategy {:?} always uploads; use relay with upload = false", self.strategy);
        }
        Ok(())
    }

    /// Checks a restore needs on top of [`AppConfig::validate`].
    pub fn validate_restore(&self) -> Result<()> {
        let Some(archive) = &self.restore.archive else {
            bail!("restore.archive (--file) names no archive");
        };
        validate_file_name(archive).context("invalid restore.archive")?;
        ensure!(!self.storage.bucket.is_empty(), "storage.bucket is required to restore");
        ensure!(
            self.storage.endpoint.is_some()
                && self.storage.access_key_id.is_some()
                && self.storage.secret_access_key.is_some(),
            "restore copies through the in-container utility and needs storage.endpoint and static keys"
        );
        validate_remote_path(&self.restore.extract_dir).context("invalid restore.extract_dir")?;
        if !self.restore.load.command.is_empty() {
            RemoteCommand::from_argv(self.restore.load.command.iter().cloned())
                .context("invalid restore.load.command")?;
        }
        ensure!(
            !self.restore.load.pattern.is_empty() && !self.restore.load.pattern.contains('/'),
            "restore.load.pattern must be a file name pattern"
        );
        Ok(())
    }

    /// Copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let mask = |v: &mut Option<String>| {
            if v.is_some() {
                *v = Some("***".to_string());
            }
        };
        mask(&mut copy.storage.access_key_id);
        mask(&mut copy.storage.secret_access_key);
        mask(&mut copy.notification.webhook_url);
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
