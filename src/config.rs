use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Policy when the target name cannot be created at all.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CannotCreatePolicy {
    #[default]
    UserPrompt,
    AutoRename,
    Skip,
}

/// Policy when the target file already exists (also reused for the
/// retry-on-created/resumed variants).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileExistsPolicy {
    #[default]
    UserPrompt,
    AutoRename,
    Resume,
    ResumeOrOverwrite,
    Overwrite,
    Skip,
}

/// Policy when the target directory already exists.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirExistsPolicy {
    #[default]
    UserPrompt,
    AutoRename,
    JoinExisting,
    Skip,
}

/// Policy when ASCII mode was requested but the data looks binary.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AsciiOnBinaryPolicy {
    #[default]
    UserPrompt,
    Ignore,
    RestartInBinary,
    Skip,
}

/// Confirmation policy for deleting non-empty directories.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NonEmptyDirPolicy {
    #[default]
    UserPrompt,
    DeleteIt,
    Skip,
}

/// Confirmation policy for deleting hidden files/directories.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HiddenDeletePolicy {
    #[default]
    UserPrompt,
    DeleteIt,
    Skip,
}

/// Policy when change-attributes meets permission bits it cannot preserve.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownAttrsPolicy {
    #[default]
    UserPrompt,
    Ignore,
    Skip,
}

/// One full table of conflict resolutions. Download and upload keep separate
/// tables so their defaults can differ.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
pub struct PolicyTable {
    #[serde(default)]
    pub cannot_create_file: CannotCreatePolicy,
    #[serde(default)]
    pub cannot_create_dir: CannotCreatePolicy,
    #[serde(default)]
    pub file_already_exists: FileExistsPolicy,
    #[serde(default)]
    pub dir_already_exists: DirExistsPolicy,
    #[serde(default)]
    pub retry_on_created_file: FileExistsPolicy,
    #[serde(default)]
    pub retry_on_resumed_file: FileExistsPolicy,
    #[serde(default)]
    pub ascii_on_binary: AsciiOnBinaryPolicy,
    #[serde(default)]
    pub non_empty_dir_delete: NonEmptyDirPolicy,
    #[serde(default)]
    pub hidden_file_delete: HiddenDeletePolicy,
    #[serde(default)]
    pub hidden_dir_delete: HiddenDeletePolicy,
    #[serde(default)]
    pub unknown_attrs: UnknownAttrsPolicy,
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_buf_size() -> usize {
    64 * 1024
}

fn default_resume_min() -> u64 {
    32 * 1024
}

fn default_ascii_masks() -> Vec<String> {
    ["*.txt", "*.htm", "*.html", "*.css", "*.xml", "*.json", "*.csv", "*.md", "*.log", "*.ini"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_reconnect_delay_secs() -> u64 {
    20
}

/// Engine + CLI configuration, persisted as JSON under `~/.ftpilot/`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub server_file_path: PathBuf,
    pub version: Option<u32>,

    /// Conflict-resolution defaults for download-side operations.
    #[serde(default)]
    pub download_policies: PolicyTable,
    /// Separate storage for upload so the two directions can differ.
    #[serde(default)]
    pub upload_policies: PolicyTable,

    /// Pick ASCII/binary per file from the mask group below.
    #[serde(default = "default_true")]
    pub auto_detect_transfer_mode: bool,
    /// When auto-detect is off: ASCII for everything (true) or binary.
    #[serde(default)]
    pub use_ascii_transfer_mode: bool,
    #[serde(default = "default_ascii_masks")]
    pub ascii_file_masks: Vec<String>,

    #[serde(default = "default_true")]
    pub use_passive_mode: bool,
    #[serde(default = "default_true")]
    pub use_listings_cache: bool,
    /// Below this size resume is replaced by overwrite (nothing to verify).
    #[serde(default = "default_resume_min")]
    pub resume_min_file_size: u64,

    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_buf_size")]
    pub buf_size: usize,
    #[serde(default = "default_retries")]
    pub max_retries: usize,
    /// Base delay before re-issuing a command after a transient 4xx; stray
    /// late replies settle in the meantime. Attempts back off linearly.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(skip)]
    pub mode: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_file_path: PathBuf::new(),
            version: Some(1),
            download_policies: PolicyTable::default(),
            upload_policies: PolicyTable::default(),
            auto_detect_transfer_mode: true,
            use_ascii_transfer_mode: false,
            ascii_file_masks: default_ascii_masks(),
            use_passive_mode: true,
            use_listings_cache: true,
            resume_min_file_size: default_resume_min(),
            workers: default_workers(),
            buf_size: default_buf_size(),
            max_retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            mode: 0,
        }
    }
}

impl Config {
    /// Decide transfer mode for a file name: Some(true) = ASCII. Returns the
    /// mode the engine should request before the server-side detection runs.
    pub fn ascii_mode_for(&self, name: &str) -> bool {
        if self.auto_detect_transfer_mode {
            self.ascii_file_masks.iter().any(|m| crate::util::wildcard_match(m, name))
        } else {
            self.use_ascii_transfer_mode
        }
    }

    pub fn init(mode: u8) -> Self {
        match dirs::home_dir() {
            Some(home_dir) => {
                let config_storage_dir = home_dir.join(".ftpilot");
                if !config_storage_dir.exists()
                    && let Err(e) = std::fs::create_dir_all(&config_storage_dir)
                {
                    eprintln!("⚠️ 无法创建配置目录 {}: {}", config_storage_dir.display(), e);
                    std::process::exit(1);
                }
                let server_db_path = config_storage_dir.join("server.db");
                let config_file_path = config_storage_dir.join("config.json");
                // 根据 mode 决定是否优先使用 test 配置文件（mode==1 表示 test 模式）
                let chosen_config = if mode == 1 {
                    let test_path = config_storage_dir.join("config_test.json");
                    if test_path.exists() { test_path } else { config_file_path.clone() }
                } else {
                    config_file_path.clone()
                };
                if !chosen_config.exists() {
                    let config = Config {
                        server_file_path: server_db_path,
                        mode,
                        ..Config::default()
                    };
                    config.save_to(&config_file_path);
                    return config;
                }
                let mut conf = Config::read_from(&chosen_config);
                conf.mode = mode;
                conf
            }
            None => {
                println!("Cannot find user's home dir");
                std::process::exit(1);
            }
        }
    }

    fn read_from(path: &Path) -> Config {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<Config>(&text) {
                Ok(conf) => conf,
                Err(e) => {
                    eprintln!("⚠️ 配置文件损坏，使用默认配置: {}", e);
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    fn save_to(&self, path: &Path) {
        if let Ok(text) = serde_json::to_string_pretty(self) {
            let _ = std::fs::write(path, text);
        }
    }

    /// 将配置保存回 $HOME/.ftpilot/config.json（mode==1 时写回 config_test.json）
    pub fn save_to_storage(&self) {
        if let Some(home_dir) = dirs::home_dir() {
            let config_storage_dir = home_dir.join(".ftpilot");
            let config_path = if self.mode == 1 {
                config_storage_dir.join("config_test.json")
            } else {
                config_storage_dir.join("config.json")
            };
            self.save_to(&config_path);
        } else {
            eprintln!("⚠️ 无法找到 home 目录，无法保存配置");
        }
    }

    /// Canonical directory for log files and failure lists.
    pub fn logs_dir(&self) -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".ftpilot").join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_detection_uses_mask_group() {
        let config = Config::default();
        assert!(config.ascii_mode_for("readme.txt"));
        assert!(!config.ascii_mode_for("archive.tar.gz"));
    }

    #[test]
    fn fixed_mode_ignores_masks() {
        let config = Config {
            auto_detect_transfer_mode: false,
            use_ascii_transfer_mode: true,
            ..Config::default()
        };
        assert!(config.ascii_mode_for("archive.tar.gz"));
    }

    #[test]
    fn policies_round_trip_through_json() {
        let mut config = Config::default();
        config.upload_policies.file_already_exists = FileExistsPolicy::AutoRename;
        config.download_policies.hidden_file_delete = HiddenDeletePolicy::Skip;
        let text = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.upload_policies.file_already_exists, FileExistsPolicy::AutoRename);
        assert_eq!(back.download_policies.hidden_file_delete, HiddenDeletePolicy::Skip);
        // Untouched fields keep their defaults.
        assert_eq!(back.upload_policies.dir_already_exists, DirExistsPolicy::UserPrompt);
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let back: Config =
            serde_json::from_str(r#"{"server_file_path":"/tmp/s.db","version":1}"#).unwrap();
        assert!(back.use_passive_mode);
        assert_eq!(back.workers, 4);
        assert_eq!(back.resume_min_file_size, 32 * 1024);
        assert_eq!(back.retry_delay_ms, 5000);
    }
}
