//! 引擎設定
//!
//! 設定檔位於 `<config_dir>/mudcore/config.json`。每個欄位都有預設值，
//! 只寫部分欄位的設定檔也能正常載入；檔案不存在或格式錯誤時使用預設值。

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::timer::CatchUp;

/// 設定檔錯誤
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("設定檔讀寫失敗: {0}")]
    Io(#[from] io::Error),

    #[error("設定檔格式錯誤: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// 設定結構
// ============================================================================

/// 引擎設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 錯誤次數超過此值即停止引擎
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// 每個 session 的回捲行數
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub net: NetConfig,
    #[serde(default)]
    pub template: TemplateConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            scrollback_lines: default_scrollback_lines(),
            timer: TimerConfig::default(),
            net: NetConfig::default(),
            template: TemplateConfig::default(),
        }
    }
}

/// 計時器設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// 落後超過此秒數時套用追趕策略
    #[serde(default = "default_max_lag_ticks")]
    pub max_lag_ticks: u64,
    #[serde(default)]
    pub catch_up: CatchUp,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            max_lag_ticks: default_max_lag_ticks(),
            catch_up: CatchUp::default(),
        }
    }
}

/// 網路設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// 沒有換行的片段等待多久後送出（毫秒）
    #[serde(default = "default_prompt_flush_ms")]
    pub prompt_flush_ms: u64,
    /// 伺服器使用 GA/EOR 後的等待時間（毫秒）
    #[serde(default = "default_delimited_prompt_flush_ms")]
    pub delimited_prompt_flush_ms: u64,
    /// 回覆 TERMTYPE 時使用的名稱
    #[serde(default = "default_terminal_type")]
    pub terminal_type: String,
}

impl NetConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn prompt_flush(&self) -> Duration {
        Duration::from_millis(self.prompt_flush_ms)
    }

    pub fn delimited_prompt_flush(&self) -> Duration {
        Duration::from_millis(self.delimited_prompt_flush_ms)
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            read_buffer_size: default_read_buffer_size(),
            prompt_flush_ms: default_prompt_flush_ms(),
            delimited_prompt_flush_ms: default_delimited_prompt_flush_ms(),
            terminal_type: default_terminal_type(),
        }
    }
}

/// 範本 session 設定，新 session 都從這裡複製
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default = "default_template_name")]
    pub name: String,
    /// 編碼名稱，例如 `utf-8`、`big5`
    #[serde(default = "default_charset")]
    pub charset: String,
    /// 非目前 session 的輸出是否也顯示
    #[serde(default)]
    pub snoop: bool,
    /// 使用者輸入是否略過命令解析
    #[serde(default)]
    pub verbatim: bool,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            name: default_template_name(),
            charset: default_charset(),
            snoop: false,
            verbatim: false,
            variables: HashMap::new(),
        }
    }
}

fn default_error_threshold() -> u32 {
    20
}

fn default_scrollback_lines() -> usize {
    10_000
}

fn default_max_lag_ticks() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_read_buffer_size() -> usize {
    8192
}

fn default_prompt_flush_ms() -> u64 {
    100
}

fn default_delimited_prompt_flush_ms() -> u64 {
    1000
}

fn default_terminal_type() -> String {
    "mudcore".to_string()
}

fn default_template_name() -> String {
    "common".to_string()
}

fn default_charset() -> String {
    "utf-8".to_string()
}

// ============================================================================
// 載入與儲存
// ============================================================================

impl EngineConfig {
    /// 預設設定檔路徑
    pub fn config_path() -> PathBuf {
        config_dir().join("config.json")
    }

    /// 從預設路徑載入，失敗時使用預設值
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            debug!("設定檔不存在，使用預設值: {}", path.display());
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("無法載入設定檔 {}: {}，使用預設值", path.display(), e);
                Self::default()
            }
        }
    }

    /// 從指定路徑載入
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// 儲存到預設路徑
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        ensure_parent_dir(path)?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// 獲取設定目錄
pub fn config_dir() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        config_dir.join("mudcore")
    } else {
        PathBuf::from(".")
    }
}

/// 確保目錄存在
fn ensure_parent_dir(path: &Path) -> Result<(), io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.error_threshold, 20);
        assert_eq!(config.scrollback_lines, 10_000);
        assert_eq!(config.timer.max_lag_ticks, 10);
        assert_eq!(config.timer.catch_up, CatchUp::DropToWindow);
        assert_eq!(config.net.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.net.prompt_flush(), Duration::from_millis(100));
        assert_eq!(config.template.name, "common");
        assert_eq!(config.template.charset, "utf-8");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{ "error_threshold": 5, "timer": { "catch_up": "drop_all" }, "template": { "snoop": true } }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.error_threshold, 5);
        assert_eq!(config.timer.catch_up, CatchUp::DropAll);
        assert_eq!(config.timer.max_lag_ticks, 10);
        assert!(config.template.snoop);
        assert_eq!(config.template.name, "common");
        assert_eq!(config.net, NetConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("mudcore-config-test-{}", std::process::id()));
        let path = dir.join("nested").join("config.json");

        let mut config = EngineConfig::default();
        config.net.terminal_type = "xterm".to_string();
        config
            .template
            .variables
            .insert("name".to_string(), "guest".to_string());
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = std::env::temp_dir().join(format!("mudcore-config-bad-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            EngineConfig::load_from(&path),
            Err(ConfigError::Json(_))
        ));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_config_path() {
        let path = EngineConfig::config_path();
        assert!(path.ends_with("config.json"));
        assert!(path.starts_with(config_dir()));
    }
}
