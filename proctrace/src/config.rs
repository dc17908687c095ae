use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

// 顶层配置结构体，所有字段都可省略

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_directory: Option<PathBuf>,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub output: OutputMode,
    /// tracefs 挂载点；不填时依次尝试 /sys/kernel/tracing 和 /sys/kernel/debug/tracing
    #[serde(default)]
    pub tracefs_root: Option<PathBuf>,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// One line per event
    #[default]
    Lines,
    /// One JSON object per event
    Json,
    /// Live process tree, redrawn periodically
    Tree,
    /// No event output (forwarding and statistics only)
    Quiet,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    #[serde(default = "default_exec_buffer_bytes")]
    pub exec_buffer_bytes: u32,
    #[serde(default = "default_small_buffer_bytes")]
    pub fork_buffer_bytes: u32,
    #[serde(default = "default_small_buffer_bytes")]
    pub exit_buffer_bytes: u32,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// 进程内事件总线容量，订阅者落后时最旧的事件被覆盖
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TreeConfig {
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    #[serde(default = "default_render_interval_ms")]
    pub render_interval_ms: u64,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardConfig {
    /// JSON-lines 收集端的 host:port，未设置时不转发
    #[serde(default)]
    pub address: Option<String>,
}

const PAGE_SIZE: u32 = 4096;

fn default_exec_buffer_bytes() -> u32 {
    256 * 1024
}
fn default_small_buffer_bytes() -> u32 {
    128 * 1024
}
fn default_stats_interval_secs() -> u64 {
    5
}
fn default_bus_capacity() -> usize {
    1024
}
fn default_history_len() -> usize {
    5
}
fn default_render_interval_ms() -> u64 {
    500
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            exec_buffer_bytes: default_exec_buffer_bytes(),
            fork_buffer_bytes: default_small_buffer_bytes(),
            exit_buffer_bytes: default_small_buffer_bytes(),
            stats_interval_secs: default_stats_interval_secs(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            history_len: default_history_len(),
            render_interval_ms: default_render_interval_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            log_directory: None,
            log_format: LogFormat::default(),
            output: OutputMode::default(),
            tracefs_root: None,
            transport: TransportConfig::default(),
            tree: TreeConfig::default(),
            forward: ForwardConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn buffer_bytes(&self, kind: proctrace_common::ChannelKind) -> u32 {
        use proctrace_common::ChannelKind;
        match kind {
            ChannelKind::Exec => self.exec_buffer_bytes,
            ChannelKind::Fork => self.fork_buffer_bytes,
            ChannelKind::Exit => self.exit_buffer_bytes,
        }
    }
}

impl AppConfig {
    pub fn load_from_file(config_file_path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let config_content = fs::read_to_string(config_file_path)?;
        let loaded_config: AppConfig = serde_yaml::from_str(&config_content)?;
        loaded_config.validate()?;
        Ok(loaded_config)
    }

    pub fn validate(&self) -> Result<(), String> {
        // BPF ring buffer 要求大小是页大小的 2 的幂倍
        for kind in proctrace_common::ChannelKind::ALL {
            let size = self.transport.buffer_bytes(kind);
            if size < PAGE_SIZE || !size.is_power_of_two() {
                return Err(format!(
                    "transport.{}_buffer_bytes must be a power of two and at least {} (got {})",
                    kind.as_str(),
                    PAGE_SIZE,
                    size
                ));
            }
        }
        if self.transport.stats_interval_secs == 0 {
            return Err("transport.stats_interval_secs must be greater than 0".to_string());
        }
        if self.transport.bus_capacity == 0 {
            return Err("transport.bus_capacity must be greater than 0".to_string());
        }
        if self.tree.render_interval_ms == 0 {
            return Err("tree.render_interval_ms must be greater than 0".to_string());
        }
        if let Some(address) = &self.forward.address {
            if !address.contains(':') {
                return Err(format!(
                    "forward.address must be host:port (got '{}')",
                    address
                ));
            }
        }
        Ok(())
    }
}
