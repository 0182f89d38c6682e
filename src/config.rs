//! 配置管理模块
//! 加载并解析反应器配置，支持TOML/YAML格式与环境变量覆盖

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::error::ConfigError;

/// 全局配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// 服务绑定地址
    pub bind_addr: SocketAddr,

    /// 事件循环配置
    pub event_loop: EventLoopConfig,

    /// 缓冲区配置
    pub buffer: BufferConfig,

    /// 日志配置
    pub log: LogConfig,
}

/// 多路复用后端选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 优先使用内核原生通知机制，不可用时回退到 poll
    Auto,
    /// 内核原生通知机制（epoll/kqueue）
    Native,
    /// 可移植的 poll(2) 选择器
    Portable,
}

/// 事件循环配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// 工作线程（事件循环）数量
    pub threads: usize,

    /// 后端选择
    pub backend: BackendKind,

    /// 单个事件循环的通道数上限
    pub channel_size_limit: usize,

    /// 空闲检测周期(毫秒)
    pub idle_time_ms: u64,

    /// 单次聚合写出的缓冲区数量，最多64
    pub write_buffers: usize,

    /// 写队列上限，超出后拒绝写入
    pub max_write_queue: usize,

    /// 同时可读可写时先处理读事件
    pub channel_read_first: bool,

    /// 连接超时(毫秒)
    pub connect_timeout_ms: u64,

    /// 单帧最大长度
    pub max_frame_length: usize,
}

/// 缓冲区配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// 每次读取的块大小
    pub read_buffer_size: usize,

    /// 写入空间不足时是否自动扩容
    pub auto_expansion: bool,

    /// 是否启用缓冲池
    pub pooled: bool,

    /// 是否使用直接内存（页对齐）
    pub direct: bool,

    /// 最小尺寸级别
    pub unit_size: usize,

    /// 最大尺寸级别，超出部分不入池
    pub max_class_size: usize,

    /// 每个尺寸级别最多缓存的空闲块数
    pub max_per_class: usize,

    /// 缓冲池最多占用的内存
    pub max_pool_memory: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 日志级别
    pub level: String,

    /// 日志文件路径
    pub file_path: Option<PathBuf>,

    /// 统计快照输出间隔(秒)，0 表示不输出
    pub stats_interval_secs: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8300)),
            event_loop: EventLoopConfig::default(),
            buffer: BufferConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            backend: BackendKind::Auto,
            channel_size_limit: 1024 * 64,
            idle_time_ms: 30_000,
            write_buffers: 16,
            max_write_queue: 1024 * 16,
            channel_read_first: true,
            connect_timeout_ms: 3_000,
            max_frame_length: 1024 * 1024 * 4,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024 * 512,
            auto_expansion: true,
            pooled: true,
            direct: false,
            unit_size: 256,
            max_class_size: 1024 * 64,
            max_per_class: 256,
            max_pool_memory: 1024 * 1024 * 64,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            stats_interval_secs: 60,
        }
    }
}

impl EventLoopConfig {
    /// 空闲检测周期
    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.idle_time_ms)
    }

    /// 默认连接超时
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl IoConfig {
    /// 校验取值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        let el = &self.event_loop;
        let buf = &self.buffer;
        if el.threads == 0 {
            return Err(ConfigError::InvalidValue("event_loop.threads 必须大于0".into()));
        }
        if el.idle_time_ms == 0 {
            return Err(ConfigError::InvalidValue("event_loop.idle_time_ms 必须大于0".into()));
        }
        if el.write_buffers == 0 {
            return Err(ConfigError::InvalidValue("event_loop.write_buffers 必须大于0".into()));
        }
        if el.max_frame_length == 0 || el.max_frame_length > i32::MAX as usize {
            return Err(ConfigError::InvalidValue(format!(
                "event_loop.max_frame_length={} 必须在 1..={} 之间",
                el.max_frame_length,
                i32::MAX
            )));
        }
        if buf.read_buffer_size == 0 {
            return Err(ConfigError::InvalidValue("buffer.read_buffer_size 必须大于0".into()));
        }
        if !buf.unit_size.is_power_of_two() || buf.max_class_size < buf.unit_size {
            return Err(ConfigError::InvalidValue(format!(
                "buffer.unit_size={} 必须是2的幂且不大于 max_class_size={}",
                buf.unit_size, buf.max_class_size
            )));
        }
        Ok(())
    }
}

/// 以追加方式打开日志文件，缺失的父目录一并创建
pub fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// 加载配置文件
pub fn load(config_path: &str) -> Result<IoConfig, ConfigError> {
    let config: IoConfig = Config::builder()
        // 从文件加载基础配置
        .add_source(File::with_name(config_path))
        // 从环境变量覆盖配置 (IOLOOP__前缀)
        .add_source(Environment::with_prefix("IOLOOP").separator("__"))
        .build()?
        .try_deserialize()?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IoConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8300".parse().unwrap());
        assert_eq!(config.event_loop.backend, BackendKind::Auto);
        assert!(config.event_loop.threads >= 1);
        assert!(config.buffer.pooled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_loading() {
        let toml_content = r#"
bind_addr = "127.0.0.1:9000"

[event_loop]
threads = 3
backend = "portable"
idle_time_ms = 500
channel_read_first = false

[buffer]
pooled = false
direct = true

[log]
level = "debug"
"#;

        let temp_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        std::fs::write(temp_file.path(), toml_content).unwrap();
        let path = temp_file.path().to_str().unwrap();

        let config = load(path).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.event_loop.threads, 3);
        assert_eq!(config.event_loop.backend, BackendKind::Portable);
        assert_eq!(config.event_loop.idle_time(), Duration::from_millis(500));
        assert!(!config.event_loop.channel_read_first);
        assert!(!config.buffer.pooled);
        assert!(config.buffer.direct);
        // 未出现的字段保持默认值
        assert_eq!(config.buffer.unit_size, 256);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        std::fs::write(temp_file.path(), "[buffer]\nunit_size = 300\n").unwrap();
        let err = load(temp_file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_frame_length_must_fit_length_header() {
        let mut config = IoConfig::default();
        config.event_loop.max_frame_length = i32::MAX as usize;
        assert!(config.validate().is_ok());
        config.event_loop.max_frame_length = i32::MAX as usize + 1;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
        config.event_loop.max_frame_length = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_log_file_appended_under_new_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("ioloop.log");
        for line in ["first\n", "second\n"] {
            let mut file = open_log_file(&path).unwrap();
            std::io::Write::write_all(&mut file, line.as_bytes()).unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
