//! 错误处理模块
//! 定义反应器各层的统一错误类型与转换机制

use std::io::Error as IoError;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// 全局错误类型
#[derive(Debug, Error)]
pub enum IoLoopError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 缓冲区错误
    #[error("缓冲区错误: {0}")]
    Buffer(#[from] BufferError),

    /// 帧编解码错误
    #[error("帧编解码错误: {0}")]
    Framing(#[from] FramingError),

    /// 连接错误
    #[error("连接错误: {0}")]
    Connection(#[from] ConnectionError),

    /// 多路复用后端错误
    #[error("后端错误: {0}")]
    Backend(#[from] BackendError),

    /// 任务提交失败
    #[error("任务错误: {0}")]
    Task(#[from] TaskError),

    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] IoError),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 解析错误
    #[error("配置解析错误: {0}")]
    ParseError(String),

    /// 无效值
    #[error("配置值无效: {0}")]
    InvalidValue(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::ParseError(e.to_string())
    }
}

/// 缓冲区错误，属于编程缺陷，调用方应当直接暴露
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// 越界访问
    #[error("越界访问: index={index}, len={len}, limit={limit}")]
    OutOfRange {
        /// 访问起点（相对 position 或绝对下标）
        index: usize,
        /// 访问长度
        len: usize,
        /// 当前上限
        limit: usize,
    },

    /// 缓冲区不支持扩容
    #[error("缓冲区不支持扩容: capacity={capacity}, wanted={wanted}")]
    ExpansionNotSupported {
        /// 当前容量
        capacity: usize,
        /// 需要的容量
        wanted: usize,
    },

    /// 已释放的缓冲区被再次释放或访问
    #[error("缓冲区已释放")]
    AlreadyReleased,

    /// 游标设置非法
    #[error("游标非法: {0}")]
    InvalidCursor(String),
}

/// 帧编解码错误，会关闭所属通道
#[derive(Debug, Error)]
pub enum FramingError {
    /// 数据格式错误
    #[error("数据格式错误: {0}")]
    Malformed(String),

    /// 帧超过长度上限
    #[error("帧长度 {len} 超过上限 {max}")]
    Oversized {
        /// 帧声明的长度
        len: usize,
        /// 允许的最大长度
        max: usize,
    },

    /// 编解码过程中的缓冲区错误
    #[error("缓冲区错误: {0}")]
    Buffer(#[from] BufferError),
}

/// 连接错误，经由接入器/连接器回调送达应用，不影响事件循环
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// 连接超时
    #[error("连接 {addr} 超时 ({timeout:?})")]
    ConnectTimeout {
        /// 目标地址
        addr: SocketAddr,
        /// 超时时间
        timeout: Duration,
    },

    /// 连接失败
    #[error("连接 {addr} 失败: {source}")]
    ConnectFailed {
        /// 目标地址
        addr: SocketAddr,
        /// 底层错误
        #[source]
        source: IoError,
    },

    /// 地址解析失败
    #[error("无法解析地址: {0}")]
    Resolve(String),

    /// 超出单个事件循环的通道数上限
    #[error("通道数已达上限: {0}")]
    ChannelLimitExceeded(usize),

    /// 注册到多路复用后端失败
    #[error("后端注册失败: {0}")]
    Registration(#[source] IoError),

    /// 写队列已满
    #[error("写队列已满: {0}")]
    WriteQueueFull(usize),

    /// 通道已关闭
    #[error("通道已关闭")]
    Closed,

    /// 事件循环已停止
    #[error("事件循环已停止")]
    LoopStopped,

    /// 读写过程中的IO错误
    #[error("IO错误: {0}")]
    Io(#[from] IoError),

    /// 编解码失败
    #[error("编解码失败: {0}")]
    Framing(#[from] FramingError),

    /// 读写队列中的缓冲区错误
    #[error("缓冲区错误: {0}")]
    Buffer(#[from] BufferError),
}

/// 多路复用后端错误
#[derive(Debug, Error)]
pub enum BackendError {
    /// 后端句柄创建失败（进程级资源耗尽，启动阶段致命）
    #[error("无法创建{kind}后端: {source}")]
    Open {
        /// 后端类型
        kind: &'static str,
        /// 底层错误
        #[source]
        source: IoError,
    },

    /// 等待就绪事件失败（记录后继续循环）
    #[error("等待就绪事件失败: {0}")]
    Wait(#[source] IoError),

    /// 唤醒失败
    #[error("唤醒事件循环失败: {0}")]
    Wake(#[source] IoError),
}

/// 任务执行错误，只记录不传播
#[derive(Debug, Error)]
pub enum TaskError {
    /// 任务发生 panic
    #[error("任务 panic: {0}")]
    Panicked(String),

    /// 事件循环已停止，任务被拒绝
    #[error("事件循环已停止，任务被拒绝")]
    Rejected,
}

impl TaskError {
    /// 从 `catch_unwind` 的载荷中提取描述
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        TaskError::Panicked(msg)
    }
}

/// 简化错误类型定义
pub type Result<T> = std::result::Result<T, IoLoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_to_task_error() {
        let err = TaskError::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "任务 panic: boom");

        let err = TaskError::from_panic(Box::new(String::from("owned")));
        assert!(matches!(err, TaskError::Panicked(ref m) if m == "owned"));
    }

    #[test]
    fn test_error_conversion() {
        let err: IoLoopError = BufferError::AlreadyReleased.into();
        assert!(matches!(err, IoLoopError::Buffer(BufferError::AlreadyReleased)));

        let err: FramingError = BufferError::AlreadyReleased.into();
        assert!(err.to_string().contains("已释放"));
    }
}
