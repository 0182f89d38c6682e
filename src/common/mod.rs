//! 公共组件
//! 错误类型与运行统计

pub mod error;
pub mod stats;
