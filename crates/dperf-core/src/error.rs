//! `dperf` 统一错误域。
//!
//! # 模块定位（Why）
//! - 第一道屏障之前的初始化路径（配置解析、QP 预留、大页内存、端口解析、
//!   带外握手）全部以类型化错误上抛到入口处，由入口统一打印诊断并以
//!   非零码退出；
//! - 循环启动后数据面唯一可能的异常是背压丢弃，它**不是**错误：
//!   丢弃只进入计数器（见 `stats`），环与内存池接口以 `bool`/`Option`
//!   表达，不经过本模块。
//!
//! # 契约说明（What）
//! - 错误消息单行可读，面向 stderr 诊断；变体字段保留定位所需的最小上下文；
//! - `NicFatal` 同时覆盖驱动返回失败、端口 down、PID 复用检出等
//!   "继续运行没有意义" 的情形。

use thiserror::Error;

/// `dperf` 的统一 `Result` 别名。
pub type Result<T, E = DperfError> = core::result::Result<T, E>;

/// 初始化与控制面错误分类。
#[derive(Debug, Error)]
pub enum DperfError {
    /// 配置格式错误、重复的 ws_id 指派或越界的可调参数。
    #[error("配置无效: {reason}")]
    Config {
        /// 人类可读的失败原因。
        reason: String,
    },

    /// QP 槽位耗尽、内存池过小或内存注册失败。
    #[error("资源耗尽: {reason}")]
    ResourceExhausted {
        /// 人类可读的失败原因。
        reason: String,
    },

    /// 驱动返回失败、端口不可用或属主表检出 PID 复用。
    #[error("NIC 致命错误: {reason}")]
    NicFatal {
        /// 人类可读的失败原因。
        reason: String,
    },

    /// 带外握手连接被对端意外关闭（仅初始化阶段可能出现）。
    #[error("对端丢失: {reason}")]
    PeerLost {
        /// 人类可读的失败原因。
        reason: String,
    },

    /// 带外握手超出实现定义的时限仍未完成。
    #[error("握手超时: {reason}")]
    HandshakeTimeout {
        /// 人类可读的失败原因。
        reason: String,
    },
}

impl DperfError {
    /// 便捷构造：配置错误。
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// 便捷构造：资源耗尽。
    pub fn exhausted(reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            reason: reason.into(),
        }
    }

    /// 便捷构造：NIC 致命错误。
    pub fn nic_fatal(reason: impl Into<String>) -> Self {
        Self::NicFatal {
            reason: reason.into(),
        }
    }
}
