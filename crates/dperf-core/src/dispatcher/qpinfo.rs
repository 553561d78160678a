//! 带外交换的 QP 元信息编解码。
//!
//! # 契约说明（What）
//! - 每个 RoCE 分发器在启动期与对端交换一行 `key:value;key:value;…` 文本，
//!   字段包含 `qp_num`、`lid`、`gid`（逗号分隔的 16 字节）、`gid_table_index`、
//!   `mac`（点分十六进制）、`mtu`、`hostname`、`nic_name`、`is_initialized`；
//! - 序列化后再解析必须得到逐字段相同的结构（握手两端对等）。

use crate::error::{DperfError, Result};
use crate::wire::MacAddr;

/// QP 元信息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QpInfo {
    /// 队列对编号。
    pub qp_num: u32,
    /// 端口 LID（0 为无效）。
    pub lid: u16,
    /// GID（RoCE 使用）。
    pub gid: [u8; 16],
    /// GID 表索引。
    pub gid_table_index: u8,
    /// MTU。
    pub mtu: u32,
    /// 端口 MAC。
    pub mac: MacAddr,
    /// 主机名。
    pub hostname: String,
    /// 网卡名（如 `rdma0`）。
    pub nic_name: String,
    /// 对端初始化完成标记。
    pub is_initialized: bool,
}

impl QpInfo {
    /// 序列化为握手行。
    pub fn serialize(&self) -> String {
        let gid = self
            .gid
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mac = self
            .mac
            .0
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(".");
        format!(
            "qp_num:{};lid:{};gid:{};gid_table_index:{};mac:{};mtu:{};hostname:{};nic_name:{};is_initialized:{};",
            self.qp_num,
            self.lid,
            gid,
            self.gid_table_index,
            mac,
            self.mtu,
            self.hostname,
            self.nic_name,
            u8::from(self.is_initialized),
        )
    }

    /// 从握手行解析。
    pub fn deserialize(line: &str) -> Result<Self> {
        let mut info = Self {
            qp_num: 0,
            lid: 0,
            gid: [0; 16],
            gid_table_index: 0,
            mtu: 0,
            mac: MacAddr::ZERO,
            hostname: String::new(),
            nic_name: String::new(),
            is_initialized: false,
        };
        for field in line.trim().split(';') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let (key, value) = field.split_once(':').ok_or_else(|| {
                DperfError::PeerLost {
                    reason: format!("QP 元信息字段缺少冒号: {field}"),
                }
            })?;
            match key {
                "qp_num" => info.qp_num = parse(key, value)?,
                "lid" => info.lid = parse(key, value)?,
                "gid" => {
                    let bytes: Vec<u8> = value
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(|s| parse(key, s))
                        .collect::<Result<_>>()?;
                    if bytes.len() != 16 {
                        return Err(DperfError::PeerLost {
                            reason: format!("GID 需要 16 字节，得到 {}", bytes.len()),
                        });
                    }
                    info.gid.copy_from_slice(&bytes);
                }
                "gid_table_index" => info.gid_table_index = parse(key, value)?,
                "mac" => info.mac = MacAddr::parse(value)?,
                "mtu" => info.mtu = parse(key, value)?,
                "hostname" => info.hostname = value.to_string(),
                "nic_name" => info.nic_name = value.to_string(),
                "is_initialized" => info.is_initialized = parse::<u8>(key, value)? != 0,
                other => {
                    return Err(DperfError::PeerLost {
                        reason: format!("QP 元信息含未知字段 {other}"),
                    });
                }
            }
        }
        Ok(info)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| DperfError::PeerLost {
        reason: format!("QP 元信息字段 {key} 的取值 {value} 不合法"),
    })
}
