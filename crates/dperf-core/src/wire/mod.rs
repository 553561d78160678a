//! 线上格式：Ethernet II → IPv4 → UDP → 框架头 → 载荷。
//!
//! # 模块定位（Why）
//! - 数据面在预注册的缓冲区单元内就地读写报文头，偏移全部为编译期常量，
//!   解析与发射均为显式字节操作，不依赖内存布局重释（no transmute）；
//! - 框架头（[`frame::FrameworkHeader`]）是 UDP 与载荷之间的两字段头，
//!   分发器凭它查 RuleTable 完成 RX 分流。
//!
//! # 契约说明（What）
//! - 载荷为 ASCII `'a'` 重复填充、以 NUL 结尾；
//! - 单报文最大载荷受 [`MAX_WIRE_PAYLOAD`] 约束（MTU 扣除三层头与框架头）；
//! - 所有 `parse` 在长度不足时返回 `None`，发射侧长度由调用方保证。

pub mod arp;
pub mod eth;
pub mod frame;
pub mod ipv4;
pub mod udp;

pub use arp::ArpHdr;
pub use eth::{EthHdr, MacAddr};
pub use frame::FrameworkHeader;
pub use ipv4::Ipv4Hdr;
pub use udp::UdpHdr;

use crate::limits::MTU;

/// Ethernet II 头长度。
pub const ETH_HDR_LEN: usize = 14;
/// IPv4 头长度（IHL = 5）。
pub const IPV4_HDR_LEN: usize = 20;
/// UDP 头长度。
pub const UDP_HDR_LEN: usize = 8;
/// 框架头长度（workload_type: u8 + segment_num: u64）。
pub const FRAMEWORK_HDR_LEN: usize = 9;

/// IPv4 头在帧内的偏移。
pub const IPV4_OFFSET: usize = ETH_HDR_LEN;
/// UDP 头在帧内的偏移。
pub const UDP_OFFSET: usize = IPV4_OFFSET + IPV4_HDR_LEN;
/// 框架头在帧内的偏移。
pub const FRAMEWORK_OFFSET: usize = UDP_OFFSET + UDP_HDR_LEN;
/// 载荷在帧内的偏移。
pub const PAYLOAD_OFFSET: usize = FRAMEWORK_OFFSET + FRAMEWORK_HDR_LEN;
/// 全部头部的总长度。
pub const TOTAL_HEADER_LEN: usize = PAYLOAD_OFFSET;

/// 单报文线上载荷上限：MTU 扣除 IPv4/UDP/框架头。
/// 消息分片以此为切割单位，满载分片的 IPv4 数据报恰为一个 MTU。
pub const MAX_WIRE_PAYLOAD: usize = MTU - IPV4_HDR_LEN - UDP_HDR_LEN - FRAMEWORK_HDR_LEN;
