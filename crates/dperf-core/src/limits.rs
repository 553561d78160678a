//! 框架级编译期常量。
//!
//! 所有数值来自基准框架的既定工况：环与队列深度必须是二的幂，
//! 以便数据面仅用掩码运算推进索引；批大小上限 [`MAX_BATCH`] 约束全部
//! 可调参数（见 `config`）。

use crate::pipeline::PhaseKind;

/// 单进程可承载的工作空间（逐核心执行器）上限。
pub const MAX_WORKSPACES: usize = 16;

/// 无效工作空间 id 哨兵值。
pub const INVALID_WS_ID: u8 = MAX_WORKSPACES as u8 + 1;

/// 单进程可见的物理端口上限。
pub const MAX_PHY_PORTS: usize = 2;

/// NUMA 节点上限。
pub const MAX_NUMA_NODES: usize = 2;

/// 每物理端口的 NIC 队列对槽位数。
pub const MAX_QUEUES_PER_PORT: usize = 4;

/// 应用与分发器之间 SPSC 环的默认容量（二的幂）。
pub const WS_RING_CAP: usize = 4096;

/// 全部批大小类可调参数的上限。
pub const MAX_BATCH: usize = 512;

/// 分发器 TX 暂存区容量。
pub const TX_RING_ENTRIES: usize = 2048;

/// NIC 接收环 / 接收队列深度。
pub const RQ_DEPTH: usize = 2048;

/// NIC 发送队列深度。
pub const SQ_DEPTH: usize = 2048;

/// 每个分发器内存池的缓冲区数量。
pub const MEMPOOL_SIZE: usize = 8192;

/// 缓冲区单元（mbuf）字节数。
pub const MBUF_SIZE: usize = 4096;

/// 数据面 MTU（二的幂）。单包线上载荷上限与消息分片单位由它
/// 扣除三层头与框架头得出（见 [`crate::wire::MAX_WIRE_PAYLOAD`]）。
pub const MTU: usize = 1024;

/// UDP 基准端口：目的端口 = `BASE_UDP_PORT + ws_id`。
pub const BASE_UDP_PORT: u16 = 10010;

/// RoCE 带外管理连接的基准端口：监听端口 = `BASE_MGNT_PORT + ws_id`。
pub const BASE_MGNT_PORT: u16 = 18515;

/// 每个工作负载的在途消息预算。
pub const MAX_INFLY: u64 = 8192;

/// UD 报文前部的 GRH 预留字节数（verbs 布局约定，回环 fabric 不占用）。
pub const GRH_BYTES: usize = 40;

/// UD QP 的队列键。握手阶段理应协商安全的 Q_Key，当前取
/// CX3 保留区（0xffff0000..0xffffffff）之外的固定值。
pub const UD_QKEY: u32 = 0x0205;

/// send WR 可内联的最大字节数。
pub const MAX_INLINE: usize = 60;

/// 每报文触达的外部内存范围（M-APP 模拟负载）。
pub const MEM_ACCESS_RANGE_PER_PKT: usize = 1024;

/// 逐核心的有状态内存区大小（模拟负载的外部状态）。
pub const STATEFUL_MEMORY_PER_CORE: usize = 4 * 1024 * 1024;

/// 单阶段隔离测量开关：`Some(phase)` 时流水线合成器只保留该阶段的
/// 步骤函数（含 TxDisp/RxDisp 的拼接规则，见 `pipeline`）。
pub const ONE_STAGE: Option<PhaseKind> = None;

const _: () = assert!(WS_RING_CAP.is_power_of_two());
const _: () = assert!(RQ_DEPTH.is_power_of_two());
const _: () = assert!(SQ_DEPTH.is_power_of_two());
const _: () = assert!(MTU.is_power_of_two());
