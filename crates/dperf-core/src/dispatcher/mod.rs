//! 分发器抽象与两种后端实现。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 分发器是工作空间的 NIC 半体：独占一条队列对，把 Worker TX 环里的报文
//!   收集、盖章、成批发射，并把 NIC 完成按框架头分流回 Worker RX 环；
//! - 后端多态收敛为窄接口 [`Dispatcher`] 与两个
//!   具体实现：[`dpdk::DpdkDispatcher`]（以太网/UDP 形态）与
//!   [`roce::RoceDispatcher`]（RoCE-UD 形态），构建期选择其一。
//!
//! ## 硬件触点（How）
//! - 驱动触达收敛在 [`nic::NicDriver`] 窄接口（帧收发、流规则、端口身份），
//!   仓内自带进程内回环 fabric 作为驱动实现，流规则分类、ARP 注入与
//!   UD 寻址均可在无硬件环境下运转；
//! - 两个后端承载全部驱动面逻辑：内存池命名与占用核算、三条流规则、
//!   ARP 应答构造、WR 环记账、QP 状态机与带外元信息交换。
//!
//! ## 契约（What）
//! - 批大小参数（`disp_tx_batch` / `disp_rx_batch` / `nic_tx_post` /
//!   `nic_rx_post`）由配置安装且不超过
//!   [`MAX_BATCH`](crate::limits::MAX_BATCH)；
//! - `tx_flush` 迭代到 NIC 接受全部暂存帧为止；
//! - `dispatch_rx` 对环满逐包释放并计一次分发器丢弃（不中断本批其余报文）。

pub mod dpdk;
pub mod mgnt;
pub mod nic;
pub mod qpinfo;
pub mod roce;

use std::sync::Arc;

use crate::buffer::{BufId, BufferArena, MemReg};
use crate::limits::{BASE_UDP_PORT, MEMPOOL_SIZE};
use crate::ring::WsRing;
use crate::wire::eth::ETHERTYPE_IPV4;
use crate::wire::{
    ETH_HDR_LEN, EthHdr, IPV4_HDR_LEN, IPV4_OFFSET, Ipv4Hdr, MacAddr, UDP_OFFSET, UdpHdr,
};

/// 一次 RX 分流的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// 成功入 Worker RX 环的报文数。
    pub dispatched: usize,
    /// 因环满（或池耗尽、报文畸形）释放的报文数。
    pub dropped: usize,
}

/// 分发器窄接口。
///
/// 方法均在分发器所属线程上调用（数据面单线程），`&mut self` 即足够。
pub trait Dispatcher: Send {
    /// 轮询收集各 Worker TX 环并盖章入暂存区，返回收集数。
    fn collect_tx(&mut self) -> usize;

    /// 把暂存区全部发射给 NIC（迭代到全部被接受），返回发射数。
    fn tx_flush(&mut self) -> usize;

    /// 轮询 NIC 完成进 RX 暂存，返回新到报文数。
    fn rx_burst(&mut self) -> usize;

    /// 按 RuleTable 把 RX 暂存分流到 Worker RX 环。
    fn dispatch_rx(&mut self) -> DispatchOutcome;

    /// 注册一个 Worker 的 TX 环。
    fn add_ws_tx_ring(&mut self, ring: Arc<WsRing>);

    /// 注册一个 Worker 的 RX 环。
    fn add_ws_rx_ring(&mut self, ws_id: u8, ring: Arc<WsRing>);

    /// 安装一条 RX 分流规则。
    fn add_rx_rule(&mut self, workload_type: u8, ws_id: u8);

    /// 内存注册描述符（Worker 经由它触碰本分发器的池）。
    fn mem_reg(&self) -> MemReg;

    /// TX 暂存区当前长度。
    fn tx_staging_len(&self) -> usize;

    /// RX 暂存区当前长度。
    fn rx_staging_len(&self) -> usize;

    /// 池内已离开自由链表的单元数（诊断采样）。
    fn used_buf_count(&self) -> usize;

    /// NIC 侧尚未收割的接收描述符数。
    fn rx_used_desc(&self) -> usize;

    /// NIC 发射阈值（`nic_tx` 步骤据此判断是否 flush）。
    fn nic_tx_post(&self) -> u16;

    /// 池容量（用量占比的分母）。
    fn pool_size(&self) -> usize {
        MEMPOOL_SIZE
    }

    /// NIC 接收环深度。
    fn rx_ring_entries(&self) -> usize {
        crate::limits::RQ_DEPTH
    }
}

/// 发射路径的三层头盖章：补齐以太/IPv4 头，把应用半写的 UDP 端口
/// （裸 ws_id）加上基准端口并写入长度字段。
pub(crate) fn stamp_headers(
    arena: &BufferArena,
    id: BufId,
    src_mac: MacAddr,
    dst_mac: MacAddr,
    saddr: u32,
    daddr: u32,
) {
    let len = arena.len(id);
    // SAFETY: 该单元刚从 Worker TX 环出队，分发器是唯一属主。
    let cell = unsafe { arena.bytes_mut(id) };
    EthHdr {
        dst: dst_mac,
        src: src_mac,
        ethertype: ETHERTYPE_IPV4,
    }
    .write_to(cell);
    Ipv4Hdr::for_udp((len - ETH_HDR_LEN) as u16, saddr, daddr).write_to(&mut cell[IPV4_OFFSET..]);
    let udp = UdpHdr::parse(&cell[UDP_OFFSET..]).expect("单元长度恒为 MBUF_SIZE，UDP 区必在");
    UdpHdr {
        source: udp.source + BASE_UDP_PORT,
        dest: udp.dest + BASE_UDP_PORT,
        len: (len - ETH_HDR_LEN - IPV4_HDR_LEN) as u16,
    }
    .write_to(&mut cell[UDP_OFFSET..]);
}
