//! NIC 驱动窄接口与进程内回环 fabric。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 把驱动触达压缩到最小面：帧收发、流规则装卸、UD 寻址、端口身份。
//!   数据面的全部协议逻辑（盖章、分流、记账）留在分发器里，驱动只负责
//!   "把字节搬上线/从线上搬下来"；
//! - 回环 fabric 在进程内接线两个（或同一个）端口，按已装流规则分类投递，
//!   并保留发出帧的捕获日志，使流规则、ARP 与 UD 路径在无硬件环境下可测。
//!
//! ## 行为（How）
//! - 以太路径：`tx_burst` 把帧记入发送端口的捕获日志，再投递到对端端口，
//!   按对端流规则（装载顺序）分类落队列；无规则命中即丢弃（NIC 默认行为）；
//! - UD 路径：`tx_ud` 按对端已注册的 QPN 直达对应接收队列，不经流规则；
//! - 队列有界（[`RQ_DEPTH`]），满即丢——线上丢包是被接受的结果。
//!
//! ## 契约（What）
//! - 帧在驱动边界按值拷贝（DMA 的等价物）；
//! - `inject` 是测试入口：把一帧当作 "从线上到达" 交给指定端口分类。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{DperfError, Result};
use crate::limits::RQ_DEPTH;
use crate::wire::eth::{ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::wire::ipv4::IPPROTO_UDP;
use crate::wire::{EthHdr, Ipv4Hdr, IPV4_OFFSET, MacAddr, UDP_OFFSET, UdpHdr};

/// 线上帧（驱动边界按值拷贝）。
pub type Frame = Vec<u8>;

/// 流规则（装载顺序即匹配顺序）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowRule {
    /// IPv4 + UDP 目的端口精确匹配 → 落指定队列。
    UdpDstSteer {
        /// 目的端口（主机序）。
        dst_port: u16,
        /// 目标队列。
        queue: usize,
    },
    /// 以太类型 ARP → 落指定队列。
    ArpIntake {
        /// 目标队列。
        queue: usize,
    },
    /// 其余以太帧一律丢弃。
    DropAll,
}

/// 已装载流规则的句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowHandle(pub u64);

/// RX 队列选择：流分类队列或 UD QPN。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxQueue {
    /// 流分类队列（以太路径）。
    Flow(usize),
    /// UD 接收队列（按 QPN 寻址）。
    Ud(u32),
}

/// NIC 驱动窄接口。
pub trait NicDriver: Send + Sync {
    /// 端口 MAC 地址。
    fn port_mac(&self, port: u8) -> MacAddr;

    /// 链路速率（Mbps），0 表示驱动未报告。
    fn link_speed_mbps(&self, port: u8) -> u64;

    /// 装载一条流规则。
    fn install_flow(&self, port: u8, rule: FlowRule) -> Result<FlowHandle>;

    /// 卸载一条流规则。
    fn destroy_flow(&self, port: u8, handle: FlowHandle) -> Result<()>;

    /// 注册一条 UD 接收队列（QPN 寻址）。
    fn register_ud_queue(&self, port: u8, qpn: u32);

    /// 发射一批以太帧，返回被接受的帧数。
    fn tx_burst(&self, port: u8, frames: &[Frame]) -> usize;

    /// 按对端 QPN 发射一帧 UD 报文。
    fn tx_ud(&self, port: u8, remote_qpn: u32, frame: &[u8]) -> bool;

    /// 从指定队列收割至多 `max` 帧。
    fn rx_burst(&self, port: u8, queue: RxQueue, max: usize, out: &mut Vec<Frame>) -> usize;

    /// 指定队列中尚未收割的帧数。
    fn rx_pending(&self, port: u8, queue: RxQueue) -> usize;
}

struct PortState {
    mac: MacAddr,
    peer: u8,
    link_mbps: u64,
    queues: Vec<VecDeque<Frame>>,
    flows: Vec<(FlowHandle, FlowRule)>,
    ud_queues: HashMap<u32, VecDeque<Frame>>,
    tx_log: Vec<Frame>,
}

struct FabricInner {
    ports: HashMap<u8, PortState>,
    next_flow: u64,
}

/// 进程内回环 fabric。
pub struct LoopbackFabric {
    inner: Mutex<FabricInner>,
}

impl LoopbackFabric {
    /// 创建空 fabric。
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FabricInner {
                ports: HashMap::new(),
                next_flow: 1,
            }),
        })
    }

    /// 接入一个端口；`peer` 指向对端端口（自环时与 `port` 相同）。
    pub fn add_port(&self, port: u8, mac: MacAddr, peer: u8) {
        let mut inner = self.inner.lock();
        inner.ports.insert(
            port,
            PortState {
                mac,
                peer,
                link_mbps: 100_000,
                queues: (0..crate::limits::MAX_QUEUES_PER_PORT)
                    .map(|_| VecDeque::new())
                    .collect(),
                flows: Vec::new(),
                ud_queues: HashMap::new(),
                tx_log: Vec::new(),
            },
        );
    }

    /// 测试入口：把一帧按 "从线上到达" 投递给端口分类。
    pub fn inject(&self, port: u8, frame: Frame) {
        let mut inner = self.inner.lock();
        Self::deliver(&mut inner, port, frame);
    }

    /// 取走端口的发送捕获日志。
    pub fn take_tx_log(&self, port: u8) -> Vec<Frame> {
        let mut inner = self.inner.lock();
        inner
            .ports
            .get_mut(&port)
            .map(|p| std::mem::take(&mut p.tx_log))
            .unwrap_or_default()
    }

    fn deliver(inner: &mut FabricInner, port: u8, frame: Frame) {
        let Some(state) = inner.ports.get_mut(&port) else {
            return;
        };
        let Some(eth) = EthHdr::parse(&frame) else {
            return;
        };
        for (_, rule) in &state.flows {
            match rule {
                FlowRule::UdpDstSteer { dst_port, queue } => {
                    if eth.ethertype != ETHERTYPE_IPV4 {
                        continue;
                    }
                    let Some(ip) = Ipv4Hdr::parse(&frame[IPV4_OFFSET..]) else {
                        continue;
                    };
                    if ip.protocol != IPPROTO_UDP {
                        continue;
                    }
                    let Some(udp) = UdpHdr::parse(&frame[UDP_OFFSET..]) else {
                        continue;
                    };
                    if udp.dest == *dst_port {
                        let q = &mut state.queues[*queue];
                        if q.len() < RQ_DEPTH {
                            q.push_back(frame);
                        }
                        return;
                    }
                }
                FlowRule::ArpIntake { queue } => {
                    if eth.ethertype == ETHERTYPE_ARP {
                        let q = &mut state.queues[*queue];
                        if q.len() < RQ_DEPTH {
                            q.push_back(frame);
                        }
                        return;
                    }
                }
                FlowRule::DropAll => {
                    debug!(port, "默认规则丢弃一帧");
                    return;
                }
            }
        }
        // 无规则命中即丢弃。
    }
}

impl NicDriver for LoopbackFabric {
    fn port_mac(&self, port: u8) -> MacAddr {
        self.inner
            .lock()
            .ports
            .get(&port)
            .map(|p| p.mac)
            .unwrap_or(MacAddr::ZERO)
    }

    fn link_speed_mbps(&self, port: u8) -> u64 {
        self.inner
            .lock()
            .ports
            .get(&port)
            .map(|p| p.link_mbps)
            .unwrap_or(0)
    }

    fn install_flow(&self, port: u8, rule: FlowRule) -> Result<FlowHandle> {
        let mut inner = self.inner.lock();
        let handle = FlowHandle(inner.next_flow);
        inner.next_flow += 1;
        let state = inner
            .ports
            .get_mut(&port)
            .ok_or_else(|| DperfError::nic_fatal(format!("端口 {port} 未接入 fabric")))?;
        state.flows.push((handle, rule));
        Ok(handle)
    }

    fn destroy_flow(&self, port: u8, handle: FlowHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .ports
            .get_mut(&port)
            .ok_or_else(|| DperfError::nic_fatal(format!("端口 {port} 未接入 fabric")))?;
        let before = state.flows.len();
        state.flows.retain(|(h, _)| *h != handle);
        if state.flows.len() == before {
            return Err(DperfError::nic_fatal(format!("流规则 {handle:?} 不存在")));
        }
        Ok(())
    }

    fn register_ud_queue(&self, port: u8, qpn: u32) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.ports.get_mut(&port) {
            state.ud_queues.entry(qpn).or_default();
        }
    }

    fn tx_burst(&self, port: u8, frames: &[Frame]) -> usize {
        let mut inner = self.inner.lock();
        let Some(state) = inner.ports.get_mut(&port) else {
            return 0;
        };
        let peer = state.peer;
        state.tx_log.extend(frames.iter().cloned());
        for frame in frames {
            Self::deliver(&mut inner, peer, frame.clone());
        }
        frames.len()
    }

    fn tx_ud(&self, port: u8, remote_qpn: u32, frame: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let Some(state) = inner.ports.get_mut(&port) else {
            return false;
        };
        let peer = state.peer;
        state.tx_log.push(frame.to_vec());
        let Some(peer_state) = inner.ports.get_mut(&peer) else {
            return false;
        };
        match peer_state.ud_queues.get_mut(&remote_qpn) {
            Some(q) if q.len() < RQ_DEPTH => {
                q.push_back(frame.to_vec());
                true
            }
            // 未注册的 QPN 或队列满：线上静默丢弃，发送本身成功。
            _ => true,
        }
    }

    fn rx_burst(&self, port: u8, queue: RxQueue, max: usize, out: &mut Vec<Frame>) -> usize {
        let mut inner = self.inner.lock();
        let Some(state) = inner.ports.get_mut(&port) else {
            return 0;
        };
        let q = match queue {
            RxQueue::Flow(idx) => state.queues.get_mut(idx),
            RxQueue::Ud(qpn) => state.ud_queues.get_mut(&qpn),
        };
        let Some(q) = q else {
            return 0;
        };
        let mut n = 0;
        while n < max {
            match q.pop_front() {
                Some(frame) => {
                    out.push(frame);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn rx_pending(&self, port: u8, queue: RxQueue) -> usize {
        let inner = self.inner.lock();
        let Some(state) = inner.ports.get(&port) else {
            return 0;
        };
        match queue {
            RxQueue::Flow(idx) => state.queues.get(idx).map(VecDeque::len).unwrap_or(0),
            RxQueue::Ud(qpn) => state.ud_queues.get(&qpn).map(VecDeque::len).unwrap_or(0),
        }
    }
}
