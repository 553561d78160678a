//! 以太网/UDP 形态的分发器后端（DPDK 工艺）。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 进程内首个实例负责一次性环境初始化（进程级锁内完成）并挂出共享的
//!   QP 属主表；后续实例只预留队列对、建或寻各自的内存池
//!   （命名 `dperf-mp-<端口>-<qp>`）；
//! - 发射路径集中完成三层头盖章：应用只半写 UDP 端口（裸 ws_id），
//!   分发器补齐以太/IPv4 头并把端口加上基准值落成网络序。
//!
//! ## 流规则（How）
//! - 每实例装载三条规则：UDP 目的端口 `BASE_UDP_PORT + ws_id` 精确匹配
//!   引流到本队列对；ARP 引流到队列 0；默认以太一律丢弃；
//! - 命中本地 IPv4 的 ARP REQUEST 就地构造 REPLY 并立即发出，
//!   其余 ARP 报文记日志。
//!
//! ## 次级进程语义（Gotchas）
//! - 同名内存池已存在时按次级进程处理：复用池、先清掉陈旧的 RX 积压，
//!   可用单元数低于池容量则告警（前任进程泄漏）。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::buffer::{BufId, BufferArena, MemReg};
use crate::config::UserConfig;
use crate::error::{DperfError, Result};
use crate::limits::{
    BASE_UDP_PORT, MAX_PHY_PORTS, MAX_WORKSPACES, MEMPOOL_SIZE, TX_RING_ENTRIES,
};
use crate::ownership::OwnershipTable;
use crate::ring::WsRing;
use crate::rule_table::RuleTable;
use crate::timing::FastRand;
use crate::wire::arp::{ARP_OP_REQUEST, ArpHdr, build_arp_reply};
use crate::wire::eth::ETHERTYPE_ARP;
use crate::wire::ipv4::ipv4_to_string;
use crate::wire::{EthHdr, IPV4_OFFSET, MacAddr};

use super::nic::{Frame, FlowHandle, FlowRule, NicDriver, RxQueue};
use super::{DispatchOutcome, Dispatcher};

/// 经交换机转发的本地 IPv4 模式（目的 MAC 须指向交换机）。
const SWITCH_STEERED_LOCAL_IPS: [&str; 2] = ["10.10.1.1", "10.10.1.2"];
/// 交换机 MAC。
const SWITCH_MAC: MacAddr = MacAddr([0x0c, 0x42, 0xa1, 0xdd, 0x5f, 0x08]);

/// 进程级环境：属主表、内存池注册表与进程标签。
struct DpdkEnv {
    ownership: Arc<OwnershipTable>,
    mempools: Mutex<HashMap<String, Arc<BufferArena>>>,
    proc_tag: u64,
}

fn dpdk_env() -> &'static DpdkEnv {
    static ENV: OnceLock<DpdkEnv> = OnceLock::new();
    ENV.get_or_init(|| {
        info!("初始化进程级以太网分发环境");
        DpdkEnv {
            ownership: OwnershipTable::global().clone(),
            mempools: Mutex::new(HashMap::new()),
            proc_tag: FastRand::new().next_u64(),
        }
    })
}

/// 端口与队列对的内存池命名。
pub fn mempool_name(phy_port: u8, qp_id: usize) -> String {
    format!("dperf-mp-{phy_port}-{qp_id}")
}

/// 从端口解析出的身份信息。
struct PortResolve {
    mac_addr: MacAddr,
    ipv4_addr: u32,
    bandwidth_bps: u64,
}

/// 以太网/UDP 分发器。
pub struct DpdkDispatcher {
    driver: Arc<dyn NicDriver>,
    phy_port: u8,
    qp_id: usize,
    arena: Arc<BufferArena>,
    resolve: PortResolve,
    dmac: MacAddr,
    daddr: u32,
    flow_handles: Vec<FlowHandle>,

    tx_stage: Vec<BufId>,
    rx_stage: Vec<BufId>,
    rx_scratch: Vec<Frame>,
    rx_pool_drops: usize,

    ws_tx_rings: Vec<Arc<WsRing>>,
    ws_rx_rings: [Option<Arc<WsRing>>; MAX_WORKSPACES],
    ws_queue_idx: usize,
    rx_rule_table: RuleTable,

    disp_tx_batch: u16,
    nic_tx_post: u16,
    nic_rx_post: u16,
}

impl DpdkDispatcher {
    /// 构造：预留队列对、建/寻内存池、解析端口并装载流规则。
    pub fn new(
        ws_id: u8,
        phy_port: u8,
        config: &UserConfig,
        driver: Arc<dyn NicDriver>,
    ) -> Result<Self> {
        if (phy_port as usize) >= MAX_PHY_PORTS {
            return Err(DperfError::config(format!("物理端口 {phy_port} 越界")));
        }
        let env = dpdk_env();

        let qp_id = env
            .ownership
            .get_qp(phy_port as usize, env.proc_tag)
            .map_err(|e| match e {
                DperfError::ResourceExhausted { .. } => DperfError::exhausted(format!(
                    "工作空间 {ws_id} 申请不到空闲队列对: {}",
                    env.ownership.summary(phy_port as usize)
                )),
                other => other,
            })?;
        info!(ws_id, phy_port, qp_id, "以太网分发器取得队列对");

        let name = mempool_name(phy_port, qp_id);
        let (arena, adopted) = {
            let mut pools = env.mempools.lock();
            match pools.get(&name) {
                Some(existing) => (existing.clone(), true),
                None => {
                    let arena = Arc::new(BufferArena::new(name.clone(), MEMPOOL_SIZE));
                    pools.insert(name.clone(), arena.clone());
                    (arena, false)
                }
            }
        };
        if adopted {
            // 次级进程语义：清陈旧积压，核对泄漏。
            let mut stale = Vec::new();
            while driver.rx_burst(phy_port, RxQueue::Flow(qp_id), 64, &mut stale) > 0 {
                stale.clear();
            }
            let avail = arena.available();
            if avail < MEMPOOL_SIZE {
                warn!(
                    ws_id,
                    pool = %name,
                    avail,
                    size = MEMPOOL_SIZE,
                    leaked = MEMPOOL_SIZE - avail,
                    "接管的内存池存在前任进程泄漏的单元"
                );
            }
        }

        let resolve = Self::resolve_phy_port(phy_port, config, driver.as_ref())?;

        let local_ip_str = ipv4_to_string(config.server.local_ip);
        let dmac = if SWITCH_STEERED_LOCAL_IPS.contains(&local_ip_str.as_str()) {
            SWITCH_MAC
        } else {
            config.server.remote_mac
        };

        let mut dispatcher = Self {
            driver,
            phy_port,
            qp_id,
            arena,
            resolve,
            dmac,
            daddr: config.server.remote_ip,
            flow_handles: Vec::new(),
            tx_stage: Vec::with_capacity(TX_RING_ENTRIES),
            rx_stage: Vec::new(),
            rx_scratch: Vec::new(),
            rx_pool_drops: 0,
            ws_tx_rings: Vec::new(),
            ws_rx_rings: Default::default(),
            ws_queue_idx: 0,
            rx_rule_table: RuleTable::new(),
            disp_tx_batch: config.tunables.disp_tx_batch,
            nic_tx_post: config.tunables.nic_tx_post,
            nic_rx_post: config.tunables.nic_rx_post,
        };
        dispatcher.offload_flow_rules(ws_id)?;
        Ok(dispatcher)
    }

    fn resolve_phy_port(
        phy_port: u8,
        config: &UserConfig,
        driver: &dyn NicDriver,
    ) -> Result<PortResolve> {
        let mac_addr = driver.port_mac(phy_port);
        let mut link_mbps = driver.link_speed_mbps(phy_port);
        if link_mbps == 0 {
            warn!(phy_port, "驱动未报告链路速率，按 10 Gbps 估算");
            link_mbps = 10_000;
        }
        if link_mbps < 10_000 {
            return Err(DperfError::nic_fatal(format!(
                "端口 {phy_port} 链路过慢: {link_mbps} Mbps"
            )));
        }
        let resolve = PortResolve {
            mac_addr,
            ipv4_addr: config.server.local_ip,
            bandwidth_bps: link_mbps * 1000 * 1000 / 8,
        };
        info!(
            phy_port,
            mac = %resolve.mac_addr,
            ip = %ipv4_to_string(resolve.ipv4_addr),
            gbps = resolve.bandwidth_bps as f64 * 8.0 / 1e9,
            "端口解析完成"
        );
        Ok(resolve)
    }

    /// 装载三条流规则：引流、ARP 收取、默认丢弃。
    fn offload_flow_rules(&mut self, ws_id: u8) -> Result<()> {
        let steer = FlowRule::UdpDstSteer {
            dst_port: BASE_UDP_PORT + ws_id as u16,
            queue: self.qp_id,
        };
        let arp = FlowRule::ArpIntake { queue: 0 };
        for rule in [steer, arp, FlowRule::DropAll] {
            let handle = self.driver.install_flow(self.phy_port, rule)?;
            self.flow_handles.push(handle);
        }
        info!(
            ws_id,
            phy_port = self.phy_port,
            udp_port = BASE_UDP_PORT + ws_id as u16,
            queue = self.qp_id,
            "流规则装载完成"
        );
        Ok(())
    }

    /// 就地补齐以太/IPv4 头并把 UDP 端口落成最终形态。
    fn set_pkt_hdr(&self, id: BufId) {
        super::stamp_headers(
            &self.arena,
            id,
            self.resolve.mac_addr,
            self.dmac,
            self.resolve.ipv4_addr,
            self.daddr,
        );
    }

    fn is_arp(&self, id: BufId) -> bool {
        // SAFETY: RX 暂存内的单元由分发器独占。
        let cell = unsafe { self.arena.bytes(id) };
        EthHdr::parse(cell).is_some_and(|eth| eth.ethertype == ETHERTYPE_ARP)
    }

    /// ARP 处理：命中本地 IPv4 的请求即刻应答。
    fn handle_arp(&mut self, id: BufId) {
        // SAFETY: 同上。
        let cell = unsafe { self.arena.bytes(id) };
        let Some(arp) = ArpHdr::parse(&cell[IPV4_OFFSET..]) else {
            warn!("收到畸形 ARP 报文");
            return;
        };
        if arp.op == ARP_OP_REQUEST {
            if arp.tpa == self.resolve.ipv4_addr {
                let reply = build_arp_reply(&arp, self.resolve.mac_addr, self.resolve.ipv4_addr);
                let sent = self.driver.tx_burst(self.phy_port, &[reply]);
                if sent != 1 {
                    warn!("ARP 应答发送失败");
                } else {
                    info!(spa = %ipv4_to_string(arp.spa), "已发送 ARP 应答");
                }
            }
        } else {
            info!(op = arp.op, "收到非请求类 ARP 报文");
        }
    }
}

impl Dispatcher for DpdkDispatcher {
    fn collect_tx(&mut self) -> usize {
        let mut remain = TX_RING_ENTRIES - self.tx_stage.len();
        let mut visited = 0usize;
        let mut collected = 0usize;
        while remain > 0 && visited < self.ws_tx_rings.len() {
            let ring = &self.ws_tx_rings[self.ws_queue_idx];
            let size = ring.len();
            if size < self.disp_tx_batch as usize {
                self.ws_queue_idx = (self.ws_queue_idx + 1) % self.ws_tx_rings.len();
                visited += 1;
                continue;
            }
            let take = size.min(remain);
            for _ in 0..take {
                let Some(id) = ring.dequeue() else {
                    break;
                };
                self.set_pkt_hdr(id);
                self.tx_stage.push(id);
                remain -= 1;
                collected += 1;
            }
            self.ws_queue_idx = (self.ws_queue_idx + 1) % self.ws_tx_rings.len();
            visited += 1;
        }
        collected
    }

    fn tx_flush(&mut self) -> usize {
        if self.tx_stage.is_empty() {
            return 0;
        }
        let frames: Vec<Frame> = self
            .tx_stage
            .iter()
            .map(|&id| self.arena.frame_vec(id))
            .collect();
        let mut sent = 0;
        while sent < frames.len() {
            let accepted = self.driver.tx_burst(self.phy_port, &frames[sent..]);
            sent += accepted;
            if accepted == 0 {
                // 驱动暂不收帧，busy-poll 直至清空。
                std::hint::spin_loop();
            }
        }
        // 帧已按值进线，暂存单元全部归还。
        self.arena.release_bulk(&self.tx_stage);
        let total = self.tx_stage.len();
        self.tx_stage.clear();
        total
    }

    fn rx_burst(&mut self) -> usize {
        self.rx_scratch.clear();
        let n = self.driver.rx_burst(
            self.phy_port,
            RxQueue::Flow(self.qp_id),
            self.nic_rx_post as usize,
            &mut self.rx_scratch,
        );
        for frame in self.rx_scratch.drain(..) {
            match self.arena.alloc() {
                Some(id) => {
                    self.arena.write_frame(id, &frame);
                    self.rx_stage.push(id);
                }
                None => self.rx_pool_drops += 1,
            }
        }
        n
    }

    fn dispatch_rx(&mut self) -> DispatchOutcome {
        let mut outcome = DispatchOutcome {
            dispatched: 0,
            dropped: std::mem::take(&mut self.rx_pool_drops),
        };
        let staged: Vec<BufId> = self.rx_stage.drain(..).collect();
        for id in staged {
            if self.is_arp(id) {
                self.handle_arp(id);
                self.arena.release(id);
                continue;
            }
            let Some(hdr) = self.arena.framework_header(id) else {
                self.arena.release(id);
                outcome.dropped += 1;
                continue;
            };
            let ws_id = self.rx_rule_table.rr_select(hdr.workload_type);
            match &self.ws_rx_rings[ws_id as usize] {
                Some(ring) if ring.enqueue(id) => outcome.dispatched += 1,
                _ => {
                    self.arena.release(id);
                    outcome.dropped += 1;
                }
            }
        }
        outcome
    }

    fn add_ws_tx_ring(&mut self, ring: Arc<WsRing>) {
        self.ws_tx_rings.push(ring);
    }

    fn add_ws_rx_ring(&mut self, ws_id: u8, ring: Arc<WsRing>) {
        self.ws_rx_rings[ws_id as usize] = Some(ring);
    }

    fn add_rx_rule(&mut self, workload_type: u8, ws_id: u8) {
        self.rx_rule_table.add_route(workload_type, ws_id);
    }

    fn mem_reg(&self) -> MemReg {
        MemReg::new(self.arena.clone())
    }

    fn tx_staging_len(&self) -> usize {
        self.tx_stage.len()
    }

    fn rx_staging_len(&self) -> usize {
        self.rx_stage.len()
    }

    fn used_buf_count(&self) -> usize {
        self.arena.in_use()
    }

    fn rx_used_desc(&self) -> usize {
        self.driver.rx_pending(self.phy_port, RxQueue::Flow(self.qp_id))
    }

    fn nic_tx_post(&self) -> u16 {
        self.nic_tx_post
    }
}

impl Drop for DpdkDispatcher {
    fn drop(&mut self) {
        // 清掉尚在暂存的单元与流规则，再归还队列对。
        self.arena.release_bulk(&self.tx_stage);
        self.arena.release_bulk(&self.rx_stage);
        for handle in self.flow_handles.drain(..) {
            if let Err(e) = self.driver.destroy_flow(self.phy_port, handle) {
                warn!(error = %e, "卸载流规则失败");
            }
        }
        let env = dpdk_env();
        if let Err(e) = env.ownership.free_qp(self.phy_port as usize, self.qp_id) {
            warn!(error = %e, "归还队列对失败");
        }
    }
}
