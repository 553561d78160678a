//! RoCE-UD 形态的分发器后端。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 每个分发器独占一条 UD 队列对：显式经历 INIT→RTR→RTS 状态机，
//!   经带外 TCP 交换 QP 元信息后以对端地址句柄寻址；
//! - 接收侧追求零拷贝且不引入引用计数：RQ_DEPTH 个常驻缓冲构成循环环，
//!   分发时标记 `AppOwned` 交给 Worker，Worker 归还置 `Free`，
//!   分发器在下一次 `rx_burst` 才把 `Free` 单元重新投递（惰性重投递）。
//!
//! ## 发送记账（How）
//! - verbs 发送队列由软件环 `sw_ring`（深度 SQ_DEPTH）包裹：
//!   `tx_burst` 先收割发送完成（按序释放 `sw_ring` 头部的缓冲），
//!   再把待发缓冲挂上空闲 WR 连成一次批量投递；
//! - 全部发送置 signaled，完成数与投递数一一对应。
//!
//! ## 契约（What）
//! - 状态机乱序迁移是初始化错误（`NicFatal`）；
//! - 未完成元信息交换前发射即错（对端地址句柄缺失）；
//! - 接收填充不超过已投递配额，超量报文在线上丢弃。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{info, warn};

use crate::buffer::{BufId, BufState, BufferArena, MemReg};
use crate::config::UserConfig;
use crate::error::{DperfError, Result};
use crate::limits::{
    BASE_MGNT_PORT, MAX_WORKSPACES, MEMPOOL_SIZE, MTU, RQ_DEPTH, SQ_DEPTH, TX_RING_ENTRIES,
    UD_QKEY,
};
use crate::ring::WsRing;
use crate::rule_table::RuleTable;
use crate::wire::MacAddr;
use crate::wire::ipv4::ipv4_to_string;

use super::mgnt::{MgntConn, MgntServer};
use super::nic::{Frame, NicDriver, RxQueue};
use super::qpinfo::QpInfo;
use super::{DispatchOutcome, Dispatcher};

/// UD 队列对状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QpState {
    /// 初始复位态。
    Reset,
    /// 已绑定端口与 Q_Key。
    Init,
    /// Ready-to-Receive。
    Rtr,
    /// Ready-to-Send。
    Rts,
}

/// UD 队列对（状态机 + QPN）。
pub struct UdQp {
    qpn: u32,
    state: QpState,
    qkey: u32,
}

impl UdQp {
    /// 创建处于 `Reset` 态的队列对，QPN 进程内单调分配。
    pub fn create() -> Self {
        static NEXT_QPN: AtomicU32 = AtomicU32::new(0x11);
        Self {
            qpn: NEXT_QPN.fetch_add(1, Ordering::Relaxed),
            state: QpState::Reset,
            qkey: UD_QKEY,
        }
    }

    /// 队列对编号。
    pub fn qpn(&self) -> u32 {
        self.qpn
    }

    /// 当前状态。
    pub fn state(&self) -> QpState {
        self.state
    }

    /// 状态迁移；只允许 Reset→Init→Rtr→Rts 的顺序推进。
    pub fn modify(&mut self, target: QpState) -> Result<()> {
        let legal = matches!(
            (self.state, target),
            (QpState::Reset, QpState::Init)
                | (QpState::Init, QpState::Rtr)
                | (QpState::Rtr, QpState::Rts)
        );
        if !legal {
            return Err(DperfError::nic_fatal(format!(
                "非法的 QP 状态迁移 {:?} → {target:?}",
                self.state
            )));
        }
        self.state = target;
        Ok(())
    }

    /// Q_Key（对端投递校验用）。
    pub fn qkey(&self) -> u32 {
        self.qkey
    }
}

/// 对端地址句柄（AH 的最小形态：QPN 可达即可）。
#[derive(Clone, Copy, Debug)]
struct RemoteEndpoint {
    qpn: u32,
}

/// RoCE-UD 分发器。
pub struct RoceDispatcher {
    driver: Arc<dyn NicDriver>,
    phy_port: u8,
    qp: UdQp,
    arena: Arc<BufferArena>,
    local_mac: MacAddr,
    local_ip: u32,
    remote_ip: u32,
    remote_mac: MacAddr,
    remote: Option<RemoteEndpoint>,

    // 发送机械
    sw_ring: Vec<Option<BufId>>,
    send_head: usize,
    send_tail: usize,
    free_send_wr: usize,
    unpolled_completions: usize,
    tx_stage: Vec<BufId>,

    // 接收机械
    rx_ring: Vec<BufId>,
    recv_head: usize,
    ring_head: usize,
    wait_for_disp: usize,
    posted_credit: usize,
    rx_scratch: Vec<Frame>,

    ws_tx_rings: Vec<Arc<WsRing>>,
    ws_rx_rings: [Option<Arc<WsRing>>; MAX_WORKSPACES],
    ws_queue_idx: usize,
    rx_rule_table: RuleTable,

    disp_tx_batch: u16,
    disp_rx_batch: u16,
    nic_tx_post: u16,
}

impl RoceDispatcher {
    /// 构造：建池、过状态机、划接收环并注册 UD 队列。
    /// 对端元信息由 [`Self::handshake_as_server`] /
    /// [`Self::handshake_as_client`] 或 [`Self::set_remote_qp_info`] 补齐。
    pub fn new(
        ws_id: u8,
        phy_port: u8,
        config: &UserConfig,
        driver: Arc<dyn NicDriver>,
    ) -> Result<Self> {
        let arena = Arc::new(BufferArena::new(
            format!("dperf-roce-{ws_id}"),
            MEMPOOL_SIZE,
        ));

        let mut qp = UdQp::create();
        qp.modify(QpState::Init)?;
        qp.modify(QpState::Rtr)?;
        qp.modify(QpState::Rts)?;
        driver.register_ud_queue(phy_port, qp.qpn());

        let rx_ring = arena.reserve_ring(RQ_DEPTH)?;
        info!(ws_id, qpn = qp.qpn(), "UD 队列对就绪（INIT→RTR→RTS）");

        Ok(Self {
            driver,
            phy_port,
            qp,
            arena,
            local_mac: config.server.local_mac,
            local_ip: config.server.local_ip,
            remote_ip: config.server.remote_ip,
            remote_mac: config.server.remote_mac,
            remote: None,
            sw_ring: vec![None; SQ_DEPTH],
            send_head: 0,
            send_tail: 0,
            free_send_wr: SQ_DEPTH,
            unpolled_completions: 0,
            tx_stage: Vec::with_capacity(TX_RING_ENTRIES),
            rx_ring,
            recv_head: 0,
            ring_head: 0,
            wait_for_disp: 0,
            posted_credit: RQ_DEPTH,
            rx_scratch: Vec::new(),
            ws_tx_rings: Vec::new(),
            ws_rx_rings: Default::default(),
            ws_queue_idx: 0,
            rx_rule_table: RuleTable::new(),
            disp_tx_batch: config.tunables.disp_tx_batch,
            disp_rx_batch: config.tunables.disp_rx_batch,
            nic_tx_post: config.tunables.nic_tx_post,
        })
    }

    /// 本端 QP 元信息（握手发送内容）。
    pub fn local_qp_info(&self) -> QpInfo {
        QpInfo {
            qp_num: self.qp.qpn(),
            lid: 0,
            gid: [0; 16],
            gid_table_index: 1,
            mtu: MTU as u32,
            mac: self.local_mac,
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            nic_name: String::new(),
            is_initialized: true,
        }
    }

    /// 安装对端元信息（构造对端地址句柄）。
    pub fn set_remote_qp_info(&mut self, info: &QpInfo) -> Result<()> {
        if !info.is_initialized {
            return Err(DperfError::PeerLost {
                reason: "对端报告未完成初始化".to_string(),
            });
        }
        self.remote = Some(RemoteEndpoint { qpn: info.qp_num });
        info!(remote_qpn = info.qp_num, mtu = info.mtu, "对端地址句柄已建立");
        Ok(())
    }

    /// 服务端角色的带外握手：监听 `BASE_MGNT_PORT + ws_id`，
    /// 先发后收各一行元信息。
    pub fn handshake_as_server(&mut self, ws_id: u8) -> Result<()> {
        let server = MgntServer::bind(BASE_MGNT_PORT + ws_id as u16)?;
        self.handshake_on_listener(&server)
    }

    /// 在给定监听端上完成服务端握手（测试可用内核分配端口）。
    pub fn handshake_on_listener(&mut self, server: &MgntServer) -> Result<()> {
        let mut conn = server.accept()?;
        conn.send_msg(&self.local_qp_info().serialize())?;
        let remote = QpInfo::deserialize(&conn.recv_msg()?)?;
        self.set_remote_qp_info(&remote)
    }

    /// 客户端角色的带外握手：连接对端 `BASE_MGNT_PORT + ws_id`。
    pub fn handshake_as_client(&mut self, ws_id: u8) -> Result<()> {
        let remote_ip = ipv4_to_string(self.remote_ip);
        self.handshake_to(&remote_ip, BASE_MGNT_PORT + ws_id as u16)
    }

    /// 连接指定地址完成客户端握手。
    pub fn handshake_to(&mut self, remote_ip: &str, port: u16) -> Result<()> {
        let mut conn = MgntConn::connect(remote_ip, port)?;
        conn.send_msg(&self.local_qp_info().serialize())?;
        let remote = QpInfo::deserialize(&conn.recv_msg()?)?;
        self.set_remote_qp_info(&remote)
    }

    /// 本端 QPN（fabric 接收队列标识）。
    pub fn qpn(&self) -> u32 {
        self.qp.qpn()
    }

    /// 接收环单元（状态机测试入口）。
    pub fn rx_ring_cells(&self) -> &[BufId] {
        &self.rx_ring
    }

    /// 发送：先收割完成、再挂载投递；返回本次投递数。
    fn tx_burst(&mut self, tx: &[BufId]) -> usize {
        // 收割发送 CQ（全部 signaled，完成数即先前投递数）。
        let completions = std::mem::take(&mut self.unpolled_completions);
        for _ in 0..completions {
            if let Some(id) = self.sw_ring[self.send_head].take() {
                self.arena.release(id);
            }
            self.send_head = (self.send_head + 1) % SQ_DEPTH;
            self.free_send_wr += 1;
        }

        let Some(remote) = self.remote else {
            warn!("对端地址句柄缺失，发送被丢弃");
            return tx.len(); // 记为已消费，缓冲立即归还
        };

        let mut posted = 0;
        while self.free_send_wr > 0 && posted < tx.len() {
            let id = tx[posted];
            self.arena.set_state(id, BufState::Posted);
            let frame = self.arena.frame_vec(id);
            self.driver.tx_ud(self.phy_port, remote.qpn, &frame);
            self.sw_ring[self.send_tail] = Some(id);
            self.send_tail = (self.send_tail + 1) % SQ_DEPTH;
            self.free_send_wr -= 1;
            posted += 1;
        }
        self.unpolled_completions += posted;
        posted
    }
}

impl Dispatcher for RoceDispatcher {
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
                super::stamp_headers(
                    &self.arena,
                    id,
                    self.local_mac,
                    self.remote_mac,
                    self.local_ip,
                    self.remote_ip,
                );
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
        let staged: Vec<BufId> = self.tx_stage.drain(..).collect();
        let mut total = 0;
        while total < staged.len() {
            let posted = self.tx_burst(&staged[total..]);
            total += posted;
            if posted == 0 {
                std::hint::spin_loop();
            }
        }
        // 无对端时 tx_burst 直接消费，缓冲立即归还。
        if self.remote.is_none() {
            self.arena.release_bulk(&staged);
        }
        total
    }

    fn rx_burst(&mut self) -> usize {
        // 惰性重投递：从 recv_head 起收集 Worker 已归还的单元。
        let mut num_recvs = 0;
        while num_recvs < RQ_DEPTH {
            let id = self.rx_ring[self.recv_head];
            if self.arena.state(id) != BufState::Free {
                break;
            }
            self.arena.set_state(id, BufState::Posted);
            self.recv_head = (self.recv_head + 1) % RQ_DEPTH;
            num_recvs += 1;
        }
        self.posted_credit += num_recvs;

        // 收割接收 CQ，按环序填入已投递的单元。
        self.rx_scratch.clear();
        self.driver.rx_burst(
            self.phy_port,
            RxQueue::Ud(self.qp.qpn()),
            self.disp_rx_batch as usize,
            &mut self.rx_scratch,
        );
        let mut filled = 0;
        let mut fill_idx = (self.ring_head + self.wait_for_disp) % RQ_DEPTH;
        for frame in self.rx_scratch.drain(..) {
            if self.posted_credit == 0 {
                // 超出已投递配额的报文在线上丢弃（RNR 等价物）。
                break;
            }
            let id = self.rx_ring[fill_idx];
            self.arena.write_frame(id, &frame);
            fill_idx = (fill_idx + 1) % RQ_DEPTH;
            self.posted_credit -= 1;
            filled += 1;
        }
        self.wait_for_disp += filled;
        filled
    }

    fn dispatch_rx(&mut self) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let pending = std::mem::take(&mut self.wait_for_disp);
        let mut idx = self.ring_head;
        for _ in 0..pending {
            let id = self.rx_ring[idx];
            idx = (idx + 1) % RQ_DEPTH;
            let Some(hdr) = self.arena.framework_header(id) else {
                self.arena.set_state(id, BufState::Free);
                outcome.dropped += 1;
                continue;
            };
            let ws_id = self.rx_rule_table.rr_select(hdr.workload_type);
            match &self.ws_rx_rings[ws_id as usize] {
                Some(ring) if ring.enqueue(id) => {
                    self.arena.set_state(id, BufState::AppOwned);
                    outcome.dispatched += 1;
                }
                _ => {
                    self.arena.set_state(id, BufState::Free);
                    outcome.dropped += 1;
                }
            }
        }
        self.ring_head = (self.ring_head + pending) % RQ_DEPTH;
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
        self.wait_for_disp
    }

    fn used_buf_count(&self) -> usize {
        self.arena.in_use()
    }

    fn rx_used_desc(&self) -> usize {
        (self.ring_head + self.wait_for_disp + RQ_DEPTH - self.recv_head) % RQ_DEPTH
    }

    fn nic_tx_post(&self) -> u16 {
        self.nic_tx_post
    }
}
