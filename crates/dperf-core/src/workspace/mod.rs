//! 逐核心执行器（Workspace）与事件循环。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 一个 Workspace 绑定一个物理核心，按流水线合成器给出的步骤序列
//!   busy-poll 执行；依类型位含应用半体（生产/消费消息）、分发半体
//!   （独占 NIC 队列对）或两者兼备；
//! - 启动遵循两道屏障协议：第一道之后各自解析对侧状态（Worker 取
//!   分发器的内存注册、分发器发现名下 Worker 的环并装 RX 规则），
//!   第二道放行事件循环。
//!
//! ## 事件循环（How）
//! - 每轮迭代：清计数、标定 TSC 速率、尽力拉高 governor、随机热身
//!   [0, 1) ms 去偏，此后每 1 µs 微间隔把步骤序列完整执行一遍；
//! - 超时后上报小结；首个完成者翻转结束信号并成为统计归属者；
//!   分发器以 100 ms 为步长继续服务循环直到全员完成（排空在途 RX）；
//! - 收尾屏障后由统计归属者做均值、打印表格并复位共享状态。
//!
//! ## 失败语义（What）
//! - 第一道屏障之前的一切失败都是致命的（上抛 `DperfError`）；
//! - 循环启动后唯一的异常是背压丢弃：环满即释放缓冲并计数，永不上抛。

pub mod context;
pub mod handlers;
pub mod kv;

use std::sync::Arc;

use tracing::info;

use crate::buffer::{BufId, MemReg};
use crate::config::UserConfig;
use crate::cpu;
use crate::dispatcher::Dispatcher;
use crate::error::{DperfError, Result};
use crate::limits::{MAX_NUMA_NODES, MAX_PHY_PORTS, WS_RING_CAP};
use crate::pipeline::{Step, WS_DISPATCHER, WS_WORKER};
use crate::ring::WsRing;
use crate::rule_table::RuleTable;
use crate::stats::WsStats;
use crate::timing::{FastRand, measure_tsc_freq_ghz, ms_to_cycles, rdtsc, us_to_cycles};
use crate::wire::{FrameworkHeader, MAX_WIRE_PAYLOAD};

pub use context::{WorkerEndpoints, WsContext};
use handlers::{AppEnv, MsgHandler, StatefulMemory, default_handler};
use kv::Kv;

/// 节点角色：客户端发请求收响应，服务端收请求回响应。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// 客户端。
    Client,
    /// 服务端。
    Server,
}

/// 消息的分片数：按单包线上载荷上限（[`MAX_WIRE_PAYLOAD`]）切割，
/// 满载分片的 IPv4 数据报恰为一个 MTU（DF 置位下不会产生超限报文）；
/// 空载荷也占一个分片。
pub fn packets_per_message(payload: usize) -> usize {
    payload.div_ceil(MAX_WIRE_PAYLOAD).max(1)
}

/// 逐核心执行器。
pub struct Workspace {
    ctx: Arc<WsContext>,
    ws_id: u8,
    ws_type: u8,
    numa_node: u8,
    role: NodeRole,
    steps: Vec<Step>,

    // 应用半体
    workload_type: u8,
    tx_ring: Option<Arc<WsRing>>,
    rx_ring: Option<Arc<WsRing>>,
    mem_reg: Option<MemReg>,
    tx_rule_table: RuleTable,
    infly_flag: bool,
    handler: Box<dyn MsgHandler>,
    stateful: StatefulMemory,
    kv: Kv,

    // 分发半体
    dispatcher: Option<Box<dyn Dispatcher>>,

    // 参数
    app_tx_batch: u16,
    app_rx_batch: u16,
    req_pkts_per_msg: usize,
    resp_pkts_per_msg: usize,
    req_payload: usize,
    resp_payload: usize,

    // 统计与时基
    stats: WsStats,
    freq_ghz: f64,
    nic_rx_prev_tick: u64,
    nic_rx_prev_desc: usize,
    rng: FastRand,
    is_stats_owner: bool,

    tx_scratch: Vec<BufId>,
    rx_scratch: Vec<BufId>,
}

impl Workspace {
    /// 以默认环容量构造（见 [`Self::new_with_ring_capacity`]）。
    pub fn new(
        ctx: Arc<WsContext>,
        ws_id: u8,
        ws_type: u8,
        config: &UserConfig,
        steps: Vec<Step>,
        role: NodeRole,
        dispatcher: Option<Box<dyn Dispatcher>>,
    ) -> Result<Self> {
        Self::new_with_ring_capacity(ctx, ws_id, ws_type, config, steps, role, dispatcher, WS_RING_CAP)
    }

    /// 构造并注册一个工作空间。
    ///
    /// # 契约说明
    /// - **前置条件**：同一上下文的全部工作空间并发构造（本方法内部经过
    ///   两道屏障）；`ws_type` 含分发位时必须传入分发器实例；
    /// - **失败**：参数越界、重复注册、Worker 无负载指派、解析不到对侧
    ///   状态时返回 [`DperfError::Config`]——发生在第一道屏障之前的都可
    ///   安全上抛，之后的失败由入口按致命处理。
    #[allow(clippy::too_many_arguments)]
    pub fn new_with_ring_capacity(
        ctx: Arc<WsContext>,
        ws_id: u8,
        ws_type: u8,
        config: &UserConfig,
        steps: Vec<Step>,
        role: NodeRole,
        dispatcher: Option<Box<dyn Dispatcher>>,
        ring_capacity: usize,
    ) -> Result<Self> {
        if ws_type == 0 || ws_type > (WS_DISPATCHER | WS_WORKER | crate::pipeline::WS_NIC_OFFLOAD) {
            return Err(DperfError::config(format!(
                "工作空间 {ws_id} 的类型位 {ws_type:#x} 无效"
            )));
        }
        if (config.server.phy_port as usize) >= MAX_PHY_PORTS {
            return Err(DperfError::config(format!(
                "物理端口 {} 越界",
                config.server.phy_port
            )));
        }
        if (config.server.numa as usize) >= MAX_NUMA_NODES {
            return Err(DperfError::config(format!(
                "NUMA 节点 {} 越界",
                config.server.numa
            )));
        }
        config.tunables.validate()?;

        let is_worker = ws_type & WS_WORKER != 0;
        let is_dispatcher = ws_type & WS_DISPATCHER != 0;
        if is_dispatcher && dispatcher.is_none() {
            return Err(DperfError::config(format!(
                "工作空间 {ws_id} 声明分发位却未提供分发器实例"
            )));
        }

        let mut workload_type = u8::MAX;
        let mut dispatcher_ws_id = ws_id;
        let mut tx_ring = None;
        let mut rx_ring = None;
        let mut tx_rule_table = RuleTable::new();
        if is_worker {
            workload_type = config.workloads.workload_of(ws_id).ok_or_else(|| {
                DperfError::config(format!("Worker {ws_id} 没有负载指派"))
            })?;
            dispatcher_ws_id = config.workloads.dispatcher_of(ws_id).ok_or_else(|| {
                DperfError::config(format!("Worker {ws_id} 的组缺少分发器"))
            })?;
            let spec = &config.workloads.specs[&workload_type];
            for &remote in &spec.remote_dispatchers {
                tx_rule_table.add_route(workload_type, remote);
            }
            tx_ring = Some(Arc::new(WsRing::with_capacity(ring_capacity)));
            rx_ring = Some(Arc::new(WsRing::with_capacity(ring_capacity)));
            info!(ws_id, workload_type, dispatcher_ws_id, "Worker 指派完成");
        }

        let mut ws = Self {
            ctx,
            ws_id,
            ws_type,
            numa_node: config.server.numa,
            role,
            steps,
            workload_type,
            tx_ring,
            rx_ring,
            mem_reg: None,
            tx_rule_table,
            infly_flag: false,
            handler: default_handler(),
            stateful: StatefulMemory::new(),
            kv: Kv::new(1024),
            dispatcher,
            app_tx_batch: config.tunables.app_tx_msg_batch,
            app_rx_batch: config.tunables.app_rx_msg_batch,
            req_pkts_per_msg: packets_per_message(config.tunables.req_payload_size),
            resp_pkts_per_msg: packets_per_message(config.tunables.resp_payload_size),
            req_payload: config.tunables.req_payload_size,
            resp_payload: config.tunables.resp_payload_size,
            stats: WsStats::new(),
            freq_ghz: 1.0,
            nic_rx_prev_tick: 0,
            nic_rx_prev_desc: 0,
            rng: FastRand::new(),
            is_stats_owner: false,
            tx_scratch: Vec::new(),
            rx_scratch: Vec::new(),
        };

        // 注册进上下文（互斥锁内），随后与同伴过第一道屏障。
        let worker_endpoints = if is_worker {
            Some(WorkerEndpoints {
                tx_ring: ws.tx_ring.as_ref().expect("Worker 必有 TX 环").clone(),
                rx_ring: ws.rx_ring.as_ref().expect("Worker 必有 RX 环").clone(),
                dispatcher_ws_id,
                workload_type,
            })
        } else {
            None
        };
        let mem_reg = ws.dispatcher.as_ref().map(|d| d.mem_reg());
        ws.ctx.register(ws_id, ws_type, worker_endpoints, mem_reg)?;
        ws.ctx.barrier_wait();

        // 第二阶段：解析对侧状态。
        if is_worker {
            ws.mem_reg = ws.ctx.mem_reg_of(dispatcher_ws_id);
            if ws.mem_reg.is_none() {
                return Err(DperfError::config(format!(
                    "Worker {ws_id} 解析不到分发器 {dispatcher_ws_id} 的内存注册"
                )));
            }
        }
        if is_dispatcher {
            let assigned = ws.ctx.workers_of(ws_id);
            if assigned.is_empty() {
                return Err(DperfError::config(format!(
                    "分发器 {ws_id} 名下没有任何 Worker"
                )));
            }
            let disp = ws.dispatcher.as_mut().expect("分发位已校验");
            for (worker_id, workload, tx, rx) in assigned {
                disp.add_ws_tx_ring(tx);
                disp.add_ws_rx_ring(worker_id, rx);
                disp.add_rx_rule(workload, worker_id);
            }
        }
        ws.ctx.barrier_wait();
        Ok(ws)
    }

    /// 覆盖消息处理器（默认吞吐密集形态）。
    pub fn set_msg_handler(&mut self, handler: Box<dyn MsgHandler>) {
        self.handler = handler;
    }

    /// 工作空间 id。
    pub fn ws_id(&self) -> u8 {
        self.ws_id
    }

    /// 类型位掩码。
    pub fn ws_type(&self) -> u8 {
        self.ws_type
    }

    /// 本轮（或最近一轮）的原始计数器。
    pub fn stats(&self) -> &WsStats {
        &self.stats
    }

    /// Worker 的 TX 环（诊断与测试）。
    pub fn tx_ring(&self) -> Option<&Arc<WsRing>> {
        self.tx_ring.as_ref()
    }

    /// Worker 的 RX 环（诊断与测试）。
    pub fn rx_ring(&self) -> Option<&Arc<WsRing>> {
        self.rx_ring.as_ref()
    }

    /// 内存注册描述符（诊断与测试）。
    pub fn mem_reg(&self) -> Option<&MemReg> {
        self.mem_reg.as_ref()
    }

    /// 分发半体（诊断与测试）。
    pub fn dispatcher_ref(&self) -> Option<&dyn Dispatcher> {
        self.dispatcher.as_deref()
    }

    /// 本负载当前剩余的在途额度。
    pub fn infly_budget(&self) -> u64 {
        self.tx_rule_table.infly_budget(self.workload_type)
    }

    /// 把步骤序列完整执行一遍。
    pub fn tick(&mut self) {
        for i in 0..self.steps.len() {
            let step = self.steps[i];
            self.run_step(step);
        }
    }

    fn run_step(&mut self, step: Step) {
        match step {
            Step::ApplyBuffers => self.apply_buffers(),
            Step::GeneratePackets => self.generate_packets(),
            Step::CollectTx => self.collect_tx(),
            Step::NicTx => self.nic_tx(),
            Step::NicRx => self.nic_rx(),
            Step::DispatchRx => self.dispatch_rx(),
            Step::AppHandler => self.app_handler(),
        }
    }

    /// 运行事件循环：`iteration` 轮，每轮 `duration_secs` 秒。
    pub fn run_event_loop(&mut self, iteration: u8, duration_secs: u8) {
        let core = cpu::bind_current_thread(self.numa_node as usize, self.ws_id as usize);
        let governor = core.and_then(|c| cpu::raise_cpu_freq(c).map(|prev| (c, prev)));

        for round in 0..iteration {
            self.stats.reset();
            self.nic_rx_prev_desc = 0;
            self.freq_ghz = measure_tsc_freq_ghz();
            let timeout_tsc = ms_to_cycles(1000.0 * duration_secs as f64, self.freq_ghz);
            let interval_tsc = us_to_cycles(1.0, self.freq_ghz);
            self.ctx.barrier_wait();

            // 随机热身 [0, 1) ms，去掉核心间的相位相关。
            let warmup_tsc = self.rng.next_u64() % ms_to_cycles(1.0, self.freq_ghz).max(1);
            let warmup_start = rdtsc();
            while rdtsc().wrapping_sub(warmup_start) < warmup_tsc {
                self.tick();
            }

            let start_tsc = rdtsc();
            let mut loop_tsc = start_tsc;
            self.nic_rx_prev_tick = start_tsc;
            loop {
                if rdtsc().wrapping_sub(loop_tsc) > interval_tsc {
                    loop_tsc = rdtsc();
                    self.tick();
                }
                if rdtsc().wrapping_sub(start_tsc) > timeout_tsc {
                    let pool_size = self
                        .dispatcher
                        .as_ref()
                        .map(|d| d.pool_size())
                        .unwrap_or(crate::limits::MEMPOOL_SIZE);
                    self.is_stats_owner = self.ctx.report_completion(
                        &self.stats,
                        self.freq_ghz,
                        duration_secs as u64,
                        pool_size,
                    );
                    break;
                }
            }

            // 分发器继续排空在途 RX，直到全体完成。
            while self.ws_type & WS_DISPATCHER != 0 && !self.ctx.all_completed() {
                self.tick();
                let wait_start = rdtsc();
                let wait_tsc = ms_to_cycles(100.0, self.freq_ghz);
                while rdtsc().wrapping_sub(wait_start) < wait_tsc {
                    std::hint::spin_loop();
                }
            }

            self.ctx.barrier_wait();
            if self.is_stats_owner {
                let table = self.ctx.finalize_and_render();
                println!("{table}");
                info!(
                    ws_id = self.ws_id,
                    round,
                    apply_stalls = self.stats.app_apply_buf_stalls,
                    app_drops = self.stats.app_enqueue_drops,
                    disp_drops = self.stats.disp_enqueue_drops,
                    "本轮诊断计数"
                );
                self.ctx.reset_round();
                self.is_stats_owner = false;
            }
        }

        if let Some((core, prev)) = governor {
            cpu::restore_cpu_freq(core, &prev);
        }
    }

    /* ---------------- 步骤函数 ---------------- */

    /// 应用 TX 第一步：预留在途额度并批量申请缓冲。
    fn apply_buffers(&mut self) {
        if self.app_tx_batch == 0 {
            return;
        }
        if !self
            .tx_rule_table
            .apply_infly_budget(self.workload_type, self.app_tx_batch as u64)
        {
            self.infly_flag = false;
            return;
        }
        self.infly_flag = true;

        let need = self.req_pkts_per_msg * self.app_tx_batch as usize;
        let mem_reg = self.mem_reg.as_ref().expect("Worker 必有内存注册");
        let s_tick = rdtsc();
        self.tx_scratch.clear();
        while !mem_reg.alloc_bulk(need, &mut self.tx_scratch) {
            self.stats.app_apply_buf_stalls += 1;
        }
        self.stats.record_app_tx_stall(rdtsc().wrapping_sub(s_tick));
    }

    /// 应用 TX 第二步：写头与载荷、整批入环；环满即释放并计丢弃。
    fn generate_packets(&mut self) {
        if self.app_tx_batch == 0 || !self.infly_flag {
            return;
        }
        let s_tick = rdtsc();
        let dst = self.tx_rule_table.rr_select(self.workload_type);
        let hdr = FrameworkHeader {
            workload_type: self.workload_type,
            segment_num: self.req_pkts_per_msg as u64,
        };
        let mem_reg = self.mem_reg.as_ref().expect("Worker 必有内存注册");
        // 满载分片承载一个线上载荷上限，加上头部后 IPv4 数据报恰为 MTU。
        let full_payload = MAX_WIRE_PAYLOAD;
        let last_payload = self.req_payload - (self.req_pkts_per_msg - 1) * MAX_WIRE_PAYLOAD;

        let mut idx = 0;
        for _ in 0..self.app_tx_batch {
            for _ in 0..self.req_pkts_per_msg - 1 {
                mem_reg.set_payload(
                    self.tx_scratch[idx],
                    self.ws_id as u16,
                    dst as u16,
                    &hdr,
                    full_payload,
                );
                idx += 1;
            }
            mem_reg.set_payload(
                self.tx_scratch[idx],
                self.ws_id as u16,
                dst as u16,
                &hdr,
                last_payload,
            );
            idx += 1;
        }

        let tx_ring = self.tx_ring.as_ref().expect("Worker 必有 TX 环");
        let mut drops = 0u64;
        for &id in &self.tx_scratch {
            if !tx_ring.enqueue(id) {
                mem_reg.dealloc(id);
                drops += 1;
            }
        }
        let produced = self.tx_scratch.len() as u64;
        self.stats.app_tx_pkt_num += produced - drops;
        self.stats.app_tx_msg_num += self.app_tx_batch as u64;
        self.stats.app_enqueue_drops += drops;
        self.stats.record_app_tx_duration(rdtsc().wrapping_sub(s_tick));
        self.tx_scratch.clear();
    }

    /// 应用 RX：凑满整消息的批才消费；客户端归还在途额度并释放，
    /// 服务端执行负载处理器并回填响应。凑批探测的耗时计入 RX 停顿
    /// （等环的时间），消费本体计入步骤内耗时。
    fn app_handler(&mut self) {
        let rx_ring = self.rx_ring.as_ref().expect("Worker 必有 RX 环");
        let unit = match self.role {
            NodeRole::Client => self.resp_pkts_per_msg,
            NodeRole::Server => self.req_pkts_per_msg,
        };
        let stall_tick = rdtsc();
        let msg_num = rx_ring.len() / unit;
        if msg_num < self.app_rx_batch as usize {
            self.stats
                .record_app_rx_stall(rdtsc().wrapping_sub(stall_tick));
            return;
        }
        self.stats
            .record_app_rx_stall(rdtsc().wrapping_sub(stall_tick));
        let s_tick = rdtsc();
        self.rx_scratch.clear();
        for _ in 0..msg_num * unit {
            let Some(id) = rx_ring.dequeue() else {
                break;
            };
            self.rx_scratch.push(id);
        }

        match self.role {
            NodeRole::Client => self.client_response_handler(msg_num),
            NodeRole::Server => self.server_msg_handler(msg_num),
        }

        self.stats.app_rx_pkt_num += self.rx_scratch.len() as u64;
        self.stats.app_rx_msg_num += msg_num as u64;
        self.stats.record_app_rx_duration(rdtsc().wrapping_sub(s_tick));
        self.rx_scratch.clear();
    }

    /// 客户端响应处理：按响应头归还在途额度，批量释放缓冲。
    fn client_response_handler(&mut self, msg_num: usize) {
        let mem_reg = self.mem_reg.as_ref().expect("Worker 必有内存注册");
        if let Some(first) = self.rx_scratch.first() {
            if let Some(hdr) = mem_reg.extract_header(*first) {
                self.tx_rule_table
                    .return_infly_budget(hdr.workload_type, msg_num as u64);
            }
        }
        mem_reg.dealloc_bulk(&self.rx_scratch);
    }

    /// 服务端消息处理：执行模拟负载并把响应回填 TX 环。
    fn server_msg_handler(&mut self, msg_num: usize) {
        let dst = self.tx_rule_table.rr_select(self.workload_type);
        let mem_reg = self.mem_reg.as_ref().expect("Worker 必有内存注册");
        let mut env = AppEnv {
            mem_reg,
            stateful: &mut self.stateful,
            kv: &mut self.kv,
            src_port: self.ws_id as u16,
            dst_port: dst as u16,
            hdr: FrameworkHeader {
                workload_type: self.workload_type,
                segment_num: self.resp_pkts_per_msg as u64,
            },
            resp_payload: self.resp_payload,
        };
        self.handler.handle(&mut env, &self.rx_scratch, msg_num);

        let tx_ring = self.tx_ring.as_ref().expect("Worker 必有 TX 环");
        let mut drops = 0u64;
        for &id in &self.rx_scratch {
            if !tx_ring.enqueue(id) {
                mem_reg.dealloc(id);
                drops += 1;
            }
        }
        self.stats.app_enqueue_drops += drops;
    }

    /// 分发器 TX 第一步：收集各 Worker 环并盖章入暂存。
    fn collect_tx(&mut self) {
        let disp = self.dispatcher.as_mut().expect("分发器步骤要求分发位");
        let s_tick = rdtsc();
        let nb_collect = disp.collect_tx();
        if nb_collect != 0 {
            self.stats.disp_tx_pkt_num += nb_collect as u64;
            self.stats.disp_tx_ticks += rdtsc().wrapping_sub(s_tick);
        }
        let usage = disp.used_buf_count();
        self.stats.record_buf_usage(usage);
    }

    /// 分发器 TX 第二步：暂存达到阈值即向 NIC 发射（迭代到全部接受）。
    fn nic_tx(&mut self) {
        let disp = self.dispatcher.as_mut().expect("分发器步骤要求分发位");
        if disp.tx_staging_len() >= disp.nic_tx_post() as usize {
            let s_tick = rdtsc();
            let nb_tx = disp.tx_flush();
            self.stats.nic_tx_pkt_num += nb_tx as u64;
            self.stats.disp_tx_stall_ticks += rdtsc().wrapping_sub(s_tick);
        }
    }

    /// 分发器 RX 第一步：NIC 描述符增量记账并轮询完成。
    fn nic_rx(&mut self) {
        let disp = self.dispatcher.as_mut().expect("分发器步骤要求分发位");
        let s_tick = rdtsc();
        let cur_desc = disp.rx_used_desc();
        if cur_desc != disp.rx_ring_entries()
            && cur_desc > self.nic_rx_prev_desc
            && s_tick > self.nic_rx_prev_tick
        {
            let delta = (cur_desc - self.nic_rx_prev_desc) as u64;
            self.stats.nic_rx_pkt_num += delta;
            let cpt = s_tick.wrapping_sub(self.nic_rx_prev_tick) as f64 / delta as f64;
            self.stats.record_nic_rx_cpt(cpt);
        }
        let nb_rx = disp.rx_burst();
        self.nic_rx_prev_tick = rdtsc();
        self.nic_rx_prev_desc = disp.rx_used_desc();
        if nb_rx > 0 {
            self.stats.disp_rx_stall_ticks += rdtsc().wrapping_sub(s_tick);
        }
    }

    /// 分发器 RX 第二步：把暂存按规则表分流到 Worker 环。
    fn dispatch_rx(&mut self) {
        let disp = self.dispatcher.as_mut().expect("分发器步骤要求分发位");
        if disp.rx_staging_len() == 0 {
            return;
        }
        let s_tick = rdtsc();
        let outcome = disp.dispatch_rx();
        self.stats.disp_rx_pkt_num += outcome.dispatched as u64;
        self.stats.disp_enqueue_drops += outcome.dropped as u64;
        self.stats.disp_rx_ticks += rdtsc().wrapping_sub(s_tick);
    }
}
