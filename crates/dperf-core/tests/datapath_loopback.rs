//! 回环 fabric 上的数据面场景：TX 链路、背压丢弃、额度耗尽、
//! 消息分片与全链路回射。
//!
//! # 教案级导览
//!
//! - **Why**：这些场景覆盖数据面的代表性工况——单应用单分发的 TX 链路、
//!   强制小环引发的入环丢弃、在途额度耗尽后的跳过语义、大消息按单包
//!   线上载荷上限切片（满载分片恰为一个 MTU）且在 TX 环上连续，
//!   以及回射链路上的额度守恒；
//! - **How**：每个场景用真实的 Worker/分发器线程跑完整两道屏障协议与
//!   事件循环，fabric 端口自环，发出的帧按流规则回流到本分发器队列；
//! - **What**：断言全部基于确定性计数（在途预算与批大小决定总量），
//!   不依赖时序精度。

use std::sync::{Arc, Mutex};

use dperf_core::UserConfig;
use dperf_core::dispatcher::Dispatcher;
use dperf_core::dispatcher::dpdk::DpdkDispatcher;
use dperf_core::dispatcher::nic::LoopbackFabric;
use dperf_core::limits::{MAX_INFLY, MTU};
use dperf_core::pipeline::PipelineComposer;
use dperf_core::stats::WsStats;
use dperf_core::wire::{ETH_HDR_LEN, MAX_WIRE_PAYLOAD, TOTAL_HEADER_LEN};
use dperf_core::workspace::{NodeRole, Workspace, WsContext};

// 队列对来自进程级属主表（每端口 4 槽），场景串行执行避免并行试跑时耗尽。
static QP_LOCK: Mutex<()> = Mutex::new(());

fn parse_config(workload: &str, tunables: &str) -> Arc<UserConfig> {
    let text = format!(
        "numa:0\nphy_port:0\niteration:1\nduration:1\n\
         local_ip:10.0.0.1\nremote_ip:10.0.0.1\n\
         local_mac:0c.42.a1.dd.5f.0e\nremote_mac:0c.42.a1.dd.5f.0e\n\
         {tunables}{workload}\n"
    );
    Arc::new(UserConfig::parse(&text).unwrap())
}

fn loopback_fabric(config: &UserConfig) -> Arc<LoopbackFabric> {
    let fabric = LoopbackFabric::new();
    fabric.add_port(0, config.server.local_mac, 0);
    fabric
}

struct RunOutput {
    worker: WsStats,
    worker_budget: u64,
    dispatcher: WsStats,
    staging_left: usize,
}

/// 跑一轮 1 秒的双工作空间场景（ws0 Worker + ws1 分发器）。
fn run_pair(config: Arc<UserConfig>, ring_capacity: usize) -> RunOutput {
    let fabric = loopback_fabric(&config);
    let composer = PipelineComposer::new(&config.workloads);
    let ctx = WsContext::new(2);

    let (worker_type, worker_steps) = composer.generate_ws_loop(0);
    let (disp_type, disp_steps) = composer.generate_ws_loop(1);

    let worker_thread = {
        let ctx = ctx.clone();
        let config = config.clone();
        std::thread::spawn(move || {
            let mut ws = Workspace::new_with_ring_capacity(
                ctx,
                0,
                worker_type,
                &config,
                worker_steps,
                NodeRole::Client,
                None,
                ring_capacity,
            )
            .unwrap();
            ws.run_event_loop(1, 1);
            (ws.stats().clone(), ws.infly_budget())
        })
    };
    let disp_thread = {
        let ctx = ctx.clone();
        let config = config.clone();
        std::thread::spawn(move || {
            let disp = DpdkDispatcher::new(1, 0, &config, fabric).unwrap();
            let mut ws = Workspace::new(
                ctx,
                1,
                disp_type,
                &config,
                disp_steps,
                NodeRole::Client,
                Some(Box::new(disp)),
            )
            .unwrap();
            ws.run_event_loop(1, 1);
            let staging = ws.dispatcher_ref().map(|d| d.tx_staging_len()).unwrap_or(0);
            (ws.stats().clone(), staging)
        })
    };

    let (worker, worker_budget) = worker_thread.join().unwrap();
    let (dispatcher, staging_left) = disp_thread.join().unwrap();
    RunOutput {
        worker,
        worker_budget,
        dispatcher,
        staging_left,
    }
}

/// 单应用 + 单分发、仅 TX：在途预算决定总量，分发器逐包接力，无丢弃。
#[test]
fn single_app_single_disp_tx_only() {
    let _guard = QP_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let config = parse_config(
        "workload:0:TxApplication,TxDispatcher:1:0:1",
        "kAppTxBatchSize:32\nkDispTxBatchSize:32\nkNICTxPostSize:32\nkAppReqPayloadSize:64\n",
    );
    let out = run_pair(config, 4096);

    // 预算 8192 条消息、单片消息：产量恰为预算。
    assert_eq!(out.worker.app_tx_msg_num, MAX_INFLY);
    assert!(out.worker.app_tx_msg_num > 0);
    assert_eq!(out.worker.app_enqueue_drops, 0);
    assert_eq!(out.worker_budget, 0);
    // 分发器接力了全部入环报文。
    assert_eq!(out.dispatcher.disp_tx_pkt_num, out.worker.app_tx_pkt_num);
    assert_eq!(out.dispatcher.disp_enqueue_drops, 0);

    // 丢弃记账守恒：产量 = 已发射 + 应用丢弃 + 分发丢弃 + 超时在途。
    let produced = out.worker.app_tx_pkt_num + out.worker.app_enqueue_drops;
    assert_eq!(
        produced,
        out.dispatcher.nic_tx_pkt_num
            + out.worker.app_enqueue_drops
            + out.dispatcher.disp_enqueue_drops
            + out.staging_left as u64
    );
    // 发射阈值决定暂存残留小于一个 post 批。
    assert!(out.staging_left < 32, "staging = {}", out.staging_left);
}

/// 强制 64 深的小环、128 的批：首批余量之外全部入环失败，
/// 背压丢弃只计数、不致命；额度随之耗尽，apply 转入跳过。
#[test]
fn ring_full_drops_and_credit_exhaustion() {
    let _guard = QP_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let config = parse_config(
        // 分发器只有 RX 阶段，永不收集 TX 环。
        "workload:0:TxApplication,RXDispatcher:1:0:1",
        "kAppTxBatchSize:128\nkAppReqPayloadSize:64\n",
    );
    let out = run_pair(config, 64);

    // 64 次 generate × 128 包 = 8192 包（预算耗尽为止）。
    assert_eq!(out.worker.app_tx_msg_num, MAX_INFLY);
    // 64 深的环可用槽位 63，其余全部丢弃。
    assert_eq!(out.worker.app_tx_pkt_num, 63);
    assert_eq!(out.worker.app_enqueue_drops, MAX_INFLY - 63);
    // 额度归零后 apply 持续跳过，事件循环正常收尾（无死锁即通过）。
    assert_eq!(out.worker_budget, 0);
    assert_eq!(out.dispatcher.disp_tx_pkt_num, 0);
}

/// 全链路回射：请求经流规则回流本分发器、分流回 Worker、按响应消费。
/// 额度守恒：期末额度 = 预算 - （已发消息 - 已收消息）。
#[test]
fn echo_loop_returns_credit() {
    let _guard = QP_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let config = parse_config(
        "workload:0:TxApplication,TxDispatcher,RXDispatcher,RxApplication:1:0:1",
        "kAppTxBatchSize:32\nkAppRxBatchSize:1\nkDispTxBatchSize:32\n\
         kNICTxPostSize:32\nkNICRxPostSize:128\n\
         kAppReqPayloadSize:64\nkAppRespPayloadSize:64\n",
    );
    let out = run_pair(config, 4096);

    assert!(out.worker.app_rx_msg_num > 0, "回射链路没有送达任何响应");
    assert!(out.dispatcher.disp_rx_pkt_num > 0);
    assert_eq!(
        out.worker_budget,
        MAX_INFLY - (out.worker.app_tx_msg_num - out.worker.app_rx_msg_num),
        "在途额度与未归还消息数不守恒"
    );
}

/// 4 KiB 载荷按单包线上载荷上限切成 5 片：`segment_num = 5`，
/// 同消息分片在 TX 环上连续，满载分片的 IPv4 数据报恰为一个 MTU
/// （DF 置位下不会出现超限报文）。
#[test]
fn large_payload_fragments_fill_frames_to_mtu() {
    let _guard = QP_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let config = parse_config(
        "workload:0:TxApplication,TxDispatcher:1:0:1",
        "kAppTxBatchSize:8\nkAppReqPayloadSize:4096\n",
    );
    let segments = 4096usize.div_ceil(MAX_WIRE_PAYLOAD);
    assert_eq!(segments, 5);
    let tail_payload = 4096 - (segments - 1) * MAX_WIRE_PAYLOAD;
    // 满载分片：头部 + 载荷上限扣除以太头后恰为一个 MTU。
    assert_eq!(TOTAL_HEADER_LEN + MAX_WIRE_PAYLOAD - ETH_HDR_LEN, MTU);
    let fabric = loopback_fabric(&config);
    let composer = PipelineComposer::new(&config.workloads);
    let ctx = WsContext::new(2);
    let (worker_type, worker_steps) = composer.generate_ws_loop(0);
    let (disp_type, disp_steps) = composer.generate_ws_loop(1);

    let disp_thread = {
        let ctx = ctx.clone();
        let config = config.clone();
        std::thread::spawn(move || {
            let disp = DpdkDispatcher::new(1, 0, &config, fabric).unwrap();
            // 只参与装配协议，不运行事件循环。
            let _ws = Workspace::new(
                ctx,
                1,
                disp_type,
                &config,
                disp_steps,
                NodeRole::Client,
                Some(Box::new(disp)),
            )
            .unwrap();
        })
    };
    let worker_thread = {
        let ctx = ctx.clone();
        let config = config.clone();
        std::thread::spawn(move || {
            let mut ws = Workspace::new(
                ctx,
                0,
                worker_type,
                &config,
                worker_steps,
                NodeRole::Client,
                None,
            )
            .unwrap();
            ws.tick();

            let ring = ws.tx_ring().unwrap().clone();
            let mem_reg = ws.mem_reg().unwrap().clone();
            let mut ids = Vec::new();
            while let Some(id) = ring.dequeue() {
                ids.push(id);
            }
            // 8 条消息 × 5 片。
            assert_eq!(ids.len(), 8 * segments);
            for (i, &id) in ids.iter().enumerate() {
                let hdr = mem_reg.extract_header(id).unwrap();
                assert_eq!(hdr.segment_num, segments as u64, "第 {i} 片的分片数有误");
                let expect_payload = if i % segments == segments - 1 {
                    tail_payload
                } else {
                    MAX_WIRE_PAYLOAD
                };
                assert_eq!(
                    mem_reg.arena().len(id),
                    TOTAL_HEADER_LEN + expect_payload,
                    "第 {i} 片的载荷长度有误"
                );
            }
            mem_reg.dealloc_bulk(&ids);
        })
    };
    worker_thread.join().unwrap();
    disp_thread.join().unwrap();
}

/// 3500 字节载荷：前三片各携带一个线上载荷上限，末片携带余量——
/// 末片长度模式同时证明同消息分片的连续性。
#[test]
fn tail_segment_marks_message_boundary() {
    let _guard = QP_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let config = parse_config(
        "workload:0:TxApplication,TxDispatcher:1:0:1",
        "kAppTxBatchSize:4\nkAppReqPayloadSize:3500\n",
    );
    let segments = 3500usize.div_ceil(MAX_WIRE_PAYLOAD);
    assert_eq!(segments, 4);
    let tail_payload = 3500 - (segments - 1) * MAX_WIRE_PAYLOAD;
    let fabric = loopback_fabric(&config);
    let composer = PipelineComposer::new(&config.workloads);
    let ctx = WsContext::new(2);
    let (worker_type, worker_steps) = composer.generate_ws_loop(0);
    let (disp_type, disp_steps) = composer.generate_ws_loop(1);

    let disp_thread = {
        let ctx = ctx.clone();
        let config = config.clone();
        std::thread::spawn(move || {
            let disp = DpdkDispatcher::new(1, 0, &config, fabric).unwrap();
            let _ws = Workspace::new(
                ctx,
                1,
                disp_type,
                &config,
                disp_steps,
                NodeRole::Client,
                Some(Box::new(disp)),
            )
            .unwrap();
        })
    };
    let worker_thread = {
        let ctx = ctx.clone();
        let config = config.clone();
        std::thread::spawn(move || {
            let mut ws = Workspace::new(
                ctx,
                0,
                worker_type,
                &config,
                worker_steps,
                NodeRole::Client,
                None,
            )
            .unwrap();
            ws.tick();

            let ring = ws.tx_ring().unwrap().clone();
            let mem_reg = ws.mem_reg().unwrap().clone();
            let mut ids = Vec::new();
            while let Some(id) = ring.dequeue() {
                ids.push(id);
            }
            assert_eq!(ids.len(), 4 * segments);
            for (i, &id) in ids.iter().enumerate() {
                let expect_payload = if i % segments == segments - 1 {
                    tail_payload
                } else {
                    MAX_WIRE_PAYLOAD
                };
                assert_eq!(
                    mem_reg.arena().len(id),
                    TOTAL_HEADER_LEN + expect_payload,
                    "第 {i} 片的载荷长度与消息边界不符"
                );
            }
            mem_reg.dealloc_bulk(&ids);
        })
    };
    worker_thread.join().unwrap();
    disp_thread.join().unwrap();
}
