//! RoCE-UD 后端：QP 状态机、带外元信息交换与惰性重投递循环。

use std::sync::Arc;

use dperf_core::UserConfig;
use dperf_core::buffer::BufState;
use dperf_core::dispatcher::Dispatcher;
use dperf_core::dispatcher::mgnt::MgntServer;
use dperf_core::dispatcher::nic::LoopbackFabric;
use dperf_core::dispatcher::qpinfo::QpInfo;
use dperf_core::dispatcher::roce::{QpState, RoceDispatcher, UdQp};
use dperf_core::error::DperfError;
use dperf_core::ring::WsRing;
use dperf_core::wire::{FrameworkHeader, MacAddr};

fn config() -> Arc<UserConfig> {
    Arc::new(
        UserConfig::parse(
            "numa:0\nphy_port:0\niteration:1\nduration:1\n\
             local_ip:127.0.0.1\nremote_ip:127.0.0.1\n\
             local_mac:0c.42.a1.dd.5f.0e\nremote_mac:0c.42.a1.dd.5f.0f\n\
             kDispTxBatchSize:1\n",
        )
        .unwrap(),
    )
}

/// 状态机只允许 INIT→RTR→RTS 顺序推进，乱序迁移是致命错误。
#[test]
fn qp_state_machine_enforces_order() {
    let mut qp = UdQp::create();
    assert_eq!(qp.state(), QpState::Reset);

    let err = qp.modify(QpState::Rtr).unwrap_err();
    assert!(matches!(err, DperfError::NicFatal { .. }), "{err}");

    qp.modify(QpState::Init).unwrap();
    assert!(qp.modify(QpState::Init).is_err());
    qp.modify(QpState::Rtr).unwrap();
    assert!(qp.modify(QpState::Init).is_err());
    qp.modify(QpState::Rts).unwrap();
    assert_eq!(qp.state(), QpState::Rts);
    assert!(qp.modify(QpState::Rts).is_err());
}

/// QP 元信息序列化往返。
#[test]
fn qpinfo_round_trip() {
    let info = QpInfo {
        qp_num: 0x1234,
        lid: 7,
        gid: [
            0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
        ],
        gid_table_index: 1,
        mtu: 1024,
        mac: MacAddr([0x0c, 0x42, 0xa1, 0xdd, 0x5f, 0x0e]),
        hostname: "node-a".to_string(),
        nic_name: "rdma0".to_string(),
        is_initialized: true,
    };
    let line = info.serialize();
    let parsed = QpInfo::deserialize(&line).unwrap();
    assert_eq!(parsed, info);
}

/// 畸形元信息（未知字段 / GID 字节数不足）按对端丢失处理。
#[test]
fn qpinfo_malformed_rejected() {
    let err = QpInfo::deserialize("bogus:1;").unwrap_err();
    assert!(matches!(err, DperfError::PeerLost { .. }), "{err}");
    let err = QpInfo::deserialize("gid:1,2,3;").unwrap_err();
    assert!(matches!(err, DperfError::PeerLost { .. }), "{err}");
}

/// 带外握手 + UD 数据面 + 惰性重投递的端到端循环。
#[test]
fn handshake_then_lazy_repost_cycle() {
    let config = config();
    let fabric = LoopbackFabric::new();
    fabric.add_port(0, config.server.local_mac, 0);

    let mut server = RoceDispatcher::new(0, 0, &config, fabric.clone()).unwrap();
    let mut client = RoceDispatcher::new(1, 0, &config, fabric.clone()).unwrap();
    assert_ne!(server.qpn(), client.qpn());

    // 带外交换：服务端监听内核分配的端口，两端先发后收。
    let listener = MgntServer::bind(0).unwrap();
    let port = listener.local_port();
    let server_thread = std::thread::spawn(move || {
        server.handshake_on_listener(&listener).unwrap();
        server
    });
    client.handshake_to("127.0.0.1", port).unwrap();
    let mut server = server_thread.join().unwrap();

    // 服务端装配一个 Worker 的 RX 环与分流规则。
    let worker_rx = Arc::new(WsRing::with_capacity(64));
    server.add_ws_rx_ring(3, worker_rx.clone());
    server.add_rx_rule(0, 3);

    // 客户端：申请缓冲、写载荷、入 TX 环、收集并发射。
    let client_tx = Arc::new(WsRing::with_capacity(64));
    client.add_ws_tx_ring(client_tx.clone());
    let client_mem = client.mem_reg();
    let avail_before = client_mem.arena().available();
    let buf = client_mem.alloc().unwrap();
    client_mem.set_payload(
        buf,
        1,
        0,
        &FrameworkHeader {
            workload_type: 0,
            segment_num: 1,
        },
        32,
    );
    assert!(client_tx.enqueue(buf));
    assert_eq!(client.collect_tx(), 1);
    assert_eq!(client.tx_flush(), 1);

    // 服务端：轮询完成、分流到 Worker 环，单元转为 AppOwned。
    assert_eq!(server.rx_burst(), 1);
    let outcome = server.dispatch_rx();
    assert_eq!(outcome.dispatched, 1);
    assert_eq!(outcome.dropped, 0);

    let server_mem = server.mem_reg();
    let delivered = worker_rx.dequeue().expect("分流后的单元应在 Worker 环上");
    assert_eq!(server_mem.arena().state(delivered), BufState::AppOwned);
    let hdr = server_mem.extract_header(delivered).unwrap();
    assert_eq!(hdr.workload_type, 0);
    assert_eq!(hdr.segment_num, 1);

    // Worker 归还 → Free；下一次 rx_burst 惰性重投递 → Posted。
    server_mem.dealloc(delivered);
    assert_eq!(server_mem.arena().state(delivered), BufState::Free);
    server.rx_burst();
    assert_eq!(server_mem.arena().state(delivered), BufState::Posted);

    // 客户端第二次发射时收割发送完成，首个缓冲回到自由链表。
    let buf2 = client_mem.alloc().unwrap();
    client_mem.set_payload(
        buf2,
        1,
        0,
        &FrameworkHeader {
            workload_type: 0,
            segment_num: 1,
        },
        32,
    );
    assert!(client_tx.enqueue(buf2));
    client.collect_tx();
    client.tx_flush();
    assert_eq!(client_mem.arena().available(), avail_before - 1);
}

/// 未完成元信息交换前发射：缓冲被消费但线上无帧（初始化顺序防护）。
#[test]
fn tx_without_remote_is_consumed_quietly() {
    let config = config();
    let fabric = LoopbackFabric::new();
    fabric.add_port(0, config.server.local_mac, 0);
    let mut disp = RoceDispatcher::new(2, 0, &config, fabric.clone()).unwrap();

    let tx_ring = Arc::new(WsRing::with_capacity(64));
    disp.add_ws_tx_ring(tx_ring.clone());
    let mem = disp.mem_reg();
    let avail = mem.arena().available();
    let buf = mem.alloc().unwrap();
    mem.set_payload(
        buf,
        2,
        0,
        &FrameworkHeader {
            workload_type: 0,
            segment_num: 1,
        },
        16,
    );
    tx_ring.enqueue(buf);
    disp.collect_tx();
    disp.tx_flush();
    // 缓冲立即归还，fabric 上无可收帧。
    assert_eq!(mem.arena().available(), avail);
}
