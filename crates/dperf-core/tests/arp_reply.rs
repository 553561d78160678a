//! ARP 旁路：命中本地 IPv4 的无偿 ARP REQUEST 触发恰好一帧 REPLY。

use std::sync::{Arc, Mutex};

use dperf_core::UserConfig;
use dperf_core::dispatcher::Dispatcher;
use dperf_core::dispatcher::dpdk::DpdkDispatcher;
use dperf_core::dispatcher::nic::LoopbackFabric;
use dperf_core::wire::arp::{ARP_OP_REPLY, ARP_OP_REQUEST, ArpHdr};
use dperf_core::wire::eth::{ETHERTYPE_ARP, EthHdr, MacAddr};
use dperf_core::wire::ipv4::ipv4_from_str;

// 队列对来自进程级属主表，串行执行保证 ARP 场景拿到队列 0。
static QP_LOCK: Mutex<()> = Mutex::new(());

fn config() -> Arc<UserConfig> {
    Arc::new(
        UserConfig::parse(
            "numa:0\nphy_port:0\niteration:1\nduration:1\n\
             local_ip:10.0.0.1\nremote_ip:10.0.0.2\n\
             local_mac:0c.42.a1.dd.5f.0e\nremote_mac:0c.42.a1.dd.5f.0f\n",
        )
        .unwrap(),
    )
}

fn gratuitous_arp_request(sender_mac: MacAddr, sender_ip: u32, target_ip: u32) -> Vec<u8> {
    let mut frame = vec![0u8; EthHdr::LEN + ArpHdr::LEN];
    EthHdr {
        dst: MacAddr([0xff; 6]),
        src: sender_mac,
        ethertype: ETHERTYPE_ARP,
    }
    .write_to(&mut frame);
    ArpHdr {
        hrd: 1,
        pro: 0x0800,
        hln: 6,
        pln: 4,
        op: ARP_OP_REQUEST,
        sha: sender_mac,
        spa: sender_ip,
        tha: MacAddr::ZERO,
        tpa: target_ip,
    }
    .write_to(&mut frame[EthHdr::LEN..]);
    frame
}

/// 注入 `tpa == 本地 IPv4` 的请求：线上出现恰好一帧 REPLY，
/// `op=2`、`sha=本地 MAC`、`spa=本地 IPv4`。
#[test]
fn arp_request_for_local_ip_gets_one_reply() {
    let _guard = QP_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let config = config();
    let fabric = LoopbackFabric::new();
    fabric.add_port(0, config.server.local_mac, 0);

    // 进程内首个分发器实例占据队列对 0，ARP 规则也指向队列 0。
    let mut disp = DpdkDispatcher::new(0, 0, &config, fabric.clone()).unwrap();

    let local_ip = ipv4_from_str("10.0.0.1").unwrap();
    let peer_ip = ipv4_from_str("10.0.0.2").unwrap();
    let peer_mac = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
    fabric.inject(0, gratuitous_arp_request(peer_mac, peer_ip, local_ip));

    assert!(disp.rx_burst() > 0, "ARP 帧未进入接收暂存");
    let outcome = disp.dispatch_rx();
    // ARP 旁路既不算分流也不算丢弃。
    assert_eq!(outcome.dispatched, 0);
    assert_eq!(outcome.dropped, 0);

    let tx_log = fabric.take_tx_log(0);
    assert_eq!(tx_log.len(), 1, "应当恰好发出一帧应答");
    let frame = &tx_log[0];
    let eth = EthHdr::parse(frame).unwrap();
    assert_eq!(eth.ethertype, ETHERTYPE_ARP);
    assert_eq!(eth.dst, peer_mac);
    let reply = ArpHdr::parse(&frame[EthHdr::LEN..]).unwrap();
    assert_eq!(reply.op, ARP_OP_REPLY);
    assert_eq!(reply.sha, config.server.local_mac);
    assert_eq!(reply.spa, local_ip);
    assert_eq!(reply.tpa, peer_ip);
}

/// 目标不是本端 IPv4 的请求被静默忽略，不产生应答。
#[test]
fn arp_request_for_other_ip_is_ignored() {
    let _guard = QP_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let config = config();
    let fabric = LoopbackFabric::new();
    fabric.add_port(0, config.server.local_mac, 0);
    let mut disp = DpdkDispatcher::new(1, 0, &config, fabric.clone()).unwrap();

    let other_ip = ipv4_from_str("10.0.0.99").unwrap();
    let peer_ip = ipv4_from_str("10.0.0.2").unwrap();
    let peer_mac = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);
    fabric.inject(0, gratuitous_arp_request(peer_mac, peer_ip, other_ip));

    disp.rx_burst();
    disp.dispatch_rx();
    assert!(fabric.take_tx_log(0).is_empty());
}
