//! 线上头部的往返律与 ARP 应答构造。

use proptest::prelude::*;

use dperf_core::limits::MTU;
use dperf_core::wire::arp::{ARP_OP_REPLY, ARP_OP_REQUEST, ArpHdr, build_arp_reply};
use dperf_core::wire::eth::{ETHERTYPE_ARP, EthHdr, MacAddr};
use dperf_core::wire::{
    FRAMEWORK_HDR_LEN, FrameworkHeader, IPV4_HDR_LEN, MAX_WIRE_PAYLOAD, UDP_HDR_LEN,
};

proptest! {
    /// 框架头：解析后再发射逐字节相同。
    #[test]
    fn framework_header_byte_identical(workload_type in any::<u8>(), segment_num in any::<u64>()) {
        let hdr = FrameworkHeader { workload_type, segment_num };
        let mut first = [0u8; FRAMEWORK_HDR_LEN];
        hdr.write_to(&mut first);
        let parsed = FrameworkHeader::parse(&first).expect("长度足够");
        prop_assert_eq!(parsed, hdr);
        let mut second = [0u8; FRAMEWORK_HDR_LEN];
        parsed.write_to(&mut second);
        prop_assert_eq!(first, second);
    }

    /// ARP 头往返。
    #[test]
    fn arp_round_trip(op in 1u16..3, spa in any::<u32>(), tpa in any::<u32>()) {
        let hdr = ArpHdr {
            hrd: 1,
            pro: 0x0800,
            hln: 6,
            pln: 4,
            op,
            sha: MacAddr([1, 2, 3, 4, 5, 6]),
            spa,
            tha: MacAddr([7, 8, 9, 10, 11, 12]),
            tpa,
        };
        let mut buf = [0u8; ArpHdr::LEN];
        hdr.write_to(&mut buf);
        prop_assert_eq!(ArpHdr::parse(&buf), Some(hdr));
    }
}

/// 单报文线上载荷上限是 MTU 扣除三层头与框架头。
#[test]
fn wire_payload_budget() {
    assert_eq!(
        MAX_WIRE_PAYLOAD,
        MTU - IPV4_HDR_LEN - UDP_HDR_LEN - FRAMEWORK_HDR_LEN
    );
}

/// 针对请求构造的 ARP 应答：op=2、sha/spa 为本端身份、目标回指请求方。
#[test]
fn arp_reply_fields() {
    let local_mac = MacAddr([0x0c, 0x42, 0xa1, 0x00, 0x00, 0x01]);
    let local_ip = u32::from(std::net::Ipv4Addr::new(10, 0, 0, 1));
    let request = ArpHdr {
        hrd: 1,
        pro: 0x0800,
        hln: 6,
        pln: 4,
        op: ARP_OP_REQUEST,
        sha: MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
        spa: u32::from(std::net::Ipv4Addr::new(10, 0, 0, 2)),
        tha: MacAddr::ZERO,
        tpa: local_ip,
    };

    let frame = build_arp_reply(&request, local_mac, local_ip);
    assert_eq!(frame.len(), EthHdr::LEN + ArpHdr::LEN);

    let eth = EthHdr::parse(&frame).unwrap();
    assert_eq!(eth.ethertype, ETHERTYPE_ARP);
    assert_eq!(eth.src, local_mac);
    assert_eq!(eth.dst, request.sha);

    let reply = ArpHdr::parse(&frame[EthHdr::LEN..]).unwrap();
    assert_eq!(reply.op, ARP_OP_REPLY);
    assert_eq!(reply.sha, local_mac);
    assert_eq!(reply.spa, local_ip);
    assert_eq!(reply.tha, request.sha);
    assert_eq!(reply.tpa, request.spa);
}
