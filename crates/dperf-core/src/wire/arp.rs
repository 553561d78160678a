//! ARP 头与应答构造。
//!
//! 分发器只响应目标协议地址命中本端口 IPv4 的 ARP REQUEST，
//! 应答帧在本地就地构造后立即发出；其余 ARP 报文记录日志后丢弃。

use super::eth::{ETHERTYPE_ARP, EthHdr, MacAddr};

/// 以太网硬件类型。
pub const ARP_HRD_ETHER: u16 = 1;
/// ARP 请求操作码。
pub const ARP_OP_REQUEST: u16 = 1;
/// ARP 应答操作码。
pub const ARP_OP_REPLY: u16 = 2;

/// ARP 头（以太网 + IPv4 形态，28 字节）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpHdr {
    /// 硬件类型。
    pub hrd: u16,
    /// 协议类型。
    pub pro: u16,
    /// 硬件地址长度。
    pub hln: u8,
    /// 协议地址长度。
    pub pln: u8,
    /// 操作码。
    pub op: u16,
    /// 发送方硬件地址。
    pub sha: MacAddr,
    /// 发送方协议地址（主机序）。
    pub spa: u32,
    /// 目标硬件地址。
    pub tha: MacAddr,
    /// 目标协议地址（主机序）。
    pub tpa: u32,
}

impl ArpHdr {
    /// 头长度。
    pub const LEN: usize = 28;

    /// 写入 28 字节 ARP 头。
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.hrd.to_be_bytes());
        buf[2..4].copy_from_slice(&self.pro.to_be_bytes());
        buf[4] = self.hln;
        buf[5] = self.pln;
        buf[6..8].copy_from_slice(&self.op.to_be_bytes());
        buf[8..14].copy_from_slice(&self.sha.0);
        buf[14..18].copy_from_slice(&self.spa.to_be_bytes());
        buf[18..24].copy_from_slice(&self.tha.0);
        buf[24..28].copy_from_slice(&self.tpa.to_be_bytes());
    }

    /// 解析 ARP 头；长度不足返回 `None`。
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let mut sha = [0u8; 6];
        let mut tha = [0u8; 6];
        sha.copy_from_slice(&buf[8..14]);
        tha.copy_from_slice(&buf[18..24]);
        Some(Self {
            hrd: u16::from_be_bytes([buf[0], buf[1]]),
            pro: u16::from_be_bytes([buf[2], buf[3]]),
            hln: buf[4],
            pln: buf[5],
            op: u16::from_be_bytes([buf[6], buf[7]]),
            sha: MacAddr(sha),
            spa: u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
            tha: MacAddr(tha),
            tpa: u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }
}

/// 针对一条 ARP REQUEST 构造完整应答帧（以太头 + ARP 头，42 字节）。
///
/// 应答以本端口 MAC 为 `sha`、本端口 IPv4 为 `spa`，目标字段回指请求方。
pub fn build_arp_reply(request: &ArpHdr, local_mac: MacAddr, local_ip: u32) -> Vec<u8> {
    let mut frame = vec![0u8; EthHdr::LEN + ArpHdr::LEN];
    EthHdr {
        dst: request.sha,
        src: local_mac,
        ethertype: ETHERTYPE_ARP,
    }
    .write_to(&mut frame);
    ArpHdr {
        hrd: ARP_HRD_ETHER,
        pro: super::eth::ETHERTYPE_IPV4,
        hln: 6,
        pln: 4,
        op: ARP_OP_REPLY,
        sha: local_mac,
        spa: local_ip,
        tha: request.sha,
        tpa: request.spa,
    }
    .write_to(&mut frame[EthHdr::LEN..]);
    frame
}
