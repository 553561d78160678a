//! IPv4 头（IHL 固定为 5，不分片）。

/// UDP 的 IP 协议号。
pub const IPPROTO_UDP: u8 = 17;
/// Don't-Fragment 标志（frag_off 字段）。
pub const IP_FLAG_DF: u16 = 0x4000;

/// IPv4 头。校验和交由硬件 offload，发射侧恒写 0。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Hdr {
    /// 总长度（IP 头 + UDP 头 + 数据，主机序）。
    pub tot_len: u16,
    /// 生存时间。
    pub ttl: u8,
    /// 协议号。
    pub protocol: u8,
    /// 源地址（主机序）。
    pub saddr: u32,
    /// 目的地址（主机序）。
    pub daddr: u32,
}

impl Ipv4Hdr {
    /// 头长度。
    pub const LEN: usize = super::IPV4_HDR_LEN;

    /// 构造数据面标准形态：DF、TTL 64、UDP。
    pub fn for_udp(tot_len: u16, saddr: u32, daddr: u32) -> Self {
        Self {
            tot_len,
            ttl: 64,
            protocol: IPPROTO_UDP,
            saddr,
            daddr,
        }
    }

    /// 写入 20 字节 IPv4 头。
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = 0x45; // version 4, IHL 5
        buf[1] = 0; // TOS
        buf[2..4].copy_from_slice(&self.tot_len.to_be_bytes());
        buf[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
        buf[6..8].copy_from_slice(&IP_FLAG_DF.to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        buf[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum offload
        buf[12..16].copy_from_slice(&self.saddr.to_be_bytes());
        buf[16..20].copy_from_slice(&self.daddr.to_be_bytes());
    }

    /// 解析 IPv4 头；长度不足或 IHL 异常返回 `None`。
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN || buf[0] != 0x45 {
            return None;
        }
        Some(Self {
            tot_len: u16::from_be_bytes([buf[2], buf[3]]),
            ttl: buf[8],
            protocol: buf[9],
            saddr: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            daddr: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }
}

/// 点分十进制字符串解析为主机序 IPv4 地址。
pub fn ipv4_from_str(s: &str) -> Option<u32> {
    let addr: std::net::Ipv4Addr = s.parse().ok()?;
    Some(u32::from(addr))
}

/// 主机序 IPv4 地址转点分十进制字符串。
pub fn ipv4_to_string(ip: u32) -> String {
    std::net::Ipv4Addr::from(ip).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_round_trip() {
        let hdr = Ipv4Hdr::for_udp(1024, ipv4_from_str("10.0.0.1").unwrap(), 0x0a000002);
        let mut buf = [0u8; Ipv4Hdr::LEN];
        hdr.write_to(&mut buf);
        let parsed = Ipv4Hdr::parse(&buf).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(parsed.ttl, 64);
        assert_eq!(parsed.protocol, IPPROTO_UDP);
        // DF 位在线上。
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), IP_FLAG_DF);
    }
}
