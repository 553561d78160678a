//! Ethernet II 头与 MAC 地址。

use core::fmt;

use crate::error::DperfError;

/// IPv4 的以太类型。
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// ARP 的以太类型。
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// 六字节 MAC 地址。
///
/// 配置文件以 `aa.bb.cc.dd.ee.ff`（点分十六进制）书写，展示时用冒号分隔。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// 全零地址（未解析占位）。
    pub const ZERO: Self = Self([0; 6]);

    /// 解析点分十六进制形式的 MAC 地址。
    pub fn parse(s: &str) -> Result<Self, DperfError> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split('.');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| DperfError::config(format!("MAC 地址字节数不足: {s}")))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| DperfError::config(format!("MAC 地址含非法十六进制段: {s}")))?;
        }
        if parts.next().is_some() {
            return Err(DperfError::config(format!("MAC 地址字节数过多: {s}")));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Ethernet II 头。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthHdr {
    /// 目的 MAC。
    pub dst: MacAddr,
    /// 源 MAC。
    pub src: MacAddr,
    /// 以太类型（主机序，线上为网络序）。
    pub ethertype: u16,
}

impl EthHdr {
    /// 头长度。
    pub const LEN: usize = super::ETH_HDR_LEN;

    /// 向缓冲区头部写入 14 字节以太头。
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..6].copy_from_slice(&self.dst.0);
        buf[6..12].copy_from_slice(&self.src.0);
        buf[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }

    /// 从缓冲区头部解析以太头；长度不足返回 `None`。
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&buf[0..6]);
        src.copy_from_slice(&buf[6..12]);
        Some(Self {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ethertype: u16::from_be_bytes([buf[12], buf[13]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parse_and_display() {
        let mac = MacAddr::parse("0c.42.a1.dd.5f.0e").unwrap();
        assert_eq!(mac.to_string(), "0c:42:a1:dd:5f:0e");
        assert!(MacAddr::parse("0c.42.a1.dd.5f").is_err());
        assert!(MacAddr::parse("0c.42.a1.dd.5f.0e.11").is_err());
        assert!(MacAddr::parse("zz.42.a1.dd.5f.0e").is_err());
    }

    #[test]
    fn eth_round_trip() {
        let hdr = EthHdr {
            dst: MacAddr([1, 2, 3, 4, 5, 6]),
            src: MacAddr([7, 8, 9, 10, 11, 12]),
            ethertype: ETHERTYPE_IPV4,
        };
        let mut buf = [0u8; EthHdr::LEN];
        hdr.write_to(&mut buf);
        assert_eq!(EthHdr::parse(&buf), Some(hdr));
    }
}
