//! 框架头：UDP 与载荷之间的两字段头。
//!
//! # 契约说明（What）
//! - `workload_type` 驱动分发器的 RuleTable 分流；
//! - `segment_num` 是所属逻辑消息的分片总数，同一消息的全部分片携带
//!   相同的值，且在生产者的 TX 环上连续；
//! - 编码固定 9 字节小端，解析后再发射必须得到逐字节相同的序列。

/// 框架头。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameworkHeader {
    /// 工作负载类型。
    pub workload_type: u8,
    /// 所属消息的分片总数。
    pub segment_num: u64,
}

impl FrameworkHeader {
    /// 编码长度。
    pub const LEN: usize = super::FRAMEWORK_HDR_LEN;

    /// 写入 9 字节框架头。
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.workload_type;
        buf[1..9].copy_from_slice(&self.segment_num.to_le_bytes());
    }

    /// 解析框架头；长度不足返回 `None`。
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let mut seg = [0u8; 8];
        seg.copy_from_slice(&buf[1..9]);
        Some(Self {
            workload_type: buf[0],
            segment_num: u64::from_le_bytes(seg),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_identical_round_trip() {
        let hdr = FrameworkHeader {
            workload_type: 3,
            segment_num: 4,
        };
        let mut first = [0u8; FrameworkHeader::LEN];
        hdr.write_to(&mut first);
        let parsed = FrameworkHeader::parse(&first).unwrap();
        let mut second = [0u8; FrameworkHeader::LEN];
        parsed.write_to(&mut second);
        assert_eq!(first, second);
    }
}
