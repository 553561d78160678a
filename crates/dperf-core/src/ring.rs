//! 应用与分发器之间的无锁 SPSC 环。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - TX 方向应用是生产者、分发器是消费者；RX 方向相反。两端各自只触碰
//!   一个索引端点，因此环上不需要任何锁或 CAS；
//! - 环中流转的是内存池内的类型化索引 [`BufId`]，而非裸指针，
//!   缓冲区所有权随出入队转移（入队前属生产者，出队后属消费者）。
//!
//! ## 核心逻辑（How）
//! - 容量为二的幂，索引推进只做掩码运算；
//! - 发布顺序即同步协议：生产者先写槽位、再以 `Release` 推进尾索引；
//!   消费者以 `Acquire` 读尾索引、再读槽位。除这一对索引之外数据面
//!   没有其它栅栏；
//! - 满判定 `next(tail) == head`，因此可用槽位数为 `容量 - 1`。
//!
//! ## 契约（What）
//! - [`WsRing::enqueue`] 满时返回 `false`，调用方负责释放缓冲并记一次丢弃；
//! - [`WsRing::dequeue`] 空时返回 `None`，是无副作用的空操作；
//! - 不变量：任意时刻 `0 ≤ (tail - head) mod 容量 < 容量`；
//!   出队得到的一定是配对生产者先前入队的值。
//!
//! ## 风险提示（Trade-offs）
//! - 环本身不校验 "单生产者单消费者" 纪律，多生产者并发入队属于契约违例；
//!   仓内的装配逻辑保证每个端点只交给一个线程。

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::buffer::BufId;
use crate::limits::WS_RING_CAP;

/// 定容单生产者/单消费者环。
pub struct WsRing {
    slots: Box<[AtomicU32]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    mask: usize,
}

impl WsRing {
    /// 以默认容量（[`WS_RING_CAP`]）创建环。
    pub fn new() -> Self {
        Self::with_capacity(WS_RING_CAP)
    }

    /// 以给定容量创建环。
    ///
    /// # Panics
    /// 容量不是二的幂或小于 2 时 panic（装配期错误，不进入数据面）。
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= 2,
            "环容量必须是二的幂"
        );
        let slots = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        Self {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            mask: capacity - 1,
        }
    }

    /// 入队一个缓冲区索引；环满返回 `false`。
    #[inline]
    pub fn enqueue(&self, id: BufId) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) & self.mask;
        if next == self.head.load(Ordering::Acquire) {
            return false;
        }
        self.slots[tail].store(id.0, Ordering::Relaxed);
        self.tail.store(next, Ordering::Release);
        true
    }

    /// 出队一个缓冲区索引；环空返回 `None`。
    #[inline]
    pub fn dequeue(&self) -> Option<BufId> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let id = BufId(self.slots[head].load(Ordering::Relaxed));
        self.head.store((head + 1) & self.mask, Ordering::Release);
        Some(id)
    }

    /// 当前队列长度（观察值，两端并发推进时只保证落在合法区间）。
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }

    /// 队列是否为空。
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 环容量（含保留槽，可用槽位为 `capacity() - 1`）。
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }
}

impl Default for WsRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_to_capacity_then_reject() {
        let ring = WsRing::with_capacity(8);
        for i in 0..7 {
            assert!(ring.enqueue(BufId(i)));
        }
        // 第 8 个入队触及保留槽，必须拒绝。
        assert!(!ring.enqueue(BufId(7)));
        assert_eq!(ring.len(), 7);
    }

    #[test]
    fn dequeue_on_empty_is_noop() {
        let ring = WsRing::with_capacity(4);
        assert!(ring.dequeue().is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn fifo_order_preserved() {
        let ring = WsRing::with_capacity(4);
        assert!(ring.enqueue(BufId(11)));
        assert!(ring.enqueue(BufId(22)));
        assert_eq!(ring.dequeue(), Some(BufId(11)));
        assert_eq!(ring.dequeue(), Some(BufId(22)));
        assert_eq!(ring.dequeue(), None);
    }
}
