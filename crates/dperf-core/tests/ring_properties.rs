//! SPSC 环的性质验证。
//!
//! # 教案级导览
//!
//! - **Why**：环是数据面唯一的跨线程交接面，其完整性（索引落在合法区间、
//!   出队值必来自配对生产者）直接决定缓冲区所有权纪律是否成立；
//! - **How**：以 `VecDeque` 为影子模型，用 Proptest 驱动随机的入队/出队
//!   序列，逐步比对观测值与模型，同时检查长度不变量；
//! - **What**：覆盖空环出队幂等、满环拒绝、FIFO 次序与随机操作序列下的
//!   模型一致性。

use std::collections::VecDeque;

use proptest::prelude::*;

use dperf_core::buffer::BufId;
use dperf_core::ring::WsRing;

#[derive(Clone, Debug)]
enum Op {
    Enqueue(u32),
    Dequeue,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..10_000).prop_map(Op::Enqueue),
        Just(Op::Dequeue),
    ]
}

proptest! {
    /// 随机操作序列下，环与影子模型逐步一致，且长度始终落在合法区间。
    #[test]
    fn matches_shadow_model(ops in proptest::collection::vec(op_strategy(), 1..256)) {
        let capacity = 16usize;
        let ring = WsRing::with_capacity(capacity);
        let mut model: VecDeque<u32> = VecDeque::new();

        for op in ops {
            match op {
                Op::Enqueue(v) => {
                    let accepted = ring.enqueue(BufId(v));
                    if model.len() < capacity - 1 {
                        prop_assert!(accepted);
                        model.push_back(v);
                    } else {
                        prop_assert!(!accepted);
                    }
                }
                Op::Dequeue => {
                    let got = ring.dequeue();
                    prop_assert_eq!(got.map(|id| id.0), model.pop_front());
                }
            }
            prop_assert!(ring.len() < capacity);
            prop_assert_eq!(ring.len(), model.len());
        }
    }

    /// 入队后立刻出队得到同一个值（幂等律）。
    #[test]
    fn enqueue_dequeue_identity(v in 0u32..u32::MAX) {
        let ring = WsRing::with_capacity(8);
        prop_assert!(ring.enqueue(BufId(v)));
        prop_assert_eq!(ring.dequeue(), Some(BufId(v)));
        prop_assert_eq!(ring.dequeue(), None);
    }
}

/// 空环出队是无副作用的空操作。
#[test]
fn dequeue_empty_is_noop() {
    let ring = WsRing::with_capacity(4);
    assert_eq!(ring.dequeue(), None);
    assert_eq!(ring.len(), 0);
    assert!(ring.enqueue(BufId(1)));
    assert_eq!(ring.len(), 1);
}

/// 填满到容量不越界：可用槽位为容量减一，其后一律拒绝。
#[test]
fn fill_to_capacity_without_overrun() {
    let capacity = 512usize;
    let ring = WsRing::with_capacity(capacity);
    for i in 0..capacity as u32 - 1 {
        assert!(ring.enqueue(BufId(i)));
    }
    for i in 0..8u32 {
        assert!(!ring.enqueue(BufId(1000 + i)));
    }
    assert_eq!(ring.len(), capacity - 1);
    // 清空后次序保持 FIFO。
    for i in 0..capacity as u32 - 1 {
        assert_eq!(ring.dequeue(), Some(BufId(i)));
    }
    assert_eq!(ring.dequeue(), None);
}

/// 两线程各执一端并发推进时不丢值、不重复（交接纪律的冒烟验证）。
#[test]
fn spsc_cross_thread_handoff() {
    use std::sync::Arc;

    let ring = Arc::new(WsRing::with_capacity(64));
    let total = 10_000u32;

    let producer = {
        let ring = ring.clone();
        std::thread::spawn(move || {
            let mut next = 0u32;
            while next < total {
                if ring.enqueue(BufId(next)) {
                    next += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        })
    };
    let consumer = {
        let ring = ring.clone();
        std::thread::spawn(move || {
            let mut expect = 0u32;
            while expect < total {
                if let Some(id) = ring.dequeue() {
                    assert_eq!(id.0, expect);
                    expect += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        })
    };
    producer.join().unwrap();
    consumer.join().unwrap();
}
