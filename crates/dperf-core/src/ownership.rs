//! 进程级 NIC 队列对属主管理。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 同一物理端口被多个分发器共享，每个分发器必须独占一条 TX/RX 队列对；
//!   属主表集中仲裁 (端口, qp) 槽位的预留与归还；
//! - 槽位记录属主 PID 与随机进程标签：PID 在属主崩溃后可能被系统复用，
//!   标签用于检出 "同 PID 不同进程" 的复用场景并拒绝继续。
//!
//! ## 逻辑（How）
//! - 单把互斥锁串行化全部操作（仅初始化与回收路径触达，锁期有界）；
//! - `free_count` 冗余维护，并以不变量 `free_count == count(pid == 0)`
//!   约束实现（调试断言 + 测试校验）；
//! - 守护进程专用的 [`OwnershipTable::reclaim_from_crashed`] 以 0 号信号
//!   探测属主存活，回收死亡属主的槽位——已知的 PID 复用竞态在此被接受。
//!
//! ## 契约（What）
//! - [`OwnershipTable::get_qp`]：发现同 PID 异标签即返回 `NicFatal`；
//!   否则占用首个空槽并递减空闲计数；全部占用返回 `ResourceExhausted`；
//! - [`OwnershipTable::free_qp`]：校验属主后复位槽位；重复释放与越权释放
//!   都是错误。

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{DperfError, Result};
use crate::limits::{MAX_PHY_PORTS, MAX_QUEUES_PER_PORT};

#[derive(Clone, Copy, Default)]
struct QpSlot {
    pid: u32,
    proc_tag: u64,
}

struct Inner {
    slots: [[QpSlot; MAX_QUEUES_PER_PORT]; MAX_PHY_PORTS],
    free_count: [usize; MAX_PHY_PORTS],
    epoch: u64,
}

impl Inner {
    fn assert_free_count(&self, phy_port: usize) {
        debug_assert_eq!(
            self.free_count[phy_port],
            self.slots[phy_port].iter().filter(|s| s.pid == 0).count(),
        );
    }
}

/// 队列对属主表。
pub struct OwnershipTable {
    inner: Mutex<Inner>,
}

impl OwnershipTable {
    /// 创建空表（每端口 [`MAX_QUEUES_PER_PORT`] 个空槽）。
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: [[QpSlot::default(); MAX_QUEUES_PER_PORT]; MAX_PHY_PORTS],
                free_count: [MAX_QUEUES_PER_PORT; MAX_PHY_PORTS],
                epoch: 0,
            }),
        }
    }

    /// 进程级单例。
    pub fn global() -> &'static Arc<OwnershipTable> {
        static GLOBAL: OnceLock<Arc<OwnershipTable>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(OwnershipTable::new()))
    }

    /// 以当前进程身份预留一条空闲队列对。
    pub fn get_qp(&self, phy_port: usize, proc_tag: u64) -> Result<usize> {
        self.get_qp_for(phy_port, std::process::id(), proc_tag)
    }

    /// 以显式 PID 预留队列对（守护工具与 PID 复用测试入口）。
    pub fn get_qp_for(&self, phy_port: usize, pid: u32, proc_tag: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.epoch += 1;

        for slot in &inner.slots[phy_port] {
            if slot.pid == pid && slot.proc_tag != proc_tag {
                return Err(DperfError::nic_fatal(format!(
                    "检出与本进程相同的 PID {pid}（进程标签 本地 {proc_tag} / 表内 {}），疑似 PID 复用",
                    slot.proc_tag
                )));
            }
        }

        match inner.slots[phy_port].iter().position(|slot| slot.pid == 0) {
            Some(qp_id) => {
                inner.slots[phy_port][qp_id] = QpSlot { pid, proc_tag };
                inner.free_count[phy_port] -= 1;
                inner.assert_free_count(phy_port);
                Ok(qp_id)
            }
            None => Err(DperfError::exhausted(format!(
                "端口 {phy_port} 的全部 {MAX_QUEUES_PER_PORT} 条队列对均被占用"
            ))),
        }
    }

    /// 归还先前预留的队列对。
    pub fn free_qp(&self, phy_port: usize, qp_id: usize) -> Result<()> {
        self.free_qp_for(phy_port, qp_id, std::process::id())
    }

    fn free_qp_for(&self, phy_port: usize, qp_id: usize, pid: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        let slot = inner.slots[phy_port][qp_id];
        if slot.pid == 0 {
            return Err(DperfError::nic_fatal(format!(
                "PID {pid} 试图释放已空闲的队列对 {qp_id}"
            )));
        }
        if slot.pid != pid {
            return Err(DperfError::nic_fatal(format!(
                "PID {pid} 试图释放 PID {} 持有的队列对 {qp_id}",
                slot.pid
            )));
        }
        inner.slots[phy_port][qp_id] = QpSlot::default();
        inner.free_count[phy_port] += 1;
        inner.assert_free_count(phy_port);
        Ok(())
    }

    /// 守护进程专用：回收属主已不存在的槽位。
    ///
    /// 以 0 号信号探测存活；接受已知的 PID 复用竞态。
    pub fn reclaim_from_crashed(&self, phy_port: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut reclaimed = 0;
        for qp_id in 0..MAX_QUEUES_PER_PORT {
            let slot = inner.slots[phy_port][qp_id];
            if slot.pid != 0 && !process_alive(slot.pid) {
                warn!(qp_id, pid = slot.pid, "回收崩溃进程持有的队列对");
                inner.slots[phy_port][qp_id] = QpSlot::default();
                inner.free_count[phy_port] += 1;
                reclaimed += 1;
            }
        }
        inner.assert_free_count(phy_port);
        reclaimed
    }

    /// 指定端口当前的空闲队列对数量。
    pub fn free_count(&self, phy_port: usize) -> usize {
        self.inner.lock().free_count[phy_port]
    }

    /// 属主变更的单调纪元（诊断用）。
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// 端口占用概要，诊断输出用。
    pub fn summary(&self, phy_port: usize) -> String {
        let inner = self.inner.lock();
        let mut out = format!(
            "[{} QPs of {} available] ",
            inner.free_count[phy_port], MAX_QUEUES_PER_PORT
        );
        for (qp_id, slot) in inner.slots[phy_port].iter().enumerate() {
            if slot.pid != 0 {
                out.push_str(&format!("[QP #{qp_id}, PID {}] ", slot.pid));
            }
        }
        out
    }
}

impl Default for OwnershipTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}
