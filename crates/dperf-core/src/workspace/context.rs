//! 工作空间共享上下文。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 上下文是一组工作空间之间唯一的共享状态：环端点注册表、内存注册
//!   描述符映射、启动/收尾屏障、聚合统计与结束信号；
//! - 注册表只在装配与收尾阶段（屏障之间）经上下文互斥锁触达，
//!   数据面不经过这里。
//!
//! ## 收尾协议（How）
//! - 每个工作空间在自身超时点调用 [`WsContext::report_completion`]：
//!   把本地小结并入聚合、递增完成计数；首个上报者翻转结束信号并成为
//!   "统计归属者"，在收尾屏障后做贡献者均值与渲染；
//! - 分发器在结束信号翻转后继续以 100 ms 为步长服务循环，
//!   直到全部工作空间完成（排空在途 RX）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use crate::buffer::MemReg;
use crate::error::{DperfError, Result};
use crate::pipeline::{WS_DISPATCHER, WS_WORKER};
use crate::ring::WsRing;
use crate::stats::{PerfStats, WsStats};

/// Worker 注册的环端点与归属。
pub struct WorkerEndpoints {
    /// TX 环（Worker 为生产者）。
    pub tx_ring: Arc<WsRing>,
    /// RX 环（Worker 为消费者）。
    pub rx_ring: Arc<WsRing>,
    /// 所属分发器 ws_id。
    pub dispatcher_ws_id: u8,
    /// 负载类型。
    pub workload_type: u8,
}

struct ContextInner {
    active_ws: Vec<u8>,
    workers: HashMap<u8, WorkerEndpoints>,
    mem_regs: HashMap<u8, MemReg>,
    perf: PerfStats,
    worker_num: usize,
    dispatcher_num: usize,
}

/// 进程级工作空间上下文。
pub struct WsContext {
    barrier: Barrier,
    inner: Mutex<ContextInner>,
    end_signal: AtomicBool,
    completed: AtomicUsize,
    active_count: usize,
}

impl WsContext {
    /// 以活跃工作空间数量创建上下文（屏障计数与之一致）。
    pub fn new(active_count: usize) -> Arc<Self> {
        Arc::new(Self {
            barrier: Barrier::new(active_count),
            inner: Mutex::new(ContextInner {
                active_ws: Vec::new(),
                workers: HashMap::new(),
                mem_regs: HashMap::new(),
                perf: PerfStats::new(),
                worker_num: 0,
                dispatcher_num: 0,
            }),
            end_signal: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
            active_count,
        })
    }

    /// 活跃工作空间数量。
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    /// 与全体工作空间同步一次。
    pub fn barrier_wait(&self) {
        self.barrier.wait();
    }

    /// 注册一个工作空间（上下文互斥锁内）。
    pub fn register(
        &self,
        ws_id: u8,
        ws_type: u8,
        worker: Option<WorkerEndpoints>,
        mem_reg: Option<MemReg>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.active_ws.contains(&ws_id) {
            return Err(DperfError::config(format!("工作空间 {ws_id} 重复注册")));
        }
        inner.active_ws.push(ws_id);
        if ws_type & WS_WORKER != 0 {
            inner.worker_num += 1;
            let endpoints = worker.ok_or_else(|| {
                DperfError::config(format!("Worker {ws_id} 未提供环端点"))
            })?;
            inner.workers.insert(ws_id, endpoints);
        }
        if ws_type & WS_DISPATCHER != 0 {
            inner.dispatcher_num += 1;
            let mem_reg = mem_reg.ok_or_else(|| {
                DperfError::config(format!("分发器 {ws_id} 未提供内存注册"))
            })?;
            if inner.mem_regs.insert(ws_id, mem_reg).is_some() {
                return Err(DperfError::config(format!("分发器 {ws_id} 重复注册")));
            }
        }
        Ok(())
    }

    /// 取某分发器的内存注册描述符（Worker 第二阶段装配）。
    pub fn mem_reg_of(&self, dispatcher_ws_id: u8) -> Option<MemReg> {
        self.inner.lock().mem_regs.get(&dispatcher_ws_id).cloned()
    }

    /// 枚举指派给某分发器的 Worker（分发器第二阶段装配）。
    pub fn workers_of(&self, dispatcher_ws_id: u8) -> Vec<(u8, u8, Arc<WsRing>, Arc<WsRing>)> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for (&ws_id, endpoints) in &inner.workers {
            if endpoints.dispatcher_ws_id == dispatcher_ws_id {
                out.push((
                    ws_id,
                    endpoints.workload_type,
                    endpoints.tx_ring.clone(),
                    endpoints.rx_ring.clone(),
                ));
            }
        }
        out.sort_by_key(|(ws_id, ..)| *ws_id);
        out
    }

    /// 结束信号是否已翻转。
    pub fn end_signal(&self) -> bool {
        self.end_signal.load(Ordering::Acquire)
    }

    /// 全部工作空间是否都已上报完成。
    pub fn all_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire) >= self.active_count
    }

    /// 上报完成：并入本地小结并递增完成计数；返回是否为首个上报者。
    pub fn report_completion(
        &self,
        stats: &WsStats,
        freq_ghz: f64,
        duration_secs: u64,
        pool_size: usize,
    ) -> bool {
        {
            let mut inner = self.inner.lock();
            inner.perf.merge_ws(stats, freq_ghz, duration_secs, pool_size);
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
        !self.end_signal.swap(true, Ordering::AcqRel)
    }

    /// 收尾：按贡献者数量取均值并渲染表格（统计归属者调用一次）。
    pub fn finalize_and_render(&self) -> String {
        let mut inner = self.inner.lock();
        let (worker_num, dispatcher_num) = (inner.worker_num, inner.dispatcher_num);
        inner.perf.finalize(worker_num, dispatcher_num);
        inner.perf.render()
    }

    /// 聚合统计快照（测试与诊断用）。
    pub fn perf_snapshot(&self) -> PerfStats {
        self.inner.lock().perf.clone()
    }

    /// 重置一轮迭代的共享状态（统计归属者在收尾屏障后调用）。
    pub fn reset_round(&self) {
        let mut inner = self.inner.lock();
        inner.perf = PerfStats::new();
        self.completed.store(0, Ordering::Release);
        self.end_signal.store(false, Ordering::Release);
    }
}
