//! 模拟工作负载的消息处理器。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 基准框架不运行真实业务，而是以一组行为骨架模拟典型服务端负载的
//!   CPU/内存特征：吞吐密集（分布式文件系统）、时延密集（RPC）、
//!   内存密集（内存数据库）、文件读写（FS-READ/FS-WRITE）与 KV 查询；
//! - 处理器以响应载荷**就地改写**请求缓冲（零拷贝回射），副作用
//!   （扫描、外部内存访问、KV 查询）发生在改写之前。
//!
//! ## 契约（What）
//! - `handle` 收到一批完整消息的全部报文（`bufs`），按环境参数把每个
//!   报文改写为响应形态；调用方负责随后入 TX 环与丢弃记账；
//! - 处理器运行在 Worker 线程上，对 `bufs` 拥有独占所有权。

use crate::buffer::{BufId, MemReg};
use crate::limits::{MEM_ACCESS_RANGE_PER_PKT, MTU, STATEFUL_MEMORY_PER_CORE};
use crate::wire::{FrameworkHeader, PAYLOAD_OFFSET};

use super::kv::{Kv, KvKey, KvValue, KV_KEY_SIZE, KV_VALUE_SIZE};

/// 逐核心的有状态内存区（模拟外部状态）。
pub struct StatefulMemory {
    memory: Vec<u8>,
    access_ptr: usize,
}

impl StatefulMemory {
    /// 预触碰分配。
    pub fn new() -> Self {
        Self {
            memory: vec![b'a'; STATEFUL_MEMORY_PER_CORE],
            access_ptr: 0,
        }
    }

    /// 按 8 字节步进写一段外部内存（M-APP 的访问核）。
    pub fn touch_range(&mut self) {
        let words = STATEFUL_MEMORY_PER_CORE / 8;
        for _ in 0..MEM_ACCESS_RANGE_PER_PKT / 8 {
            self.access_ptr = (self.access_ptr + 1) % words;
            let offset = self.access_ptr * 8;
            let bytes = (self.access_ptr as u64).to_le_bytes();
            self.memory[offset..offset + 8].copy_from_slice(&bytes);
        }
    }

    /// 把一段报文载荷写进外部内存（FS-WRITE）。
    pub fn absorb(&mut self, payload: &[u8]) {
        let slots = STATEFUL_MEMORY_PER_CORE / MTU;
        self.access_ptr = (self.access_ptr + 1) % slots;
        let offset = self.access_ptr * MTU;
        let n = payload.len().min(MTU);
        self.memory[offset..offset + n].copy_from_slice(&payload[..n]);
    }

    /// 从外部内存读出一段（FS-READ）。
    pub fn read_block(&mut self, out: &mut [u8]) {
        let slots = STATEFUL_MEMORY_PER_CORE / MTU;
        self.access_ptr = (self.access_ptr + 1) % slots;
        let offset = self.access_ptr * MTU;
        let n = out.len().min(MTU);
        out[..n].copy_from_slice(&self.memory[offset..offset + n]);
    }
}

impl Default for StatefulMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// 处理器运行环境：响应的头部参数与副作用后端。
pub struct AppEnv<'a> {
    /// 内存注册描述符。
    pub mem_reg: &'a MemReg,
    /// 外部状态内存。
    pub stateful: &'a mut StatefulMemory,
    /// KV 存储。
    pub kv: &'a mut Kv,
    /// 响应源端口（裸 ws_id）。
    pub src_port: u16,
    /// 响应目的端口（轮询选出的远端分发器）。
    pub dst_port: u16,
    /// 响应框架头。
    pub hdr: FrameworkHeader,
    /// 响应载荷字节数。
    pub resp_payload: usize,
}

/// 消息处理器契约。
pub trait MsgHandler: Send {
    /// 把一批完整消息的报文就地改写为响应。
    fn handle(&mut self, env: &mut AppEnv<'_>, bufs: &[BufId], msg_num: usize);
}

/// T-APP：收大包、扫描、回小响应（如分布式文件系统）。
pub struct ThroughputIntenseApp;

impl MsgHandler for ThroughputIntenseApp {
    fn handle(&mut self, env: &mut AppEnv<'_>, bufs: &[BufId], _msg_num: usize) {
        for &id in bufs {
            env.mem_reg
                .set_payload(id, env.src_port, env.dst_port, &env.hdr, env.resp_payload);
        }
    }
}

/// L-APP：收小包、扫描、回小响应（如 RPC 服务端）。
pub struct LatencyIntenseApp;

impl MsgHandler for LatencyIntenseApp {
    fn handle(&mut self, env: &mut AppEnv<'_>, bufs: &[BufId], _msg_num: usize) {
        for &id in bufs {
            scan_payload(env.mem_reg, id);
            env.mem_reg
                .set_payload(id, env.src_port, env.dst_port, &env.hdr, env.resp_payload);
        }
    }
}

/// M-APP：收小包、触碰外部内存、回小响应（如内存数据库）。
pub struct MemoryIntenseApp;

impl MsgHandler for MemoryIntenseApp {
    fn handle(&mut self, env: &mut AppEnv<'_>, bufs: &[BufId], _msg_num: usize) {
        for &id in bufs {
            env.stateful.touch_range();
            env.mem_reg
                .set_payload(id, env.src_port, env.dst_port, &env.hdr, env.resp_payload);
        }
    }
}

/// FS-WRITE：收大消息、载荷落外部内存、回小响应。
pub struct FsWriteApp;

impl MsgHandler for FsWriteApp {
    fn handle(&mut self, env: &mut AppEnv<'_>, bufs: &[BufId], msg_num: usize) {
        for &id in bufs {
            let arena = env.mem_reg.arena();
            let len = arena.len(id);
            if len > PAYLOAD_OFFSET {
                // SAFETY: Worker 独占该单元。
                let payload =
                    unsafe { &arena.bytes(id)[PAYLOAD_OFFSET..len] }.to_vec();
                env.stateful.absorb(&payload);
            }
        }
        // 每条消息回一个小响应（复用消息首报文之后的单元数在调用方回收）。
        for &id in bufs.iter().take(msg_num) {
            env.mem_reg
                .set_payload(id, env.src_port, env.dst_port, &env.hdr, env.resp_payload);
        }
    }
}

/// FS-READ：收小请求、读外部内存、回大响应。
pub struct FsReadApp;

impl MsgHandler for FsReadApp {
    fn handle(&mut self, env: &mut AppEnv<'_>, bufs: &[BufId], _msg_num: usize) {
        for &id in bufs {
            env.mem_reg
                .set_payload(id, env.src_port, env.dst_port, &env.hdr, env.resp_payload);
            let arena = env.mem_reg.arena();
            let len = arena.len(id);
            if len > PAYLOAD_OFFSET {
                // SAFETY: Worker 独占该单元。
                let payload = unsafe { &mut arena.bytes_mut(id)[PAYLOAD_OFFSET..len] };
                env.stateful.read_block(payload);
            }
        }
    }
}

/// KV：从载荷取键、查表、把值写进响应。
pub struct KvApp;

impl MsgHandler for KvApp {
    fn handle(&mut self, env: &mut AppEnv<'_>, bufs: &[BufId], _msg_num: usize) {
        for &id in bufs {
            let arena = env.mem_reg.arena();
            let mut key: KvKey = [0; KV_KEY_SIZE];
            if arena.len(id) >= PAYLOAD_OFFSET + KV_KEY_SIZE {
                // SAFETY: Worker 独占该单元。
                let bytes = unsafe { arena.bytes(id) };
                key.copy_from_slice(&bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + KV_KEY_SIZE]);
            }
            let value: KvValue = env.kv.get(&key).copied().unwrap_or([0; KV_VALUE_SIZE]);
            let resp = env.resp_payload.max(KV_VALUE_SIZE + 1);
            env.mem_reg
                .set_payload(id, env.src_port, env.dst_port, &env.hdr, resp);
            // SAFETY: 同上，载荷区刚被重写为响应形态。
            let bytes = unsafe { arena.bytes_mut(id) };
            bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + KV_VALUE_SIZE].copy_from_slice(&value);
        }
    }
}

/// 扫描载荷（逐字节读，阻止优化器消除）。
fn scan_payload(mem_reg: &MemReg, id: BufId) {
    let arena = mem_reg.arena();
    let len = arena.len(id);
    if len <= PAYLOAD_OFFSET {
        return;
    }
    // SAFETY: Worker 独占该单元。
    let bytes = unsafe { arena.bytes(id) };
    let mut acc = 0u8;
    for &b in &bytes[PAYLOAD_OFFSET..len] {
        acc = acc.wrapping_add(b);
    }
    std::hint::black_box(acc);
}

/// 默认处理器（吞吐密集形态）。
pub fn default_handler() -> Box<dyn MsgHandler> {
    Box::new(ThroughputIntenseApp)
}
