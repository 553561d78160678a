//! 内存注册的缓冲区池与交接描述符。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 缓冲区本体集中在分发器注册的定长池（大页 slab 的进程内等价物）中，
//!   环上流转的只是类型化索引 [`BufId`]，消除裸指针与引用计数；
//! - DPDK 形态的内存池与 RoCE 形态的大页 slab 在此统一为 [`BufferArena`]：
//!   自由链表承接普通分配，`reserve_ring` 划出常驻接收环的单元，
//!   后者以 {Posted, AppOwned, Free} 三态机支撑零拷贝的惰性重投递；
//! - Worker 不直接持有池，只通过分发器暴露的 [`MemReg`] 描述符分配与归还，
//!   这是应用半体与分发半体之间唯一的内存交接面。
//!
//! ## 核心逻辑（How）
//! - 每单元 [`MBUF_SIZE`](crate::limits::MBUF_SIZE) 字节，帧从偏移 0 起存放，
//!   头部偏移见 [`wire`](crate::wire)；
//! - 单元元数据（长度、状态、环内后继）全部是原子量：长度与状态由当前
//!   属主写、分发器读（惰性重投递只依赖 `state` 的单字节可见性）；
//! - 自由链表由一把锁保护（装配与归还路径，不在逐字节热路径上）。
//!
//! ## 契约（What）
//! - **所有权纪律**：任一时刻一个 `BufId` 至多被一个环槽或一个栈上变量引用，
//!   持有者才可调用写入类方法；该纪律由环的交接顺序保证，池本身不检查；
//! - [`BufferArena::release`] 对环常驻单元只翻转状态为 `Free`（等待重投递），
//!   对普通单元归还自由链表；
//! - 低层字节访问（[`BufferArena::bytes`] / [`BufferArena::bytes_mut`]）是
//!   `unsafe`：调用方必须保证自己是该单元的唯一属主。
//!
//! ## 取舍（Trade-offs）
//! - 写入类高层方法（`set_payload` 等）保持安全签名、以文档契约约束属主，
//!   开销与裸指针接口对等；违反所有权纪律属于装配错误而非可恢复错误。

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{DperfError, Result};
use crate::limits::MBUF_SIZE;
use crate::timing::FastRand;
use crate::wire::{
    FRAMEWORK_OFFSET, FrameworkHeader, PAYLOAD_OFFSET, TOTAL_HEADER_LEN, UDP_OFFSET, UdpHdr,
};

/// 池内缓冲区的类型化索引。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufId(pub u32);

/// 缓冲区单元状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BufState {
    /// 已投递给 NIC（接收环单元等待完成）。
    Posted = 0,
    /// 应用持有中。
    AppOwned = 1,
    /// 空闲，等待重投递或已在自由链表。
    Free = 2,
}

impl BufState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Posted,
            1 => Self::AppOwned,
            _ => Self::Free,
        }
    }
}

struct CellMeta {
    len: AtomicU32,
    state: AtomicU8,
    next: AtomicU32,
    ring_resident: AtomicU8, // 0/1，装配期写入
}

/// 定长缓冲区池。
pub struct BufferArena {
    name: String,
    lookup_key: u32,
    cells: Box<[UnsafeCell<[u8; MBUF_SIZE]>]>,
    meta: Box<[CellMeta]>,
    free: Mutex<Vec<u32>>,
}

// SAFETY: 单元内容的并发纪律由所有权交接（环的 release/acquire 索引）保证，
// 元数据全部为原子量，自由链表有锁。
unsafe impl Send for BufferArena {}
unsafe impl Sync for BufferArena {}

impl BufferArena {
    /// 创建 `capacity` 个单元的池。`name` 用于进程内池注册表检索
    /// （DPDK 形态命名 `dperf-mp-<port>-<qp>`）。
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let cells = (0..capacity)
            .map(|_| UnsafeCell::new([0u8; MBUF_SIZE]))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let meta = (0..capacity)
            .map(|_| CellMeta {
                len: AtomicU32::new(0),
                state: AtomicU8::new(BufState::Free as u8),
                next: AtomicU32::new(0),
                ring_resident: AtomicU8::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // 倒序压栈，让首次分配从低序号开始。
        let free = (0..capacity as u32).rev().collect();
        Self {
            name: name.into(),
            lookup_key: FastRand::new().next_u32(),
            cells,
            meta,
            free: Mutex::new(free),
        }
    }

    /// 池名。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 不透明的 NIC 检索键（内存注册 lkey 的等价物）。
    pub fn lookup_key(&self) -> u32 {
        self.lookup_key
    }

    /// 池容量。
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// 自由链表中的可用单元数。
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// 已离开自由链表的单元数（含接收环常驻单元）。
    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }

    /// 分配一个单元；池空返回 `None`。
    pub fn alloc(&self) -> Option<BufId> {
        let idx = self.free.lock().pop()?;
        let meta = &self.meta[idx as usize];
        meta.state.store(BufState::AppOwned as u8, Ordering::Relaxed);
        meta.len.store(0, Ordering::Relaxed);
        Some(BufId(idx))
    }

    /// 批量分配 `n` 个单元，全有或全无；成功时追加到 `out`。
    pub fn alloc_bulk(&self, n: usize, out: &mut Vec<BufId>) -> bool {
        let mut free = self.free.lock();
        if free.len() < n {
            return false;
        }
        for _ in 0..n {
            let idx = free.pop().expect("长度已校验");
            let meta = &self.meta[idx as usize];
            meta.state.store(BufState::AppOwned as u8, Ordering::Relaxed);
            meta.len.store(0, Ordering::Relaxed);
            out.push(BufId(idx));
        }
        true
    }

    /// 归还一个单元：环常驻单元翻转为 `Free` 等待重投递，
    /// 普通单元回到自由链表。
    pub fn release(&self, id: BufId) {
        let meta = &self.meta[id.0 as usize];
        meta.state.store(BufState::Free as u8, Ordering::Release);
        if meta.ring_resident.load(Ordering::Relaxed) == 0 {
            self.free.lock().push(id.0);
        }
    }

    /// 批量归还。
    pub fn release_bulk(&self, ids: &[BufId]) {
        for &id in ids {
            self.release(id);
        }
    }

    /// 从自由链表划出 `n` 个常驻单元构成循环接收环：
    /// 标记 ring-resident、建立 `next` 循环链、初态 `Posted`。
    pub fn reserve_ring(&self, n: usize) -> Result<Vec<BufId>> {
        let mut free = self.free.lock();
        if free.len() < n {
            return Err(DperfError::exhausted(format!(
                "池 {} 仅余 {} 个单元，无法划出 {} 项接收环",
                self.name,
                free.len(),
                n
            )));
        }
        let ids: Vec<BufId> = (0..n).map(|_| BufId(free.pop().expect("长度已校验"))).collect();
        drop(free);
        for (i, &id) in ids.iter().enumerate() {
            let meta = &self.meta[id.0 as usize];
            meta.ring_resident.store(1, Ordering::Relaxed);
            meta.state.store(BufState::Posted as u8, Ordering::Relaxed);
            meta.next.store(ids[(i + 1) % n].0, Ordering::Relaxed);
        }
        Ok(ids)
    }

    /// 单元状态。
    pub fn state(&self, id: BufId) -> BufState {
        BufState::from_u8(self.meta[id.0 as usize].state.load(Ordering::Acquire))
    }

    /// 设置单元状态。
    pub fn set_state(&self, id: BufId, state: BufState) {
        self.meta[id.0 as usize]
            .state
            .store(state as u8, Ordering::Release);
    }

    /// 单元内帧长度。
    pub fn len(&self, id: BufId) -> usize {
        self.meta[id.0 as usize].len.load(Ordering::Relaxed) as usize
    }

    /// 设置单元内帧长度。
    pub fn set_len(&self, id: BufId, len: usize) {
        debug_assert!(len <= MBUF_SIZE);
        self.meta[id.0 as usize]
            .len
            .store(len as u32, Ordering::Relaxed);
    }

    /// 循环接收环中的后继单元。
    pub fn next(&self, id: BufId) -> BufId {
        BufId(self.meta[id.0 as usize].next.load(Ordering::Relaxed))
    }

    /// 读取单元的全部字节。
    ///
    /// # Safety
    /// 调用方必须是该单元的唯一属主，或能保证没有并发写者。
    pub unsafe fn bytes(&self, id: BufId) -> &[u8] {
        unsafe { &*self.cells[id.0 as usize].get() }
    }

    /// 可变访问单元的全部字节。
    ///
    /// # Safety
    /// 调用方必须是该单元的唯一属主。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, id: BufId) -> &mut [u8] {
        unsafe { &mut *self.cells[id.0 as usize].get() }
    }

    /// 将一帧原始字节拷入单元（NIC RX 的 DMA 等价物）并记录长度。
    ///
    /// 契约：调用方为唯一属主；`frame.len() ≤ MBUF_SIZE`。
    pub fn write_frame(&self, id: BufId, frame: &[u8]) {
        debug_assert!(frame.len() <= MBUF_SIZE);
        // SAFETY: 属主契约见方法文档。
        let cell = unsafe { self.bytes_mut(id) };
        cell[..frame.len()].copy_from_slice(frame);
        self.set_len(id, frame.len());
    }

    /// 拷出单元内的有效帧字节（NIC TX 的 DMA 等价物）。
    pub fn frame_vec(&self, id: BufId) -> Vec<u8> {
        let len = self.len(id);
        // SAFETY: 读取方持有该单元（TX 暂存区内的帧只有分发器触碰）。
        unsafe { self.bytes(id)[..len].to_vec() }
    }

    /// 应用侧填充：半写 UDP 端口（裸 ws_id）、框架头与 `'a'…NUL` 载荷，
    /// 并把单元长度置为头部总长 + 载荷长。
    ///
    /// 契约：调用方为唯一属主；`payload_len` 为 0 时只写头部。
    pub fn set_payload(
        &self,
        id: BufId,
        src_port: u16,
        dst_port: u16,
        hdr: &FrameworkHeader,
        payload_len: usize,
    ) {
        debug_assert!(TOTAL_HEADER_LEN + payload_len <= MBUF_SIZE);
        // SAFETY: 属主契约见方法文档。
        let cell = unsafe { self.bytes_mut(id) };
        UdpHdr {
            source: src_port,
            dest: dst_port,
            len: 0,
        }
        .write_to(&mut cell[UDP_OFFSET..]);
        hdr.write_to(&mut cell[FRAMEWORK_OFFSET..]);
        if payload_len > 0 {
            let payload = &mut cell[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload_len];
            payload[..payload_len - 1].fill(b'a');
            payload[payload_len - 1] = 0;
        }
        self.set_len(id, TOTAL_HEADER_LEN + payload_len);
    }

    /// 应用侧回填：从 `src` 拷贝载荷到 `dst` 并重写头部。
    ///
    /// 契约：调用方同时持有两个单元。
    pub fn copy_payload(
        &self,
        dst: BufId,
        src: BufId,
        src_port: u16,
        dst_port: u16,
        hdr: &FrameworkHeader,
        payload_len: usize,
    ) {
        debug_assert!(TOTAL_HEADER_LEN + payload_len <= MBUF_SIZE);
        // SAFETY: 属主契约见方法文档；源载荷先落到栈上副本，再写目的单元，
        // 由此允许 dst == src 的就地回填。
        let src_bytes =
            unsafe { self.bytes(src)[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload_len].to_vec() };
        let cell = unsafe { self.bytes_mut(dst) };
        UdpHdr {
            source: src_port,
            dest: dst_port,
            len: 0,
        }
        .write_to(&mut cell[UDP_OFFSET..]);
        hdr.write_to(&mut cell[FRAMEWORK_OFFSET..]);
        cell[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload_len].copy_from_slice(&src_bytes);
        self.set_len(dst, TOTAL_HEADER_LEN + payload_len);
    }

    /// 解析单元内的框架头。
    pub fn framework_header(&self, id: BufId) -> Option<FrameworkHeader> {
        if self.len(id) < TOTAL_HEADER_LEN {
            return None;
        }
        // SAFETY: 读取方持有该单元。
        let cell = unsafe { self.bytes(id) };
        FrameworkHeader::parse(&cell[FRAMEWORK_OFFSET..])
    }
}

/// 内存注册交接描述符。
///
/// # 教案式注释
/// - **意图 (Why)**：Worker 与分发器之间唯一的内存交接面——以共享描述符上的
///   方法表达分配/归还/填充能力，可静态检查且跨后端同形；
/// - **契约 (What)**：Worker 只经由本描述符触碰池；描述符克隆即共享引用，
///   生命周期覆盖整个运行期。
#[derive(Clone)]
pub struct MemReg {
    arena: Arc<BufferArena>,
}

impl MemReg {
    /// 包装一个池。
    pub fn new(arena: Arc<BufferArena>) -> Self {
        Self { arena }
    }

    /// 底层池。
    pub fn arena(&self) -> &Arc<BufferArena> {
        &self.arena
    }

    /// 分配一个缓冲区。
    pub fn alloc(&self) -> Option<BufId> {
        self.arena.alloc()
    }

    /// 批量分配，全有或全无。
    pub fn alloc_bulk(&self, n: usize, out: &mut Vec<BufId>) -> bool {
        self.arena.alloc_bulk(n, out)
    }

    /// 归还一个缓冲区。
    pub fn dealloc(&self, id: BufId) {
        self.arena.release(id);
    }

    /// 批量归还。
    pub fn dealloc_bulk(&self, ids: &[BufId]) {
        self.arena.release_bulk(ids);
    }

    /// 填充载荷（见 [`BufferArena::set_payload`]）。
    pub fn set_payload(
        &self,
        id: BufId,
        src_port: u16,
        dst_port: u16,
        hdr: &FrameworkHeader,
        payload_len: usize,
    ) {
        self.arena.set_payload(id, src_port, dst_port, hdr, payload_len);
    }

    /// 拷贝载荷（见 [`BufferArena::copy_payload`]）。
    pub fn copy_payload(
        &self,
        dst: BufId,
        src: BufId,
        src_port: u16,
        dst_port: u16,
        hdr: &FrameworkHeader,
        payload_len: usize,
    ) {
        self.arena
            .copy_payload(dst, src, src_port, dst_port, hdr, payload_len);
    }

    /// 提取框架头。
    pub fn extract_header(&self, id: BufId) -> Option<FrameworkHeader> {
        self.arena.framework_header(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_release_cycles() {
        let arena = BufferArena::new("test-mp", 8);
        assert_eq!(arena.available(), 8);
        let a = arena.alloc().unwrap();
        assert_eq!(arena.state(a), BufState::AppOwned);
        assert_eq!(arena.in_use(), 1);
        arena.release(a);
        assert_eq!(arena.available(), 8);
    }

    #[test]
    fn bulk_alloc_is_all_or_nothing() {
        let arena = BufferArena::new("test-mp", 4);
        let mut out = Vec::new();
        assert!(!arena.alloc_bulk(5, &mut out));
        assert!(out.is_empty());
        assert!(arena.alloc_bulk(4, &mut out));
        assert_eq!(out.len(), 4);
        assert!(arena.alloc().is_none());
    }

    #[test]
    fn ring_resident_cells_cycle_by_state() {
        let arena = BufferArena::new("test-mp", 8);
        let ring = arena.reserve_ring(4).unwrap();
        assert_eq!(arena.available(), 4);
        for &id in &ring {
            assert_eq!(arena.state(id), BufState::Posted);
        }
        // 循环链封闭。
        let mut cur = ring[0];
        for _ in 0..4 {
            cur = arena.next(cur);
        }
        assert_eq!(cur, ring[0]);
        // 归还只翻状态，不回自由链表。
        arena.release(ring[0]);
        assert_eq!(arena.state(ring[0]), BufState::Free);
        assert_eq!(arena.available(), 4);
    }

    #[test]
    fn set_payload_writes_headers_and_nul() {
        let arena = BufferArena::new("test-mp", 2);
        let id = arena.alloc().unwrap();
        let hdr = FrameworkHeader {
            workload_type: 7,
            segment_num: 2,
        };
        arena.set_payload(id, 1, 3, &hdr, 16);
        assert_eq!(arena.len(id), TOTAL_HEADER_LEN + 16);
        assert_eq!(arena.framework_header(id), Some(hdr));
        let bytes = unsafe { arena.bytes(id) };
        assert_eq!(bytes[PAYLOAD_OFFSET], b'a');
        assert_eq!(bytes[PAYLOAD_OFFSET + 15], 0);
    }
}
