//! TSC 采样与轻量随机数。
//!
//! # 模块定位（Why）
//! - 事件循环以 1 µs 微间隔驱动阶段序列，统计以 tick 计时再折算微秒，
//!   因此需要低开销的时间戳源与一次性的 TSC↔墙钟速率标定；
//! - 热身阶段的随机去偏（[0, 1) ms）只需统计意义上的均匀性，
//!   采用经典乘加常数的 LCG，避免在快路径引入重量级 RNG。
//!
//! # 契约说明（What）
//! - [`rdtsc`] 在 x86_64 上直读时间戳计数器，其它架构退化为单调时钟纳秒数，
//!   两者都满足 "单核内单调递增" 这一事件循环唯一依赖的性质；
//! - [`measure_tsc_freq_ghz`] 每轮迭代开始时调用一次，短暂休眠标定速率，
//!   不得出现在数据面。

use std::time::{Duration, Instant};

/// 读取当前时间戳计数（tick）。
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // 数据面只要求单核内单调，无需序列化指令。
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::sync::OnceLock;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

/// 标定 tick 速率（GHz）：以 10 ms 墙钟窗口对照 tick 增量。
pub fn measure_tsc_freq_ghz() -> f64 {
    let start_tick = rdtsc();
    let start = Instant::now();
    std::thread::sleep(Duration::from_millis(10));
    let ticks = rdtsc().wrapping_sub(start_tick) as f64;
    let nanos = start.elapsed().as_nanos() as f64;
    ticks / nanos
}

/// 毫秒折算 tick 数。
#[inline]
pub fn ms_to_cycles(ms: f64, freq_ghz: f64) -> u64 {
    (ms * 1_000_000.0 * freq_ghz) as u64
}

/// 微秒折算 tick 数。
#[inline]
pub fn us_to_cycles(us: f64, freq_ghz: f64) -> u64 {
    (us * 1_000.0 * freq_ghz) as u64
}

/// tick 折算微秒。
#[inline]
pub fn to_usec(ticks: u64, freq_ghz: f64) -> f64 {
    ticks as f64 / (freq_ghz * 1_000.0)
}

/// 数据面专用的快速 LCG。
///
/// - **意图 (Why)**：热身去偏与诊断采样只需要统计均匀性，不需要密码学强度；
/// - **契约 (What)**：种子来自操作系统熵（经由 `RandomState`），
///   序列与乘加常数 `1103515245 / 12345` 的经典 LCG 一致。
pub struct FastRand {
    seed: u64,
}

impl FastRand {
    /// 以操作系统熵作种创建实例。
    pub fn new() -> Self {
        use std::collections::hash_map::RandomState;
        use std::hash::{BuildHasher, Hasher};
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u64(rdtsc());
        Self {
            seed: hasher.finish(),
        }
    }

    /// 下一个 64 位随机数。
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        self.seed = self.seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        self.seed
    }

    /// 下一个 32 位随机数（取高位，低位质量较差）。
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }
}

impl Default for FastRand {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdtsc_monotonic_within_thread() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn usec_conversion_round_figures() {
        // 2 GHz 下 2000 tick 恰为 1 µs。
        let us = to_usec(2000, 2.0);
        assert!((us - 1.0).abs() < 1e-9);
        assert_eq!(us_to_cycles(1.0, 2.0), 2000);
    }
}
