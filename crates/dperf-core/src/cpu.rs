//! CPU 亲和与频率治理辅助。
//!
//! # 模块定位（Why）
//! - 每个工作空间独占一个物理核心：线程在进入事件循环前把自己钉到
//!   NUMA 本地的第 `ws_id` 个核心上；
//! - 频率治理（governor 拉满）是尽力而为的测量优化：无权限或非 Linux
//!   环境下仅告警，不影响功能。
//!
//! # 契约说明（What）
//! - 核心枚举来自 sysfs 的 NUMA cpulist，读取失败时退化为全量核心序列；
//! - 绑定失败（核心数不足、权限不足、非 Linux）返回 `None` 并告警——
//!   这会显著拉低测量质量，但不是功能错误。

use tracing::warn;

/// 枚举 NUMA 节点本地的核心（全局编号）。
pub fn lcores_for_numa_node(numa_node: usize) -> Vec<usize> {
    let path = format!("/sys/devices/system/node/node{numa_node}/cpulist");
    if let Ok(text) = std::fs::read_to_string(&path) {
        if let Some(cores) = parse_cpulist(text.trim()) {
            return cores;
        }
    }
    // 无 NUMA 信息时退化为全量核心。
    let n = std::thread::available_parallelism().map(usize::from).unwrap_or(1);
    (0..n).collect()
}

/// 解析 sysfs cpulist 语法（如 `0-3,8,10-11`）。
fn parse_cpulist(text: &str) -> Option<Vec<usize>> {
    let mut cores = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start.trim().parse().ok()?;
            let end: usize = end.trim().parse().ok()?;
            cores.extend(start..=end);
        } else {
            cores.push(part.parse().ok()?);
        }
    }
    Some(cores)
}

/// 把当前线程钉到 NUMA 本地的第 `local_idx` 个核心；返回全局核心编号。
pub fn bind_current_thread(numa_node: usize, local_idx: usize) -> Option<usize> {
    let cores = lcores_for_numa_node(numa_node);
    let Some(&global_idx) = cores.get(local_idx) else {
        warn!(
            numa_node,
            local_idx,
            available = cores.len(),
            "NUMA 节点核心数不足，跳过绑定（测量质量将显著下降）"
        );
        return None;
    };
    if set_affinity(global_idx) {
        Some(global_idx)
    } else {
        None
    }
}

#[cfg(target_os = "linux")]
fn set_affinity(core: usize) -> bool {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;
    let mut set = CpuSet::new();
    if set.set(core).is_err() {
        warn!(core, "核心编号超出 CpuSet 容量");
        return false;
    }
    match sched_setaffinity(Pid::from_raw(0), &set) {
        Ok(()) => true,
        Err(e) => {
            warn!(core, error = %e, "设置线程亲和失败");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_affinity(core: usize) -> bool {
    warn!(core, "当前平台不支持线程亲和，跳过绑定");
    false
}

/// 清除进程级亲和限制（发射线程前调用，让子线程可落到任意核心）。
pub fn clear_affinity_for_process() {
    #[cfg(target_os = "linux")]
    {
        use nix::sched::{CpuSet, sched_setaffinity};
        use nix::unistd::Pid;
        let n = std::thread::available_parallelism().map(usize::from).unwrap_or(1);
        let mut set = CpuSet::new();
        for core in 0..n.min(CpuSet::count()) {
            let _ = set.set(core);
        }
        if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
            warn!(error = %e, "清除进程亲和失败");
        }
    }
}

/// 尽力把核心的 scaling governor 调到 performance；返回原 governor 供恢复。
pub fn raise_cpu_freq(core: usize) -> Option<String> {
    let path = format!("/sys/devices/system/cpu/cpu{core}/cpufreq/scaling_governor");
    let previous = std::fs::read_to_string(&path).ok()?.trim().to_string();
    if let Err(e) = std::fs::write(&path, "performance") {
        warn!(core, error = %e, "无法调整 CPU governor（继续运行）");
        return None;
    }
    Some(previous)
}

/// 恢复先前的 scaling governor。
pub fn restore_cpu_freq(core: usize, previous: &str) {
    let path = format!("/sys/devices/system/cpu/cpu{core}/cpufreq/scaling_governor");
    if let Err(e) = std::fs::write(&path, previous) {
        warn!(core, error = %e, "无法恢复 CPU governor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpulist_ranges_and_singles() {
        assert_eq!(parse_cpulist("0-3"), Some(vec![0, 1, 2, 3]));
        assert_eq!(parse_cpulist("0,2,4"), Some(vec![0, 2, 4]));
        assert_eq!(parse_cpulist("0-1,8,10-11"), Some(vec![0, 1, 8, 10, 11]));
        assert_eq!(parse_cpulist("x"), None);
    }
}
