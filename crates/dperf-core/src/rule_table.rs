//! RX 分流表与在途消息预算。
//!
//! # 模块定位（Why）
//! - 分发器按框架头中的 `workload_type` 轮询选择目标 Worker，实现 RX 扇出；
//! - Worker 的 TX 侧复用同一张表做远端分发器轮询，并用逐负载的在途预算
//!   （初始 [`MAX_INFLY`](crate::limits::MAX_INFLY)）约束尚未收到响应的消息数。
//!
//! # 契约说明（What）
//! - 表为单线程私有（Worker 或分发器各持一份），无并发语义；
//! - 预算不变量：任意时刻 `credit ≥ 0`；申请失败不扣减；
//! - 轮询游标在每次选择后推进。

use std::collections::HashMap;

use crate::limits::MAX_INFLY;

/// 工作负载到目标工作空间的路由表。
pub struct RuleTable {
    table: HashMap<u8, Vec<u8>>,
    infly_budget: HashMap<u8, u64>,
    budget_cap: u64,
    select_idx: usize,
}

impl RuleTable {
    /// 以默认在途预算创建空表。
    pub fn new() -> Self {
        Self::with_budget(MAX_INFLY)
    }

    /// 以指定在途预算创建空表（测量与测试场景用）。
    pub fn with_budget(budget_cap: u64) -> Self {
        Self {
            table: HashMap::new(),
            infly_budget: HashMap::new(),
            budget_cap,
            select_idx: 0,
        }
    }

    /// 追加一条路由；首次出现的负载类型同时获得满额预算。
    pub fn add_route(&mut self, workload_type: u8, ws_id: u8) {
        self.table.entry(workload_type).or_default().push(ws_id);
        self.infly_budget
            .entry(workload_type)
            .or_insert(self.budget_cap);
    }

    /// 摘除一条路由。
    pub fn remove_route(&mut self, workload_type: u8, ws_id: u8) {
        if let Some(ws_ids) = self.table.get_mut(&workload_type) {
            if let Some(pos) = ws_ids.iter().position(|&id| id == ws_id) {
                ws_ids.remove(pos);
            }
        }
    }

    /// 某负载类型当前的全部目标。
    pub fn ws_ids(&self, workload_type: u8) -> &[u8] {
        self.table
            .get(&workload_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 轮询选择下一个目标工作空间。
    ///
    /// # Panics
    /// 该负载类型没有任何路由时 panic（装配期必须先 `add_route`）。
    pub fn rr_select(&mut self, workload_type: u8) -> u8 {
        let ws_ids = &self.table[&workload_type];
        let ws_id = ws_ids[self.select_idx % ws_ids.len()];
        self.select_idx += 1;
        ws_id
    }

    /// 申请 `apply_size` 条在途额度；不足时返回 `false` 且不扣减。
    pub fn apply_infly_budget(&mut self, workload_type: u8, apply_size: u64) -> bool {
        let budget = self
            .infly_budget
            .entry(workload_type)
            .or_insert(self.budget_cap);
        if *budget >= apply_size {
            *budget -= apply_size;
            true
        } else {
            false
        }
    }

    /// 归还在途额度（客户端消费响应时调用）。
    pub fn return_infly_budget(&mut self, workload_type: u8, return_size: u64) {
        *self
            .infly_budget
            .entry(workload_type)
            .or_insert(self.budget_cap) += return_size;
    }

    /// 当前剩余额度。
    pub fn infly_budget(&self, workload_type: u8) -> u64 {
        self.infly_budget
            .get(&workload_type)
            .copied()
            .unwrap_or(self.budget_cap)
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cursor_advances() {
        let mut table = RuleTable::new();
        table.add_route(1, 2);
        table.add_route(1, 5);
        table.add_route(1, 9);
        assert_eq!(table.rr_select(1), 2);
        assert_eq!(table.rr_select(1), 5);
        assert_eq!(table.rr_select(1), 9);
        assert_eq!(table.rr_select(1), 2);
    }

    #[test]
    fn budget_never_goes_negative() {
        let mut table = RuleTable::with_budget(4);
        table.add_route(1, 0);
        assert!(table.apply_infly_budget(1, 3));
        assert_eq!(table.infly_budget(1), 1);
        assert!(!table.apply_infly_budget(1, 2));
        assert_eq!(table.infly_budget(1), 1);
        table.return_infly_budget(1, 3);
        assert_eq!(table.infly_budget(1), 4);
    }
}
