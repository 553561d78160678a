//! 逐工作空间计数器与运行末汇总。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 数据面只做最廉价的记账：计数自增与 tick 差累加，全部为线程本地字段，
//!   不触碰共享内存，避免测量本身扰动被测对象；
//! - 运行结束时每个工作空间把自己的阶段小结（按自身 TSC 速率折算微秒）
//!   合并进全局 [`PerfStats`]，首个完成者在收尾屏障后做除法并渲染表格。
//!
//! ## 口径（What）
//! - 每阶段拆 `compl`（步骤内耗时，不含背压等待）与 `stall`（等池/等环）；
//! - 时延 = 微秒总和 / 报文（或消息）数；吞吐 = 计数 / 1e6 / 秒（Mpps）；
//! - 聚合后按贡献者数量（Worker 数或分发器数）取均值；
//! - 渲染为定宽列表格，所有数值三位小数。
//!
//! ## 怪癖保留（Gotchas）
//! - `nic_tx` 的时延取自分发器 TX 的 stall 段（NIC 发射耗时与其同口径）；
//! - 无样本的 min 统计在渲染前被钳到 9999，避免打印 `u64::MAX` 的折算值。

use crate::timing::to_usec;

/// 逐工作空间的原始计数器。
#[derive(Clone, Debug)]
pub struct WsStats {
    /// 应用 TX 消息数。
    pub app_tx_msg_num: u64,
    /// 应用 TX 报文数（成功入环）。
    pub app_tx_pkt_num: u64,
    /// 应用 RX 消息数。
    pub app_rx_msg_num: u64,
    /// 应用 RX 报文数。
    pub app_rx_pkt_num: u64,

    /// 应用 TX 调用次数。
    pub app_tx_invoke_times: u64,
    /// 应用 TX 步骤内 tick 累计。
    pub app_tx_sum_ticks: u64,
    /// 应用 TX 单批最大 tick。
    pub app_tx_max_ticks: u64,
    /// 应用 TX 单批最小 tick。
    pub app_tx_min_ticks: u64,
    /// 应用 TX 停顿 tick 累计。
    pub app_tx_stall_sum_ticks: u64,
    /// 应用 TX 单批最大停顿 tick。
    pub app_tx_stall_max_ticks: u64,
    /// 应用 TX 单批最小停顿 tick。
    pub app_tx_stall_min_ticks: u64,

    /// 应用 RX 调用次数。
    pub app_rx_invoke_times: u64,
    /// 应用 RX 步骤内 tick 累计。
    pub app_rx_sum_ticks: u64,
    /// 应用 RX 单批最大 tick。
    pub app_rx_max_ticks: u64,
    /// 应用 RX 单批最小 tick。
    pub app_rx_min_ticks: u64,
    /// 应用 RX 停顿 tick 累计。
    pub app_rx_stall_sum_ticks: u64,
    /// 应用 RX 单批最大停顿 tick。
    pub app_rx_stall_max_ticks: u64,
    /// 应用 RX 单批最小停顿 tick。
    pub app_rx_stall_min_ticks: u64,

    /// 分发器 TX 报文数。
    pub disp_tx_pkt_num: u64,
    /// 分发器 RX 报文数。
    pub disp_rx_pkt_num: u64,
    /// 分发器 TX 步骤内 tick。
    pub disp_tx_ticks: u64,
    /// 分发器 TX 停顿 tick。
    pub disp_tx_stall_ticks: u64,
    /// 分发器 RX 步骤内 tick。
    pub disp_rx_ticks: u64,
    /// 分发器 RX 停顿 tick。
    pub disp_rx_stall_ticks: u64,

    /// NIC TX 报文数。
    pub nic_tx_pkt_num: u64,
    /// NIC RX 报文数。
    pub nic_rx_pkt_num: u64,
    /// NIC RX 每报文 tick 采样累计。
    pub nic_rx_cpt: f64,
    /// NIC RX 采样次数。
    pub nic_rx_times: u64,

    /// 申请缓冲的停顿次数。
    pub app_apply_buf_stalls: u64,
    /// 应用侧入环丢弃。
    pub app_enqueue_drops: u64,
    /// 分发器侧入环丢弃。
    pub disp_enqueue_drops: u64,
    /// 池用量采样次数。
    pub buf_alloc_times: u64,
    /// 池用量采样累计。
    pub buf_usage: u64,
}

impl WsStats {
    /// 全零初始化（min 统计置最大值）。
    pub fn new() -> Self {
        Self {
            app_tx_msg_num: 0,
            app_tx_pkt_num: 0,
            app_rx_msg_num: 0,
            app_rx_pkt_num: 0,
            app_tx_invoke_times: 0,
            app_tx_sum_ticks: 0,
            app_tx_max_ticks: 0,
            app_tx_min_ticks: u64::MAX,
            app_tx_stall_sum_ticks: 0,
            app_tx_stall_max_ticks: 0,
            app_tx_stall_min_ticks: u64::MAX,
            app_rx_invoke_times: 0,
            app_rx_sum_ticks: 0,
            app_rx_max_ticks: 0,
            app_rx_min_ticks: u64::MAX,
            app_rx_stall_sum_ticks: 0,
            app_rx_stall_max_ticks: 0,
            app_rx_stall_min_ticks: u64::MAX,
            disp_tx_pkt_num: 0,
            disp_rx_pkt_num: 0,
            disp_tx_ticks: 0,
            disp_tx_stall_ticks: 0,
            disp_rx_ticks: 0,
            disp_rx_stall_ticks: 0,
            nic_tx_pkt_num: 0,
            nic_rx_pkt_num: 0,
            nic_rx_cpt: 0.0,
            nic_rx_times: 0,
            app_apply_buf_stalls: 0,
            app_enqueue_drops: 0,
            disp_enqueue_drops: 0,
            buf_alloc_times: 0,
            buf_usage: 0,
        }
    }

    /// 新一轮迭代前清零。
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// 记录一次应用 TX 步骤内耗时。
    pub fn record_app_tx_duration(&mut self, ticks: u64) {
        self.app_tx_invoke_times += 1;
        self.app_tx_sum_ticks += ticks;
        self.app_tx_max_ticks = self.app_tx_max_ticks.max(ticks);
        self.app_tx_min_ticks = self.app_tx_min_ticks.min(ticks);
    }

    /// 记录一次应用 TX 停顿耗时。
    pub fn record_app_tx_stall(&mut self, ticks: u64) {
        self.app_tx_stall_sum_ticks += ticks;
        self.app_tx_stall_max_ticks = self.app_tx_stall_max_ticks.max(ticks);
        self.app_tx_stall_min_ticks = self.app_tx_stall_min_ticks.min(ticks);
    }

    /// 记录一次应用 RX 步骤内耗时。
    pub fn record_app_rx_duration(&mut self, ticks: u64) {
        self.app_rx_invoke_times += 1;
        self.app_rx_sum_ticks += ticks;
        self.app_rx_max_ticks = self.app_rx_max_ticks.max(ticks);
        self.app_rx_min_ticks = self.app_rx_min_ticks.min(ticks);
    }

    /// 记录一次应用 RX 停顿耗时。
    pub fn record_app_rx_stall(&mut self, ticks: u64) {
        self.app_rx_stall_sum_ticks += ticks;
        self.app_rx_stall_max_ticks = self.app_rx_stall_max_ticks.max(ticks);
        self.app_rx_stall_min_ticks = self.app_rx_stall_min_ticks.min(ticks);
    }

    /// 记录一次池用量采样。
    pub fn record_buf_usage(&mut self, in_use: usize) {
        self.buf_alloc_times += 1;
        self.buf_usage += in_use as u64;
    }

    /// 记录一次 NIC RX 每报文 tick 采样。
    pub fn record_nic_rx_cpt(&mut self, cycles_per_pkt: f64) {
        self.nic_rx_cpt += cycles_per_pkt;
        self.nic_rx_times += 1;
    }
}

impl Default for WsStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个阶段的聚合槽。
#[derive(Clone, Copy, Debug, Default)]
pub struct StageAgg {
    /// 吞吐（Mpps），逐贡献者求和。
    pub throughput: f64,
    /// 每报文步骤内时延（µs），逐贡献者求和后取均值。
    pub compl: f64,
    /// 每报文停顿时延（µs）。
    pub stall: f64,
    /// 单批步骤内时延均值（µs）。
    pub compl_avg: f64,
    /// 单批步骤内时延最大值（µs）。
    pub compl_max: f64,
    /// 单批步骤内时延最小值（µs）。
    pub compl_min: f64,
    /// 单批停顿均值（µs）。
    pub stall_avg: f64,
    /// 单批停顿最大值（µs）。
    pub stall_max: f64,
    /// 单批停顿最小值（µs）。
    pub stall_min: f64,
}

impl StageAgg {
    fn with_min_init() -> Self {
        Self {
            compl_min: f64::MAX,
            stall_min: f64::MAX,
            ..Self::default()
        }
    }

    fn clamp_min(&mut self) {
        if self.compl_min > self.compl_max {
            self.compl_min = 9999.0;
        }
        if self.stall_min > self.stall_max {
            self.stall_min = 9999.0;
        }
    }
}

/// 全局聚合统计。
#[derive(Clone, Debug)]
pub struct PerfStats {
    /// app_tx 聚合。
    pub app_tx: StageAgg,
    /// app_rx 聚合。
    pub app_rx: StageAgg,
    /// disp_tx 聚合。
    pub disp_tx: StageAgg,
    /// disp_rx 聚合。
    pub disp_rx: StageAgg,
    /// nic_tx 聚合。
    pub nic_tx: StageAgg,
    /// nic_rx 聚合。
    pub nic_rx: StageAgg,
    /// 分发器池用量均值（占比）。
    pub disp_buf_usage: f64,
}

impl PerfStats {
    /// 初始化（min 槽置最大值）。
    pub fn new() -> Self {
        Self {
            app_tx: StageAgg::with_min_init(),
            app_rx: StageAgg::with_min_init(),
            disp_tx: StageAgg::default(),
            disp_rx: StageAgg::default(),
            nic_tx: StageAgg::default(),
            nic_rx: StageAgg::default(),
            disp_buf_usage: 0.0,
        }
    }

    /// 合并一个工作空间的小结（以该 ws 的 TSC 速率折算）。
    pub fn merge_ws(&mut self, stats: &WsStats, freq_ghz: f64, duration_secs: u64, pool_size: usize) {
        let dur = duration_secs.max(1) as f64;

        // 应用 TX
        self.app_tx.throughput += stats.app_tx_pkt_num as f64 / 1e6 / dur;
        if stats.app_tx_pkt_num > 0 {
            self.app_tx.compl += to_usec(stats.app_tx_sum_ticks, freq_ghz) / stats.app_tx_pkt_num as f64;
            self.app_tx.compl_avg +=
                to_usec(stats.app_tx_sum_ticks, freq_ghz) / stats.app_tx_invoke_times as f64;
            self.app_tx.compl_max = self
                .app_tx
                .compl_max
                .max(to_usec(stats.app_tx_max_ticks, freq_ghz));
            self.app_tx.compl_min = self
                .app_tx
                .compl_min
                .min(to_usec(stats.app_tx_min_ticks, freq_ghz));
            self.app_tx.stall +=
                to_usec(stats.app_tx_stall_sum_ticks, freq_ghz) / stats.app_tx_pkt_num as f64;
            self.app_tx.stall_avg +=
                to_usec(stats.app_tx_stall_sum_ticks, freq_ghz) / stats.app_tx_invoke_times as f64;
            self.app_tx.stall_max = self
                .app_tx
                .stall_max
                .max(to_usec(stats.app_tx_stall_max_ticks, freq_ghz));
            self.app_tx.stall_min = self
                .app_tx
                .stall_min
                .min(to_usec(stats.app_tx_stall_min_ticks, freq_ghz));
        }

        // 应用 RX
        self.app_rx.throughput += stats.app_rx_pkt_num as f64 / 1e6 / dur;
        if stats.app_rx_pkt_num > 0 {
            self.app_rx.compl += to_usec(stats.app_rx_sum_ticks, freq_ghz) / stats.app_rx_pkt_num as f64;
            self.app_rx.compl_avg +=
                to_usec(stats.app_rx_sum_ticks, freq_ghz) / stats.app_rx_invoke_times as f64;
            self.app_rx.compl_max = self
                .app_rx
                .compl_max
                .max(to_usec(stats.app_rx_max_ticks, freq_ghz));
            self.app_rx.compl_min = self
                .app_rx
                .compl_min
                .min(to_usec(stats.app_rx_min_ticks, freq_ghz));
            self.app_rx.stall +=
                to_usec(stats.app_rx_stall_sum_ticks, freq_ghz) / stats.app_rx_pkt_num as f64;
            self.app_rx.stall_avg +=
                to_usec(stats.app_rx_stall_sum_ticks, freq_ghz) / stats.app_rx_invoke_times as f64;
            self.app_rx.stall_max = self
                .app_rx
                .stall_max
                .max(to_usec(stats.app_rx_stall_max_ticks, freq_ghz));
            self.app_rx.stall_min = self
                .app_rx
                .stall_min
                .min(to_usec(stats.app_rx_stall_min_ticks, freq_ghz));
        }

        // 分发器
        self.disp_tx.throughput += stats.disp_tx_pkt_num as f64 / 1e6 / dur;
        if stats.disp_tx_pkt_num > 0 {
            self.disp_tx.compl += to_usec(stats.disp_tx_ticks, freq_ghz) / stats.disp_tx_pkt_num as f64;
            self.disp_tx.stall +=
                to_usec(stats.disp_tx_stall_ticks, freq_ghz) / stats.disp_tx_pkt_num as f64;
        }
        self.disp_rx.throughput += stats.disp_rx_pkt_num as f64 / 1e6 / dur;
        if stats.disp_rx_pkt_num > 0 {
            self.disp_rx.compl += to_usec(stats.disp_rx_ticks, freq_ghz) / stats.disp_rx_pkt_num as f64;
            self.disp_rx.stall +=
                to_usec(stats.disp_rx_stall_ticks, freq_ghz) / stats.disp_rx_pkt_num as f64;
        }

        // NIC：TX 时延与分发器 TX 的 stall 段同口径。
        self.nic_tx.throughput += stats.nic_tx_pkt_num as f64 / 1e6 / dur;
        if stats.nic_tx_pkt_num > 0 {
            self.nic_tx.compl +=
                to_usec(stats.disp_tx_stall_ticks, freq_ghz) / stats.nic_tx_pkt_num as f64;
        }
        if stats.nic_rx_times > 0 {
            let compl =
                to_usec(stats.nic_rx_cpt.round() as u64, freq_ghz) / stats.nic_rx_times as f64;
            self.nic_rx.compl += compl;
            if compl > 0.0 {
                self.nic_rx.throughput += 1.0 / compl;
            }
        }

        if stats.buf_alloc_times > 0 && pool_size > 0 {
            self.disp_buf_usage +=
                stats.buf_usage as f64 / stats.buf_alloc_times as f64 / pool_size as f64;
        }
    }

    /// 按贡献者数量取均值（运行末一次）。
    pub fn finalize(&mut self, worker_num: usize, dispatcher_num: usize) {
        if worker_num > 0 {
            let n = worker_num as f64;
            for stage in [&mut self.app_tx, &mut self.app_rx] {
                stage.compl /= n;
                stage.compl_avg /= n;
                stage.stall /= n;
                stage.stall_avg /= n;
            }
        }
        if dispatcher_num > 0 {
            let n = dispatcher_num as f64;
            for stage in [&mut self.disp_tx, &mut self.disp_rx, &mut self.nic_tx, &mut self.nic_rx]
            {
                stage.compl /= n;
                stage.stall /= n;
            }
            self.disp_buf_usage /= n;
        }
        self.app_tx.clamp_min();
        self.app_rx.clamp_min();
    }

    /// 渲染定宽表格（全部数值三位小数）。
    pub fn render(&self) -> String {
        let sep = "-".repeat(200);
        let mut out = String::new();
        out.push_str(&sep);
        out.push('\n');
        out.push_str(&format!(
            "{:<20}{:<20}{:<20}{:<20}{:<20}{:<20}{:<20}{:<20}{:<20}{:<20}\n",
            "DPerf Statistics",
            "Thpl. (Mpps)",
            "Avg. [/P]",
            "Avg. Stall [/P]",
            "Max Stall. [/B]",
            "Min Stall. [/B]",
            "Avg Stall. [/B]",
            "Max Coml. [/B]",
            "Min Coml. [/B]",
            "Avg Coml. [/B]",
        ));
        out.push_str(&sep);
        out.push('\n');
        for (name, stage) in [("app_tx", &self.app_tx), ("app_rx", &self.app_rx)] {
            out.push_str(&format!(
                "{:<20}{:<20.3}{:<20.3}{:<20.3}{:<20.3}{:<20.3}{:<20.3}{:<20.3}{:<20.3}{:<20.3}\n",
                name,
                stage.throughput,
                stage.compl + stage.stall,
                stage.stall,
                stage.stall_max,
                stage.stall_min,
                stage.stall_avg,
                stage.compl_max,
                stage.compl_min,
                stage.compl_avg,
            ));
        }
        for (name, stage) in [("disp_tx", &self.disp_tx), ("disp_rx", &self.disp_rx)] {
            out.push_str(&format!(
                "{:<20}{:<20.3}{:<20.3}{:<20.3}\n",
                name,
                stage.throughput,
                stage.compl + stage.stall,
                stage.stall,
            ));
        }
        for (name, stage) in [("nic_tx", &self.nic_tx), ("nic_rx", &self.nic_rx)] {
            out.push_str(&format!(
                "{:<20}{:<20.3}{:<20.3}\n",
                name, stage.throughput, stage.compl,
            ));
        }
        out.push_str(&sep);
        out.push('\n');
        out
    }
}

impl Default for PerfStats {
    fn default() -> Self {
        Self::new()
    }
}
