//! 流水线合成器：把工作负载编排翻译为逐核心的阶段函数序列。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 数据面被拆成六类阶段，每类阶段展开为固定顺序的步骤函数；
//!   合成器按配置中阶段的书写顺序拼接某个 ws_id 需要执行的步骤，
//!   并给出该 ws 的类型位掩码（Worker / Dispatcher / NicOffload）；
//! - 步骤不以函数指针数组表达，而是步骤枚举 [`Step`] +
//!   执行器热路径上的 `match`，调度开销等价且可静态穷举。
//!
//! ## 规则（What）
//! - 阶段 → 步骤的映射见 [`phase_steps`]；
//! - 同一步骤在一个 ws 的序列中只出现一次（按首次出现的位置）；
//! - 应用阶段的宿主是该负载的全部 Worker 组成员，分发阶段的宿主是
//!   分发器 id，NIC 阶段暂无宿主（为 offload 保留）；
//! - 单阶段隔离（`OneStage`）只保留被隔离阶段的步骤，其中分发阶段与
//!   NIC 阶段之间有拼接规则：隔离 TxDisp 时剔除 `nic_tx`，隔离 TxNic 时
//!   仅保留 `nic_tx`；RX 侧对称。

use crate::config::WorkloadsConfig;
use crate::limits::ONE_STAGE;

/// 工作空间类型位：分发器。
pub const WS_DISPATCHER: u8 = 1;
/// 工作空间类型位：Worker。
pub const WS_WORKER: u8 = 2;
/// 工作空间类型位：NIC offload 宿主。
pub const WS_NIC_OFFLOAD: u8 = 4;

/// 六类流水线阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    /// 应用 TX：申请缓冲并生成报文。
    TxApp,
    /// 分发器 TX：收集各 Worker 环并发射。
    TxDisp,
    /// NIC TX（为 offload 保留，暂无步骤）。
    TxNic,
    /// NIC RX（为 offload 保留，暂无步骤）。
    RxNic,
    /// 分发器 RX：轮询 NIC 并分流。
    RxDisp,
    /// 应用 RX：消费完整消息。
    RxApp,
}

impl PhaseKind {
    /// 配置文件中的阶段名。
    pub fn name(&self) -> &'static str {
        match self {
            Self::TxApp => "TxApplication",
            Self::TxDisp => "TxDispatcher",
            Self::TxNic => "TxNIC",
            Self::RxNic => "RXNIC",
            Self::RxDisp => "RXDispatcher",
            Self::RxApp => "RxApplication",
        }
    }

    /// 按配置文件中的阶段名解析。
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "TxApplication" => Some(Self::TxApp),
            "TxDispatcher" => Some(Self::TxDisp),
            "TxNIC" => Some(Self::TxNic),
            "RXNIC" => Some(Self::RxNic),
            "RXDispatcher" => Some(Self::RxDisp),
            "RxApplication" => Some(Self::RxApp),
            _ => None,
        }
    }

    fn ws_type_bit(&self) -> u8 {
        match self {
            Self::TxApp | Self::RxApp => WS_WORKER,
            Self::TxDisp | Self::RxDisp => WS_DISPATCHER,
            Self::TxNic | Self::RxNic => WS_NIC_OFFLOAD,
        }
    }
}

/// 步骤函数标签（执行器在热路径上 `match` 调度）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// 申请 TX 缓冲（含在途额度检查与池停顿计数）。
    ApplyBuffers,
    /// 生成报文并入 TX 环。
    GeneratePackets,
    /// 从 Worker TX 环收集并盖章。
    CollectTx,
    /// 达到阈值后向 NIC 发射。
    NicTx,
    /// 轮询 NIC 完成。
    NicRx,
    /// 按 RuleTable 分流到 Worker RX 环。
    DispatchRx,
    /// 应用消息处理器。
    AppHandler,
}

impl Step {
    /// 步骤名（流水线摘要输出用）。
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApplyBuffers => "apply_buffers",
            Self::GeneratePackets => "generate_packets",
            Self::CollectTx => "collect_tx",
            Self::NicTx => "nic_tx",
            Self::NicRx => "nic_rx",
            Self::DispatchRx => "dispatch_rx",
            Self::AppHandler => "app_handler",
        }
    }
}

/// 阶段到步骤序列的固定映射。
pub fn phase_steps(kind: PhaseKind) -> &'static [Step] {
    match kind {
        PhaseKind::TxApp => &[Step::ApplyBuffers, Step::GeneratePackets],
        PhaseKind::TxDisp => &[Step::CollectTx, Step::NicTx],
        PhaseKind::TxNic | PhaseKind::RxNic => &[],
        PhaseKind::RxDisp => &[Step::NicRx, Step::DispatchRx],
        PhaseKind::RxApp => &[Step::AppHandler],
    }
}

/// 流水线合成器。
pub struct PipelineComposer {
    workloads: WorkloadsConfig,
    one_stage: Option<PhaseKind>,
}

impl PipelineComposer {
    /// 从工作负载编排构造合成器，单阶段开关取编译期默认。
    pub fn new(workloads: &WorkloadsConfig) -> Self {
        Self {
            workloads: workloads.clone(),
            one_stage: ONE_STAGE,
        }
    }

    /// 覆盖单阶段隔离开关（测量构型）。
    pub fn with_isolated_phase(mut self, phase: Option<PhaseKind>) -> Self {
        self.one_stage = phase;
        self
    }

    /// 阶段宿主判定：该 ws 是否承载某负载的某阶段。
    fn hosts_phase(&self, workload_type: u8, kind: PhaseKind, ws_id: u8) -> bool {
        let Some(spec) = self.workloads.specs.get(&workload_type) else {
            return false;
        };
        match kind {
            PhaseKind::TxApp | PhaseKind::RxApp => {
                spec.groups.iter().any(|g| g.contains(&ws_id))
            }
            PhaseKind::TxDisp | PhaseKind::RxDisp => spec.dispatchers.contains(&ws_id),
            // NIC 阶段暂无宿主。
            PhaseKind::TxNic | PhaseKind::RxNic => false,
        }
    }

    /// 为一个 ws_id 生成类型位掩码与步骤序列。
    pub fn generate_ws_loop(&self, ws_id: u8) -> (u8, Vec<Step>) {
        let mut ws_type = 0u8;
        let mut ws_loop: Vec<Step> = Vec::new();

        for (&workload_type, spec) in &self.workloads.specs {
            for &kind in &spec.phases {
                if !self.hosts_phase(workload_type, kind, ws_id) {
                    continue;
                }
                ws_type |= kind.ws_type_bit();

                let retain = match self.one_stage {
                    None => true,
                    Some(isolated) => {
                        kind == isolated
                            || (kind == PhaseKind::TxDisp && isolated == PhaseKind::TxNic)
                            || (kind == PhaseKind::RxDisp && isolated == PhaseKind::RxNic)
                    }
                };
                if retain {
                    for &step in phase_steps(kind) {
                        if !ws_loop.contains(&step) {
                            ws_loop.push(step);
                        }
                    }
                }

                if let Some(isolated) = self.one_stage {
                    if (kind == PhaseKind::TxDisp && isolated == PhaseKind::TxDisp)
                        || (kind == PhaseKind::RxDisp && isolated == PhaseKind::RxNic)
                    {
                        // 剔除 nic_* 步骤，只测分发半段。
                        ws_loop.pop();
                    } else if (kind == PhaseKind::TxDisp && isolated == PhaseKind::TxNic)
                        || (kind == PhaseKind::RxDisp && isolated == PhaseKind::RxDisp)
                    {
                        // 只保留阶段末步骤。
                        if let Some(last) = ws_loop.pop() {
                            ws_loop.pop();
                            ws_loop.push(last);
                        }
                    }
                }
            }
        }
        (ws_type, ws_loop)
    }

    /// ws_id 所属的工作负载类型（Worker 取其应用组，分发器取其服务的负载）。
    pub fn workload_of(&self, ws_id: u8) -> Option<u8> {
        if let Some(workload_type) = self.workloads.workload_of(ws_id) {
            return Some(workload_type);
        }
        self.workloads
            .specs
            .iter()
            .find(|(_, spec)| spec.dispatchers.contains(&ws_id))
            .map(|(&workload_type, _)| workload_type)
    }

    /// 流水线摘要（启动期输出）。
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (workload_type, spec) in &self.workloads.specs {
            out.push_str(&format!("Workload {workload_type}:\n"));
            for &kind in &spec.phases {
                out.push_str(&format!("  {}:", kind.name()));
                for step in phase_steps(kind) {
                    out.push_str(&format!(" {}", step.name()));
                }
                out.push('\n');
            }
        }
        out
    }
}
