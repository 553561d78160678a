//! 文本配置：冒号分隔的键值文件。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 配置文件描述两类内容：服务端基础参数（NUMA、端口、轮次、地址）与
//!   工作负载编排（阶段序列、Worker 分组、分发器、远端分发器扇出）；
//! - 可调参数沿用既定键名（`kAppCoreNum` 等），便于调参工具直接改写；
//! - 载荷尺寸（`kAppReqPayloadSize`/`kAppRespPayloadSize`）同样从配置读取，
//!   运行口径以启动时的配置为准。
//!
//! ## 格式（What）
//! - 每行 `key:value`，空行与无冒号行跳过，值两端空白剔除；
//! - 未识别的键是配置错误；
//! - `workload:<type>:<phase1,phase2,…>:<remote_disp_ids>:<groups>:<disp_ids>`，
//!   其中 `<groups>` 以 `|` 分组，组内为逗号列表或 `a-b` 区间；
//!   `<disp_ids>` 每组恰好一个分发器；
//! - 任一 ws_id 至多隶属一个工作负载的应用组，违例即中止初始化。
//!
//! ## 往返律（Contract）
//! - [`TunableParams::emit`] 产出的文本重新解析后必须得到逐字段相同的参数包。

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{DperfError, Result};
use crate::limits::{INVALID_WS_ID, MAX_BATCH, MAX_WORKSPACES};
use crate::pipeline::PhaseKind;
use crate::wire::MacAddr;
use crate::wire::ipv4::ipv4_from_str;

/// 服务端基础配置。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// NUMA 节点。
    pub numa: u8,
    /// 物理端口索引。
    pub phy_port: u8,
    /// 测量轮次。
    pub iteration: u8,
    /// 每轮时长（秒）。
    pub duration: u8,
    /// 本端 IPv4（主机序）。
    pub local_ip: u32,
    /// 远端 IPv4（主机序）。
    pub remote_ip: u32,
    /// 本端 MAC。
    pub local_mac: MacAddr,
    /// 远端 MAC。
    pub remote_mac: MacAddr,
    /// 设备 PCIe 地址（`NNNN:NN.N`）。
    pub device_pcie: String,
    /// 设备名。
    pub device_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            numa: 0,
            phy_port: 0,
            iteration: 1,
            duration: 1,
            local_ip: 0,
            remote_ip: 0,
            local_mac: MacAddr::ZERO,
            remote_mac: MacAddr::ZERO,
            device_pcie: String::new(),
            device_name: String::new(),
        }
    }
}

/// 可调参数包。全部批大小受 [`MAX_BATCH`] 约束（构造工作空间时校验）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunableParams {
    /// 应用核心数。
    pub app_core_num: u8,
    /// 分发器队列数。
    pub disp_queue_num: u8,
    /// 应用 TX 消息批大小。
    pub app_tx_msg_batch: u16,
    /// 应用 RX 消息批大小。
    pub app_rx_msg_batch: u16,
    /// 分发器单环收集批大小下限。
    pub disp_tx_batch: u16,
    /// 分发器 RX 分发批大小。
    pub disp_rx_batch: u16,
    /// NIC 发射的暂存阈值。
    pub nic_tx_post: u16,
    /// NIC 单次轮询的完成上限。
    pub nic_rx_post: u16,
    /// 请求消息载荷字节数。
    pub req_payload_size: usize,
    /// 响应消息载荷字节数。
    pub resp_payload_size: usize,
}

impl Default for TunableParams {
    fn default() -> Self {
        Self {
            app_core_num: 1,
            disp_queue_num: 1,
            app_tx_msg_batch: 32,
            app_rx_msg_batch: 32,
            disp_tx_batch: 32,
            disp_rx_batch: 32,
            nic_tx_post: 32,
            nic_rx_post: 128,
            req_payload_size: 64,
            resp_payload_size: 64,
        }
    }
}

impl TunableParams {
    /// 校验批大小上限。
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, usize); 6] = [
            ("kAppTxBatchSize", self.app_tx_msg_batch as usize),
            ("kAppRxBatchSize", self.app_rx_msg_batch as usize),
            ("kDispTxBatchSize", self.disp_tx_batch as usize),
            ("kDispRxBatchSize", self.disp_rx_batch as usize),
            ("kNICTxPostSize", self.nic_tx_post as usize),
            ("kNICRxPostSize", self.nic_rx_post as usize),
        ];
        for (key, value) in checks {
            if value > MAX_BATCH {
                return Err(DperfError::config(format!(
                    "{key}={value} 超出批大小上限 {MAX_BATCH}"
                )));
            }
        }
        if self.app_core_num as usize > MAX_WORKSPACES {
            return Err(DperfError::config(format!(
                "kAppCoreNum={} 超出工作空间上限 {MAX_WORKSPACES}",
                self.app_core_num
            )));
        }
        Ok(())
    }

    /// 以配置文件语法重发射参数包（往返律入口）。
    pub fn emit(&self) -> String {
        format!(
            "kAppCoreNum:{}\n\
             kDispQueueNum:{}\n\
             kAppTxBatchSize:{}\n\
             kAppRxBatchSize:{}\n\
             kDispTxBatchSize:{}\n\
             kDispRxBatchSize:{}\n\
             kNICTxPostSize:{}\n\
             kNICRxPostSize:{}\n\
             kAppReqPayloadSize:{}\n\
             kAppRespPayloadSize:{}\n",
            self.app_core_num,
            self.disp_queue_num,
            self.app_tx_msg_batch,
            self.app_rx_msg_batch,
            self.disp_tx_batch,
            self.disp_rx_batch,
            self.nic_tx_post,
            self.nic_rx_post,
            self.req_payload_size,
            self.resp_payload_size,
        )
    }
}

/// 单个工作负载的编排描述。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadSpec {
    /// 阶段序列（书写顺序）。
    pub phases: Vec<PhaseKind>,
    /// TX 扇出的远端分发器 id 列表。
    pub remote_dispatchers: Vec<u8>,
    /// Worker 分组（每组一个分发器）。
    pub groups: Vec<Vec<u8>>,
    /// 每组对应的分发器 id。
    pub dispatchers: Vec<u8>,
}

/// ws_id 的负载归属。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WsAssignment {
    /// 所属工作负载类型。
    pub workload_type: u8,
    /// 组内序号。
    pub group_idx: usize,
}

/// 全部工作负载编排。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadsConfig {
    /// 负载类型 → 编排描述。
    pub specs: BTreeMap<u8, WorkloadSpec>,
    /// Worker ws_id → 负载归属。
    pub ws_workload: BTreeMap<u8, WsAssignment>,
}

impl WorkloadsConfig {
    /// Worker 的负载类型。
    pub fn workload_of(&self, ws_id: u8) -> Option<u8> {
        self.ws_workload.get(&ws_id).map(|a| a.workload_type)
    }

    /// Worker 对应的分发器 id。
    pub fn dispatcher_of(&self, ws_id: u8) -> Option<u8> {
        let assignment = self.ws_workload.get(&ws_id)?;
        self.specs
            .get(&assignment.workload_type)?
            .dispatchers
            .get(assignment.group_idx)
            .copied()
    }
}

/// 用户配置的聚合。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserConfig {
    /// 服务端基础配置。
    pub server: ServerConfig,
    /// 可调参数。
    pub tunables: TunableParams,
    /// 工作负载编排。
    pub workloads: WorkloadsConfig,
}

impl UserConfig {
    /// 从文件加载配置。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DperfError::config(format!("无法打开配置文件 {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// 解析配置文本。
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();
        for line in text.lines() {
            let line = line.trim();
            let Some((key, rest)) = line.split_once(':') else {
                continue; // 空行或无冒号行
            };
            let key = key.trim();
            let value = rest.trim();
            match key {
                "numa" => config.server.numa = parse_num(key, value)?,
                "phy_port" => config.server.phy_port = parse_num(key, value)?,
                "iteration" => config.server.iteration = parse_num(key, value)?,
                "duration" => config.server.duration = parse_num(key, value)?,
                "local_ip" => config.server.local_ip = parse_ip(key, value)?,
                "remote_ip" => config.server.remote_ip = parse_ip(key, value)?,
                "local_mac" => config.server.local_mac = MacAddr::parse(value)?,
                "remote_mac" => config.server.remote_mac = MacAddr::parse(value)?,
                "device_pcie" => config.server.device_pcie = value.to_string(),
                "device_name" => config.server.device_name = value.to_string(),
                "kAppCoreNum" => config.tunables.app_core_num = parse_num(key, value)?,
                "kDispQueueNum" => config.tunables.disp_queue_num = parse_num(key, value)?,
                "kAppTxBatchSize" => config.tunables.app_tx_msg_batch = parse_num(key, value)?,
                "kAppRxBatchSize" => config.tunables.app_rx_msg_batch = parse_num(key, value)?,
                "kDispTxBatchSize" => config.tunables.disp_tx_batch = parse_num(key, value)?,
                "kDispRxBatchSize" => config.tunables.disp_rx_batch = parse_num(key, value)?,
                "kNICTxPostSize" => config.tunables.nic_tx_post = parse_num(key, value)?,
                "kNICRxPostSize" => config.tunables.nic_rx_post = parse_num(key, value)?,
                "kAppReqPayloadSize" => config.tunables.req_payload_size = parse_num(key, value)?,
                "kAppRespPayloadSize" => config.tunables.resp_payload_size = parse_num(key, value)?,
                "workload" => config.parse_workload(rest.trim())?,
                other => {
                    return Err(DperfError::config(format!("无法识别的配置键 {other}")));
                }
            }
        }
        Ok(config)
    }

    /// 解析一条 workload 行（`key:` 之后的剩余字段）。
    fn parse_workload(&mut self, rest: &str) -> Result<()> {
        let fields: Vec<&str> = rest.split(':').map(str::trim).collect();
        if fields.len() != 5 {
            return Err(DperfError::config(format!(
                "workload 行需要 5 个字段（type:phases:remote:groups:dispatchers），得到 {}",
                fields.len()
            )));
        }

        let workload_type: u8 = parse_num("workload type", fields[0])?;
        if workload_type as usize >= MAX_WORKSPACES {
            return Err(DperfError::config(format!(
                "工作负载类型 {workload_type} 越界"
            )));
        }
        if self.workloads.specs.contains_key(&workload_type) {
            return Err(DperfError::config(format!(
                "工作负载类型 {workload_type} 重复定义"
            )));
        }

        let phases = fields[1]
            .split(',')
            .map(str::trim)
            .map(|name| {
                PhaseKind::from_name(name)
                    .ok_or_else(|| DperfError::config(format!("无法识别的阶段名 {name}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let remote_dispatchers = fields[2]
            .split(',')
            .map(str::trim)
            .map(|s| parse_ws_id(s))
            .collect::<Result<Vec<_>>>()?;

        let mut groups = Vec::new();
        for (group_idx, group_text) in fields[3].split('|').map(str::trim).enumerate() {
            let group = expand_group(group_text)?;
            for &ws_id in &group {
                if self.workloads.ws_workload.contains_key(&ws_id) {
                    return Err(DperfError::config(format!(
                        "工作空间 {ws_id} 已被指派给其它工作负载"
                    )));
                }
                self.workloads.ws_workload.insert(
                    ws_id,
                    WsAssignment {
                        workload_type,
                        group_idx,
                    },
                );
            }
            groups.push(group);
        }

        let dispatchers = fields[4]
            .split(['|', ','])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_ws_id)
            .collect::<Result<Vec<_>>>()?;
        if dispatchers.len() != groups.len() {
            return Err(DperfError::config(format!(
                "每个 Worker 组需要恰好一个分发器：组 {} 个、分发器 {} 个",
                groups.len(),
                dispatchers.len()
            )));
        }

        self.workloads.specs.insert(
            workload_type,
            WorkloadSpec {
                phases,
                remote_dispatchers,
                groups,
                dispatchers,
            },
        );
        Ok(())
    }

    /// 启动期摘要，供入口打印。
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "NUMA {} | 端口 {} | {} 轮 × {} 秒\n",
            self.server.numa, self.server.phy_port, self.server.iteration, self.server.duration
        ));
        for (workload_type, spec) in &self.workloads.specs {
            out.push_str(&format!(
                "workload {workload_type}: 阶段 {:?}\n",
                spec.phases
            ));
            for (group_idx, group) in spec.groups.iter().enumerate() {
                out.push_str(&format!(
                    "  组 {group_idx}: App {:?} | 分发器 {}\n",
                    group, spec.dispatchers[group_idx]
                ));
            }
        }
        out
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| DperfError::config(format!("配置键 {key} 的取值 {value} 不是合法数字")))
}

fn parse_ip(key: &str, value: &str) -> Result<u32> {
    ipv4_from_str(value)
        .ok_or_else(|| DperfError::config(format!("配置键 {key} 的取值 {value} 不是合法 IPv4")))
}

fn parse_ws_id(s: &str) -> Result<u8> {
    let ws_id: u8 = parse_num("ws_id", s)?;
    if ws_id >= INVALID_WS_ID {
        return Err(DperfError::config(format!("工作空间 id {ws_id} 越界")));
    }
    Ok(ws_id)
}

/// 展开一个组描述：`a-b` 区间或逗号列表。
fn expand_group(text: &str) -> Result<Vec<u8>> {
    if let Some((start, end)) = text.split_once('-') {
        let start = parse_ws_id(start.trim())?;
        let end = parse_ws_id(end.trim())?;
        if start > end {
            return Err(DperfError::config(format!("区间 {text} 起点大于终点")));
        }
        Ok((start..=end).collect())
    } else {
        text.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_ws_id)
            .collect()
    }
}
