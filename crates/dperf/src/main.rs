//! `dperf` 入口：读配置、合成流水线、发射工作空间。
//!
//! 无命令行参数：配置路径按节点角色硬编码为 `config/send_config`
//! （客户端）或 `config/recv_config`（服务端，`server` 特性），
//! 后端形态由 `roce` 特性切换。干净收尾退出 0，初始化失败退出非零。

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use dperf_core::dispatcher::nic::LoopbackFabric;
use dperf_core::launch::{BackendKind, run_workspaces};
use dperf_core::pipeline::PipelineComposer;
use dperf_core::workspace::NodeRole;
use dperf_core::UserConfig;

#[cfg(feature = "server")]
const CONFIG_PATH: &str = "config/recv_config";
#[cfg(not(feature = "server"))]
const CONFIG_PATH: &str = "config/send_config";

#[cfg(feature = "server")]
const ROLE: NodeRole = NodeRole::Server;
#[cfg(not(feature = "server"))]
const ROLE: NodeRole = NodeRole::Client;

#[cfg(feature = "roce")]
const BACKEND: BackendKind = BackendKind::Roce;
#[cfg(not(feature = "roce"))]
const BACKEND: BackendKind = BackendKind::Dpdk;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("Load config file: {CONFIG_PATH}");
    let config = match UserConfig::load(CONFIG_PATH) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("dperf: {e}");
            std::process::exit(1);
        }
    };
    print!("{}", config.render());

    let composer = Arc::new(PipelineComposer::new(&config.workloads));
    print!("{}", composer.render());

    // 无硬件环境下以进程内回环 fabric 承载数据面；
    // 真实驱动绑定按同一 NicDriver 契约接入。
    let fabric = LoopbackFabric::new();
    fabric.add_port(
        config.server.phy_port,
        config.server.local_mac,
        config.server.phy_port,
    );

    if let Err(e) = run_workspaces(config, composer, fabric, BACKEND, ROLE) {
        eprintln!("dperf: {e}");
        std::process::exit(1);
    }
}
