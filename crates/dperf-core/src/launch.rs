//! 线程发射：按流水线合成结果为每个活跃 ws_id 启一个绑核线程。
//!
//! # 模块定位（Why）
//! - 入口进程解析配置、合成流水线后，把每个活跃工作空间交给独立线程；
//!   线程内完成分发器构造、工作空间注册与事件循环；
//! - 第一道屏障之前的失败在线程内打印单行诊断并整体退出（非零码），
//!   与 "初始化错误一律致命" 的语义一致。

use std::sync::Arc;

use tracing::{error, info};

use crate::config::UserConfig;
use crate::cpu;
use crate::dispatcher::dpdk::DpdkDispatcher;
use crate::dispatcher::nic::NicDriver;
use crate::dispatcher::roce::RoceDispatcher;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::limits::MAX_WORKSPACES;
use crate::pipeline::{PipelineComposer, WS_DISPATCHER};
use crate::workspace::{NodeRole, Workspace, WsContext};

/// 分发器后端选择（构建期由二进制特性决定）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// 以太网/UDP 形态。
    Dpdk,
    /// RoCE-UD 形态。
    Roce,
}

/// 发射全部活跃工作空间并等待收尾。
///
/// 线程内的初始化失败会打印诊断并以非零码终止进程（屏障协议决定了
/// 局部失败无法恢复）。
pub fn run_workspaces(
    config: Arc<UserConfig>,
    composer: Arc<PipelineComposer>,
    driver: Arc<dyn NicDriver>,
    backend: BackendKind,
    role: NodeRole,
) -> Result<()> {
    let mut plans = Vec::new();
    for ws_id in 0..MAX_WORKSPACES as u8 {
        let (ws_type, steps) = composer.generate_ws_loop(ws_id);
        if ws_type != 0 {
            plans.push((ws_id, ws_type, steps));
        }
    }
    info!(total = plans.len(), "发射工作空间线程");

    let ctx = WsContext::new(plans.len());
    cpu::clear_affinity_for_process();

    let mut threads = Vec::new();
    for (ws_id, ws_type, steps) in plans {
        let ctx = ctx.clone();
        let config = config.clone();
        let driver = driver.clone();
        let handle = std::thread::Builder::new()
            .name(format!("dperf-ws-{ws_id}"))
            .spawn(move || {
                ws_main(ctx, ws_id, ws_type, steps, &config, driver, backend, role);
            })
            .expect("线程发射失败");
        threads.push(handle);
    }
    for handle in threads {
        let _ = handle.join();
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn ws_main(
    ctx: Arc<WsContext>,
    ws_id: u8,
    ws_type: u8,
    steps: Vec<crate::pipeline::Step>,
    config: &UserConfig,
    driver: Arc<dyn NicDriver>,
    backend: BackendKind,
    role: NodeRole,
) {
    let result = build_and_run(ctx, ws_id, ws_type, steps, config, driver, backend, role);
    if let Err(e) = result {
        error!(ws_id, "初始化失败: {e}");
        eprintln!("dperf: workspace {ws_id}: {e}");
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn build_and_run(
    ctx: Arc<WsContext>,
    ws_id: u8,
    ws_type: u8,
    steps: Vec<crate::pipeline::Step>,
    config: &UserConfig,
    driver: Arc<dyn NicDriver>,
    backend: BackendKind,
    role: NodeRole,
) -> Result<()> {
    let dispatcher: Option<Box<dyn Dispatcher>> = if ws_type & WS_DISPATCHER != 0 {
        Some(match backend {
            BackendKind::Dpdk => Box::new(DpdkDispatcher::new(
                ws_id,
                config.server.phy_port,
                config,
                driver,
            )?),
            BackendKind::Roce => {
                let mut disp =
                    RoceDispatcher::new(ws_id, config.server.phy_port, config, driver)?;
                match role {
                    NodeRole::Server => disp.handshake_as_server(ws_id)?,
                    NodeRole::Client => disp.handshake_as_client(ws_id)?,
                }
                Box::new(disp)
            }
        })
    } else {
        None
    };

    let mut ws = Workspace::new(ctx, ws_id, ws_type, config, steps, role, dispatcher)?;
    info!(ws_id, "-------------Workspace {ws_id} is running-------------");
    ws.run_event_loop(config.server.iteration, config.server.duration);
    Ok(())
}
