//! 流水线合成：步骤映射、去重、类型位与单阶段拼接规则。

use dperf_core::UserConfig;
use dperf_core::pipeline::{
    PhaseKind, PipelineComposer, Step, WS_DISPATCHER, WS_WORKER,
};

fn config_with_workload(workload_line: &str) -> UserConfig {
    let text = format!(
        "numa:0\nphy_port:0\niteration:1\nduration:1\n\
         local_ip:10.0.0.1\nremote_ip:10.0.0.2\n\
         local_mac:0c.42.a1.dd.5f.0e\nremote_mac:0c.42.a1.dd.5f.0f\n{workload_line}\n"
    );
    UserConfig::parse(&text).unwrap()
}

/// Worker 与分发器各自获得表定步骤，顺序跟随阶段书写顺序。
#[test]
fn step_lists_follow_phase_table() {
    let config = config_with_workload(
        "workload:0:TxApplication,TxDispatcher,RXDispatcher,RxApplication:1:0:1",
    );
    let composer = PipelineComposer::new(&config.workloads);

    let (worker_type, worker_steps) = composer.generate_ws_loop(0);
    assert_eq!(worker_type, WS_WORKER);
    assert_eq!(
        worker_steps,
        vec![Step::ApplyBuffers, Step::GeneratePackets, Step::AppHandler]
    );

    let (disp_type, disp_steps) = composer.generate_ws_loop(1);
    assert_eq!(disp_type, WS_DISPATCHER);
    assert_eq!(
        disp_steps,
        vec![Step::CollectTx, Step::NicTx, Step::NicRx, Step::DispatchRx]
    );

    // 未被任何负载引用的 ws 类型为 0。
    let (unused_type, unused_steps) = composer.generate_ws_loop(7);
    assert_eq!(unused_type, 0);
    assert!(unused_steps.is_empty());
}

/// 同一 ws 同时承担应用与分发时类型位按或合成，重复步骤被抑制。
#[test]
fn combined_ws_type_and_dedup() {
    let config = config_with_workload(
        "workload:0:TxApplication,TxDispatcher,TxApplication:0:0:0",
    );
    let composer = PipelineComposer::new(&config.workloads);
    let (ws_type, steps) = composer.generate_ws_loop(0);
    assert_eq!(ws_type, WS_WORKER | WS_DISPATCHER);
    // TxApplication 重复书写，但步骤只出现一次。
    assert_eq!(
        steps,
        vec![Step::ApplyBuffers, Step::GeneratePackets, Step::CollectTx, Step::NicTx]
    );
}

/// 负载归属查询覆盖 Worker 与分发器。
#[test]
fn workload_lookup_covers_both_halves() {
    let config = config_with_workload(
        "workload:3:TxApplication,TxDispatcher:1:0:1",
    );
    let composer = PipelineComposer::new(&config.workloads);
    assert_eq!(composer.workload_of(0), Some(3));
    assert_eq!(composer.workload_of(1), Some(3));
    assert_eq!(composer.workload_of(9), None);
}

/// 单阶段拼接规则：四种分发/NIC 隔离形态。
#[test]
fn one_stage_splices() {
    let config = config_with_workload(
        "workload:0:TxApplication,TxDispatcher,RXDispatcher,RxApplication:1:0:1",
    );

    let cases = [
        (PhaseKind::TxDisp, vec![Step::CollectTx]),
        (PhaseKind::TxNic, vec![Step::NicTx]),
        (PhaseKind::RxDisp, vec![Step::DispatchRx]),
        (PhaseKind::RxNic, vec![Step::NicRx]),
    ];
    for (isolated, expected) in cases {
        let composer =
            PipelineComposer::new(&config.workloads).with_isolated_phase(Some(isolated));
        let (disp_type, disp_steps) = composer.generate_ws_loop(1);
        assert_eq!(disp_type, WS_DISPATCHER, "隔离 {isolated:?} 不应改变类型位");
        assert_eq!(disp_steps, expected, "隔离 {isolated:?} 的步骤拼接有误");

        // Worker 阶段未被隔离时步骤为空，类型位保持。
        let (worker_type, worker_steps) = composer.generate_ws_loop(0);
        assert_eq!(worker_type, WS_WORKER);
        assert!(worker_steps.is_empty());
    }
}

/// 隔离应用阶段时只保留应用步骤。
#[test]
fn one_stage_app_isolation() {
    let config = config_with_workload(
        "workload:0:TxApplication,TxDispatcher,RXDispatcher,RxApplication:1:0:1",
    );
    let composer =
        PipelineComposer::new(&config.workloads).with_isolated_phase(Some(PhaseKind::TxApp));
    let (_, worker_steps) = composer.generate_ws_loop(0);
    assert_eq!(worker_steps, vec![Step::ApplyBuffers, Step::GeneratePackets]);
    let (_, disp_steps) = composer.generate_ws_loop(1);
    assert!(disp_steps.is_empty());
}
