//! 配置解析：往返律、键合法性与负载编排约束。

use dperf_core::UserConfig;
use dperf_core::config::TunableParams;
use dperf_core::error::DperfError;
use dperf_core::pipeline::PhaseKind;

fn base_config() -> String {
    "numa:0\n\
     phy_port:0\n\
     iteration:1\n\
     duration:1\n\
     local_ip:10.0.0.1\n\
     remote_ip:10.0.0.2\n\
     local_mac:0c.42.a1.dd.5f.0e\n\
     remote_mac:0c.42.a1.dd.5f.0f\n\
     device_pcie:0000:98.0\n\
     device_name:mlx5_0\n"
        .to_string()
}

/// 可调参数重发射后再解析得到逐字段相同的参数包。
#[test]
fn tunables_round_trip() {
    let tunables = TunableParams {
        app_core_num: 2,
        disp_queue_num: 2,
        app_tx_msg_batch: 16,
        app_rx_msg_batch: 8,
        disp_tx_batch: 64,
        disp_rx_batch: 32,
        nic_tx_post: 48,
        nic_rx_post: 256,
        req_payload_size: 4096,
        resp_payload_size: 64,
    };
    let emitted = tunables.emit();
    let reparsed = UserConfig::parse(&emitted).unwrap();
    assert_eq!(reparsed.tunables, tunables);
}

/// 未识别的键是配置错误。
#[test]
fn unknown_key_is_rejected() {
    let text = format!("{}bogus_key:1\n", base_config());
    let err = UserConfig::parse(&text).unwrap_err();
    assert!(matches!(err, DperfError::Config { .. }), "{err}");
}

/// 空行与无冒号行被跳过。
#[test]
fn blank_lines_are_skipped() {
    let text = format!("{}\n\njust a note without colon\n", base_config());
    let config = UserConfig::parse(&text).unwrap();
    assert_eq!(config.server.numa, 0);
    assert_eq!(config.server.device_pcie, "0000:98.0");
}

/// workload 行：阶段、远端分发器、`a-b` 区间组与逐组分发器。
#[test]
fn workload_with_range_groups() {
    let text = format!(
        "{}workload:0:TxApplication,TxDispatcher,RXDispatcher,RxApplication:4,5:0-2|3:4|5\n",
        base_config()
    );
    let config = UserConfig::parse(&text).unwrap();
    let spec = &config.workloads.specs[&0];
    assert_eq!(
        spec.phases,
        vec![
            PhaseKind::TxApp,
            PhaseKind::TxDisp,
            PhaseKind::RxDisp,
            PhaseKind::RxApp
        ]
    );
    assert_eq!(spec.remote_dispatchers, vec![4, 5]);
    assert_eq!(spec.groups, vec![vec![0, 1, 2], vec![3]]);
    assert_eq!(spec.dispatchers, vec![4, 5]);

    assert_eq!(config.workloads.workload_of(1), Some(0));
    assert_eq!(config.workloads.dispatcher_of(2), Some(4));
    assert_eq!(config.workloads.dispatcher_of(3), Some(5));
}

/// 一个 ws_id 至多隶属一个负载的应用组，违例中止初始化。
#[test]
fn duplicate_ws_assignment_aborts() {
    let text = format!(
        "{}workload:0:TxApplication:2:0:2\nworkload:1:TxApplication:3:0:3\n",
        base_config()
    );
    let err = UserConfig::parse(&text).unwrap_err();
    assert!(matches!(err, DperfError::Config { .. }), "{err}");
}

/// 组数与分发器数必须一致。
#[test]
fn dispatcher_per_group_enforced() {
    let text = format!(
        "{}workload:0:TxApplication:4:0-1|2-3:4\n",
        base_config()
    );
    let err = UserConfig::parse(&text).unwrap_err();
    assert!(matches!(err, DperfError::Config { .. }), "{err}");
}

/// 批大小越界在校验时被拒绝。
#[test]
fn oversized_batch_rejected() {
    let text = format!("{}kAppTxBatchSize:513\n", base_config());
    let config = UserConfig::parse(&text).unwrap();
    let err = config.tunables.validate().unwrap_err();
    assert!(matches!(err, DperfError::Config { .. }), "{err}");
}

/// 载荷尺寸键按配置读取。
#[test]
fn payload_size_keys_accepted() {
    let text = format!(
        "{}kAppReqPayloadSize:4096\nkAppRespPayloadSize:64\n",
        base_config()
    );
    let config = UserConfig::parse(&text).unwrap();
    assert_eq!(config.tunables.req_payload_size, 4096);
    assert_eq!(config.tunables.resp_payload_size, 64);
}

/// 畸形 MAC 与 IP 立即报错。
#[test]
fn malformed_addresses_rejected() {
    let err = UserConfig::parse("local_mac:0c.42.a1\n").unwrap_err();
    assert!(matches!(err, DperfError::Config { .. }), "{err}");
    let err = UserConfig::parse("local_ip:999.0.0.1\n").unwrap_err();
    assert!(matches!(err, DperfError::Config { .. }), "{err}");
}
