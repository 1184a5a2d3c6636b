// netsync_core/src/main.rs
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::{info, Level};

use device_adapter::MockDeviceAdapter;
use device_adapter_interface::AdapterRegistry;
use netsync_core::{
    SyncConfig, SyncController, SyncDeps, SyncMaps, StaticMastership, SystemClock,
};
use netsync_shared_types::{
    ApplicationId, ConnectPoint, DeviceId, FlowEntry, FlowRule, GroupBucket, GroupDescription,
    GroupEntry, GroupKey, GroupType, Intent, IntentKind, NodeId, TrafficSelector,
    TrafficTreatment,
};
use observability::{init_tracing, DispatchStats, TracingConfig};
use state_store_interface::InMemoryStorage;

/// Runs a two-node in-memory cluster against simulated devices and prints
/// the state it converges to.
#[derive(Debug, Parser)]
#[command(name = "netsyncd", version)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Extra filter directive, repeatable (e.g. `netsync_core::flow=debug`)
    #[arg(long = "log-directive")]
    log_directives: Vec<String>,
}

struct Member {
    controller: SyncController,
    devices: Vec<DeviceId>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let tracing_config = args.log_directives.iter().fold(
        TracingConfig::new("netsyncd")
            .with_level(args.log_level)
            .with_json(args.json_logs),
        |config, directive| config.with_directive(directive.as_str()),
    );
    init_tracing(tracing_config);

    let config = match &args.config {
        Some(path) => SyncConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => SyncConfig::default(),
    };
    info!(config = ?config, "Starting netsyncd demo");

    let first_device = DeviceId::new("of:0000000000000001");
    let second_device = DeviceId::new("of:0000000000000002");
    let local = config.local_node_id();
    let peer = NodeId::new(format!("{}-peer", config.local_node));

    // One simulated switch fabric shared by both members.
    let flow_devices = Arc::new(MockDeviceAdapter::<FlowRule>::new("mock-openflow"));
    let group_devices = Arc::new(MockDeviceAdapter::<GroupDescription>::new("mock-openflow"));
    let storage = Arc::new(InMemoryStorage::new());

    let mut members = Vec::new();
    for node in [local.clone(), peer.clone()] {
        let mastership = StaticMastership::new(node.clone());
        mastership.set_master(first_device.clone(), local.clone());
        mastership.set_master(second_device.clone(), peer.clone());

        let flow_adapters = Arc::new(AdapterRegistry::new());
        let group_adapters = Arc::new(AdapterRegistry::new());
        for device in [&first_device, &second_device] {
            flow_adapters.register(device.clone(), flow_devices.clone());
            group_adapters.register(device.clone(), group_devices.clone());
        }

        let controller = SyncController::build(
            SyncConfig {
                local_node: node.to_string(),
                ..config.clone()
            },
            SyncDeps {
                maps: SyncMaps::open(&storage.for_node(node.clone()))?,
                flow_adapters,
                group_adapters,
                mastership: Arc::new(mastership),
                clock: Arc::new(SystemClock),
            },
        )?;
        let devices = if node == local {
            vec![first_device.clone()]
        } else {
            vec![second_device.clone()]
        };
        members.push(Member { controller, devices });
    }
    let leader = &members[0].controller;

    let app = ApplicationId::new("org.netsync.demo");
    let rules = [&first_device, &second_device].map(|device| {
        FlowRule::new(
            device.clone(),
            app.clone(),
            40_000,
            TrafficSelector::new().matching("eth_type", "0x88cc"),
            TrafficTreatment::new().instruction("output:CONTROLLER"),
        )
    });
    leader.flow_manager().apply_flow_rules(&rules).await?;

    leader
        .group_manager()
        .add_groups(&[GroupDescription {
            device_id: first_device.clone(),
            key: GroupKey::new("ecmp-1"),
            app_id: app.clone(),
            group_type: GroupType::Select,
            buckets: vec![
                GroupBucket::new(TrafficTreatment::new().instruction("output:1")),
                GroupBucket::new(TrafficTreatment::new().instruction("output:2")),
            ],
        }])
        .await?;

    let intent = Intent::new(
        app.clone(),
        100,
        IntentKind::PointToPoint {
            ingress: ConnectPoint::new(first_device.clone(), 1),
            egress: ConnectPoint::new(first_device.clone(), 2),
            selector: TrafficSelector::new().matching("eth_type", "0x0800"),
        },
    );
    let state = leader.intent_manager().submit(intent.clone()).await?;
    info!(intent_id = %intent.id, state = %state, "Intent submitted");

    // Someone configured the switch by hand; reconciliation should undo it.
    flow_devices.install_out_of_band(FlowRule::new(
        first_device.clone(),
        ApplicationId::new("cli"),
        1,
        TrafficSelector::new().matching("in_port", "7"),
        TrafficTreatment::new().instruction("drop"),
    ));

    // Two report rounds: the first confirms and cleans up, the second
    // shows a steady state.
    for round in 1..=2 {
        for member in &members {
            for device in &member.devices {
                let flows = flow_devices
                    .installed(device)
                    .into_iter()
                    .map(|rule| FlowEntry::reported(rule, 10 * round, 640 * round, round))
                    .collect();
                member.controller.flow_manager().push_flow_metrics(device, flows).await?;

                let groups = group_devices
                    .installed(device)
                    .into_iter()
                    .map(|description| GroupEntry::reported(description, 5 * round, 320 * round))
                    .collect();
                member.controller.group_manager().push_group_metrics(device, groups).await?;
            }
        }
        info!(round, "Report round complete");
    }

    for member in &members {
        member.controller.flush_events().await;
    }

    let observer = &members[1].controller;
    let mut devices = serde_json::Map::new();
    for device in [&first_device, &second_device] {
        devices.insert(
            device.to_string(),
            json!({
                "flows": observer.flow_manager().get_flow_entries(device).await?,
                "groups": observer.group_manager().get_groups(device).await?,
                "installed_on_device": flow_devices.installed(device).len(),
            }),
        );
    }
    let summary = json!({
        "observed_from": peer.to_string(),
        "devices": devices,
        "intent": {
            "id": intent.id,
            "state": observer.intent_manager().get_intent_state(&intent.id).await?,
        },
        "events": {
            "flows": stats_json(&leader.flow_manager().dispatcher().stats()),
            "groups": stats_json(&leader.group_manager().dispatcher().stats()),
            "intents": stats_json(&leader.intent_manager().dispatcher().stats()),
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn stats_json(stats: &DispatchStats) -> serde_json::Value {
    json!({
        "posted": stats.posted,
        "delivered": stats.delivered,
        "dropped": stats.dropped,
        "by_type": stats.events_by_type,
    })
}
