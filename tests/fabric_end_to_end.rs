use jamcore::runtime::activity::{ActivityState, ExecutionKind};
use jamcore::runtime::command::Argument;
use jamcore::runtime::condition::{StaticTopology, Tier, root_condition};
use jamcore::runtime::transport::MemoryFabric;
use jamcore::runtime::{Runtime, RuntimeConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct Cluster {
    app: Runtime,
    servers: Vec<Runtime>,
    runs: Arc<AtomicUsize>,
}

fn register(runtime: &Runtime, runs: Arc<AtomicUsize>) {
    runtime
        .register("square", "i", ExecutionKind::Sync, |args| {
            Ok(args.first().and_then(Argument::as_int).map(|v| Argument::Int(v * v)))
        })
        .unwrap();
    runtime
        .register("record", "sd", ExecutionKind::Async, move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();
}

fn config(tier: Tier, links: &[Tier]) -> RuntimeConfig {
    RuntimeConfig {
        tier,
        links: links.to_vec(),
        default_lease_ms: 20,
        ..RuntimeConfig::default()
    }
}

/// An application node linked to a device server and a fog server
fn cluster() -> Cluster {
    let fabric = MemoryFabric::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut servers = Vec::new();

    for tier in [Tier::Device, Tier::Fog] {
        let links = [tier];
        let server = Runtime::start(
            config(tier, &links),
            Arc::new(fabric.transport(&links)),
            Arc::new(StaticTopology::new(&links)),
        )
        .unwrap();
        register(&server, runs.clone());
        fabric.attach_server(tier, server.inbound());
        servers.push(server);
    }

    let links = [Tier::Device, Tier::Fog];
    let app = Runtime::start(
        config(Tier::Device, &links),
        Arc::new(fabric.transport(&links)),
        Arc::new(StaticTopology::new(&links)),
    )
    .unwrap();
    register(&app, Arc::new(AtomicUsize::new(0)));
    for tier in links {
        fabric.attach_client(tier, app.inbound());
    }

    Cluster { app, servers, runs }
}

async fn wait_for(runs: &AtomicUsize, expected: usize) {
    for _ in 0..200 {
        if runs.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn sync_call_round_trips_through_brokers() {
    let cluster = cluster();
    let result = cluster
        .app
        .rexec_sync("square", vec![Argument::Int(7)])
        .await
        .unwrap();
    assert_eq!(result, Some(Argument::Int(49)));
    assert_eq!(cluster.app.in_flight(), 0);
    assert_eq!(cluster.app.activities().live_count(), 0);
}

#[tokio::test]
async fn async_call_reaches_every_tier() {
    let cluster = cluster();
    let args = vec![Argument::Str("temp".into()), Argument::Double(21.5)];
    let activity = cluster.app.rexec_async("record", args).await.unwrap();

    assert_eq!(activity.state(), ActivityState::Started);
    let mut options: Vec<_> = activity.replies().iter().map(|r| r.option().to_string()).collect();
    options.sort();
    assert_eq!(options, vec!["DEVICE".to_string(), "FOG".to_string()]);

    wait_for(&cluster.runs, 2).await;
    assert_eq!(cluster.runs.load(Ordering::SeqCst), 2);
    assert!(cluster.app.free(&activity));
}

#[tokio::test]
async fn conditioned_call_is_negative_where_ineligible() {
    let cluster = cluster();
    let args = vec![Argument::Str("temp".into()), Argument::Double(1.0)];
    let activity = cluster
        .app
        .rexec_async_when("record", &root_condition(Tier::Fog), args)
        .await
        .unwrap();

    assert_eq!(activity.state(), ActivityState::NegativeCond);
    wait_for(&cluster.runs, 1).await;
    assert_eq!(cluster.runs.load(Ordering::SeqCst), 1);

    for server in cluster.servers {
        server.shutdown().await;
    }
}

#[tokio::test]
async fn node_serves_its_own_calls() {
    let fabric = MemoryFabric::new();
    let links = [Tier::Device];
    let node = Runtime::start(
        config(Tier::Device, &links),
        Arc::new(fabric.transport(&links)),
        Arc::new(StaticTopology::new(&links)),
    )
    .unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    register(&node, runs.clone());
    fabric.attach_server(Tier::Device, node.inbound());
    fabric.attach_client(Tier::Device, node.inbound());

    let args = vec![Argument::Str("temp".into()), Argument::Double(3.0)];
    let activity = node.rexec_async("record", args).await.unwrap();
    assert_eq!(activity.state(), ActivityState::Started);
    assert_eq!(activity.replies().len(), 1);
    wait_for(&runs, 1).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(node.free(&activity));

    let result = node.rexec_sync("square", vec![Argument::Int(7)]).await.unwrap();
    assert_eq!(result, Some(Argument::Int(49)));
    assert_eq!(node.in_flight(), 0);

    node.shutdown().await;
}
