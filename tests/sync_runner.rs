use jamcore::runtime::activity::ExecutionKind;
use jamcore::runtime::command::{Argument, Command, CommandKind, NAK_CONDITION_FALSE, RESULTS_MARKER};
use jamcore::runtime::condition::{StaticTopology, Tier, root_condition};
use jamcore::runtime::error::{ActivityError, RuntimeError};
use jamcore::runtime::transport::RecordingTransport;
use jamcore::runtime::{Runtime, RuntimeConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;

fn start(links: &[Tier]) -> (Arc<Runtime>, UnboundedReceiver<(Tier, Command)>) {
    let config = RuntimeConfig {
        tier: Tier::Device,
        links: links.to_vec(),
        ack_timeout_ms: 80,
        default_lease_ms: 10,
        ..RuntimeConfig::default()
    };
    let (transport, sent) = RecordingTransport::new(links);
    let runtime = Runtime::start(
        config,
        Arc::new(transport),
        Arc::new(StaticTopology::new(links)),
    )
    .unwrap();
    runtime
        .register("add", "ii", ExecutionKind::Sync, |args| {
            let sum = args.iter().filter_map(Argument::as_int).sum();
            Ok(Some(Argument::Int(sum)))
        })
        .unwrap();
    (Arc::new(runtime), sent)
}

async fn next_sent(sent: &mut UnboundedReceiver<(Tier, Command)>) -> (Tier, Command) {
    tokio::time::timeout(Duration::from_secs(2), sent.recv())
        .await
        .expect("nothing sent")
        .expect("recorder closed")
}

#[tokio::test]
async fn silent_root_yields_no_result() {
    let (runtime, mut sent) = start(&[Tier::Fog]);

    let began = Instant::now();
    let result = runtime
        .rexec_sync("add", vec![Argument::Int(1), Argument::Int(2)])
        .await
        .unwrap();
    assert_eq!(result, None);
    assert!(began.elapsed() < Duration::from_secs(1));

    let (tier, syn) = next_sent(&mut sent).await;
    assert_eq!(tier, Tier::Fog);
    assert_eq!(syn.kind(), CommandKind::RexecSyn);
    assert_eq!(syn.option(), root_condition(Tier::Fog));

    // nothing else goes out once the root stays silent
    assert!(sent.try_recv().is_err());
    assert_eq!(runtime.in_flight(), 0);
    assert_eq!(runtime.activities().live_count(), 0);
}

#[tokio::test]
async fn acknowledged_call_returns_result() {
    let (runtime, mut sent) = start(&[Tier::Fog]);
    let inbound = runtime.inbound();

    let call = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .rexec_sync("add", vec![Argument::Int(40), Argument::Int(2)])
                .await
        })
    };

    let (_, root_only) = next_sent(&mut sent).await;
    assert_eq!(root_only.option(), root_condition(Tier::Fog));
    let ack = Command::reply_to(&root_only, CommandKind::RexecAck, "FOG", "fog-node", vec![Argument::Int(10)]).unwrap();
    inbound.deliver(Tier::Fog, ack.as_bytes()).unwrap();

    let (_, broadcast) = next_sent(&mut sent).await;
    assert_eq!(broadcast.kind(), CommandKind::RexecSyn);
    assert_eq!(broadcast.option(), "true");
    assert_eq!(broadcast.args(), root_only.args());
    assert_eq!(broadcast.id(), root_only.id());

    // acknowledgment of the broadcast copy arrives during the lease
    let stale = Command::reply_to(&broadcast, CommandKind::RexecAck, "FOG", "fog-node", vec![Argument::Int(10)]).unwrap();
    inbound.deliver_command(Tier::Fog, stale).unwrap();

    let (_, pull) = next_sent(&mut sent).await;
    assert_eq!(pull.kind(), CommandKind::RexecResGet);
    assert!(pull.args().is_empty());

    let put = Command::reply_to(&pull, CommandKind::RexecResPut, "FOG", RESULTS_MARKER, vec![Argument::Int(42)]).unwrap();
    inbound.deliver_command(Tier::Fog, put).unwrap();

    let result = call.await.unwrap().unwrap();
    assert_eq!(result, Some(Argument::Int(42)));
    assert_eq!(runtime.in_flight(), 0);
    assert_eq!(runtime.activities().live_count(), 0);
}

#[tokio::test]
async fn one_rejection_does_not_fail_the_call() {
    let (runtime, mut sent) = start(&[Tier::Device, Tier::Fog]);
    let inbound = runtime.inbound();

    let call = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .rexec_sync("add", vec![Argument::Int(1), Argument::Int(1)])
                .await
        })
    };

    // root-only request goes to both brokers
    let (_, root_only) = next_sent(&mut sent).await;
    let (_, _) = next_sent(&mut sent).await;
    assert_eq!(root_only.option(), root_condition(Tier::Fog));

    let nak = Command::reply_to(
        &root_only,
        CommandKind::RexecNak,
        "DEVICE",
        "dev-node",
        vec![Argument::Str(NAK_CONDITION_FALSE.to_string())],
    )
    .unwrap();
    let ack = Command::reply_to(&root_only, CommandKind::RexecAck, "FOG", "fog-node", vec![Argument::Int(5)]).unwrap();
    inbound.deliver_command(Tier::Device, nak).unwrap();
    inbound.deliver_command(Tier::Fog, ack).unwrap();

    let mut pull = None;
    while pull.is_none() {
        let (_, cmd) = next_sent(&mut sent).await;
        if cmd.kind() == CommandKind::RexecResGet {
            pull = Some(cmd);
        }
    }
    let pull = pull.unwrap();

    let empty = Command::reply_to(&pull, CommandKind::RexecResPut, "DEVICE", "EMPTY", vec![]).unwrap();
    let full = Command::reply_to(&pull, CommandKind::RexecResPut, "FOG", RESULTS_MARKER, vec![Argument::Int(2)]).unwrap();
    inbound.deliver_command(Tier::Device, empty).unwrap();
    inbound.deliver_command(Tier::Fog, full).unwrap();

    assert_eq!(call.await.unwrap().unwrap(), Some(Argument::Int(2)));
}

#[tokio::test]
async fn unknown_activity_fails_before_sending() {
    let (runtime, mut sent) = start(&[Tier::Fog]);

    let err = runtime.rexec_sync("bogus", vec![]).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Activity(ActivityError::NotFound(name)) if name == "bogus"));

    let err = runtime
        .rexec_sync("add", vec![Argument::Str("one".into()), Argument::Int(2)])
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Activity(ActivityError::ParameterError { .. })));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sent.try_recv().is_err());
    assert_eq!(runtime.activities().live_count(), 0);
}

#[tokio::test]
async fn late_rejection_does_not_hide_the_result() {
    let (runtime, mut sent) = start(&[Tier::Device, Tier::Fog]);
    let inbound = runtime.inbound();

    let call = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .rexec_sync("add", vec![Argument::Int(1), Argument::Int(1)])
                .await
        })
    };

    let (_, root_only) = next_sent(&mut sent).await;
    let (_, _) = next_sent(&mut sent).await;
    let ack = Command::reply_to(&root_only, CommandKind::RexecAck, "FOG", "fog-node", vec![Argument::Int(5)]).unwrap();
    inbound.deliver_command(Tier::Fog, ack).unwrap();

    // the device rejection misses the acknowledgment window
    tokio::time::sleep(Duration::from_millis(120)).await;
    let nak = Command::reply_to(
        &root_only,
        CommandKind::RexecNak,
        "DEVICE",
        "dev-node",
        vec![Argument::Str(NAK_CONDITION_FALSE.to_string())],
    )
    .unwrap();
    inbound.deliver_command(Tier::Device, nak).unwrap();

    let pull = loop {
        let (_, cmd) = next_sent(&mut sent).await;
        if cmd.kind() == CommandKind::RexecResGet {
            break cmd;
        }
    };
    let empty = Command::reply_to(&pull, CommandKind::RexecResPut, "DEVICE", "EMPTY", vec![]).unwrap();
    let full = Command::reply_to(&pull, CommandKind::RexecResPut, "FOG", RESULTS_MARKER, vec![Argument::Int(2)]).unwrap();
    inbound.deliver_command(Tier::Device, empty).unwrap();
    inbound.deliver_command(Tier::Fog, full).unwrap();

    assert_eq!(call.await.unwrap().unwrap(), Some(Argument::Int(2)));
    assert_eq!(runtime.activities().live_count(), 0);
}
