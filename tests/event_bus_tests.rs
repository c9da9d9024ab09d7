use std::time::Duration;

use swarmllm::covenant::{Constraints, Covenant, CovenantResults};
use swarmllm::event::{EventBus, ServerEvent};

fn progress(n: u8) -> ServerEvent {
    ServerEvent::AgentProgress {
        covenant_id: "c1".into(),
        agent_id: format!("agent-{}", n),
        progress: n,
        thought: None,
    }
}

fn results() -> CovenantResults {
    CovenantResults {
        content: "done".into(),
        quality: 0.9,
        cost_usd: 0.0,
        latency_ms: 1,
        sub_agent_count: 0,
        used_fallback: false,
        error: None,
    }
}

#[tokio::test]
async fn test_events_arrive_in_publish_order() {
    let bus = EventBus::new();
    let sub = bus.subscribe().await;

    for n in 0..5 {
        bus.publish(progress(n)).await;
    }

    for n in 0..5 {
        match sub.recv().await {
            ServerEvent::AgentProgress { progress, .. } => assert_eq!(progress, n),
            other => panic!("unexpected event {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_mid_run_attach_replays_a_snapshot_first() {
    let bus = EventBus::new();
    let covenant = Covenant::new("user-1", "what is 2+2?", Constraints::default());
    bus.publish(ServerEvent::CovenantUpdate {
        covenant: covenant.clone(),
    })
    .await;

    // Nobody was listening, but a late subscriber still sees the head first.
    let sub = bus.subscribe().await;
    bus.publish(progress(1)).await;

    match sub.recv().await {
        ServerEvent::CovenantUpdate { covenant: head } => assert_eq!(head.id, covenant.id),
        other => panic!("expected snapshot first, got {:?}", other),
    }
    match sub.recv().await {
        ServerEvent::AgentProgress { .. } => {}
        other => panic!("expected live event second, got {:?}", other),
    }
}

#[tokio::test]
async fn test_backpressure_coalesces_progress_but_never_terminals() {
    let bus = EventBus::with_capacity(4);
    let sub = bus.subscribe().await;

    for n in 0..10 {
        bus.publish(progress(n)).await;
    }
    bus.publish(ServerEvent::Completed {
        covenant_id: "c1".into(),
        results: results(),
    })
    .await;

    let mut seen = Vec::new();
    while let Some(event) = sub.try_recv().await {
        seen.push(event);
    }

    // The queue stayed bounded by dropping old progress, and the terminal
    // event survived at the end.
    assert!(seen.len() <= 5);
    assert!(matches!(seen.last(), Some(ServerEvent::Completed { .. })));
    let progress_count = seen
        .iter()
        .filter(|e| matches!(e, ServerEvent::AgentProgress { .. }))
        .count();
    assert!(progress_count < 10);
}

#[tokio::test]
async fn test_full_queue_of_non_progress_events_loses_nothing() {
    let bus = EventBus::with_capacity(2);
    let sub = bus.subscribe().await;

    for _ in 0..4 {
        bus.publish(ServerEvent::TaskStart {
            covenant_id: "c1".into(),
        })
        .await;
    }
    bus.publish(ServerEvent::Rejected {
        covenant_id: "c1".into(),
        reason: "quality_below_threshold".into(),
        quality: 0.4,
    })
    .await;

    let mut count = 0;
    let mut last = None;
    while let Some(event) = sub.try_recv().await {
        count += 1;
        last = Some(event);
    }
    assert_eq!(count, 5);
    assert!(matches!(last, Some(ServerEvent::Rejected { .. })));
}

#[tokio::test]
async fn test_recv_wakes_on_later_publish() {
    let bus = EventBus::new();
    let sub = bus.subscribe().await;

    let publisher = {
        let bus = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bus.publish(progress(7)).await;
        })
    };

    let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("recv must wake when an event lands");
    assert!(matches!(event, ServerEvent::AgentProgress { progress: 7, .. }));
    publisher.await.unwrap();
}

#[test]
fn test_server_events_serialize_with_snake_case_tags() {
    let json = serde_json::to_value(ServerEvent::TaskStart {
        covenant_id: "c1".into(),
    })
    .unwrap();
    assert_eq!(json["type"], "task_start");
    assert_eq!(json["covenant_id"], "c1");

    let json = serde_json::to_value(ServerEvent::Rejected {
        covenant_id: "c1".into(),
        reason: "quality_below_threshold".into(),
        quality: 0.45,
    })
    .unwrap();
    assert_eq!(json["type"], "rejected");
    assert_eq!(json["quality"], 0.45);
}

#[test]
fn test_client_commands_deserialize_from_tagged_json() {
    let cmd: swarmllm::event::ClientCommand = serde_json::from_str(
        r#"{"type":"create_covenant","intent":"What is 2+2?"}"#,
    )
    .unwrap();
    match cmd {
        swarmllm::event::ClientCommand::CreateCovenant { intent, constraints } => {
            assert_eq!(intent, "What is 2+2?");
            assert!(constraints.is_none());
        }
        other => panic!("unexpected command {:?}", other),
    }

    let cmd: swarmllm::event::ClientCommand =
        serde_json::from_str(r#"{"type":"cancel","covenant_id":"c9"}"#).unwrap();
    assert!(matches!(
        cmd,
        swarmllm::event::ClientCommand::Cancel { .. }
    ));
}

#[tokio::test]
async fn test_dropped_subscribers_are_pruned() {
    let bus = EventBus::new();
    let sub = bus.subscribe().await;
    assert_eq!(bus.subscriber_count().await, 1);
    drop(sub);
    assert_eq!(bus.subscriber_count().await, 0);
}
