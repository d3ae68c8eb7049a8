//! Partial failure, strict halting, and timeout-rejoin behavior.

use std::collections::HashMap;
use std::time::Duration;

use tactus_harness::{CountingBackend, remote_client_config, remote_unit_entry, spawn_unit};
use tactus_proto::{Attach, Message, StepResponse, Variable};
use tactus_server::{
    OrchestratorError, RoundFailure, Server, ServerConfig, UnitStatus,
};
use tactus_transport::{ConnectOptions, NetworkChannel};

fn three_remote_units(strict: bool, max_round_failures: u32) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".to_owned(),
        timestep_us: 1000,
        rounds: None,
        round_deadline_ms: 5000,
        setup_timeout_ms: 10_000,
        max_round_failures,
        strict,
        pace_realtime: false,
        certificate: None,
        units: vec![remote_unit_entry(1), remote_unit_entry(2), remote_unit_entry(3)],
    }
}

/// Unit B dies mid-run; A and C keep the simulation going.
#[allow(clippy::unwrap_used)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_failure_keeps_the_rest_stepping() {
    let mut server = Server::bind(three_remote_units(false, 1)).unwrap();
    let addr = server.local_addr().unwrap().unwrap();

    let unit_a = spawn_unit(remote_client_config(1, addr.to_string()), CountingBackend::new());
    let unit_b =
        spawn_unit(remote_client_config(2, addr.to_string()), CountingBackend::failing_at(3));
    let unit_c = spawn_unit(remote_client_config(3, addr.to_string()), CountingBackend::new());

    server.attach().await.unwrap();

    let inputs: HashMap<u32, Vec<Variable>> = HashMap::new();

    for round in 1..=2u64 {
        let report = server.orchestrator_mut().run_round(&inputs).await.unwrap();
        assert!(report.advanced);
        assert_eq!(report.responses.len(), 3, "round {round}");
    }

    // Round 3: B's backend fails, its runner closes the channel. The round
    // still advances under a tolerance of one, and A/C outputs survive.
    let report = server.orchestrator_mut().run_round(&inputs).await.unwrap();
    assert!(report.advanced);
    assert_eq!(report.time_us, 3000);

    let mut responders: Vec<u32> = report.responses.iter().map(|(id, _)| *id).collect();
    responders.sort_unstable();
    assert_eq!(responders, vec![1, 3]);

    assert_eq!(report.failures.len(), 1);
    let (failed_unit, failure) = &report.failures[0];
    assert_eq!(*failed_unit, 2);
    assert!(matches!(failure, RoundFailure::Transport(_)), "{failure:?}");

    // B is excluded from subsequent fan-outs.
    assert_eq!(server.orchestrator_mut().registry().active_count(), 2);
    assert!(matches!(
        server.orchestrator_mut().registry().get(2).unwrap().status,
        UnitStatus::Inactive { .. }
    ));

    for round in 4..=5u64 {
        let report = server.orchestrator_mut().run_round(&inputs).await.unwrap();
        assert!(report.advanced);
        assert_eq!(report.responses.len(), 2, "round {round}");
        assert!(report.failures.is_empty());
    }
    assert_eq!(server.orchestrator_mut().time_us(), 5000);

    server.shutdown();

    assert!(unit_b.await.unwrap().is_err(), "faulted unit must report the fault");
    for unit in [unit_a, unit_c] {
        let summary = unit.await.unwrap().unwrap();
        assert_eq!(summary.steps, 5);
    }
}

/// Strict mode: a round beyond the tolerance halts and time stays put.
#[allow(clippy::unwrap_used)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn strict_mode_halts_without_advancing_time() {
    let mut server = Server::bind(ServerConfig {
        units: vec![remote_unit_entry(1), remote_unit_entry(2)],
        ..three_remote_units(true, 0)
    })
    .unwrap();
    let addr = server.local_addr().unwrap().unwrap();

    let _unit_a = spawn_unit(remote_client_config(1, addr.to_string()), CountingBackend::new());
    let _unit_b =
        spawn_unit(remote_client_config(2, addr.to_string()), CountingBackend::failing_at(2));

    server.attach().await.unwrap();

    let inputs: HashMap<u32, Vec<Variable>> = HashMap::new();

    let report = server.orchestrator_mut().run_round(&inputs).await.unwrap();
    assert!(report.advanced);

    let result = server.orchestrator_mut().run_round(&inputs).await;
    assert!(
        matches!(result, Err(OrchestratorError::ToleranceExceeded { failures: 1, .. })),
        "{result:?}"
    );
    assert_eq!(server.orchestrator_mut().time_us(), 1000, "time must not advance");

    server.shutdown();
}

/// A unit that misses one deadline stays attached: its stale response is
/// drained, and it rejoins the next round.
#[allow(clippy::unwrap_used)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_is_per_round_and_the_unit_rejoins() {
    let mut server = Server::bind(ServerConfig {
        round_deadline_ms: 300,
        max_round_failures: 1,
        units: vec![remote_unit_entry(1)],
        ..three_remote_units(false, 1)
    })
    .unwrap();
    let addr = server.local_addr().unwrap().unwrap();

    // Scripted unit: answers round 1, answers round 2 only after the
    // deadline, then answers round 3 promptly.
    let scripted = tokio::spawn(async move {
        let options =
            ConnectOptions { timeout: Some(Duration::from_secs(5)), ca_certificate: None };
        let mut channel = NetworkChannel::connect(addr, "localhost", &options).await?;
        channel.send(&Message::Attach(Attach { unit_id: 1 })).await?;
        let _ack = channel.next_message(Duration::from_secs(5)).await?;

        for round in 1..=3u32 {
            let _request = channel.next_message(Duration::from_secs(10)).await?;
            if round == 2 {
                tokio::time::sleep(Duration::from_millis(700)).await;
            }
            channel
                .send(&Message::StepResponse(StepResponse { outputs: vec![] }))
                .await?;
        }
        Ok::<_, tactus_transport::TransportError>(())
    });

    server.attach().await.unwrap();

    let inputs: HashMap<u32, Vec<Variable>> = HashMap::new();

    let report = server.orchestrator_mut().run_round(&inputs).await.unwrap();
    assert_eq!(report.responses.len(), 1);

    // Round 2 times out, but the unit is failed for this round only.
    let report = server.orchestrator_mut().run_round(&inputs).await.unwrap();
    assert_eq!(report.failures, vec![(1, RoundFailure::Timeout)]);
    assert!(report.advanced, "one timeout is within tolerance");
    assert_eq!(server.orchestrator_mut().registry().active_count(), 1);

    // Let the late round-2 response land in the queue before round 3.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let report = server.orchestrator_mut().run_round(&inputs).await.unwrap();
    assert_eq!(report.stale_drained, 1, "late round-2 response must be discarded");
    assert_eq!(report.responses.len(), 1, "unit rejoined with a fresh response");
    assert!(report.failures.is_empty());

    server.shutdown();
    scripted.await.unwrap().unwrap();
}
