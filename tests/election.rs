use chatring::interceptor::Interceptor;
use chatring::protocol::MsgContent;
use chatring::scenario::Scenario;
use chatring::server::{Server, State};
use chatring::types::ProcessId;

fn init_logging() {
    let _ = env_logger::builder()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .is_test(true)
        .try_init();
}

/// A single initiator in a cyclic three-server topology is elected, whatever
/// the identities of the servers relaying its candidacy.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn election_with_a_single_initiator() {
    init_logging();
    let mut scenario = Scenario::new();
    scenario.start_server("1").await.unwrap();
    scenario.sleep_ms(200).await;
    scenario.start_server("2 localhost 1").await.unwrap();
    scenario.sleep_ms(200).await;
    scenario.start_server("5 localhost 1 localhost 2").await.unwrap();
    scenario.sleep_ms(200).await;

    scenario.server_console(0, "election").await.unwrap();
    scenario.sleep_ms(1500).await;

    assert_eq!(State::Leader, scenario.server(0).state().await);
    assert_eq!(State::Nonleader, scenario.server(1).state().await);
    assert_eq!(State::Nonleader, scenario.server(2).state().await);
    // the elected server fabricates the mutual-exclusion token
    assert!(scenario.server(0).has_token().await);
    assert!(scenario.server(0).critical().await);

    scenario.shutdown().await;
}

/// Two concurrent initiators: the larger identity swallows the weaker
/// candidacy and wins. A server-side interceptor delays the weaker token at
/// the eventual winner until it is elected, forcing the race to resolve the
/// same way on every run.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn election_with_two_initiators_and_a_delayed_token() {
    init_logging();
    let mut scenario = Scenario::new();
    scenario.start_server("31").await.unwrap();
    scenario.sleep_ms(200).await;
    scenario.start_server("32 localhost 31").await.unwrap();
    scenario.sleep_ms(200).await;
    scenario.start_server("35 localhost 31 localhost 32").await.unwrap();
    scenario.sleep_ms(200).await;

    let delay_weak_token = Interceptor::new(
        "delay-weak-candidacy",
        |_: &Server, msg: &MsgContent| {
            matches!(msg, MsgContent::ElectionToken(token) if token.candidate == ProcessId(31))
        },
        |server: &Server, _: &MsgContent| server.state() == State::Leader,
        |server: &mut Server, msg: MsgContent| server.execute(msg),
    )
    .unwrap();
    scenario.server(2).register_interceptor(delay_weak_token).await;
    scenario.server(2).set_interception_enabled(true).await;

    scenario.server_console(0, "election").await.unwrap();
    scenario.sleep_ms(1000).await;
    // the weaker candidacy is parked at server 35, which therefore has not
    // even relayed it
    assert_eq!(State::Sleeping, scenario.server(2).state().await);

    scenario.server_console(2, "election").await.unwrap();
    scenario.sleep_ms(1500).await;

    assert_eq!(State::Nonleader, scenario.server(0).state().await);
    assert_eq!(State::Nonleader, scenario.server(1).state().await);
    assert_eq!(State::Leader, scenario.server(2).state().await);

    scenario.shutdown().await;
}

/// Restarting an election after a completed round reopens the machine.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reelection_after_a_completed_round() {
    init_logging();
    let mut scenario = Scenario::new();
    scenario.start_server("51").await.unwrap();
    scenario.sleep_ms(200).await;
    scenario.start_server("52 localhost 51").await.unwrap();
    scenario.sleep_ms(200).await;
    scenario.start_server("53 localhost 51 localhost 52").await.unwrap();
    scenario.sleep_ms(200).await;

    scenario.server_console(0, "election").await.unwrap();
    scenario.sleep_ms(1500).await;
    assert_eq!(State::Leader, scenario.server(0).state().await);

    scenario.server_console(1, "election").await.unwrap();
    scenario.sleep_ms(1500).await;
    assert_eq!(State::Leader, scenario.server(1).state().await);
    assert_eq!(State::Nonleader, scenario.server(0).state().await);
    assert_eq!(State::Nonleader, scenario.server(2).state().await);
    // the fresh token lives at the new leader, the stale one is buried
    assert!(scenario.server(1).critical().await);
    assert!(!scenario.server(0).critical().await);
    assert!(!scenario.server(0).has_token().await);

    scenario.shutdown().await;
}
