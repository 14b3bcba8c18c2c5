mod common;

use steelnet::{
    ClientGameLoop, ClientState, LoopbackNetwork, NetworkConfig, ReconciliationConfig,
    ServerState,
};

use common::{OrbitClient, OrbitServer, Session};

#[test]
fn test_connect_times_out_without_host() {
    let network = LoopbackNetwork::new(1);
    // Reserve the host slot but never join with it.
    let _host = network.endpoint();
    let mut client = ClientGameLoop::new(
        OrbitClient::default(),
        Box::new(network.endpoint()),
        NetworkConfig::default(),
        ReconciliationConfig::default(),
    )
    .unwrap();

    client.start(0);
    let mut now = 0;
    while now < 9_900 {
        now += 100;
        client.update(now);
    }
    assert_eq!(client.state(), Some(ClientState::Connecting));

    now += 200;
    client.update(now);
    assert_eq!(client.state(), Some(ClientState::Leaving));
}

#[test]
fn test_server_shutdown_sends_client_leaving() {
    let network = LoopbackNetwork::new(2);
    let mut session = Session::new(&network, OrbitServer::new(2));
    session.run_for(1_500);
    assert_eq!(session.client.state(), Some(ClientState::Playing));

    session.server.shutdown();
    session.client.update(session.now_ms + 16);
    assert_eq!(session.client.state(), Some(ClientState::Leaving));
}

#[test]
fn test_client_leaving_is_reported_to_server() {
    let network = LoopbackNetwork::new(4);
    let mut session = Session::new(&network, OrbitServer::new(2));
    session.run_for(1_500);
    assert_eq!(session.server.state(), Some(ServerState::Active));

    session.client.shutdown();
    session.run_for(100);
    assert_eq!(session.server.network().connection_count(), 0);
    assert_eq!(session.server.game().disconnected.len(), 1);
}
