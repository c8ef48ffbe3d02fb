//! Relay flows exercised over real WebSocket connections

use bytes::Bytes;
use overpass_proto::{
    encode_data_chunk, ControlMessage, Frame, Mode, Reassembler, Role, TargetNetwork, TunnelEvent,
};
use overpass_relay::RelayServer;
use overpass_transport_ws::{dial, TunnelRequest};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};

/// Bind a relay on an ephemeral port and serve it in the background
async fn spawn_relay() -> String {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    format!("ws://{addr}")
}

async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_direct_mode_splices_to_destination() {
    let relay = spawn_relay().await;
    let echo = spawn_echo().await;

    let request = TunnelRequest::direct(Role::Connector, Mode::Direct, &echo.to_string());
    let conn = dial(&relay, &request).await.unwrap();

    conn.sender
        .send(Bytes::from_static(b"through the relay"))
        .await
        .unwrap();
    let (_, mut receiver) = conn.split();
    let echoed = timeout(Duration::from_secs(5), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Bytes::from_static(b"through the relay"));
}

#[tokio::test]
async fn test_direct_mode_rejects_unreachable_destination() {
    let relay = spawn_relay().await;

    // an address nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let request = TunnelRequest::direct(Role::Connector, Mode::Direct, &addr.to_string());
    assert!(dial(&relay, &request).await.is_err());
}

#[tokio::test]
async fn test_direct_mux_runs_sessions() {
    let relay = spawn_relay().await;
    let echo = spawn_echo().await;

    let request = TunnelRequest::direct(Role::Connector, Mode::DirectMux, &echo.to_string());
    let conn = dial(&relay, &request).await.unwrap();
    let (sender, mut receiver) = conn.split();

    let frame = Frame::new_session(5, TargetNetwork::Tcp, &echo.to_string());
    sender.send(frame.encode().unwrap()).await.unwrap();
    sender.send(encode_data_chunk(5, b"mux ping")).await.unwrap();

    let mut reassembler = Reassembler::new();
    let mut events = Vec::new();
    while events.is_empty() {
        let message = timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        events.extend(reassembler.feed(&message).unwrap());
    }
    assert_eq!(
        events,
        vec![TunnelEvent::Data {
            session_id: 5,
            payload: Bytes::from_static(b"mux ping"),
        }]
    );
}

#[tokio::test]
async fn test_forward_rendezvous_through_named_agent() {
    let relay = spawn_relay().await;

    // a fake agent holds the manage channel
    let manage = dial(&relay, &TunnelRequest::manage("bob")).await.unwrap();
    let (_manage_tx, mut manage_rx) = manage.split();
    sleep(Duration::from_millis(100)).await;

    // connector arrives first and names the agent
    let request = TunnelRequest::forward(
        Role::Connector,
        Mode::Forward,
        "pair-1",
        Some("bob"),
        Some("10.1.2.3:22"),
    );
    let connector = dial(&relay, &request).await.unwrap();

    // the agent is told to originate
    let raw = timeout(Duration::from_secs(5), manage_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let message = ControlMessage::from_bytes(&raw).unwrap();
    assert_eq!(message.data.code, "pair-1");
    assert_eq!(message.data.addr, "10.1.2.3:22");
    assert!(!message.data.mux);

    // the agent dials back with the same code and the relay splices
    let dial_back = TunnelRequest::forward(Role::Agent, Mode::Forward, &message.data.code, None, None);
    let agent = dial(&relay, &dial_back).await.unwrap();

    connector
        .sender
        .send(Bytes::from_static(b"ping"))
        .await
        .unwrap();
    let (agent_tx, mut agent_rx) = agent.split();
    let got = timeout(Duration::from_secs(5), agent_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, Bytes::from_static(b"ping"));

    agent_tx.send(Bytes::from_static(b"pong")).await.unwrap();
    let (_, mut connector_rx) = connector.split();
    let got = timeout(Duration::from_secs(5), connector_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, Bytes::from_static(b"pong"));
}

#[tokio::test]
async fn test_forward_to_unknown_agent_is_refused() {
    let relay = spawn_relay().await;

    let request = TunnelRequest::forward(
        Role::Connector,
        Mode::Forward,
        "lonely",
        Some("ghost"),
        Some("10.1.2.3:22"),
    );
    assert!(dial(&relay, &request).await.is_err());
}

#[tokio::test]
async fn test_consumed_code_closes_late_arrival() {
    let relay = spawn_relay().await;

    // a pair forms without any agent involved
    let first = dial(
        &relay,
        &TunnelRequest::forward(Role::Connector, Mode::Forward, "reused", None, None),
    )
    .await
    .unwrap();
    let second = dial(
        &relay,
        &TunnelRequest::forward(Role::Agent, Mode::Forward, "reused", None, None),
    )
    .await
    .unwrap();

    first.sender.send(Bytes::from_static(b"live")).await.unwrap();
    let (_, mut second_rx) = second.split();
    assert_eq!(
        timeout(Duration::from_secs(5), second_rx.recv())
            .await
            .unwrap()
            .unwrap(),
        Bytes::from_static(b"live")
    );

    // a third arrival for the consumed code is closed, not attached
    let third = dial(
        &relay,
        &TunnelRequest::forward(Role::Agent, Mode::Forward, "reused", None, None),
    )
    .await
    .unwrap();
    let (_, mut third_rx) = third.split();
    assert!(timeout(Duration::from_secs(5), third_rx.recv())
        .await
        .unwrap()
        .is_none());

    // the live pair is unharmed
    first.sender.send(Bytes::from_static(b"still live")).await.unwrap();
    assert_eq!(
        timeout(Duration::from_secs(5), second_rx.recv())
            .await
            .unwrap()
            .unwrap(),
        Bytes::from_static(b"still live")
    );
}
