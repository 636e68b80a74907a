//! Upstream relay behaviour against a mock WebSocket node.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use jsonrpc_proxy::middleware::MiddlewareChain;
use jsonrpc_proxy::net::ConnectionId;
use jsonrpc_proxy::plugins::{WsUpstreamMiddleware, WsUpstreamOptions};
use jsonrpc_proxy::pool::PoolError;
use jsonrpc_proxy::rpc::frame::CloseReason;
use jsonrpc_proxy::rpc::{codes, ConnectionSession, Frame, LinkState, RequestSession, RpcRequest};
use jsonrpc_proxy::ProxyError;

mod common;
use common::{eventually, start_mock_upstream, UpstreamMode};

fn relay(url: &str, timeout: Duration) -> (Arc<WsUpstreamMiddleware>, MiddlewareChain) {
    relay_with(WsUpstreamOptions {
        default_target: Some(url.to_string()),
        timeout,
        ..Default::default()
    })
}

fn relay_with(options: WsUpstreamOptions) -> (Arc<WsUpstreamMiddleware>, MiddlewareChain) {
    let upstream = Arc::new(WsUpstreamMiddleware::new(options));
    let mut chain = MiddlewareChain::new();
    chain.insert_head_arc(upstream.clone());
    (upstream, chain)
}

fn call(conn: &Arc<ConnectionSession>, id: u64) -> RequestSession {
    RequestSession::for_request(conn, Bytes::new(), RpcRequest::new(id, "eth_getBalance", json!([id])))
}

async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no frame relayed downstream")
        .expect("downstream queue closed")
}

async fn teardown(chain: &MiddlewareChain, conn: &Arc<ConnectionSession>) {
    chain.on_connection_closed(conn).await.unwrap();
    conn.close();
}

#[tokio::test]
async fn out_of_order_replies_reach_their_callers() {
    let upstream = start_mock_upstream(UpstreamMode::Reverse(3)).await;
    let (_relay, chain) = relay(&upstream.url(), Duration::from_secs(5));

    let conn = ConnectionSession::new(ConnectionId::new(), None, 16);
    chain.on_connection(&conn).await.unwrap();

    let (mut a, mut b, mut c) = (call(&conn, 1), call(&conn, 2), call(&conn, 3));
    for session in [&mut a, &mut b, &mut c] {
        chain.on_rpc_request(session).await.unwrap();
    }

    let (ra, rb, rc) = tokio::join!(chain.complete(&mut a), chain.complete(&mut b), chain.complete(&mut c));
    for (id, response) in [(1, ra), (2, rb), (3, rc)] {
        let response = response.unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.result.unwrap()["params"], json!([id]));
    }
    assert_eq!(conn.pending_count(), 0);

    teardown(&chain, &conn).await;
}

#[tokio::test]
async fn upstream_disconnect_releases_every_waiter() {
    let upstream = start_mock_upstream(UpstreamMode::DropAfter(2)).await;
    let (_relay, chain) = relay(&upstream.url(), Duration::from_secs(30));

    let conn = ConnectionSession::new(ConnectionId::new(), None, 16);
    chain.on_connection(&conn).await.unwrap();

    let (mut a, mut b) = (call(&conn, 1), call(&conn, 2));
    chain.on_rpc_request(&mut a).await.unwrap();
    chain.on_rpc_request(&mut b).await.unwrap();

    let (ra, rb) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(chain.complete(&mut a), chain.complete(&mut b)) },
    )
    .await
    .expect("waiters must unblock when the upstream closes");

    for response in [ra.unwrap(), rb.unwrap()] {
        assert_eq!(response.error.unwrap().code, codes::UPSTREAM_CONNECTION_CLOSED);
    }
    assert!(conn.upstream_done().is_fired());
    assert!(eventually(Duration::from_secs(2), || conn.link_state() == LinkState::Closed).await);

    teardown(&chain, &conn).await;
}

#[tokio::test]
async fn timeout_frees_the_slot_and_poisons_the_link() {
    let upstream = start_mock_upstream(UpstreamMode::Silent).await;
    let (relay, chain) = relay(&upstream.url(), Duration::from_millis(100));

    let conn = ConnectionSession::new(ConnectionId::new(), None, 16);
    chain.on_connection(&conn).await.unwrap();

    let mut session = call(&conn, 9);
    chain.on_rpc_request(&mut session).await.unwrap();
    let response = chain.complete(&mut session).await.unwrap();

    assert_eq!(response.id, 9);
    assert_eq!(response.error.unwrap().code, codes::UPSTREAM_TIMEOUT);
    assert_eq!(conn.pending_count(), 0);
    assert_eq!(conn.abandoned_count(), 1);

    teardown(&chain, &conn).await;
    assert!(eventually(Duration::from_secs(2), || conn.link_state() == LinkState::Closed).await);
    assert_eq!(relay.idle_links(&upstream.url()), 0);
}

#[tokio::test]
async fn clean_link_is_reused_by_the_next_connection() {
    let upstream = start_mock_upstream(UpstreamMode::Echo).await;
    let (relay, chain) = relay(&upstream.url(), Duration::from_secs(5));

    let first = ConnectionSession::new(ConnectionId::new(), None, 16);
    chain.on_connection(&first).await.unwrap();
    let mut session = call(&first, 1);
    chain.on_rpc_request(&mut session).await.unwrap();
    assert!(chain.complete(&mut session).await.unwrap().result.is_some());

    teardown(&chain, &first).await;
    // A second teardown is a no-op.
    teardown(&chain, &first).await;
    assert!(eventually(Duration::from_secs(2), || relay.idle_links(&upstream.url()) == 1).await);

    let second = ConnectionSession::new(ConnectionId::new(), None, 16);
    chain.on_connection(&second).await.unwrap();
    let mut session = call(&second, 2);
    chain.on_rpc_request(&mut session).await.unwrap();
    let response = chain.complete(&mut session).await.unwrap();

    assert_eq!(response.id, 2);
    assert_eq!(upstream.connection_count(), 1);

    teardown(&chain, &second).await;
}

#[tokio::test]
async fn idle_link_closed_by_upstream_is_not_reused() {
    let upstream = start_mock_upstream(UpstreamMode::IdleClose(Duration::from_millis(100))).await;
    let (relay, chain) = relay(&upstream.url(), Duration::from_secs(5));

    let first = ConnectionSession::new(ConnectionId::new(), None, 16);
    chain.on_connection(&first).await.unwrap();
    let mut session = call(&first, 1);
    chain.on_rpc_request(&mut session).await.unwrap();
    assert!(chain.complete(&mut session).await.unwrap().result.is_some());
    teardown(&chain, &first).await;
    assert!(eventually(Duration::from_secs(2), || relay.idle_links(&upstream.url()) == 1).await);

    // Long enough for the upstream to close the parked link.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let second = ConnectionSession::new(ConnectionId::new(), None, 16);
    let mut downstream = second.take_downstream_receiver().unwrap();
    chain.on_connection(&second).await.unwrap();
    let mut session = call(&second, 2);
    chain.on_rpc_request(&mut session).await.unwrap();
    let response = chain.complete(&mut session).await.unwrap();

    assert_eq!(response.id, 2);
    assert!(response.result.is_some(), "got {:?}", response.error);
    assert_eq!(upstream.connection_count(), 2);
    assert!(downstream.try_recv().is_err(), "stale close must not reach the new client");

    teardown(&chain, &second).await;
}

#[tokio::test]
async fn link_lost_before_first_write_is_redialed() {
    let upstream = start_mock_upstream(UpstreamMode::IdleClose(Duration::from_millis(300))).await;
    let (_relay, chain) = relay(&upstream.url(), Duration::from_secs(5));

    let conn = ConnectionSession::new(ConnectionId::new(), None, 16);
    let mut downstream = conn.take_downstream_receiver().unwrap();
    chain.on_connection(&conn).await.unwrap();

    // The first link goes quiet and is closed; a second one replaces it.
    assert!(eventually(Duration::from_secs(3), || upstream.connection_count() == 2).await);

    let mut session = call(&conn, 5);
    chain.on_rpc_request(&mut session).await.unwrap();
    let response = chain.complete(&mut session).await.unwrap();

    assert_eq!(response.id, 5);
    assert!(response.result.is_some(), "got {:?}", response.error);
    assert!(!conn.upstream_done().is_fired());
    assert!(downstream.try_recv().is_err());

    teardown(&chain, &conn).await;
}

#[tokio::test]
async fn pool_exhaustion_is_reported_to_the_caller() {
    let upstream = start_mock_upstream(UpstreamMode::Echo).await;
    let (_relay, chain) = relay_with(WsUpstreamOptions {
        default_target: Some(upstream.url()),
        timeout: Duration::from_secs(5),
        max_links_per_target: 1,
        acquire_timeout: Duration::from_millis(100),
        ..Default::default()
    });

    let holder = ConnectionSession::new(ConnectionId::new(), None, 16);
    chain.on_connection(&holder).await.unwrap();
    let mut session = call(&holder, 1);
    chain.on_rpc_request(&mut session).await.unwrap();
    assert!(chain.complete(&mut session).await.unwrap().result.is_some());

    let starved = ConnectionSession::new(ConnectionId::new(), None, 16);
    chain.on_connection(&starved).await.unwrap();
    let mut session = call(&starved, 2);
    chain.on_rpc_request(&mut session).await.unwrap();
    let response = chain.complete(&mut session).await.unwrap();

    assert_eq!(response.id, 2);
    assert_eq!(response.error.unwrap().code, codes::UPSTREAM_BUSY);
    assert!(matches!(
        starved.upstream_failure(),
        ProxyError::Pool(PoolError::AcquireTimeout(_))
    ));
    assert_eq!(upstream.connection_count(), 1);

    teardown(&chain, &starved).await;
    teardown(&chain, &holder).await;
}

#[tokio::test]
async fn passthrough_frames_cross_the_relay() {
    let upstream = start_mock_upstream(UpstreamMode::Mirror).await;
    let (_relay, chain) = relay(&upstream.url(), Duration::from_secs(5));

    let conn = ConnectionSession::new(ConnectionId::new(), None, 16);
    let mut downstream = conn.take_downstream_receiver().unwrap();
    chain.on_connection(&conn).await.unwrap();
    let mut carrier = RequestSession::new(&conn);

    let payload = Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]);
    chain
        .on_websocket_frame(&mut carrier, &Frame::Binary(payload.clone()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut downstream).await, Frame::Binary(payload));

    chain
        .on_websocket_frame(&mut carrier, &Frame::Ping(Bytes::from_static(b"hb")))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut downstream).await, Frame::Pong(Bytes::from_static(b"hb")));

    let mut session =
        RequestSession::for_request(&conn, Bytes::new(), RpcRequest::new(3, "close_link", json!([])));
    chain.on_rpc_request(&mut session).await.unwrap();
    let response = chain.complete(&mut session).await.unwrap();

    assert_eq!(response.error.unwrap().code, codes::UPSTREAM_CONNECTION_CLOSED);
    assert_eq!(
        next_frame(&mut downstream).await,
        Frame::Close(Some(CloseReason {
            code: 4000,
            reason: "bye".into(),
        }))
    );

    teardown(&chain, &conn).await;
}

#[tokio::test]
async fn discarded_link_carries_the_client_close_code() {
    let upstream = start_mock_upstream(UpstreamMode::Silent).await;
    let (relay, chain) = relay(&upstream.url(), Duration::from_millis(100));

    let conn = ConnectionSession::new(ConnectionId::new(), None, 16);
    chain.on_connection(&conn).await.unwrap();
    let mut session = call(&conn, 1);
    chain.on_rpc_request(&mut session).await.unwrap();
    let response = chain.complete(&mut session).await.unwrap();
    assert_eq!(response.error.unwrap().code, codes::UPSTREAM_TIMEOUT);

    let mut carrier = RequestSession::new(&conn);
    let close = Frame::Close(Some(CloseReason {
        code: 4001,
        reason: "client leaving".into(),
    }));
    chain.on_websocket_frame(&mut carrier, &close).await.unwrap();
    teardown(&chain, &conn).await;

    assert!(eventually(Duration::from_secs(2), || upstream.close_codes() == vec![Some(4001)]).await);
    assert_eq!(relay.idle_links(&upstream.url()), 0);
}
