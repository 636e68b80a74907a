//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

use jsonrpc_proxy::config::schema::UpstreamKind;
use jsonrpc_proxy::config::{ProxyConfig, TargetConfig};
use jsonrpc_proxy::lifecycle::Shutdown;
use jsonrpc_proxy::plugins::build_chain;
use jsonrpc_proxy::ProxyServer;

pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How the mock upstream answers.
#[derive(Debug, Clone, Copy)]
pub enum UpstreamMode {
    /// Answer every request immediately.
    Echo,
    /// Hold `n` requests, then answer them newest first.
    Reverse(usize),
    /// Never answer.
    Silent,
    /// Close the socket after receiving `n` requests, answering none.
    DropAfter(usize),
    /// Answer like `Echo`, but close any link that stays quiet this long.
    IdleClose(Duration),
    /// Answer like `Echo` and send binary frames back. A `close_link` call
    /// makes the upstream close with code 4000.
    Mirror,
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    /// Accepted WebSocket connections.
    pub connections: Arc<AtomicUsize>,
    /// Close codes received from the proxy, in arrival order.
    pub closes: Arc<Mutex<Vec<Option<u16>>>>,
}

impl MockUpstream {
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn close_codes(&self) -> Vec<Option<u16>> {
        self.closes.lock().unwrap().clone()
    }
}

/// Start a mock JSON-RPC WebSocket upstream on an ephemeral port.
///
/// Replies carry `{"method", "params", "seq"}` where `seq` counts replies
/// across all connections.
pub async fn start_mock_upstream(mode: UpstreamMode) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let seq = Arc::new(AtomicU64::new(0));
    let closes = Arc::new(Mutex::new(Vec::new()));

    let counter = connections.clone();
    let close_log = closes.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_upstream(socket, mode, seq.clone(), close_log.clone()));
        }
    });

    MockUpstream {
        addr,
        connections,
        closes,
    }
}

async fn serve_upstream(
    socket: TcpStream,
    mode: UpstreamMode,
    seq: Arc<AtomicU64>,
    closes: Arc<Mutex<Vec<Option<u16>>>>,
) {
    let Ok(mut ws) = accept_async(socket).await else {
        return;
    };
    let mut held: Vec<Value> = Vec::new();
    let mut seen = 0;

    loop {
        let next = match mode {
            UpstreamMode::IdleClose(idle) => match tokio::time::timeout(idle, ws.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let _ = ws.close(None).await;
                    return;
                }
            },
            _ => ws.next().await,
        };
        let Some(Ok(msg)) = next else {
            return;
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(data) if matches!(mode, UpstreamMode::Mirror) => {
                if ws.send(Message::Binary(data)).await.is_err() {
                    return;
                }
                continue;
            }
            Message::Close(frame) => {
                closes.lock().unwrap().push(frame.map(|f| u16::from(f.code)));
                continue;
            }
            _ => continue,
        };
        let request: Value = match serde_json::from_str(text.as_str()) {
            Ok(v) => v,
            Err(_) => continue,
        };
        seen += 1;
        let reply = json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {
                "method": request["method"],
                "params": request["params"],
                "seq": seq.fetch_add(1, Ordering::SeqCst),
            },
        });

        match mode {
            UpstreamMode::Mirror if request["method"] == "close_link" => {
                let frame = CloseFrame {
                    code: CloseCode::from(4000),
                    reason: "bye".into(),
                };
                let _ = ws.close(Some(frame)).await;
                return;
            }
            UpstreamMode::Echo | UpstreamMode::IdleClose(_) | UpstreamMode::Mirror => {
                if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                    return;
                }
            }
            UpstreamMode::Reverse(n) => {
                held.push(reply);
                if held.len() >= n {
                    for reply in held.drain(..).rev() {
                        if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
            UpstreamMode::Silent => {}
            UpstreamMode::DropAfter(n) => {
                if seen >= n {
                    return;
                }
            }
        }
    }
}

/// Start a mock JSON-RPC HTTP upstream answering every POST like `Echo`.
pub async fn start_http_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = axum::Router::new().route(
        "/",
        axum::routing::post(|axum::Json(request): axum::Json<Value>| async move {
            axum::Json(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"method": request["method"], "params": request["params"]},
            }))
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Minimal valid config pointing at one HTTP upstream.
pub fn http_config(upstream_url: &str) -> ProxyConfig {
    let mut config = ws_config(upstream_url);
    config.upstream.kind = UpstreamKind::Http;
    config
}

/// Minimal valid config pointing at one WebSocket upstream.
pub fn ws_config(upstream_url: &str) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.timeout_secs = 5;
    config.upstream.targets.push(TargetConfig {
        url: upstream_url.to_string(),
        weight: 1,
        ignore: false,
    });
    config
}

/// Build the chain from `config` and serve it on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Shutdown) {
    let chain = Arc::new(build_chain(&config).unwrap());
    chain.on_start().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server = ProxyServer::new(&config, chain, shutdown.clone());
    tokio::spawn(async move {
        let _ = server.run(listener).await;
    });
    (addr, shutdown)
}

pub async fn ws_connect(addr: SocketAddr) -> ClientStream {
    let (ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
    ws
}

pub async fn ws_send(ws: &mut ClientStream, payload: impl ToString) {
    ws.send(Message::Text(payload.to_string().into())).await.unwrap();
}

/// Next text frame as JSON.
pub async fn ws_recv(ws: &mut ClientStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("reply timed out");
        match msg {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("connection ended: {other:?}"),
        }
    }
}

pub async fn ws_call(ws: &mut ClientStream, request: Value) -> Value {
    ws_send(ws, request).await;
    ws_recv(ws).await
}

pub fn rpc(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

/// Poll `check` until it holds or `deadline` passes.
pub async fn eventually(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
