use std::io::Cursor;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use axum::body::Bytes;
use axum::http::header::{CONTENT_TYPE, EXPECT};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;

use hiperfetch::engine::TransferLimits;
use hiperfetch::{
    HttpEngine, LineChannel, Reactor, ReactorOptions, ReadySignal, RunSummary, TokioPoller,
    WatchKey,
};

/// Serve a few fixed endpoints on a background thread with its own runtime.
fn spawn_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let app = Router::new()
                .route(
                    "/slow",
                    get(|| async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        "slow"
                    }),
                )
                .route("/fast", get(|| async { "fast" }))
                .route(
                    "/echo",
                    post(|headers: HeaderMap, body: Bytes| async move {
                        let content_type = headers
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("none")
                            .to_string();
                        format!(
                            "{} expect={} {}",
                            content_type,
                            headers.contains_key(EXPECT),
                            String::from_utf8_lossy(&body)
                        )
                    }),
                );

            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });
    });

    addr
}

fn fetch_all(input: String, max_running: usize) -> (String, RunSummary) {
    let mut poller = TokioPoller::new().unwrap();
    let handle = poller.handle().clone();

    let engine = HttpEngine::new(handle.clone(), TransferLimits::default()).unwrap();
    poller.register(WatchKey::Socket(HttpEngine::EVENT_SOCKET), engine.signal());

    let signal = ReadySignal::new();
    poller.register(WatchKey::Input, signal.clone());
    let lines = LineChannel::spawn(&handle, Cursor::new(input.into_bytes()), signal, 16);

    let options = ReactorOptions {
        max_running,
        ..ReactorOptions::default()
    };
    let mut out = Vec::new();
    let summary = Reactor::new(engine, poller, lines, &mut out, options)
        .run()
        .unwrap();

    (String::from_utf8(out).unwrap(), summary)
}

fn mixed_input(addr: SocketAddr) -> String {
    format!(
        "http://{addr}/slow\nhttp://{addr}/fast\nliteral line\nhttp://{addr}/echo\t{{\"k\":1}}\n"
    )
}

const MIXED_OUTPUT: &str = "slow\nfast\nliteral line\napplication/json expect=false {\"k\":1}\n";

#[test]
fn test_responses_come_out_in_input_order() {
    let addr = spawn_server();

    let (output, summary) = fetch_all(mixed_input(addr), 50);

    assert_eq!(output, MIXED_OUTPUT);
    assert_eq!(summary.lines, 4);
    assert_eq!(summary.transfers, 3);
    assert_eq!(summary.failures, 0);
    assert_eq!(summary.records_emitted, 4);
}

#[test]
fn test_ceiling_of_one_gives_same_output() {
    let addr = spawn_server();

    let (output, summary) = fetch_all(mixed_input(addr), 1);

    assert_eq!(output, MIXED_OUTPUT);
    assert_eq!(summary.transfers, 3);
}

#[test]
fn test_refused_connection_still_emits_following_lines() {
    // Bind then drop to get a port nothing listens on.
    let closed = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let addr = spawn_server();

    let input = format!("http://{closed}/\nafter\nhttp://{addr}/fast\n");
    let (output, summary) = fetch_all(input, 50);

    assert_eq!(output, "after\nfast\n");
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.records_emitted, 3);
}
