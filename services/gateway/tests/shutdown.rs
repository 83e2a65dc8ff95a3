
use std::time::Duration;

use harness::{assert_closed, roundtrip, TestGateway, KEY};
use reqwest::StatusCode;
use tokio::net::TcpStream;

#[tokio::test]
async fn shutdown_closes_streams_and_sessions() {
    let gw = TestGateway::spawn().await;
    let client = gw.client();

    assert_eq!(gw.authenticate(&client, KEY).await, StatusCode::OK);
    let mut stream = gw.open_keepalive(&client).await;
    assert!(stream.next_event().await.unwrap().starts_with(':'));

    let mut raw = TcpStream::connect(gw.raw_addr).await.unwrap();
    assert_eq!(roundtrip(&mut raw, b"before").await.unwrap(), b"before");

    let web_addr = gw.web_addr;
    let raw_addr = gw.raw_addr;
    let stopping = tokio::spawn(gw.gateway.shutdown(Duration::from_secs(3)));

    // Pings may still arrive before the close event.
    let mut saw_close = false;
    while let Some(event) = stream.next_event().await {
        if event.starts_with("event: close") {
            assert!(event.contains(r#"{"reason":"server shutdown"}"#));
            saw_close = true;
        }
    }
    assert!(saw_close, "stream ended without a close event");

    assert_closed(&mut raw).await;
    assert!(stopping.await.unwrap(), "shutdown exceeded its deadline");

    assert!(TcpStream::connect(raw_addr).await.is_err());
    assert!(TcpStream::connect(web_addr).await.is_err());
}

#[tokio::test]
async fn idle_gateway_stops_promptly() {
    let gw = TestGateway::spawn().await;
    let started = tokio::time::Instant::now();
    assert!(gw.gateway.shutdown(Duration::from_secs(2)).await);
    assert!(started.elapsed() < Duration::from_secs(1));
}
