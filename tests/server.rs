mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use wifi_portal::server::{self, AppState};
use wifi_portal::AccessPointKind;

async fn serve(state: AppState) -> std::net::SocketAddr {
    let config = state.lock().await.config().clone();
    let app = server::router(Arc::clone(&state), &config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn dropped_client_does_not_abandon_suspended_access_point() {
    let mut h = Harness::with_config(|c| c.wifi.settle_delay_ms = 300);
    h.connectivity
        .set_access_point(AccessPointKind::Direct, true)
        .await
        .unwrap();
    let Harness {
        nm,
        dhcp,
        connectivity,
        dir: _dir,
    } = h;
    nm.clear_log();
    let state: AppState = Arc::new(Mutex::new(connectivity));
    let addr = serve(Arc::clone(&state)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /list-networks?force_scan=true HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    // Hang up while the access point is down and the scan is settling.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(nm.log().iter().any(|l| l == "nmcli connection down directInterface"));
    drop(stream);

    // The transition holds the lock until the access point is back.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _guard = state.lock().await;

    assert_eq!(nm.active().as_deref(), Some("directInterface"));
    assert_eq!(dhcp.running(), Some(AccessPointKind::Direct));
}

#[tokio::test]
async fn error_responses_carry_success_flag() {
    let h = Harness::new();
    let Harness {
        connectivity,
        dir: _dir,
        ..
    } = h;
    let state: AppState = Arc::new(Mutex::new(connectivity));
    let addr = serve(state).await;

    let body = br#"{"ssid":"Office"}"#;
    let request = format!(
        "POST /forget HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
    assert!(response.contains(r#""success":false"#));
}
