//! Real WebSocket viewers against a served kernel.

mod common;

use common::{wait_for_hub, Kernel};
use futures::{SinkExt, StreamExt};
use raptor_devkit::BusFixtures;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr) -> Viewer {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    socket
}

async fn watch(viewer: &mut Viewer, server: &str) {
    viewer
        .send(Message::Text(BusFixtures::watch_frame(server).into()))
        .await
        .unwrap();
}

async fn next_text(viewer: &mut Viewer) -> Option<serde_json::Value> {
    match tokio::time::timeout(Duration::from_millis(500), viewer.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(serde_json::from_str(text.as_str()).unwrap()),
        _ => None,
    }
}

#[tokio::test]
async fn test_broadcast_reaches_both_watchers_and_no_one_else() {
    let kernel = Kernel::start(&[25565]);
    let addr = kernel.serve().await;

    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    let mut other = connect(addr).await;
    watch(&mut first, "abc-123").await;
    watch(&mut second, "abc-123").await;
    watch(&mut other, "def-456").await;
    assert!(wait_for_hub(kernel.hub(), |s| s.connections == 3 && s.rooms == 2).await);

    kernel
        .hub()
        .broadcast_to_server("abc-123", &serde_json::json!({"type": "server.status", "status": "online"}))
        .await
        .unwrap();

    for viewer in [&mut first, &mut second] {
        let frame = next_text(viewer).await.expect("watcher should receive");
        assert_eq!(frame["type"], "server.status");
        assert_eq!(frame["status"], "online");
    }
    assert!(next_text(&mut other).await.is_none());
}

#[tokio::test]
async fn test_non_affinity_frames_are_relayed_to_everyone() {
    let kernel = Kernel::start(&[25565]);
    let addr = kernel.serve().await;

    let mut speaker = connect(addr).await;
    let mut listener = connect(addr).await;
    assert!(wait_for_hub(kernel.hub(), |s| s.connections == 2).await);

    speaker
        .send(Message::Text(r#"{"chat":"hello"}"#.to_string().into()))
        .await
        .unwrap();

    assert_eq!(next_text(&mut listener).await.unwrap()["chat"], "hello");
    assert_eq!(next_text(&mut speaker).await.unwrap()["chat"], "hello");
}

#[tokio::test]
async fn test_closed_socket_is_unregistered() {
    let kernel = Kernel::start(&[25565]);
    let addr = kernel.serve().await;

    let mut viewer = connect(addr).await;
    watch(&mut viewer, "abc-123").await;
    assert!(wait_for_hub(kernel.hub(), |s| s.connections == 1 && s.rooms == 1).await);

    viewer.close(None).await.unwrap();
    assert!(wait_for_hub(kernel.hub(), |s| s.connections == 0 && s.rooms == 0).await);
}

#[tokio::test]
async fn test_kernel_shutdown_closes_viewers() {
    let kernel = Kernel::start(&[25565]);
    let addr = kernel.serve().await;

    let mut viewer = connect(addr).await;
    assert!(wait_for_hub(kernel.hub(), |s| s.connections == 1).await);

    kernel.shutdown.cancel();

    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match viewer.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}
