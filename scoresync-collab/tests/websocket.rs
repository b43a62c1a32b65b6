//! WebSocket tests: real clients against a local sequencing server.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::{init_logger, Hub, SCRIPT_ID};
use futures_util::{SinkExt, StreamExt};
use scoresync_collab::protocol::ClientMessage;
use scoresync_collab::{
    ClientConfig, Operation, Phase, ScriptInfo, SessionEvent, Snapshot, SyncClient, SyncEvent,
    TextDocument,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

type Peers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

/// Start a hub on a free port, return its URL and the shared hub.
async fn start_test_server(text: &str) -> (String, Arc<Mutex<Hub>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hub = Arc::new(Mutex::new(Hub::new(text)));
    let peers: Peers = Arc::default();

    let shared = hub.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_peer(stream, shared.clone(), peers.clone()));
        }
    });
    (format!("ws://127.0.0.1:{port}"), hub)
}

async fn serve_peer(stream: TcpStream, hub: Arc<Mutex<Hub>>, peers: Peers) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut writer, mut reader) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if writer.send(Message::text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = reader.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let Ok(message) = ClientMessage::decode(text.as_str()) else {
            continue;
        };
        let outgoing: Vec<(mpsc::UnboundedSender<String>, String)> = {
            let mut peers = peers.lock().unwrap();
            peers.insert(message.header.sender.clone(), tx.clone());
            let replies = hub.lock().unwrap().handle(message);
            replies
                .into_iter()
                .filter_map(|(to, reply)| Some((peers.get(&to)?.clone(), reply.encode().ok()?)))
                .collect()
        };
        for (peer, text) in outgoing {
            let _ = peer.send(text);
        }
    }
}

async fn connect(url: &str, user: &str, text: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::connect(ClientConfig::new(url), user, TextDocument::new(text))
        .await
        .unwrap();
    let events = client.take_event_rx().unwrap();
    (client, events)
}

fn script(source: &str) -> ScriptInfo {
    ScriptInfo::new(SCRIPT_ID, "alice", vec!["bob".to_string()], source)
}

/// Wait for the first event matching `pred`, skipping the others.
async fn wait_for(events: &mut mpsc::Receiver<SyncEvent>, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received in time")
}

async fn joined(events: &mut mpsc::Receiver<SyncEvent>) {
    wait_for(events, |e| matches!(e, SyncEvent::Session(SessionEvent::Joined { .. }))).await;
}

/// Poll until the client has no unacknowledged edits and matches the hub.
async fn settle(client: &SyncClient, hub: &Arc<Mutex<Hub>>) -> Snapshot {
    timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = client.snapshot().await.unwrap();
            let expected = hub.lock().unwrap().text.clone();
            if snapshot.buffered_edits == 0 && snapshot.text == expected {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client did not settle")
}

#[tokio::test]
async fn test_client_connects_and_joins() {
    init_logger();
    let (url, _hub) = start_test_server("hello").await;
    let (client, mut events) = connect(&url, "alice", "hello").await;

    let first = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert_eq!(first, Some(SyncEvent::Connected));

    client.open_script(script("hello")).await.unwrap();
    joined(&mut events).await;

    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Active);
    assert_eq!(snapshot.state, Some(0));
    assert_eq!(snapshot.text, "hello");
}

#[tokio::test]
async fn test_edit_reaches_server() {
    init_logger();
    let (url, hub) = start_test_server("hello").await;
    let (client, mut events) = connect(&url, "alice", "hello").await;
    client.open_script(script("hello")).await.unwrap();
    joined(&mut events).await;

    client.edit(Operation::insert(5, " world")).await.unwrap();
    let snapshot = settle(&client, &hub).await;

    assert_eq!(snapshot.text, "hello world");
    assert_eq!(snapshot.state, Some(1));
    assert_eq!(hub.lock().unwrap().text, "hello world");
}

#[tokio::test]
async fn test_two_clients_converge() {
    init_logger();
    let (url, hub) = start_test_server("ABCDEFG").await;
    let (alice, mut alice_events) = connect(&url, "alice", "ABCDEFG").await;
    let (bob, mut bob_events) = connect(&url, "bob", "ABCDEFG").await;

    alice.open_script(script("ABCDEFG")).await.unwrap();
    joined(&mut alice_events).await;
    bob.open_script(script("ABCDEFG")).await.unwrap();
    joined(&mut bob_events).await;
    wait_for(&mut alice_events, |e| {
        matches!(e, SyncEvent::Session(SessionEvent::MemberJoined(name)) if name == "bob")
    })
    .await;

    let (a, b) = tokio::join!(
        alice.edit(Operation::remove(1, 4)),
        bob.edit(Operation::insert(3, "xy")),
    );
    a.unwrap();
    b.unwrap();
    alice.edit(Operation::insert(0, ">")).await.unwrap();

    let alice_view = settle(&alice, &hub).await;
    let bob_view = settle(&bob, &hub).await;
    assert_eq!(alice_view.text, bob_view.text);
    assert_eq!(alice_view.text, ">AxyFG");
    assert_eq!(alice_view.state, bob_view.state);
}

#[tokio::test]
async fn test_script_text_and_rejoin() {
    init_logger();
    let (url, hub) = start_test_server("draft").await;
    let (client, mut events) = connect(&url, "alice", "draft").await;
    client.open_script(script("draft")).await.unwrap();
    joined(&mut events).await;

    let text = timeout(Duration::from_secs(2), client.script_text(SCRIPT_ID))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text, "draft");

    hub.lock().unwrap().text = "final".to_string();
    let ack = timeout(Duration::from_secs(2), client.rejoin())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.script_text, "final");
    assert_eq!(client.snapshot().await.unwrap().text, "final");
}

#[tokio::test]
async fn test_shutdown_reports_disconnect() {
    init_logger();
    let (url, _hub) = start_test_server("").await;
    let (client, mut events) = connect(&url, "alice", "").await;

    client.shutdown().await;
    wait_for(&mut events, |e| *e == SyncEvent::Disconnected).await;
}
