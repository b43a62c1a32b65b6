//! WebSocket client driving a [`CollabEngine`].
//!
//! Provides:
//! - Connection setup over `tokio-tungstenite`, JSON text frames
//! - One session task that owns the engine and serialises server frames,
//!   application commands and timer expiries through a single `select!`
//! - An event channel for the application
//!
//! ```text
//!  SyncClient ──Command──► session task ──frames──► server
//!      ▲                     │    ▲
//!      └───── SyncEvent ─────┘    └── frames, timers
//! ```

use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::ClientConfig;
use crate::document::DocumentSink;
use crate::engine::{CollabEngine, JoinAck, SessionEvent};
use crate::error::{Result, SyncError};
use crate::operation::Operation;
use crate::session::{Phase, ScriptInfo};

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost or shut down
    Disconnected,
    Session(SessionEvent),
}

/// Point-in-time view of the engine, for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub phase: Phase,
    pub state: Option<u64>,
    pub text: String,
    pub buffered_edits: usize,
}

enum Command {
    Open(ScriptInfo),
    Close(String),
    Leave,
    Edit(Operation),
    Cursor(usize),
    Select(usize, usize),
    AddCollaborators(String, Vec<String>),
    RemoveCollaborators(String, Vec<String>),
    LeaveCollaboration(String),
    Rename(String),
    Save,
    Tutoring(bool),
    Chat(Value, String),
    Compile(String),
    CheckStatus,
    Rejoin(oneshot::Sender<Result<oneshot::Receiver<JoinAck>>>),
    ScriptText(String, oneshot::Sender<oneshot::Receiver<String>>),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

/// The sync client.
///
/// Owns the command side of a session task connected to the collaboration
/// server. Every method only enqueues a command; results arrive as
/// [`SyncEvent`]s.
pub struct SyncClient {
    user_name: String,
    server_url: String,
    commands: mpsc::Sender<Command>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    task: JoinHandle<()>,
}

impl SyncClient {
    /// Connect to the server and spawn the session task.
    pub async fn connect<D>(config: ClientConfig, user_name: &str, doc: D) -> Result<Self>
    where
        D: DocumentSink + Send + 'static,
    {
        let (ws_stream, _) = tokio_tungstenite::connect_async(config.server_url.as_str())
            .await
            .map_err(|e| {
                log::error!("cannot reach {}: {e}", config.server_url);
                SyncError::ConnectionClosed
            })?;
        log::info!("connected to collaboration server {}", config.server_url);

        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let _ = event_tx.send(SyncEvent::Connected).await;

        let engine = CollabEngine::new(config.session.clone(), user_name, doc);
        let task = tokio::spawn(run_session(ws_stream, engine, command_rx, event_tx));

        Ok(Self {
            user_name: user_name.to_lowercase(),
            server_url: config.server_url,
            commands: command_tx,
            event_rx: Some(event_rx),
            task,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::ConnectionClosed)
    }

    pub async fn open_script(&self, script: ScriptInfo) -> Result<()> {
        self.command(Command::Open(script)).await
    }

    pub async fn close_script(&self, share_id: &str) -> Result<()> {
        self.command(Command::Close(share_id.to_string())).await
    }

    pub async fn leave_session(&self) -> Result<()> {
        self.command(Command::Leave).await
    }

    /// Apply an edit to the document and synchronize it.
    pub async fn edit(&self, op: Operation) -> Result<()> {
        self.command(Command::Edit(op)).await
    }

    pub async fn update_cursor(&self, position: usize) -> Result<()> {
        self.command(Command::Cursor(position)).await
    }

    pub async fn update_selection(&self, start: usize, end: usize) -> Result<()> {
        self.command(Command::Select(start, end)).await
    }

    pub async fn add_collaborators(&self, share_id: &str, collaborators: Vec<String>) -> Result<()> {
        self.command(Command::AddCollaborators(share_id.to_string(), collaborators))
            .await
    }

    pub async fn remove_collaborators(&self, share_id: &str, collaborators: Vec<String>) -> Result<()> {
        self.command(Command::RemoveCollaborators(share_id.to_string(), collaborators))
            .await
    }

    pub async fn leave_collaboration(&self, share_id: &str) -> Result<()> {
        self.command(Command::LeaveCollaboration(share_id.to_string()))
            .await
    }

    pub async fn rename_script(&self, name: &str) -> Result<()> {
        self.command(Command::Rename(name.to_string())).await
    }

    pub async fn save_script(&self) -> Result<()> {
        self.command(Command::Save).await
    }

    pub async fn set_tutoring(&self, tutoring: bool) -> Result<()> {
        self.command(Command::Tutoring(tutoring)).await
    }

    pub async fn send_chat(&self, message: Value, message_type: &str) -> Result<()> {
        self.command(Command::Chat(message, message_type.to_string()))
            .await
    }

    pub async fn send_compilation_record(&self, text: &str) -> Result<()> {
        self.command(Command::Compile(text.to_string())).await
    }

    pub async fn check_session_status(&self) -> Result<()> {
        self.command(Command::CheckStatus).await
    }

    /// Rejoin the session and wait for the server's reply.
    pub async fn rejoin(&self) -> Result<JoinAck> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Rejoin(tx)).await?;
        let waiter = rx.await.map_err(|_| SyncError::ConnectionClosed)??;
        waiter.await.map_err(|_| SyncError::ConnectionClosed)
    }

    /// Fetch the current text of a shared script from the server.
    pub async fn script_text(&self, share_id: &str) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::ScriptText(share_id.to_string(), tx))
            .await?;
        let waiter = rx.await.map_err(|_| SyncError::ConnectionClosed)?;
        waiter.await.map_err(|_| SyncError::ConnectionClosed)
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| SyncError::ConnectionClosed)
    }

    /// Close the connection and wait for the session task to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let _ = self.task.await;
    }
}

/// The session task: one loop, so engine handlers never overlap.
async fn run_session<S, D>(
    ws_stream: WebSocketStream<S>,
    mut engine: CollabEngine<D>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SyncEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    D: DocumentSink,
{
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    loop {
        // Flush whatever the last step produced
        let mut connected = true;
        while let Some(message) = engine.poll_transmit() {
            match message.encode() {
                Ok(text) => {
                    if ws_writer.send(Message::text(text)).await.is_err() {
                        connected = false;
                        break;
                    }
                }
                Err(e) => log::error!("dropping outgoing frame: {e}"),
            }
        }
        if !connected {
            engine.transport_lost();
        }
        while let Some(event) = engine.poll_event() {
            if events.send(SyncEvent::Session(event)).await.is_err() {
                log::debug!("event receiver dropped, stopping session task");
                let _ = ws_writer.close().await;
                return;
            }
        }
        if !connected {
            break;
        }

        let deadline = engine.next_deadline();
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            frame = ws_reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = engine.handle_frame(text.as_str()) {
                        log::warn!("dropping malformed frame: {e}");
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("collaboration server closed the connection");
                    engine.transport_lost();
                    break;
                }
                Some(Err(e)) => {
                    log::error!("websocket error: {e}");
                    engine.transport_lost();
                    break;
                }
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => {
                    let _ = ws_writer.close().await;
                    break;
                }
                Some(command) => apply_command(&mut engine, command),
            },
            _ = timer => engine.handle_timeout(Instant::now()),
        }
    }

    while let Some(event) = engine.poll_event() {
        let _ = events.send(SyncEvent::Session(event)).await;
    }
    let _ = events.send(SyncEvent::Disconnected).await;
}

fn apply_command<D: DocumentSink>(engine: &mut CollabEngine<D>, command: Command) {
    let result = match command {
        Command::Open(script) => {
            engine.open_script(script);
            Ok(())
        }
        Command::Close(share_id) => engine.close_script(&share_id),
        Command::Leave => engine.leave_session(),
        Command::Edit(op) => engine.edit(op),
        Command::Cursor(position) => {
            engine.update_cursor(position);
            Ok(())
        }
        Command::Select(start, end) => {
            engine.update_selection(start, end);
            Ok(())
        }
        Command::AddCollaborators(share_id, names) => {
            engine.add_collaborators(&share_id, &names);
            Ok(())
        }
        Command::RemoveCollaborators(share_id, names) => {
            engine.remove_collaborators(&share_id, &names);
            Ok(())
        }
        Command::LeaveCollaboration(share_id) => {
            engine.leave_collaboration(&share_id);
            Ok(())
        }
        Command::Rename(name) => engine.rename_script(&name),
        Command::Save => engine.save_script(),
        Command::Tutoring(true) => engine.join_tutoring(),
        Command::Tutoring(false) => engine.leave_tutoring(),
        Command::Chat(message, message_type) => engine.send_chat(message, &message_type),
        Command::Compile(text) => engine.send_compilation_record(&text),
        Command::CheckStatus => engine.check_session_status(),
        Command::Rejoin(reply) => {
            let _ = reply.send(engine.rejoin_session());
            Ok(())
        }
        Command::ScriptText(share_id, reply) => {
            let _ = reply.send(engine.request_script_text(&share_id));
            Ok(())
        }
        Command::Snapshot(reply) => {
            let _ = reply.send(Snapshot {
                phase: engine.phase(),
                state: engine.state(),
                text: engine.doc().text(),
                buffered_edits: engine.buffered_edits(),
            });
            Ok(())
        }
        Command::Shutdown => Ok(()),
    };
    if let Err(e) = result {
        log::warn!("command failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TextDocument;

    #[tokio::test]
    async fn test_connect_refused() {
        // port 1 is never listening
        let config = ClientConfig::new("ws://127.0.0.1:1");
        let result = SyncClient::connect(config, "alice", TextDocument::default()).await;
        assert!(matches!(result, Err(SyncError::ConnectionClosed)));
    }

    #[test]
    fn test_apply_command_snapshot() {
        let mut engine = CollabEngine::new(
            crate::config::SessionConfig::default(),
            "alice",
            TextDocument::new("abc"),
        );
        let (tx, mut rx) = oneshot::channel();
        apply_command(&mut engine, Command::Snapshot(tx));
        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.phase, Phase::Idle);
        assert_eq!(snapshot.text, "abc");
        assert_eq!(snapshot.state, None);
    }

    #[test]
    fn test_apply_command_open_queues_join() {
        let mut engine = CollabEngine::new(
            crate::config::SessionConfig::default(),
            "alice",
            TextDocument::default(),
        );
        apply_command(
            &mut engine,
            Command::Open(ScriptInfo::new("s", "alice", vec![], "")),
        );
        assert_eq!(engine.phase(), Phase::Joining);
        assert!(engine.poll_transmit().is_some());
    }
}
