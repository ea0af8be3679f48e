//! Fake panel on the far end of an in-memory duplex link

#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use panelink_core::protocol::{Connection, ConnectionConfig};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Generous bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted panel: answers the handshake with `version` (if any), answers
/// requests listed in `replies`, and forwards everything else to the test.
pub struct FakePanel {
    received: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl FakePanel {
    pub fn spawn(stream: DuplexStream, version: Option<u32>, replies: &[(&str, Value)]) -> Self {
        let replies: HashMap<String, Value> = replies
            .iter()
            .map(|(event, reply)| (event.to_string(), reply.clone()))
            .collect();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let task = tokio::spawn(async move {
            let (rd, mut wr) = tokio::io::split(stream);
            let mut lines = BufReader::new(rd).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Ok(Some(line)) = line else { break };
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let Ok(request) = serde_json::from_str::<Value>(line) else {
                            continue;
                        };
                        let event = request["event"].as_str().unwrap_or_default().to_string();
                        let reply = if event == "protocol_version" {
                            version.map(|v| serde_json::json!({
                                "event": "protocol_version_return",
                                "version": v,
                            }))
                        } else {
                            replies.get(&event).cloned()
                        };
                        let _ = received_tx.send(request);
                        if let Some(reply) = reply {
                            let mut frame = serde_json::to_vec(&reply).unwrap();
                            frame.push(b'\n');
                            if wr.write_all(&frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    out = outgoing_rx.recv() => {
                        let Some(bytes) = out else { break };
                        if wr.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            received,
            outgoing,
            task,
        }
    }

    /// Push raw bytes to the host
    pub fn send_raw(&self, bytes: &[u8]) {
        self.outgoing.send(bytes.to_vec()).unwrap();
    }

    /// Push one JSON frame to the host
    pub fn send(&self, value: Value) {
        let mut frame = serde_json::to_vec(&value).unwrap();
        frame.push(b'\n');
        self.send_raw(&frame);
    }

    /// Next request the host sent (handshake included)
    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("panel saw no request")
            .expect("panel task ended")
    }

    /// Next request for `event`, skipping others
    pub async fn recv_event(&mut self, event: &str) -> Value {
        loop {
            let request = self.recv().await;
            if request["event"] == event {
                return request;
            }
        }
    }

    /// Wait for the panel task to end on its own (host closed the link)
    pub async fn finished(self) -> bool {
        tokio::time::timeout(WAIT, self.task).await.is_ok()
    }

    /// Yank the cable: drops the panel end of the link
    pub async fn unplug(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Connection with a fast read poll, attached to a fresh fake panel
pub async fn connected(version: u32, replies: &[(&str, Value)]) -> (Connection, FakePanel) {
    init_tracing();
    let (host, device) = tokio::io::duplex(4096);
    let panel = FakePanel::spawn(device, Some(version), replies);
    let conn = Connection::new(ConnectionConfig {
        read_poll_ms: 5,
        ..Default::default()
    });
    let negotiated = tokio::time::timeout(WAIT, conn.connect_transport(host))
        .await
        .expect("handshake hung")
        .expect("handshake failed");
    assert_eq!(negotiated, version);
    (conn, panel)
}
