//! Local WebSocket endpoint for tests.
//!
//! Accepts any number of connections on 127.0.0.1, records every text frame
//! the clients send, and lets the test push frames to all connected clients.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

pub struct LoopbackServer {
    pub url: String,
    received: mpsc::UnboundedReceiver<String>,
    outbound: broadcast::Sender<Message>,
    connections: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
}

impl LoopbackServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outbound, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        let accept_outbound = outbound.clone();
        let accept_connections = connections.clone();
        let accept_open = open.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                // Subscribe before the handshake so no push can slip past
                let mut pushes = accept_outbound.subscribe();
                let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
                    continue;
                };
                accept_connections.fetch_add(1, Ordering::SeqCst);
                accept_open.fetch_add(1, Ordering::SeqCst);

                let received_tx = received_tx.clone();
                let open = accept_open.clone();
                tokio::spawn(async move {
                    let (mut sink, mut stream) = ws.split();
                    loop {
                        tokio::select! {
                            incoming = stream.next() => match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = received_tx.send(text);
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                            pushed = pushes.recv() => match pushed {
                                Ok(message) => {
                                    if sink.send(message).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            },
                        }
                    }
                    open.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            url,
            received,
            outbound,
            connections,
            open,
        }
    }

    /// Next text frame any client sent. Panics after five seconds.
    pub async fn next_text(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("loopback server stopped")
    }

    /// Every text frame received so far, without waiting.
    pub fn drain_texts(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(text) = self.received.try_recv() {
            texts.push(text);
        }
        texts
    }

    /// Send a frame to every connected client.
    pub fn push(&self, message: Message) {
        let _ = self.outbound.send(message);
    }

    /// Handshakes completed since the server started.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Connections that have not yet closed.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Wait until the number of open connections reaches `expected`.
    pub async fn wait_for_open(&self, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.open_connections() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} open connections, have {}",
                expected,
                self.open_connections()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
