//! WebSocket server for consumers.
//!
//! Each connection subscribes to the bridge's state updates and forwards
//! them as push messages, while requests from the consumer are handled
//! concurrently and answered on the same socket.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::error::Result;
use crate::server::handler::CommandHandler;
use crate::server::messages::Push;

/// Queue of serialized responses waiting for the socket writer.
const RESPONSE_QUEUE: usize = 32;

/// Accepts consumer connections until the bridge shuts down.
pub struct WebSocketServer {
    listener: TcpListener,
    bridge: Arc<Bridge>,
    handler: CommandHandler,
}

impl WebSocketServer {
    /// Bind to `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the address cannot be bound.
    pub async fn bind(addr: &str, bridge: Arc<Bridge>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            handler: CommandHandler::new(bridge.clone()),
            bridge,
        })
    }

    /// The bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until [`Bridge::shutdown`].
    pub async fn run(self) {
        let stop = self.bridge.stop_token();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let bridge = self.bridge.clone();
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, bridge, handler).await {
                                debug!("Client {} error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
            }
        }

        info!("WebSocket server stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    bridge: Arc<Bridge>,
    handler: CommandHandler,
) -> Result<()> {
    let ws = accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let (subscriber, mut updates) = bridge.subscribe();
    let (responses_tx, mut responses) = mpsc::channel::<String>(RESPONSE_QUEUE);
    let stop = bridge.stop_token();
    info!("Client connected: {}", peer);

    let result = async {
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                update = updates.recv() => match update {
                    Some(update) => {
                        let text = serde_json::to_string(&Push::from(&update))?;
                        write.send(Message::Text(text)).await?;
                    }
                    None => {
                        warn!("Client {} dropped from updates, closing", peer);
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                },
                Some(text) = responses.recv() => {
                    write.send(Message::Text(text)).await?;
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received from {}: {}", peer, text);
                        let handler = handler.clone();
                        let responses_tx = responses_tx.clone();
                        tokio::spawn(async move {
                            let response = handler.handle_text(&text).await;
                            match serde_json::to_string(&response) {
                                Ok(json) => {
                                    let _ = responses_tx.send(json).await;
                                }
                                Err(e) => error!("Failed to serialize response: {}", e),
                            }
                        });
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Read error from {}: {}", peer, e);
                        break;
                    }
                },
            }
        }
        Ok::<(), crate::Error>(())
    }
    .await;

    bridge.unsubscribe(subscriber);
    info!("Client disconnected: {}", peer);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::MockTransport;
    use crate::supervisor::SupervisorConfig;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    async fn start() -> (Arc<Bridge>, Arc<MockTransport>, String) {
        let transport = Arc::new(MockTransport::with_device("MATCHBOX-1"));
        let bridge = Arc::new(Bridge::new(transport.clone(), SupervisorConfig::default()));
        tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.run().await }
        });
        while !bridge.status().is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let server = WebSocketServer::bind("127.0.0.1:0", bridge.clone())
            .await
            .unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        tokio::spawn(server.run());

        (bridge, transport, url)
    }

    async fn next_text<S>(stream: &mut S) -> String
    where
        S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = message {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn test_push_reaches_every_consumer() {
        let (bridge, transport, url) = start().await;

        let (mut a, _) = connect_async(url.as_str()).await.unwrap();
        let (mut b, _) = connect_async(url.as_str()).await.unwrap();
        while bridge.subscriber_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        transport.connection().unwrap().notify(b"[25.0,101.3,40,60]");

        let expected = r#"{"data":{"BT":"101.30","ET":"25.00","status":"Connected"}}"#;
        assert_eq!(next_text(&mut a).await, expected);
        assert_eq!(next_text(&mut b).await, expected);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_response() {
        let (bridge, transport, url) = start().await;
        let (mut client, _) = connect_async(url.as_str()).await.unwrap();

        client
            .send(Message::Text(
                json!({"id": 5, "command": "setFan", "value": 150}).to_string(),
            ))
            .await
            .unwrap();
        let response: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
        assert_eq!(response["id"], json!(5));
        assert_eq!(response["status"], json!("error"));
        assert!(transport.connection().unwrap().writes().is_empty());

        client
            .send(Message::Text("not json".to_string()))
            .await
            .unwrap();
        let response: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
        assert_eq!(response, json!({"status": "error", "message": "Invalid JSON"}));

        client
            .send(Message::Text(json!({"id": 6, "command": "getData"}).to_string()))
            .await
            .unwrap();
        let response: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
        assert_eq!(response["status"], json!("success"));
        assert_eq!(response["data"]["BT"], json!("0.00"));

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_client_is_unsubscribed() {
        let (bridge, _, url) = start().await;

        let (mut client, _) = connect_async(url.as_str()).await.unwrap();
        while bridge.subscriber_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        client.close(None).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while bridge.subscriber_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        bridge.shutdown().await;
    }
}
