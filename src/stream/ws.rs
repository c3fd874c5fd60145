//! WebSocket transport over tokio-tungstenite.
//!
//! The socket is split: the sink side is the [`Transport`], and a reader
//! task forwards pongs and the close notification as [`TransportEvent`]s.
//! Binary frames are fed without flushing, so consecutive frames leave in
//! one write; [`Transport::flush`] pushes them out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::transport::{Connection, Connector, Transport, TransportError, TransportEvent};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Opens `ws://` and `wss://` connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, uri: &str) -> Result<Connection, TransportError> {
        let (socket, response) = connect_async(uri).await.map_err(|e| TransportError::Connect {
            uri: uri.into(),
            reason: e.to_string(),
        })?;
        log::debug!("ws: handshake with {uri} answered {}", response.status());

        let (sink, mut stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn({
            let connected = Arc::clone(&connected);
            async move {
                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Pong(_)) => {
                            let _ = tx.send(TransportEvent::Pong);
                        }
                        Ok(Message::Close(frame)) => {
                            log::info!("ws: peer sent close {frame:?}");
                            break;
                        }
                        Ok(Message::Text(text)) => log::debug!("ws: peer says {text}"),
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!("ws: read failed: {e}");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::Release);
                let _ = tx.send(TransportEvent::Disconnected);
            }
        });

        Ok(Connection {
            transport: Box::new(WsTransport {
                sink,
                reader,
                connected,
                in_flight: 0,
            }),
            events: rx,
        })
    }
}

struct WsTransport {
    sink: WsSink,
    reader: JoinHandle<()>,
    connected: Arc<AtomicBool>,
    in_flight: usize,
}

fn send_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        other => TransportError::Send(other.to_string()),
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sink.send(Message::Text(text)).await.map_err(send_error)?;
        self.in_flight = 0;
        Ok(())
    }

    async fn send_binary(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        let len = payload.len();
        self.sink.feed(Message::Binary(payload)).await.map_err(send_error)?;
        self.in_flight += len;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink.send(Message::Ping(Vec::new())).await.map_err(send_error)?;
        self.in_flight = 0;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.sink.flush().await.map_err(send_error)?;
        self.in_flight = 0;
        Ok(())
    }

    fn in_flight_bytes(&self) -> usize {
        self.in_flight
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            log::debug!("ws: close: {e}");
        }
        self.connected.store(false, Ordering::Release);
        self.reader.abort();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Accept one connection and collect everything it receives until it
    /// closes.
    async fn server() -> (String, JoinHandle<Vec<Message>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let task = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
            let mut received = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    break;
                }
                received.push(message);
            }
            received
        });
        (format!("ws://{addr}/realtime"), task)
    }

    #[tokio::test]
    async fn messages_reach_the_server_in_order() {
        let (uri, server) = server().await;
        let mut connection = WsConnector.connect(&uri).await.expect("connect");
        let transport = &mut connection.transport;

        transport.send_text(r#"{"type":"start"}"#.into()).await.expect("start");
        transport.send_binary(vec![1, 0, 2, 0]).await.expect("frame");
        transport.send_binary(vec![3, 0, 4, 0]).await.expect("frame");
        assert_eq!(transport.in_flight_bytes(), 8);
        transport.flush().await.expect("flush");
        assert_eq!(transport.in_flight_bytes(), 0);
        transport.send_text(r#"{"type":"stop"}"#.into()).await.expect("stop");
        assert!(transport.is_connected());
        transport.close().await;

        let received = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server finished")
            .expect("server task");
        let data: Vec<Message> = received.into_iter().filter(|m| !m.is_ping()).collect();
        assert_eq!(
            data,
            vec![
                Message::Text(r#"{"type":"start"}"#.into()),
                Message::Binary(vec![1, 0, 2, 0]),
                Message::Binary(vec![3, 0, 4, 0]),
                Message::Text(r#"{"type":"stop"}"#.into()),
            ]
        );
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong_event() {
        let (uri, _server) = server().await;
        let mut connection = WsConnector.connect(&uri).await.expect("connect");

        connection.transport.ping().await.expect("ping");
        let event = tokio::time::timeout(Duration::from_secs(5), connection.events.recv())
            .await
            .expect("event in time");
        assert_eq!(event, Some(TransportEvent::Pong));
        connection.transport.close().await;
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let result = WsConnector.connect(&format!("ws://{addr}/")).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
