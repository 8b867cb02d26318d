use crate::config::SessionConfig;
use crate::error::{ControlError, Result};
use crate::subscription::DisconnectReason;
use crate::types::Endpoint;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead, FramedWrite, LinesCodec};

/// Something that happened on the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound line as raw bytes, delimiter and trailing `\r` stripped
    ///
    /// Not checked for UTF-8 here; a bad line is the decoder's problem and
    /// must not take the connection down.
    Line(Vec<u8>),
    /// The connection is gone; always the last event of a connection
    Disconnected(DisconnectReason),
}

/// Low-level line-framed TCP connection
///
/// Reading happens on a background task that forwards every line to the
/// event channel returned by [`Connection::connect`]. Writes go through a
/// dedicated writer task, so `send` can be called from anywhere.
#[derive(Debug)]
pub struct Connection {
    endpoint: Endpoint,
    /// Channel for outgoing lines
    out_tx: mpsc::UnboundedSender<String>,
    /// Asks the read loop to stop
    shutdown_tx: mpsc::UnboundedSender<DisconnectReason>,
}

impl Connection {
    /// Connect to a control server
    pub async fn connect(
        endpoint: &Endpoint,
        config: &SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        tracing::info!("Connecting to {}", endpoint);

        let connect_error = |reason: String| ControlError::Connect {
            endpoint: endpoint.clone(),
            reason,
        };
        let stream = timeout(
            config.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| connect_error("timed out".to_string()))?
        .map_err(|e| connect_error(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let mut read = FramedRead::new(
            read_half,
            AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), config.max_line_length),
        );
        let mut write = FramedWrite::new(write_half, LinesCodec::new());

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<DisconnectReason>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Spawn task to forward outgoing lines to the socket
        let writer_shutdown = shutdown_tx.clone();
        let write_handle = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if let Err(e) = write.send(line).await {
                    tracing::error!("Failed to send line: {}", e);
                    let _ = writer_shutdown.send(DisconnectReason::Io(e.to_string()));
                    break;
                }
            }
        });

        // Spawn task to read incoming lines; this is the only place that
        // reports the disconnect, so it happens exactly once
        let peer = endpoint.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    reason = shutdown_rx.recv() => {
                        break reason.unwrap_or(DisconnectReason::Requested);
                    }
                    frame = read.next() => match frame {
                        Some(Ok(chunk)) => {
                            let line = chunk.strip_suffix(b"\r").unwrap_or(&chunk[..]);
                            if line.iter().all(u8::is_ascii_whitespace) {
                                continue;
                            }
                            tracing::debug!("Received: {}", String::from_utf8_lossy(line));
                            if event_tx.send(TransportEvent::Line(line.to_vec())).is_err() {
                                // nobody consumes our events anymore
                                break DisconnectReason::Requested;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!("Read error on {}: {}", peer, e);
                            break DisconnectReason::Io(e.to_string());
                        }
                        None => break DisconnectReason::EndOfStream,
                    }
                }
            };

            write_handle.abort();
            tracing::info!("Connection to {} closed: {}", peer, reason);
            let _ = event_tx.send(TransportEvent::Disconnected(reason));
        });

        Ok((
            Self {
                endpoint: endpoint.clone(),
                out_tx,
                shutdown_tx,
            },
            event_rx,
        ))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Queue one line for writing; the newline is appended here
    pub fn send(&self, line: String) -> Result<()> {
        tracing::debug!("Sending: {}", line);
        self.out_tx
            .send(line)
            .map_err(|_| ControlError::Send(format!("connection to {} is closed", self.endpoint)))
    }

    /// Close the connection
    ///
    /// The read loop reports `Disconnected(Requested)` unless the socket
    /// already failed on its own.
    pub fn disconnect(&self) {
        let _ = self.shutdown_tx.send(DisconnectReason::Requested);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(2);

    async fn listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Endpoint::new("127.0.0.1", port))
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Option<TransportEvent> {
        timeout(WAIT, rx.recv()).await.unwrap()
    }

    #[tokio::test]
    async fn test_lines_are_split_and_trimmed() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"{\"a\":1}\r\n\n{\"b\":2}\n{\"c\"")
                .await
                .unwrap();
            socket.write_all(b":3}\n").await.unwrap();
        });

        let (_conn, mut events) = Connection::connect(&endpoint, &SessionConfig::default())
            .await
            .unwrap();

        assert_eq!(next_event(&mut events).await, Some(line(b"{\"a\":1}")));
        assert_eq!(next_event(&mut events).await, Some(line(b"{\"b\":2}")));
        assert_eq!(next_event(&mut events).await, Some(line(b"{\"c\":3}")));
        server.await.unwrap();
    }

    fn line(bytes: &[u8]) -> TransportEvent {
        TransportEvent::Line(bytes.to_vec())
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_passed_through() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"{\"n\":\"\xff\xfe\"}\n{\"ok\":1}\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (_conn, mut events) = Connection::connect(&endpoint, &SessionConfig::default())
            .await
            .unwrap();

        assert_eq!(next_event(&mut events).await, Some(line(b"{\"n\":\"\xff\xfe\"}")));
        assert_eq!(next_event(&mut events).await, Some(line(b"{\"ok\":1}")));
    }

    #[tokio::test]
    async fn test_end_of_stream_reported_once() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let (conn, mut events) = Connection::connect(&endpoint, &SessionConfig::default())
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            Some(TransportEvent::Disconnected(DisconnectReason::EndOfStream))
        );
        // a late disconnect() does not produce a second event
        conn.disconnect();
        assert_eq!(next_event(&mut events).await, None);
    }

    #[tokio::test]
    async fn test_disconnect_closes_socket() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            // returns once the client closed its side
            while lines.next_line().await.unwrap().is_some() {}
        });

        let (conn, mut events) = Connection::connect(&endpoint, &SessionConfig::default())
            .await
            .unwrap();
        conn.disconnect();

        assert_eq!(
            next_event(&mut events).await,
            Some(TransportEvent::Disconnected(DisconnectReason::Requested))
        );
        assert_eq!(next_event(&mut events).await, None);
        timeout(WAIT, server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            let mut received = Vec::new();
            while received.len() < 50 {
                received.push(lines.next_line().await.unwrap().unwrap());
            }
            received
        });

        let (conn, _events) = Connection::connect(&endpoint, &SessionConfig::default())
            .await
            .unwrap();
        let conn = std::sync::Arc::new(conn);

        let mut senders = Vec::new();
        for i in 0..50 {
            let conn = conn.clone();
            senders.push(tokio::spawn(async move {
                conn.send(format!("{{\"id\":{},\"pad\":\"{}\"}}", i, "x".repeat(512)))
                    .unwrap();
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }

        let received = timeout(WAIT, server).await.unwrap().unwrap();
        for line in received {
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["pad"].as_str().unwrap().len(), 512);
        }
    }

    #[tokio::test]
    async fn test_overlong_line_terminates_connection() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[b'x'; 64]).await.unwrap();
            socket.write_all(b"\n").await.unwrap();
            // keep the socket open so only the length limit can end it
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = SessionConfig::default().with_max_line_length(16);
        let (_conn, mut events) = Connection::connect(&endpoint, &config).await.unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            Some(TransportEvent::Disconnected(DisconnectReason::Io(_)))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, endpoint) = listener().await;
        drop(listener);

        let err = Connection::connect(&endpoint, &SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Connect { .. }));
    }
}
