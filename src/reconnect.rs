use crate::config::ReconnectConfig;
use crate::session::{Session, SessionPhase};
use crate::subscription::{LifecycleEvent, LifecycleReceiver};
use crate::types::Endpoint;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// Keeps a [`Session`] connected to one endpoint
///
/// Runs a background loop that connects, waits for the connection to drop
/// and tries again with exponential backoff. The backoff starts over after
/// every successful connection.
///
/// # Example
///
/// ```no_run
/// use snapcast_control::{Endpoint, ReconnectConfig, Reconnector, Session};
///
/// #[tokio::main]
/// async fn main() {
///     let session = Session::default();
///     let mut reconnector = Reconnector::new(session.clone(), Endpoint::new("192.168.1.10", 1705));
///     reconnector.start();
///
///     tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
///     println!("{} clients", session.snapshot().clients().count());
///
///     reconnector.stop().await;
/// }
/// ```
pub struct Reconnector {
    session: Session,
    endpoint: Endpoint,
    config: ReconnectConfig,
    stop_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Reconnector {
    pub fn new(session: Session, endpoint: Endpoint) -> Self {
        Self {
            session,
            endpoint,
            config: ReconnectConfig::default(),
            stop_tx: None,
            task_handle: None,
        }
    }

    pub fn with_config(mut self, config: ReconnectConfig) -> Self {
        self.config = config;
        self
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start the reconnect loop
    ///
    /// A loop that is already running keeps running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        self.stop_tx = Some(stop_tx);

        let session = self.session.clone();
        let endpoint = self.endpoint.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            let mut backoff = Duration::ZERO;
            loop {
                // subscribe first so a quick drop after connecting is not missed
                let mut lifecycle = session.subscribe_lifecycle();

                match session.connect(endpoint.clone()).await {
                    Ok(()) => {
                        backoff = Duration::ZERO;
                        if config.refresh_status {
                            if let Err(e) = session.get_status().await {
                                tracing::warn!("Status refresh after connect failed: {}", e);
                            }
                        }

                        tokio::select! {
                            _ = stop_rx.recv() => break,
                            _ = wait_for_disconnect(&session, &mut lifecycle) => {}
                        }
                    }
                    Err(e) => tracing::error!("Connection attempt failed: {}", e),
                }

                // Exponential backoff: 1s, 2s, 4s, ... up to the max
                backoff = config.next_backoff(backoff);
                tracing::info!("Reconnecting to {} in {:?}", endpoint, backoff);
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = sleep(backoff) => {}
                }
            }
            tracing::info!("Reconnect loop for {} stopped", endpoint);
        });

        self.task_handle = Some(handle);
    }

    /// Stop the loop and close the connection
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                tracing::error!("Reconnect loop ended abnormally: {}", e);
            }
        }
        self.session.disconnect().await;
    }
}

async fn wait_for_disconnect(session: &Session, lifecycle: &mut LifecycleReceiver) {
    loop {
        match lifecycle.recv().await {
            Ok(LifecycleEvent::Disconnected { .. }) => return,
            Ok(_) => {}
            Err(e) => {
                // missed events; fall back to asking the session
                tracing::warn!("Lifecycle events: {}", e);
                if session.phase().await == SessionPhase::Disconnected {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_reconnects_after_server_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());

        // first connection is closed right away, the second one stays up
        let server = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            let (second, _) = listener.accept().await.unwrap();
            let (read, mut write) = second.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                let response = serde_json::json!({"jsonrpc": "2.0", "id": request["id"], "result": {}});
                write
                    .write_all(format!("{}\n", response).as_bytes())
                    .await
                    .unwrap();
            }
        });

        let session = Session::default();
        let mut lifecycle = session.subscribe_lifecycle();
        let config = ReconnectConfig::default()
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
            .with_refresh_status(false);
        let mut reconnector = Reconnector::new(session.clone(), endpoint).with_config(config);
        reconnector.start();
        assert!(reconnector.is_running());

        let mut connected = 0;
        timeout(Duration::from_secs(5), async {
            while connected < 2 {
                if let Ok(LifecycleEvent::Connected(_)) = lifecycle.recv().await {
                    connected += 1;
                }
            }
        })
        .await
        .unwrap();

        // the second connection is usable and counts ids from 1 again
        assert!(session.call("Server.GetRPCVersion", None).await.is_ok());

        reconnector.stop().await;
        assert!(!reconnector.is_running());
        assert_eq!(session.phase().await, SessionPhase::Disconnected);
        server.abort();
    }

    #[tokio::test]
    async fn test_stop_while_backing_off() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        drop(listener);

        let session = Session::default();
        let config = ReconnectConfig::default()
            .with_backoff(Duration::from_secs(30), Duration::from_secs(30));
        let mut reconnector = Reconnector::new(session, endpoint).with_config(config);
        reconnector.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        timeout(Duration::from_secs(2), reconnector.stop())
            .await
            .unwrap();
    }
}
