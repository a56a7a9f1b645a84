//! Test helpers for network-facing tests
//!
//! Provides a bare WebSocket client speaking the relay protocol frame by
//! frame, and timeouts that stretch in CI environments.

use futures::{SinkExt, StreamExt};
use parley_proto::BrokerMessage;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Relay client without a broker engine
///
/// Lets tests send arbitrary (including malicious) frames and observe exactly
/// what the relay routes back.
pub struct RawClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    alias: String,
}

impl RawClient {
    /// Connect and wait for the `Welcome`
    ///
    /// # Panics
    ///
    /// Panics if the connection fails or the first frame is not a `Welcome`.
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.expect("WebSocket connect");
        let mut client = Self {
            ws,
            alias: String::new(),
        };
        match client.recv().await {
            Some(BrokerMessage::Welcome { alias }) => client.alias = alias,
            other => panic!("expected Welcome, got {other:?}"),
        }
        client
    }

    /// Alias assigned by the relay
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Socket id `alias|n` of this client
    pub fn socket_id(&self, n: u64) -> String {
        parley_proto::socket_id(&self.alias, n)
    }

    /// Send one message as a binary frame
    ///
    /// # Panics
    ///
    /// Panics if the frame cannot be written.
    pub async fn send(&mut self, msg: &BrokerMessage) {
        let bytes = msg.to_bytes().expect("encode");
        self.ws
            .send(Message::Binary(bytes))
            .await
            .expect("WebSocket send");
    }

    /// Send a raw frame
    ///
    /// # Panics
    ///
    /// Panics if the frame cannot be written.
    pub async fn send_frame(&mut self, frame: Message) {
        self.ws.send(frame).await.expect("WebSocket send");
    }

    /// Next decoded message, `None` if the relay closed the connection or
    /// nothing arrived within the default timeout
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.recv_within(ci_timeout(Duration::from_secs(2))).await
    }

    /// Next decoded message within `limit`
    pub async fn recv_within(&mut self, limit: Duration) -> Option<BrokerMessage> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match frame {
                Ok(Message::Binary(bytes)) => {
                    return Some(BrokerMessage::from_bytes(&bytes).expect("decode relay frame"));
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Assert nothing arrives for a short while
    ///
    /// # Panics
    ///
    /// Panics if a message arrives.
    pub async fn expect_silence(&mut self) {
        if let Some(msg) = self.recv_within(Duration::from_millis(200)).await {
            panic!("expected silence, got {msg:?}");
        }
    }

    /// Whether the relay closed the connection within the default timeout
    pub async fn is_closed_by_relay(&mut self) -> bool {
        let deadline = tokio::time::Instant::now() + ci_timeout(Duration::from_secs(2));
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return false,
                Ok(None | Some(Err(_)) | Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Register as a host and wait for the confirmation
    ///
    /// # Panics
    ///
    /// Panics if the relay does not confirm.
    pub async fn listen(&mut self, name: &str) {
        let data = parley_proto::ServerData {
            alias: self.alias.clone(),
            name: name.to_string(),
            protocol: None,
            meta: None,
        };
        self.send(&BrokerMessage::CreateServerRequest {
            alias: self.alias.clone(),
            server_data: Some(data),
        })
        .await;
        match self.recv().await {
            Some(BrokerMessage::CreateServerResponse { alias }) => assert_eq!(alias, self.alias),
            other => panic!("expected CreateServerResponse, got {other:?}"),
        }
    }

    /// Ask for the host list
    ///
    /// # Panics
    ///
    /// Panics if no list arrives.
    pub async fn server_list(&mut self) -> Vec<parley_proto::ServerData> {
        self.send(&BrokerMessage::ServerListRequest { protocol: None })
            .await;
        match self.recv().await {
            Some(BrokerMessage::ServerListResponse { servers }) => servers,
            other => panic!("expected ServerListResponse, got {other:?}"),
        }
    }

    /// Close the connection
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Check if running in a CI environment
///
/// Checks common CI environment variables.
pub fn is_ci_environment() -> bool {
    std::env::var("CI").is_ok()
        || std::env::var("GITHUB_ACTIONS").is_ok()
        || std::env::var("GITLAB_CI").is_ok()
}

/// Get CI-adjusted timeout duration
///
/// Returns a timeout that's longer in CI environments to account for
/// resource contention and slower machines.
pub fn ci_timeout(base_timeout: Duration) -> Duration {
    if is_ci_environment() {
        base_timeout.mul_f32(3.0)
    } else {
        base_timeout.mul_f32(1.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ci_timeout() {
        let base = Duration::from_secs(10);
        let adjusted = ci_timeout(base);

        if is_ci_environment() {
            assert_eq!(adjusted, Duration::from_secs(30));
        } else {
            assert_eq!(adjusted, Duration::from_secs(15));
        }
    }
}
