use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use parley_shared::call::{CallHistoryEntry, CallKind, CallSession, CallStatus};
use parley_shared::constants::USER_ID_HEADER;
use parley_shared::error::{ErrorBody, ErrorCode};
use parley_shared::protocol::{CleanupResponse, InitiateCallRequest};
use parley_shared::types::{SessionId, UserId};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// The call REST surface, as seen by the controller.
#[async_trait]
pub trait CallApi: Send + Sync {
    async fn initiate(&self, receiver: UserId, kind: CallKind) -> Result<CallSession>;
    async fn answer(&self, session_id: SessionId) -> Result<CallSession>;
    async fn decline(&self, session_id: SessionId) -> Result<CallSession>;
    async fn end(&self, session_id: SessionId) -> Result<CallSession>;
    /// Force-end every active session of the current user. Returns how many
    /// were ended.
    async fn cleanup(&self) -> Result<usize>;
    async fn status(&self) -> Result<CallStatus>;
    async fn history(&self) -> Result<Vec<CallHistoryEntry>>;
}

pub struct HttpCallApi {
    http: Client,
    config: ClientConfig,
}

impl HttpCallApi {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let resp = request
            .header(USER_ID_HEADER, self.config.user_id.to_string())
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }
}

/// Turn a non-2xx response into [`ClientError::Server`], keeping the machine
/// code when the body carries one.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let (code, message) = match resp.json::<ErrorBody>().await {
        Ok(body) => (body.code, body.error),
        Err(_) => (ErrorCode::Internal, format!("Server responded {status}")),
    };
    debug!(status = status.as_u16(), ?code, "Call API request failed");

    Err(ClientError::Server {
        status: status.as_u16(),
        code,
        message,
    })
}

#[async_trait]
impl CallApi for HttpCallApi {
    async fn initiate(&self, receiver: UserId, kind: CallKind) -> Result<CallSession> {
        let url = self.config.calls_url(&format!("initiate/{receiver}"));
        self.send(self.http.post(url).json(&InitiateCallRequest { kind }))
            .await
    }

    async fn answer(&self, session_id: SessionId) -> Result<CallSession> {
        let url = self.config.calls_url(&format!("answer/{session_id}"));
        self.send(self.http.put(url)).await
    }

    async fn decline(&self, session_id: SessionId) -> Result<CallSession> {
        let url = self.config.calls_url(&format!("decline/{session_id}"));
        self.send(self.http.put(url)).await
    }

    async fn end(&self, session_id: SessionId) -> Result<CallSession> {
        let url = self.config.calls_url(&format!("end/{session_id}"));
        self.send(self.http.put(url)).await
    }

    async fn cleanup(&self) -> Result<usize> {
        let url = self.config.calls_url("cleanup");
        let resp: CleanupResponse = self.send(self.http.post(url)).await?;
        Ok(resp.cleaned_count)
    }

    async fn status(&self) -> Result<CallStatus> {
        self.send(self.http.get(self.config.calls_url("status"))).await
    }

    async fn history(&self) -> Result<Vec<CallHistoryEntry>> {
        self.send(self.http.get(self.config.calls_url("history"))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_hung_server_times_out() {
        // Accepts connections and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = ClientConfig::new(format!("http://{addr}"), UserId::new());
        config.request_timeout = Duration::from_millis(100);
        let api = HttpCallApi::new(config).unwrap();

        let started = std::time::Instant::now();
        match api.status().await {
            Err(ClientError::Http(e)) => assert!(e.is_timeout(), "{e}"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }
}
