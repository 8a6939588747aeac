use std::time::Duration;

use futures::{future::BoxFuture, FutureExt};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};

use super::{backoff::status, Transmission};

/// What came back from the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: Option<String>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
            body: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: impl Into<String>) -> Self {
        self.retry_after = Some(retry_after.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Status code a failed attempt is treated as by the policies.
    pub fn status_code(&self) -> u16 {
        match self {
            TransportError::Timeout => status::REQUEST_TIMEOUT,
            TransportError::Connect(_) | TransportError::Request(_) => status::UNKNOWN_NETWORK_ERROR,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TransportError::Timeout
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else {
            TransportError::Request(error.to_string())
        }
    }
}

/// Delivers one transmission to its endpoint.
pub trait Transport: Send + Sync + 'static {
    fn send<'a>(
        &'a self,
        transmission: &'a Transmission,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>>;
}

/// Posts transmissions over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post(&self, transmission: &Transmission) -> Result<HttpResponse, TransportError> {
        let mut request = self
            .client
            .post(transmission.endpoint())
            .header(CONTENT_TYPE, transmission.content_type())
            .body(transmission.content().clone());
        if !transmission.content_encoding().is_empty() {
            request = request.header(CONTENT_ENCODING, transmission.content_encoding());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = match response.text().await {
            Ok(body) if !body.is_empty() => Some(body),
            Ok(_) => None,
            Err(error) => {
                tracing::debug!(%error, status, "Failed to read response body");
                None
            }
        };

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        transmission: &'a Transmission,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        self.post(transmission).boxed()
    }
}

#[cfg(test)]
mod tests {
    use httptest::{matchers::*, responders::*, Expectation, Server};

    use super::*;

    fn transmission_to(endpoint: impl Into<String>) -> Transmission {
        Transmission::new(
            endpoint,
            "{\"name\":\"a\"}",
            crate::serializer::JSON_LINES_CONTENT_TYPE,
            "",
        )
    }

    #[tokio::test]
    #[test_log::test]
    async fn test_posts_payload_with_content_type() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v2/track"),
                request::headers(contains(("content-type", "application/x-json-stream"))),
                request::body(json_decoded(eq(serde_json::json!({"name": "a"})))),
            ])
            .respond_with(status_code(200)),
        );

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let transmission = transmission_to(server.url_str("/v2/track"));
        let response = transport.send(&transmission).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, None);
    }

    #[tokio::test]
    #[test_log::test]
    async fn test_captures_retry_after_and_body() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v2/track")).respond_with(
                status_code(429)
                    .insert_header("Retry-After", "30")
                    .body("{\"itemsReceived\":1,\"itemsAccepted\":0,\"errors\":[]}"),
            ),
        );

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let transmission = transmission_to(server.url_str("/v2/track"));
        let response = transport.send(&transmission).await.unwrap();
        assert_eq!(response.status, 429);
        assert_eq!(response.retry_after.as_deref(), Some("30"));
        assert!(response.body.unwrap().contains("itemsReceived"));
    }

    #[tokio::test]
    #[test_log::test]
    async fn test_connection_failure_maps_to_unknown_network_error() {
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let transmission = transmission_to("http://127.0.0.1:1/");
        let error = transport.send(&transmission).await.unwrap_err();
        assert_eq!(error.status_code(), status::UNKNOWN_NETWORK_ERROR);
    }
}
