use crate::device::Device;
use crate::errors::ErrorType;
use crate::protocol::Protocol;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A message the adapter accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub elapsed_ms: f64,
    pub status_code: u16,
}

/// Failures a transport reports. Each variant maps to one [`ErrorType`];
/// only `Other` falls back to classifying its text.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("connection timed out after {0}ms")]
    Timeout(u64),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("rate limited (status {0})")]
    RateLimited(u16),
    #[error("server error (status {0})")]
    Server(u16),
    #[error("rejected with status {0}")]
    Rejected(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("network error: session not connected")]
    NotConnected,
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Map a non-success response status onto an error.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => TransportError::AuthenticationFailed(format!("status {}", status)),
            429 => TransportError::RateLimited(status),
            500..=599 => TransportError::Server(status),
            _ => TransportError::Rejected(status),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            TransportError::Timeout(_) => ErrorType::ConnectionTimeout,
            TransportError::ConnectionRefused(_)
            | TransportError::Network(_)
            | TransportError::NotConnected => ErrorType::NetworkError,
            TransportError::AuthenticationFailed(_) => ErrorType::AuthenticationFailed,
            TransportError::RateLimited(_) => ErrorType::RateLimited,
            TransportError::Server(_) => ErrorType::ServerError,
            TransportError::Rejected(status) => ErrorType::from_status(*status),
            TransportError::Other(reason) => ErrorType::classify(reason),
        }
    }
}

/// Protocol client used by exactly one worker.
///
/// `connect` is called once before the send loop and `close` once after it,
/// on every exit path the worker controls. Dropping a transport must also
/// release its resources, since a straggling worker may be aborted.
pub trait Transport: Send {
    fn name(&self) -> &'static str;

    fn connect(&mut self) -> TransportFuture<'_, Result<(), TransportError>>;

    fn send<'a>(
        &'a mut self,
        payload: &'a [u8],
    ) -> TransportFuture<'a, Result<Delivery, TransportError>>;

    fn close(&mut self) -> TransportFuture<'_, ()>;
}

/// Creates one transport per (device, protocol) worker.
pub trait TransportFactory: Send + Sync {
    fn create(&self, device: &Device, protocol: Protocol, message_kind: &str)
        -> Box<dyn Transport>;
}

/// Scripted behaviour for [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockScript {
    AlwaysSucceed,
    /// Even-numbered sends succeed, odd-numbered sends fail with the reason
    Alternate(TransportError),
    /// Every `n`th send fails with the reason
    FailEvery(u64, TransportError),
}

/// Counters shared between a mock factory and the transports it creates.
#[derive(Debug, Default)]
pub struct MockCounters {
    pub connects: AtomicU64,
    pub sends: AtomicU64,
    pub closes: AtomicU64,
}

impl MockCounters {
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> u64 {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Mock transport for testing and dry runs (fixed latency, scripted outcomes)
#[derive(Debug, Clone)]
pub struct MockTransport {
    latency: Duration,
    script: MockScript,
    connect_error: Option<TransportError>,
    hang_on_send: bool,
    sent: u64,
    connected: bool,
    counters: Arc<MockCounters>,
}

impl MockTransport {
    pub fn new(latency_ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(latency_ms),
            script: MockScript::AlwaysSucceed,
            connect_error: None,
            hang_on_send: false,
            sent: 0,
            connected: false,
            counters: Arc::new(MockCounters::default()),
        }
    }

    pub fn with_script(mut self, script: MockScript) -> Self {
        self.script = script;
        self
    }

    pub fn refuse_connect(mut self, error: TransportError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// Every send blocks forever, simulating a stuck adapter call.
    pub fn hang_on_send(mut self) -> Self {
        self.hang_on_send = true;
        self
    }

    pub fn with_counters(mut self, counters: Arc<MockCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    fn scripted_outcome(&self, index: u64) -> Result<(), TransportError> {
        match &self.script {
            MockScript::AlwaysSucceed => Ok(()),
            MockScript::Alternate(error) if index % 2 == 1 => Err(error.clone()),
            MockScript::Alternate(_) => Ok(()),
            MockScript::FailEvery(n, error) if *n > 0 && (index + 1) % n == 0 => {
                Err(error.clone())
            }
            MockScript::FailEvery(..) => Ok(()),
        }
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn connect(&mut self) -> TransportFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = &self.connect_error {
                return Err(error.clone());
            }
            self.connected = true;
            Ok(())
        })
    }

    fn send<'a>(
        &'a mut self,
        _payload: &'a [u8],
    ) -> TransportFuture<'a, Result<Delivery, TransportError>> {
        Box::pin(async move {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            if self.hang_on_send {
                futures::future::pending::<()>().await;
            }

            sleep(self.latency).await;

            let index = self.sent;
            self.sent += 1;
            self.counters.sends.fetch_add(1, Ordering::SeqCst);

            self.scripted_outcome(index)?;
            Ok(Delivery {
                elapsed_ms: self.latency.as_micros() as f64 / 1000.0,
                status_code: 200,
            })
        })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.connected = false;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// Hands every worker a clone of one configured [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockTransportFactory {
    template: MockTransport,
}

impl MockTransportFactory {
    pub fn new(template: MockTransport) -> Self {
        Self { template }
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        self.template.counters()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, _device: &Device, _protocol: Protocol, _kind: &str) -> Box<dyn Transport> {
        Box::new(self.template.clone())
    }
}

/// HTTP adapter client: POSTs each payload to `{base_url}/{message_kind}`.
pub struct HttpTransport {
    client: Option<reqwest::Client>,
    url: String,
    username: String,
    password: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, device: &Device, timeout_ms: u64) -> Self {
        Self {
            client: None,
            url: url.into(),
            username: device.username(),
            password: device.password.clone(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn map_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout.as_millis() as u64)
        } else if e.is_connect() {
            TransportError::ConnectionRefused(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn connect(&mut self) -> TransportFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let client = reqwest::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| TransportError::Other(format!("failed to build client: {}", e)))?;
            self.client = Some(client);
            Ok(())
        })
    }

    fn send<'a>(
        &'a mut self,
        payload: &'a [u8],
    ) -> TransportFuture<'a, Result<Delivery, TransportError>> {
        Box::pin(async move {
            let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
            let start = Instant::now();

            let response = client
                .post(&self.url)
                .basic_auth(&self.username, Some(&self.password))
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload.to_vec())
                .send()
                .await
                .map_err(|e| self.map_error(e))?;

            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            let status = response.status().as_u16();
            if response.status().is_success() {
                Ok(Delivery {
                    elapsed_ms,
                    status_code: status,
                })
            } else {
                Err(TransportError::from_status(status))
            }
        })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.client = None;
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    base_url: String,
    timeout_ms: u64,
}

impl HttpTransportFactory {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms,
        }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(
        &self,
        device: &Device,
        _protocol: Protocol,
        message_kind: &str,
    ) -> Box<dyn Transport> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), message_kind);
        Box::new(HttpTransport::new(url, device, self.timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_follows_variant_not_text() {
        let refused = TransportError::ConnectionRefused(
            "error sending request for url (http://127.0.0.1:5000/telemetry)".into(),
        );
        assert_eq!(refused.error_type(), ErrorType::NetworkError);
        let network = TransportError::Network(
            "error sending request for url (http://adapter:4010/event)".into(),
        );
        assert_eq!(network.error_type(), ErrorType::NetworkError);
        assert_eq!(
            TransportError::AuthenticationFailed("connection closed by broker".into()).error_type(),
            ErrorType::AuthenticationFailed
        );
        assert_eq!(TransportError::Rejected(403).error_type(), ErrorType::AuthenticationFailed);
        assert_eq!(TransportError::Rejected(400).error_type(), ErrorType::Unknown);
        assert_eq!(
            TransportError::Other("dns lookup failed".into()).error_type(),
            ErrorType::NetworkError
        );
    }

    #[test]
    fn test_error_text_classifies() {
        let cases = [
            (TransportError::Timeout(5000), ErrorType::ConnectionTimeout),
            (
                TransportError::ConnectionRefused("os error 111".into()),
                ErrorType::NetworkError,
            ),
            (
                TransportError::AuthenticationFailed("bad password".into()),
                ErrorType::AuthenticationFailed,
            ),
            (TransportError::RateLimited(429), ErrorType::RateLimited),
            (TransportError::Server(503), ErrorType::ServerError),
            (TransportError::Network("reset".into()), ErrorType::NetworkError),
            (TransportError::NotConnected, ErrorType::NetworkError),
            (TransportError::Rejected(400), ErrorType::Unknown),
            (TransportError::Other("odd".into()), ErrorType::Unknown),
        ];
        for (error, expected) in cases {
            assert_eq!(
                ErrorType::classify(&error.to_string()),
                expected,
                "{}",
                error
            );
            assert_eq!(error.error_type(), expected, "{}", error);
        }
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            TransportError::from_status(401),
            TransportError::AuthenticationFailed(_)
        ));
        assert_eq!(TransportError::from_status(429), TransportError::RateLimited(429));
        assert_eq!(TransportError::from_status(502), TransportError::Server(502));
        assert_eq!(TransportError::from_status(404), TransportError::Rejected(404));
    }

    #[tokio::test]
    async fn test_mock_alternates_outcomes() {
        let mut mock = MockTransport::new(1).with_script(MockScript::Alternate(
            TransportError::Server(503),
        ));
        mock.connect().await.unwrap();

        let payload = b"{}";
        let first = mock.send(payload).await.unwrap();
        assert_eq!(first.status_code, 200);
        assert_eq!(first.elapsed_ms, 1.0);
        assert_eq!(mock.send(payload).await, Err(TransportError::Server(503)));
        assert!(mock.send(payload).await.is_ok());

        mock.close().await;
        let counters = mock.counters();
        assert_eq!(counters.connects(), 1);
        assert_eq!(counters.sends(), 3);
        assert_eq!(counters.closes(), 1);
    }

    #[tokio::test]
    async fn test_mock_fail_every_and_refused_connect() {
        let mut mock = MockTransport::new(0).with_script(MockScript::FailEvery(
            3,
            TransportError::RateLimited(429),
        ));
        mock.connect().await.unwrap();
        let mut failures = 0;
        for _ in 0..9 {
            if mock.send(b"x").await.is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 3);

        let mut refused =
            MockTransport::new(0).refuse_connect(TransportError::ConnectionRefused("no".into()));
        assert!(refused.connect().await.is_err());
        assert_eq!(refused.send(b"x").await, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_http_send_without_connect() {
        let device = Device::new("d1", "t1", "pw");
        let factory = HttpTransportFactory::new("http://127.0.0.1:1/", 500);
        let mut transport = factory.create(&device, Protocol::Http, "telemetry");
        assert_eq!(transport.name(), "http");
        assert_eq!(transport.send(b"{}").await, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_http_unreachable_adapter_is_network_failure() {
        let device = Device::new("d1", "t1", "pw");
        let mut transport = HttpTransport::new("http://127.0.0.1:1/telemetry", &device, 2000);
        assert_eq!(transport.url(), "http://127.0.0.1:1/telemetry");
        transport.connect().await.unwrap();

        let error = transport.send(b"{}").await.unwrap_err();
        let kind = error.error_type();
        assert_eq!(kind, ErrorType::classify(&error.to_string()));
        assert!(
            matches!(kind, ErrorType::NetworkError | ErrorType::ConnectionTimeout),
            "unexpected classification {:?} for {}",
            kind,
            error
        );
        transport.close().await;
    }
}
