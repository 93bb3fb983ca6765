//! HTTP client for the wallet backend.

use super::types::*;
use super::{ApiFuture, PaymentService};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::size_vector::NextTransactionSize;
use crate::swap::FulfillmentData;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Host-supplied timer: resolves after the given duration.
pub type Timer =
    Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Houston API client.
#[derive(Clone)]
pub struct HoustonClient {
    base_url: String,
    client: reqwest::Client,
    push_timeout: Duration,
    timer: Option<Timer>,
}

impl std::fmt::Debug for HoustonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HoustonClient")
            .field("base_url", &self.base_url)
            .field("push_timeout", &self.push_timeout)
            .field("has_timer", &self.timer.is_some())
            .finish()
    }
}

impl HoustonClient {
    /// Create a new API client.
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the backend (e.g., "https://api.example.com")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            timer: None,
        }
    }

    /// Client for `config.api_url` whose pushes give up after `config.push_timeout_secs`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.api_url.clone())
            .with_push_timeout(Duration::from_secs(config.push_timeout_secs))
    }

    /// Bound each push request. A push that runs out of time is a slow push.
    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    /// Race pushes against `timer` as well as the request timeout.
    pub fn with_timer(mut self, timer: Timer) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn real_time_data(&self) -> Result<RealTimeData> {
        let url = format!("{}/realtime", self.base_url);
        self.get_json(&url).await
    }

    pub async fn next_transaction_size(&self) -> Result<NextTransactionSize> {
        let url = format!("{}/operations/next-transaction-size", self.base_url);
        self.get_json(&url).await
    }

    pub async fn contact(&self, hid: u64) -> Result<Contact> {
        let url = format!("{}/contacts/{}", self.base_url, hid);
        self.get_json(&url).await
    }

    pub async fn create_operation(
        &self,
        request: &NewOperationRequest,
    ) -> Result<OperationCreated> {
        let url = format!("{}/operations", self.base_url);
        self.send_json(reqwest::Method::POST, &url, request).await
    }

    pub async fn push_raw_transactions(
        &self,
        operation_hid: u64,
        request: &PushTransactionsRequest,
    ) -> Result<TransactionPushed> {
        let url = format!("{}/operations/{}/raw-transaction", self.base_url, operation_hid);
        let text = self
            .send(reqwest::Method::PUT, &url, request, Some(self.push_timeout))
            .await?;

        serde_json::from_str(&text)
            .map_err(|e| Error::Parse(format!("Failed to parse response: {}. Body: {}", e, text)))
    }

    pub async fn fulfillment_data(&self, swap_uuid: &str) -> Result<FulfillmentData> {
        let url = format!("{}/incoming-swaps/{}/fulfillment", self.base_url, swap_uuid);
        self.get_json(&url).await
    }

    pub async fn push_fulfillment(
        &self,
        swap_uuid: &str,
        request: &FulfillmentPushRequest,
    ) -> Result<()> {
        let url = format!("{}/incoming-swaps/{}/fulfillment", self.base_url, swap_uuid);
        self.send_empty(reqwest::Method::PUT, &url, request).await
    }

    pub async fn register_invoice_secrets(&self, invoices: &[InvoiceRegistration]) -> Result<()> {
        let url = format!("{}/invoices", self.base_url);
        self.send_empty(reqwest::Method::POST, &url, &invoices).await
    }

    pub async fn push_preimage(&self, swap_uuid: &str, request: &PreimageRequest) -> Result<()> {
        let url = format!("{}/incoming-swaps/{}/preimage", self.base_url, swap_uuid);
        self.send_empty(reqwest::Method::PUT, &url, request).await
    }

    // Helper methods

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(format!("Failed to send request to {}", url), e))?;

        let text = Self::read_body(response).await?;
        log::debug!("GET {} response: {}", url, text);

        serde_json::from_str(&text)
            .map_err(|e| Error::Parse(format!("Failed to parse response: {}. Body: {}", e, text)))
    }

    async fn send_json<T: serde::de::DeserializeOwned, R: serde::Serialize>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &R,
    ) -> Result<T> {
        let text = self.send(method, url, body, None).await?;

        serde_json::from_str(&text)
            .map_err(|e| Error::Parse(format!("Failed to parse response: {}. Body: {}", e, text)))
    }

    async fn send_empty<R: serde::Serialize>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &R,
    ) -> Result<()> {
        self.send(method, url, body, None).await.map(|_| ())
    }

    async fn send<R: serde::Serialize>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &R,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let mut builder = self.client.request(method.clone(), url).json(body);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(format!("Failed to send request to {}", url), e))?;

        let text = Self::read_body(response).await?;
        log::debug!("{} {} response: {}", method, url, text);
        Ok(text)
    }

    async fn read_body(response: reqwest::Response) -> Result<String> {
        if !response.status().is_success() {
            let status = response.status();
            let error: ApiError = response.json().await.unwrap_or_else(|_| ApiError {
                error_code: None,
                message: "Unknown error".to_string(),
            });
            return Err(Error::Network(format!(
                "API error ({}): {}",
                status, error.message
            )));
        }

        response
            .text()
            .await
            .map_err(|e| transport_error("Failed to read response".to_string(), e))
    }
}

/// Only pushes carry a timeout, so a request that ran out of time is a slow push.
fn transport_error(context: String, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::SlowPush(format!("{}: {}", context, e))
    } else {
        Error::Network(format!("{}: {}", context, e))
    }
}

impl PaymentService for HoustonClient {
    fn fetch_real_time_data(&self) -> ApiFuture<'_, RealTimeData> {
        Box::pin(self.real_time_data())
    }

    fn fetch_next_transaction_size(&self) -> ApiFuture<'_, NextTransactionSize> {
        Box::pin(self.next_transaction_size())
    }

    fn fetch_contact(&self, hid: u64) -> ApiFuture<'_, Contact> {
        Box::pin(self.contact(hid))
    }

    fn new_operation(&self, request: &NewOperationRequest) -> ApiFuture<'_, OperationCreated> {
        let request = request.clone();
        Box::pin(async move { self.create_operation(&request).await })
    }

    fn push_transactions(
        &self,
        operation_hid: u64,
        request: &PushTransactionsRequest,
    ) -> ApiFuture<'_, TransactionPushed> {
        let request = request.clone();
        Box::pin(async move { self.push_raw_transactions(operation_hid, &request).await })
    }

    fn fetch_fulfillment_data(&self, swap_uuid: &str) -> ApiFuture<'_, FulfillmentData> {
        let swap_uuid = swap_uuid.to_string();
        Box::pin(async move { self.fulfillment_data(&swap_uuid).await })
    }

    fn push_fulfillment_transaction(
        &self,
        swap_uuid: &str,
        request: &FulfillmentPushRequest,
    ) -> ApiFuture<'_, ()> {
        let swap_uuid = swap_uuid.to_string();
        let request = request.clone();
        Box::pin(async move { self.push_fulfillment(&swap_uuid, &request).await })
    }

    fn register_invoices(&self, invoices: &[InvoiceRegistration]) -> ApiFuture<'_, ()> {
        let invoices = invoices.to_vec();
        Box::pin(async move { self.register_invoice_secrets(&invoices).await })
    }

    fn fulfill_with_preimage(
        &self,
        swap_uuid: &str,
        request: &PreimageRequest,
    ) -> ApiFuture<'_, ()> {
        let swap_uuid = swap_uuid.to_string();
        let request = request.clone();
        Box::pin(async move { self.push_preimage(&swap_uuid, &request).await })
    }

    fn push_timeout(&self, duration: Duration) -> ApiFuture<'_, ()> {
        match &self.timer {
            Some(timer) => {
                let sleep = timer(duration);
                Box::pin(async move {
                    sleep.await;
                    Ok(())
                })
            }
            None => Box::pin(futures::future::pending()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Network;

    #[test]
    fn test_base_url_is_normalized() {
        let client = HoustonClient::new("https://houston.example.com/");
        assert_eq!(client.base_url(), "https://houston.example.com");
    }

    #[tokio::test]
    async fn test_push_timeout_uses_host_timer() {
        let timer: Timer = Arc::new(|_| Box::pin(async {}));
        let client = HoustonClient::new("http://localhost").with_timer(timer);
        client.push_timeout(Duration::from_secs(30)).await.unwrap();
    }

    #[test]
    fn test_push_timeout_follows_config() {
        let mut config = EngineConfig::new(Network::Regtest, "http://localhost/");
        config.push_timeout_secs = 5;

        let client = HoustonClient::from_config(&config);
        assert_eq!(client.base_url(), "http://localhost");
        assert_eq!(client.push_timeout, Duration::from_secs(5));
        assert_eq!(HoustonClient::new("http://localhost").push_timeout, DEFAULT_PUSH_TIMEOUT);
    }

    #[tokio::test]
    async fn test_unanswered_push_is_slow() {
        // Connections queue in the backlog and are never answered.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = HoustonClient::new(format!("http://{}", listener.local_addr().unwrap()))
            .with_push_timeout(Duration::from_millis(200));
        let request = PushTransactionsRequest {
            hex_transaction: None,
            alternative_transactions: vec![],
        };

        let err = client.push_raw_transactions(1, &request).await.unwrap_err();
        assert!(err.is_slow_push(), "{:?}", err);

        let err = client.push_transactions(1, &request).await.unwrap_err();
        assert!(err.is_slow_push(), "{:?}", err);
        drop(listener);
    }

    #[tokio::test]
    async fn test_refused_push_is_a_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let client = HoustonClient::new(format!("http://{}", address));
        let request = PushTransactionsRequest {
            hex_transaction: None,
            alternative_transactions: vec![],
        };
        let err = client.push_raw_transactions(1, &request).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)), "{:?}", err);
    }

    #[ignore]
    #[tokio::test]
    async fn manual_api_checks() {
        let client = HoustonClient::new("http://localhost:8080");
        client.real_time_data().await.unwrap();
        client.next_transaction_size().await.unwrap();
    }
}
