//! Backend API: the `PaymentService` contract and its HTTP client.
//!
//! The engine only talks to the backend through [`PaymentService`], so hosts and tests can
//! substitute their own transport.

mod client;
mod types;

pub use client::HoustonClient;
pub use types::*;

use crate::error::Result;
use crate::size_vector::NextTransactionSize;
use crate::swap::FulfillmentData;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Type alias for backend futures.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// The wallet backend.
pub trait PaymentService: Send + Sync {
    fn fetch_real_time_data(&self) -> ApiFuture<'_, RealTimeData>;

    fn fetch_next_transaction_size(&self) -> ApiFuture<'_, NextTransactionSize>;

    fn fetch_contact(&self, hid: u64) -> ApiFuture<'_, Contact>;

    /// Register an outgoing operation and get back the transaction skeletons to sign.
    fn new_operation(&self, request: &NewOperationRequest) -> ApiFuture<'_, OperationCreated>;

    fn push_transactions(
        &self,
        operation_hid: u64,
        request: &PushTransactionsRequest,
    ) -> ApiFuture<'_, TransactionPushed>;

    fn fetch_fulfillment_data(&self, swap_uuid: &str) -> ApiFuture<'_, FulfillmentData>;

    fn push_fulfillment_transaction(
        &self,
        swap_uuid: &str,
        request: &FulfillmentPushRequest,
    ) -> ApiFuture<'_, ()>;

    /// Register invoice secrets so the backend can route payments to them.
    fn register_invoices(&self, invoices: &[InvoiceRegistration]) -> ApiFuture<'_, ()>;

    /// Settle a swap fully covered by debt by revealing the preimage.
    fn fulfill_with_preimage(
        &self,
        swap_uuid: &str,
        request: &PreimageRequest,
    ) -> ApiFuture<'_, ()>;

    /// Resolves once `duration` has elapsed.
    ///
    /// The library does not depend on a runtime, so the host supplies the timer used to
    /// bound the push step.
    fn push_timeout(&self, duration: Duration) -> ApiFuture<'_, ()>;
}
