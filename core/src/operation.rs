//! Operations: the wallet's record of each payment, sent or received.

use crate::address::MuunAddress;
use crate::exchange::BitcoinAmount;
use crate::keys::DerivationPath;
use crate::preparer::PreparedPayment;
use crate::swap::{IncomingSwap, SubmarineSwap};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationDirection {
    Incoming,
    Outgoing,
    /// Sent and received by the same user.
    Cyclical,
}

/// Lifecycle status as reported by the backend.
///
/// `Failed` is also what a push that timed out is stored as, even though the broadcast may
/// still confirm later. Callers that need to tell the two apart must look at the error
/// returned by the submit call, not at this status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Created,
    Signing,
    Signed,
    Broadcasted,
    Confirmed,
    Settled,
    Dropped,
    Failed,
    SwapPending,
    SwapRouting,
    SwapOpeningChannel,
    SwapWaitingChannel,
    SwapPayed,
    SwapFailed,
    SwapExpired,
}

impl OperationStatus {
    pub fn is_pending(self) -> bool {
        use OperationStatus::*;
        matches!(
            self,
            Created
                | Signing
                | Signed
                | Broadcasted
                | SwapPending
                | SwapRouting
                | SwapOpeningChannel
                | SwapWaitingChannel
        )
    }

    pub fn is_completed(self) -> bool {
        use OperationStatus::*;
        matches!(self, Confirmed | Settled | SwapPayed)
    }

    pub fn is_failed(self) -> bool {
        use OperationStatus::*;
        matches!(self, Dropped | Failed | SwapFailed | SwapExpired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Backend id, absent until the backend accepts the operation.
    #[serde(default)]
    pub hid: Option<u64>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub direction: Option<OperationDirection>,
    pub is_external: bool,
    #[serde(default)]
    pub receiver_address: Option<String>,
    #[serde(default)]
    pub receiver_address_derivation_path: Option<DerivationPath>,
    #[serde(default)]
    pub change_address: Option<MuunAddress>,
    pub amount: BitcoinAmount,
    pub fee: BitcoinAmount,
    #[serde(default)]
    pub output_amount_in_satoshis: u64,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default)]
    pub hash: Option<String>,
    /// Plain description. Only kept locally: the backend gets the encrypted metadata.
    #[serde(default)]
    pub description: Option<String>,
    pub status: OperationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub creation_date: OffsetDateTime,
    pub exchange_rate_window_hid: u64,
    #[serde(default)]
    pub swap: Option<SubmarineSwap>,
    #[serde(default)]
    pub incoming_swap: Option<IncomingSwap>,
    #[serde(default)]
    pub sender_metadata: Option<String>,
    #[serde(default)]
    pub receiver_metadata: Option<String>,
    #[serde(default)]
    pub outpoints: Vec<String>,
    #[serde(default)]
    pub is_rbf: bool,
}

impl Operation {
    /// A new outgoing operation for `prepared`, not yet known to the backend.
    pub fn new_outgoing(prepared: &PreparedPayment, receiver_address: Option<String>) -> Self {
        let swap = prepared.swap.clone();
        Operation {
            hid: None,
            request_id: Some(uuid::Uuid::new_v4().to_string()),
            direction: Some(OperationDirection::Outgoing),
            is_external: true,
            receiver_address: swap
                .as_ref()
                .map(|swap| swap.funding_output.output_address.clone())
                .or(receiver_address),
            receiver_address_derivation_path: None,
            change_address: None,
            amount: prepared.amount.clone(),
            fee: prepared.fee.clone(),
            output_amount_in_satoshis: prepared.output_amount,
            confirmations: 0,
            hash: None,
            description: Some(prepared.description.clone()),
            status: OperationStatus::Created,
            creation_date: OffsetDateTime::now_utc(),
            exchange_rate_window_hid: prepared.rate_window_hid,
            swap,
            incoming_swap: None,
            sender_metadata: None,
            receiver_metadata: None,
            outpoints: Vec::new(),
            is_rbf: false,
        }
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == Some(OperationDirection::Incoming)
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Some(OperationDirection::Outgoing)
    }

    pub fn is_cyclical(&self) -> bool {
        self.direction == Some(OperationDirection::Cyclical)
    }

    pub fn is_pending(&self) -> bool {
        self.status.is_pending()
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    pub fn is_failed(&self) -> bool {
        self.status.is_failed()
    }

    pub fn is_lending_swap(&self) -> bool {
        self.swap.as_ref().is_some_and(|swap| swap.is_lend())
    }

    /// Take the backend-owned fields from `update`, keep everything computed locally.
    pub fn merge_with_update(&self, update: &Operation) -> Operation {
        Operation {
            hid: update.hid,
            direction: update.direction,
            receiver_address: update.receiver_address.clone(),
            receiver_address_derivation_path: update.receiver_address_derivation_path.clone(),
            status: update.status,
            ..self.clone()
        }
    }
}

/// Outbound callbacks. Return values are never consumed.
pub trait NotificationSink: Send + Sync {
    /// A new incoming operation was stored.
    fn on_new_incoming_operation(&self, operation: &Operation);

    /// An operation was stored with a failed status.
    fn on_operation_failed(&self, operation: &Operation);
}

/// A sink that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotificationSink;

impl NotificationSink for NoopNotificationSink {
    fn on_new_incoming_operation(&self, _operation: &Operation) {}

    fn on_operation_failed(&self, _operation: &Operation) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exchange::BitcoinAmount;

    pub(crate) fn operation(hid: Option<u64>, status: OperationStatus) -> Operation {
        Operation {
            hid,
            request_id: None,
            direction: Some(OperationDirection::Outgoing),
            is_external: true,
            receiver_address: Some("bcrt1qlocal".to_string()),
            receiver_address_derivation_path: None,
            change_address: None,
            amount: BitcoinAmount::zero("BTC", "BTC"),
            fee: BitcoinAmount::zero("BTC", "BTC"),
            output_amount_in_satoshis: 0,
            confirmations: 0,
            hash: None,
            description: Some("rent".to_string()),
            status,
            creation_date: OffsetDateTime::UNIX_EPOCH,
            exchange_rate_window_hid: 1,
            swap: None,
            incoming_swap: None,
            sender_metadata: None,
            receiver_metadata: None,
            outpoints: vec![],
            is_rbf: false,
        }
    }

    #[test]
    fn test_status_classes_are_disjoint() {
        use OperationStatus::*;
        for status in [
            Created,
            Signing,
            Signed,
            Broadcasted,
            Confirmed,
            Settled,
            Dropped,
            Failed,
            SwapPending,
            SwapRouting,
            SwapOpeningChannel,
            SwapWaitingChannel,
            SwapPayed,
            SwapFailed,
            SwapExpired,
        ] {
            let classes = [status.is_pending(), status.is_completed(), status.is_failed()];
            assert_eq!(classes.iter().filter(|c| **c).count(), 1, "{:?}", status);
        }
    }

    #[test]
    fn test_merge_keeps_local_fields() {
        let local = operation(None, OperationStatus::Created);
        let mut remote = operation(Some(42), OperationStatus::Broadcasted);
        remote.description = None;
        remote.receiver_address = Some("bcrt1qremote".to_string());
        remote.confirmations = 3;

        let merged = local.merge_with_update(&remote);
        assert_eq!(merged.hid, Some(42));
        assert_eq!(merged.status, OperationStatus::Broadcasted);
        assert_eq!(merged.receiver_address.as_deref(), Some("bcrt1qremote"));
        assert_eq!(merged.description.as_deref(), Some("rent"));
        assert_eq!(merged.confirmations, 0);
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&OperationStatus::SwapOpeningChannel).unwrap();
        assert_eq!(json, "\"SWAP_OPENING_CHANNEL\"");
        assert!(serde_json::from_str::<OperationStatus>("\"SWAP_UNKNOWN\"").is_err());
    }
}
