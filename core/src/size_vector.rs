//! The next-transaction-size vector and the single cell that owns it.
//!
//! The vector models how the size (and fee) of the next transaction grows as more UTXOs
//! are spent. It is written from several places: the submit response, the push response,
//! push notifications and periodic fetches. All of them go through [`SizeVectorCell`],
//! which applies the one freshness rule in [`reconcile`].

use crate::error::Result;
use crate::storage::SizeVectorStorage;
use futures::lock::Mutex;
use serde::{Deserialize, Serialize};

/// Confirmation status of the UTXO behind a size progression entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UtxoStatus {
    #[default]
    Confirmed,
    Unconfirmed,
}

/// Size of a transaction spending enough UTXOs to cover `amount_in_satoshis`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeForAmount {
    pub amount_in_satoshis: u64,
    pub size_in_vbytes: u64,
    /// `txid:index` of the UTXO this entry adds.
    #[serde(default)]
    pub outpoint: String,
    #[serde(default)]
    pub utxo_status: UtxoStatus,
    #[serde(default)]
    pub delta_in_weight_units: u64,
}

/// The fee-estimation vector, valid as of an operation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextTransactionSize {
    pub size_progression: Vec<SizeForAmount>,
    #[serde(default)]
    pub valid_at_operation_hid: Option<u64>,
    #[serde(default)]
    pub expected_debt_in_satoshis: i64,
}

impl NextTransactionSize {
    /// Debt owed to Muun. Negative values coming from the backend are treated as 0.
    pub fn expected_debt(&self) -> u64 {
        if self.expected_debt_in_satoshis < 0 {
            log::error!(
                "Negative expected debt {} at operation {:?}",
                self.expected_debt_in_satoshis,
                self.valid_at_operation_hid
            );
            return 0;
        }
        self.expected_debt_in_satoshis as u64
    }

    /// Sum of all UTXOs.
    pub fn utxo_balance(&self) -> u64 {
        self.size_progression
            .last()
            .map(|entry| entry.amount_in_satoshis)
            .unwrap_or(0)
    }

    /// What the user can spend: UTXOs minus debt.
    pub fn total_balance(&self) -> u64 {
        self.utxo_balance().saturating_sub(self.expected_debt())
    }

    /// Outpoints in the order the progression spends them.
    pub fn outpoints(&self) -> Vec<String> {
        self.size_progression
            .iter()
            .map(|entry| entry.outpoint.clone())
            .collect()
    }
}

/// Outcome of comparing a candidate vector against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Accept,
    RejectStale,
}

/// Where a candidate vector came from. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSite {
    PostSubmit,
    PostPush,
    Notification,
    PeriodicFetch,
}

/// Decide whether `candidate` may replace `current`.
///
/// Rejects iff `current` has an id and it is greater than the candidate's. Ties are
/// accepted as refreshes, and an empty slot or an id-less current always accepts.
pub fn reconcile(
    candidate: &NextTransactionSize,
    current: Option<&NextTransactionSize>,
) -> Reconciliation {
    let current_hid = current.and_then(|c| c.valid_at_operation_hid);
    match current_hid {
        Some(current_hid) if Some(current_hid) > candidate.valid_at_operation_hid => {
            Reconciliation::RejectStale
        }
        _ => Reconciliation::Accept,
    }
}

/// Single owner of the stored vector.
///
/// The read-compare-write in [`SizeVectorCell::reconcile_and_store`] is serialized, so two
/// racing writers cannot both pass the check against the same stored value.
pub struct SizeVectorCell<S: SizeVectorStorage> {
    storage: S,
    write_lock: Mutex<()>,
}

impl<S: SizeVectorStorage> SizeVectorCell<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The latest committed vector.
    pub async fn latest(&self) -> Result<Option<NextTransactionSize>> {
        self.storage.get_size_vector().await
    }

    /// Store `candidate` unless it is stale.
    ///
    /// Stale candidates are logged and dropped; that is not an error for the caller.
    pub async fn reconcile_and_store(
        &self,
        candidate: NextTransactionSize,
        site: WriteSite,
    ) -> Result<Reconciliation> {
        let _guard = self.write_lock.lock().await;

        let current = self.storage.get_size_vector().await?;
        let outcome = reconcile(&candidate, current.as_ref());

        match outcome {
            Reconciliation::Accept => {
                log::debug!(
                    "Storing size vector at {:?} from {:?}",
                    candidate.valid_at_operation_hid,
                    site
                );
                self.storage.set_size_vector(&candidate).await?;
            }
            Reconciliation::RejectStale => {
                log::warn!(
                    "Stale size vector update from {:?}: candidate {:?} vs stored {:?}",
                    site,
                    candidate.valid_at_operation_hid,
                    current.as_ref().and_then(|c| c.valid_at_operation_hid)
                );
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::memory::MemorySizeVectorStorage;

    pub(crate) fn nts(hid: Option<u64>, amounts: &[(u64, u64)]) -> NextTransactionSize {
        NextTransactionSize {
            size_progression: amounts
                .iter()
                .enumerate()
                .map(|(i, (amount, size))| SizeForAmount {
                    amount_in_satoshis: *amount,
                    size_in_vbytes: *size,
                    outpoint: format!("{}:{}", "00".repeat(32), i),
                    utxo_status: UtxoStatus::Confirmed,
                    delta_in_weight_units: 0,
                })
                .collect(),
            valid_at_operation_hid: hid,
            expected_debt_in_satoshis: 0,
        }
    }

    #[test]
    fn test_reconcile_is_reflexive() {
        for hid in [None, Some(0), Some(10)] {
            let v = nts(hid, &[(1000, 200)]);
            assert_eq!(reconcile(&v, Some(&v)), Reconciliation::Accept);
        }
    }

    #[test]
    fn test_reconcile_rejects_older_candidate() {
        let old = nts(Some(8), &[]);
        let new = nts(Some(10), &[]);
        assert_eq!(reconcile(&old, Some(&new)), Reconciliation::RejectStale);
        assert_eq!(reconcile(&new, Some(&old)), Reconciliation::Accept);
    }

    #[test]
    fn test_reconcile_bootstrap_cases() {
        let candidate = nts(Some(3), &[]);
        assert_eq!(reconcile(&candidate, None), Reconciliation::Accept);
        assert_eq!(
            reconcile(&candidate, Some(&nts(None, &[]))),
            Reconciliation::Accept
        );
        // A candidate without id cannot prove it is newer than a stored id.
        assert_eq!(
            reconcile(&nts(None, &[]), Some(&candidate)),
            Reconciliation::RejectStale
        );
    }

    #[test]
    fn test_balances() {
        let mut v = nts(Some(1), &[(1000, 100), (5000, 200)]);
        v.expected_debt_in_satoshis = 1200;
        assert_eq!(v.utxo_balance(), 5000);
        assert_eq!(v.total_balance(), 3800);
        assert_eq!(v.outpoints().len(), 2);

        v.expected_debt_in_satoshis = -5;
        assert_eq!(v.expected_debt(), 0);
        assert_eq!(nts(None, &[]).utxo_balance(), 0);
    }

    #[test]
    fn test_utxo_status_defaults_to_confirmed() {
        let entry: SizeForAmount =
            serde_json::from_str(r#"{"amountInSatoshis":10,"sizeInVbytes":110}"#).unwrap();
        assert_eq!(entry.utxo_status, UtxoStatus::Confirmed);
        let status: UtxoStatus = serde_json::from_str("\"UNCONFIRMED\"").unwrap();
        assert_eq!(status, UtxoStatus::Unconfirmed);
    }

    #[tokio::test]
    async fn test_cell_keeps_newest_vector() {
        let cell = SizeVectorCell::new(MemorySizeVectorStorage::new());

        let outcome = cell
            .reconcile_and_store(nts(Some(10), &[(1, 1)]), WriteSite::PostSubmit)
            .await
            .unwrap();
        assert_eq!(outcome, Reconciliation::Accept);

        let outcome = cell
            .reconcile_and_store(nts(Some(8), &[(2, 2)]), WriteSite::PostPush)
            .await
            .unwrap();
        assert_eq!(outcome, Reconciliation::RejectStale);
        assert_eq!(
            cell.latest().await.unwrap().unwrap().valid_at_operation_hid,
            Some(10)
        );

        let outcome = cell
            .reconcile_and_store(nts(Some(10), &[(3, 3)]), WriteSite::Notification)
            .await
            .unwrap();
        assert_eq!(outcome, Reconciliation::Accept);
        assert_eq!(cell.latest().await.unwrap().unwrap().utxo_balance(), 3);
    }

    #[tokio::test]
    async fn test_cell_serializes_racing_writers() {
        let cell = SizeVectorCell::new(MemorySizeVectorStorage::new());

        let (a, b) = futures::join!(
            cell.reconcile_and_store(nts(Some(12), &[]), WriteSite::Notification),
            cell.reconcile_and_store(nts(Some(11), &[]), WriteSite::PostPush),
        );
        a.unwrap();
        b.unwrap();

        // Whatever the interleaving, the newest id wins.
        assert_eq!(
            cell.latest().await.unwrap().unwrap().valid_at_operation_hid,
            Some(12)
        );
    }
}
