use crate::api::{
    FulfillmentPushRequest, InvoiceRegistration, NewOperationRequest, OperationCreated,
    PaymentService, PreimageRequest, PushTransactionsRequest,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::invoice::{InvoiceOptions, InvoiceState, build_invoice, generate_invoice_secrets};
use crate::keys::{PrivateKey, PublicKey};
use crate::metadata::{
    OperationMetadata, decrypt_operation_metadata, encrypt_for_contact, encrypt_for_self,
};
use crate::operation::{NoopNotificationSink, NotificationSink, Operation, OperationStatus};
use crate::preparer::{PaymentIntent, PaymentPreparer, PaymentRequest, PreparedPayment};
use crate::signer::{
    NonceBundle, PartiallySignedTransaction, SignedTransactions, SigningExpectations,
    sign_with_alternatives,
};
use crate::size_vector::{NextTransactionSize, Reconciliation, SizeVectorCell, WriteSite};
use crate::storage::{InvoiceSecretsStorage, OperationStorage, SizeVectorStorage, WalletStorage};
use crate::swap::{IncomingSwapState, SwapEvent, SwapState};
use crate::wallet::Wallet;
use futures::future::{Either, select};
use std::time::Duration;
use time::OffsetDateTime;

/// The wallet engine.
///
/// The client is parameterized by its collaborators:
/// - `S`: secure storage for the mnemonic and Muun's cosigning key
/// - `O`: the local operation history
/// - `V`: the size vector slot
/// - `P`: the backend
pub struct Client<S: WalletStorage, O: OperationStorage, V: SizeVectorStorage, P: PaymentService> {
    config: EngineConfig,
    wallet: Wallet<S>,
    operations: O,
    size_vector: SizeVectorCell<V>,
    service: P,
    notifications: Box<dyn NotificationSink>,
    invoice_secrets: Option<Box<dyn InvoiceSecretsStorage>>,
}

impl<S, O, V, P> Client<S, O, V, P>
where
    S: WalletStorage,
    O: OperationStorage,
    V: SizeVectorStorage,
    P: PaymentService,
{
    /// Create a new client.
    ///
    /// # Arguments
    /// * `config` - Network, backend and fee settings
    /// * `wallet_storage` - Storage for the mnemonic and Muun's key
    /// * `operations` - Storage for the operation history
    /// * `size_vector` - Storage for the next-transaction-size vector
    /// * `service` - The backend
    pub fn new(
        config: EngineConfig,
        wallet_storage: S,
        operations: O,
        size_vector: V,
        service: P,
    ) -> Self {
        let wallet = Wallet::new(wallet_storage, config.network);

        Self {
            config,
            wallet,
            operations,
            size_vector: SizeVectorCell::new(size_vector),
            service,
            notifications: Box::new(NoopNotificationSink),
            invoice_secrets: None,
        }
    }

    pub fn with_notification_sink(mut self, sink: Box<dyn NotificationSink>) -> Self {
        self.notifications = sink;
        self
    }

    /// Enables incoming swaps.
    pub fn with_invoice_secrets(mut self, storage: Box<dyn InvoiceSecretsStorage>) -> Self {
        self.invoice_secrets = Some(storage);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn wallet(&self) -> &Wallet<S> {
        &self.wallet
    }

    pub fn operations(&self) -> &O {
        &self.operations
    }

    pub fn size_vector(&self) -> &SizeVectorCell<V> {
        &self.size_vector
    }

    pub fn service(&self) -> &P {
        &self.service
    }

    pub async fn init(&self, mnemonic: Option<String>) -> Result<()> {
        if let Some(mnemonic) = mnemonic {
            self.wallet.import_mnemonic(mnemonic.as_str()).await?;
        } else {
            self.wallet.generate_or_get_mnemonic().await?;
        }
        Ok(())
    }

    /// Store Muun's base cosigning key.
    pub async fn set_muun_cosigning_key(&self, base58: &str, path: &str) -> Result<()> {
        self.wallet.set_muun_key(base58, path).await
    }

    /// Price a payment. Swap quotes must commit to this wallet's keys.
    pub async fn prepare_payment(&self, request: &PaymentRequest) -> Result<PreparedPayment> {
        let keys = self.wallet.base_key_pair().await?;
        PaymentPreparer::new(&self.config, &self.service, &self.size_vector, &keys)
            .prepare(request)
            .await
    }

    /// Submit, sign and push a prepared payment.
    ///
    /// Returns the stored operation. A push that does not answer in time yields
    /// [`Error::SlowPush`]: the operation is stored as failed, but may still confirm.
    pub async fn submit_payment(&self, prepared: &PreparedPayment) -> Result<Operation> {
        if !prepared.is_payable() {
            return Err(Error::Other(format!(
                "payment is not payable: {:?}",
                prepared.status
            )));
        }

        let user_key = self.wallet.base_private_key().await?;
        let muun_key = self.wallet.base_muun_key().await?;

        let (operation, destination) = self.build_operation(prepared, &user_key)?;

        let nonces =
            NonceBundle::generate(prepared.outpoints.len(), self.alternative_count(prepared));
        let request = NewOperationRequest {
            operation: operation.clone(),
            user_public_nonces: nonces.primary_hex(),
            alternative_public_nonces: nonces.alternatives_hex(),
        };

        let created = self.service.new_operation(&request).await?;
        self.size_vector
            .reconcile_and_store(created.next_transaction_size.clone(), WriteSite::PostSubmit)
            .await?;

        let mut operation = operation.merge_with_update(&created.operation);
        operation.change_address = created.change_address.clone();
        let hid = operation
            .hid
            .ok_or_else(|| Error::Other("backend returned an operation without hid".to_string()))?;

        log::info!("Created operation {} for {} sats", hid, prepared.amount.in_satoshis);

        let push = if prepared.is_lending_swap() {
            // Lent swaps are paid with the server's capacity: there is no transaction.
            PushTransactionsRequest {
                hex_transaction: None,
                alternative_transactions: vec![],
            }
        } else {
            let expectations = SigningExpectations {
                destination,
                amount: prepared.output_amount,
                change: created.change_address.clone(),
                fee: prepared.fee.in_satoshis,
                alternative: false,
            };
            let signed = self
                .sign(&created, nonces, &expectations, &user_key, &muun_key)
                .await?;

            operation.hash = Some(signed.primary.hash.clone());
            operation.status = OperationStatus::Signed;
            PushTransactionsRequest {
                hex_transaction: Some(signed.primary.hex),
                alternative_transactions: signed
                    .alternatives
                    .into_iter()
                    .map(|tx| tx.hex)
                    .collect(),
            }
        };

        self.push(operation, hid, &push).await
    }

    async fn push(
        &self,
        mut operation: Operation,
        hid: u64,
        request: &PushTransactionsRequest,
    ) -> Result<Operation> {
        let timeout = Duration::from_secs(self.config.push_timeout_secs);
        let pushed = match select(
            self.service.push_transactions(hid, request),
            self.service.push_timeout(timeout),
        )
        .await
        {
            Either::Left((result, _)) => result,
            Either::Right((timer, _)) => {
                timer?;
                Err(Error::SlowPush(format!(
                    "operation {} was not confirmed by the backend within {:?}",
                    hid, timeout
                )))
            }
        };

        let pushed = match pushed {
            Ok(pushed) => pushed,
            Err(e) if e.is_slow_push() => {
                // It may still confirm: stored as failed, but nobody is told it failed.
                log::warn!("Push of operation {} timed out after {:?}: {}", hid, timeout, e);
                operation.status = OperationStatus::Failed;
                self.operations.store(&operation).await?;
                return Err(e);
            }
            Err(e) => {
                log::error!("Failed to push operation {}: {}", hid, e);
                operation.status = OperationStatus::Failed;
                self.store_and_notify(&operation).await?;
                return Err(e);
            }
        };

        let mut operation = operation.merge_with_update(&pushed.updated_operation);
        if let Some(swap) = operation
            .swap
            .as_mut()
            .filter(|swap| !swap.is_lend() && swap.state == SwapState::Created)
        {
            swap.apply(SwapEvent::FundingBroadcast)?;
        }

        self.size_vector
            .reconcile_and_store(pushed.next_transaction_size, WriteSite::PostPush)
            .await?;
        self.store_and_notify(&operation).await?;

        log::info!("Pushed operation {} with status {:?}", hid, operation.status);
        Ok(operation)
    }

    /// Apply an operation update pushed by the backend.
    ///
    /// Outgoing swaps pick up their stored progress and advance on the update's
    /// confirmations and preimage; an update whose preimage does not hash to the swap's
    /// payment hash is rejected before anything is stored.
    ///
    /// The operation is stored before anyone is notified. Incoming swaps are then checked
    /// for fulfillability; a swap that fails the check is stored as failed and the error
    /// returned.
    pub async fn on_operation_update(
        &self,
        mut operation: Operation,
        nts: NextTransactionSize,
    ) -> Result<Operation> {
        let hid = operation
            .hid
            .ok_or_else(|| Error::Other("operation update without hid".to_string()))?;
        let previous = self.operations.fetch_by_hid(hid).await?;
        advance_swap(&mut operation, previous.as_ref())?;

        self.operations.store(&operation).await?;
        self.size_vector
            .reconcile_and_store(nts, WriteSite::Notification)
            .await?;

        if previous.is_none() && (operation.is_incoming() || operation.is_cyclical()) {
            self.notifications.on_new_incoming_operation(&operation);
        }
        if operation.is_failed() && !previous.as_ref().is_some_and(Operation::is_failed) {
            self.notifications.on_operation_failed(&operation);
        }

        let pending_swap = operation
            .incoming_swap
            .as_ref()
            .is_some_and(|swap| swap.state == IncomingSwapState::PendingFulfillment);
        if !pending_swap {
            return Ok(operation);
        }

        self.verify_incoming_swap(operation).await
    }

    async fn verify_incoming_swap(&self, mut operation: Operation) -> Result<Operation> {
        let store = self.invoice_secrets()?;
        let user_key = self.wallet.base_private_key().await?;
        let height = self.service.fetch_real_time_data().await?.current_block_height;

        let Some(swap) = operation.incoming_swap.as_mut() else {
            return Ok(operation);
        };
        let verified = swap.verify_fulfillable(&user_key, store, height).await;
        self.operations.store(&operation).await?;

        match verified {
            Ok(()) => Ok(operation),
            Err(e) => {
                log::error!(
                    "Incoming swap of operation {:?} is not fulfillable: {}",
                    operation.hid,
                    e
                );
                Err(e)
            }
        }
    }

    /// Claim the incoming swap with `swap_uuid`.
    ///
    /// Swaps covered entirely by debt have no HTLC: only the preimage is sent.
    pub async fn fulfill_incoming_swap(&self, swap_uuid: &str) -> Result<Operation> {
        let store = self.invoice_secrets()?;
        let mut operation = self
            .operations
            .list()
            .await?
            .into_iter()
            .find(|op| {
                op.incoming_swap
                    .as_ref()
                    .is_some_and(|swap| swap.houston_uuid.to_string() == swap_uuid)
            })
            .ok_or_else(|| Error::OperationNotFound(format!("incoming swap {}", swap_uuid)))?;

        let Some(mut swap) = operation.incoming_swap.take() else {
            return Err(Error::OperationNotFound(format!("incoming swap {}", swap_uuid)));
        };

        if swap.htlc.is_none() {
            let result = swap.fulfill_full_debt(store).await?;
            self.service
                .fulfill_with_preimage(swap_uuid, &PreimageRequest { preimage: result.preimage })
                .await?;
        } else {
            let user_key = self.wallet.base_private_key().await?;
            let muun_key = self.wallet.base_muun_key().await?;
            let (data, real_time) = futures::try_join!(
                self.service.fetch_fulfillment_data(swap_uuid),
                self.service.fetch_real_time_data(),
            )?;

            let fulfilled = swap
                .fulfill(&data, &user_key, &muun_key, store, real_time.current_block_height)
                .await;
            let result = match fulfilled {
                Ok(result) => result,
                Err(e) => {
                    operation.incoming_swap = Some(swap);
                    self.operations.store(&operation).await?;
                    return Err(e);
                }
            };

            if let Some(tx) = &result.fulfillment_tx {
                let request = FulfillmentPushRequest {
                    fulfillment_tx_hex: hex::encode(tx),
                };
                self.service
                    .push_fulfillment_transaction(swap_uuid, &request)
                    .await?;
            }
        }

        log::info!("Fulfilled incoming swap {}", swap_uuid);
        operation.incoming_swap = Some(swap);
        self.operations.store(&operation).await?;
        Ok(operation)
    }

    /// Top up unused invoice secrets, registering them before they are stored.
    ///
    /// Returns how many were added.
    pub async fn refresh_invoice_secrets(&self) -> Result<usize> {
        let store = self.invoice_secrets()?;
        let unused = store.count_unused().await?;
        let pair = self.wallet.base_key_pair().await?;

        let generated = generate_invoice_secrets(pair.user(), pair.muun(), unused)?;
        if generated.is_empty() {
            return Ok(0);
        }

        let registrations: Vec<InvoiceRegistration> =
            generated.iter().map(InvoiceRegistration::from).collect();
        self.service.register_invoices(&registrations).await?;

        let secrets: Vec<_> = generated.into_iter().map(|g| g.secrets).collect();
        store.store(&secrets).await?;

        log::debug!("Registered {} invoice secrets", secrets.len());
        Ok(secrets.len())
    }

    /// Encode an invoice over the oldest unused secrets.
    pub async fn create_invoice(&self, options: &InvoiceOptions) -> Result<String> {
        let store = self.invoice_secrets()?;
        let mut secrets = match store.find_first_unused().await? {
            Some(secrets) => secrets,
            None => {
                self.refresh_invoice_secrets().await?;
                store
                    .find_first_unused()
                    .await?
                    .ok_or_else(|| Error::Storage("no unused invoice secrets".to_string()))?
            }
        };

        let user_key = self.wallet.base_private_key().await?;
        let invoice = build_invoice(&secrets, &user_key, options, self.config.network)?;

        let metadata = OperationMetadata {
            invoice: Some(invoice.clone()),
            ..OperationMetadata::with_description(options.description.clone())
        };
        secrets.state = InvoiceState::Used;
        secrets.used_at = Some(OffsetDateTime::now_utc());
        secrets.amount_sat = options.amount_msat.unwrap_or(0) / 1000;
        secrets.metadata = Some(encrypt_for_self(&metadata, &user_key)?);
        store.save(&secrets).await?;

        Ok(invoice)
    }

    /// Fetch the size vector and store it unless a newer one is already stored.
    pub async fn refresh_size_vector(&self) -> Result<Reconciliation> {
        let nts = self.service.fetch_next_transaction_size().await?;
        self.size_vector
            .reconcile_and_store(nts, WriteSite::PeriodicFetch)
            .await
    }

    pub async fn update_operation_status(
        &self,
        hid: u64,
        confirmations: u32,
        hash: Option<&str>,
        status: OperationStatus,
    ) -> Result<()> {
        self.operations
            .update_status(hid, confirmations, hash, status)
            .await
    }

    /// Readable description and invoice of `operation`.
    pub async fn operation_metadata(
        &self,
        operation: &Operation,
    ) -> Result<Option<OperationMetadata>> {
        let user_key = self.wallet.base_private_key().await?;
        Ok(decrypt_operation_metadata(operation, &user_key))
    }

    fn build_operation(
        &self,
        prepared: &PreparedPayment,
        user_key: &PrivateKey,
    ) -> Result<(Operation, String)> {
        let network = self.config.network;
        let mut metadata = OperationMetadata::with_description(prepared.description.clone());

        let (mut operation, destination, contact_key) = match &prepared.intent {
            PaymentIntent::ToAddress { address } => {
                let operation = Operation::new_outgoing(prepared, Some(address.clone()));
                (operation, address.clone(), None)
            }
            PaymentIntent::ToContact { contact } => {
                let address = contact.next_address(network)?;
                let mut operation =
                    Operation::new_outgoing(prepared, Some(address.address.clone()));
                operation.is_external = false;
                operation.receiver_address_derivation_path = Some(address.derivation_path.clone());
                (operation, address.address, Some(contact.public_key(network)?))
            }
            PaymentIntent::ToLnInvoice { invoice, swap } => {
                metadata.invoice = Some(invoice.clone());
                let operation = Operation::new_outgoing(prepared, None);
                (operation, swap.funding_output.output_address.clone(), None)
            }
        };

        operation.outpoints = prepared.outpoints.clone();
        operation.sender_metadata = Some(encrypt_for_self(&metadata, user_key)?);
        if let Some(contact_key) = contact_key {
            operation.receiver_metadata =
                Some(encrypt_for_contact(&metadata, user_key, &contact_key)?);
        }

        Ok((operation, destination))
    }

    /// Alternatives are only worth building for swaps that wait on no confirmations.
    fn alternative_count(&self, prepared: &PreparedPayment) -> usize {
        match &prepared.swap {
            Some(swap) if swap.funding_output.confirmations_needed == 0 => {
                let quoted = swap.max_alternative_transactions as usize;
                quoted.min(self.config.max_alternative_transactions)
            }
            _ => 0,
        }
    }

    async fn sign(
        &self,
        created: &OperationCreated,
        nonces: NonceBundle,
        expectations: &SigningExpectations,
        user_key: &PrivateKey,
        muun_key: &PublicKey,
    ) -> Result<SignedTransactions> {
        if created.alternative_transactions.len() > nonces.alternatives.len() {
            return Err(Error::InvalidTransaction(format!(
                "backend sent {} alternatives but only {} nonce sets were requested",
                created.alternative_transactions.len(),
                nonces.alternatives.len()
            )));
        }

        let skeleton = &created.partially_signed_transaction;
        let mut primary = PartiallySignedTransaction::new(
            &skeleton.hex_transaction,
            skeleton.inputs.clone(),
            nonces.primary,
        )?;
        self.resolve_secrets(&mut primary).await?;

        let mut alternatives = Vec::with_capacity(created.alternative_transactions.len());
        for (skeleton, nonces) in created.alternative_transactions.iter().zip(nonces.alternatives) {
            let mut alternative = PartiallySignedTransaction::new(
                &skeleton.hex_transaction,
                skeleton.inputs.clone(),
                nonces,
            )?;
            self.resolve_secrets(&mut alternative).await?;
            alternatives.push(alternative);
        }

        sign_with_alternatives(primary, alternatives, expectations, user_key, muun_key)
    }

    async fn resolve_secrets(&self, pst: &mut PartiallySignedTransaction) -> Result<()> {
        let spends_incoming_swap = pst.inputs().iter().any(|input| input.incoming_swap.is_some());
        if !spends_incoming_swap {
            return Ok(());
        }
        pst.resolve_invoice_secrets(self.invoice_secrets()?).await
    }

    async fn store_and_notify(&self, operation: &Operation) -> Result<()> {
        self.operations.store(operation).await?;
        if operation.is_failed() {
            self.notifications.on_operation_failed(operation);
        }
        Ok(())
    }

    fn invoice_secrets(&self) -> Result<&dyn InvoiceSecretsStorage> {
        self.invoice_secrets
            .as_deref()
            .ok_or_else(|| Error::Storage("no invoice secrets storage configured".to_string()))
    }
}

/// Carry the stored progress of an outgoing swap over to the backend's copy, then advance it.
///
/// The backend does not track swap state, so its copy always reads `Created`.
fn advance_swap(operation: &mut Operation, previous: Option<&Operation>) -> Result<()> {
    let confirmations = operation.confirmations;
    let status = operation.status;
    let broadcast = operation.hash.is_some();
    let Some(swap) = operation.swap.as_mut() else {
        return Ok(());
    };

    let known = previous
        .and_then(|previous| previous.swap.as_ref())
        .filter(|known| known.houston_uuid == swap.houston_uuid);
    if let Some(known) = known {
        swap.state = known.state;
        swap.payed_at = swap.payed_at.or(known.payed_at);
    } else if broadcast && !swap.is_lend() && swap.state == SwapState::Created {
        // First sight of a swap funded elsewhere, e.g. before a restore.
        swap.apply(SwapEvent::FundingBroadcast)?;
    }

    let preimage = swap
        .preimage
        .take()
        .or_else(|| known.and_then(|known| known.preimage.clone()));
    swap.apply_payment_info(preimage.as_deref(), confirmations)?;

    let event = match (status, swap.state) {
        (OperationStatus::SwapExpired, SwapState::FundingBroadcast) => Some(SwapEvent::Expired),
        (
            OperationStatus::SwapFailed,
            SwapState::Created | SwapState::Confirmed | SwapState::Expired,
        ) => Some(SwapEvent::Failed),
        _ => None,
    };
    if let Some(event) = event {
        let state = swap.apply(event)?;
        log::info!("Swap {} is now {:?}", swap.houston_uuid, state);
    }

    Ok(())
}
