//! Relay core: wires the listener, factory, processor, transaction manager and
//! monitor together and supervises their tasks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::chain_adapter::{
    build_clients, DefaultLedgerClientFactory, LedgerClientFactory, LedgerClients, SourceLedger,
};
use crate::config::Config;
use crate::factory::MessageFactory;
use crate::listener::SourceEventListener;
use crate::monitor::{Alert, HealthReport, LedgerHealthCheck, LifecycleEvent, Monitor};
use crate::resilience::{BreakerRegistry, BreakerStats, ErrorHandler, RetryPolicy};
use crate::tx_manager::{ConfirmationReport, PendingSubmission, TransactionManager};
use crate::types::{RelayMessage, RelayerMetrics, RelayerStatus, SourceEvent};
use crate::verify::{PayloadSigner, RelaySigner};
use crate::{Error, Result};

pub mod outbox;
mod processor;

pub use outbox::Outbox;
use processor::RelayCore;

type Receivers = (mpsc::Receiver<String>, mpsc::Receiver<ConfirmationReport>);

pub struct Relayer {
    config: Config,
    core: Arc<RelayCore>,
    listener: Arc<SourceEventListener>,
    token: CancellationToken,
    tracker: TaskTracker,
    receivers: Mutex<Option<Receivers>>,
    running: AtomicBool,
}

impl Relayer {
    /// Builds a relayer with the default ledger adapters.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_factory(config, &DefaultLedgerClientFactory)
    }

    pub fn with_factory(config: Config, factory: &dyn LedgerClientFactory) -> Result<Self> {
        let clients = build_clients(&config, factory)?;
        let source = factory.create_source(&config.source)?;
        Self::with_clients(config, clients, source)
    }

    /// Builds a relayer over already constructed ledger clients.
    pub fn with_clients(config: Config, clients: LedgerClients, source: Arc<dyn SourceLedger>) -> Result<Self> {
        config.validate()?;
        for chain in config.enabled_chains() {
            if !clients.contains_key(&chain.id) {
                return Err(Error::Config(format!("No ledger client for chain {}", chain.id)));
            }
        }

        let signer: Arc<dyn PayloadSigner> = Arc::new(RelaySigner::from_hex(&config.relayer.private_key)?);
        let breakers = Arc::new(BreakerRegistry::new(&config.circuit_breaker));
        let handler = Arc::new(ErrorHandler::new(RetryPolicy::from_config(&config.retry), breakers.clone()));

        let monitor = Arc::new(Monitor::new(&config.monitor, breakers)?);
        for chain in config.enabled_chains() {
            if let Some(client) = clients.get(&chain.id) {
                monitor.add_health_check(Arc::new(LedgerHealthCheck::new(&chain.id, client.clone())));
            }
        }

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (queue_tx, queue_rx) = mpsc::channel(config.relayer.queue_capacity);
        let (outcome_tx, outcome_rx) = mpsc::channel(config.relayer.queue_capacity);

        let tx = Arc::new(TransactionManager::new(
            &config,
            clients,
            signer.clone(),
            handler.clone(),
            outcome_tx,
            token.child_token(),
            tracker.clone(),
        ));
        let slots = config
            .chains
            .iter()
            .map(|c| (c.id.clone(), Arc::new(Semaphore::new(config.relayer.max_in_flight_per_chain))))
            .collect::<HashMap<_, _>>();

        let core = Arc::new(RelayCore {
            outbox: Arc::new(Outbox::new(config.relayer.retain_terminal)),
            tx,
            monitor,
            handler: handler.clone(),
            factory: MessageFactory::new(signer.clone()),
            signer,
            chains: config.chains.clone(),
            max_retries: config.relayer.max_retries,
            queue: queue_tx,
            slots,
            token: token.clone(),
            tracker: tracker.clone(),
        });
        let listener = Arc::new(SourceEventListener::new(&config.source, source, handler));

        Ok(Self {
            config,
            core,
            listener,
            token,
            tracker,
            receivers: Mutex::new(Some((queue_rx, outcome_rx))),
            running: AtomicBool::new(false),
        })
    }

    /// Checks every enabled destination answers, then starts the listener,
    /// processor, settlement loop and monitor. A relayer runs once; it cannot
    /// be restarted after [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        for chain in self.config.enabled_chains() {
            let Some(client) = self.core.tx.client(&chain.id) else {
                continue;
            };
            let height = self
                .core
                .handler
                .handle_error(&self.token, &format!("block:{}", chain.id), || client.block_number())
                .await
                .map_err(|e| {
                    error!(chain = %chain.id, error = %e, "destination unreachable at startup");
                    e
                })?;
            info!(chain = %chain.id, height, "destination reachable");
        }

        let (queue, outcomes) = self
            .receivers
            .lock()
            .take()
            .ok_or_else(|| Error::Config("relayer has already been started".to_string()))?;

        info!(
            address = %self.core.tx.address(),
            chains = self.config.enabled_chains().count(),
            "starting relayer"
        );
        self.tracker.spawn(self.core.clone().run_processor(queue));
        self.tracker.spawn(self.core.clone().run_settlement(outcomes));
        self.core.monitor.start(&self.token, &self.tracker);
        self.listener.start(&self.token, &self.tracker, self.core.clone());

        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Cancels every task and waits for them to drain, bounded by
    /// `relayer.shutdown_timeout`.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping relayer");
        self.running.store(false, Ordering::SeqCst);
        self.listener.stop();
        self.token.cancel();
        self.tracker.close();

        let timeout = self.config.relayer.shutdown_timeout();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .map_err(|_| Error::Timeout(format!("relayer tasks did not stop within {:?}", timeout)))?;
        if !self.core.monitor.flush_notifications(timeout).await {
            warn!("alert notifications still running at shutdown");
        }
        info!("relayer stopped");
        Ok(())
    }

    /// Feeds an in-process event through the same fan-out as the listener.
    /// Returns the ids of newly queued messages.
    pub async fn submit_event(&self, event: SourceEvent) -> Vec<String> {
        self.core.ingest(&event).await
    }

    /// Queues an already built message. Returns false when its id is known.
    pub async fn enqueue(&self, message: RelayMessage) -> bool {
        self.core.enqueue(message).await
    }

    pub fn status(&self) -> RelayerStatus {
        RelayerStatus {
            running: self.running.load(Ordering::SeqCst),
            address: self.core.tx.address().to_string(),
        }
    }

    pub fn metrics(&self) -> RelayerMetrics {
        self.core.monitor.metrics()
    }

    pub fn message_status(&self, id: &str) -> Result<RelayMessage> {
        self.core
            .outbox
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))
    }

    pub fn messages(&self) -> Vec<RelayMessage> {
        self.core.outbox.messages()
    }

    pub fn backlog(&self) -> usize {
        self.core.outbox.backlog()
    }

    pub fn pending_submissions(&self) -> Vec<PendingSubmission> {
        self.core.tx.pending_submissions()
    }

    pub fn health(&self) -> HealthReport {
        self.core.monitor.health()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.core.monitor.alerts()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<LifecycleEvent> {
        self.core.monitor.recent_events(limit)
    }

    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.core.handler.breakers().stats()
    }

    pub fn source_checkpoint(&self) -> Option<u64> {
        self.listener.checkpoint()
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.core.monitor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::simulated::{InclusionMode, InjectedFailure};
    use crate::chain_adapter::{LedgerClient, SimulatedLedger};
    use crate::config::tests::{test_chain, test_config};
    use crate::types::{LoanDisbursementEvent, MessageStatus, RepaymentEvent};
    use std::time::Duration;

    struct Harness {
        relayer: Relayer,
        ledgers: HashMap<String, Arc<SimulatedLedger>>,
    }

    fn harness(config: Config) -> Harness {
        let ledgers: HashMap<_, _> = config
            .chains
            .iter()
            .map(|c| (c.id.clone(), Arc::new(SimulatedLedger::new(&c.id).with_auto_mine())))
            .collect();
        let clients: LedgerClients = ledgers
            .iter()
            .map(|(id, l)| (id.clone(), l.clone() as Arc<dyn LedgerClient>))
            .collect();
        let relayer = Relayer::with_clients(config, clients, Arc::new(SimulatedLedger::new("source"))).unwrap();
        Harness { relayer, ledgers }
    }

    fn repayment(token_id: u128) -> SourceEvent {
        SourceEvent::Repayment(RepaymentEvent {
            token_id,
            amount: 250,
            total_repaid: 250,
            payer: "0x1234567890123456789012345678901234567890".to_string(),
            timestamp: 1_700_000_000,
        })
    }

    async fn settle(relayer: &Relayer) {
        for _ in 0..3_000 {
            if relayer.backlog() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("messages did not settle: {:?}", relayer.messages());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_event_is_deduplicated() {
        let h = harness(test_config(vec![test_chain("base", 2)]));
        let first = h.relayer.submit_event(repayment(1)).await;
        let second = h.relayer.submit_event(repayment(1)).await;
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(h.relayer.messages().len(), 1);
        assert_eq!(h.relayer.message_status(&first[0]).unwrap().status, MessageStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_broadcast_failures_are_retried() {
        let h = harness(test_config(vec![test_chain("base", 2)]));
        h.ledgers["base"].inject_broadcast_failures(InjectedFailure::Network, 2);
        h.relayer.start().await.unwrap();

        let ids = h.relayer.submit_event(repayment(7)).await;
        settle(&h.relayer).await;

        let message = h.relayer.message_status(&ids[0]).unwrap();
        assert_eq!(message.status, MessageStatus::Confirmed);
        assert_eq!(message.retry_count, 2);
        assert_eq!(h.ledgers["base"].broadcasts().len(), 1);

        let metrics = h.relayer.metrics();
        assert_eq!(metrics.messages_processed, 3);
        assert_eq!(metrics.messages_confirmed, 1);
        h.relayer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_fails_message() {
        let h = harness(test_config(vec![test_chain("base", 2)]));
        h.ledgers["base"].inject_broadcast_failures(InjectedFailure::Network, 10);
        h.relayer.start().await.unwrap();

        let ids = h.relayer.submit_event(repayment(8)).await;
        settle(&h.relayer).await;

        let message = h.relayer.message_status(&ids[0]).unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.retry_count, 3);
        assert!(message.last_error.unwrap().contains("retries exhausted"));
        assert_eq!(h.relayer.metrics().messages_processed, 4);
        h.relayer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_is_terminal() {
        let h = harness(test_config(vec![test_chain("base", 2)]));
        h.ledgers["base"].queue_inclusions(InclusionMode::Revert, 1);
        h.relayer.start().await.unwrap();

        let ids = h.relayer.submit_event(repayment(9)).await;
        settle(&h.relayer).await;

        let message = h.relayer.message_status(&ids[0]).unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.retry_count, 0);
        assert!(message.tx_hash.is_some());
        h.relayer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_timeout_resubmits() {
        let h = harness(test_config(vec![test_chain("base", 2)]));
        h.ledgers["base"].queue_inclusions(InclusionMode::Drop, 1);
        h.relayer.start().await.unwrap();

        let ids = h.relayer.submit_event(repayment(10)).await;
        settle(&h.relayer).await;

        let message = h.relayer.message_status(&ids[0]).unwrap();
        assert_eq!(message.status, MessageStatus::Confirmed);
        assert_eq!(message.retry_count, 1);
        let broadcasts = h.ledgers["base"].broadcasts();
        assert_eq!(broadcasts.len(), 2);
        assert_eq!((broadcasts[0].nonce, broadcasts[1].nonce), (0, 0));
        h.relayer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_defers_without_consuming_retries() {
        let mut config = test_config(vec![test_chain("base", 2)]);
        config.circuit_breaker.max_failures = 1;
        config.circuit_breaker.reset_timeout = 5;
        let h = harness(config);
        h.ledgers["base"].inject_broadcast_failures(InjectedFailure::Network, 1);
        h.relayer.start().await.unwrap();

        let ids = h.relayer.submit_event(repayment(11)).await;
        settle(&h.relayer).await;

        let message = h.relayer.message_status(&ids[0]).unwrap();
        assert_eq!(message.status, MessageStatus::Confirmed);
        assert_eq!(message.retry_count, 1);
        let rejected: u64 = h.relayer.breaker_stats().iter().map(|s| s.rejected_count).sum();
        assert!(rejected > 0);
        h.relayer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_target_skipped_in_fan_out() {
        let mut disabled = test_chain("polygon", 2);
        disabled.enabled = false;
        let h = harness(test_config(vec![test_chain("base", 2), disabled]));
        h.relayer.start().await.unwrap();

        let ids = h
            .relayer
            .submit_event(SourceEvent::LoanDisbursement(LoanDisbursementEvent {
                token_id: 3,
                amount: 1000,
                merchant: "0x0987654321098765432109876543210987654321".to_string(),
                timestamp: 1_700_000_000,
            }))
            .await;
        assert_eq!(ids.len(), 1);
        settle(&h.relayer).await;
        assert!(h.ledgers["polygon"].broadcasts().is_empty());
        h.relayer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_destination_fails_start() {
        let h = harness(test_config(vec![test_chain("base", 2)]));
        h.ledgers["base"].set_unreachable(true);
        assert!(h.relayer.start().await.is_err());
        assert!(!h.relayer.status().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_and_stop() {
        let h = harness(test_config(vec![test_chain("base", 2)]));
        h.relayer.start().await.unwrap();
        let status = h.relayer.status();
        assert!(status.running);
        assert!(status.address.starts_with("0x"));

        h.relayer.stop().await.unwrap();
        assert!(!h.relayer.status().running);
        assert!(h.relayer.start().await.is_err());
    }
}
