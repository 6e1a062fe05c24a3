//! The processor and settlement loops that drive every message through its
//! lifecycle.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::outbox::Outbox;
use crate::config::ChainTarget;
use crate::factory::MessageFactory;
use crate::listener::EventHandler;
use crate::monitor::{LifecycleEvent, Monitor};
use crate::resilience::{retry_delay, ErrorHandler};
use crate::tx_manager::{ConfirmationReport, TransactionManager};
use crate::types::{MessageStatus, RelayMessage, SourceEvent};
use crate::verify::PayloadSigner;
use crate::{Error, ErrorClass, Result};

/// State shared by the processor, the settlement loop and the ingestion path.
/// Every status change goes through [`RelayCore::transition`].
pub(crate) struct RelayCore {
    pub outbox: Arc<Outbox>,
    pub tx: Arc<TransactionManager>,
    pub monitor: Arc<Monitor>,
    pub handler: Arc<ErrorHandler>,
    pub factory: MessageFactory,
    pub signer: Arc<dyn PayloadSigner>,
    pub chains: Vec<ChainTarget>,
    pub max_retries: u32,
    pub queue: mpsc::Sender<String>,
    /// Bounds concurrent submissions per destination.
    pub slots: HashMap<String, Arc<Semaphore>>,
    pub token: CancellationToken,
    pub tracker: TaskTracker,
}

impl RelayCore {
    /// Fans `event` out into one message per enabled target and queues the
    /// ones not seen before. Returns the ids queued.
    pub async fn ingest(&self, event: &SourceEvent) -> Vec<String> {
        let messages = self.factory.create_messages(event, &self.chains);
        let mut queued = Vec::with_capacity(messages.len());
        for message in messages {
            let id = message.id.clone();
            if self.enqueue(message).await {
                queued.push(id);
            }
        }
        queued
    }

    /// Records `message` in the outbox and queues it for submission. Returns
    /// false for duplicates.
    pub async fn enqueue(&self, message: RelayMessage) -> bool {
        let id = message.id.clone();
        let chain = message.target_chain.clone();
        let kind = message.kind;
        if !self.outbox.insert(message) {
            debug!(message_id = %id, chain = %chain, "duplicate message discarded");
            return false;
        }

        info!(message_id = %id, chain = %chain, kind = %kind, "message queued");
        self.monitor.record(LifecycleEvent::transition(
            &id,
            &chain,
            kind,
            MessageStatus::Pending,
            Some("created".to_string()),
        ));
        self.monitor.set_backlog(self.outbox.backlog());
        self.requeue(id).await;
        true
    }

    async fn requeue(&self, id: String) {
        tokio::select! {
            _ = self.token.cancelled() => {
                debug!(message_id = %id, "relay stopping, message left pending");
            }
            sent = self.queue.send(id.clone()) => {
                if let Err(e) = sent {
                    warn!(message_id = %e.0, "processing queue closed, message left pending");
                }
            }
        }
    }

    /// Consumes queued ids until cancelled. Each message is processed on its
    /// own task so that destinations proceed in parallel.
    pub async fn run_processor(self: Arc<Self>, mut queue: mpsc::Receiver<String>) {
        info!("processor started");
        loop {
            let id = tokio::select! {
                _ = self.token.cancelled() => break,
                id = queue.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };
            let core = self.clone();
            self.tracker.spawn(async move { core.process(id).await });
        }
        debug!("processor exited");
    }

    /// Applies confirmation reports until cancelled.
    pub async fn run_settlement(self: Arc<Self>, mut outcomes: mpsc::Receiver<ConfirmationReport>) {
        loop {
            let report = tokio::select! {
                _ = self.token.cancelled() => break,
                report = outcomes.recv() => match report {
                    Some(report) => report,
                    None => break,
                },
            };
            self.settle(report);
        }
        debug!("settlement loop exited");
    }

    async fn process(self: Arc<Self>, id: String) {
        let Some(message) = self.outbox.claim(&id) else {
            debug!(message_id = %id, "message no longer pending, skipping");
            return;
        };

        let permit = match self.slots.get(&message.target_chain).cloned() {
            Some(slots) => tokio::select! {
                _ = self.token.cancelled() => {
                    self.outbox.release(&id);
                    return;
                }
                permit = slots.acquire_owned() => permit.ok(),
            },
            None => None,
        };

        self.monitor.record(LifecycleEvent::attempt(
            &message.id,
            &message.target_chain,
            message.kind,
            message.retry_count,
        ));

        let result = match self.validate(&message) {
            Ok(()) => {
                let operation = format!("submit:{}", message.target_chain);
                let submission = async {
                    tokio::select! {
                        _ = self.token.cancelled() => Err(Error::Cancelled),
                        result = self.tx.submit(&message) => result,
                    }
                };
                self.handler.run_guarded(&operation, submission).await
            }
            Err(e) => Err(e),
        };
        drop(permit);

        match result {
            Ok(tx_hash) => {
                self.transition(&message, MessageStatus::Sent, None, |m| {
                    m.tx_hash = Some(tx_hash);
                    m.last_error = None;
                });
            }
            Err(err) => self.fail(&message, err),
        }
    }

    /// Checks a message before it is handed to the transaction manager.
    pub fn validate(&self, message: &RelayMessage) -> Result<()> {
        if message.payload.is_empty() {
            return Err(Error::Validation(format!("message {} has an empty payload", message.id)));
        }
        if message.signature.is_empty() {
            return Err(Error::Validation(format!("message {} is unsigned", message.id)));
        }
        self.signer
            .verify(&message.payload, &message.signature)
            .map_err(|e| match e {
                Error::Validation(_) => e,
                other => Error::Validation(other.to_string()),
            })?;
        if !self
            .chains
            .iter()
            .any(|c| c.id == message.target_chain && c.enabled)
        {
            return Err(Error::Validation(format!(
                "target chain {} is not configured or disabled",
                message.target_chain
            )));
        }
        Ok(())
    }

    fn settle(self: &Arc<Self>, report: ConfirmationReport) {
        let Some(message) = self.outbox.get(&report.message_id) else {
            warn!(message_id = %report.message_id, tx_hash = %report.tx_hash, "confirmation for unknown message");
            return;
        };
        if message.tx_hash.as_deref() != Some(report.tx_hash.as_str()) {
            debug!(
                message_id = %report.message_id,
                tx_hash = %report.tx_hash,
                "confirmation for a superseded transaction ignored"
            );
            return;
        }

        match report.error() {
            None => {
                self.monitor.record(LifecycleEvent::confirmation(
                    &message.id,
                    &message.target_chain,
                    message.kind,
                    &report.tx_hash,
                    report.latency,
                ));
                self.transition(&message, MessageStatus::Confirmed, None, |m| m.last_error = None);
            }
            Some(err) => self.fail(&message, err),
        }
    }

    /// Drives the state machine from a failed attempt or settlement.
    fn fail(self: &Arc<Self>, message: &RelayMessage, err: Error) {
        let id = message.id.as_str();
        match err.class() {
            ErrorClass::Cancelled => {
                debug!(message_id = %id, "submission cancelled, message left pending");
                self.outbox.release(id);
            }
            ErrorClass::BreakerOpen => {
                // not the message's fault: no retry is consumed
                debug!(message_id = %id, chain = %message.target_chain, error = %err, "destination isolated, deferring");
                self.outbox.release(id);
                self.monitor.record(LifecycleEvent::error(id, &message.target_chain, message.kind, &err));
                let delay = self.handler.policy().max_delay;
                self.schedule(id.to_string(), delay, None);
            }
            ErrorClass::Permanent => {
                error!(message_id = %id, chain = %message.target_chain, error = %err, "message failed permanently");
                self.monitor.record(LifecycleEvent::error(id, &message.target_chain, message.kind, &err));
                let reason = err.to_string();
                self.transition(message, MessageStatus::Failed, Some(reason.clone()), |m| {
                    m.last_error = Some(reason)
                });
            }
            ErrorClass::Transient => {
                self.monitor.record(LifecycleEvent::error(id, &message.target_chain, message.kind, &err));
                let retry_count = self.outbox.get(id).map_or(message.retry_count, |m| m.retry_count);
                if retry_count >= self.max_retries {
                    error!(
                        message_id = %id,
                        chain = %message.target_chain,
                        attempts = retry_count + 1,
                        error = %err,
                        "message failed, retries exhausted"
                    );
                    let reason = format!("retries exhausted after {} attempts: {}", retry_count + 1, err);
                    self.transition(message, MessageStatus::Failed, Some(reason.clone()), |m| {
                        m.last_error = Some(reason)
                    });
                    return;
                }

                let reason = err.to_string();
                let retrying = self.transition(message, MessageStatus::Retrying, Some(reason.clone()), |m| {
                    m.retry_count += 1;
                    m.last_error = Some(reason);
                });
                if let Some(retrying) = retrying {
                    let delay = retry_delay(self.handler.policy(), retrying.retry_count - 1, &err);
                    warn!(
                        message_id = %id,
                        chain = %message.target_chain,
                        retry_count = retrying.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "message scheduled for retry"
                    );
                    self.schedule(id.to_string(), delay, Some(retrying));
                }
            }
        }
    }

    /// Re-queues `id` after `delay`. A `Retrying` message is moved back to
    /// `Pending` first; on cancellation it is moved back without re-queueing.
    fn schedule(self: &Arc<Self>, id: String, delay: std::time::Duration, retrying: Option<RelayMessage>) {
        let core = self.clone();
        self.tracker.spawn(async move {
            let cancelled = tokio::select! {
                _ = core.token.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if let Some(message) = retrying {
                if core
                    .transition(&message, MessageStatus::Pending, Some("retry".to_string()), |m| {
                        m.tx_hash = None
                    })
                    .is_none()
                {
                    return;
                }
            }
            if !cancelled {
                core.requeue(id).await;
            }
        });
    }

    /// Applies a status change and reports it to the monitor. Rejected
    /// transitions are logged and return `None`.
    fn transition(
        &self,
        message: &RelayMessage,
        next: MessageStatus,
        reason: Option<String>,
        update: impl FnOnce(&mut RelayMessage),
    ) -> Option<RelayMessage> {
        match self.outbox.transition(&message.id, next, update) {
            Ok(updated) => {
                debug!(
                    message_id = %updated.id,
                    chain = %updated.target_chain,
                    status = %next,
                    retry_count = updated.retry_count,
                    "message transition"
                );
                if next == MessageStatus::Confirmed {
                    info!(
                        message_id = %updated.id,
                        chain = %updated.target_chain,
                        tx_hash = updated.tx_hash.as_deref().unwrap_or_default(),
                        "message confirmed"
                    );
                }
                let mut event =
                    LifecycleEvent::transition(&updated.id, &updated.target_chain, updated.kind, next, reason);
                if next.is_terminal() {
                    let elapsed = (Utc::now() - updated.created_at).to_std().unwrap_or_default();
                    event = event.with_latency(elapsed);
                }
                self.monitor.set_backlog(self.outbox.backlog());
                self.monitor.record(event);
                Some(updated)
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "state transition rejected");
                None
            }
        }
    }
}

#[async_trait]
impl EventHandler for RelayCore {
    async fn on_event(&self, event: SourceEvent) {
        let queued = self.ingest(&event).await;
        debug!(event = event.name(), queued = queued.len(), "source event ingested");
    }
}
