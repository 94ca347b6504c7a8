//! Best-effort signals to collaborators
//!
//! Two outbound channels, both fire-and-forget:
//! - Regeneration requests for the generation pipeline after an edit
//! - Usage events for accounting
//!
//! Sends use `try_send`: at most once, never blocking a mutation. A full or
//! closed channel drops the signal and logs a warning. Neither signal can
//! change the outcome of the operation that produced it.

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

/// Ask the generation pipeline to produce a new reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegenerationRequest {
    /// Conversation owner
    pub owner: String,
    /// Conversation to regenerate
    pub conversation_id: String,
    /// Sequence of the edited message; the reply follows it
    pub from_sequence: u64,
}

/// What happened to a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageKind {
    /// Conversation created
    Created,
    /// Tokens appended
    Appended,
    /// Message edited, later messages discarded
    Edited,
    /// Message and later messages deleted
    Deleted,
    /// Conversation discarded
    Discarded,
}

/// Accounting record for one committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    /// Conversation owner
    pub owner: String,
    /// Conversation mutated
    pub conversation_id: String,
    /// Mutation kind
    pub kind: UsageKind,
    /// Tokens added by the mutation
    pub tokens_added: u64,
    /// Tokens removed by the mutation
    pub tokens_removed: u64,
    /// Encoded size of the conversation after the mutation
    pub encrypted_bytes: u64,
}

/// Outbound collaborator channels. Either may be absent.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    regeneration: Option<mpsc::Sender<RegenerationRequest>>,
    usage: Option<mpsc::Sender<UsageEvent>>,
}

impl Notifier {
    /// Notifier with no channels; every signal is dropped.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Route regeneration requests to `sender`.
    #[must_use]
    pub fn with_regeneration(mut self, sender: mpsc::Sender<RegenerationRequest>) -> Self {
        self.regeneration = Some(sender);
        self
    }

    /// Route usage events to `sender`.
    #[must_use]
    pub fn with_usage(mut self, sender: mpsc::Sender<UsageEvent>) -> Self {
        self.usage = Some(sender);
        self
    }

    /// Send a regeneration request without blocking.
    pub fn request_regeneration(&self, request: RegenerationRequest) {
        let Some(sender) = &self.regeneration else {
            tracing::debug!(
                conversation_id = %request.conversation_id,
                "No regeneration channel, dropping request"
            );
            return;
        };

        match sender.try_send(request) {
            Ok(()) => {},
            Err(TrySendError::Full(request)) => {
                tracing::warn!(
                    conversation_id = %request.conversation_id,
                    from_sequence = request.from_sequence,
                    "Regeneration channel full, dropping request"
                );
            },
            Err(TrySendError::Closed(request)) => {
                tracing::warn!(
                    conversation_id = %request.conversation_id,
                    from_sequence = request.from_sequence,
                    "Regeneration channel closed, dropping request"
                );
            },
        }
    }

    /// Send a usage event without blocking.
    pub fn record_usage(&self, event: UsageEvent) {
        let Some(sender) = &self.usage else {
            return;
        };

        if let Err(e) = sender.try_send(event) {
            let (reason, event) = match e {
                TrySendError::Full(event) => ("full", event),
                TrySendError::Closed(event) => ("closed", event),
            };
            tracing::warn!(
                conversation_id = %event.conversation_id,
                kind = ?event.kind,
                reason,
                "Dropping usage event"
            );
        }
    }
}

/// Drain usage events into the log until every sender is gone.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_usage_logger(mut events: mpsc::Receiver<UsageEvent>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut logged = 0u64;
        while let Some(event) = events.recv().await {
            tracing::info!(
                owner = %event.owner,
                conversation_id = %event.conversation_id,
                kind = ?event.kind,
                tokens_added = event.tokens_added,
                tokens_removed = event.tokens_removed,
                encrypted_bytes = event.encrypted_bytes,
                "Usage"
            );
            logged += 1;
        }
        logged
    })
}
