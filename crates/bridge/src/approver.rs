//! Approvals answered by the UI process.

use async_trait::async_trait;
use kestrel_core::approval::{ApprovalDecision, ApprovalReply, ApprovalRequest, Approver};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Parks each approval request until a `tool_approval` command with the same
/// `call_id` arrives.
///
/// The UI learns the `call_id` from the `tool_approval_requested` event the
/// pipeline publishes just before asking.
#[derive(Default)]
pub struct ChannelApprover {
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalReply>>>,
}

impl ChannelApprover {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an answer. Returns `false` when nothing is waiting on `call_id`.
    pub fn resolve(&self, call_id: &str, decision: ApprovalDecision, note: Option<String>) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(call_id);
        let Some(waiter) = waiter else {
            warn!(call_id, "Approval for unknown or already answered call");
            return false;
        };
        let reply = ApprovalReply {
            decision,
            note: note.filter(|n| !n.trim().is_empty()),
        };
        waiter.send(reply).is_ok()
    }

    /// Deny every waiting request with `note`. Returns how many there were.
    pub fn deny_all(&self, note: &str) -> usize {
        let waiters: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let count = waiters.len();
        for (_, waiter) in waiters {
            let _ = waiter.send(ApprovalReply {
                decision: ApprovalDecision::Deny,
                note: Some(note.to_string()),
            });
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl Approver for ChannelApprover {
    async fn request(&self, request: ApprovalRequest) -> ApprovalReply {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.call_id.clone(), tx);
        debug!(call_id = %request.call_id, tool = %request.tool_name, "Waiting for UI approval");

        rx.await.unwrap_or_else(|_| ApprovalReply {
            decision: ApprovalDecision::Deny,
            note: Some("approval channel closed".into()),
        })
    }
}
