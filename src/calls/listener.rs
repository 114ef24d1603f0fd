//! Incoming-call listener.
//!
//! A standing subscription owned by the controller that surfaces each new
//! call record addressed to the local user exactly once. If a call arrives
//! while another one is active, the listener answers it with `Busy` instead
//! of surfacing it.

use std::collections::HashSet;
use std::sync::Arc;

use log::{info, warn};
use tokio::task::JoinHandle;

use crate::calls::controller::CallController;
use crate::calls::record::CallStatus;
use crate::store::CallPatch;
use crate::types::CallId;

pub(crate) fn spawn(controller: Arc<CallController>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sub = match controller
            .store
            .watch_incoming(&controller.identity.user_id)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!("Incoming-call listener failed to subscribe: {}", e);
                return;
            }
        };

        // The store already deduplicates adds, but a surfaced record must
        // never re-fire even across store implementations.
        let mut seen: HashSet<CallId> = HashSet::new();

        while let Some(mut record) = sub.recv().await {
            if !seen.insert(record.call_id.clone()) {
                continue;
            }
            if let Err(e) = record.validate() {
                warn!(
                    "Ignoring malformed incoming call record {}: {}",
                    record.call_id, e
                );
                continue;
            }
            if controller.call_state().is_in_call() {
                info!(
                    "Already in a call, answering call {} from {} with busy",
                    record.call_id, record.caller_id
                );
                if let Err(e) = controller
                    .store
                    .update_call(&record.call_id, CallPatch::Status(CallStatus::Busy))
                    .await
                {
                    warn!("Busy write failed for call {}: {}", record.call_id, e);
                }
                controller.schedule_delete(record.call_id.clone());
                continue;
            }
            info!(
                "Incoming {} call {} from {}",
                record.call_type, record.call_id, record.caller_id
            );
            controller.notify_call_received(record).await;
        }
    })
}
