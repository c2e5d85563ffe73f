//! [`atmosphere_router::IntentDispatcher`] backed by the live connection
//! supervisor (§4.8 step 7: heartbeat-then-dispatch over the active
//! transport).

use atmosphere_core::{IntentRequest, IntentResponse, NodeId, RequestId};
use atmosphere_net::{Frame, FrameKind};
use atmosphere_router::{IntentDispatcher, Result as RouterResult, RouterError};
use atmosphere_supervisor::ConnectionSupervisor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Holds the oneshot waiters for in-flight intent requests, so whichever
/// task demuxes inbound `FrameKind::IntentResponse` frames off the wire can
/// hand a response back to the router call that's awaiting it.
#[derive(Default)]
pub struct IntentWaiters {
    waiters: Mutex<HashMap<RequestId, oneshot::Sender<IntentResponse>>>,
}

impl IntentWaiters {
    pub fn register(&self, request_id: RequestId) -> oneshot::Receiver<IntentResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id, tx);
        rx
    }

    /// Called from the frame-receive loop once an `IntentResponse` arrives.
    pub fn complete(&self, response: IntentResponse) {
        if let Some(tx) = self.waiters.lock().remove(&response.request_id) {
            let _ = tx.send(response);
        }
    }

    pub fn cancel(&self, request_id: &RequestId) {
        self.waiters.lock().remove(request_id);
    }
}

pub struct SupervisorDispatcher {
    supervisor: Arc<ConnectionSupervisor>,
    waiters: Arc<IntentWaiters>,
}

impl SupervisorDispatcher {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self { supervisor, waiters: Arc::new(IntentWaiters::default()) }
    }

    /// Shared with `main.rs`'s event loop so inbound `IntentResponse` frames
    /// can complete the matching in-flight [`dispatch`] call.
    pub fn waiters(&self) -> Arc<IntentWaiters> {
        self.waiters.clone()
    }
}

#[async_trait::async_trait]
impl IntentDispatcher for SupervisorDispatcher {
    async fn heartbeat_check(&self, node_id: NodeId, timeout: Duration) -> RouterResult<()> {
        let healthy = self
            .supervisor
            .peers()
            .snapshot(&node_id)
            .map(|state| state.active_transport.is_some())
            .unwrap_or(false);
        if healthy {
            return Ok(());
        }
        tokio::time::timeout(timeout, self.supervisor.probe_peer(node_id))
            .await
            .map_err(|_| RouterError::Dispatch(format!("heartbeat check to {node_id} timed out")))?
            .map_err(|err| RouterError::Dispatch(err.to_string()))
    }

    async fn dispatch(&self, node_id: NodeId, request: IntentRequest, deadline: u64) -> RouterResult<IntentResponse> {
        let request_id = request.request_id;
        let rx = self.waiters.register(request_id);

        let frame = Frame::encode(FrameKind::IntentRequest, &request)
            .map_err(|err| RouterError::Dispatch(err.to_string()))?;
        if let Err(err) = self.supervisor.send(node_id, request_id, frame).await {
            self.waiters.cancel(&request_id);
            return Err(RouterError::Dispatch(err.to_string()));
        }

        let now = now_unix_ms();
        let budget = Duration::from_millis(deadline.saturating_sub(now));
        match tokio::time::timeout(budget, rx).await {
            Ok(Ok(response)) => {
                self.supervisor.complete(node_id, request_id);
                Ok(response)
            }
            _ => {
                self.waiters.cancel(&request_id);
                Err(RouterError::Dispatch(format!("intent {request_id} timed out waiting on {node_id}")))
            }
        }
    }
}
