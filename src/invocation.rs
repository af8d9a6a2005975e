//! Tool registration and invocation.
//!
//! A submitted call runs on its own task and reports through a bounded
//! event channel: zero or more progress events, then exactly one terminal
//! event. Producers await channel capacity, so a slow consumer slows the
//! tool down instead of growing an unbounded buffer. A call whose stream
//! is never claimed is evicted and cancelled after a retention window,
//! keeping the live-call table bounded.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    schema::{CallEvent, CallId, ProgressEvent, Tool, ToolCall},
};

/// Buffered events per call before producers block.
const EVENT_BUFFER: usize = 64;

/// How long a call's event stream waits to be claimed before the call is
/// evicted. Bounds the live-call table when a caller submits and never
/// subscribes; eviction cancels the call and drops its buffered events.
const UNCLAIMED_STREAM_TTL: Duration = Duration::from_secs(60);

/// A tool the server can execute.
///
/// `call` receives the authorized invocation and a progress handle; it
/// returns the final result value or an error. Cancellation is delivered
/// by aborting the surrounding task, so handlers need no explicit
/// cooperation beyond holding `.await` points.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> Tool;

    async fn call(&self, call: &ToolCall, progress: ProgressSender) -> Result<Value>;
}

/// The set of tools the server advertises. Built once at startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its descriptor name. A later
    /// registration with the same name replaces the earlier one.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.descriptor().name;
        if self.tools.insert(name.clone(), handler).is_some() {
            warn!(tool = %name, "replacing previously registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.values().map(|h| h.descriptor()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

/// Progress handle given to a running tool.
///
/// Sequence numbers are per call, strictly increasing from 1. Sending
/// awaits channel capacity; it fails only once the call's stream is gone.
#[derive(Clone)]
pub struct ProgressSender {
    call_id: CallId,
    sequence: Arc<AtomicU64>,
    tx: mpsc::Sender<CallEvent>,
}

impl ProgressSender {
    pub async fn send(&self, payload: Value) -> Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx
            .send(CallEvent::Progress(ProgressEvent {
                call_id: self.call_id,
                sequence,
                payload,
            }))
            .await
            .map_err(|_| Error::InternalError("call event stream closed".into()))
    }
}

struct ActiveCall {
    cancel: CancellationToken,
    receiver: Option<mpsc::Receiver<CallEvent>>,
    done: Arc<AtomicBool>,
    claimed: CancellationToken,
}

/// Runs authorized calls and owns their event streams.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    calls: Arc<DashMap<CallId, ActiveCall>>,
    stream_ttl: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self::with_stream_ttl(registry, UNCLAIMED_STREAM_TTL)
    }

    /// Dispatcher with a custom unclaimed-stream retention window.
    pub fn with_stream_ttl(registry: Arc<ToolRegistry>, stream_ttl: Duration) -> Self {
        Self {
            registry,
            calls: Arc::new(DashMap::new()),
            stream_ttl,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Starts a call on its own task and returns its id.
    ///
    /// Fails with [`Error::ToolNotFound`] before spawning anything if the
    /// tool name is not registered.
    pub fn submit(&self, call: ToolCall) -> Result<CallId> {
        let handler = self
            .registry
            .get(&call.tool_name)
            .ok_or_else(|| Error::ToolNotFound(call.tool_name.clone()))?;

        let call_id = call.call_id;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let done = Arc::new(AtomicBool::new(false));
        let claimed = CancellationToken::new();

        self.calls.insert(
            call_id,
            ActiveCall {
                cancel: cancel.clone(),
                receiver: Some(rx),
                done: done.clone(),
                claimed: claimed.clone(),
            },
        );

        // Evict calls nobody subscribes to within the retention window.
        // Removal drops the channel, so a producer blocked on a full
        // buffer unwinds, and the cancel token stops the rest of the call.
        let janitor_calls = self.calls.clone();
        let janitor_cancel = cancel.clone();
        let stream_ttl = self.stream_ttl;
        tokio::spawn(async move {
            tokio::select! {
                _ = claimed.cancelled() => {}
                _ = tokio::time::sleep(stream_ttl) => {
                    if janitor_calls.remove(&call_id).is_some() {
                        warn!(%call_id, "evicting call with unclaimed event stream");
                        janitor_cancel.cancel();
                    }
                }
            }
        });

        let progress = ProgressSender {
            call_id,
            sequence: Arc::new(AtomicU64::new(0)),
            tx: tx.clone(),
        };
        let calls = self.calls.clone();

        tokio::spawn(async move {
            debug!(%call_id, tool = %call.tool_name, subject = %call.caller_claims.subject,
                "tool call started");

            let terminal = tokio::select! {
                _ = cancel.cancelled() => CallEvent::Cancelled { call_id },
                outcome = handler.call(&call, progress) => match outcome {
                    Ok(value) => CallEvent::Result { call_id, value },
                    Err(e) => {
                        warn!(%call_id, error = %e, "tool call failed");
                        CallEvent::Error { call_id, message: e.to_string() }
                    }
                },
            };

            done.store(true, Ordering::SeqCst);
            // Subscriber may be gone; the terminal event is then dropped
            // along with the stream.
            let _ = tx.send(terminal).await;
            // Keep the entry (and its buffered events) for a subscriber
            // that has not attached yet; drop it once one has.
            calls.remove_if(&call_id, |_, active| active.receiver.is_none());
        });

        Ok(call_id)
    }

    /// Takes the call's event stream. Each call's stream can be taken
    /// exactly once, and must be taken within the retention window or the
    /// call is evicted.
    pub fn subscribe(&self, call_id: CallId) -> Result<mpsc::Receiver<CallEvent>> {
        let receiver = {
            let mut entry = self
                .calls
                .get_mut(&call_id)
                .ok_or_else(|| Error::InternalError(format!("no such call: {call_id}")))?;
            entry.claimed.cancel();
            entry.receiver.take()
        };
        let receiver = receiver
            .ok_or_else(|| Error::InternalError(format!("call {call_id} already subscribed")))?;
        // With the task already finished the entry has no further use.
        self.calls
            .remove_if(&call_id, |_, active| active.done.load(Ordering::SeqCst));
        Ok(receiver)
    }

    /// The call's events as a stream that ends after the terminal event.
    pub fn subscribe_stream(
        &self,
        call_id: CallId,
    ) -> Result<impl Stream<Item = CallEvent> + Send> {
        let mut receiver = self.subscribe(call_id)?;
        Ok(async_stream::stream! {
            while let Some(event) = receiver.recv().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
        })
    }

    /// Requests cancellation. Returns true if the call was still running;
    /// cancelling an unknown or finished call is a no-op.
    pub fn cancel(&self, call_id: CallId) -> bool {
        match self.calls.get(&call_id) {
            Some(active) if !active.done.load(Ordering::SeqCst) => {
                debug!(%call_id, "cancelling tool call");
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Number of calls with live state, finished-but-undelivered included.
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }
}
