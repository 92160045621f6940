//! Channel orchestrator: lifecycle, read loop, destroy propagation.
//!
//! An [`RpcChannel`] binds a transport endpoint to an exposed API tree,
//! spawns the read loop on construction, and hands out a path-accumulating
//! proxy to the peer's API. Destroy is idempotent: it signals the peer with
//! the bare `__DESTROY__` sentinel (best effort), closes every active
//! stream, drains the pending table with `ChannelDestroyed`, frees the
//! callback registry and releases the endpoint.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::ApiTree;
use crate::callback::CallbackRegistry;
use crate::codec::{self, CodecMode};
use crate::envelope::DESTROY_SENTINEL;
use crate::interceptor::{Interceptor, StateBag};
use crate::observe::{tracing_sink, Diagnostic, DiagnosticSink};
use crate::pending::PendingTable;
use crate::proxy::RemoteProxy;
use crate::stream::StreamManager;
use crate::transfer::{TransferEngine, TransferHandler};
use crate::transport::{Capabilities, Message, Transport};

/// Channel lifecycle. Operations in `Destroying`/`Destroyed` fail
/// immediately with `ChannelDestroyed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Initializing = 0,
    Running = 1,
    Destroying = 2,
    Destroyed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Initializing,
            1 => ChannelState::Running,
            2 => ChannelState::Destroying,
            _ => ChannelState::Destroyed,
        }
    }
}

/// Internal control messages, queued so synchronous contexts (stream drop)
/// can trigger asynchronous work.
#[derive(Debug)]
pub(crate) enum Control {
    CancelStream(String),
}

/// Shared state of one channel. Everything the dispatcher, proxy, streams
/// and callbacks touch hangs off this.
pub struct ChannelCore {
    weak: Weak<ChannelCore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) caps: Capabilities,
    pub(crate) mode: CodecMode,
    state: AtomicU8,
    pub(crate) api: RwLock<ApiTree>,
    pub(crate) pending: PendingTable,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) streams: StreamManager,
    pub(crate) transfers: TransferEngine,
    pub(crate) interceptors: Arc<Vec<Arc<dyn Interceptor>>>,
    pub(crate) conn_state: StateBag,
    pub(crate) diagnostics: DiagnosticSink,
    pub(crate) ctl: mpsc::UnboundedSender<Control>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Inbound request ids currently being served; guards against
    /// concurrent duplicates.
    pub(crate) inbound: Mutex<HashSet<String>>,
}

impl ChannelCore {
    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn weak(&self) -> &Weak<ChannelCore> {
        &self.weak
    }

    pub(crate) fn transfer_enabled(&self) -> bool {
        self.caps.structured_clone && self.caps.transfer
    }

    pub(crate) fn diagnose(&self, diag: Diagnostic) {
        (self.diagnostics)(&diag);
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            let message = match self.transport.read().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tracing::debug!("peer closed the endpoint");
                    self.shutdown(false).await;
                    break;
                }
                Err(err) => {
                    tracing::debug!(%err, "endpoint read failed");
                    self.shutdown(false).await;
                    break;
                }
            };

            let (json, handles) = match message {
                Message::Text(text) => {
                    if text == DESTROY_SENTINEL {
                        self.shutdown(false).await;
                        break;
                    }
                    if !text.starts_with('{') {
                        self.diagnose(Diagnostic::NonEnvelopeFrame(text));
                        continue;
                    }
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(json) => (json, Vec::new()),
                        Err(err) => {
                            self.diagnose(Diagnostic::DecodeFailure(err.to_string()));
                            continue;
                        }
                    }
                }
                Message::Structured(json, handles) => {
                    if json.as_str() == Some(DESTROY_SENTINEL) {
                        self.shutdown(false).await;
                        break;
                    }
                    (json, handles)
                }
            };

            match codec::decode_envelope_json(json.clone()) {
                Ok(env) => self.clone().route(env, handles).await,
                Err(err) => {
                    // A well-formed envelope with an unrecognized kind is
                    // ignored; anything else is a malformed frame.
                    let known_shape = json.get("type").is_some() && json.get("id").is_some();
                    if known_shape {
                        let id = json["id"].as_str().unwrap_or_default().to_string();
                        self.diagnose(Diagnostic::UnknownKind { id });
                    } else {
                        self.diagnose(Diagnostic::DecodeFailure(err.to_string()));
                    }
                }
            }

            if matches!(
                self.state(),
                ChannelState::Destroying | ChannelState::Destroyed
            ) {
                break;
            }
        }
    }

    async fn ctl_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Control>) {
        while let Some(ctl) = rx.recv().await {
            match ctl {
                Control::CancelStream(id) => {
                    self.streams.mark_consumer_cancelled(&id);
                    if self.state() == ChannelState::Running {
                        if let Err(err) = self.send_stream_cancel(&id).await {
                            self.diagnose(Diagnostic::WriteFailure(err.to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Tear the channel down. Idempotent; `notify_peer` is set for a local
    /// destroy and cleared when the peer initiated the close.
    pub(crate) async fn shutdown(&self, notify_peer: bool) {
        let from_running = self.state.compare_exchange(
            ChannelState::Running as u8,
            ChannelState::Destroying as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if from_running.is_err() {
            let from_init = self.state.compare_exchange(
                ChannelState::Initializing as u8,
                ChannelState::Destroying as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if from_init.is_err() {
                return;
            }
        }

        if notify_peer {
            let farewell = if self.caps.structured_clone {
                Message::Structured(serde_json::Value::String(DESTROY_SENTINEL.into()), Vec::new())
            } else {
                Message::Text(DESTROY_SENTINEL.into())
            };
            if let Err(err) = self.transport.write(farewell).await {
                tracing::debug!(%err, "destroy sentinel not delivered");
            }
        }

        self.streams.shutdown();
        self.pending.drain();
        self.callbacks.clear();
        self.transport.close().await;
        self.state
            .store(ChannelState::Destroyed as u8, Ordering::Release);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }
}

/// Options for wiring a channel.
pub struct ChannelBuilder {
    transport: Arc<dyn Transport>,
    api: ApiTree,
    mode: CodecMode,
    interceptors: Vec<Arc<dyn Interceptor>>,
    transfer_handlers: Vec<Arc<dyn TransferHandler>>,
    diagnostics: Option<DiagnosticSink>,
}

impl ChannelBuilder {
    /// The API tree exposed to the peer.
    pub fn expose(mut self, api: ApiTree) -> Self {
        self.api = api;
        self
    }

    /// Payload mode for outbound messages (default rich).
    pub fn codec(mut self, mode: CodecMode) -> Self {
        self.mode = mode;
        self
    }

    /// Append a middleware layer; earlier layers sit further out.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Register a user transfer handler.
    pub fn transfer_handler(mut self, handler: Arc<dyn TransferHandler>) -> Self {
        self.transfer_handlers.push(handler);
        self
    }

    /// Replace the default tracing diagnostic sink.
    pub fn diagnostics(mut self, sink: DiagnosticSink) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// Wire everything and spawn the read loop. Must be called within a
    /// tokio runtime.
    pub fn build(self) -> RpcChannel {
        let caps = self.transport.capabilities();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();

        let core = Arc::new_cyclic(|weak| ChannelCore {
            weak: weak.clone(),
            transport: self.transport,
            caps,
            mode: self.mode,
            state: AtomicU8::new(ChannelState::Initializing as u8),
            api: RwLock::new(self.api),
            pending: PendingTable::new(),
            callbacks: CallbackRegistry::new(),
            streams: StreamManager::new(),
            transfers: TransferEngine::new(self.transfer_handlers),
            interceptors: Arc::new(self.interceptors),
            conn_state: StateBag::default(),
            diagnostics: self.diagnostics.unwrap_or_else(tracing_sink),
            ctl: ctl_tx,
            tasks: Mutex::new(Vec::new()),
            inbound: Mutex::new(HashSet::new()),
        });

        let read = tokio::spawn(core.clone().read_loop());
        let ctl = tokio::spawn(core.clone().ctl_loop(ctl_rx));
        *core.tasks.lock() = vec![read, ctl];
        core.state
            .store(ChannelState::Running as u8, Ordering::Release);

        RpcChannel { core }
    }
}

/// One endpoint of a bidirectional RPC channel.
pub struct RpcChannel {
    core: Arc<ChannelCore>,
}

impl RpcChannel {
    pub fn builder(transport: Arc<dyn Transport>) -> ChannelBuilder {
        ChannelBuilder {
            transport,
            api: ApiTree::new(),
            mode: CodecMode::default(),
            interceptors: Vec::new(),
            transfer_handlers: Vec::new(),
            diagnostics: None,
        }
    }

    /// A channel with default options.
    pub fn new(transport: Arc<dyn Transport>, api: ApiTree) -> Self {
        Self::builder(transport).expose(api).build()
    }

    /// The proxy to the peer's API.
    pub fn proxy(&self) -> RemoteProxy {
        RemoteProxy::root(self.core.clone())
    }

    /// Swap the exposed API tree.
    pub fn expose(&self, api: ApiTree) {
        *self.core.api.write() = api;
    }

    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(
            self.state(),
            ChannelState::Destroying | ChannelState::Destroyed
        )
    }

    /// Outstanding outbound requests (streaming entries included).
    pub fn pending_requests(&self) -> usize {
        self.core.pending.len()
    }

    /// Callables currently registered for the peer.
    pub fn registered_callbacks(&self) -> usize {
        self.core.callbacks.len()
    }

    /// Active (producer, consumer) stream counts.
    pub fn active_streams(&self) -> (usize, usize) {
        (
            self.core.streams.producer_count(),
            self.core.streams.consumer_count(),
        )
    }

    /// Destroy the channel: signal the peer, fail everything outstanding,
    /// release the endpoint. Idempotent.
    pub async fn destroy(&self) {
        self.core.shutdown(true).await;
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish_non_exhaustive()
    }
}
