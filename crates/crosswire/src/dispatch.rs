//! Dispatcher: routes inbound envelopes by kind and drives outbound calls.
//!
//! Handler invocations run as independent tasks so a slow handler never
//! blocks dispatch of the next message. Stream chunks are delivered inline
//! from the read loop, which preserves producer order and lets a full
//! consumer queue apply backpressure through the transport.

use std::sync::Arc;

use futures_util::StreamExt;

use crate::api::{Outcome, ValueStream};
use crate::callback::{bind_callbacks, extract_callbacks};
use crate::channel::ChannelCore;
use crate::channel::ChannelState;
use crate::codec::{self, CodecMode};
use crate::envelope::{is_stream_marker, request_id, Envelope, Kind, SlotDescriptor};
use crate::error::{ErrorRecord, RpcError};
use crate::interceptor::{run_chain, InvocationContext};
use crate::observe::Diagnostic;
use crate::pending::Completion;
use crate::stream::{ChunkRoute, RpcStream, StreamState};
use crate::transport::{Message, TransferHandle};
use crate::value::Value;

impl ChannelCore {
    fn ensure_running(&self) -> Result<(), RpcError> {
        match self.state() {
            ChannelState::Running => Ok(()),
            _ => Err(RpcError::ChannelDestroyed),
        }
    }

    /// Outbound encoding pipeline: callback registration, transfer
    /// extraction, then the codec.
    pub(crate) fn encode_payload(
        &self,
        value: Value,
    ) -> Result<
        (
            serde_json::Value,
            Option<Vec<String>>,
            Option<Vec<SlotDescriptor>>,
            Vec<TransferHandle>,
        ),
        RpcError,
    > {
        let mut ids = Vec::new();
        let value = extract_callbacks(&self.callbacks, value, &mut ids);
        let outcome = self.transfers.extract(value, self.transfer_enabled())?;
        let json = codec::encode_value(self.mode, &outcome.value)?;
        Ok((
            json,
            (!ids.is_empty()).then_some(ids),
            (!outcome.slots.is_empty()).then_some(outcome.slots),
            outcome.handles,
        ))
    }

    /// Inbound decoding pipeline: codec, transfer restoration, callback
    /// binding.
    pub(crate) fn decode_payload(
        &self,
        version: Option<&str>,
        json: &serde_json::Value,
        slots: &[SlotDescriptor],
        handles: Vec<TransferHandle>,
        declared: &[String],
    ) -> Result<Value, RpcError> {
        let mode = CodecMode::from_version(version);
        let value = codec::decode_value(mode, json)?;
        let value = self.transfers.restore(value, slots, handles)?;
        Ok(bind_callbacks(&self.callbacks, self.weak(), value, declared))
    }

    fn decode_args(
        &self,
        env: &Envelope,
        handles: Vec<TransferHandle>,
    ) -> Result<Vec<Value>, RpcError> {
        let declared = env.callback_ids.clone().unwrap_or_default();
        let slots = env.transfer_slots.as_deref().unwrap_or(&[]);
        let value =
            self.decode_payload(env.version.as_deref(), &env.args, slots, handles, &declared)?;
        match value {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(RpcError::Protocol(format!(
                "argument payload must be an array, got {other:?}"
            ))),
        }
    }

    pub(crate) async fn write_envelope(
        &self,
        env: Envelope,
        handles: Vec<TransferHandle>,
    ) -> Result<(), RpcError> {
        let message = if self.caps.structured_clone {
            let json = serde_json::to_value(&env).map_err(|e| RpcError::Encode(e.to_string()))?;
            Message::Structured(json, handles)
        } else {
            Message::Text(codec::encode_envelope_text(&env)?)
        };
        self.transport.write(message).await.map_err(RpcError::from)
    }

    fn stamp(&self, mut env: Envelope) -> Envelope {
        env.version = Some(self.mode.tag().to_string());
        env
    }

    // ------------------------------------------------------------------
    // Outbound operations (driven by the proxy)
    // ------------------------------------------------------------------

    pub(crate) async fn call(&self, method: &str, args: Vec<Value>) -> Result<Completion, RpcError> {
        self.ensure_running()?;
        let (json, callback_ids, slots, handles) = self.encode_payload(Value::Array(args))?;
        let id = request_id();
        let rx = self.pending.insert(&id)?;

        let mut env = self.stamp(Envelope::new(id.clone(), Kind::Request));
        env.method = method.to_string();
        env.args = json;
        env.callback_ids = callback_ids;
        env.transfer_slots = slots;

        if let Err(err) = self.write_envelope(env, handles).await {
            self.pending.forget(&id);
            return Err(err);
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::ChannelDestroyed),
        }
    }

    pub(crate) async fn get(&self, path: &[String]) -> Result<Value, RpcError> {
        self.ensure_running()?;
        let id = request_id();
        let rx = self.pending.insert(&id)?;

        let mut env = self.stamp(Envelope::new(id.clone(), Kind::Get));
        env.path = Some(path.to_vec());

        if let Err(err) = self.write_envelope(env, Vec::new()).await {
            self.pending.forget(&id);
            return Err(err);
        }
        match rx.await {
            Ok(outcome) => outcome?.into_value(),
            Err(_) => Err(RpcError::ChannelDestroyed),
        }
    }

    pub(crate) async fn set(&self, path: &[String], value: Value) -> Result<(), RpcError> {
        self.ensure_running()?;
        let (json, callback_ids, slots, handles) = self.encode_payload(value)?;
        let id = request_id();
        let rx = self.pending.insert(&id)?;

        let mut env = self.stamp(Envelope::new(id.clone(), Kind::Set));
        env.path = Some(path.to_vec());
        env.value = Some(json);
        env.callback_ids = callback_ids;
        env.transfer_slots = slots;

        if let Err(err) = self.write_envelope(env, handles).await {
            self.pending.forget(&id);
            return Err(err);
        }
        match rx.await {
            Ok(outcome) => outcome?.into_value().map(|_| ()),
            Err(_) => Err(RpcError::ChannelDestroyed),
        }
    }

    pub(crate) async fn construct(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.ensure_running()?;
        let (json, callback_ids, slots, handles) = self.encode_payload(Value::Array(args))?;
        let id = request_id();
        let rx = self.pending.insert(&id)?;

        let mut env = self.stamp(Envelope::new(id.clone(), Kind::Construct));
        env.method = method.to_string();
        env.args = json;
        env.callback_ids = callback_ids;
        env.transfer_slots = slots;

        if let Err(err) = self.write_envelope(env, handles).await {
            self.pending.forget(&id);
            return Err(err);
        }
        match rx.await {
            Ok(outcome) => outcome?.into_value(),
            Err(_) => Err(RpcError::ChannelDestroyed),
        }
    }

    /// Invoke a callback owned by the peer. Fire-and-forget: no pending
    /// entry, no response.
    pub(crate) async fn send_callback(
        &self,
        callback_id: &str,
        args: Vec<Value>,
    ) -> Result<(), RpcError> {
        self.ensure_running()?;
        let (json, callback_ids, slots, handles) = self.encode_payload(Value::Array(args))?;

        let mut env = self.stamp(Envelope::new(request_id(), Kind::Callback));
        env.method = callback_id.to_string();
        env.args = json;
        env.callback_ids = callback_ids;
        env.transfer_slots = slots;

        self.write_envelope(env, handles).await
    }

    pub(crate) async fn send_stream_cancel(&self, id: &str) -> Result<(), RpcError> {
        let env = self.stamp(Envelope::new(id.to_string(), Kind::StreamCancel));
        self.write_envelope(env, Vec::new()).await
    }

    // ------------------------------------------------------------------
    // Inbound routing
    // ------------------------------------------------------------------

    pub(crate) async fn route(self: Arc<Self>, env: Envelope, handles: Vec<TransferHandle>) {
        match env.kind {
            Kind::Request => {
                let core = self.clone();
                tokio::spawn(async move { core.handle_request(env, handles).await });
            }
            Kind::Construct => {
                let core = self.clone();
                tokio::spawn(async move { core.handle_construct(env, handles).await });
            }
            Kind::Get => {
                let core = self.clone();
                tokio::spawn(async move { core.handle_get(env).await });
            }
            Kind::Set => {
                let core = self.clone();
                tokio::spawn(async move { core.handle_set(env, handles).await });
            }
            Kind::Callback => {
                let core = self.clone();
                tokio::spawn(async move { core.handle_callback(env, handles) });
            }
            Kind::Response => self.handle_response(env, handles),
            Kind::StreamChunk => self.handle_stream_chunk(env, handles).await,
            Kind::StreamEnd => {
                if !self.streams.finish_consumer(&env.id, None).await {
                    self.diagnose(Diagnostic::OrphanStream {
                        id: env.id.clone(),
                        kind: env.kind,
                    });
                }
                self.pending.settle(&env.id);
            }
            Kind::StreamError => {
                let record = serde_json::from_value::<ErrorRecord>(
                    env.args.get("error").cloned().unwrap_or_default(),
                )
                .unwrap_or_else(|_| ErrorRecord::new("StreamError", "malformed stream error"));
                if !self
                    .streams
                    .finish_consumer(&env.id, Some(RpcError::Stream(record)))
                    .await
                {
                    self.diagnose(Diagnostic::OrphanStream {
                        id: env.id.clone(),
                        kind: env.kind,
                    });
                }
                self.pending.settle(&env.id);
            }
            Kind::StreamCancel => {
                if !self.streams.cancel_producer(&env.id) {
                    self.diagnose(Diagnostic::OrphanStream {
                        id: env.id.clone(),
                        kind: env.kind,
                    });
                }
            }
        }
    }

    async fn handle_request(self: Arc<Self>, env: Envelope, handles: Vec<TransferHandle>) {
        let id = env.id.clone();
        if !self.inbound.lock().insert(id.clone()) {
            self.diagnose(Diagnostic::DuplicateRequest { id });
            return;
        }

        let result = self.invoke_request(&env, handles).await;
        match result {
            Ok(Outcome::Value(value)) => self.respond_ok(&id, value).await,
            Ok(Outcome::Stream(source)) => self.run_producer(&id, source).await,
            Err(err) => self.respond_err(&id, &err).await,
        }

        self.inbound.lock().remove(&id);
    }

    async fn invoke_request(
        &self,
        env: &Envelope,
        handles: Vec<TransferHandle>,
    ) -> Result<Outcome, RpcError> {
        let handler = self.api.read().resolve_method(&env.method)?;
        let args = self.decode_args(env, handles)?;
        let ctx = InvocationContext {
            method: env.method.clone(),
            args,
            request_id: env.id.clone(),
            kind: env.kind,
            state: self.conn_state.clone(),
        };
        run_chain(self.interceptors.clone(), handler, ctx).await
    }

    async fn handle_construct(self: Arc<Self>, env: Envelope, handles: Vec<TransferHandle>) {
        let id = env.id.clone();
        let result = async {
            let constructor = self.api.read().resolve_constructor(&env.method)?;
            let args = self.decode_args(&env, handles)?;
            match constructor.invoke(args).await? {
                Outcome::Value(value) => Ok(value),
                Outcome::Stream(_) => Err(RpcError::Type(format!(
                    "constructor {} produced a stream",
                    env.method
                ))),
            }
        }
        .await;

        match result {
            Ok(value) => self.respond_ok(&id, value).await,
            Err(err) => self.respond_err(&id, &err).await,
        }
    }

    async fn handle_get(self: Arc<Self>, env: Envelope) {
        let path = env.path.unwrap_or_default();
        let result = self.api.read().read(&path);
        match result {
            Ok(value) => self.respond_ok(&env.id, value).await,
            Err(err) => self.respond_err(&env.id, &err).await,
        }
    }

    async fn handle_set(self: Arc<Self>, env: Envelope, handles: Vec<TransferHandle>) {
        let path = env.path.clone().unwrap_or_default();
        let result = (|| {
            let declared = env.callback_ids.clone().unwrap_or_default();
            let slots = env.transfer_slots.as_deref().unwrap_or(&[]);
            let json = env.value.clone().unwrap_or(serde_json::Value::Null);
            let value =
                self.decode_payload(env.version.as_deref(), &json, slots, handles, &declared)?;
            self.api.write().write(&path, value)
        })();

        match result {
            Ok(()) => self.respond_ok(&env.id, Value::Null).await,
            Err(err) => self.respond_err(&env.id, &err).await,
        }
    }

    fn handle_callback(self: Arc<Self>, env: Envelope, handles: Vec<TransferHandle>) {
        match self.callbacks.lookup(&env.method) {
            Some(callback) => match self.decode_args(&env, handles) {
                Ok(args) => callback.invoke(args),
                Err(err) => self.diagnose(Diagnostic::DecodeFailure(err.to_string())),
            },
            None => self.diagnose(Diagnostic::UnknownCallback {
                id: env.method.clone(),
            }),
        }
    }

    fn handle_response(&self, env: Envelope, handles: Vec<TransferHandle>) {
        let id = env.id.clone();

        if let Some(error_json) = env.args.get("error") {
            let err = match serde_json::from_value::<ErrorRecord>(error_json.clone()) {
                Ok(record) => record.into_rpc_error(),
                Err(err) => RpcError::Decode(format!("malformed error record: {err}")),
            };
            if !self.pending.complete(&id, Err(err)) {
                self.diagnose(Diagnostic::OrphanResponse { id });
            }
            return;
        }

        let result = env
            .args
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        if is_stream_marker(&result) {
            match self.pending.promote(&id) {
                Some(sink) => {
                    let rx = self.streams.register_consumer(&id);
                    let stream = RpcStream::new(id.clone(), rx, self.ctl.clone());
                    // A refused stream is dropped here, which sends the
                    // cancel through the usual path.
                    let _ = sink.send(Ok(Completion::Stream(stream)));
                }
                None => self.diagnose(Diagnostic::OrphanResponse { id }),
            }
            return;
        }

        let declared = env.callback_ids.clone().unwrap_or_default();
        let slots = env.transfer_slots.as_deref().unwrap_or(&[]);
        let outcome = self
            .decode_payload(env.version.as_deref(), &result, slots, handles, &declared)
            .map(Completion::Value);
        if !self.pending.complete(&id, outcome) {
            self.diagnose(Diagnostic::OrphanResponse { id });
        }
    }

    async fn handle_stream_chunk(&self, env: Envelope, handles: Vec<TransferHandle>) {
        match self.streams.chunk_route(&env.id) {
            ChunkRoute::Deliver(tx) => {
                let declared = env.callback_ids.clone().unwrap_or_default();
                let slots = env.transfer_slots.as_deref().unwrap_or(&[]);
                let item = self.decode_payload(
                    env.version.as_deref(),
                    &env.args,
                    slots,
                    handles,
                    &declared,
                );
                let _ = tx.send(item).await;
            }
            ChunkRoute::Discard => {}
            ChunkRoute::Unknown => self.diagnose(Diagnostic::OrphanStream {
                id: env.id.clone(),
                kind: env.kind,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Responses and stream production
    // ------------------------------------------------------------------

    async fn respond_ok(&self, id: &str, value: Value) {
        match self.encode_payload(value) {
            Ok((json, callback_ids, slots, handles)) => {
                let mut env = self.stamp(Envelope::response_ok(id, json));
                env.callback_ids = callback_ids;
                env.transfer_slots = slots;
                if let Err(err) = self.write_envelope(env, handles).await {
                    self.diagnose(Diagnostic::WriteFailure(err.to_string()));
                }
            }
            Err(err) => self.respond_err(id, &err).await,
        }
    }

    async fn respond_err(&self, id: &str, err: &RpcError) {
        let record = err.to_record();
        let json = match serde_json::to_value(&record) {
            Ok(json) => json,
            Err(inner) => serde_json::json!({
                "name": "EncodeError",
                "message": format!("error record serialization failed: {inner}"),
            }),
        };
        let env = self.stamp(Envelope::response_err(id, json));
        if let Err(err) = self.write_envelope(env, Vec::new()).await {
            self.diagnose(Diagnostic::WriteFailure(err.to_string()));
        }
    }

    /// Drive a handler-produced sequence: marker response, one chunk per
    /// element (awaiting each write for backpressure), then end/error.
    /// A consumer cancel stops iteration, runs the source's cleanup by
    /// dropping it, and still sends the closing end.
    async fn run_producer(&self, id: &str, mut source: ValueStream) {
        let mut cancel_rx = self.streams.register_producer(id);

        let marker = self.stamp(Envelope::stream_marker(id));
        if let Err(err) = self.write_envelope(marker, Vec::new()).await {
            self.diagnose(Diagnostic::WriteFailure(err.to_string()));
            self.streams.finish_producer(id, StreamState::Errored);
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => {
                    drop(source);
                    self.send_stream_end(id).await;
                    self.streams.finish_producer(id, StreamState::Cancelled);
                    return;
                }
                item = source.next() => match item {
                    Some(Ok(value)) => {
                        match self.encode_payload(value) {
                            Ok((json, callback_ids, slots, handles)) => {
                                let mut env = self.stamp(Envelope::new(id.to_string(), Kind::StreamChunk));
                                env.args = json;
                                env.callback_ids = callback_ids;
                                env.transfer_slots = slots;
                                if let Err(err) = self.write_envelope(env, handles).await {
                                    self.diagnose(Diagnostic::WriteFailure(err.to_string()));
                                    self.streams.finish_producer(id, StreamState::Errored);
                                    return;
                                }
                            }
                            Err(err) => {
                                self.send_stream_error(id, &err).await;
                                self.streams.finish_producer(id, StreamState::Errored);
                                return;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        self.send_stream_error(id, &err).await;
                        self.streams.finish_producer(id, StreamState::Errored);
                        return;
                    }
                    None => {
                        self.send_stream_end(id).await;
                        self.streams.finish_producer(id, StreamState::Closed);
                        return;
                    }
                }
            }
        }
    }

    async fn send_stream_end(&self, id: &str) {
        let env = self.stamp(Envelope::new(id.to_string(), Kind::StreamEnd));
        if let Err(err) = self.write_envelope(env, Vec::new()).await {
            self.diagnose(Diagnostic::WriteFailure(err.to_string()));
        }
    }

    async fn send_stream_error(&self, id: &str, err: &RpcError) {
        let record = err.to_record();
        let json = serde_json::to_value(&record)
            .unwrap_or_else(|_| serde_json::json!({ "name": "StreamError", "message": "?" }));
        let mut env = self.stamp(Envelope::new(id.to_string(), Kind::StreamError));
        env.args = serde_json::json!({ "error": json });
        if let Err(err) = self.write_envelope(env, Vec::new()).await {
            self.diagnose(Diagnostic::WriteFailure(err.to_string()));
        }
    }
}
