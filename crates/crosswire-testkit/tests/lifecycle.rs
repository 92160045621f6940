//! Lifecycle, property access, middleware and wire-mode coverage.

use std::sync::Arc;

use crosswire::{
    ApiTree, ChannelState, CodecMode, Interceptor, InvocationContext, MemTransport, MethodFuture,
    Next, RpcChannel, RpcError, StreamTransport, Value,
};
use crosswire_testkit::{demo_api, init_tracing, mem_pair, stream_pair, wait_for};

#[tokio::test]
async fn destroy_propagates_to_the_peer() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    client.destroy().await;
    assert_eq!(client.state(), ChannelState::Destroyed);

    wait_for(|| server.is_destroyed()).await;
}

#[tokio::test]
async fn destroy_is_idempotent() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    client.destroy().await;
    client.destroy().await;
    assert_eq!(client.state(), ChannelState::Destroyed);
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.registered_callbacks(), 0);
    assert_eq!(client.active_streams(), (0, 0));

    server.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn destroy_drains_in_flight_requests() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let proxy = client.proxy();
    let hung = tokio::spawn(async move { proxy.field("hang").call_value(Vec::new()).await });

    wait_for(|| client.pending_requests() == 1).await;
    client.destroy().await;

    let err = hung.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::ChannelDestroyed));
    assert_eq!(client.pending_requests(), 0);

    server.destroy().await;
}

#[tokio::test]
async fn operations_after_destroy_fail_immediately() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    client.destroy().await;
    let err = client
        .proxy()
        .field("add")
        .call_value(vec![Value::from(1i64)])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ChannelDestroyed));

    server.destroy().await;
}

#[tokio::test]
async fn property_get_set_and_construct() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let version = client.proxy().field("version").get().await.unwrap();
    assert_eq!(version, Value::from("1.0"));

    client
        .proxy()
        .field("version")
        .set(Value::from("2.0"))
        .await
        .unwrap();
    let version = client.proxy().field("version").get().await.unwrap();
    assert_eq!(version, Value::from("2.0"));

    let point = client
        .proxy()
        .field("Point")
        .construct(vec![Value::from(3i64), Value::from(4i64)])
        .await
        .unwrap();
    let map = point.as_object().expect("constructed object");
    assert_eq!(map["x"], Value::Number(3.0));
    assert_eq!(map["y"], Value::Number(4.0));

    let err = client.proxy().field("missing").get().await.unwrap_err();
    assert!(matches!(err, RpcError::NotFound(_)));

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn unknown_method_is_not_found() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let err = client
        .proxy()
        .field("math")
        .field("grade9")
        .field("add")
        .call_value(Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NotFound(_)));

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn re_exposure_swaps_the_tree() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    server.expose(ApiTree::new().method("only", |_args: Vec<Value>| async move {
        Ok(Value::from("new tree"))
    }));

    assert!(matches!(
        client.proxy().field("add").call_value(Vec::new()).await,
        Err(RpcError::NotFound(_))
    ));
    assert_eq!(
        client
            .proxy()
            .field("only")
            .call_value(Vec::new())
            .await
            .unwrap(),
        Value::from("new tree")
    );

    client.destroy().await;
    server.destroy().await;
}

struct Gatekeeper;

impl Interceptor for Gatekeeper {
    fn call(&self, ctx: InvocationContext, next: Next) -> MethodFuture {
        Box::pin(async move {
            {
                let mut state = ctx.state.lock();
                let calls = state
                    .entry("calls".into())
                    .or_insert_with(|| Value::Number(0.0));
                if let Value::Number(n) = calls {
                    *n += 1.0;
                }
            }
            if ctx.method == "secret" {
                return Err(RpcError::Type("denied".into()));
            }
            next.run(ctx).await
        })
    }
}

#[tokio::test]
async fn interceptors_wrap_handler_invocation() {
    init_tracing();
    let (ta, tb) = MemTransport::pair();
    let server = RpcChannel::builder(Arc::new(ta))
        .expose(
            demo_api().method("secret", |_args: Vec<Value>| async move {
                Ok(Value::from("leaked"))
            }),
        )
        .interceptor(Arc::new(Gatekeeper))
        .build();
    let client = RpcChannel::new(Arc::new(tb), ApiTree::new());

    let sum = client
        .proxy()
        .field("add")
        .call_value(vec![Value::from(2i64), Value::from(2i64)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Number(4.0));

    let err = client
        .proxy()
        .field("secret")
        .call_value(Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Type(_)));

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn string_transport_carries_full_exchanges() {
    init_tracing();
    let (server, client) = stream_pair(demo_api(), ApiTree::new());

    let sum = client
        .proxy()
        .field("add")
        .call_value(vec![Value::from(20i64), Value::from(22i64)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Number(42.0));

    // Rich mode rides string transports too: the version tag selects the
    // decoder per message.
    let date = Value::Date(chrono_now_ms());
    let back = client
        .proxy()
        .field("echo")
        .call_value(vec![date.clone()])
        .await
        .unwrap();
    assert_eq!(back, date);

    client.destroy().await;
    server.destroy().await;

    fn chrono_now_ms() -> crosswire::chrono::DateTime<crosswire::chrono::Utc> {
        use crosswire::chrono::TimeZone;
        crosswire::chrono::Utc
            .timestamp_millis_opt(1_722_470_400_123)
            .unwrap()
    }
}

#[tokio::test]
async fn compact_mode_rejects_extended_scalars_locally() {
    init_tracing();
    let (ta, tb) = StreamTransport::pair();
    let server = RpcChannel::builder(Arc::new(ta))
        .expose(demo_api())
        .codec(CodecMode::Compact)
        .build();
    let client = RpcChannel::builder(Arc::new(tb))
        .codec(CodecMode::Compact)
        .build();

    let sum = client
        .proxy()
        .field("add")
        .call_value(vec![Value::from(1i64), Value::from(1i64)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Number(2.0));

    let err = client
        .proxy()
        .field("echo")
        .call_value(vec![Value::BigInt(1 << 70)])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Encode(_)));

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn callbacks_persist_for_the_channel_lifetime() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let tx_clone = tx.clone();
    let callback = Value::callback(move |args: Vec<Value>| {
        let _ = tx_clone.send(args);
    });

    // The same cell sent across two calls registers once.
    for _ in 0..2 {
        client
            .proxy()
            .field("math")
            .field("grade1")
            .field("add")
            .call_value(vec![Value::from(1i64), Value::from(1i64), callback.clone()])
            .await
            .unwrap();
        rx.recv().await.expect("callback fired");
    }
    assert_eq!(client.registered_callbacks(), 1);

    client.destroy().await;
    assert_eq!(client.registered_callbacks(), 0);

    server.destroy().await;
}
