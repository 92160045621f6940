//! End-to-end scenarios over a connected channel pair.

use crosswire::{ApiTree, RpcError, TransferCell, Value};
use crosswire_testkit::{demo_api, init_tracing, mem_pair, wait_for};
use futures_util::StreamExt;

#[tokio::test]
async fn simple_call_resolves_and_clears_pending() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let sum = client
        .proxy()
        .field("add")
        .call_value(vec![Value::from(2i64), Value::from(3i64)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Number(5.0));

    assert_eq!(client.pending_requests(), 0);
    assert_eq!(server.pending_requests(), 0);

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn nested_path_with_callback() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let callback = Value::callback(move |args: Vec<Value>| {
        let _ = tx.send(args);
    });

    let result = client
        .proxy()
        .field("math")
        .field("grade1")
        .field("add")
        .call_value(vec![Value::from(7i64), Value::from(5i64), callback])
        .await
        .unwrap();
    assert_eq!(result, Value::Number(12.0));

    let delivered = rx.recv().await.expect("callback fired");
    assert_eq!(delivered, vec![Value::Number(12.0)]);

    assert_eq!(client.registered_callbacks(), 1);

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn error_roundtrip_preserves_custom_fields() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let err = client
        .proxy()
        .field("boom")
        .call_value(Vec::new())
        .await
        .unwrap_err();

    match err {
        RpcError::Handler(record) => {
            assert_eq!(record.name, "CustomError");
            assert_eq!(record.message, "nope");
            assert_eq!(record.properties["code"], serde_json::json!(404));
        }
        other => panic!("expected handler error, got {other}"),
    }

    assert_eq!(client.pending_requests(), 0);

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn finite_stream_with_early_cancel() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let mut stream = client
        .proxy()
        .field("count")
        .call_stream(vec![Value::from(1000i64)])
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(stream.next().await.unwrap().unwrap());
    }
    assert_eq!(
        seen,
        vec![Value::Number(0.0), Value::Number(1.0), Value::Number(2.0)]
    );

    drop(stream);

    // The producer stops, sends its closing end, and both sides settle.
    wait_for(|| server.active_streams().0 == 0).await;
    wait_for(|| client.active_streams().1 == 0).await;
    wait_for(|| client.pending_requests() == 0).await;

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn stream_runs_to_natural_end() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let stream = client
        .proxy()
        .field("count")
        .call_stream(vec![Value::from(5i64)])
        .await
        .unwrap();

    let items: Vec<_> = stream.map(|item| item.unwrap()).collect().await;
    assert_eq!(
        items,
        (0..5).map(|i| Value::Number(i as f64)).collect::<Vec<_>>()
    );

    wait_for(|| client.pending_requests() == 0).await;

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn stream_error_reaches_the_consumer() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let mut stream = client
        .proxy()
        .field("fail_after")
        .call_stream(vec![Value::from(3i64)])
        .await
        .unwrap();

    for i in 0..3 {
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Value::Number(i as f64)
        );
    }
    match stream.next().await {
        Some(Err(RpcError::Stream(record))) => {
            assert_eq!(record.name, "SourceError");
            assert_eq!(record.message, "pump broke");
        }
        other => panic!("expected stream error, got {other:?}"),
    }
    assert!(stream.next().await.is_none());

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn zero_copy_transfer_empties_the_sender() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let cell = TransferCell::new(vec![7u8; 1024 * 1024]);
    let len = client
        .proxy()
        .field("len")
        .call_value(vec![Value::Transfer(cell.clone())])
        .await
        .unwrap();
    assert_eq!(len, Value::Number((1024 * 1024) as f64));
    assert!(cell.is_empty(), "sender's buffer is taken on send");

    let made = client
        .proxy()
        .field("mk")
        .call_value(vec![Value::from(512i64 * 1024)])
        .await
        .unwrap();
    match made {
        Value::Transfer(received) => assert_eq!(received.byte_length(), 512 * 1024),
        other => panic!("expected a transferred buffer, got {other:?}"),
    }

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn multiple_transferables_in_one_call() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let first = TransferCell::new(vec![1u8; 1024]);
    let second = TransferCell::new(vec![2u8; 2048]);
    let total = client
        .proxy()
        .field("total_len")
        .call_value(vec![
            Value::Transfer(first.clone()),
            Value::Transfer(second.clone()),
        ])
        .await
        .unwrap();
    assert_eq!(total, Value::Number(3072.0));
    assert!(first.is_empty());
    assert!(second.is_empty());

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn concurrent_streams_interleave_without_corruption() {
    init_tracing();
    let (server, client) = mem_pair(demo_api(), ApiTree::new());

    let proxy = client.proxy();
    let numbers = proxy
        .field("count")
        .call_stream(vec![Value::from(10i64)])
        .await
        .unwrap();
    let letters = proxy
        .field("letters")
        .call_stream(vec![Value::from(10i64)])
        .await
        .unwrap();

    let (numbers, letters) = tokio::join!(
        numbers.map(|item| item.unwrap()).collect::<Vec<_>>(),
        letters.map(|item| item.unwrap()).collect::<Vec<_>>(),
    );

    assert_eq!(
        numbers,
        (0..10).map(|i| Value::Number(i as f64)).collect::<Vec<_>>()
    );
    assert_eq!(
        letters,
        ('a'..='j')
            .map(|c| Value::from(c.to_string()))
            .collect::<Vec<_>>()
    );

    client.destroy().await;
    server.destroy().await;
}

#[tokio::test]
async fn both_endpoints_are_symmetric() {
    init_tracing();
    let (a, b) = mem_pair(demo_api(), demo_api());

    let from_b = b
        .proxy()
        .field("add")
        .call_value(vec![Value::from(1i64), Value::from(2i64)])
        .await
        .unwrap();
    let from_a = a
        .proxy()
        .field("add")
        .call_value(vec![Value::from(3i64), Value::from(4i64)])
        .await
        .unwrap();

    assert_eq!(from_b, Value::Number(3.0));
    assert_eq!(from_a, Value::Number(7.0));

    a.destroy().await;
    b.destroy().await;
}
