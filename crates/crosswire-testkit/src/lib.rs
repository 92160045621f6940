//! In-process harness for exercising channel pairs.
//!
//! Provides connected channel pairs over both reference transports and a
//! canned API tree covering calls, nested paths, callbacks, errors,
//! streams, transfers and construction.

use std::sync::Arc;
use std::time::Duration;

use crosswire::{
    ApiTree, ErrorRecord, MemTransport, RpcChannel, RpcError, StreamTransport, Value, ValueStream,
};

/// Install a test-friendly tracing subscriber (idempotent).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A connected channel pair over the in-memory transport (structured clone
/// and transfer capable).
pub fn mem_pair(api_a: ApiTree, api_b: ApiTree) -> (RpcChannel, RpcChannel) {
    let (ta, tb) = MemTransport::pair();
    (
        RpcChannel::new(Arc::new(ta), api_a),
        RpcChannel::new(Arc::new(tb), api_b),
    )
}

/// A connected channel pair over the newline-framed byte-stream transport
/// (string mode).
pub fn stream_pair(api_a: ApiTree, api_b: ApiTree) -> (RpcChannel, RpcChannel) {
    let (ta, tb) = StreamTransport::pair();
    (
        RpcChannel::new(Arc::new(ta), api_a),
        RpcChannel::new(Arc::new(tb), api_b),
    )
}

fn arg_f64(args: &[Value], index: usize) -> f64 {
    args.get(index).and_then(Value::as_f64).unwrap_or(0.0)
}

/// The canned service used across the scenario tests.
pub fn demo_api() -> ApiTree {
    ApiTree::new()
        .method("add", |args: Vec<Value>| async move {
            Ok(Value::Number(arg_f64(&args, 0) + arg_f64(&args, 1)))
        })
        .method("echo", |args: Vec<Value>| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
        .method("hang", |_args: Vec<Value>| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        })
        .nested(
            "math",
            ApiTree::new().nested(
                "grade1",
                ApiTree::new().method("add", |args: Vec<Value>| async move {
                    let sum = arg_f64(&args, 0) + arg_f64(&args, 1);
                    if let Some(Value::Callable(cb)) = args.get(2) {
                        cb.invoke(vec![Value::Number(sum)]).await?;
                    }
                    Ok(Value::Number(sum))
                }),
            ),
        )
        .method("boom", |_args: Vec<Value>| async move {
            Err::<Value, _>(RpcError::Handler(
                ErrorRecord::new("CustomError", "nope")
                    .with_property("code", serde_json::json!(404)),
            ))
        })
        .streaming("count", |args: Vec<Value>| async move {
            let n = arg_f64(&args, 0) as i64;
            let source: ValueStream = Box::pin(async_stream::stream! {
                for i in 0..n {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    yield Ok(Value::from(i));
                }
            });
            Ok(source)
        })
        .streaming("letters", |args: Vec<Value>| async move {
            let n = (arg_f64(&args, 0) as usize).min(26);
            let source: ValueStream = Box::pin(async_stream::stream! {
                for i in 0..n {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    let letter = (b'a' + i as u8) as char;
                    yield Ok(Value::from(letter.to_string()));
                }
            });
            Ok(source)
        })
        .streaming("fail_after", |args: Vec<Value>| async move {
            let n = arg_f64(&args, 0) as i64;
            let source: ValueStream = Box::pin(async_stream::stream! {
                for i in 0..n {
                    yield Ok(Value::from(i));
                }
                yield Err(RpcError::Handler(ErrorRecord::new("SourceError", "pump broke")));
            });
            Ok(source)
        })
        .method("len", |args: Vec<Value>| async move {
            match args.first() {
                Some(Value::Transfer(cell)) => Ok(Value::from(cell.byte_length() as i64)),
                Some(Value::Bytes(bytes)) => Ok(Value::from(bytes.len() as i64)),
                other => Err(RpcError::Type(format!("len expects a buffer, got {other:?}"))),
            }
        })
        .method("total_len", |args: Vec<Value>| async move {
            let mut total = 0usize;
            for arg in &args {
                match arg {
                    Value::Transfer(cell) => total += cell.byte_length(),
                    Value::Bytes(bytes) => total += bytes.len(),
                    other => {
                        return Err(RpcError::Type(format!(
                            "total_len expects buffers, got {other:?}"
                        )))
                    }
                }
            }
            Ok(Value::from(total as i64))
        })
        .method("mk", |args: Vec<Value>| async move {
            let n = arg_f64(&args, 0) as usize;
            Ok(Value::transferable(vec![0u8; n]))
        })
        .constructor("Point", |args: Vec<Value>| async move {
            let map = std::collections::BTreeMap::from([
                ("x".to_string(), Value::Number(arg_f64(&args, 0))),
                ("y".to_string(), Value::Number(arg_f64(&args, 1))),
            ]);
            Ok(Value::Object(map))
        })
        .value("version", Value::from("1.0"))
}

/// Poll until `check` passes or the deadline expires.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached within deadline");
}
