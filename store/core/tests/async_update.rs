//! Coordination between entry operations and the future adapter: a writer
//! thread commits through the entry state machine and completes a future the
//! caller is parked on.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use cairn_core::{
    CacheConfig, CacheContext, CacheKey, GetRequest, TxWriteRequest, UpdateTxResult,
};
use cairn_future::FutureAdapter;

fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[test]
fn test_future_chain_round_trip() {
    let fut: Arc<FutureAdapter<String>> = Arc::new(FutureAdapter::new());
    let chained = fut.chain(|res| res.map(|s| format!("{s}!")));

    assert!(fut.on_done("ok".to_string()));
    assert_eq!(
        chained.get_timeout(Duration::from_secs(1)).unwrap(),
        "ok!"
    );

    // A second completion is rejected and the chained result stays intact.
    assert!(!fut.on_done("x".to_string()));
    assert_eq!(chained.get().unwrap(), "ok!");
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct WriteAck {
    success: bool,
    update_counter: u64,
}

impl From<&UpdateTxResult> for WriteAck {
    fn from(res: &UpdateTxResult) -> Self {
        Self {
            success: res.success,
            update_counter: res.update_counter,
        }
    }
}

#[test]
fn test_async_writer_completes_waiting_caller() {
    let ctx = Arc::new(CacheContext::new(
        CacheConfig::new("async").with_partitions(1),
    ));

    let key = CacheKey::from("k");
    let fut: Arc<FutureAdapter<WriteAck>> = Arc::new(FutureAdapter::new());

    let writer_ctx = Arc::clone(&ctx);
    let writer_key = key.clone();
    let writer_fut = Arc::clone(&fut);

    let writer = thread::spawn(move || {
        let entry = writer_ctx.entry(&writer_key);

        match entry.inner_set(&writer_ctx, bytes("v1"), TxWriteRequest::new()) {
            Ok(res) => writer_fut.on_done(WriteAck::from(&res)),
            Err(err) => writer_fut.on_error(err),
        };
    });

    // The caller parks until the write commits.
    let ack = fut.get_timeout(Duration::from_secs(5)).unwrap();
    writer.join().unwrap();

    assert!(ack.success);
    assert_eq!(ack.update_counter, 1);

    // The committed value is visible after the ack.
    let entry = ctx.entry(&key);
    assert_eq!(
        entry.inner_get(&ctx, GetRequest::new()).unwrap().unwrap(),
        "v1"
    );
}

#[test]
fn test_chained_ack_observes_counter() {
    let ctx = Arc::new(CacheContext::new(
        CacheConfig::new("async").with_partitions(1),
    ));

    let fut: Arc<FutureAdapter<WriteAck>> = Arc::new(FutureAdapter::new());

    // Downstream consumers only care about the counter stream.
    let counters = fut.chain(|res| res.map(|ack| ack.update_counter));

    let writer_ctx = Arc::clone(&ctx);
    let writer_fut = Arc::clone(&fut);

    let writer = thread::spawn(move || {
        let entry = writer_ctx.entry(&CacheKey::from("k"));
        let res = entry
            .inner_set(&writer_ctx, bytes("v"), TxWriteRequest::new())
            .unwrap();

        writer_fut.on_done(WriteAck::from(&res));
    });

    assert_eq!(counters.get_timeout(Duration::from_secs(5)).unwrap(), 1);
    writer.join().unwrap();
}
