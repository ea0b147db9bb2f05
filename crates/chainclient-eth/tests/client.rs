mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use chainclient_core::error::ClientError;
use chainclient_core::config::{ClientConfig, ConfirmationStrategy};
use chainclient_core::request::{
    Incoming, JsonRpcError, JsonRpcRequest, JsonRpcResponse, SubscriptionNotification,
};
use chainclient_core::subscriptions::SubscriptionEvent;
use chainclient_core::transport::RpcTransport;
use chainclient_eth::{BlockRef, Eth, Invocation, SubscriptionKind};

use common::{script, FakeDuplex, FakeUnary};

const ACCOUNT: &str = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";

fn node() -> Arc<FakeDuplex> {
    let subs = Arc::new(AtomicUsize::new(0));
    FakeDuplex::new(script(move |req| match req.method.as_str() {
        "eth_blockNumber" => Some(Ok(json!("0x126"))),
        "eth_getTransactionCount" => Some(Ok(json!("0x127"))),
        "eth_getBalance" => Some(Ok(json!("0xde0b6b3a7640000"))),
        "eth_chainId" => Some(Ok(json!("0x1"))),
        "eth_subscribe" => {
            let n = subs.fetch_add(1, Ordering::SeqCst);
            Some(Ok(json!(format!("0xsub{n}"))))
        }
        "eth_unsubscribe" => Some(Ok(json!(true))),
        _ => None,
    }))
}

#[tokio::test]
async fn batch_demultiplexes_reversed_responses_in_order() {
    common::init_tracing();
    let node = node();
    let eth = Eth::new(node.clone());

    let order = Arc::new(Mutex::new(Vec::new()));
    let (o1, o2) = (order.clone(), order.clone());
    let first = eth
        .methods()
        .block_number
        .request(
            eth.manager(),
            vec![],
            Some(Box::new(move |r: Result<Value, ClientError>| {
                o1.lock().push(("blockNumber", r.ok()))
            })),
        )
        .unwrap();
    let second = eth
        .methods()
        .get_transaction_count
        .request(
            eth.manager(),
            vec![json!(ACCOUNT), Value::Null],
            Some(Box::new(move |r: Result<Value, ClientError>| {
                o2.lock().push(("transactionCount", r.ok()))
            })),
        )
        .unwrap();

    let mut batch = eth.batch();
    batch.add(first).add(second);
    let results = batch.execute().await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap(), &json!(294));
    assert_eq!(results[1].as_ref().unwrap(), &json!(295));
    assert_eq!(
        *order.lock(),
        vec![
            ("blockNumber", Some(json!(294))),
            ("transactionCount", Some(json!(295))),
        ]
    );

    let sent = node.sent();
    assert_eq!(sent[1].params, vec![json!(ACCOUNT), json!("latest")]);
    assert!(matches!(batch.execute().await, Err(ClientError::BatchAlreadyExecuted)));
}

#[tokio::test]
async fn typed_calls_format_results() {
    let eth = Eth::new(node());
    assert_eq!(eth.block_number().await.unwrap(), 0x126);
    assert_eq!(eth.chain_id().await.unwrap(), 1);
    let balance = eth.get_balance(ACCOUNT, Some(BlockRef::Latest)).await.unwrap();
    assert_eq!(balance.to_string(), "1000000000000000000");
}

#[tokio::test]
async fn default_account_fills_missing_sender() {
    let node = FakeUnary::new(script(|req| match req.method.as_str() {
        "eth_estimateGas" => {
            assert_eq!(req.params[0]["from"], json!(ACCOUNT));
            Some(Ok(json!("0x5208")))
        }
        _ => None,
    }));
    let eth = Eth::new(node);
    eth.set_default_account("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap();

    let gas = eth
        .estimate_gas(json!({ "to": "0xfb6916095ca1df60bb79ce92ce3ea74c37c5d359" }))
        .await
        .unwrap();
    assert_eq!(gas, 21_000);
}

#[tokio::test]
async fn listeners_do_not_leak_across_rebinds() {
    let eth = Eth::new(node());
    let mut previous: Vec<Arc<FakeDuplex>> = Vec::new();
    for _ in 0..10 {
        let next = node();
        eth.set_provider(next.clone());
        previous.push(next);
    }

    let current = previous.pop().unwrap();
    assert_eq!(current.listener_count(), 3);
    for old in &previous {
        assert_eq!(old.listener_count(), 0);
    }
    assert_eq!(current.listeners().unwrap().leak_warnings(), 0);
    assert_eq!(eth.block_number().await.unwrap(), 0x126);
}

#[tokio::test]
async fn rebinding_fails_requests_left_on_the_old_transport() {
    let silent = FakeDuplex::new(script(|_| None));
    let eth = Eth::new(silent.clone());

    let pending = tokio::spawn({
        let eth = eth.clone();
        async move { eth.block_number().await }
    });
    common::wait_until(|| eth.manager().pending_count() == 1).await;

    eth.set_provider(node());
    assert!(matches!(pending.await.unwrap(), Err(ClientError::ConnectionNotOpen)));
    assert_eq!(eth.block_number().await.unwrap(), 0x126);
}

#[tokio::test]
async fn closed_transport_fails_fast_without_sending() {
    let node = node();
    let eth = Eth::new(node.clone());
    node.drop_connection("peer went away");

    let err = eth.block_number().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionNotOpen));
    let err = eth.get_balance(ACCOUNT, None).await.unwrap_err();
    assert!(err.is_connectivity());
    assert!(node.sent().is_empty());
}

#[tokio::test]
async fn close_and_late_response_settle_once() {
    let silent = FakeDuplex::new(script(|_| None));
    let eth = Eth::new(silent.clone());

    let pending = tokio::spawn({
        let eth = eth.clone();
        async move { eth.block_number().await }
    });
    common::wait_until(|| !silent.sent().is_empty()).await;
    let id = silent.sent()[0].id_u64().unwrap();

    silent.drop_connection("peer went away");
    silent.inject(Incoming::Response(JsonRpcResponse::success(id, json!("0x1"))));

    assert!(matches!(pending.await.unwrap(), Err(ClientError::ConnectionNotOpen)));
    assert_eq!(eth.manager().pending_count(), 0);
}

#[tokio::test]
async fn remote_errors_surface_and_are_not_retried() {
    let node = FakeUnary::new(script(|_| {
        Some(Err(JsonRpcError {
            code: -32601,
            message: "the method eth_chainId does not exist".into(),
            data: None,
        }))
    }));
    let eth = Eth::new(node.clone());

    let err = eth.chain_id().await.unwrap_err();
    assert_eq!(err.rpc_error().map(|e| e.code), Some(-32601));
    assert_eq!(node.count("eth_chainId"), 1);
}

#[tokio::test]
async fn invalid_arguments_never_reach_the_transport() {
    let node = node();
    let eth = Eth::new(node.clone());

    let err = eth.get_balance("0x1234", None).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidValue { ref method, .. } if method == "getBalance"));
    let err = eth
        .methods()
        .block_number
        .call(eth.manager(), vec![json!(1)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::InvalidArgumentCount { expected: 0, actual: 1, .. }
    ));
    assert!(node.sent().is_empty());
}

#[tokio::test]
async fn subscriptions_fan_out_independently() {
    let node = node();
    let eth = Eth::new(node.clone());

    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));
    let (a, b) = (seen_a.clone(), seen_b.clone());
    let heads_a = eth
        .subscribe(SubscriptionKind::NewHeads, move |ev| {
            if let SubscriptionEvent::Data(head) = ev {
                a.lock().push(head["number"].clone());
            }
        })
        .await
        .unwrap();
    let heads_b = eth
        .subscribe(SubscriptionKind::NewHeads, move |ev| {
            if let SubscriptionEvent::Data(head) = ev {
                b.lock().push(head["number"].clone());
            }
        })
        .await
        .unwrap();
    assert_ne!(heads_a.id(), heads_b.id());

    let id_a = heads_a.id().unwrap().0;
    let id_b = heads_b.id().unwrap().0;
    node.push(&id_a, json!({ "number": "0x10" }));
    node.push(&id_b, json!({ "number": "0x11" }));
    assert_eq!(*seen_a.lock(), vec![json!(16)]);
    assert_eq!(*seen_b.lock(), vec![json!(17)]);

    assert!(heads_a.unsubscribe().await.unwrap());
    node.push(&id_a, json!({ "number": "0x12" }));
    node.push(&id_b, json!({ "number": "0x13" }));
    assert_eq!(seen_a.lock().len(), 1);
    assert_eq!(*seen_b.lock(), vec![json!(17), json!(19)]);
    assert_eq!(node.count("eth_unsubscribe"), 1);
}

#[tokio::test]
async fn shared_subscription_cancels_after_the_last_listener() {
    let node = node();
    let eth = Eth::new(node.clone());

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let first = eth.subscribe(SubscriptionKind::NewPendingTransactions, |_| {}).await.unwrap();
    let second = first
        .share(Arc::new(move |_: SubscriptionEvent| {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    let id = first.id().unwrap().0;
    node.push(&id, json!("0xdeadbeef"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    first.unsubscribe().await.unwrap();
    assert_eq!(node.count("eth_unsubscribe"), 0);
    second.unsubscribe().await.unwrap();
    assert_eq!(node.count("eth_unsubscribe"), 1);
    assert_eq!(node.count("eth_subscribe"), 1);
}

#[tokio::test]
async fn log_subscription_filter_is_normalised() {
    let node = node();
    let eth = Eth::new(node.clone());
    let filter = json!({ "address": "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed", "topics": [] });
    eth.subscribe(SubscriptionKind::Logs(filter), |_| {}).await.unwrap();

    let sent = node.sent();
    assert_eq!(sent[0].method, "eth_subscribe");
    assert_eq!(sent[0].params[0], json!("logs"));
    assert_eq!(sent[0].params[1]["address"], json!(ACCOUNT));
}

#[tokio::test]
async fn subscribing_over_a_unary_transport_is_unsupported() {
    let node = FakeUnary::new(script(|_| Some(Ok(json!("0x1")))));
    let eth = Eth::new(node.clone());

    let err = eth.subscribe(SubscriptionKind::NewHeads, |_| {}).await.unwrap_err();
    assert!(matches!(err, ClientError::Unsupported(_)));
    assert!(node.sent_methods().is_empty());
}

#[tokio::test]
async fn closed_subscriptions_go_dormant_until_rebound() {
    let node = node();
    let eth = Eth::new(node.clone());
    let errors = Arc::new(AtomicUsize::new(0));
    let e = errors.clone();
    let handle = eth
        .subscribe(SubscriptionKind::NewHeads, move |ev| {
            if matches!(ev, SubscriptionEvent::Error(_)) {
                e.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

    node.drop_connection("peer went away");
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(handle.id().is_none());

    let fresh = self::node();
    eth.set_provider(fresh.clone());
    assert_eq!(eth.clear_subscriptions().await, 0);
    assert!(fresh.sent_methods().is_empty());
}

fn heads_collector() -> (
    impl Fn(SubscriptionEvent) + Send + Sync + 'static,
    Arc<Mutex<Vec<Value>>>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let listener = move |ev: SubscriptionEvent| {
        if let SubscriptionEvent::Data(head) = ev {
            s.lock().push(head["number"].clone());
        }
    };
    (listener, seen)
}

#[tokio::test]
async fn push_right_behind_the_subscribe_reply_is_delivered() {
    let node = node();
    node.set_follow_up(Arc::new(|req: &JsonRpcRequest, resp: &JsonRpcResponse| {
        match (req.method.as_str(), resp.result.as_ref().and_then(Value::as_str)) {
            ("eth_subscribe", Some(id)) => vec![Incoming::Notification(SubscriptionNotification::new(
                "eth",
                id,
                json!({ "number": "0x1" }),
            ))],
            _ => vec![],
        }
    }));
    let eth = Eth::new(node.clone());

    let (listener, seen) = heads_collector();
    let heads = eth.subscribe(SubscriptionKind::NewHeads, listener).await.unwrap();
    assert_eq!(*seen.lock(), vec![json!(1)]);

    node.push(&heads.id().unwrap().0, json!({ "number": "0x2" }));
    assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn reconnect_reissues_subscriptions_under_new_ids() {
    let node = node();
    let eth = Eth::new(node.clone());
    let (listener, seen) = heads_collector();
    let heads = eth.subscribe(SubscriptionKind::NewHeads, listener).await.unwrap();
    let first = heads.id().unwrap();

    node.drop_connection("peer went away");
    assert!(heads.id().is_none());

    node.restore();
    common::wait_until(|| heads.id().is_some()).await;
    let revived = heads.id().unwrap();
    assert_ne!(revived, first);
    assert_eq!(node.count("eth_subscribe"), 2);

    node.push(&first.0, json!({ "number": "0x1f" }));
    node.push(&revived.0, json!({ "number": "0x20" }));
    assert_eq!(*seen.lock(), vec![json!(32)]);
}

#[tokio::test]
async fn reconnect_without_auto_resubscribe_leaves_nothing_to_revive() {
    let node = node();
    let eth = Eth::with_config(
        node.clone(),
        ClientConfig {
            auto_resubscribe: false,
            ..ClientConfig::default()
        },
    );
    let heads = eth.subscribe(SubscriptionKind::NewHeads, |_| {}).await.unwrap();

    node.drop_connection("peer went away");
    node.restore();
    tokio::task::yield_now().await;

    assert!(heads.id().is_none());
    assert_eq!(node.count("eth_subscribe"), 1);
    assert!(eth.manager().subscriptions().is_empty());
}

#[tokio::test]
async fn callbacks_receive_results_and_remote_errors() {
    let node = FakeUnary::new(script(|req| match req.method.as_str() {
        "eth_blockNumber" => Some(Ok(json!("0x126"))),
        "eth_chainId" => Some(Err(JsonRpcError {
            code: -32601,
            message: "the method eth_chainId does not exist".into(),
            data: None,
        })),
        _ => None,
    }));
    let eth = Eth::new(node);

    let (tx, rx) = tokio::sync::oneshot::channel();
    eth.methods()
        .block_number
        .call_with_callback(eth.manager(), vec![], move |r| {
            let _ = tx.send(r);
        });
    assert_eq!(rx.await.unwrap().unwrap(), json!(294));

    let (tx, rx) = tokio::sync::oneshot::channel();
    eth.methods()
        .chain_id
        .call_with_callback(eth.manager(), vec![], move |r| {
            let _ = tx.send(r);
        });
    let err = rx.await.unwrap().unwrap_err();
    assert_eq!(err.rpc_error().map(|e| e.code), Some(-32601));

    let (tx, rx) = tokio::sync::oneshot::channel();
    eth.manager().send_with_callback("eth_blockNumber", vec![], move |r| {
        let _ = tx.send(r);
    });
    assert_eq!(rx.await.unwrap().unwrap(), json!("0x126"));
}

#[tokio::test]
async fn cancelled_calls_leave_no_pending_entries() {
    let node = FakeUnary::stalled();
    let eth = Eth::new(node.clone());

    for _ in 0..5 {
        let call = tokio::time::timeout(Duration::from_millis(10), eth.block_number()).await;
        assert!(call.is_err());
    }
    let mut batch = eth.batch();
    batch.add_call("eth_chainId", vec![]);
    assert!(tokio::time::timeout(Duration::from_millis(10), batch.execute())
        .await
        .is_err());

    assert_eq!(node.count("eth_blockNumber"), 5);
    assert_eq!(eth.manager().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn invoke_follows_the_watchable_flag() {
    let node = FakeUnary::new(script(|req| match req.method.as_str() {
        "eth_blockNumber" => Some(Ok(json!("0x126"))),
        "eth_sendRawTransaction" => Some(Ok(json!(common::tx_hash()))),
        "eth_getTransactionReceipt" => Some(Ok(common::receipt(0x126, true))),
        _ => None,
    }));
    let eth = Eth::with_config(
        node.clone(),
        ClientConfig {
            confirmation_strategy: ConfirmationStrategy::Polling,
            transaction_confirmation_blocks: 0,
            ..ClientConfig::default()
        },
    );

    match eth.invoke(&eth.methods().block_number, vec![]).await {
        Invocation::Result(r) => assert_eq!(r.unwrap(), json!(294)),
        Invocation::Transaction(_) => panic!("a plain call was watched"),
    }
    match eth
        .invoke(&eth.methods().send_raw_transaction, vec![json!("0xf86c0a8502540be400")])
        .await
    {
        Invocation::Transaction(handle) => {
            let receipt = handle.await.unwrap();
            assert_eq!(receipt["blockNumber"], 294);
        }
        Invocation::Result(_) => panic!("a transaction was not watched"),
    }
    assert_eq!(node.count("eth_call"), 0);
}
