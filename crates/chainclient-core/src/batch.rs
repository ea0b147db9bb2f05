//! Explicit request batching.
//!
//! Requests are collected with [`BatchRequest::add`] and sent as one array
//! envelope by [`BatchRequest::execute`]. Responses may arrive in any order;
//! each is matched to its request by id and results are returned, and
//! callbacks fired, in the order the requests were added.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::ClientError;
use crate::manager::RequestManager;
use crate::method::PreparedRequest;
use crate::request::JsonRpcResponse;

/// An ordered, single-use batch of requests.
pub struct BatchRequest {
    manager: RequestManager,
    requests: Vec<PreparedRequest>,
    executed: bool,
}

impl std::fmt::Debug for BatchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRequest")
            .field("len", &self.requests.len())
            .field("executed", &self.executed)
            .finish()
    }
}

impl BatchRequest {
    pub fn new(manager: RequestManager) -> Self {
        Self {
            manager,
            requests: Vec::new(),
            executed: false,
        }
    }

    /// Append a prepared request; see [`crate::method::Method::request`].
    pub fn add(&mut self, request: PreparedRequest) -> &mut Self {
        self.requests.push(request);
        self
    }

    /// Append a raw call with no formatting.
    pub fn add_call(&mut self, method: &str, params: Vec<Value>) -> &mut Self {
        let req = self.manager.build_request(method, params);
        self.add(PreparedRequest::raw(req))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Send the batch and return one result per request, in add order.
    ///
    /// A transport failure or a response count that differs from the request
    /// count fails the whole batch; every callback receives the error.
    pub async fn execute(&mut self) -> Result<Vec<Result<Value, ClientError>>, ClientError> {
        if self.executed {
            return Err(ClientError::BatchAlreadyExecuted);
        }
        self.executed = true;

        let prepared = std::mem::take(&mut self.requests);
        let wire = prepared.iter().map(|p| p.request.clone()).collect();
        tracing::debug!(len = prepared.len(), "executing batch");

        let outcome = self.manager.send_batch(wire).await.and_then(|responses| {
            if responses.len() == prepared.len() {
                Ok(responses)
            } else {
                Err(ClientError::BatchMismatch {
                    expected: prepared.len(),
                    actual: responses.len(),
                })
            }
        });

        let responses = match outcome {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "batch failed");
                for p in prepared {
                    if let Some(cb) = p.callback {
                        cb(Err(e.clone()));
                    }
                }
                return Err(e);
            }
        };

        let mut by_id: HashMap<u64, JsonRpcResponse> = responses
            .into_iter()
            .filter_map(|r| r.id.as_u64().map(|id| (id, r)))
            .collect();

        let mut results = Vec::with_capacity(prepared.len());
        for mut p in prepared {
            let result = match p.request.id_u64().and_then(|id| by_id.remove(&id)) {
                Some(resp) => p.finish(resp),
                None => Err(ClientError::InvalidResponse(format!(
                    "no response for request id {}",
                    p.request.id
                ))),
            };
            if let Some(cb) = p.callback.take() {
                cb(result.clone());
            }
            results.push(result);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedConfig;
    use crate::error::TransportError;
    use crate::id::SequentialIds;
    use crate::request::{Envelope, Reply};
    use crate::transport::{RpcTransport, TransportKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    /// Answers every batch member with `0x<id>` in reverse order, optionally
    /// dropping the last member.
    struct ReversingTransport {
        short: bool,
        sent: Mutex<usize>,
    }

    #[async_trait]
    impl RpcTransport for ReversingTransport {
        async fn send(&self, envelope: Envelope) -> Result<Option<Reply>, TransportError> {
            *self.sent.lock() += 1;
            let Envelope::Batch(reqs) = envelope else {
                return Err(TransportError::Unsupported("single requests"));
            };
            let mut out: Vec<JsonRpcResponse> = reqs
                .iter()
                .rev()
                .map(|r| {
                    let id = r.id_u64().unwrap_or(0);
                    JsonRpcResponse::success(id, json!(format!("0x{id:x}")))
                })
                .collect();
            if self.short {
                out.pop();
            }
            Ok(Some(Reply::Batch(out)))
        }
        fn url(&self) -> &str {
            "mock://batch"
        }
        fn kind(&self) -> TransportKind {
            TransportKind::Unary
        }
        fn is_connected(&self) -> bool {
            true
        }
    }

    fn manager(short: bool) -> (RequestManager, Arc<ReversingTransport>) {
        let t = Arc::new(ReversingTransport {
            short,
            sent: Mutex::new(0),
        });
        let m = RequestManager::with_ids(
            Some(t.clone()),
            SharedConfig::default(),
            Arc::new(SequentialIds::starting_at(0x126)),
        );
        (m, t)
    }

    #[tokio::test]
    async fn results_follow_add_order() {
        let (m, _) = manager(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut batch = m.batch();
        for _ in 0..2 {
            let seen = seen.clone();
            let req = m.build_request("eth_getBalance", vec![json!("0x1"), json!("latest")]);
            batch.add(PreparedRequest::raw(req).with_callback(Box::new(move |r| {
                seen.lock().push(r.unwrap());
            })));
        }
        let results = batch.execute().await.unwrap();
        let values: Vec<Value> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![json!("0x126"), json!("0x127")]);
        assert_eq!(*seen.lock(), values);
    }

    #[tokio::test]
    async fn length_mismatch_fails_every_callback() {
        let (m, _) = manager(true);
        let failures = Arc::new(Mutex::new(0));
        let mut batch = m.batch();
        for _ in 0..3 {
            let failures = failures.clone();
            let req = m.build_request("eth_blockNumber", vec![]);
            batch.add(PreparedRequest::raw(req).with_callback(Box::new(move |r| {
                if matches!(r, Err(ClientError::BatchMismatch { expected: 3, actual: 2 })) {
                    *failures.lock() += 1;
                }
            })));
        }
        let err = batch.execute().await.unwrap_err();
        assert!(matches!(err, ClientError::BatchMismatch { .. }));
        assert_eq!(*failures.lock(), 3);
    }

    #[tokio::test]
    async fn second_execute_is_rejected() {
        let (m, t) = manager(false);
        let mut batch = m.batch();
        batch.add_call("eth_blockNumber", vec![]);
        batch.execute().await.unwrap();
        assert!(matches!(
            batch.execute().await,
            Err(ClientError::BatchAlreadyExecuted)
        ));
        assert_eq!(*t.sent.lock(), 1);
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let (m, t) = manager(false);
        let results = m.batch().execute().await.unwrap();
        assert!(results.is_empty());
        assert_eq!(*t.sent.lock(), 0);
    }
}
