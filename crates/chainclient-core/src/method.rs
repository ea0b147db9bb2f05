//! Method descriptors and the invocation pipeline.
//!
//! A [`Method`] turns a positional argument list into a wire request:
//! arity check, per-argument input formatting, call-name resolution. The
//! raw result is passed through the output formatter on the way back.
//! Validation failures never reach the transport.

use std::sync::Arc;

use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::manager::RequestManager;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// Normalises one argument. Receives the client's current configuration so
/// it can fill defaults (block tag, sender).
pub type InputFormatter = Arc<dyn Fn(Value, &ClientConfig) -> Result<Value, String> + Send + Sync>;

/// Normalises a raw result.
pub type OutputFormatter = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Completion callback for callback-style invocation.
pub type ResultCallback = Box<dyn FnOnce(Result<Value, ClientError>) + Send>;

/// How the wire method name is chosen.
#[derive(Clone)]
pub enum CallName {
    Fixed(String),
    /// Picks the name from the formatted arguments, e.g. by-hash vs by-number.
    Resolver(fn(&[Value]) -> String),
}

impl std::fmt::Debug for CallName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(name) => write!(f, "Fixed({name})"),
            Self::Resolver(_) => write!(f, "Resolver(..)"),
        }
    }
}

/// Declarative description of one RPC method.
#[derive(Clone)]
pub struct Method {
    name: String,
    call: CallName,
    params: usize,
    input_formatters: Vec<Option<InputFormatter>>,
    output_formatter: Option<OutputFormatter>,
    watchable: bool,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("call", &self.call)
            .field("params", &self.params)
            .field("watchable", &self.watchable)
            .finish()
    }
}

impl Method {
    /// Method named `name` that always calls `call` with `params` arguments.
    pub fn new(name: impl Into<String>, call: impl Into<String>, params: usize) -> Self {
        Self {
            name: name.into(),
            call: CallName::Fixed(call.into()),
            params,
            input_formatters: Vec::new(),
            output_formatter: None,
            watchable: false,
        }
    }

    /// Choose the wire name from the formatted arguments.
    pub fn resolver(mut self, resolve: fn(&[Value]) -> String) -> Self {
        self.call = CallName::Resolver(resolve);
        self
    }

    /// Per-position input formatters; `None` passes the argument through.
    pub fn inputs(mut self, formatters: Vec<Option<InputFormatter>>) -> Self {
        self.input_formatters = formatters;
        self
    }

    pub fn output(mut self, formatter: OutputFormatter) -> Self {
        self.output_formatter = Some(formatter);
        self
    }

    /// Mark the method as returning a transaction hash worth watching.
    pub fn watchable(mut self) -> Self {
        self.watchable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> usize {
        self.params
    }

    pub fn is_watchable(&self) -> bool {
        self.watchable
    }

    /// Validate and format `args`, resolve the call name and build a request.
    pub fn prepare(
        &self,
        manager: &RequestManager,
        args: Vec<Value>,
    ) -> Result<PreparedRequest, ClientError> {
        let call = self.build(manager, args)?;
        Ok(PreparedRequest {
            request: call,
            method: self.name.clone(),
            output: self.output_formatter.clone(),
            callback: None,
        })
    }

    fn build(&self, manager: &RequestManager, args: Vec<Value>) -> Result<JsonRpcRequest, ClientError> {
        if args.len() != self.params {
            return Err(ClientError::InvalidArgumentCount {
                method: self.name.clone(),
                expected: self.params,
                actual: args.len(),
            });
        }

        let config = manager.config().get();
        let formatted = args
            .into_iter()
            .enumerate()
            .map(|(i, arg)| match self.input_formatters.get(i) {
                Some(Some(format)) => format(arg, &config).map_err(|reason| ClientError::InvalidValue {
                    method: self.name.clone(),
                    reason,
                }),
                _ => Ok(arg),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let call = match &self.call {
            CallName::Fixed(name) => name.clone(),
            CallName::Resolver(resolve) => resolve(&formatted),
        };
        Ok(manager.build_request(call, formatted))
    }

    /// Invoke the method and return the formatted result.
    pub async fn call(&self, manager: &RequestManager, args: Vec<Value>) -> Result<Value, ClientError> {
        let prepared = self.prepare(manager, args)?;
        tracing::debug!(method = %self.name, call = %prepared.request.method, "invoking");
        let resp = manager.send_request(prepared.request.clone()).await?;
        prepared.finish(resp)
    }

    /// Callback-style invocation. Validation errors are delivered to the
    /// callback before this returns; nothing is sent in that case.
    pub fn call_with_callback<F>(&self, manager: &RequestManager, args: Vec<Value>, callback: F)
    where
        F: FnOnce(Result<Value, ClientError>) + Send + 'static,
    {
        let prepared = match self.prepare(manager, args) {
            Ok(p) => p,
            Err(e) => return callback(Err(e)),
        };
        let manager = manager.clone();
        tokio::spawn(async move {
            let result = match manager.send_request(prepared.request.clone()).await {
                Ok(resp) => prepared.finish(resp),
                Err(e) => Err(e),
            };
            callback(result);
        });
    }

    /// Prepare a request for inclusion in a batch.
    pub fn request(
        &self,
        manager: &RequestManager,
        args: Vec<Value>,
        callback: Option<ResultCallback>,
    ) -> Result<PreparedRequest, ClientError> {
        let mut prepared = self.prepare(manager, args)?;
        prepared.callback = callback;
        Ok(prepared)
    }
}

/// A validated request plus what is needed to finish it.
pub struct PreparedRequest {
    pub request: JsonRpcRequest,
    /// Logical method name, used in error messages.
    pub method: String,
    pub output: Option<OutputFormatter>,
    pub callback: Option<ResultCallback>,
}

impl std::fmt::Debug for PreparedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedRequest")
            .field("request", &self.request)
            .field("method", &self.method)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl PreparedRequest {
    /// A raw request with no formatting or callback.
    pub fn raw(request: JsonRpcRequest) -> Self {
        Self {
            method: request.method.clone(),
            request,
            output: None,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: ResultCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Turn the matching response into the caller-facing result.
    pub fn finish(&self, resp: JsonRpcResponse) -> Result<Value, ClientError> {
        let raw = resp.into_result().map_err(ClientError::Rpc)?;
        self.format(raw)
    }

    pub fn format(&self, raw: Value) -> Result<Value, ClientError> {
        match &self.output {
            Some(format) => format(raw).map_err(|reason| ClientError::InvalidValue {
                method: self.method.clone(),
                reason,
            }),
            None => Ok(raw),
        }
    }
}
