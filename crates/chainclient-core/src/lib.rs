//! chainclient-core: transport-agnostic plumbing for ChainClient.
//!
//! # Overview
//!
//! - [`RpcTransport`]: the async trait every transport implements
//! - [`request`]: JSON-RPC 2.0 wire types and the envelope codec
//! - [`RequestManager`]: request/response correlation and subscription routing
//! - [`BatchRequest`]: explicit, ordered batches
//! - [`Method`]: declarative method descriptors and the invocation pipeline
//! - [`EventHandle`]: terminal outcome plus named progress events
//! - [`ClientError`] / [`TransportError`]: structured error types

pub mod batch;
pub mod config;
pub mod error;
pub mod handle;
pub mod id;
pub mod manager;
pub mod method;
pub mod request;
pub mod subscriptions;
pub mod transport;

pub use batch::BatchRequest;
pub use config::{ClientConfig, ConfirmationStrategy, SharedConfig};
pub use error::{ClientError, TransportError};
pub use handle::{event_channel, EventEmitter, EventHandle, NamedEvent};
pub use id::{process_ids, IdGenerator, SequentialIds};
pub use manager::{RequestManager, SubscriptionHandle};
pub use method::{InputFormatter, Method, OutputFormatter, PreparedRequest, ResultCallback};
pub use request::{
    Envelope, Incoming, JsonRpcError, JsonRpcRequest, JsonRpcResponse, Reply, RpcId, RpcParam,
    SubscriptionNotification,
};
pub use subscriptions::{SubscriptionEvent, SubscriptionId, SubscriptionListener};
pub use transport::{ListenerSet, RpcTransport, TransportKind};
