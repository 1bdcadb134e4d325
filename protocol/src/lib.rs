//! Wire types shared by the sandbox's core session manager and its Gateway
//! surfaces: Worker Messages and client-visible Output Events, the JSON-RPC
//! 2.0 envelope, and the MCP payload shapes built on top of it.

pub mod jsonrpc;
pub mod mcp;
pub mod wire;

pub use jsonrpc::JsonRpcBody;
pub use jsonrpc::JsonRpcError;
pub use jsonrpc::JsonRpcReply;
pub use jsonrpc::JsonRpcRequest;
pub use jsonrpc::JsonRpcResponse;
pub use jsonrpc::RequestId;
pub use jsonrpc::JSONRPC_VERSION;
pub use wire::translate;
pub use wire::OutputEvent;
pub use wire::WorkerMessage;
