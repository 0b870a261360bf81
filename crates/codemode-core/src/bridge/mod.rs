//! Call bridge: namespace proxies for generated code and the script call
//! channel.

mod call_bridge;
pub mod channel;
pub mod proxy;

pub use call_bridge::CallBridge;
pub use channel::{BridgeReply, BridgeRequest, CALL_PREFIX};
pub use proxy::{Member, NamespaceDefinition, NamespaceProxy, ProxyConfig, ToolCallable};
