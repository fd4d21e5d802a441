//! The RPC surface project supervisors talk to: JSON-RPC 2.0 endpoints,
//! one per configured project, routed by URL path and backed by a shared
//! tool registry.

pub mod endpoint;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod tools;
