//! The activator's data plane.
//!
//! A connection accepted by the [`dynamic`] proxy is wrapped [`peek`]-able,
//! classified by [`detect`], and handed to the [`l7`] proxy (HTTP/1.x and
//! h2c) or the [`l4`] proxy (TLS passthrough). The routing decision - which
//! backend a connection should reach, and whether a workload must be woken
//! first - is delegated through the [`dynamic::ProxyRouter`] seam.

pub mod detect;
pub mod dynamic;
pub mod l4;
pub mod l7;
pub mod peek;

pub use detect::HttpVersion;
pub use dynamic::{DynamicProxy, ProxyRouter};
pub use peek::PeekableStream;
