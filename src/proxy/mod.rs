//! Upstream proxy plumbing
//!
//! - [`ProxyConnector`]: what an HTTP client needs to reach the current proxy
//! - [`ProxySource`]: proxies read one per line from a file

pub mod connector;
pub mod source;

pub use connector::ProxyConnector;
pub use source::{LineFormat, ProxyIter, ProxySource};
