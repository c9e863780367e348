//! Rotanet - proxy and identity rotation for HTTP clients
//!
//! A [`SessionContext`] holds the proxy an HTTP client should go through and,
//! optionally, a Tor-style anonymity process it can ask for fresh circuits.
//!
//! ## Features
//!
//! - HTTP, SOCKS4/4a and SOCKS5/5h proxy descriptors parsed from URLs
//! - Atomic proxy rotation visible to the next connector built
//! - Anonymity process launch, control-port authentication and new-identity signals
//! - File-backed proxy lists, optionally cycling forever
//! - Random user-agent selection

pub mod anonymity;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod session;
pub mod user_agent;

pub use anonymity::{AnonymityController, AnonymityState};
pub use config::Config;
pub use error::{Result, RotanetError};
pub use models::{AnonymityConfig, ProxyDescriptor, ProxyProtocol};
pub use proxy::{ProxyConnector, ProxySource};
pub use session::SessionContext;
pub use user_agent::UserAgentPool;
