pub mod anonymity;
pub mod proxy;

pub use anonymity::*;
pub use proxy::*;
