pub mod error;
pub mod frame;
pub mod httpclient;
pub mod inspect;
pub mod logging;
pub mod msg;
pub mod proxy;
pub mod radix;
pub mod runid;
pub mod traffic;
pub mod ttl_cache;

pub use error::RevtunError;
pub use msg::Message;
pub use proxy::{ProxyConfig, ProxyType};
pub use runid::RunId;
