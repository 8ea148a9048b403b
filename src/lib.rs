// A SIP transaction, digest and stateless proxy engine on tokio

pub mod config;
pub mod digest;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod proxy;
pub mod resolver;
pub mod transaction;
pub mod transport;

pub use config::{EndpointOption, TlsConfig};
pub use endpoint::{Endpoint, EndpointBuilder, RequestHandler};
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
