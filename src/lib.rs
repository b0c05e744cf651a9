pub mod asn1;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod result_code;
pub mod server;
pub mod tls;
pub mod transport;

pub use client::LdapClient;
pub use config::{ClientOptions, Config, ServerOptions};
pub use error::{LdapError, OperationError, ProtocolError};
pub use metrics::{run_metrics_server, Metrics};
pub use protocol::{LdapMessage, OperationRegistry, ProtocolOp};
pub use result_code::ResultCode;
pub use server::{LdapServer, ServerContext};
