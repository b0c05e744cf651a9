//! Byte streams and the framing queues that turn them into LDAP messages.

pub mod client_queue;
pub mod queue;
pub mod server_queue;
pub mod stream;
pub mod wrapper;

use std::io;

use async_trait::async_trait;

use crate::error::{LdapError, Result};

pub use client_queue::{ClientQueue, Connector};
pub use queue::MessageQueue;
pub use server_queue::{Inbound, ServerQueue};
pub use stream::{parse_server, IoStream, LdapStream, OnceConnector, ServerAddress, TcpConnector, TlsUpgrade};
pub use wrapper::{MessageWrapper, SaslBufferWrapper, SecurityLayer, Unwrapped, WrapError};

/// The socket-like collaborator the queues read from and write to.
#[async_trait]
pub trait ByteStream: Send {
    /// With `block`, wait for data; an empty result is end of stream.
    /// Without it, return only what is already available; an empty result
    /// means nothing is pending.
    async fn read(&mut self, block: bool) -> io::Result<Vec<u8>>;

    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;

    fn is_secure(&self) -> bool {
        false
    }

    /// Upgrade the stream in place to TLS.
    async fn start_tls(&mut self, _upgrade: &TlsUpgrade) -> Result<()> {
        Err(LdapError::Tls("stream does not support TLS upgrade".into()))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::ByteStream;

    /// Scripted reads and captured writes.
    #[derive(Default)]
    pub(crate) struct MockStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        pub(crate) written: Arc<Mutex<Vec<Vec<u8>>>>,
        pub(crate) closed: Arc<Mutex<bool>>,
        /// Non-blocking reads return nothing when false.
        pub(crate) eager_peek: bool,
    }

    impl MockStream {
        pub(crate) fn new<I: IntoIterator<Item = Vec<u8>>>(chunks: I) -> Self {
            Self {
                reads: chunks.into_iter().map(Ok).collect(),
                ..Default::default()
            }
        }

        pub(crate) fn push_error(&mut self, kind: io::ErrorKind) {
            self.reads.push_back(Err(io::Error::new(kind, "scripted")));
        }

        pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ByteStream for MockStream {
        async fn read(&mut self, block: bool) -> io::Result<Vec<u8>> {
            if !block && !self.eager_peek {
                return Ok(Vec::new());
            }
            self.reads.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn close(&mut self) -> io::Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }
}
