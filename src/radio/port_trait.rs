//! Trait abstraction for the radio bridge byte transport to enable testing

use async_trait::async_trait;
use std::io;
use std::time::Duration;

/// Byte-level transport to the radio bridge
#[async_trait]
pub trait RadioIo: Send {
    /// Reads whatever is available, waiting at most `wait`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time.
    async fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize>;
}

/// Wrapper around tokio_serial::SerialStream that implements RadioIo
pub struct TokioSerialPort {
    port: tokio_serial::SerialStream,
}

impl TokioSerialPort {
    pub fn new(port: tokio_serial::SerialStream) -> Self {
        Self { port }
    }
}

#[async_trait]
impl RadioIo for TokioSerialPort {
    async fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
        use tokio::io::AsyncReadExt;
        match tokio::time::timeout(wait, self.port.read(buf)).await {
            Ok(result) => result,
            Err(_) => Ok(0),
        }
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Mock radio transport that replays queued chunks
    #[derive(Clone)]
    pub struct MockRadioIo {
        pub chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pub read_error: Arc<Mutex<Option<io::ErrorKind>>>,
    }

    impl MockRadioIo {
        pub fn new() -> Self {
            Self {
                chunks: Arc::new(Mutex::new(VecDeque::new())),
                read_error: Arc::new(Mutex::new(None)),
            }
        }

        pub fn push_chunk(&self, bytes: &[u8]) {
            self.chunks.lock().unwrap().push_back(bytes.to_vec());
        }

        pub fn set_read_error(&self, error: io::ErrorKind) {
            *self.read_error.lock().unwrap() = Some(error);
        }
    }

    #[async_trait]
    impl RadioIo for MockRadioIo {
        async fn read_available(&mut self, buf: &mut [u8], _wait: Duration) -> io::Result<usize> {
            if let Some(error) = *self.read_error.lock().unwrap() {
                return Err(io::Error::new(error, "Mock read error"));
            }
            let Some(chunk) = self.chunks.lock().unwrap().pop_front() else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.lock().unwrap().push_front(chunk[n..].to_vec());
            }
            Ok(n)
        }
    }
}
