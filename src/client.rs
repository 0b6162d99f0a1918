use crate::protocol::{self, Request, Response, MAX_KEY_LENGTH, MAX_VALUE_LENGTH};
use crate::{KvdError, Result};
use std::io;
use std::net::{SocketAddr, TcpStream};
use tracing::debug;

/// `KvdClient` sends one [`Request`] at a time to a server and returns its
/// [`Response`].
///
/// The client remembers the last endpoint it was asked to use and keeps the
/// connection to it open between calls; asking for a different endpoint, or
/// any transport error, drops the connection and the next call reconnects.
///
/// Protocol-level errors (key not found, key already exists, ...) arrive in
/// the returned response's `error` field; transport and local validation
/// errors are returned as `Err`.
///
/// The client is not thread-safe; concurrent callers must serialise
/// externally.
#[derive(Debug, Default)]
pub struct KvdClient {
    stream: Option<TcpStream>,
    last_endpoint: Option<SocketAddr>,
}

impl KvdClient {
    /// creates a disconnected client
    pub fn new() -> Self {
        KvdClient::default()
    }

    /// sends `request` to the server at `endpoint` and waits for its
    /// response
    ///
    /// # Errors
    /// returns [`KvdError::InvalidKeyLength`] / [`KvdError::InvalidValueLength`]
    /// before any I/O when the request violates the length limits, and the
    /// underlying transport error when connecting, sending or receiving
    /// fails. After a transport error the client is disconnected.
    pub fn send(&mut self, endpoint: SocketAddr, request: &Request) -> Result<Response> {
        if request.key.len() > MAX_KEY_LENGTH {
            return Err(KvdError::InvalidKeyLength(request.key.len()));
        }
        if request.value.len() > MAX_VALUE_LENGTH {
            return Err(KvdError::InvalidValueLength(request.value.len()));
        }

        if self.last_endpoint != Some(endpoint) {
            debug!(%endpoint, "switching endpoint");
            self.last_endpoint = Some(endpoint);
            self.stream = None;
        }

        // a failed connect leaves the client disconnected
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                debug!(%endpoint, "connecting");
                TcpStream::connect(endpoint)?
            }
        };

        match Self::exchange(&mut stream, request) {
            Ok(response) => {
                // keep the connection for the next call
                self.stream = Some(stream);
                Ok(response)
            }
            // dropping the stream closes the socket
            Err(e) => Err(e),
        }
    }

    /// writes one framed request and reads back one framed response
    fn exchange(stream: &mut TcpStream, request: &Request) -> Result<Response> {
        let payload = request.encode()?;
        protocol::write_frame(stream, &payload)?;

        let payload = protocol::read_frame(stream)?.ok_or_else(|| KvdError::Io {
            source: io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ),
        })?;
        Response::decode(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Operation;

    fn request(key: String, value: String) -> Request {
        Request {
            operation: Operation::Insert,
            key,
            value,
        }
    }

    // the validation must fire before any connection is attempted, so an
    // unroutable endpoint never surfaces as an error here
    fn dead_endpoint() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[test]
    fn oversize_key_is_rejected_locally() {
        let mut client = KvdClient::new();
        let req = request("k".repeat(MAX_KEY_LENGTH + 1), "v".to_string());
        match client.send(dead_endpoint(), &req) {
            Err(KvdError::InvalidKeyLength(len)) => assert_eq!(len, MAX_KEY_LENGTH + 1),
            other => panic!("expected InvalidKeyLength, got {:?}", other),
        }
    }

    #[test]
    fn oversize_value_is_rejected_locally() {
        let mut client = KvdClient::new();
        let req = request("k".to_string(), "v".repeat(MAX_VALUE_LENGTH + 1));
        assert!(matches!(
            client.send(dead_endpoint(), &req),
            Err(KvdError::InvalidValueLength(_))
        ));
    }

    #[test]
    fn failed_connect_leaves_the_client_disconnected() {
        let mut client = KvdClient::new();
        let req = request("k".to_string(), "v".to_string());
        assert!(matches!(
            client.send(dead_endpoint(), &req),
            Err(KvdError::Io { .. })
        ));
        assert!(client.stream.is_none());
        assert_eq!(client.last_endpoint, Some(dead_endpoint()));
    }
}
