//! The per-connection state machine on the server side.

use crate::engine::StorageEngine;
use crate::protocol::{self, ErrorCode, Operation, Request, Response, MAX_KEY_LENGTH};
use crate::stats::Stats;
use crate::Result;
use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use tracing::debug;

/// Serves one accepted connection: read a framed [`Request`], apply it to the
/// engine, record the outcome in [`Stats`], write the framed [`Response`],
/// and loop until the peer hangs up.
///
/// Requests on one connection are handled strictly in arrival order. Any I/O
/// or decoding error abandons the session; the error propagates to the worker
/// that ran it.
pub struct Session<E: StorageEngine> {
    stream: TcpStream,
    peer_addr: SocketAddr,
    engine: E,
    stats: Arc<Stats>,
}

impl<E: StorageEngine> Session<E> {
    /// wraps an accepted socket in a session
    pub fn new(stream: TcpStream, engine: E, stats: Arc<Stats>) -> Result<Session<E>> {
        let peer_addr = stream.peer_addr()?;
        Ok(Session {
            stream,
            peer_addr,
            engine,
            stats,
        })
    }

    /// runs the read → handle → write loop to completion
    pub fn run(self) -> Result<()> {
        debug!(peer = %self.peer_addr, "client connected");
        let mut reader = BufReader::new(&self.stream);
        let mut writer = BufWriter::new(&self.stream);

        loop {
            let payload = match protocol::read_frame(&mut reader)? {
                Some(payload) => payload,
                None => {
                    debug!(peer = %self.peer_addr, "client disconnected");
                    return Ok(());
                }
            };

            let request = Request::decode(&payload)?;
            debug!(peer = %self.peer_addr, ?request, "received request");

            let response = self.handle(&request)?;
            self.stats.update(request.operation, response.error);

            let encoded = response.encode()?;
            protocol::write_frame(&mut writer, &encoded)?;
            debug!(peer = %self.peer_addr, ?response, "sent response");
        }
    }

    /// dispatches one request to the engine and builds its response
    fn handle(&self, request: &Request) -> Result<Response> {
        // wire strings are capped at u16::MAX, so of the store's limits only
        // the key length can be violated by a decoded request
        if request.key.len() > MAX_KEY_LENGTH {
            return Ok(Response {
                operation: request.operation,
                error: ErrorCode::InvalidKeyLength,
                value: String::new(),
            });
        }

        let (error, value) = match request.operation {
            Operation::Insert => (
                self.engine.ins(&request.key, &request.value)?,
                String::new(),
            ),
            Operation::Update => (
                self.engine.upd(&request.key, &request.value)?,
                String::new(),
            ),
            Operation::Delete => (self.engine.del(&request.key)?, String::new()),
            Operation::Get => self.engine.get(&request.key)?,
        };

        Ok(Response {
            operation: request.operation,
            error,
            value,
        })
    }
}
