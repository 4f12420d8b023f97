//! Message envelopes and requests.
//!
//! A [`Message`] is the decoded form of one frame. A [`Request`] pairs an
//! inbound message with the connection it arrived on and is handed to exactly
//! one handler invocation.

use crate::connection::Connection;
use std::sync::Arc;

/// Decoded frame: routing id, serial number, error code and payload.
///
/// `data_len` always matches `data.len()` once the payload is attached. The
/// only window where they differ is between header decode and body read inside
/// the connection reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    id: u32,
    serial: u32,
    err_code: u16,
    data_len: u32,
    data: Vec<u8>,
}

impl Message {
    /// Creates a complete message, deriving `data_len` from the payload.
    pub fn new(id: u32, serial: u32, err_code: u16, data: Vec<u8>) -> Self {
        Self {
            id,
            serial,
            err_code,
            data_len: data.len() as u32,
            data,
        }
    }

    /// Creates a header-only message whose body has not been read yet.
    pub fn from_header(id: u32, serial: u32, err_code: u16, data_len: u32) -> Self {
        Self {
            id,
            serial,
            err_code,
            data_len,
            data: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn err_code(&self) -> u16 {
        self.err_code
    }

    /// Declared payload length in bytes.
    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message and returns the payload.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Attaches the body read off the socket.
    pub(crate) fn set_data(&mut self, data: Vec<u8>) {
        self.data_len = data.len() as u32;
        self.data = data;
    }
}

/// One inbound message bound to its originating connection.
#[derive(Clone)]
pub struct Request {
    connection: Arc<Connection>,
    message: Message,
}

impl Request {
    pub fn new(connection: Arc<Connection>, message: Message) -> Self {
        Self { connection, message }
    }

    /// Connection the message arrived on; use it to reply.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn msg_id(&self) -> u32 {
        self.message.id()
    }

    pub fn serial(&self) -> u32 {
        self.message.serial()
    }

    pub fn data(&self) -> &[u8] {
        self.message.data()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("conn_id", &self.connection.conn_id())
            .field("message", &self.message)
            .finish()
    }
}
