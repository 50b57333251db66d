/*
 * error.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, an IMAP client core.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! IMAP client errors (connect, protocol, server, state, closure).

use std::io;

use thiserror::Error;

use super::codec::{ResponseCode, Status};
use super::state::Phase;
use crate::sasl::SaslError;

/// Violations of the wire grammar seen on the read side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("tagged response for unknown tag {0}")]
    UnexpectedTag(String),
    #[error("literal of {size} bytes exceeds limit of {limit} bytes")]
    LiteralTooLarge { size: u64, limit: usize },
    #[error("bad literal prefix: {0}")]
    BadLiteral(String),
    #[error("continuation request with nothing to send")]
    UnexpectedContinuation,
}

impl ProtocolError {
    /// True when the reader can no longer tell where the next response starts.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            ProtocolError::LiteralTooLarge { .. } | ProtocolError::BadLiteral(_)
        )
    }
}

/// IMAP client error.
#[derive(Debug, Error)]
pub enum ImapError {
    /// DNS, socket or TLS handshake failure; no connection was created.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Tagged NO or BAD. The connection stays usable.
    #[error("server replied {status}: {text}")]
    Server {
        status: Status,
        code: Option<ResponseCode>,
        text: String,
    },
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Command issued in the wrong phase; nothing was sent.
    #[error("{command} is not allowed in the {phase} state")]
    InvalidState { command: &'static str, phase: Phase },
    #[error("connection closed")]
    ConnectionClosed,
    /// The server did not answer within the configured timeout. The connection is closed.
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Sasl(#[from] SaslError),
}

impl ImapError {
    /// True for ConnectionClosed and its Timeout subtype.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, ImapError::ConnectionClosed | ImapError::Timeout)
    }

    /// Server text for NO/BAD replies.
    pub fn server_text(&self) -> Option<&str> {
        match self {
            ImapError::Server { text, .. } => Some(text),
            _ => None,
        }
    }
}
