/*
 * mod.rs
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

//! IMAP4rev1 client.
//!
//! ```text
//! Connection ──► Dispatcher ──► Command Codec ──► Transport ──► server
//!     ▲                                              │
//!     └── Session / MailboxTracker ◄── decode ◄──────┘
//! ```

pub mod codec;
mod connection;
pub mod dispatcher;
mod error;
pub mod mailbox;
pub mod state;
pub mod transport;

pub use codec::{Argument, Command, ListEntry, Response, ResponseCode, Status, Tagged, Untagged, Verb};
pub use connection::{Connection, ConnectionOptions};
pub use dispatcher::Completion;
pub use error::{ImapError, ProtocolError};
pub use mailbox::{MailboxEvent, MailboxState};
pub use state::Phase;
