/*
 * state.rs
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

//! Session state machine: connection phase, which commands each phase allows, and
//! the selected mailbox (present exactly while Selected).

use std::fmt;
use std::io;

use super::codec::{ResponseCode, Status, Untagged, Verb};
use super::error::{ImapError, ProtocolError};
use super::mailbox::MailboxState;

/// Connection phase. LoggedOut is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    NotAuthenticated,
    Authenticated,
    Selected,
    LoggedOut,
}

impl Phase {
    /// Whether `verb` may be issued in this phase.
    pub fn permits(self, verb: Verb) -> bool {
        match verb {
            Verb::Capability | Verb::Noop | Verb::Logout => {
                !matches!(self, Phase::Connecting | Phase::LoggedOut)
            }
            Verb::StartTls | Verb::Login | Verb::Authenticate => self == Phase::NotAuthenticated,
            Verb::Select | Verb::Examine | Verb::List | Verb::Status => {
                matches!(self, Phase::Authenticated | Phase::Selected)
            }
            Verb::Close | Verb::Expunge => self == Phase::Selected,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Connecting => "connecting",
            Phase::NotAuthenticated => "not authenticated",
            Phase::Authenticated => "authenticated",
            Phase::Selected => "selected",
            Phase::LoggedOut => "logged out",
        })
    }
}

/// Phase, capabilities and selected mailbox of one connection.
#[derive(Debug)]
pub struct Session {
    phase: Phase,
    mailbox: Option<MailboxState>,
    capabilities: Vec<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Connecting,
            mailbox: None,
            capabilities: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn mailbox(&self) -> Option<&MailboxState> {
        self.mailbox.as_ref()
    }

    pub fn mailbox_mut(&mut self) -> Option<&mut MailboxState> {
        self.mailbox.as_mut()
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn set_capabilities(&mut self, capabilities: Vec<String>) {
        self.capabilities = capabilities;
    }

    /// Reject `verb` outside its phase. Runs before anything is written.
    pub fn check(&self, verb: Verb) -> Result<(), ImapError> {
        if self.phase.permits(verb) {
            Ok(())
        } else {
            Err(ImapError::InvalidState {
                command: verb.name(),
                phase: self.phase,
            })
        }
    }

    /// Connecting → NotAuthenticated (`* OK`) or Authenticated (`* PREAUTH`).
    pub fn on_greeting(&mut self, greeting: &Untagged) -> Result<(), ImapError> {
        if self.phase != Phase::Connecting {
            return Err(ProtocolError::Malformed("second greeting".into()).into());
        }
        let (next, code) = match greeting {
            Untagged::Condition {
                status: Status::Ok,
                code,
                ..
            } => (Phase::NotAuthenticated, code),
            Untagged::PreAuth { code, .. } => (Phase::Authenticated, code),
            Untagged::Bye { text, .. } => {
                self.phase = Phase::LoggedOut;
                return Err(ImapError::Connect(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("server refused connection: {}", text),
                )));
            }
            other => {
                return Err(ProtocolError::Malformed(format!("expected greeting, got {:?}", other)).into())
            }
        };
        if let Some(ResponseCode::Capability(caps)) = code {
            self.capabilities = caps.clone();
        }
        self.phase = next;
        Ok(())
    }

    /// Apply the tagged completion of `verb`. `opened` is the staged mailbox of a
    /// successful SELECT/EXAMINE.
    pub fn on_completion(&mut self, verb: Verb, status: Status, opened: Option<MailboxState>) {
        if self.phase == Phase::LoggedOut {
            return;
        }
        match (verb, status) {
            (Verb::Login | Verb::Authenticate, Status::Ok) => {
                if self.phase == Phase::NotAuthenticated {
                    self.phase = Phase::Authenticated;
                }
            }
            (Verb::Select | Verb::Examine, Status::Ok) => {
                if let Some(mailbox) = opened {
                    self.mailbox = Some(mailbox);
                    self.phase = Phase::Selected;
                }
            }
            (Verb::Select | Verb::Examine, _) => {
                // the server deselects before it tries the new mailbox
                if self.phase == Phase::Selected {
                    self.leave_selected();
                }
            }
            (Verb::Close, Status::Ok) => self.leave_selected(),
            (Verb::StartTls, Status::Ok) => self.capabilities.clear(),
            (Verb::Logout, Status::Ok) => self.on_closed(),
            _ => {}
        }
    }

    /// Transport gone or LOGOUT done.
    pub fn on_closed(&mut self) {
        self.phase = Phase::LoggedOut;
        self.mailbox = None;
    }

    fn leave_selected(&mut self) {
        self.mailbox = None;
        self.phase = Phase::Authenticated;
    }
}
