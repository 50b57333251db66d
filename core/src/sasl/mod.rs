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

//! SASL client for IMAP AUTHENTICATE: PLAIN, LOGIN, XOAUTH2.
//!
//! None of these need to inspect server challenges, so an exchange is computed up
//! front: an optional initial response plus one response per continuation.

mod mechanism;
mod plain;
mod xoauth2;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub use mechanism::SaslMechanism;
pub use plain::encode_plain;
pub use xoauth2::xoauth2_initial_response;

#[derive(Debug, thiserror::Error)]
pub enum SaslError {
    #[error("unsupported SASL mechanism {0}")]
    Unsupported(String),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
}

/// Client side of one AUTHENTICATE exchange, raw (not yet base64).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslExchange {
    pub mechanism: SaslMechanism,
    /// Sent with the command under SASL-IR, otherwise after the first `+`.
    pub initial: Option<Vec<u8>>,
    /// Sent one per following `+`.
    pub responses: Vec<Vec<u8>>,
}

impl SaslExchange {
    /// For XOAUTH2, `authcid` is the email address and `secret` the access token.
    pub fn new(
        mechanism: SaslMechanism,
        authzid: &str,
        authcid: &str,
        secret: &str,
    ) -> Result<Self, SaslError> {
        let (initial, responses) = match mechanism {
            SaslMechanism::Plain => (Some(encode_plain(authzid, authcid, secret)?), vec![]),
            SaslMechanism::Login => (
                None,
                vec![authcid.as_bytes().to_vec(), secret.as_bytes().to_vec()],
            ),
            // empty answer to the error challenge, if one comes
            SaslMechanism::XOAuth2 => (Some(xoauth2_initial_response(authcid, secret)), vec![vec![]]),
        };
        Ok(Self {
            mechanism,
            initial,
            responses,
        })
    }

    /// Continuation lines to send, given whether the initial response goes inline.
    pub fn continuation_lines(&self, inline_initial: bool) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        if !inline_initial {
            if let Some(initial) = &self.initial {
                lines.push(encode_line(initial));
            }
        }
        lines.extend(self.responses.iter().map(|r| encode_line(r)));
        lines
    }

    /// Initial response as a command argument; `=` stands for an empty one (RFC 4959).
    pub fn initial_argument(&self) -> Option<String> {
        self.initial.as_ref().map(|i| {
            if i.is_empty() {
                "=".to_string()
            } else {
                STANDARD.encode(i)
            }
        })
    }
}

/// Base64 plus CRLF. An empty response is an empty line.
pub fn encode_line(raw: &[u8]) -> Vec<u8> {
    let mut line = STANDARD.encode(raw).into_bytes();
    line.extend_from_slice(b"\r\n");
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_goes_inline_or_after_continuation() {
        let ex = SaslExchange::new(SaslMechanism::Plain, "", "joe", "pw").unwrap();
        assert_eq!(ex.initial_argument().as_deref(), Some("AGpvZQBwdw=="));
        assert!(ex.continuation_lines(true).is_empty());
        assert_eq!(ex.continuation_lines(false), vec![b"AGpvZQBwdw==\r\n".to_vec()]);
    }

    #[test]
    fn login_answers_two_challenges() {
        let ex = SaslExchange::new(SaslMechanism::Login, "", "joe", "pw").unwrap();
        assert_eq!(ex.initial_argument(), None);
        assert_eq!(
            ex.continuation_lines(true),
            vec![b"am9l\r\n".to_vec(), b"cHc=\r\n".to_vec()]
        );
    }

    #[test]
    fn xoauth2_ends_with_empty_line() {
        let ex = SaslExchange::new(SaslMechanism::XOAuth2, "", "a@b.c", "tok").unwrap();
        let lines = ex.continuation_lines(true);
        assert_eq!(lines, vec![b"\r\n".to_vec()]);
    }

    #[test]
    fn mechanism_names() {
        assert_eq!(SaslMechanism::from_name("xoauth2"), Some(SaslMechanism::XOAuth2));
        assert_eq!(SaslMechanism::from_name("GSSAPI"), None);
        assert_eq!(SaslMechanism::Plain.capability(), "AUTH=PLAIN");
    }
}
