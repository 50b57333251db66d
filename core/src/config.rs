/*
 * config.rs
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

//! Connection configuration, loadable from a small XML document:
//!
//! ```xml
//! <imap host="mail.example.org" port="993" security="tls" timeout="30" pipelining="false">
//!   <credentials username="me" password="secret" mechanism="PLAIN"/>
//! </imap>
//! ```
//!
//! All XML reading goes through quick_xml.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::protocol::imap::transport::DEFAULT_MAX_LITERAL;
use crate::protocol::imap::ImapError;
use crate::sasl::SaslMechanism;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How the stream is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    Plain,
    /// TLS from the first byte (IMAPS, 993).
    ImplicitTls,
    /// Plain connect, then STARTTLS before authenticating.
    StartTls,
}

impl Security {
    pub fn default_port(&self) -> u16 {
        match self {
            Security::ImplicitTls => 993,
            Security::Plain | Security::StartTls => 143,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "plain" | "none" => Some(Security::Plain),
            "tls" | "ssl" | "implicit" => Some(Security::ImplicitTls),
            "starttls" => Some(Security::StartTls),
            _ => None,
        }
    }
}

/// Login identity. The secret is a password, or an access token for XOAUTH2.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
    /// SASL mechanism to prefer; LOGIN is used when none is set or the server lacks it.
    pub mechanism: Option<SaslMechanism>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            mechanism: None,
        }
    }

    pub fn with_mechanism(mut self, mechanism: SaslMechanism) -> Self {
        self.mechanism = Some(mechanism);
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

/// Everything needed to open and authenticate one connection.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub security: Security,
    pub credentials: Option<Credentials>,
    /// Per-operation timeout: connect, greeting, and each wait for a response.
    pub timeout: Duration,
    /// Allow more than one command in flight.
    pub pipelining: bool,
    pub max_literal_size: usize,
}

impl ImapConfig {
    pub fn new(host: impl Into<String>, security: Security) -> Self {
        Self {
            host: host.into(),
            port: security.default_port(),
            security,
            credentials: None,
            timeout: DEFAULT_TIMEOUT,
            pipelining: false,
            max_literal_size: DEFAULT_MAX_LITERAL,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ImapError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ImapError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_xml(&content)
    }

    pub fn from_xml(content: &str) -> Result<Self, ImapError> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut config: Option<ImapConfig> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Err(e) => return Err(ImapError::Config(format!("XML parse error: {}", e))),
                Ok(Event::Eof) => break,
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                    b"imap" => config = Some(parse_imap(&e)?),
                    b"credentials" => {
                        let target = config.as_mut().ok_or_else(|| {
                            ImapError::Config("<credentials> outside <imap>".into())
                        })?;
                        target.credentials = Some(parse_credentials(&e)?);
                    }
                    other => log::debug!(
                        "[config] ignoring element <{}>",
                        String::from_utf8_lossy(other)
                    ),
                },
                _ => {}
            }
            buf.clear();
        }
        config.ok_or_else(|| ImapError::Config("missing <imap> element".into()))
    }
}

fn attributes(e: &BytesStart<'_>) -> Result<Vec<(String, String)>, ImapError> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| ImapError::Config(format!("bad attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| ImapError::Config(format!("bad value for {}: {}", key, e)))?
            .into_owned();
        out.push((key, value));
    }
    Ok(out)
}

fn invalid(key: &str, value: &str) -> ImapError {
    ImapError::Config(format!("invalid {} \"{}\"", key, value))
}

fn parse_imap(e: &BytesStart<'_>) -> Result<ImapConfig, ImapError> {
    let attrs = attributes(e)?;
    let get = |name: &str| attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
    let host = get("host").ok_or_else(|| ImapError::Config("<imap> needs a host".into()))?;
    let security = match get("security") {
        Some(s) => Security::from_name(s).ok_or_else(|| invalid("security", s))?,
        None => Security::ImplicitTls,
    };
    let mut config = ImapConfig::new(host, security);
    if let Some(port) = get("port") {
        config.port = port.parse().map_err(|_| invalid("port", port))?;
    }
    if let Some(secs) = get("timeout") {
        let secs: u64 = secs.parse().map_err(|_| invalid("timeout", secs))?;
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(p) = get("pipelining") {
        config.pipelining = match p {
            "true" | "yes" | "1" => true,
            "false" | "no" | "0" => false,
            _ => return Err(invalid("pipelining", p)),
        };
    }
    if let Some(max) = get("max-literal") {
        config.max_literal_size = max.parse().map_err(|_| invalid("max-literal", max))?;
    }
    Ok(config)
}

fn parse_credentials(e: &BytesStart<'_>) -> Result<Credentials, ImapError> {
    let mut username = None;
    let mut secret = None;
    let mut mechanism = None;
    for (key, value) in attributes(e)? {
        match key.as_str() {
            "username" => username = Some(value),
            "password" | "token" => secret = Some(value),
            "mechanism" => {
                mechanism =
                    Some(SaslMechanism::from_name(&value).ok_or_else(|| invalid("mechanism", &value))?)
            }
            _ => {}
        }
    }
    Ok(Credentials {
        username: username.ok_or_else(|| ImapError::Config("<credentials> needs a username".into()))?,
        secret: secret.unwrap_or_default(),
        mechanism,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let config = ImapConfig::from_xml(
            r#"<?xml version="1.0"?>
            <imap host="mail.example.org" port="1993" security="starttls" timeout="5" pipelining="true">
              <credentials username="me" password="s&amp;cret" mechanism="plain"/>
            </imap>"#,
        )
        .unwrap();
        assert_eq!(config.host, "mail.example.org");
        assert_eq!(config.port, 1993);
        assert_eq!(config.security, Security::StartTls);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.pipelining);
        let creds = config.credentials.unwrap();
        assert_eq!(creds.username, "me");
        assert_eq!(creds.secret, "s&cret");
        assert_eq!(creds.mechanism, Some(SaslMechanism::Plain));
    }

    #[test]
    fn defaults_follow_security() {
        let config = ImapConfig::from_xml(r#"<imap host="h"/>"#).unwrap();
        assert_eq!(config.security, Security::ImplicitTls);
        assert_eq!(config.port, 993);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(!config.pipelining);
        assert!(config.credentials.is_none());
        let plain = ImapConfig::from_xml(r#"<imap host="h" security="plain"/>"#).unwrap();
        assert_eq!(plain.port, 143);
    }

    #[test]
    fn rejects_bad_values() {
        for doc in [
            r#"<imap port="143"/>"#,
            r#"<imap host="h" port="x"/>"#,
            r#"<imap host="h" security="quantum"/>"#,
            r#"<imap host="h"><credentials username="u" mechanism="GSSAPI"/></imap>"#,
            r#"<config/>"#,
        ] {
            assert!(
                matches!(ImapConfig::from_xml(doc), Err(ImapError::Config(_))),
                "accepted {}",
                doc
            );
        }
    }

    #[test]
    fn debug_hides_secret() {
        let creds = Credentials::new("me", "hunter2");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("me"));
        assert!(!shown.contains("hunter2"));
    }
}
