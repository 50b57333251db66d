/*
 * codec.rs
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

//! Command encoding and response decoding.
//!
//! A command encodes to one or more segments. The first segment is written at once;
//! each following segment waits for a server continuation request (`+`), which is how
//! synchronising literals and SASL exchanges are sent. Responses are decoded from one
//! framed unit as cut by the transport: a line with its announced literals inlined.

use std::fmt;

use super::error::ProtocolError;

/// Commands understood by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Capability,
    Noop,
    Logout,
    StartTls,
    Login,
    Authenticate,
    Select,
    Examine,
    Close,
    Expunge,
    List,
    Status,
}

const VERBS: [Verb; 12] = [
    Verb::Capability,
    Verb::Noop,
    Verb::Logout,
    Verb::StartTls,
    Verb::Login,
    Verb::Authenticate,
    Verb::Select,
    Verb::Examine,
    Verb::Close,
    Verb::Expunge,
    Verb::List,
    Verb::Status,
];

impl Verb {
    pub fn name(&self) -> &'static str {
        match self {
            Verb::Capability => "CAPABILITY",
            Verb::Noop => "NOOP",
            Verb::Logout => "LOGOUT",
            Verb::StartTls => "STARTTLS",
            Verb::Login => "LOGIN",
            Verb::Authenticate => "AUTHENTICATE",
            Verb::Select => "SELECT",
            Verb::Examine => "EXAMINE",
            Verb::Close => "CLOSE",
            Verb::Expunge => "EXPUNGE",
            Verb::List => "LIST",
            Verb::Status => "STATUS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        VERBS.iter().copied().find(|v| v.name().eq_ignore_ascii_case(name))
    }

    /// SELECT and EXAMINE: the commands whose untagged preamble builds a mailbox state.
    pub fn opens_mailbox(&self) -> bool {
        matches!(self, Verb::Select | Verb::Examine)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    /// Written verbatim (keywords, mechanism names, parenthesised item lists).
    Atom(String),
    Quoted(String),
    /// Synchronising literal `{n}\r\n` followed by the bytes after a continuation.
    Literal(Vec<u8>),
}

impl Argument {
    pub fn atom(s: impl Into<String>) -> Self {
        Argument::Atom(s.into())
    }

    /// Quoted string when it can be, literal otherwise (CR, LF, NUL, 8-bit).
    pub fn string(s: &str) -> Self {
        let quotable = s.bytes().all(|b| b != 0 && b != b'\r' && b != b'\n' && b < 0x80);
        if quotable {
            Argument::Quoted(s.to_string())
        } else {
            Argument::Literal(s.as_bytes().to_vec())
        }
    }

    /// Argument value as text (literals decoded lossily).
    pub fn text(&self) -> String {
        match self {
            Argument::Atom(s) | Argument::Quoted(s) => s.clone(),
            Argument::Literal(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// A tagged command. Immutable once handed to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub tag: String,
    pub verb: Verb,
    pub args: Vec<Argument>,
}

impl Command {
    pub fn new(tag: impl Into<String>, verb: Verb, args: Vec<Argument>) -> Self {
        Self {
            tag: tag.into(),
            verb,
            args,
        }
    }

    /// Encode as `<tag> <VERB> <args>\r\n`, split at every literal.
    pub fn encode(&self) -> Vec<Vec<u8>> {
        let mut segments = Vec::new();
        let mut cur = Vec::with_capacity(64);
        cur.extend_from_slice(self.tag.as_bytes());
        cur.push(b' ');
        cur.extend_from_slice(self.verb.name().as_bytes());
        for arg in &self.args {
            cur.push(b' ');
            match arg {
                Argument::Atom(s) => cur.extend_from_slice(s.as_bytes()),
                Argument::Quoted(s) => quote_into(s, &mut cur),
                Argument::Literal(data) => {
                    cur.extend_from_slice(format!("{{{}}}\r\n", data.len()).as_bytes());
                    segments.push(std::mem::take(&mut cur));
                    cur.extend_from_slice(data);
                }
            }
        }
        cur.extend_from_slice(b"\r\n");
        segments.push(cur);
        segments
    }

    /// One-line rendering for the wire trace; credentials never appear.
    pub fn redacted(&self) -> String {
        let mut out = format!("{} {}", self.tag, self.verb);
        for (i, arg) in self.args.iter().enumerate() {
            let secret = match self.verb {
                Verb::Login => i >= 1,
                Verb::Authenticate => i >= 1,
                _ => false,
            };
            out.push(' ');
            if secret {
                out.push_str("<redacted>");
                continue;
            }
            match arg {
                Argument::Atom(s) => out.push_str(s),
                Argument::Quoted(s) => out.push_str(&format!("\"{}\"", s)),
                Argument::Literal(data) => out.push_str(&format!("{{{}}}", data.len())),
            }
        }
        out
    }
}

fn quote_into(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for b in s.bytes() {
        if b == b'"' || b == b'\\' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b'"');
}

/// Parse the concatenated segments of an encoded command back into a Command.
pub fn parse_command(bytes: &[u8]) -> Result<Command, ProtocolError> {
    let bytes = bytes.strip_suffix(b"\r\n").unwrap_or(bytes);
    let mut r = Reader::new(bytes);
    let tag = r.atom()?;
    r.space()?;
    let name = r.atom()?;
    let verb = Verb::from_name(&name)
        .ok_or_else(|| ProtocolError::Malformed(format!("unknown command {}", name)))?;
    let mut args = Vec::new();
    while !r.at_end() {
        r.space()?;
        args.push(r.argument()?);
    }
    Ok(Command { tag, verb, args })
}

/// Completion status of a tagged response or untagged condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

impl Status {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "OK" => Some(Status::Ok),
            "NO" => Some(Status::No),
            "BAD" => Some(Status::Bad),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
        })
    }
}

/// Bracketed response code, e.g. `[UIDVALIDITY 3857529045]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    Alert,
    Capability(Vec<String>),
    PermanentFlags(Vec<String>),
    ReadOnly,
    ReadWrite,
    TryCreate,
    UidNext(u32),
    UidValidity(u32),
    Unseen(u32),
    Other(String),
}

/// Parsed LIST response entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub attributes: Vec<String>,
    pub delimiter: Option<char>,
    pub name: String,
}

/// Server data not tied to a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Untagged {
    /// `* OK`, `* NO`, `* BAD`.
    Condition {
        status: Status,
        code: Option<ResponseCode>,
        text: String,
    },
    PreAuth {
        code: Option<ResponseCode>,
        text: String,
    },
    Bye {
        code: Option<ResponseCode>,
        text: String,
    },
    Capability(Vec<String>),
    Flags(Vec<String>),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    /// `n FETCH (...)`; only the FLAGS item is kept.
    Fetch {
        seq: u32,
        flags: Option<Vec<String>>,
    },
    List(ListEntry),
    MailboxStatus {
        mailbox: String,
        items: Vec<(String, u32)>,
    },
    Other(String),
}

/// Tagged completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tagged {
    pub tag: String,
    pub status: Status,
    pub code: Option<ResponseCode>,
    pub text: String,
}

/// One decoded server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Untagged(Untagged),
    Tagged(Tagged),
    Continuation(String),
}

/// Decode one framed response (CRLF already stripped, literals inline).
pub fn decode_response(frame: &[u8]) -> Result<Response, ProtocolError> {
    let mut r = Reader::new(frame);
    match r.peek() {
        None => Err(ProtocolError::Malformed("empty line".into())),
        Some(b'+') => {
            r.pos += 1;
            Ok(Response::Continuation(r.rest().trim().to_string()))
        }
        Some(b'*') => {
            r.pos += 1;
            r.space()?;
            decode_untagged(&mut r, frame).map(Response::Untagged)
        }
        Some(_) => {
            let tag = r.atom()?;
            r.space()?;
            let name = r.atom()?;
            let status = Status::from_name(&name).ok_or_else(|| {
                ProtocolError::Malformed(format!("unknown status {} for tag {}", name, tag))
            })?;
            let (code, text) = resp_text(&mut r)?;
            Ok(Response::Tagged(Tagged {
                tag,
                status,
                code,
                text,
            }))
        }
    }
}

/// Tag of a line that may not decode, so a malformed completion still reaches its request.
pub fn peek_tag(frame: &[u8]) -> Option<String> {
    match frame.first() {
        None | Some(b'*') | Some(b'+') => None,
        Some(_) => {
            let end = frame.iter().position(|&b| b == b' ').unwrap_or(frame.len());
            std::str::from_utf8(&frame[..end]).ok().map(|s| s.to_string())
        }
    }
}

fn decode_untagged(r: &mut Reader<'_>, frame: &[u8]) -> Result<Untagged, ProtocolError> {
    let other = || Untagged::Other(String::from_utf8_lossy(frame).into_owned());
    let first = r.atom()?;
    if first.bytes().all(|b| b.is_ascii_digit()) {
        let n: u32 = first
            .parse()
            .map_err(|_| ProtocolError::Malformed(format!("number out of range: {}", first)))?;
        r.space()?;
        let keyword = r.atom()?.to_ascii_uppercase();
        return Ok(match keyword.as_str() {
            "EXISTS" => Untagged::Exists(n),
            "RECENT" => Untagged::Recent(n),
            "EXPUNGE" => Untagged::Expunge(n),
            "FETCH" => {
                r.space()?;
                let items = r.value()?.into_list()?;
                let mut flags = None;
                let mut it = items.into_iter();
                while let Some(name) = it.next() {
                    let value = it.next();
                    if name.is_atom("FLAGS") {
                        flags = Some(value.map(Value::into_atoms).transpose()?.unwrap_or_default());
                    }
                }
                Untagged::Fetch { seq: n, flags }
            }
            _ => other(),
        });
    }
    Ok(match first.to_ascii_uppercase().as_str() {
        "OK" | "NO" | "BAD" => {
            let status = Status::from_name(&first).unwrap_or(Status::Ok);
            let (code, text) = resp_text(r)?;
            Untagged::Condition { status, code, text }
        }
        "PREAUTH" => {
            let (code, text) = resp_text(r)?;
            Untagged::PreAuth { code, text }
        }
        "BYE" => {
            let (code, text) = resp_text(r)?;
            Untagged::Bye { code, text }
        }
        "CAPABILITY" => Untagged::Capability(capability_words(&r.rest())),
        "FLAGS" => {
            r.space()?;
            Untagged::Flags(r.value()?.into_atoms()?)
        }
        "LIST" => {
            r.space()?;
            let attributes = r.value()?.into_atoms()?;
            r.space()?;
            let delimiter = match r.value()? {
                Value::Nil => None,
                v => v.into_text()?.chars().next(),
            };
            r.space()?;
            let name = r.value()?.into_text()?;
            Untagged::List(ListEntry {
                attributes,
                delimiter,
                name,
            })
        }
        "STATUS" => {
            r.space()?;
            let mailbox = r.value()?.into_text()?;
            r.space()?;
            let mut items = Vec::new();
            let mut it = r.value()?.into_list()?.into_iter();
            while let (Some(name), Some(value)) = (it.next(), it.next()) {
                let name = name.into_text()?.to_ascii_uppercase();
                let value = value.into_text()?;
                let n = value
                    .parse()
                    .map_err(|_| ProtocolError::Malformed(format!("STATUS {} {}", name, value)))?;
                items.push((name, n));
            }
            Untagged::MailboxStatus { mailbox, items }
        }
        _ => other(),
    })
}

fn capability_words(s: &str) -> Vec<String> {
    s.split_whitespace().map(|w| w.to_uppercase()).collect()
}

/// `[code] text` after a status keyword.
fn resp_text(r: &mut Reader<'_>) -> Result<(Option<ResponseCode>, String), ProtocolError> {
    r.skip_spaces();
    let mut code = None;
    if r.peek() == Some(b'[') {
        let rest = &r.buf[r.pos + 1..];
        let end = rest
            .iter()
            .position(|&b| b == b']')
            .ok_or_else(|| ProtocolError::Malformed("unterminated response code".into()))?;
        let inner = String::from_utf8_lossy(&rest[..end]).into_owned();
        code = Some(parse_code(&inner)?);
        r.pos += end + 2;
    }
    Ok((code, r.rest().trim().to_string()))
}

fn parse_code(s: &str) -> Result<ResponseCode, ProtocolError> {
    let (name, arg) = match s.split_once(' ') {
        Some((n, a)) => (n, a.trim()),
        None => (s, ""),
    };
    let number = |a: &str| {
        a.parse::<u32>()
            .map_err(|_| ProtocolError::Malformed(format!("bad response code [{}]", s)))
    };
    Ok(match name.to_ascii_uppercase().as_str() {
        "ALERT" => ResponseCode::Alert,
        "READ-ONLY" => ResponseCode::ReadOnly,
        "READ-WRITE" => ResponseCode::ReadWrite,
        "TRYCREATE" => ResponseCode::TryCreate,
        "CAPABILITY" => ResponseCode::Capability(capability_words(arg)),
        "PERMANENTFLAGS" => ResponseCode::PermanentFlags(
            arg.trim_start_matches('(')
                .trim_end_matches(')')
                .split_whitespace()
                .map(|f| f.to_string())
                .collect(),
        ),
        "UIDNEXT" => ResponseCode::UidNext(number(arg)?),
        "UIDVALIDITY" => ResponseCode::UidValidity(number(arg)?),
        "UNSEEN" => ResponseCode::Unseen(number(arg)?),
        _ => ResponseCode::Other(s.to_string()),
    })
}

/// Parsed data item inside a response.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Atom(String),
    String(Vec<u8>),
    List(Vec<Value>),
    Nil,
}

impl Value {
    fn is_atom(&self, name: &str) -> bool {
        matches!(self, Value::Atom(a) if a.eq_ignore_ascii_case(name))
    }

    fn into_list(self) -> Result<Vec<Value>, ProtocolError> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(ProtocolError::Malformed(format!("expected list, got {:?}", other))),
        }
    }

    fn into_text(self) -> Result<String, ProtocolError> {
        match self {
            Value::Atom(s) => Ok(s),
            Value::String(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
            other => Err(ProtocolError::Malformed(format!("expected string, got {:?}", other))),
        }
    }

    fn into_atoms(self) -> Result<Vec<String>, ProtocolError> {
        self.into_list()?.into_iter().map(Value::into_text).collect()
    }
}

/// Cursor over one framed unit (response or encoded command).
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn space(&mut self) -> Result<(), ProtocolError> {
        if self.peek() != Some(b' ') {
            return Err(ProtocolError::Malformed(format!(
                "expected space at offset {} in {:?}",
                self.pos,
                String::from_utf8_lossy(self.buf)
            )));
        }
        self.skip_spaces();
        Ok(())
    }

    fn atom(&mut self) -> Result<String, ProtocolError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b' ' || b == b'(' || b == b')' || b == b'\r' || b == b'\n' {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(ProtocolError::Malformed(format!(
                "expected atom at offset {} in {:?}",
                start,
                String::from_utf8_lossy(self.buf)
            )));
        }
        Ok(String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned())
    }

    fn quoted(&mut self) -> Result<String, ProtocolError> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(ProtocolError::Malformed("unterminated quoted string".into())),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    let escaped = self
                        .buf
                        .get(self.pos + 1)
                        .copied()
                        .ok_or_else(|| ProtocolError::Malformed("dangling escape".into()))?;
                    out.push(escaped);
                    self.pos += 2;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn literal(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let rest = &self.buf[self.pos..];
        let close = rest
            .iter()
            .position(|&b| b == b'}')
            .ok_or_else(|| ProtocolError::BadLiteral("missing '}'".into()))?;
        let digits = std::str::from_utf8(&rest[1..close])
            .unwrap_or("")
            .trim_end_matches('+');
        let size: usize = digits
            .parse()
            .map_err(|_| ProtocolError::BadLiteral(format!("{{{}}}", digits)))?;
        let data_start = self.pos + close + 1;
        if self.buf.get(data_start..data_start + 2) != Some(b"\r\n".as_slice()) {
            return Err(ProtocolError::BadLiteral("literal prefix not followed by CRLF".into()));
        }
        let data_start = data_start + 2;
        let data = self
            .buf
            .get(data_start..data_start + size)
            .ok_or_else(|| ProtocolError::BadLiteral(format!("literal shorter than {} bytes", size)))?;
        self.pos = data_start + size;
        Ok(data.to_vec())
    }

    fn value(&mut self) -> Result<Value, ProtocolError> {
        match self.peek() {
            Some(b'"') => Ok(Value::String(self.quoted()?.into_bytes())),
            Some(b'{') => Ok(Value::String(self.literal()?)),
            Some(b'(') => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    self.skip_spaces();
                    match self.peek() {
                        None => return Err(ProtocolError::Malformed("unterminated list".into())),
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => items.push(self.value()?),
                    }
                }
                Ok(Value::List(items))
            }
            _ => {
                let atom = self.atom()?;
                if atom.eq_ignore_ascii_case("NIL") {
                    Ok(Value::Nil)
                } else {
                    Ok(Value::Atom(atom))
                }
            }
        }
    }

    /// Command argument; parenthesised groups come back as one raw atom.
    fn argument(&mut self) -> Result<Argument, ProtocolError> {
        match self.peek() {
            Some(b'"') => Ok(Argument::Quoted(self.quoted()?)),
            Some(b'{') => Ok(Argument::Literal(self.literal()?)),
            Some(b'(') => {
                let start = self.pos;
                self.value()?;
                Ok(Argument::Atom(
                    String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned(),
                ))
            }
            _ => Ok(Argument::Atom(self.atom()?)),
        }
    }

    fn rest(&mut self) -> String {
        let s = String::from_utf8_lossy(&self.buf[self.pos..]).into_owned();
        self.pos = self.buf.len();
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(segments: &[Vec<u8>]) -> Vec<u8> {
        segments.concat()
    }

    #[test]
    fn encodes_tag_verb_and_quoted_args() {
        let cmd = Command::new(
            "A0001",
            Verb::Login,
            vec![Argument::string("joe"), Argument::string("p\"w\\d")],
        );
        let segments = cmd.encode();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0], b"A0001 LOGIN \"joe\" \"p\\\"w\\\\d\"\r\n".to_vec());
    }

    #[test]
    fn literal_splits_command_into_segments() {
        let cmd = Command::new("A0002", Verb::Select, vec![Argument::string("Entwürfe")]);
        let segments = cmd.encode();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], b"A0002 SELECT {9}\r\n".to_vec());
        assert_eq!(segments[1], "Entwürfe\r\n".as_bytes().to_vec());
    }

    #[test]
    fn encoded_command_parses_back() {
        let commands = [
            Command::new("A0003", Verb::Noop, vec![]),
            Command::new(
                "A0004",
                Verb::Status,
                vec![Argument::string("INBOX"), Argument::atom("(MESSAGES UIDNEXT)")],
            ),
            Command::new(
                "A0005",
                Verb::Login,
                vec![Argument::Literal(b"line\r\nbreak".to_vec()), Argument::string("pw")],
            ),
            Command::new(
                "A0006",
                Verb::Authenticate,
                vec![Argument::atom("PLAIN"), Argument::atom("AGpvZQBwdw==")],
            ),
        ];
        for cmd in commands {
            let parsed = parse_command(&joined(&cmd.encode())).unwrap();
            assert_eq!(parsed, cmd);
        }
    }

    #[test]
    fn parse_command_rejects_unknown_verb() {
        let err = parse_command(b"A1 FROB x\r\n").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn redacted_hides_credentials() {
        let cmd = Command::new(
            "A0007",
            Verb::Login,
            vec![Argument::string("joe"), Argument::string("hunter2")],
        );
        let line = cmd.redacted();
        assert_eq!(line, "A0007 LOGIN \"joe\" <redacted>");
        assert!(!line.contains("hunter2"));
    }

    #[test]
    fn decodes_tagged_with_code() {
        let r = decode_response(b"A0002 OK [READ-WRITE] SELECT completed").unwrap();
        assert_eq!(
            r,
            Response::Tagged(Tagged {
                tag: "A0002".into(),
                status: Status::Ok,
                code: Some(ResponseCode::ReadWrite),
                text: "SELECT completed".into(),
            })
        );
        let r = decode_response(b"A0003 NO mailbox does not exist").unwrap();
        match r {
            Response::Tagged(t) => {
                assert_eq!(t.status, Status::No);
                assert_eq!(t.code, None);
                assert_eq!(t.text, "mailbox does not exist");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decodes_select_preamble() {
        let lines: [(&[u8], Untagged); 6] = [
            (b"* 172 EXISTS", Untagged::Exists(172)),
            (b"* 1 RECENT", Untagged::Recent(1)),
            (
                b"* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)",
                Untagged::Flags(vec![
                    "\\Answered".into(),
                    "\\Flagged".into(),
                    "\\Deleted".into(),
                    "\\Seen".into(),
                    "\\Draft".into(),
                ]),
            ),
            (
                b"* OK [UNSEEN 12] Message 12 is first unseen",
                Untagged::Condition {
                    status: Status::Ok,
                    code: Some(ResponseCode::Unseen(12)),
                    text: "Message 12 is first unseen".into(),
                },
            ),
            (
                b"* OK [UIDVALIDITY 3857529045] UIDs valid",
                Untagged::Condition {
                    status: Status::Ok,
                    code: Some(ResponseCode::UidValidity(3857529045)),
                    text: "UIDs valid".into(),
                },
            ),
            (
                b"* OK [PERMANENTFLAGS (\\Deleted \\Seen \\*)] Limited",
                Untagged::Condition {
                    status: Status::Ok,
                    code: Some(ResponseCode::PermanentFlags(vec![
                        "\\Deleted".into(),
                        "\\Seen".into(),
                        "\\*".into(),
                    ])),
                    text: "Limited".into(),
                },
            ),
        ];
        for (line, expected) in lines {
            assert_eq!(decode_response(line).unwrap(), Response::Untagged(expected));
        }
    }

    #[test]
    fn decodes_greeting_capabilities_and_bye() {
        let r = decode_response(b"* OK [CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN] ready").unwrap();
        assert_eq!(
            r,
            Response::Untagged(Untagged::Condition {
                status: Status::Ok,
                code: Some(ResponseCode::Capability(vec![
                    "IMAP4REV1".into(),
                    "STARTTLS".into(),
                    "AUTH=PLAIN".into(),
                ])),
                text: "ready".into(),
            })
        );
        let r = decode_response(b"* CAPABILITY IMAP4rev1 SASL-IR").unwrap();
        assert_eq!(
            r,
            Response::Untagged(Untagged::Capability(vec!["IMAP4REV1".into(), "SASL-IR".into()]))
        );
        let r = decode_response(b"* BYE logging out").unwrap();
        assert!(matches!(r, Response::Untagged(Untagged::Bye { .. })));
    }

    #[test]
    fn decodes_fetch_flags_and_ignores_other_items() {
        let r = decode_response(b"* 12 FETCH (UID 4827 FLAGS (\\Seen $Junk))").unwrap();
        assert_eq!(
            r,
            Response::Untagged(Untagged::Fetch {
                seq: 12,
                flags: Some(vec!["\\Seen".into(), "$Junk".into()]),
            })
        );
        let r = decode_response(b"* 3 FETCH (BODY[] {5}\r\nhello)").unwrap();
        assert_eq!(r, Response::Untagged(Untagged::Fetch { seq: 3, flags: None }));
    }

    #[test]
    fn decodes_list_with_literal_name() {
        let r = decode_response(b"* LIST (\\HasNoChildren) \"/\" {5}\r\nINBOX").unwrap();
        assert_eq!(
            r,
            Response::Untagged(Untagged::List(ListEntry {
                attributes: vec!["\\HasNoChildren".into()],
                delimiter: Some('/'),
                name: "INBOX".into(),
            }))
        );
        let r = decode_response(b"* LIST (\\Noselect) NIL \"\"").unwrap();
        match r {
            Response::Untagged(Untagged::List(e)) => {
                assert_eq!(e.delimiter, None);
                assert_eq!(e.name, "");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decodes_status() {
        let r = decode_response(b"* STATUS \"blurdybloop\" (MESSAGES 231 UIDNEXT 44292)").unwrap();
        assert_eq!(
            r,
            Response::Untagged(Untagged::MailboxStatus {
                mailbox: "blurdybloop".into(),
                items: vec![("MESSAGES".into(), 231), ("UIDNEXT".into(), 44292)],
            })
        );
    }

    #[test]
    fn decodes_continuation() {
        assert_eq!(
            decode_response(b"+ Ready for literal data").unwrap(),
            Response::Continuation("Ready for literal data".into())
        );
        assert_eq!(decode_response(b"+").unwrap(), Response::Continuation(String::new()));
    }

    #[test]
    fn unknown_untagged_is_other() {
        let r = decode_response(b"* SEARCH 2 84 882").unwrap();
        assert_eq!(r, Response::Untagged(Untagged::Other("* SEARCH 2 84 882".into())));
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(matches!(
            decode_response(b"A0001 MAYBE fine"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_response(b"* OK [UIDVALIDITY abc] x"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_response(b"* 99999999999 EXISTS"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(decode_response(b"").is_err());
    }

    #[test]
    fn peek_tag_finds_tag_of_undecodable_line() {
        assert_eq!(peek_tag(b"A0009 MAYBE fine"), Some("A0009".into()));
        assert_eq!(peek_tag(b"* 1 EXISTS"), None);
        assert_eq!(peek_tag(b"+ go"), None);
    }
}
