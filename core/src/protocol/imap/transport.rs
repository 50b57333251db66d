/*
 * transport.rs
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

//! Byte stream framing: one response = one CRLF line plus every literal it announces.
//!
//! A line ending in `{n}` switches the reader to an exact n-byte read, after which
//! line mode resumes; the response ends at the first CRLF not followed by a literal.
//! Reads go through an internal buffer so `read_frame` can be dropped mid-way (as a
//! `tokio::select!` branch) without losing bytes.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

use super::error::{ImapError, ProtocolError};

/// Default upper bound for a single literal (64 MiB).
pub const DEFAULT_MAX_LITERAL: usize = 64 * 1024 * 1024;

/// Owns the duplex stream of one connection.
pub struct Transport<S> {
    stream: S,
    read_buf: BytesMut,
    max_literal: usize,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, max_literal: usize) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            max_literal,
        }
    }

    /// Read one complete response, without its final CRLF.
    /// `deadline` bounds the wait; expiry yields `ImapError::Timeout`.
    pub async fn read_frame(&mut self, deadline: Option<Instant>) -> Result<Bytes, ImapError> {
        loop {
            if let Some(len) = frame_len(&self.read_buf, self.max_literal)? {
                let frame = self.read_buf.split_to(len).freeze();
                let end = len - line_terminator_len(&frame);
                return Ok(frame.slice(..end));
            }
            self.read_buf.reserve(4096);
            let read = self.stream.read_buf(&mut self.read_buf);
            let n = match deadline {
                Some(d) => timeout_at(d, read).await.map_err(|_| ImapError::Timeout)??,
                None => read.await?,
            };
            if n == 0 {
                return Err(ImapError::ConnectionClosed);
            }
        }
    }

    /// Write and flush. A broken pipe surfaces as `ImapError::Io`.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ImapError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Close the write side; errors are irrelevant at this point.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Give the stream back (STARTTLS). Refused when the server has already sent bytes
    /// past the last response, since those would bypass the TLS layer.
    pub fn into_inner(self) -> Result<S, ImapError> {
        if !self.read_buf.is_empty() {
            return Err(ImapError::Protocol(ProtocolError::Malformed(
                "unexpected data before TLS negotiation".into(),
            )));
        }
        Ok(self.stream)
    }
}

fn line_terminator_len(frame: &[u8]) -> usize {
    if frame.ends_with(b"\r\n") {
        2
    } else {
        1
    }
}

/// Length of the first complete response in `buf` (including its CRLF), if any.
fn frame_len(buf: &[u8], max_literal: usize) -> Result<Option<usize>, ProtocolError> {
    let mut pos = 0;
    loop {
        let nl = match buf[pos..].iter().position(|&b| b == b'\n') {
            Some(i) => pos + i,
            None => return Ok(None),
        };
        let line = &buf[pos..nl];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        match literal_size(line, max_literal)? {
            Some(size) => {
                let end = nl + 1 + size;
                if buf.len() < end {
                    return Ok(None);
                }
                pos = end;
            }
            None => return Ok(Some(nl + 1)),
        }
    }
}

/// `{n}` at the end of a line announces a literal of n bytes.
fn literal_size(line: &[u8], max_literal: usize) -> Result<Option<usize>, ProtocolError> {
    if line.last() != Some(&b'}') {
        return Ok(None);
    }
    let open = match line.iter().rposition(|&b| b == b'{') {
        Some(i) => i,
        None => return Ok(None),
    };
    let digits = &line[open + 1..line.len() - 1];
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    let size: u64 = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ProtocolError::BadLiteral(String::from_utf8_lossy(&line[open..]).into_owned())
        })?;
    if size > max_literal as u64 {
        return Err(ProtocolError::LiteralTooLarge {
            size,
            limit: max_literal,
        });
    }
    Ok(Some(size as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[test]
    fn frame_len_waits_for_crlf() {
        assert_eq!(frame_len(b"* OK ready", 100).unwrap(), None);
        assert_eq!(frame_len(b"* OK ready\r\n* 1 EXISTS", 100).unwrap(), Some(12));
    }

    #[test]
    fn frame_len_reads_literal_by_count() {
        let buf = b"* LIST () \"/\" {7}\r\nIN\r\nBOX\r\nA1 OK\r\n";
        assert_eq!(frame_len(buf, 100).unwrap(), Some(28));
        // literal not yet complete
        assert_eq!(frame_len(&buf[..22], 100).unwrap(), None);
    }

    #[test]
    fn oversized_literal_is_rejected() {
        let err = frame_len(b"* 1 FETCH (BODY[] {5000}\r\n", 1024).unwrap_err();
        assert!(err.is_desync());
        assert!(matches!(err, ProtocolError::LiteralTooLarge { size: 5000, limit: 1024 }));
    }

    #[test]
    fn braces_without_digits_are_text() {
        assert_eq!(frame_len(b"* OK {weird}\r\n", 100).unwrap(), Some(14));
    }

    #[tokio::test]
    async fn reads_frames_across_partial_writes() {
        let (client, mut server) = duplex(64);
        let mut transport = Transport::new(client, DEFAULT_MAX_LITERAL);
        let writer = tokio::spawn(async move {
            server.write_all(b"* 3 FETCH (BODY[] {4}\r\nab").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            server.write_all(b"cd)\r\nA1 OK done\r\n").await.unwrap();
            server
        });
        let first = transport.read_frame(None).await.unwrap();
        assert_eq!(&first[..], b"* 3 FETCH (BODY[] {4}\r\nabcd)");
        let second = transport.read_frame(None).await.unwrap();
        assert_eq!(&second[..], b"A1 OK done");
        drop(writer.await.unwrap());
        assert!(matches!(
            transport.read_frame(None).await,
            Err(ImapError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn deadline_expiry_is_timeout() {
        let (client, _server) = duplex(64);
        let mut transport = Transport::new(client, DEFAULT_MAX_LITERAL);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(matches!(
            transport.read_frame(Some(deadline)).await,
            Err(ImapError::Timeout)
        ));
    }

    #[tokio::test]
    async fn into_inner_refuses_buffered_bytes() {
        let (client, mut server) = duplex(64);
        server.write_all(b"A1 OK go\r\n* injected\r\n").await.unwrap();
        let mut transport = Transport::new(client, DEFAULT_MAX_LITERAL);
        transport.read_frame(None).await.unwrap();
        assert!(transport.into_inner().is_err());
    }
}
