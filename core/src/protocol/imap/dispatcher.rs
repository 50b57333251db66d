/*
 * dispatcher.rs
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

//! Request dispatch: tag allocation, the queue of commands not yet written, and the
//! pending set keyed by tag that tagged completions resolve.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;

use super::codec::{Command, ResponseCode, Status, Tagged, Untagged, Verb};
use super::error::{ImapError, ProtocolError};
use super::mailbox::MailboxState;

/// Sequential tags `A0001`, `A0002`, ... Never reused within a connection.
#[derive(Debug)]
pub struct TagGenerator {
    next: AtomicU64,
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TagGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_tag(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("A{:04}", n)
    }
}

/// Successful completion of one command.
#[derive(Debug, Clone)]
pub struct Completion {
    pub code: Option<ResponseCode>,
    pub text: String,
    /// Untagged data routed to this command while it was in flight.
    pub untagged: Vec<Untagged>,
    /// Mailbox state attached by a successful SELECT/EXAMINE.
    pub mailbox: Option<MailboxState>,
}

pub type Reply = oneshot::Sender<Result<Completion, ImapError>>;

/// A command travelling from the caller to the connection task.
pub struct Request {
    pub command: Command,
    /// Continuation segments sent after the encoded command (SASL responses).
    pub followups: Vec<Vec<u8>>,
    pub reply: Reply,
}

impl Request {
    pub fn new(
        command: Command,
        followups: Vec<Vec<u8>>,
    ) -> (Self, oneshot::Receiver<Result<Completion, ImapError>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                command,
                followups,
                reply,
            },
            rx,
        )
    }

    pub fn reject(self, err: ImapError) {
        let _ = self.reply.send(Err(err));
    }
}

/// A written command awaiting its tagged response.
pub struct Pending {
    tag: String,
    verb: Verb,
    segments: VecDeque<Vec<u8>>,
    untagged: Vec<Untagged>,
    error: Option<ProtocolError>,
    reply: Reply,
}

impl Pending {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// True once a protocol error has been scoped to this command.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Deliver the result. A caller that stopped waiting simply does not receive it.
    pub fn resolve(self, tagged: Tagged, mailbox: Option<MailboxState>) {
        let result = match (self.error, tagged.status) {
            (Some(e), _) => Err(ImapError::Protocol(e)),
            (None, Status::Ok) => Ok(Completion {
                code: tagged.code,
                text: tagged.text,
                untagged: self.untagged,
                mailbox,
            }),
            (None, status) => Err(ImapError::Server {
                status,
                code: tagged.code,
                text: tagged.text,
            }),
        };
        if self.reply.send(result).is_err() {
            log::debug!("[imap] {} completed after its caller stopped waiting", self.tag);
        }
    }

    pub fn fail(self, err: ImapError) {
        let _ = self.reply.send(Err(err));
    }
}

/// Whether `verb` is answered with untagged data of this kind.
fn produces(verb: Verb, untagged: &Untagged) -> bool {
    match untagged {
        Untagged::List(_) => verb == Verb::List,
        Untagged::MailboxStatus { .. } => verb == Verb::Status,
        Untagged::Capability(_) => verb == Verb::Capability,
        Untagged::Expunge(_) => matches!(verb, Verb::Expunge | Verb::Close),
        _ => false,
    }
}

/// Pending set plus the queue of requests not yet written.
pub struct Dispatcher {
    pending: HashMap<String, Pending>,
    order: VecDeque<String>,
    queue: VecDeque<Request>,
    pipelining: bool,
}

impl Dispatcher {
    pub fn new(pipelining: bool) -> Self {
        Self {
            pending: HashMap::new(),
            order: VecDeque::new(),
            queue: VecDeque::new(),
            pipelining,
        }
    }

    pub fn enqueue(&mut self, request: Request) {
        self.queue.push_back(request);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn awaiting_continuation(&self) -> bool {
        self.pending.values().any(|p| !p.segments.is_empty())
    }

    fn opening(&self) -> bool {
        self.pending.values().any(|p| p.verb.opens_mailbox())
    }

    /// One command in flight unless pipelining; never while a continuation is owed
    /// or a SELECT/EXAMINE is outstanding.
    pub fn can_send(&self) -> bool {
        !self.awaiting_continuation()
            && !self.opening()
            && (self.pipelining || self.pending.is_empty())
    }

    /// A SELECT/EXAMINE is written only once everything before it has completed, so
    /// its untagged preamble cannot mix with another command's data.
    pub fn next_ready(&mut self) -> Option<Request> {
        if !self.can_send() {
            return None;
        }
        let front = self.queue.front()?;
        if front.command.verb.opens_mailbox() && !self.pending.is_empty() {
            return None;
        }
        self.queue.pop_front()
    }

    /// Track a written command. `segments` are the parts still waiting for `+`.
    /// Returns false (and fails the reply) if the tag is already in flight.
    pub fn register(
        &mut self,
        tag: String,
        verb: Verb,
        segments: VecDeque<Vec<u8>>,
        reply: Reply,
    ) -> bool {
        if self.pending.contains_key(&tag) {
            let _ = reply.send(Err(ImapError::Protocol(ProtocolError::Malformed(format!(
                "tag {} already in flight",
                tag
            )))));
            return false;
        }
        self.order.push_back(tag.clone());
        self.pending.insert(
            tag.clone(),
            Pending {
                tag,
                verb,
                segments,
                untagged: Vec::new(),
                error: None,
                reply,
            },
        );
        true
    }

    /// Next bytes to send for a server `+`. An AUTHENTICATE with nothing left to say is
    /// cancelled with `*`.
    pub fn continuation(&mut self) -> Result<(String, Vec<u8>), ProtocolError> {
        for tag in &self.order {
            if let Some(p) = self.pending.get_mut(tag) {
                if let Some(segment) = p.segments.pop_front() {
                    return Ok((tag.clone(), segment));
                }
            }
        }
        self.order
            .iter()
            .find(|t| {
                self.pending
                    .get(*t)
                    .map_or(false, |p| p.verb == Verb::Authenticate)
            })
            .map(|t| (t.clone(), b"*\r\n".to_vec()))
            .ok_or(ProtocolError::UnexpectedContinuation)
    }

    fn oldest_mut(&mut self) -> Option<&mut Pending> {
        let tag = self.order.front()?;
        self.pending.get_mut(tag)
    }

    /// Attach untagged data to the oldest pending command that asked for its kind,
    /// or to the oldest pending command when none did. False if none is pending.
    pub fn collect(&mut self, untagged: Untagged) -> bool {
        let owner = self
            .order
            .iter()
            .find(|t| {
                self.pending
                    .get(*t)
                    .map_or(false, |p| produces(p.verb, &untagged))
            })
            .or_else(|| self.order.front())
            .cloned();
        match owner.and_then(|tag| self.pending.get_mut(&tag)) {
            Some(p) => {
                p.untagged.push(untagged);
                true
            }
            None => false,
        }
    }

    /// Mark the oldest pending command as failed by a protocol error; it resolves
    /// with that error once its tagged response arrives.
    pub fn flag_error(&mut self, err: ProtocolError) -> bool {
        match self.oldest_mut() {
            Some(p) => {
                p.error.get_or_insert(err);
                true
            }
            None => false,
        }
    }

    /// Remove the pending command for `tag`.
    pub fn take(&mut self, tag: &str) -> Result<Pending, ProtocolError> {
        let pending = self
            .pending
            .remove(tag)
            .ok_or_else(|| ProtocolError::UnexpectedTag(tag.to_string()))?;
        self.order.retain(|t| t != tag);
        Ok(pending)
    }

    /// Resolve every pending and queued request with an error from `make`.
    pub fn fail_all(&mut self, make: impl Fn() -> ImapError) {
        for tag in self.order.drain(..) {
            if let Some(p) = self.pending.remove(&tag) {
                p.fail(make());
            }
        }
        for request in self.queue.drain(..) {
            request.reject(make());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn request(tags: &TagGenerator, verb: Verb) -> (Request, oneshot::Receiver<Result<Completion, ImapError>>) {
        Request::new(Command::new(tags.next_tag(), verb, vec![]), vec![])
    }

    fn send(d: &mut Dispatcher, r: Request) {
        let mut segments: VecDeque<Vec<u8>> = r.command.encode().into();
        segments.pop_front();
        segments.extend(r.followups);
        assert!(d.register(r.command.tag.clone(), r.command.verb, segments, r.reply));
    }

    fn tagged(tag: &str, status: Status, text: &str) -> Tagged {
        Tagged {
            tag: tag.into(),
            status,
            code: None,
            text: text.into(),
        }
    }

    #[test]
    fn tags_are_sequential_and_unique() {
        let tags = TagGenerator::new();
        let seen: HashSet<String> = (0..10_000).map(|_| tags.next_tag()).collect();
        assert_eq!(seen.len(), 10_000);
        assert!(seen.contains("A0001"));
        assert!(seen.contains("A10000"));
    }

    #[test]
    fn one_command_in_flight_without_pipelining() {
        let tags = TagGenerator::new();
        let mut d = Dispatcher::new(false);
        let (a, _ra) = request(&tags, Verb::Noop);
        let (b, _rb) = request(&tags, Verb::Noop);
        d.enqueue(a);
        d.enqueue(b);
        let first = d.next_ready().unwrap();
        send(&mut d, first);
        assert!(d.next_ready().is_none());
        d.take("A0001").unwrap().resolve(tagged("A0001", Status::Ok, "done"), None);
        assert_eq!(d.next_ready().unwrap().command.tag, "A0002");
    }

    #[test]
    fn pipelining_lets_queue_drain() {
        let tags = TagGenerator::new();
        let mut d = Dispatcher::new(true);
        for _ in 0..3 {
            let (r, _) = request(&tags, Verb::Noop);
            d.enqueue(r);
        }
        while let Some(r) = d.next_ready() {
            send(&mut d, r);
        }
        assert_eq!(d.pending_len(), 3);
    }

    #[tokio::test]
    async fn completions_resolve_by_tag_in_any_order() {
        let tags = TagGenerator::new();
        let mut d = Dispatcher::new(true);
        let (a, ra) = request(&tags, Verb::Noop);
        let (b, rb) = request(&tags, Verb::Select);
        send(&mut d, a);
        send(&mut d, b);
        d.take("A0002")
            .unwrap()
            .resolve(tagged("A0002", Status::No, "mailbox does not exist"), None);
        d.take("A0001").unwrap().resolve(tagged("A0001", Status::Ok, "NOOP done"), None);
        assert_eq!(ra.await.unwrap().unwrap().text, "NOOP done");
        match rb.await.unwrap() {
            Err(ImapError::Server { status, text, .. }) => {
                assert_eq!(status, Status::No);
                assert_eq!(text, "mailbox does not exist");
            }
            other => panic!("unexpected {:?}", other.map(|c| c.text)),
        }
    }

    #[test]
    fn unknown_tag_is_reported() {
        let mut d = Dispatcher::new(false);
        assert_eq!(
            d.take("Z9").err(),
            Some(ProtocolError::UnexpectedTag("Z9".into()))
        );
    }

    #[test]
    fn duplicate_tag_is_refused() {
        let mut d = Dispatcher::new(true);
        let (tx1, _r1) = oneshot::channel();
        let (tx2, mut r2) = oneshot::channel();
        assert!(d.register("A0001".into(), Verb::Noop, VecDeque::new(), tx1));
        assert!(!d.register("A0001".into(), Verb::Noop, VecDeque::new(), tx2));
        assert!(matches!(r2.try_recv(), Ok(Err(ImapError::Protocol(_)))));
        assert_eq!(d.pending_len(), 1);
    }

    #[test]
    fn continuation_feeds_literal_then_blocks_nothing() {
        let mut d = Dispatcher::new(true);
        let (tx, _rx) = oneshot::channel();
        let segments = VecDeque::from(vec![b"secret\r\n".to_vec()]);
        d.register("A0001".into(), Verb::Login, segments, tx);
        assert!(!d.can_send());
        assert_eq!(d.continuation().unwrap(), ("A0001".into(), b"secret\r\n".to_vec()));
        assert!(d.can_send());
        assert_eq!(d.continuation(), Err(ProtocolError::UnexpectedContinuation));
    }

    #[test]
    fn exhausted_authenticate_is_cancelled() {
        let mut d = Dispatcher::new(false);
        let (tx, _rx) = oneshot::channel();
        d.register("A0001".into(), Verb::Authenticate, VecDeque::new(), tx);
        assert_eq!(d.continuation().unwrap().1, b"*\r\n".to_vec());
    }

    #[tokio::test]
    async fn untagged_data_and_errors_go_to_oldest() {
        let tags = TagGenerator::new();
        let mut d = Dispatcher::new(true);
        let (a, ra) = request(&tags, Verb::List);
        let (b, rb) = request(&tags, Verb::Noop);
        send(&mut d, a);
        send(&mut d, b);
        assert!(d.collect(Untagged::Other("* SEARCH 1".into())));
        d.take("A0001").unwrap().resolve(tagged("A0001", Status::Ok, "ok"), None);
        assert_eq!(ra.await.unwrap().unwrap().untagged.len(), 1);
        assert!(d.flag_error(ProtocolError::Malformed("junk".into())));
        d.take("A0002").unwrap().resolve(tagged("A0002", Status::Ok, "ok"), None);
        assert!(matches!(rb.await.unwrap(), Err(ImapError::Protocol(_))));
    }

    #[tokio::test]
    async fn untagged_data_goes_to_the_command_that_asked_for_it() {
        let tags = TagGenerator::new();
        let mut d = Dispatcher::new(true);
        let (list, rl) = request(&tags, Verb::List);
        let (status, rs) = request(&tags, Verb::Status);
        send(&mut d, list);
        send(&mut d, status);
        assert!(d.collect(Untagged::MailboxStatus {
            mailbox: "INBOX".into(),
            items: vec![("MESSAGES".into(), 17)],
        }));
        d.take("A0002").unwrap().resolve(tagged("A0002", Status::Ok, "ok"), None);
        let status = rs.await.unwrap().unwrap();
        assert!(matches!(
            status.untagged.as_slice(),
            [Untagged::MailboxStatus { .. }]
        ));
        d.take("A0001").unwrap().resolve(tagged("A0001", Status::Ok, "ok"), None);
        assert!(rl.await.unwrap().unwrap().untagged.is_empty());
    }

    #[test]
    fn mailbox_open_is_written_alone() {
        let tags = TagGenerator::new();
        let mut d = Dispatcher::new(true);
        let (noop, _rn) = request(&tags, Verb::Noop);
        let (select, _rs) = request(&tags, Verb::Select);
        let (after, _ra) = request(&tags, Verb::Noop);
        d.enqueue(noop);
        d.enqueue(select);
        d.enqueue(after);
        let first = d.next_ready().unwrap();
        send(&mut d, first);
        assert!(d.next_ready().is_none());
        d.take("A0001").unwrap().resolve(tagged("A0001", Status::Ok, "ok"), None);
        let select = d.next_ready().unwrap();
        assert_eq!(select.command.verb, Verb::Select);
        send(&mut d, select);
        assert!(d.next_ready().is_none());
        d.take("A0002").unwrap().resolve(tagged("A0002", Status::Ok, "ok"), None);
        assert_eq!(d.next_ready().unwrap().command.tag, "A0003");
    }

    #[tokio::test]
    async fn fail_all_resolves_pending_and_queued() {
        let tags = TagGenerator::new();
        let mut d = Dispatcher::new(false);
        let (a, ra) = request(&tags, Verb::Noop);
        let (b, rb) = request(&tags, Verb::Noop);
        send(&mut d, a);
        d.enqueue(b);
        d.fail_all(|| ImapError::ConnectionClosed);
        assert!(matches!(ra.await.unwrap(), Err(ImapError::ConnectionClosed)));
        assert!(matches!(rb.await.unwrap(), Err(ImapError::ConnectionClosed)));
        assert!(!d.has_pending());
    }

    #[test]
    fn dropped_caller_still_clears_entry() {
        let tags = TagGenerator::new();
        let mut d = Dispatcher::new(false);
        let (a, ra) = request(&tags, Verb::Noop);
        send(&mut d, a);
        drop(ra);
        d.take("A0001").unwrap().resolve(tagged("A0001", Status::Ok, "done"), None);
        assert!(!d.has_pending());
        assert!(d.can_send());
    }
}
