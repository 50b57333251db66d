/*
 * connection.rs
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

//! IMAP connection: the caller-facing handle and the task that owns the socket.
//!
//! The handle checks the phase, allocates a tag and sends the command down a channel.
//! The task writes it when the dispatcher allows, reads responses in server order,
//! feeds them through the state machine and mailbox tracker, and resolves each
//! request by tag. All interaction with the task is through the channel.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};

use super::codec::{
    decode_response, peek_tag, Argument, Command, ListEntry, Response, ResponseCode, Status,
    Tagged, Untagged, Verb,
};
use super::dispatcher::{Completion, Dispatcher, Request, TagGenerator};
use super::error::{ImapError, ProtocolError};
use super::mailbox::{is_mailbox_update, MailboxEvent, MailboxState, MailboxTracker};
use super::state::{Phase, Session};
use super::transport::{Transport, DEFAULT_MAX_LITERAL};
use crate::config::{Credentials, ImapConfig, Security, DEFAULT_TIMEOUT};
use crate::net::ImapStream;
use crate::sasl::SaslExchange;

const EVENT_CAPACITY: usize = 64;

/// Tunables of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bound on the greeting and on every wait for a response while commands are pending.
    pub timeout: Duration,
    pub pipelining: bool,
    pub max_literal_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            pipelining: false,
            max_literal_size: DEFAULT_MAX_LITERAL,
        }
    }
}

impl From<&ImapConfig> for ConnectionOptions {
    fn from(config: &ImapConfig) -> Self {
        Self {
            timeout: config.timeout,
            pipelining: config.pipelining,
            max_literal_size: config.max_literal_size,
        }
    }
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one IMAP connection. Dropping it closes the connection.
pub struct Connection {
    command_tx: mpsc::UnboundedSender<Request>,
    session: Arc<Mutex<Session>>,
    tags: TagGenerator,
    events: broadcast::Sender<MailboxEvent>,
}

impl Connection {
    /// Open the socket described by `config`, read the greeting and negotiate
    /// STARTTLS if configured. Authentication is left to the caller.
    pub async fn connect(config: &ImapConfig) -> Result<Self, ImapError> {
        let options = ConnectionOptions::from(config);
        log::debug!(
            "[imap] connecting to {}:{} ({:?})",
            config.host,
            config.port,
            config.security
        );
        let stream = match config.security {
            Security::ImplicitTls => {
                within(config.timeout, ImapStream::connect_tls(&config.host, config.port)).await?
            }
            Security::Plain | Security::StartTls => {
                within(config.timeout, ImapStream::connect_plain(&config.host, config.port)).await?
            }
        };
        let mut transport = Transport::new(stream, options.max_literal_size);
        let mut session = Session::new();
        let tags = TagGenerator::new();
        greet(&mut transport, &mut session, options.timeout).await?;

        if config.security == Security::StartTls {
            if session.phase() != Phase::NotAuthenticated {
                return Err(connect_error("server pre-authenticated; STARTTLS not possible"));
            }
            if session.capabilities().is_empty() {
                let command = Command::new(tags.next_tag(), Verb::Capability, vec![]);
                let (untagged, tagged) = round_trip(&mut transport, &command, options.timeout).await?;
                for u in untagged {
                    if let Untagged::Capability(caps) = u {
                        session.set_capabilities(caps);
                    }
                }
                if tagged.status != Status::Ok {
                    return Err(connect_error(&format!("CAPABILITY failed: {}", tagged.text)));
                }
            }
            if !session.has_capability("STARTTLS") {
                return Err(connect_error("server does not offer STARTTLS"));
            }
            let command = Command::new(tags.next_tag(), Verb::StartTls, vec![]);
            let (_, tagged) = round_trip(&mut transport, &command, options.timeout).await?;
            if tagged.status != Status::Ok {
                return Err(connect_error(&format!("STARTTLS refused: {}", tagged.text)));
            }
            session.on_completion(Verb::StartTls, Status::Ok, None);
            let plain = transport.into_inner()?;
            let tls = within(options.timeout, plain.upgrade_to_tls(&config.host)).await?;
            log::debug!("[imap] TLS established with {}", config.host);
            transport = Transport::new(tls, options.max_literal_size);
        }
        Ok(Self::start(transport, session, tags, options))
    }

    /// Run over an already connected stream. The greeting is read before returning.
    pub async fn from_stream<S>(stream: S, options: ConnectionOptions) -> Result<Self, ImapError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut transport = Transport::new(stream, options.max_literal_size);
        let mut session = Session::new();
        greet(&mut transport, &mut session, options.timeout).await?;
        Ok(Self::start(transport, session, TagGenerator::new(), options))
    }

    fn start<S>(
        transport: Transport<S>,
        session: Session,
        tags: TagGenerator,
        options: ConnectionOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let session = Arc::new(Mutex::new(session));
        let driver = Driver {
            transport,
            commands,
            session: Arc::clone(&session),
            events: events.clone(),
            dispatcher: Dispatcher::new(options.pipelining),
            tracker: MailboxTracker::new(),
            timeout: options.timeout,
            deadline: None,
        };
        tokio::spawn(driver.run());
        Self {
            command_tx,
            session,
            tags,
            events,
        }
    }

    pub fn phase(&self) -> Phase {
        lock(&self.session).phase()
    }

    /// Snapshot of the selected mailbox.
    pub fn mailbox(&self) -> Option<MailboxState> {
        lock(&self.session).mailbox().cloned()
    }

    pub fn capabilities(&self) -> Vec<String> {
        lock(&self.session).capabilities().to_vec()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        lock(&self.session).has_capability(name)
    }

    /// Mailbox change notices, alerts and closure.
    pub fn subscribe(&self) -> broadcast::Receiver<MailboxEvent> {
        self.events.subscribe()
    }

    /// Returns true while the connection task is running.
    pub fn is_alive(&self) -> bool {
        !self.command_tx.is_closed()
    }

    async fn execute(
        &self,
        verb: Verb,
        args: Vec<Argument>,
        followups: Vec<Vec<u8>>,
    ) -> Result<Completion, ImapError> {
        lock(&self.session).check(verb)?;
        let command = Command::new(self.tags.next_tag(), verb, args);
        let (request, reply) = Request::new(command, followups);
        self.command_tx
            .send(request)
            .map_err(|_| ImapError::ConnectionClosed)?;
        reply.await.map_err(|_| ImapError::ConnectionClosed)?
    }

    /// CAPABILITY; the refreshed list is also kept on the connection.
    pub async fn capability(&self) -> Result<Vec<String>, ImapError> {
        let completion = self.execute(Verb::Capability, vec![], vec![]).await?;
        let listed = completion.untagged.into_iter().find_map(|u| match u {
            Untagged::Capability(caps) => Some(caps),
            _ => None,
        });
        Ok(listed.unwrap_or_else(|| self.capabilities()))
    }

    pub async fn noop(&self) -> Result<(), ImapError> {
        self.execute(Verb::Noop, vec![], vec![]).await.map(|_| ())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), ImapError> {
        let args = vec![Argument::string(username), Argument::string(password)];
        authentication_result(self.execute(Verb::Login, args, vec![]).await)
    }

    /// AUTHENTICATE with the preferred mechanism when the server advertises it,
    /// LOGIN otherwise.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<(), ImapError> {
        let (mechanism, sasl_ir, login_disabled) = {
            let session = lock(&self.session);
            session.check(Verb::Authenticate)?;
            (
                credentials
                    .mechanism
                    .filter(|m| session.has_capability(&m.capability())),
                session.has_capability("SASL-IR"),
                session.has_capability("LOGINDISABLED"),
            )
        };
        let result = match mechanism {
            Some(mechanism) => {
                let exchange =
                    SaslExchange::new(mechanism, "", &credentials.username, &credentials.secret)?;
                let mut args = vec![Argument::atom(mechanism.name())];
                let inline = match exchange.initial_argument() {
                    Some(initial) if sasl_ir => {
                        args.push(Argument::atom(initial));
                        true
                    }
                    _ => false,
                };
                log::debug!("[imap] authenticating {} with {}", credentials.username, mechanism);
                self.execute(Verb::Authenticate, args, exchange.continuation_lines(inline))
                    .await
            }
            None => {
                if login_disabled {
                    return Err(ImapError::Authentication(
                        "server disabled LOGIN and offers none of the configured mechanisms".into(),
                    ));
                }
                if let Some(m) = credentials.mechanism {
                    log::debug!("[imap] server does not offer {}, using LOGIN", m);
                }
                let args = vec![
                    Argument::string(&credentials.username),
                    Argument::string(&credentials.secret),
                ];
                self.execute(Verb::Login, args, vec![]).await
            }
        };
        authentication_result(result)
    }

    /// SELECT: open `name` read-write.
    pub async fn open_mailbox(&self, name: &str) -> Result<MailboxState, ImapError> {
        self.open(Verb::Select, name).await
    }

    /// EXAMINE: open `name` read-only.
    pub async fn examine(&self, name: &str) -> Result<MailboxState, ImapError> {
        self.open(Verb::Examine, name).await
    }

    async fn open(&self, verb: Verb, name: &str) -> Result<MailboxState, ImapError> {
        let completion = self.execute(verb, vec![Argument::string(name)], vec![]).await?;
        completion.mailbox.ok_or_else(|| {
            ProtocolError::Malformed(format!("{} completed without mailbox state", verb)).into()
        })
    }

    /// CLOSE: expunge silently and leave the mailbox.
    pub async fn close(&self) -> Result<(), ImapError> {
        self.execute(Verb::Close, vec![], vec![]).await.map(|_| ())
    }

    /// EXPUNGE; returns the sequence numbers in the order the server reported them.
    pub async fn expunge(&self) -> Result<Vec<u32>, ImapError> {
        let completion = self.execute(Verb::Expunge, vec![], vec![]).await?;
        Ok(completion
            .untagged
            .iter()
            .filter_map(|u| match u {
                Untagged::Expunge(seq) => Some(*seq),
                _ => None,
            })
            .collect())
    }

    pub async fn list(&self, reference: &str, pattern: &str) -> Result<Vec<ListEntry>, ImapError> {
        let args = vec![Argument::string(reference), Argument::string(pattern)];
        let completion = self.execute(Verb::List, args, vec![]).await?;
        Ok(completion
            .untagged
            .into_iter()
            .filter_map(|u| match u {
                Untagged::List(entry) => Some(entry),
                _ => None,
            })
            .collect())
    }

    /// STATUS `name` (`items`), e.g. `&["MESSAGES", "UIDNEXT"]`.
    pub async fn status(&self, name: &str, items: &[&str]) -> Result<Vec<(String, u32)>, ImapError> {
        let args = vec![
            Argument::string(name),
            Argument::atom(format!("({})", items.join(" "))),
        ];
        let completion = self.execute(Verb::Status, args, vec![]).await?;
        Ok(completion
            .untagged
            .into_iter()
            .find_map(|u| match u {
                Untagged::MailboxStatus { items, .. } => Some(items),
                _ => None,
            })
            .ok_or_else(|| {
                ProtocolError::Malformed("STATUS completed without status data".into())
            })?)
    }

    /// LOGOUT. A server that hangs up before its tagged OK still counts as logged out.
    pub async fn logout(&self) -> Result<(), ImapError> {
        match self.execute(Verb::Logout, vec![], vec![]).await {
            Ok(_) | Err(ImapError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn authentication_result(result: Result<Completion, ImapError>) -> Result<(), ImapError> {
    match result {
        Ok(_) => Ok(()),
        Err(ImapError::Server { text, .. }) => Err(ImapError::Authentication(text)),
        Err(e) => Err(e),
    }
}

fn connect_error(message: &str) -> ImapError {
    ImapError::Connect(io::Error::new(io::ErrorKind::Other, message.to_string()))
}

async fn within<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> Result<T, ImapError> {
    timeout(limit, fut)
        .await
        .map_err(|_| ImapError::Timeout)?
        .map_err(ImapError::Connect)
}

/// Read the server greeting into `session`.
async fn greet<S>(
    transport: &mut Transport<S>,
    session: &mut Session,
    wait: Duration,
) -> Result<(), ImapError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = transport.read_frame(Some(Instant::now() + wait)).await?;
    log::trace!("[imap] S: {}", String::from_utf8_lossy(&frame));
    match decode_response(&frame)? {
        Response::Untagged(greeting) => session.on_greeting(&greeting),
        other => Err(ProtocolError::Malformed(format!("expected greeting, got {:?}", other)).into()),
    }
}

/// One command answered before the connection task starts (CAPABILITY, STARTTLS).
async fn round_trip<S>(
    transport: &mut Transport<S>,
    command: &Command,
    wait: Duration,
) -> Result<(Vec<Untagged>, Tagged), ImapError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    log::trace!("[imap] C: {}", command.redacted());
    transport.write_all(&command.encode().concat()).await?;
    let deadline = Instant::now() + wait;
    let mut untagged = Vec::new();
    loop {
        let frame = transport.read_frame(Some(deadline)).await?;
        log::trace!("[imap] S: {}", String::from_utf8_lossy(&frame));
        match decode_response(&frame)? {
            Response::Untagged(Untagged::Bye { text, .. }) => {
                log::debug!("[imap] server closed during setup: {}", text);
                return Err(ImapError::ConnectionClosed);
            }
            Response::Untagged(u) => untagged.push(u),
            Response::Tagged(t) if t.tag == command.tag => return Ok((untagged, t)),
            Response::Tagged(t) => return Err(ProtocolError::UnexpectedTag(t.tag).into()),
            Response::Continuation(_) => return Err(ProtocolError::UnexpectedContinuation.into()),
        }
    }
}

/// Owns the transport; runs until the connection ends.
struct Driver<S> {
    transport: Transport<S>,
    commands: mpsc::UnboundedReceiver<Request>,
    session: Arc<Mutex<Session>>,
    events: broadcast::Sender<MailboxEvent>,
    dispatcher: Dispatcher,
    tracker: MailboxTracker,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let reason = self.drive().await;
        self.shutdown(reason).await;
    }

    /// Returns why the connection ended.
    async fn drive(&mut self) -> ImapError {
        let mut accepting = true;
        loop {
            if let Err(e) = self.flush_queue().await {
                return e;
            }
            if lock(&self.session).phase() == Phase::LoggedOut {
                return ImapError::ConnectionClosed;
            }
            if !accepting && !self.dispatcher.has_pending() {
                return ImapError::ConnectionClosed;
            }
            let deadline = if self.dispatcher.has_pending() {
                self.deadline
            } else {
                None
            };
            tokio::select! {
                request = self.commands.recv(), if accepting => match request {
                    Some(request) => self.dispatcher.enqueue(request),
                    None => accepting = false,
                },
                frame = self.transport.read_frame(deadline) => match frame {
                    Ok(frame) => {
                        if let Err(e) = self.handle_frame(frame).await {
                            return e;
                        }
                    }
                    Err(e) => return e,
                },
            }
        }
    }

    /// Write every queued request the dispatcher lets through.
    async fn flush_queue(&mut self) -> Result<(), ImapError> {
        while let Some(Request {
            command,
            followups,
            reply,
        }) = self.dispatcher.next_ready()
        {
            if reply.is_closed() {
                log::debug!("[imap] {} abandoned before it was sent", command.tag);
                continue;
            }
            // the phase may have moved since the caller checked it
            let allowed = lock(&self.session).check(command.verb);
            if let Err(e) = allowed {
                let _ = reply.send(Err(e));
                continue;
            }
            let mut segments: VecDeque<Vec<u8>> = command.encode().into();
            let first = match segments.pop_front() {
                Some(first) => first,
                None => continue,
            };
            segments.extend(followups);
            if !self
                .dispatcher
                .register(command.tag.clone(), command.verb, segments, reply)
            {
                continue;
            }
            if command.verb.opens_mailbox() {
                let name = command.args.first().map(Argument::text).unwrap_or_default();
                self.tracker
                    .begin(&command.tag, &name, command.verb == Verb::Examine);
            }
            log::trace!("[imap] C: {}", command.redacted());
            self.transport.write_all(&first).await?;
            if self.deadline.is_none() {
                self.deadline = Some(Instant::now() + self.timeout);
            }
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Bytes) -> Result<(), ImapError> {
        log::trace!("[imap] S: {}", String::from_utf8_lossy(&frame));
        match decode_response(&frame) {
            Ok(Response::Untagged(untagged)) => self.handle_untagged(untagged),
            Ok(Response::Tagged(tagged)) => self.handle_tagged(tagged),
            Ok(Response::Continuation(text)) => {
                let (tag, segment) = self.dispatcher.continuation().map_err(|e| {
                    log::warn!("[imap] continuation \"{}\" with nothing to send", text);
                    e
                })?;
                log::trace!("[imap] C: <{} bytes for {}>", segment.len(), tag);
                self.transport.write_all(&segment).await?;
            }
            Err(e) if e.is_desync() => return Err(e.into()),
            Err(e) => self.handle_malformed(&frame, e),
        }
        self.deadline = if self.dispatcher.has_pending() {
            Some(Instant::now() + self.timeout)
        } else {
            None
        };
        Ok(())
    }

    /// A framed line that does not parse fails only the request it belongs to.
    fn handle_malformed(&mut self, frame: &[u8], err: ProtocolError) {
        log::warn!("[imap] {}", err);
        match peek_tag(frame) {
            Some(tag) => match self.dispatcher.take(&tag) {
                Ok(pending) => {
                    self.tracker.finish(&tag);
                    pending.fail(ImapError::Protocol(err));
                }
                Err(unknown) => {
                    log::warn!("[imap] {}", unknown);
                    self.publish(MailboxEvent::UnexpectedTag(tag));
                }
            },
            None => {
                if !self.dispatcher.flag_error(err) {
                    log::debug!("[imap] malformed line with no request pending");
                }
            }
        }
    }

    fn handle_untagged(&mut self, untagged: Untagged) {
        match &untagged {
            Untagged::Capability(caps)
            | Untagged::Condition {
                code: Some(ResponseCode::Capability(caps)),
                ..
            } => lock(&self.session).set_capabilities(caps.clone()),
            Untagged::Condition {
                code: Some(ResponseCode::Alert),
                text,
                ..
            } => {
                log::warn!("[imap] ALERT: {}", text);
                self.publish(MailboxEvent::Alert(text.clone()));
            }
            Untagged::Condition {
                status: Status::No | Status::Bad,
                text,
                ..
            } => log::warn!("[imap] server warning: {}", text),
            Untagged::Bye { text, .. } => log::debug!("[imap] BYE: {}", text),
            _ => {}
        }

        if is_mailbox_update(&untagged) {
            if !self.tracker.stage(&untagged) {
                let event = lock(&self.session)
                    .mailbox_mut()
                    .and_then(|mailbox| mailbox.apply(&untagged));
                if let Some(event) = event {
                    self.publish(event);
                }
            }
            // the count of removed messages is also the EXPUNGE command's result
            if !matches!(untagged, Untagged::Expunge(_)) {
                return;
            }
        }

        match untagged {
            Untagged::Condition { .. } | Untagged::PreAuth { .. } | Untagged::Bye { .. } => {}
            data => {
                if !self.dispatcher.collect(data) {
                    log::trace!("[imap] unsolicited data dropped");
                }
            }
        }
    }

    fn handle_tagged(&mut self, tagged: Tagged) {
        let pending = match self.dispatcher.take(&tagged.tag) {
            Ok(pending) => pending,
            Err(e) => {
                log::warn!("[imap] {}", e);
                self.publish(MailboxEvent::UnexpectedTag(tagged.tag));
                return;
            }
        };
        let verb = pending.verb();
        log::debug!("[imap] {} {} {}", tagged.tag, verb, tagged.status);

        // an open whose preamble could not be read counts as failed
        let status = if verb.opens_mailbox() && pending.has_error() {
            Status::No
        } else {
            tagged.status
        };
        let mut opened = self.tracker.finish(&tagged.tag);
        if status != Status::Ok {
            opened = None;
        }
        if let (Some(state), Some(code)) = (opened.as_mut(), tagged.code.as_ref()) {
            state.apply_code(code);
        }

        let (mailbox, event) = {
            let mut session = lock(&self.session);
            if let Some(ResponseCode::Capability(caps)) = &tagged.code {
                session.set_capabilities(caps.clone());
            }
            let previous = session
                .mailbox()
                .and_then(|m| m.uid_validity.map(|v| (m.name.clone(), v)));
            session.on_completion(verb, status, opened);
            let current = if verb.opens_mailbox() {
                session.mailbox().cloned()
            } else {
                None
            };
            let event = match (&previous, &current) {
                (Some((name, old)), Some(now)) if *name == now.name => now
                    .uid_validity
                    .filter(|v| v != old)
                    .map(MailboxEvent::UidValidityChanged),
                _ => None,
            };
            (current, event)
        };
        if let Some(event) = event {
            self.publish(event);
        }
        pending.resolve(tagged, mailbox);
    }

    fn publish(&self, event: MailboxEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn shutdown(mut self, reason: ImapError) {
        match &reason {
            ImapError::ConnectionClosed => log::debug!("[imap] connection closed"),
            other => log::warn!("[imap] closing connection: {}", other),
        }
        lock(&self.session).on_closed();
        let make = || match &reason {
            ImapError::Timeout => ImapError::Timeout,
            ImapError::Protocol(e) => ImapError::Protocol(e.clone()),
            _ => ImapError::ConnectionClosed,
        };
        self.dispatcher.fail_all(make);
        self.commands.close();
        while let Ok(request) = self.commands.try_recv() {
            request.reject(make());
        }
        self.tracker.discard();
        self.publish(MailboxEvent::Closed);
        self.transport.shutdown().await;
    }
}
