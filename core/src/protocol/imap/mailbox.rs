/*
 * mailbox.rs
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

//! Selected-mailbox state and the tracker that feeds it from untagged responses.

use std::collections::BTreeSet;

use super::codec::{ResponseCode, Status, Untagged};

/// Metadata of the selected mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxState {
    pub name: String,
    /// Opened with EXAMINE, or the server answered `[READ-ONLY]`.
    pub read_only: bool,
    /// Message count (EXISTS).
    pub exists: u32,
    pub recent: u32,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
    /// Sequence number of the first unseen message.
    pub unseen: Option<u32>,
    pub flags: BTreeSet<String>,
    pub permanent_flags: BTreeSet<String>,
}

/// Change notice delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    /// New message count.
    Exists(u32),
    Recent(u32),
    /// Message with this sequence number was removed; later numbers shift down by one.
    Expunge(u32),
    FlagsChanged { seq: u32, flags: Vec<String> },
    /// Flag set of the mailbox after a FLAGS update.
    MailboxFlags(Vec<String>),
    /// Cached UIDs for this mailbox are no longer valid.
    UidValidityChanged(u32),
    /// `[ALERT]` text the user must see.
    Alert(String),
    /// Tagged response for a tag this connection never issued.
    UnexpectedTag(String),
    Closed,
}

impl MailboxState {
    pub fn new(name: impl Into<String>, read_only: bool) -> Self {
        Self {
            name: name.into(),
            read_only,
            ..Self::default()
        }
    }

    pub fn message_count(&self) -> u32 {
        self.exists
    }

    /// Apply one untagged update. EXISTS and RECENT overwrite; EXPUNGE decrements;
    /// FLAGS merges.
    pub fn apply(&mut self, update: &Untagged) -> Option<MailboxEvent> {
        match update {
            Untagged::Exists(n) => {
                self.exists = *n;
                Some(MailboxEvent::Exists(*n))
            }
            Untagged::Recent(n) => {
                self.recent = *n;
                Some(MailboxEvent::Recent(*n))
            }
            Untagged::Expunge(seq) => {
                self.exists = self.exists.saturating_sub(1);
                Some(MailboxEvent::Expunge(*seq))
            }
            Untagged::Flags(flags) => {
                self.flags.extend(flags.iter().cloned());
                Some(MailboxEvent::MailboxFlags(self.flags.iter().cloned().collect()))
            }
            Untagged::Fetch {
                seq,
                flags: Some(flags),
            } => Some(MailboxEvent::FlagsChanged {
                seq: *seq,
                flags: flags.clone(),
            }),
            Untagged::Condition {
                code: Some(code), ..
            } => self.apply_code(code),
            _ => None,
        }
    }

    /// Apply a response code from an untagged OK or from the open command's completion.
    pub fn apply_code(&mut self, code: &ResponseCode) -> Option<MailboxEvent> {
        match code {
            ResponseCode::UidValidity(v) => {
                let changed = self.uid_validity.map_or(false, |old| old != *v);
                self.uid_validity = Some(*v);
                changed.then_some(MailboxEvent::UidValidityChanged(*v))
            }
            ResponseCode::UidNext(n) => {
                self.uid_next = Some(*n);
                None
            }
            ResponseCode::Unseen(n) => {
                self.unseen = Some(*n);
                None
            }
            ResponseCode::PermanentFlags(flags) => {
                self.permanent_flags = flags.iter().cloned().collect();
                None
            }
            ResponseCode::ReadOnly => {
                self.read_only = true;
                None
            }
            ResponseCode::ReadWrite => {
                self.read_only = false;
                None
            }
            _ => None,
        }
    }
}

/// True for untagged responses that describe the selected mailbox.
pub fn is_mailbox_update(update: &Untagged) -> bool {
    match update {
        Untagged::Exists(_) | Untagged::Recent(_) | Untagged::Expunge(_) | Untagged::Flags(_) => {
            true
        }
        Untagged::Fetch { flags, .. } => flags.is_some(),
        Untagged::Condition {
            status: Status::Ok,
            code: Some(code),
            ..
        } => matches!(
            code,
            ResponseCode::UidValidity(_)
                | ResponseCode::UidNext(_)
                | ResponseCode::Unseen(_)
                | ResponseCode::PermanentFlags(_)
                | ResponseCode::ReadOnly
                | ResponseCode::ReadWrite
        ),
        _ => false,
    }
}

/// Buffers the untagged preamble of a SELECT/EXAMINE until its tagged OK.
#[derive(Debug, Default)]
pub struct MailboxTracker {
    stage: Option<(String, MailboxState)>,
}

impl MailboxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh stage for the open command with this tag.
    pub fn begin(&mut self, tag: &str, name: &str, read_only: bool) {
        self.stage = Some((tag.to_string(), MailboxState::new(name, read_only)));
    }

    pub fn is_staging(&self) -> bool {
        self.stage.is_some()
    }

    /// Apply to the stage; false when no open command is pending.
    pub fn stage(&mut self, update: &Untagged) -> bool {
        match self.stage.as_mut() {
            Some((_, state)) => {
                state.apply(update);
                true
            }
            None => false,
        }
    }

    /// Hand over the staged state when `tag` completes. Any other tag leaves it in place.
    pub fn finish(&mut self, tag: &str) -> Option<MailboxState> {
        match &self.stage {
            Some((t, _)) if t == tag => self.stage.take().map(|(_, state)| state),
            _ => None,
        }
    }

    pub fn discard(&mut self) {
        self.stage = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_is_idempotent() {
        let mut once = MailboxState::new("INBOX", false);
        once.apply(&Untagged::Exists(42));
        let mut twice = once.clone();
        twice.apply(&Untagged::Exists(42));
        assert_eq!(once, twice);
        assert_eq!(twice.message_count(), 42);
    }

    #[test]
    fn expunge_decrements_each_time() {
        let mut state = MailboxState::new("INBOX", false);
        state.apply(&Untagged::Exists(10));
        assert_eq!(state.apply(&Untagged::Expunge(3)), Some(MailboxEvent::Expunge(3)));
        state.apply(&Untagged::Expunge(3));
        assert_eq!(state.exists, 8);
    }

    #[test]
    fn expunge_on_empty_mailbox_saturates() {
        let mut state = MailboxState::new("INBOX", false);
        state.apply(&Untagged::Expunge(1));
        assert_eq!(state.exists, 0);
    }

    #[test]
    fn flags_merge_into_set() {
        let mut state = MailboxState::new("INBOX", false);
        state.apply(&Untagged::Flags(vec!["\\Seen".into(), "\\Deleted".into()]));
        let event = state.apply(&Untagged::Flags(vec!["\\Seen".into(), "$Junk".into()]));
        assert_eq!(
            event,
            Some(MailboxEvent::MailboxFlags(vec![
                "$Junk".into(),
                "\\Deleted".into(),
                "\\Seen".into(),
            ]))
        );
        assert_eq!(state.flags.len(), 3);
    }

    #[test]
    fn codes_update_metadata() {
        let mut state = MailboxState::new("INBOX", false);
        let update = |code| Untagged::Condition {
            status: Status::Ok,
            code: Some(code),
            text: String::new(),
        };
        assert_eq!(state.apply(&update(ResponseCode::UidValidity(7))), None);
        state.apply(&update(ResponseCode::UidNext(100)));
        state.apply(&update(ResponseCode::Unseen(5)));
        state.apply(&update(ResponseCode::ReadOnly));
        assert_eq!(state.uid_validity, Some(7));
        assert_eq!(state.uid_next, Some(100));
        assert_eq!(state.unseen, Some(5));
        assert!(state.read_only);
        assert_eq!(
            state.apply(&update(ResponseCode::UidValidity(8))),
            Some(MailboxEvent::UidValidityChanged(8))
        );
    }

    #[test]
    fn alert_is_not_a_mailbox_update() {
        let alert = Untagged::Condition {
            status: Status::Ok,
            code: Some(ResponseCode::Alert),
            text: "maintenance".into(),
        };
        assert!(!is_mailbox_update(&alert));
        assert!(is_mailbox_update(&Untagged::Exists(1)));
        assert!(!is_mailbox_update(&Untagged::Fetch { seq: 1, flags: None }));
    }

    #[test]
    fn tracker_hands_over_stage_only_for_its_tag() {
        let mut tracker = MailboxTracker::new();
        assert!(!tracker.stage(&Untagged::Exists(1)));
        tracker.begin("A0002", "INBOX", false);
        assert!(tracker.stage(&Untagged::Exists(42)));
        assert_eq!(tracker.finish("A0001"), None);
        let state = tracker.finish("A0002").unwrap();
        assert_eq!(state.name, "INBOX");
        assert_eq!(state.exists, 42);
        assert!(!tracker.is_staging());
    }

    #[test]
    fn discarded_stage_never_surfaces() {
        let mut tracker = MailboxTracker::new();
        tracker.begin("A0003", "Nope", true);
        tracker.stage(&Untagged::Exists(9));
        tracker.discard();
        assert_eq!(tracker.finish("A0003"), None);
    }
}
