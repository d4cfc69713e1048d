//! Completion tags.
//!
//! Every asynchronous operation a session issues carries a tag naming the
//! session and the kind of event its completion represents. The transport
//! only moves raw `u64` tokens, so a [`Tag`] is packed as
//! `(session_id << EVENT_BITS) | event` on the way in and unpacked by the
//! dispatcher on the way out. This module is the only place that knows the
//! layout.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// Width of the event field in a packed tag.
pub const EVENT_BITS: u32 = 8;

const EVENT_MASK: u64 = (1 << EVENT_BITS) - 1;

/// Largest session identifier a packed tag can carry.
pub const MAX_SESSION_ID: u64 = u64::MAX >> EVENT_BITS;

/// What a completion means for the session it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum EventKind {
    /// A client was accepted for the session's pending call.
    Connected = 0,
    /// A read from the client finished.
    ReadDone = 1,
    /// A write to the client finished.
    WriteDone = 2,
    /// The call is over.
    Finished = 3,
}

impl EventKind {
    /// All event kinds, in wire order.
    pub const ALL: [Self; 4] = [
        Self::Connected,
        Self::ReadDone,
        Self::WriteDone,
        Self::Finished,
    ];

    /// Wire value of this event.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Event for a wire value, if it names one.
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Connected),
            1 => Some(Self::ReadDone),
            2 => Some(Self::WriteDone),
            3 => Some(Self::Finished),
            _ => None,
        }
    }

    /// Upper-case name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::ReadDone => "READ_DONE",
            Self::WriteDone => "WRITE_DONE",
            Self::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session identifier paired with the event an operation will report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tag {
    /// Session the operation belongs to.
    pub session_id: SessionId,
    /// Event the completion represents.
    pub event: EventKind,
}

impl Tag {
    /// Build a tag.
    pub const fn new(session_id: SessionId, event: EventKind) -> Self {
        Self { session_id, event }
    }

    /// Pack into the transport's opaque token.
    ///
    /// Identifiers above [`MAX_SESSION_ID`] lose their high bits; the
    /// allocator never hands those out.
    pub const fn encode(self) -> u64 {
        (self.session_id.get() << EVENT_BITS) | self.event.as_u8() as u64
    }

    /// Unpack a transport token. Returns `None` when the event field does not
    /// name a known event.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(raw: u64) -> Option<Self> {
        match EventKind::from_u8((raw & EVENT_MASK) as u8) {
            Some(event) => Some(Self {
                session_id: SessionId::new(raw >> EVENT_BITS),
                event,
            }),
            None => None,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.event)
    }
}

/// Pack a session identifier and event into a transport token.
pub const fn encode(session_id: SessionId, event: EventKind) -> u64 {
    Tag::new(session_id, event).encode()
}

/// Unpack a transport token.
pub const fn decode(raw: u64) -> Option<Tag> {
    Tag::decode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_puts_event_in_low_bits() {
        let raw = encode(SessionId::new(5), EventKind::WriteDone);
        assert_eq!(raw, (5 << EVENT_BITS) | 2);
    }

    #[test]
    fn unknown_event_bits_do_not_decode() {
        let raw = (9 << EVENT_BITS) | 0x7f;
        assert_eq!(decode(raw), None);
    }

    #[test]
    fn zero_token_is_session_zero_connected() {
        let tag = decode(0).unwrap();
        assert_eq!(tag.session_id, SessionId::new(0));
        assert_eq!(tag.event, EventKind::Connected);
    }

    #[test]
    fn max_session_id_survives_packing() {
        let tag = Tag::new(SessionId::new(MAX_SESSION_ID), EventKind::Finished);
        assert_eq!(Tag::decode(tag.encode()), Some(tag));
    }

    #[test]
    fn event_names() {
        let names: Vec<String> = EventKind::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(names, ["CONNECTED", "READ_DONE", "WRITE_DONE", "FINISHED"]);
    }

    #[test]
    fn event_serde_uses_log_names() {
        let json = serde_json::to_string(&EventKind::ReadDone).unwrap();
        assert_eq!(json, "\"READ_DONE\"");
    }

    #[test]
    fn tag_display() {
        let tag = Tag::new(SessionId::new(3), EventKind::Connected);
        assert_eq!(tag.to_string(), "3/CONNECTED");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn any_event() -> impl Strategy<Value = EventKind> {
            proptest::sample::select(EventKind::ALL.to_vec())
        }

        proptest! {
            #[test]
            fn roundtrip_every_reachable_id(id in 0..=MAX_SESSION_ID, event in any_event()) {
                let tag = Tag::new(SessionId::new(id), event);
                prop_assert_eq!(Tag::decode(tag.encode()), Some(tag));
            }

            #[test]
            fn distinct_tags_pack_distinctly(
                a in 0..=MAX_SESSION_ID,
                b in 0..=MAX_SESSION_ID,
                ea in any_event(),
                eb in any_event(),
            ) {
                let ta = Tag::new(SessionId::new(a), ea);
                let tb = Tag::new(SessionId::new(b), eb);
                prop_assert_eq!(ta == tb, ta.encode() == tb.encode());
            }
        }
    }
}
