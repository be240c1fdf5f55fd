//! Outbound splitting and inbound reassembly of data-channel frames (§4.E).
//!
//! Outbound: a payload is partitioned into chunks of at most
//! [`crate::config::PAYLOAD_CHUNK_BYTES`] bytes, each becoming a [`Frame`]
//! with ascending `part` in `[0, total)`. An empty payload still produces
//! exactly one frame (`total = 1, part = 0`).
//!
//! Inbound: frames for one `msg_id` are accepted strictly in order (the
//! spec's own recommendation over the alternative "sorted, full coverage"
//! policy seen in an older source tree — see DESIGN.md). An out-of-order
//! part discards the in-progress buffer; a buffer that sits idle past
//! `multipart_msg_timeout` is discarded as well.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::codec::{Frame, MsgType};
use crate::config::PAYLOAD_CHUNK_BYTES;

/// Split `payload` into chunks of at most `max_bytes` bytes, each landing on
/// a UTF-8 char boundary so no multi-byte sequence is ever torn across two
/// chunks — chunking on a raw byte offset would otherwise corrupt any
/// character straddling the boundary.
fn chunk_on_char_boundaries(s: &str, max_bytes: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let len = s.len();
    while start < len {
        let mut end = (start + max_bytes).min(len);
        while end > start && !s.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // `max_bytes` is smaller than this char's own encoding; take it
            // whole so a chunk is never empty.
            end = start + s[start..].chars().next().map_or(1, char::len_utf8);
        }
        chunks.push(&s[start..end]);
        start = end;
    }
    chunks
}

/// Split `payload` into frames for `msg_id` on `channel`, ready to hand to
/// the data channel in order.
pub fn split_outbound(channel: &str, msg_id: i32, payload: &str) -> Vec<Frame> {
    if payload.is_empty() {
        return vec![Frame {
            msg_type: MsgType::UserMsg,
            msg_id,
            channel: channel.to_string(),
            payload: String::new(),
            part: 0,
            total: 1,
        }];
    }

    let chunks = chunk_on_char_boundaries(payload, PAYLOAD_CHUNK_BYTES);
    let total = chunks.len() as u32;
    chunks
        .into_iter()
        .enumerate()
        .map(|(part, chunk)| Frame {
            msg_type: MsgType::UserMsg,
            msg_id,
            channel: channel.to_string(),
            payload: chunk.to_string(),
            part: part as u32,
            total,
        })
        .collect()
}

/// Outcome of delivering one inbound frame.
pub enum Delivery {
    /// No user-visible message yet (part accepted, reassembly ongoing).
    Pending,
    /// The reassembled message is ready for the given channel.
    Complete { channel: String, payload: String },
    /// The frame was invalid or violated the reassembly protocol and was
    /// dropped; `reason` is for the caller's debug log.
    Dropped { reason: &'static str },
}

struct Buffer {
    channel: String,
    parts: Vec<String>,
    next_expected: u32,
    total: u32,
    deadline: chrono::DateTime<chrono::Utc>,
}

/// Per-Node inbound multipart reassembler.
///
/// `incoming_multipart` of the spec's data model: a mapping from msg-id to
/// reassembly buffer, each with its own timeout.
pub struct InboundReassembler {
    clock: Arc<dyn Clock>,
    timeout: Duration,
    buffers: HashMap<i32, Buffer>,
}

impl InboundReassembler {
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            clock,
            timeout,
            buffers: HashMap::new(),
        }
    }

    /// Discard any buffers whose deadline has elapsed. Call periodically
    /// (the event loop ticks this on a timer per Node) since a buffer that
    /// never receives another part would otherwise linger forever.
    pub fn expire_stale(&mut self) {
        let now = self.clock.now();
        self.buffers.retain(|_, buf| buf.deadline > now);
    }

    pub fn accept(&mut self, frame: Frame) -> Delivery {
        if frame.total == 0 {
            return Delivery::Dropped { reason: "total <= 0" };
        }

        if frame.total == 1 {
            return Delivery::Complete {
                channel: frame.channel,
                payload: frame.payload,
            };
        }

        match self.buffers.get_mut(&frame.msg_id) {
            None => {
                if frame.part != 0 {
                    // No buffer and not the first part: nothing to attach to.
                    return Delivery::Dropped { reason: "part != 0 with no open buffer" };
                }
                self.buffers.insert(
                    frame.msg_id,
                    Buffer {
                        channel: frame.channel,
                        parts: vec![frame.payload],
                        next_expected: 1,
                        total: frame.total,
                        deadline: self.clock.now() + self.timeout,
                    },
                );
                Delivery::Pending
            }
            Some(buf) => {
                if frame.total != buf.total || frame.part != buf.next_expected {
                    self.buffers.remove(&frame.msg_id);
                    return Delivery::Dropped { reason: "out-of-order part" };
                }
                buf.parts.push(frame.payload);
                buf.next_expected += 1;
                if buf.next_expected == buf.total {
                    let buf = self.buffers.remove(&frame.msg_id).unwrap();
                    Delivery::Complete {
                        channel: buf.channel,
                        payload: buf.parts.concat(),
                    }
                } else {
                    Delivery::Pending
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    fn reassembler() -> InboundReassembler {
        InboundReassembler::new(Arc::new(TokioClock), Duration::from_millis(60_000))
    }

    #[test]
    fn empty_payload_is_one_frame() {
        let frames = split_outbound("chat", 1, "");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].part, 0);
        assert_eq!(frames[0].total, 1);
    }

    #[test]
    fn splits_on_chunk_boundary() {
        let payload = "a".repeat(PAYLOAD_CHUNK_BYTES * 2 + 1);
        let frames = split_outbound("chat", 1, &payload);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].total, 3);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f.part, i as u32);
        }
        assert_eq!(frames[0].payload.len(), PAYLOAD_CHUNK_BYTES);
        assert_eq!(frames[1].payload.len(), PAYLOAD_CHUNK_BYTES);
        assert_eq!(frames[2].payload.len(), 1);
    }

    #[test]
    fn never_splits_a_multi_byte_char_across_chunks() {
        // `PAYLOAD_CHUNK_BYTES` bytes of ASCII puts the next byte exactly one
        // byte into a following 3-byte '€', which is not a char boundary —
        // chunking on a raw byte offset would corrupt it.
        let payload = format!("{}{}", "a".repeat(PAYLOAD_CHUNK_BYTES - 1), "€".repeat(10));
        let frames = split_outbound("chat", 1, &payload);
        let reassembled: String = frames.iter().map(|f| f.payload.as_str()).collect();
        assert_eq!(reassembled, payload);
        for f in &frames {
            assert!(!f.payload.contains('\u{FFFD}'));
        }
    }

    #[test]
    fn single_part_message_delivers_directly() {
        let mut r = reassembler();
        let frame = Frame {
            msg_type: MsgType::UserMsg,
            msg_id: 1,
            channel: "chat".into(),
            payload: "hi".into(),
            part: 0,
            total: 1,
        };
        match r.accept(frame) {
            Delivery::Complete { channel, payload } => {
                assert_eq!(channel, "chat");
                assert_eq!(payload, "hi");
            }
            _ => panic!("expected immediate delivery"),
        }
    }

    #[test]
    fn reassembles_in_order_parts() {
        let mut r = reassembler();
        let mk = |part: u32, payload: &str| Frame {
            msg_type: MsgType::UserMsg,
            msg_id: 5,
            channel: "chat".into(),
            payload: payload.into(),
            part,
            total: 3,
        };
        assert!(matches!(r.accept(mk(0, "a")), Delivery::Pending));
        assert!(matches!(r.accept(mk(1, "b")), Delivery::Pending));
        match r.accept(mk(2, "c")) {
            Delivery::Complete { channel, payload } => {
                assert_eq!(channel, "chat");
                assert_eq!(payload, "abc");
            }
            _ => panic!("expected completion on last part"),
        }
    }

    #[test]
    fn out_of_order_part_discards_buffer() {
        let mut r = reassembler();
        let mk = |part: u32| Frame {
            msg_type: MsgType::UserMsg,
            msg_id: 9,
            channel: "chat".into(),
            payload: "x".into(),
            part,
            total: 3,
        };
        assert!(matches!(r.accept(mk(0)), Delivery::Pending));
        assert!(matches!(r.accept(mk(2)), Delivery::Dropped { .. }));
        // The buffer is gone; a correctly-ordered trailing part has nothing
        // to attach to.
        assert!(matches!(r.accept(mk(1)), Delivery::Dropped { .. }));
    }

    #[test]
    fn zero_total_is_dropped() {
        let mut r = reassembler();
        let frame = Frame {
            msg_type: MsgType::UserMsg,
            msg_id: 1,
            channel: "chat".into(),
            payload: String::new(),
            part: 0,
            total: 0,
        };
        assert!(matches!(r.accept(frame), Delivery::Dropped { .. }));
    }

    #[test]
    fn non_initial_part_with_no_buffer_is_dropped() {
        let mut r = reassembler();
        let frame = Frame {
            msg_type: MsgType::UserMsg,
            msg_id: 1,
            channel: "chat".into(),
            payload: "x".into(),
            part: 1,
            total: 3,
        };
        assert!(matches!(r.accept(frame), Delivery::Dropped { .. }));
    }
}
