// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use loom_model::{merge_adjacent, StreamedPart};

use crate::envelope::WireEvent;

/// Coalesces adjacent streamed parts before they are published as
/// `ContentPart` events, so a model that emits ten one-word text deltas
/// produces one `ContentPart` event instead of ten.
///
/// Holds at most one pending part. A part that cannot merge with the
/// pending one (different kind, different tool-call index, an encrypted
/// thinking block) flushes the pending part first.
#[derive(Debug, Default)]
pub struct MergeBuffer {
    pending: Option<StreamedPart>,
}

impl MergeBuffer {
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Feed one streamed part in. Returns the events to publish right now:
    /// empty when the part merged into the pending buffer, one `ContentPart`
    /// (the flushed predecessor) followed by the new part becoming pending
    /// when they could not merge.
    pub fn push(&mut self, part: StreamedPart) -> Vec<WireEvent> {
        match self.pending.take() {
            None => {
                self.pending = Some(part);
                Vec::new()
            }
            Some(prev) => match merge_adjacent(prev, part) {
                Ok(merged) => {
                    self.pending = Some(merged);
                    Vec::new()
                }
                Err((flushed, next)) => {
                    self.pending = Some(next);
                    vec![WireEvent::ContentPart { part: flushed }]
                }
            },
        }
    }

    /// Flush whatever part is pending, if any. Call at the end of a step.
    pub fn flush(&mut self) -> Option<WireEvent> {
        self.pending
            .take()
            .map(|part| WireEvent::ContentPart { part })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> StreamedPart {
        StreamedPart::Text(s.to_string())
    }

    #[test]
    fn single_part_is_buffered_not_emitted_until_flush() {
        let mut buf = MergeBuffer::new();
        assert!(buf.push(text("hello")).is_empty());
        let flushed = buf.flush().unwrap();
        match flushed {
            WireEvent::ContentPart { part: StreamedPart::Text(s) } => assert_eq!(s, "hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn adjacent_text_parts_merge_without_emitting() {
        let mut buf = MergeBuffer::new();
        assert!(buf.push(text("foo")).is_empty());
        assert!(buf.push(text("bar")).is_empty());
        let flushed = buf.flush().unwrap();
        match flushed {
            WireEvent::ContentPart { part: StreamedPart::Text(s) } => assert_eq!(s, "foobar"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_mergeable_part_flushes_predecessor_immediately() {
        let mut buf = MergeBuffer::new();
        assert!(buf.push(text("foo")).is_empty());
        let emitted = buf.push(StreamedPart::ToolCall {
            index: 0,
            id: Some("c1".into()),
            name: Some("shell".into()),
            arguments: "{}".into(),
        });
        assert_eq!(emitted.len(), 1);
        match &emitted[0] {
            WireEvent::ContentPart { part: StreamedPart::Text(s) } => assert_eq!(s, "foo"),
            other => panic!("unexpected {other:?}"),
        }
        // The tool-call delta is now pending.
        let flushed = buf.flush().unwrap();
        assert!(matches!(flushed, WireEvent::ContentPart { part: StreamedPart::ToolCall { .. } }));
    }

    #[test]
    fn flush_on_empty_buffer_returns_none() {
        let mut buf = MergeBuffer::new();
        assert!(buf.flush().is_none());
    }
}
