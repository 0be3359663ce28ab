//! Server-Sent Events decoding
//!
//! Reads arrive as arbitrary byte slices: a UTF-8 character or an event block
//! may be split across two reads. The decoder keeps both kinds of remainder
//! until the next read completes them.

use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use super::event::StreamEvent;
use crate::error::{Error, Result};

const EVENT_DELIMITER: &str = "\n\n";
const DATA_PREFIX: &str = "data:";

/// Counters for one decoded stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub events: usize,
    pub malformed: usize,
    pub bytes: usize,
}

/// Incremental SSE decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Trailing bytes of an incomplete UTF-8 sequence
    partial_utf8: Vec<u8>,
    /// Decoded text not yet terminated by a blank line
    buffer: String,
    stats: StreamStats,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read; returns every event completed by it, in order
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.stats.bytes += bytes.len();
        self.decode_utf8(bytes);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find(EVENT_DELIMITER) {
            let block: String = self.buffer.drain(..end + EVENT_DELIMITER.len()).collect();
            self.parse_block(&block[..end], &mut events);
        }
        events
    }

    /// End of stream: an unterminated block cannot form an event
    pub fn finish(&mut self) -> StreamStats {
        if !self.buffer.trim().is_empty() || !self.partial_utf8.is_empty() {
            debug!(
                "Discarding {} unterminated bytes at end of stream",
                self.buffer.len() + self.partial_utf8.len()
            );
        }
        self.buffer.clear();
        self.partial_utf8.clear();
        self.stats
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    fn decode_utf8(&mut self, bytes: &[u8]) {
        let mut pending = std::mem::take(&mut self.partial_utf8);
        pending.extend_from_slice(bytes);

        let mut rest: &[u8] = &pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.push_text(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.push_text(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        // Incomplete sequence at the end: keep for next read.
                        None => {
                            self.partial_utf8 = after.to_vec();
                            break;
                        }
                        Some(len) => {
                            self.push_text(char::REPLACEMENT_CHARACTER.encode_utf8(&mut [0; 4]));
                            rest = &after[len..];
                        }
                    }
                }
            }
        }
    }

    fn push_text(&mut self, text: &str) {
        if text.contains('\r') {
            self.buffer.push_str(&text.replace("\r\n", "\n").replace('\r', "\n"));
        } else {
            self.buffer.push_str(text);
        }
    }

    fn parse_block(&mut self, block: &str, events: &mut Vec<StreamEvent>) {
        for line in block.lines() {
            let Some(data) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };
            let data = data.strip_prefix(' ').unwrap_or(data).trim_end();
            if data.is_empty() {
                continue;
            }

            match serde_json::from_str::<StreamEvent>(data) {
                Ok(event) => {
                    self.stats.events += 1;
                    events.push(event);
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!("Skipping malformed event ({}): {:.120}", e, data);
                }
            }
        }
    }
}

/// Decode a response body into an ordered stream of events
///
/// Read failures end the stream with one `Err` item. Malformed events are
/// skipped; `error` events are yielded like any other event.
pub fn events<S, E>(body: S) -> impl Stream<Item = Result<StreamEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send,
{
    stream! {
        let mut decoder = SseDecoder::new();
        let mut body = Box::pin(body);

        while let Some(read) = body.next().await {
            match read {
                Ok(bytes) => {
                    for event in decoder.push(&bytes) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(Error::Transport(e.to_string()));
                    return;
                }
            }
        }

        let stats = decoder.finish();
        debug!(
            "Event stream ended: {} events, {} malformed, {} bytes",
            stats.events, stats.malformed, stats.bytes
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn audio_line(index: usize) -> String {
        format!(
            "data: {{\"type\":\"audio\",\"audio\":\"AAAA\",\"sample_rate\":24000,\"segment_index\":{index}}}\n\n"
        )
    }

    #[test]
    fn test_split_across_reads() {
        let text = audio_line(0);
        let (a, b) = text.split_at(17);

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(a.as_bytes()).is_empty());
        let events = decoder.push(b.as_bytes());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "audio");
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let text = "data: {\"type\":\"content\",\"content\":\"caf\u{e9} \u{1f50a}\"}\n\n";
        let bytes = text.as_bytes();
        let cut = text.find('\u{1f50a}').unwrap() + 2;

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&bytes[..cut]).is_empty());
        let events = decoder.push(&bytes[cut..]);
        assert_eq!(
            events,
            vec![StreamEvent::Content {
                content: "caf\u{e9} \u{1f50a}".to_string()
            }]
        );
    }

    #[test]
    fn test_malformed_event_is_skipped() {
        let mut decoder = SseDecoder::new();
        let input = format!("{}data: {{bad json\n\n{}", audio_line(0), audio_line(1));
        let events = decoder.push(input.as_bytes());

        assert_eq!(events.len(), 2);
        assert_eq!(decoder.stats().malformed, 1);
        assert_eq!(decoder.stats().events, 2);
    }

    #[test]
    fn test_non_data_lines_ignored() {
        let mut decoder = SseDecoder::new();
        let input = ": keepalive\n\nevent: message\nid: 4\ndata: {\"type\":\"done\"}\n\ndata:\n\n";
        assert_eq!(decoder.push(input.as_bytes()), vec![StreamEvent::Done]);
        assert_eq!(decoder.stats().malformed, 0);
    }

    #[test]
    fn test_crlf_delimiters() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"type\":\"done\"}\r\n\r\n");
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn test_unterminated_tail_is_discarded() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"done\"}").is_empty());
        let stats = decoder.finish();
        assert_eq!(stats.events, 0);
    }

    #[tokio::test]
    async fn test_events_preserve_arrival_order() {
        let body = format!(
            "data: {{\"type\":\"content\",\"content\":\"a\"}}\n\n{}data: {{\"type\":\"content\",\"content\":\"b\"}}\n\n{}data: {{\"type\":\"done\"}}\n\n",
            audio_line(0),
            audio_line(1)
        );
        // Deliver in 7-byte reads.
        let reads: Vec<std::result::Result<Bytes, std::io::Error>> = body
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let kinds: Vec<&'static str> = events(stream::iter(reads))
            .map(|e| e.unwrap().kind())
            .collect()
            .await;
        assert_eq!(kinds, vec!["content", "audio", "content", "audio", "done"]);
    }

    #[tokio::test]
    async fn test_read_failure_ends_stream() {
        let reads: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(audio_line(0))),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from(audio_line(1))),
        ];
        let items: Vec<Result<StreamEvent>> = events(stream::iter(reads)).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(Error::Transport(_))));
    }
}
