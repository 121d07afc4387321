//! SSE pass-through with token usage extraction.
//!
//! [`UsageExtractor`] line-buffers raw bytes across chunk boundaries and
//! reports every `data:` event whose `usage` carries a positive total.
//! [`observe_usage`] wraps an upstream byte stream so each chunk is forwarded
//! unchanged while the extractor watches it.

use bytes::Bytes;
use futures::{Stream, StreamExt};

use super::usage::TokenUsage;

/// Longest partial line kept while waiting for a newline.
const MAX_LINE_BUFFER: usize = 64 * 1024;

/// Line-buffered scanner for usage-bearing SSE events.
pub struct UsageExtractor<F> {
    buffer: Vec<u8>,
    on_usage: F,
}

impl<F> UsageExtractor<F>
where
    F: FnMut(TokenUsage),
{
    pub fn new(on_usage: F) -> Self {
        Self {
            buffer: Vec::new(),
            on_usage,
        }
    }

    /// Scan one chunk. Complete lines are parsed; the trailing partial line
    /// is kept for the next chunk.
    pub fn process_chunk(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line[..pos]);
        }

        if self.buffer.len() > MAX_LINE_BUFFER {
            tracing::warn!(
                buffered = self.buffer.len(),
                "SSE line exceeds buffer cap, discarding partial line"
            );
            self.buffer.clear();
        }
    }

    /// Give any residual partial line one last parse attempt.
    pub fn finish(mut self) {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(&line);
        }
    }

    fn process_line(&mut self, line: &[u8]) {
        let Ok(line) = std::str::from_utf8(line) else {
            return;
        };
        let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data == "[DONE]" {
            return;
        }

        let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
            return;
        };
        if let Some(usage) = event.get("usage").and_then(TokenUsage::from_object) {
            if usage.total_tokens > 0 {
                tracing::debug!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    total_tokens = usage.total_tokens,
                    "Extracted usage from stream"
                );
                (self.on_usage)(usage);
            }
        }
    }
}

/// Forward `upstream` unchanged, calling `on_usage` for every usage event.
///
/// The residual buffer is flushed when the upstream ends or errors. Dropping
/// the returned stream drops `upstream`, releasing the connection.
pub fn observe_usage<S, E, F>(upstream: S, on_usage: F) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
    F: FnMut(TokenUsage),
{
    let extractor = UsageExtractor::new(on_usage);
    futures::stream::unfold(
        (Box::pin(upstream), Some(extractor)),
        |(mut upstream, mut extractor)| async move {
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    if let Some(extractor) = extractor.as_mut() {
                        extractor.process_chunk(&chunk);
                    }
                    Some((Ok(chunk), (upstream, extractor)))
                }
                Some(Err(e)) => {
                    if let Some(extractor) = extractor.take() {
                        extractor.finish();
                    }
                    Some((Err(e), (upstream, extractor)))
                }
                None => {
                    if let Some(extractor) = extractor.take() {
                        extractor.finish();
                    }
                    None
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    /// Build SSE data from event lines, then split at the given byte positions.
    ///
    /// Each event string is appended with `\n\n` (SSE event delimiter).
    /// The resulting byte buffer is split at the specified positions to
    /// simulate TCP chunk boundaries.
    fn split_sse_at_positions(events: &[&str], split_positions: &[usize]) -> Vec<Vec<u8>> {
        let full: Vec<u8> = events
            .iter()
            .flat_map(|e| format!("{}\n\n", e).into_bytes())
            .collect();

        let mut chunks = Vec::new();
        let mut prev = 0;
        for &pos in split_positions {
            if pos > prev && pos < full.len() {
                chunks.push(full[prev..pos].to_vec());
                prev = pos;
            }
        }
        chunks.push(full[prev..].to_vec());
        chunks
    }

    fn collect_usage(chunks: &[Vec<u8>]) -> Vec<TokenUsage> {
        let mut seen = Vec::new();
        let mut extractor = UsageExtractor::new(|usage| seen.push(usage));
        for chunk in chunks {
            extractor.process_chunk(chunk);
        }
        extractor.finish();
        seen
    }

    fn usage(prompt: u64, completion: u64, total: u64) -> TokenUsage {
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        }
    }

    const CONTENT: &str = r#"data: {"id":"abc","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":"stop"}],"usage":null}"#;

    #[test]
    fn test_single_chunk_full_stream() {
        let events = [
            r#"data: {"id":"abc","choices":[{"index":0,"delta":{"role":"assistant"},"finish_reason":null}],"usage":null}"#,
            CONTENT,
            r#"data: {"id":"abc","choices":[],"usage":{"prompt_tokens":6,"completion_tokens":10,"total_tokens":16}}"#,
            "data: [DONE]",
        ];

        let chunks = split_sse_at_positions(&events, &[]);
        assert_eq!(chunks.len(), 1, "Should be a single chunk");
        assert_eq!(collect_usage(&chunks), vec![usage(6, 10, 16)]);
    }

    #[test]
    fn test_usage_split_across_chunks() {
        let events = [
            CONTENT,
            r#"data: {"id":"abc","choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
            "data: [DONE]",
        ];

        // Split at multiple positions inside the usage JSON line
        let chunks = split_sse_at_positions(&events, &[50, 120, 180]);
        assert!(chunks.len() > 1, "Should be split into multiple chunks");
        assert_eq!(collect_usage(&chunks), vec![usage(10, 5, 15)]);
    }

    #[test]
    fn test_every_split_point_yields_one_callback() {
        let events = [
            CONTENT,
            r#"data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":7,"total_tokens":10}}"#,
            "data: [DONE]",
        ];
        let full_len = split_sse_at_positions(&events, &[])[0].len();

        for split in 1..full_len {
            let chunks = split_sse_at_positions(&events, &[split]);
            assert_eq!(collect_usage(&chunks), vec![usage(3, 7, 10)], "split at {}", split);
        }
    }

    #[test]
    fn test_multiple_usage_events_each_reported() {
        let events = [
            r#"data: {"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#,
            r#"data: {"usage":{"prompt_tokens":1,"completion_tokens":3,"total_tokens":4}}"#,
        ];
        let chunks = split_sse_at_positions(&events, &[]);
        assert_eq!(collect_usage(&chunks), vec![usage(1, 1, 2), usage(1, 3, 4)]);
    }

    #[test]
    fn test_zero_total_ignored() {
        let events = [
            r#"data: {"usage":{"prompt_tokens":0,"completion_tokens":0,"total_tokens":0}}"#,
            "data: [DONE]",
        ];
        assert!(collect_usage(&split_sse_at_positions(&events, &[])).is_empty());
    }

    #[test]
    fn test_no_usage_with_done() {
        let events = [CONTENT, "data: [DONE]"];
        assert!(collect_usage(&split_sse_at_positions(&events, &[])).is_empty());
    }

    #[test]
    fn test_malformed_json_skipped() {
        let events = [
            "data: {this is not valid json}",
            r#"data: {"id":"abc","choices":[],"usage":{"prompt_tokens":8,"completion_tokens":3,"total_tokens":11}}"#,
            "data: [DONE]",
        ];
        let chunks = split_sse_at_positions(&events, &[]);
        assert_eq!(collect_usage(&chunks), vec![usage(8, 3, 11)]);
    }

    #[test]
    fn test_non_data_sse_fields_skipped() {
        // Mix in event:, id:, retry:, and comment lines
        let raw = b"event: message\nid: 123\nretry: 5000\n: {\"usage\":{\"total_tokens\":9}}\ndata: {\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":2,\"total_tokens\":4}}\n\ndata: [DONE]\n\n";
        assert_eq!(collect_usage(&[raw.to_vec()]), vec![usage(2, 2, 4)]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let raw = b"data: {\"id\":\"abc\",\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\r\n\r\ndata: [DONE]\r\n\r\n";
        assert_eq!(collect_usage(&[raw.to_vec()]), vec![usage(4, 2, 6)]);
    }

    #[test]
    fn test_data_without_space() {
        let raw = b"data:{\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n\ndata:[DONE]\n\n";
        assert_eq!(collect_usage(&[raw.to_vec()]), vec![usage(1, 2, 3)]);
    }

    #[test]
    fn test_residual_line_flushed_on_finish() {
        // Final event has no trailing newline
        let raw = b"data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":5,\"total_tokens\":10}}";
        assert_eq!(collect_usage(&[raw.to_vec()]), vec![usage(5, 5, 10)]);
    }

    #[test]
    fn test_empty_stream() {
        assert!(collect_usage(&[]).is_empty());
    }

    #[test]
    fn test_buffer_cap() {
        // Create a chunk exceeding 64KB without any newlines
        let huge_chunk = vec![b'x'; 65 * 1024];
        let normal = b"\ndata: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1,\"total_tokens\":2}}\n\n".to_vec();

        // After exceeding the cap the partial line is dropped and parsing resumes
        assert_eq!(collect_usage(&[huge_chunk, normal]), vec![usage(1, 1, 2)]);
    }

    #[tokio::test]
    async fn test_observe_usage_forwards_bytes_unchanged() {
        let events = [
            CONTENT,
            r#"data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":7,"total_tokens":10}}"#,
            "data: [DONE]",
        ];
        let chunks = split_sse_at_positions(&events, &[17, 140, 160]);
        let input: Vec<u8> = chunks.concat();

        let upstream = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, Infallible>(Bytes::from(c))),
        );
        let mut seen = Vec::new();
        let forwarded: Vec<Bytes> = observe_usage(upstream, |u| seen.push(u))
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        assert_eq!(forwarded.concat(), input);
        assert_eq!(seen, vec![usage(3, 7, 10)]);
    }

    #[tokio::test]
    async fn test_observe_usage_passes_errors_through() {
        let upstream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1,\"total_tokens\":2}}")),
            Err("connection reset"),
        ]);
        let mut seen = Vec::new();
        let items: Vec<Result<Bytes, &str>> = observe_usage(upstream, |u| seen.push(u)).collect().await;

        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
        assert_eq!(seen, vec![usage(1, 1, 2)], "partial line flushed on error");
    }
}
