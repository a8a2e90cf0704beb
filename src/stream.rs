use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tokio_util::sync::CancellationToken;

/// Emitted alone when the full text is empty, so a stream never ends silently.
pub const FALLBACK_CHUNK: &str = "No response was generated.";

/// Position within the text being replayed. Lives exactly as long as its stream.
struct StreamCursor {
    text: String,
    offset: usize,
}

impl StreamCursor {
    fn new(text: String) -> Self {
        Self { text, offset: 0 }
    }

    /// Next word together with its surrounding whitespace. Leading whitespace
    /// goes with the first word, so concatenating every chunk gives back the
    /// original text byte for byte.
    fn next_chunk(&mut self) -> Option<String> {
        let rest = self.text.get(self.offset..).filter(|r| !r.is_empty())?;

        let mut end = rest.len();
        let mut seen_word = false;
        let mut trailing = false;
        for (i, c) in rest.char_indices() {
            if c.is_whitespace() {
                if seen_word {
                    trailing = true;
                }
            } else if trailing {
                end = i;
                break;
            } else {
                seen_word = true;
            }
        }

        let chunk = rest[..end].to_string();
        self.offset += end;
        Some(chunk)
    }
}

/// Split `text` the way the emulator will emit it.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut cursor = StreamCursor::new(text.to_string());
    std::iter::from_fn(|| cursor.next_chunk()).collect()
}

/// Replays a complete response as a paced sequence of chunks, giving every
/// tier the same incremental-delivery contract. Single use: `emit` consumes it.
pub struct StreamEmulator {
    pacing: Duration,
}

struct EmitState {
    cursor: StreamCursor,
    pacing: Duration,
    first: bool,
    cancel: CancellationToken,
}

impl StreamEmulator {
    pub fn new(pacing: Duration) -> Self {
        Self { pacing }
    }

    /// Stream `full_text` word by word. Stops at the next pacing boundary once
    /// `cancel` fires or the stream is dropped.
    pub fn emit(self, full_text: String, cancel: CancellationToken) -> BoxStream<'static, String> {
        if full_text.trim().is_empty() {
            return stream::once(async { FALLBACK_CHUNK.to_string() }).boxed();
        }

        let state = EmitState {
            cursor: StreamCursor::new(full_text),
            pacing: self.pacing,
            first: true,
            cancel,
        };

        // Fused: callers may poll again after the end.
        stream::unfold(state, |mut st| async move {
            if st.cancel.is_cancelled() {
                return None;
            }
            // Take the chunk first so the end of text is not delayed by a pause.
            let Some(chunk) = st.cursor.next_chunk() else {
                return None;
            };
            if !st.first && !st.pacing.is_zero() {
                tokio::select! {
                    _ = st.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(st.pacing) => {}
                }
            }
            st.first = false;
            Some((chunk, st))
        })
        .fuse()
        .boxed()
    }
}
