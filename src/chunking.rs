//! Chunking utilities for splitting token streams into overlapping windows.
//!
//! Documents longer than the embedding provider's input budget are split into
//! fixed-size token windows. Adjacent windows overlap so that context spanning
//! a window boundary is still retrievable from at least one window.

/// Default window size in tokens.
pub const DEFAULT_WINDOW_SIZE: usize = 512;

/// Default minimum emitted window size in tokens.
pub const DEFAULT_MIN_WINDOW_SIZE: usize = 100;

/// Default overlap between adjacent windows, as a fraction of the window size.
pub const DEFAULT_OVERLAP_RATIO: f32 = 0.05;

/// Overlap between adjacent windows: either an absolute token count or a
/// fraction of the window size in `[0, 1)`.
///
/// Deserializes from a bare number: integers become [`Overlap::Tokens`],
/// floats become [`Overlap::Ratio`].
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Overlap {
    Tokens(usize),
    Ratio(f32),
}

impl Default for Overlap {
    fn default() -> Self {
        Overlap::Ratio(DEFAULT_OVERLAP_RATIO)
    }
}

impl Overlap {
    /// Resolve to an absolute token count for the given window size.
    ///
    /// The result is clamped to `window_size - 1` so the stride between
    /// window starts is always at least one token.
    pub fn resolve(&self, window_size: usize) -> usize {
        let tokens = match *self {
            Overlap::Tokens(n) => n,
            Overlap::Ratio(r) => (r.max(0.0) * window_size as f32).round() as usize,
        };
        tokens.min(window_size.saturating_sub(1))
    }
}

/// One emitted window of a token sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// The window content, tokens joined with single spaces.
    pub text: String,
    /// Zero-based window index within the document.
    pub index: usize,
    /// Token offset where this window starts in the original sequence.
    pub start_token: usize,
}

/// A lazy iterator over overlapping token windows.
///
/// A window spans `[start, min(start + size, len))` and is emitted only if its
/// length is at least `min_size`; shorter tails are silently dropped, so the
/// end of a short document can vanish. That is the intended policy, not a bug:
/// a fragment below the minimum is too small to embed usefully.
///
/// The iterator is finite and restartable — building a fresh one over the same
/// slice yields the same windows.
///
/// # Examples
///
/// ```
/// use nectar::chunking::{Overlap, TokenWindows};
///
/// let tokens: Vec<&str> = "one two three four five six".split(' ').collect();
/// let windows: Vec<_> = TokenWindows::new(&tokens, 4, 2, Overlap::Tokens(1)).collect();
/// assert_eq!(windows[0].text, "one two three four");
/// assert_eq!(windows[1].start_token, 3);
/// ```
#[derive(Debug, Clone)]
pub struct TokenWindows<'a> {
    tokens: &'a [&'a str],
    size: usize,
    min_size: usize,
    stride: usize,
    start: usize,
    index: usize,
    done: bool,
}

impl<'a> TokenWindows<'a> {
    pub fn new(
        tokens: &'a [&'a str],
        size: usize,
        min_size: usize,
        overlap: Overlap,
    ) -> Self {
        let size = size.max(1);
        let stride = size - overlap.resolve(size);

        Self {
            tokens,
            size,
            min_size,
            stride,
            start: 0,
            index: 0,
            done: tokens.is_empty(),
        }
    }
}

impl Iterator for TokenWindows<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        while !self.done {
            let start = self.start;
            let end = (start + self.size).min(self.tokens.len());

            if end >= self.tokens.len() {
                self.done = true;
            }
            self.start += self.stride;

            if end - start >= self.min_size {
                let chunk = Chunk {
                    text: self.tokens[start..end].join(" "),
                    index: self.index,
                    start_token: start,
                };
                self.index += 1;
                return Some(chunk);
            }
        }

        None
    }
}

/// Split text on whitespace and collect its overlapping token windows.
///
/// # Examples
///
/// ```
/// use nectar::chunking::{chunk_text, Overlap};
///
/// let chunks = chunk_text("hello overlapping window world", 3, 1, Overlap::Tokens(1));
/// assert_eq!(chunks.len(), 2);
/// assert_eq!(chunks[0].text, "hello overlapping window");
/// ```
pub fn chunk_text(
    text: &str,
    size: usize,
    min_size: usize,
    overlap: Overlap,
) -> Vec<Chunk> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    TokenWindows::new(&tokens, size, min_size, overlap).collect()
}
