//! Fixed-size re-segmentation of a byte stream

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

use futures::{Stream, StreamExt, stream};

use crate::error::StreamError;

/// Ordered, finite stream of re-chunked PCM bytes
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, StreamError>> + Send>>;

/// Rolling accumulation buffer emitting `threshold`-sized chunks
#[derive(Debug)]
pub struct Rechunker {
    threshold: usize,
    pending: Vec<u8>,
}

impl Rechunker {
    /// Create a re-chunker; a zero threshold is treated as one byte
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            pending: Vec::with_capacity(threshold),
        }
    }

    /// Append received bytes, returning every full chunk now available
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);

        let full = self.pending.len() - self.pending.len() % self.threshold;
        let chunks = self.pending[..full]
            .chunks_exact(self.threshold)
            .map(<[u8]>::to_vec)
            .collect();
        self.pending.drain(..full);
        chunks
    }

    /// Flush the remainder as a final, possibly shorter chunk
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Drop any unflushed remainder
    pub fn discard(&mut self) {
        self.pending.clear();
    }

    /// Bytes held back waiting for a full chunk
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }
}

struct RechunkState<S> {
    source: Pin<Box<S>>,
    rechunker: Rechunker,
    ready: VecDeque<Vec<u8>>,
    finished: bool,
}

/// Re-chunk a fallible byte stream
///
/// Emits `threshold`-sized chunks in arrival order and flushes the remainder
/// at end of stream. A source error ends the sequence with
/// [`StreamError::NetworkFailure`]; the unflushed remainder is discarded.
pub fn rechunk<S, B, E>(source: S, threshold: usize) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = RechunkState {
        source: Box::pin(source),
        rechunker: Rechunker::new(threshold),
        ready: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.ready.pop_front() {
                return Some((Ok(chunk), state));
            }
            if state.finished {
                return None;
            }

            match state.source.next().await {
                Some(Ok(bytes)) => {
                    let chunks = state.rechunker.push(bytes.as_ref());
                    state.ready.extend(chunks);
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        error = %e,
                        discarded = state.rechunker.pending_len(),
                        "speech stream broke mid-body"
                    );
                    state.rechunker.discard();
                    state.finished = true;
                    return Some((Err(StreamError::NetworkFailure(e.to_string())), state));
                }
                None => {
                    state.finished = true;
                    if let Some(tail) = state.rechunker.finish() {
                        state.ready.push_back(tail);
                    }
                }
            }
        }
    }))
}
