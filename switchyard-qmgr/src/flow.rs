//! Upstream flow control.
//!
//! Producers take a token before injecting mail. The scheduler hands tokens
//! out while it keeps up with the incoming area and takes surplus tokens back
//! when it falls behind.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

pub trait FlowControl: Debug + Send {
    /// Tokens currently available to producers.
    fn count(&self) -> usize;

    fn put(&mut self, tokens: usize);

    fn get(&mut self, tokens: usize);
}

/// Tokens shared with producers in the same process. Clones share the pool.
#[derive(Debug, Clone, Default)]
pub struct TokenCounter {
    tokens: Arc<AtomicUsize>,
}

impl TokenCounter {
    /// Take one token for a producer; `false` when none are left.
    pub fn try_take(&self) -> bool {
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| tokens.checked_sub(1))
            .is_ok()
    }
}

impl FlowControl for TokenCounter {
    fn count(&self) -> usize {
        self.tokens.load(Ordering::Acquire)
    }

    fn put(&mut self, tokens: usize) {
        self.tokens.fetch_add(tokens, Ordering::AcqRel);
    }

    fn get(&mut self, tokens: usize) {
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| Some(held.saturating_sub(tokens)));
    }
}
