use dashmap::{mapref::entry::Entry, DashMap};

/// Outcome of the completion path for one challenge token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOutcome {
    Pending,
    Succeeded,
    Failed,
}

/// De-duplicates completion signals by challenge token.
///
/// Entries live as long as the orchestrator; they are never pruned.
#[derive(Debug, Default)]
pub(crate) struct TokenLedger {
    tokens: DashMap<String, TokenOutcome>,
}

impl TokenLedger {
    /// Records `token` as pending. Returns false if it was already seen.
    ///
    /// Check and insert happen under the shard lock of `token` only.
    pub(crate) fn begin(&self, token: &str) -> bool {
        match self.tokens.entry(token.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(TokenOutcome::Pending);
                true
            }
        }
    }

    pub(crate) fn finish(&self, token: &str, outcome: TokenOutcome) {
        self.tokens.insert(token.to_owned(), outcome);
    }

    pub(crate) fn outcome(&self, token: &str) -> Option<TokenOutcome> {
        self.tokens.get(token).map(|entry| *entry)
    }
}
