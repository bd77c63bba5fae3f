//! Non-fatal findings produced while reading a settings partition.
//!
//! The settings orchestrator never fails because of these; it records them
//! here so a caller (or a test) can inspect what happened instead of
//! scraping stdout.

/// A single non-fatal finding surfaced while walking sectors or
/// consolidating records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// More than one CLOSED->OPEN transition was found while ordering the
    /// ring; the first one found was used anyway (conservative, matches
    /// firmware behavior).
    MultipleClosedToOpenTransitions { count: usize },
    /// The same settings key string was produced by more than one
    /// `key_record_id`; the last one encountered during pairing was kept.
    DuplicateKey { key: String },
}

/// Sink threaded through the read path. Callers drain it with `take` or
/// inspect it with `iter` after a `read`/`extract` call returns.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    findings: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.findings.push(diagnostic);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.findings.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.findings)
    }
}
