//! Secret redaction for step output and policy inputs.

use crate::scope::{CredentialVisitor, RunState};

/// Placeholder written in place of a secret.
pub const REDACTED: &str = "((redacted))";

/// Shortest secret line that gets redacted. Single characters would mangle
/// ordinary output.
pub const MIN_SECRET_LEN: usize = 2;

/// Visitor that scrubs every yielded credential out of `text`.
#[derive(Debug, Clone)]
pub struct Redactor {
    text: String,
}

impl Redactor {
    pub fn new(text: impl Into<String>) -> Self {
        Redactor { text: text.into() }
    }

    pub fn into_inner(self) -> String {
        self.text
    }
}

impl CredentialVisitor for Redactor {
    fn yield_cred(&mut self, _name: &str, value: &str) {
        for line in value.split('\n') {
            let line = line.trim();
            if line.chars().count() >= MIN_SECRET_LEN && self.text.contains(line) {
                self.text = self.text.replace(line, REDACTED);
            }
        }
    }
}

/// Redact every credential interpolated into `state` from `text`.
pub fn redact(state: &dyn RunState, text: &str) -> String {
    let mut redactor = Redactor::new(text);
    state.iterate_interpolated_creds(&mut redactor);
    redactor.into_inner()
}
