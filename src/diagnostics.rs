/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Error and warning plumbing for a cache build.
//!
//! A build carries one [Diagnostics] object. The first fatal error poisons it:
//! every later stage checks [Diagnostics::has_error] and becomes a no-op, so
//! the top-level caller always reads the *original* failure, not a cascade.
//! Warnings accumulate freely and are surfaced alongside the output.
//!
//! Per-dylib problems are not fatal to the build; they travel as
//! `Result<T, String>` and end up as rejection reasons on the input in
//! question.

use std::fmt::Write;

/// Collects the fatal error (at most one) and the warnings of a build or of a
/// single input file.
#[derive(Default)]
pub struct Diagnostics {
    error: Option<String>,
    warnings: Vec<String>,
    verbose: bool,
}

impl Diagnostics {
    pub fn new(verbose: bool) -> Diagnostics {
        Diagnostics {
            error: None,
            warnings: Vec::new(),
            verbose,
        }
    }

    /// Latch a fatal error. Only the first one is kept; later calls are
    /// ignored so the root cause survives.
    pub fn error(&mut self, msg: impl Into<String>) {
        if self.error.is_none() {
            let msg = msg.into();
            log!("error: {}", msg);
            self.error = Some(msg);
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn warning(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        log!("warning: {}", msg);
        self.warnings.push(msg);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Progress chatter, printed only when the build was asked to be verbose.
    pub fn verbose(&self, msg: impl AsRef<str>) {
        if self.verbose {
            echo!("{}", msg.as_ref());
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Fold another object's warnings into this one, prefixing each with a
    /// context string (usually an install name).
    pub fn absorb_warnings(&mut self, context: &str, other: Diagnostics) {
        for w in other.warnings {
            let mut msg = String::new();
            write!(msg, "{}: {}", context, w).unwrap();
            self.warnings.push(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Diagnostics;

    #[test]
    fn first_error_wins() {
        let mut diag = Diagnostics::new(false);
        assert!(!diag.has_error());
        diag.error("first");
        diag.error("second");
        assert_eq!(diag.error_message(), Some("first"));
    }

    #[test]
    fn warnings_accumulate() {
        let mut diag = Diagnostics::new(false);
        diag.warning("a");
        diag.warning("b");
        assert_eq!(diag.warnings(), &["a".to_string(), "b".to_string()]);
        assert!(!diag.has_error());
    }
}
