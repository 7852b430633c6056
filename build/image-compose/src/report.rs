// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Diagnostic channel supplied by the build pipeline.
pub trait Reporter {
    fn debug(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Forwards diagnostics to the `log` facade; the embedding binary picks the
/// backend.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn debug(&self, msg: &str) {
        log::debug!("{msg}");
    }

    fn error(&self, msg: &str) {
        log::error!("{msg}");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Reporter;
    use std::cell::RefCell;

    /// Captures diagnostics so tests can assert on them.
    #[derive(Default)]
    pub struct Recorder {
        pub debug: RefCell<Vec<String>>,
        pub error: RefCell<Vec<String>>,
    }

    impl Reporter for Recorder {
        fn debug(&self, msg: &str) {
            self.debug.borrow_mut().push(msg.to_owned());
        }

        fn error(&self, msg: &str) {
            self.error.borrow_mut().push(msg.to_owned());
        }
    }
}
