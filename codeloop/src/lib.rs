//! Supervised generate, admit, execute, judge, retry loop for machine-generated code.
//!
//! A natural-language command is turned into a Python program by an external
//! generator. Nothing runs until the program passes a static admission gate;
//! admitted programs run in a contained child process, and their output is
//! judged for failure signals before success is reported. Failures feed a
//! narrow diagnostic back into generation, up to a fixed retry ceiling.
//!
//! - **[`core`]**: Pure, deterministic logic (admission, judging, session state).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (process execution, generation,
//!   config, logs). Isolated behind traits to enable scripted fakes in tests.
//!
//! [`supervisor`] coordinates the two; [`upstream`] guards every generation call.

pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod report;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod upstream;
