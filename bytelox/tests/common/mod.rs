//! Shared helpers for the integration suites: run a source string on a
//! fresh machine and capture what it wrote.

#![allow(dead_code, unused_macros, unused_imports)]

use bytelox::{Error, VM};

/// The captured outcome of one program run.
pub struct Run {
    pub stdout: String,
    pub stderr: String,
    pub outcome: Result<(), Error>,
}

/// Execute `src` on a fresh VM, capturing program output and diagnostics.
pub fn run(src: &str) -> Run {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let outcome = {
        let mut vm = VM::new(Box::new(&mut stdout), Box::new(&mut stderr));
        vm.interpret(src)
    };
    Run {
        stdout: String::from_utf8(stdout).expect("program output is UTF-8"),
        stderr: String::from_utf8(stderr).expect("diagnostics are UTF-8"),
        outcome,
    }
}

/// Assert that a program runs cleanly and writes exactly the expected text
/// to stdout.
macro_rules! assert_prints {
    ($src:expr, $expected:expr $(,)?) => {
        let result = $crate::common::run($src);
        assert!(
            result.outcome.is_ok(),
            "program failed: {:?}\nsource: {}\nstderr: {}",
            result.outcome,
            $src,
            result.stderr
        );
        assert_eq!(result.stdout, $expected, "wrong output for: {}", $src);
    };
}

/// Assert that a program aborts with a runtime error whose report starts
/// with the given message.
macro_rules! assert_runtime_error {
    ($src:expr, $message:expr $(,)?) => {
        let result = $crate::common::run($src);
        assert!(
            matches!(result.outcome, Err(bytelox::Error::Runtime)),
            "expected a runtime error from: {}\nstdout: {}",
            $src,
            result.stdout
        );
        assert!(
            result.stderr.starts_with($message),
            "wrong error for: {}\nwant: {}\ngot: {}",
            $src,
            $message,
            result.stderr
        );
    };
}

/// Assert that a program fails to compile.
macro_rules! assert_compile_error {
    ($src:expr $(,)?) => {
        let result = $crate::common::run($src);
        assert!(
            matches!(result.outcome, Err(bytelox::Error::Compile)),
            "expected a compile error from: {}",
            $src
        );
    };
}

pub(crate) use {assert_compile_error, assert_prints, assert_runtime_error};
