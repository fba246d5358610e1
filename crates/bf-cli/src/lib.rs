//! bidsflow: command-line tools for the bidsflow job server
//!
//! Provides the Process Supervisor behind `service-ctl`, the tunnel
//! commands behind `tunnel-ctl` and the job client behind `bidsflow`.

pub mod client;
pub mod commands;
pub mod output;
pub mod supervisor;

use std::process::ExitCode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bf_core::error::{exit, BfError};

use crate::output::print_error;

/// Install the tracing subscriber for a command-line tool
///
/// Logs go to stderr so `--json` output on stdout stays parseable.
pub fn init_logging(quiet: bool, verbose: u8) {
    let log_level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Exit code for an error, taken from the first classified cause
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<BfError>())
        .map(BfError::exit_code)
        .unwrap_or(exit::FAILURE)
}

/// Turn the result of a command into the process exit code
pub fn finish(result: anyhow::Result<i32>) -> ExitCode {
    let code = match result {
        Ok(code) => code,
        Err(e) => {
            print_error(&format!("{:#}", e));
            exit_code(&e)
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use bf_core::error::{JobError, SupervisorError, TunnelError};

    #[test]
    fn test_exit_code_of_classified_errors() {
        let err = anyhow::Error::from(BfError::from(SupervisorError::PortInUse { port: 8080 }));
        assert_eq!(exit_code(&err), exit::PORT_IN_USE);

        let err = anyhow::Error::from(BfError::from(TunnelError::NoSession));
        assert_eq!(exit_code(&err), exit::NO_SESSION);
    }

    #[test]
    fn test_exit_code_through_context() {
        let result: Result<(), BfError> = Err(JobError::NotFound("abc".into()).into());
        let err = result.context("Failed to fetch job").unwrap_err();
        assert_eq!(exit_code(&err), exit::JOB_NOT_FOUND);
    }

    #[test]
    fn test_unclassified_error_is_generic_failure() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(exit_code(&err), exit::FAILURE);
    }
}
