// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! The one-shot driver: invokes a step on the hub and renders the streamed
//! progress, captured output, and terminal response.

use console::style;
use gpupgrade_idl::{chunk, message::Contents, Message, Response, Status, SubstepStatus};
use std::io::Write;
use tonic::Streaming;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("unable to connect to the hub: {0}")]
    Connect(#[from] tonic::transport::Error),
    #[error("{}", .0.message())]
    Step(#[from] tonic::Status),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// 1 for a failed step, 2 for a precondition violation.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Step(status) if status.code() == tonic::Code::FailedPrecondition => 2,
            _ => 1,
        }
    }
}

pub fn format_status(status: &SubstepStatus) -> String {
    let label = format!("{:<42}", status.substep().name());

    let state = match status.status() {
        Status::Running => style("running...").dim().to_string(),
        Status::Complete => style("complete").green().to_string(),
        Status::Failed => style("failed").red().to_string(),
        Status::Skipped => style("skipped").dim().to_string(),
        Status::UnknownStatus => String::from("unknown"),
    };

    format!("{}{}", label, state)
}

/// Drains the step's stream, printing progress (and, with `verbose`, the
/// captured output). Returns the terminal response, if the step sent one.
pub async fn render_stream(
    mut stream: Streaming<Message>,
    verbose: bool,
) -> Result<Option<Response>, CliError> {
    let mut response = None;

    while let Some(message) = stream.message().await? {
        match message.contents {
            Some(Contents::Status(status)) => {
                // A running line is overwritten by its terminal state.
                if status.status() == Status::Running {
                    print!("{}\r", format_status(&status));
                } else {
                    println!("{}", format_status(&status));
                }

                std::io::stdout().flush()?;
            }
            Some(Contents::Chunk(x)) => {
                if !verbose {
                    continue;
                }

                match x.r#type() {
                    chunk::Type::Stdout => std::io::stdout().write_all(&x.buffer)?,
                    chunk::Type::Stderr => std::io::stderr().write_all(&x.buffer)?,
                    chunk::Type::Unknown => {}
                }
            }
            Some(Contents::Response(x)) => response = Some(x),
            None => {}
        }
    }

    Ok(response)
}

pub fn display_success(message: impl std::fmt::Display) {
    println!("{} {}", style("✓").green(), message);
}

pub fn display_failure(message: impl std::fmt::Display) {
    eprintln!("{} {}", style("✗").red(), message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpupgrade_idl::{Step, Substep};

    #[test]
    fn test_format_status_pads_the_substep_name() {
        let status = SubstepStatus {
            step: Step::Execute as i32,
            substep: Substep::UpgradeMaster as i32,
            status: Status::Complete as i32,
        };

        let rendered = console::strip_ansi_codes(&format_status(&status)).to_string();

        assert!(rendered.starts_with("upgrade_master"));
        assert!(rendered.ends_with("complete"));
    }

    #[test]
    fn test_exit_codes() {
        let precondition = CliError::Step(tonic::Status::failed_precondition("no mirrors"));
        let internal = CliError::Step(tonic::Status::internal("boom"));

        assert_eq!(precondition.exit_code(), 2);
        assert_eq!(internal.exit_code(), 1);
    }
}
