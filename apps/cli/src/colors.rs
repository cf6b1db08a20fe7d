//! Status colors shared by every command's human output.

use colored::{ColoredString, Colorize};
use rlstudio_engine::{JobStatus, ProcessingStatus};

pub fn job_status(status: JobStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        JobStatus::Queued => label.dimmed(),
        JobStatus::Running => label.cyan(),
        JobStatus::Completed => label.green(),
        JobStatus::Failed => label.red(),
        JobStatus::Stopped => label.yellow(),
    }
}

pub fn processing_status(status: ProcessingStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        ProcessingStatus::Processing => label.cyan(),
        ProcessingStatus::Ready => label.green(),
        ProcessingStatus::Error => label.red(),
    }
}

/// Check or cross prefix for a finished unit of work.
pub fn outcome_mark(ok: bool) -> ColoredString {
    if ok { "✓".green() } else { "✗".red() }
}
