//! Lifecycle orchestration.
//!
//! Procedures are built as [`Plan`]s, executed by the [`Orchestrator`], and
//! for the dashboard dispatched onto background units by the controller.

#[cfg(feature = "tui")]
mod controller;
mod lifecycle;
mod steps;

#[cfg(feature = "tui")]
pub(crate) use controller::{run_controller, RunResult, UiCommand};
pub use lifecycle::{Orchestrator, Outcome, Progress};
pub use steps::{OperationKind, Plan, Step};

use crate::compose::runner::{CommandRunner, Invocation};
use crate::error::{Error, Result};

fn opener(url: &str) -> Invocation {
    if cfg!(target_os = "macos") {
        Invocation::new("open").arg(url)
    } else if cfg!(target_os = "windows") {
        Invocation::new("cmd").args(["/C", "start", "", url])
    } else {
        Invocation::new("xdg-open").arg(url)
    }
}

/// Hand `url` to the desktop's default browser.
pub async fn open_url(runner: &dyn CommandRunner, url: &str) -> Result<()> {
    let inv = opener(url);
    let out = runner
        .run(&inv)
        .await
        .map_err(|e| Error::tool(inv.command_line(), e.to_string()))?;
    if out.success {
        Ok(())
    } else {
        Err(Error::tool(inv.command_line(), out.stderr.trim()))
    }
}
