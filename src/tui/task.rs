//! UI side of a background plan: the receivers the screen polls.

use crate::config::Settings;
use crate::orchestrator::{OperationKind, Plan, Progress, RunResult, UiCommand};
use crate::error::OrchestrationError;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot::error::TryRecvError;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, watch};

pub const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub enum Poll {
    Pending,
    Done(RunResult),
}

pub struct InFlight {
    /// Unique per launch.
    pub id: u64,
    pub kind: OperationKind,
    progress: watch::Receiver<Progress>,
    result: oneshot::Receiver<RunResult>,
    frame: usize,
}

impl InFlight {
    /// Hand `plan` to the controller. `None` when the controller is gone.
    pub fn launch(cmd_tx: &UnboundedSender<UiCommand>, plan: Plan, settings: Settings) -> Option<Self> {
        let kind = plan.kind.clone();
        let (progress_tx, progress) = watch::channel(Progress::default());
        let (reply, result) = oneshot::channel();
        cmd_tx
            .send(UiCommand::Run {
                plan,
                settings,
                progress: progress_tx,
                reply,
            })
            .ok()?;
        Some(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            progress,
            result,
            frame: 0,
        })
    }

    /// Non-blocking.
    pub fn poll(&mut self) -> Poll {
        match self.result.try_recv() {
            Ok(res) => Poll::Done(res),
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Closed) => Poll::Done(Err(OrchestrationError::Interrupted)),
        }
    }

    pub fn step_label(&self) -> String {
        let p = self.progress.borrow();
        if p.label.is_empty() {
            self.kind.label()
        } else if p.total > 1 {
            format!("{} ({}/{})", p.label, p.index + 1, p.total)
        } else {
            p.label.clone()
        }
    }

    pub fn advance_spinner(&mut self) {
        self.frame = (self.frame + 1) % SPINNER_FRAMES.len();
    }

    pub fn spinner(&self) -> &'static str {
        SPINNER_FRAMES[self.frame]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_is_pending_until_the_reply_arrives() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut task = InFlight::launch(
            &tx,
            Plan::stop(),
            Settings::defaults("localhost", crate::config::Connectivity::Local),
        )
        .unwrap();
        assert!(matches!(task.poll(), Poll::Pending));
        assert_eq!(task.step_label(), "Stopping");

        let Ok(UiCommand::Run { progress, reply, .. }) = rx.try_recv() else {
            panic!("expected a run command");
        };
        progress.send_replace(Progress {
            index: 0,
            total: 1,
            label: "Stopping services".into(),
        });
        assert_eq!(task.step_label(), "Stopping services");

        reply
            .send(Err(OrchestrationError::Interrupted))
            .ok()
            .unwrap();
        assert!(matches!(task.poll(), Poll::Done(Err(OrchestrationError::Interrupted))));
    }

    #[test]
    fn dropped_reply_reads_as_interrupted() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut task = InFlight::launch(
            &tx,
            Plan::restart(),
            Settings::defaults("localhost", crate::config::Connectivity::Local),
        )
        .unwrap();
        drop(rx);
        assert!(matches!(task.poll(), Poll::Done(Err(OrchestrationError::Interrupted))));
    }

    #[test]
    fn launch_fails_without_a_controller() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        assert!(InFlight::launch(
            &tx,
            Plan::stop(),
            Settings::defaults("localhost", crate::config::Connectivity::Local)
        )
        .is_none());
    }

    #[test]
    fn spinner_wraps() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut task = InFlight::launch(
            &tx,
            Plan::stop(),
            Settings::defaults("localhost", crate::config::Connectivity::Local),
        )
        .unwrap();
        for _ in 0..SPINNER_FRAMES.len() {
            task.advance_spinner();
        }
        assert_eq!(task.spinner(), SPINNER_FRAMES[0]);
    }
}
