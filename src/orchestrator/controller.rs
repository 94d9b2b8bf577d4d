//! Background unit dispatcher for the dashboard.
//!
//! The UI thread never awaits anything. It sends a [`UiCommand`] carrying the
//! sending half of a reply channel and keeps the receiving half, which it polls
//! on its check ticks. Each command runs as its own unit; nothing is queued
//! behind a running plan.

use super::lifecycle::{Orchestrator, Outcome, Progress};
use super::steps::Plan;
use crate::compose::ServiceStatus;
use crate::config::Settings;
use crate::error::OrchestrationError;
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;

pub(crate) type RunResult = std::result::Result<Outcome, OrchestrationError>;

/// Requests from the UI thread.
pub(crate) enum UiCommand {
    Run {
        plan: Plan,
        settings: Settings,
        progress: watch::Sender<Progress>,
        reply: oneshot::Sender<RunResult>,
    },
    FetchStatus {
        settings: Settings,
        reply: oneshot::Sender<Vec<ServiceStatus>>,
    },
    /// Follow logs until `stop` fires or its sender is dropped.
    StreamLogs {
        settings: Settings,
        service: Option<String>,
        tail: usize,
        sink: UnboundedSender<String>,
        stop: oneshot::Receiver<()>,
    },
    OpenUrl(String),
    Quit,
}

async fn stream_logs(
    orch: Orchestrator,
    settings: Settings,
    service: Option<String>,
    tail: usize,
    sink: UnboundedSender<String>,
    mut stop: oneshot::Receiver<()>,
) {
    let compose = orch.compose(&settings);
    let mut stream = match compose.follow_logs(service.as_deref(), tail).await {
        Ok(s) => s,
        Err(e) => {
            let _ = sink.send(format!("muxbee | {e}"));
            return;
        }
    };
    loop {
        tokio::select! {
            _ = &mut stop => break,
            line = stream.next_line() => match line {
                Ok(Some(line)) => {
                    if sink.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "log stream ended");
                    break;
                }
            },
        }
    }
    // Dropping the stream kills `compose logs -f`.
    drop(stream);
    tracing::debug!("log stream closed");
}

/// Serve UI commands until `Quit` or until the UI side hangs up.
pub(crate) async fn run_controller(orch: Orchestrator, mut cmd_rx: UnboundedReceiver<UiCommand>) -> Result<()> {
    let mut units: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Run { plan, settings, progress, reply }) => {
                        let orch = orch.clone();
                        units.spawn(async move {
                            let res = orch.execute(&plan, settings, Some(&progress)).await;
                            // The screen may have stopped observing; the run still completed.
                            let _ = reply.send(res);
                        });
                    }
                    Some(UiCommand::FetchStatus { settings, reply }) => {
                        let compose = orch.compose(&settings);
                        units.spawn(async move {
                            let _ = reply.send(compose.status_with_versions().await);
                        });
                    }
                    Some(UiCommand::StreamLogs { settings, service, tail, sink, stop }) => {
                        units.spawn(stream_logs(orch.clone(), settings, service, tail, sink, stop));
                    }
                    Some(UiCommand::OpenUrl(url)) => {
                        let runner = orch.runner().clone();
                        units.spawn(async move {
                            if let Err(e) = super::open_url(runner.as_ref(), &url).await {
                                tracing::warn!(url = %url, "failed to open browser: {e:#}");
                            }
                        });
                    }
                    Some(UiCommand::Quit) | None => break,
                }
            }
            Some(joined) = units.join_next(), if !units.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("background unit failed: {e}");
                }
            }
        }
    }

    // In-flight plans cannot be cancelled; they finish or die with the runtime.
    units.detach_all();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::Catalog;
    use crate::compose::runner::fake::FakeRunner;
    use crate::compose::runner::CommandOutput;
    use crate::config::{Connectivity, Paths};
    use crate::error::BestEffortError;
    use crate::matrix::BotConversations;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoBots;

    #[async_trait]
    impl BotConversations for NoBots {
        async fn setup_bots(&self, _: &Settings, _: &[String]) -> Vec<BestEffortError> {
            Vec::new()
        }
        async fn cleanup_bot(&self, _: &Settings, _: &str) -> std::result::Result<(), BestEffortError> {
            Ok(())
        }
    }

    fn orchestrator(dir: &tempfile::TempDir, runner: FakeRunner) -> Orchestrator {
        Orchestrator::new(
            Paths::new(dir.path().join("c"), dir.path().join("d")),
            Arc::new(Catalog::embedded().unwrap()),
            Arc::new(runner),
            Arc::new(NoBots),
        )
    }

    #[tokio::test]
    async fn replies_arrive_on_the_oneshot() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            &dir,
            FakeRunner::new(|_| CommandOutput::ok(r#"{"Name":"muxbee-postgres-1","State":"exited"}"#)),
        );
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = tokio::spawn(run_controller(orch, rx));

        let settings = Settings::defaults("localhost", Connectivity::Local);
        let (reply, status_rx) = oneshot::channel();
        tx.send(UiCommand::FetchStatus {
            settings: settings.clone(),
            reply,
        })
        .ok()
        .unwrap();
        let statuses = status_rx.await.unwrap();
        assert_eq!(statuses[0].name, "postgres");

        let (progress, progress_rx) = watch::channel(Progress::default());
        let (reply, run_rx) = oneshot::channel();
        tx.send(UiCommand::Run {
            plan: Plan::stop(),
            settings,
            progress,
            reply,
        })
        .ok()
        .unwrap();
        assert!(run_rx.await.unwrap().is_ok());
        assert_eq!(progress_rx.borrow().label, "Stopping services");

        tx.send(UiCommand::Quit).ok().unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn log_stream_forwards_lines_and_stops_on_eof() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::succeeding().with_stream(&["synapse-1  | started", "postgres-1  | ready"]);
        let orch = orchestrator(&dir, runner);
        let (sink, mut lines) = tokio::sync::mpsc::unbounded_channel();
        let (_stop_tx, stop) = oneshot::channel();
        stream_logs(
            orch,
            Settings::defaults("localhost", Connectivity::Local),
            None,
            100,
            sink,
            stop,
        )
        .await;
        assert_eq!(lines.recv().await.as_deref(), Some("synapse-1  | started"));
        assert_eq!(lines.recv().await.as_deref(), Some("postgres-1  | ready"));
        assert_eq!(lines.recv().await, None);
    }

    #[tokio::test]
    async fn controller_exits_when_the_ui_hangs_up() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, FakeRunner::succeeding());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<UiCommand>();
        drop(tx);
        run_controller(orch, rx).await.unwrap();
    }
}
