//! Evaluation Executor
//!
//! Feeds a list of projects to the peers of a [`MultiEvalServer`] and
//! collects one [`ProjectResult`] per project.
//!
//! Outstanding requests are tracked per logical peer in a [`RemoteTodos`],
//! so a peer that reconnects keeps its in-flight work. A project is done
//! when its correlated `Success`/`Failure` arrives, when it overruns the
//! evaluation timeout, or when its peer's record expires.

use crate::worker::EvalOutcome;
use fxhash::FxHashMap;
use indicatif::{ProgressBar, ProgressStyle};
use kiosk_core::{CommError, MultiEvalServer, PeerIdentity};
use kiosk_ipc::{RemoteTodos, Signal, SignalKind};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Per-project evaluation limit
    pub eval_timeout: Duration,
    pub poll_interval: Duration,
    /// Dispatch to a busy peer when none is idle
    pub queue_on_busy: bool,
    pub show_progress: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            eval_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(100),
            queue_on_busy: false,
            show_progress: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Passed,
    Failed,
    TimedOut,
    Lost,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectStatus::Passed => "passed",
            ProjectStatus::Failed => "failed",
            ProjectStatus::TimedOut => "timed_out",
            ProjectStatus::Lost => "lost",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectResult {
    pub project: String,
    pub status: ProjectStatus,
    pub message: String,
    /// `ip:pid` of the peer that ran it
    pub peer: Option<String>,
    pub subprocess_pid: Option<u32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
struct InFlight {
    project: String,
    started: Instant,
}

pub struct EvalExecutor {
    config: ExecutionConfig,
}

impl EvalExecutor {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    /// Evaluate every project, returning results in completion order
    pub fn execute(&self, server: &mut MultiEvalServer, projects: &[String]) -> Vec<ProjectResult> {
        let pb = if self.config.show_progress {
            ProgressBar::new(projects.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        let mut run = Run {
            queue: projects.iter().cloned().collect(),
            in_flight: FxHashMap::default(),
            outcomes: FxHashMap::default(),
            results: Vec::with_capacity(projects.len()),
        };

        while run.results.len() < projects.len() {
            server.process_signals(self.config.poll_interval);

            let before = run.results.len();
            run.collect_replies(server);
            run.expire_lost(server);
            run.expire_overdue(server, self.config.eval_timeout);
            run.dispatch(server, self.config.queue_on_busy);
            run.abandon_if_unserved(server);

            for result in &run.results[before..] {
                pb.set_message(format!("{} {}", result.project, result.status));
                pb.inc(1);
            }
        }

        pb.finish_with_message("Complete");
        run.results
    }
}

/// Mutable state of one `execute` call
struct Run {
    queue: VecDeque<String>,
    in_flight: FxHashMap<PeerIdentity, RemoteTodos<InFlight>>,
    /// `Result` bodies waiting for their correlated reply
    outcomes: FxHashMap<String, EvalOutcome>,
    results: Vec<ProjectResult>,
}

impl Run {
    fn collect_replies(&mut self, server: &mut MultiEvalServer) {
        while let Some(inbound) = server.pop_result() {
            let signal = inbound.signal;
            if signal == SignalKind::Result {
                match EvalOutcome::from_signal(&signal) {
                    Some(outcome) => {
                        self.outcomes.insert(outcome.project.clone(), outcome);
                    }
                    None => warn!(handler = %inbound.handler, "Malformed result body"),
                }
                continue;
            }
            if !signal.is_reply() {
                debug!(handler = %inbound.handler, key = signal.key(), "Unhandled signal");
                continue;
            }

            let Some(identity) = inbound.identity else {
                warn!(handler = %inbound.handler, "Reply from unidentified peer");
                continue;
            };
            let project = signal
                .reply_parts()
                .map(|(_, text)| text.into_owned())
                .unwrap_or_default();
            let Some(todos) = self.in_flight.get_mut(&identity) else {
                warn!(peer = %identity, "Reply without outstanding request");
                continue;
            };
            let entry = if project.is_empty() {
                todos.get_todo(&signal)
            } else {
                todos.get_todo_matching(&signal, Some(project.as_bytes()))
            };
            let Some(flight) = entry.and_then(|e| e.context) else {
                warn!(peer = %identity, project = %project, "Reply does not match a request");
                continue;
            };

            let success = signal == SignalKind::Success;
            let message = self
                .outcomes
                .remove(&flight.project)
                .map(|o| o.message)
                .unwrap_or_default();
            let status = if success {
                ProjectStatus::Passed
            } else {
                ProjectStatus::Failed
            };
            info!(project = %flight.project, peer = %identity, %status, "Evaluation finished");
            self.finish(server, flight, identity, status, message);
        }
    }

    /// Work of peers whose record expired is lost
    fn expire_lost(&mut self, server: &mut MultiEvalServer) {
        for lost in server.drain_lost() {
            debug!(handler = %lost.handler, reason = ?lost.reason, "Peer connection lost");
        }

        let gone: Vec<PeerIdentity> = self
            .in_flight
            .keys()
            .filter(|identity| server.record(identity).is_none())
            .copied()
            .collect();
        for identity in gone {
            if let Some(mut todos) = self.in_flight.remove(&identity) {
                while let Some(entry) = todos.pop_front() {
                    if let Some(flight) = entry.context {
                        warn!(project = %flight.project, peer = %identity, "Peer gone, project lost");
                        self.finish(server, flight, identity, ProjectStatus::Lost, "peer lost".to_string());
                    }
                }
            }
        }
    }

    /// Projects over the limit time out and their peer is terminated
    fn expire_overdue(&mut self, server: &mut MultiEvalServer, limit: Duration) {
        let overdue: Vec<(PeerIdentity, String)> = self
            .in_flight
            .iter()
            .flat_map(|(identity, todos)| {
                todos
                    .iter()
                    .filter_map(|e| e.context.as_ref())
                    .filter(|f| f.started.elapsed() > limit)
                    .map(move |f| (*identity, f.project.clone()))
            })
            .collect();

        for (identity, project) in overdue {
            let request = Signal::text(SignalKind::Evaluate, &project);
            let flight = self
                .in_flight
                .get_mut(&identity)
                .and_then(|todos| todos.get_todo_matching(&request, Some(project.as_bytes())))
                .and_then(|e| e.context);
            if let Some(flight) = flight {
                warn!(project = %project, peer = %identity, ?limit, "Evaluation timed out");
                let message = format!("no answer within {:?}", limit);
                self.finish(server, flight, identity, ProjectStatus::TimedOut, message);
                server.terminate(identity);
            }
        }
    }

    fn dispatch(&mut self, server: &mut MultiEvalServer, queue_on_busy: bool) {
        while let Some(project) = self.queue.front() {
            if server.idle_count() == 0 && !(queue_on_busy && server.server().handshaked_count() > 0) {
                return;
            }
            let id = match server.dispatch_evaluate(project) {
                Ok(id) => id,
                Err(CommError::NoPeers) => return,
                Err(e) => {
                    warn!(project = %project, error = %e, "Dispatch failed, will retry");
                    return;
                }
            };
            let Some(identity) = server.identity_of(id) else {
                warn!(handler = %id, "Dispatched to unidentified peer, will retry");
                return;
            };
            let Some(project) = self.queue.pop_front() else {
                return;
            };
            info!(project = %project, peer = %identity, "Dispatched");
            self.in_flight.entry(identity).or_default().append_todo(
                Signal::text(SignalKind::Evaluate, &project),
                Some(InFlight {
                    project,
                    started: Instant::now(),
                }),
            );
        }
    }

    /// With no peer left and nothing in flight, queued projects cannot run
    fn abandon_if_unserved(&mut self, server: &MultiEvalServer) {
        let no_peers = server.records().next().is_none();
        let nothing_in_flight = self.in_flight.values().all(|todos| todos.is_empty());
        if !(no_peers && nothing_in_flight) {
            return;
        }
        while let Some(project) = self.queue.pop_front() {
            warn!(project = %project, "No peers left, project lost");
            self.results.push(ProjectResult {
                project,
                status: ProjectStatus::Lost,
                message: "no peers connected".to_string(),
                peer: None,
                subprocess_pid: None,
                duration_ms: 0,
            });
        }
    }

    fn finish(
        &mut self,
        server: &MultiEvalServer,
        flight: InFlight,
        identity: PeerIdentity,
        status: ProjectStatus,
        message: String,
    ) {
        self.results.push(ProjectResult {
            project: flight.project,
            status,
            message,
            peer: Some(identity.to_string()),
            subprocess_pid: server.record(&identity).and_then(|r| r.subprocess_pid),
            duration_ms: flight.started.elapsed().as_millis() as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(ProjectStatus::TimedOut.to_string(), "timed_out");
        assert_eq!(
            serde_json::to_string(&ProjectStatus::Passed).unwrap(),
            "\"passed\""
        );
    }
}
