//! Evaluation Worker
//!
//! Client side of the MultiEval protocol. Announces itself idle, runs the
//! configured command for every `Evaluate` it receives and reports back:
//! `Process` with the subprocess pid, `Result` with a JSON outcome, and a
//! correlated `Success`/`Failure` for the request.

use kiosk_ipc::{Signal, SignalKind};
use kiosk_logic::{Session, SignalLink, Step, Transition, WaitPolicy};
use serde::{Deserialize, Serialize};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Body of a `Result` signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub project: String,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
}

impl EvalOutcome {
    pub fn to_signal(&self) -> Signal {
        // Serializing a struct of strings and integers cannot fail
        let body = serde_json::to_string(self).unwrap_or_default();
        Signal::text(SignalKind::Result, &body)
    }

    pub fn from_signal(signal: &Signal) -> Option<Self> {
        serde_json::from_slice(signal.payload()).ok()
    }
}

pub struct EvalWorker<L> {
    session: Session<L>,
    command: Vec<String>,
    evaluated: u64,
}

impl<L: SignalLink> EvalWorker<L> {
    /// `command` is run with the project appended as last argument
    pub fn new(link: L, command: Vec<String>, poll_timeout: Duration) -> Self {
        Self {
            session: Session::new(link, poll_timeout),
            command,
            evaluated: 0,
        }
    }

    /// Redial policy used once the server connection closes
    pub fn with_reconnect(mut self, policy: WaitPolicy) -> Self {
        self.session.set_reconnect_policy(policy);
        self
    }

    pub fn evaluated(&self) -> u64 {
        self.evaluated
    }

    pub fn session(&self) -> &Session<L> {
        &self.session
    }

    pub fn tick(&mut self) -> Step {
        let collected = self.session.collect_pkts();
        match collected.transition {
            Some(Transition::FirstConnection) => {
                self.session.send(&Signal::text(SignalKind::Idle, "1"));
            }
            Some(Transition::ConnectionLost) => {
                warn!("Server connection lost");
            }
            None => {}
        }

        if self.session.exit_requested() && !self.session.is_connected() {
            return Step::Stop;
        }

        let mut worked = false;
        while let Some(entry) = self.session.next_todo() {
            worked = true;
            match entry.signal.kind() {
                Some(SignalKind::Exit) => {
                    info!(evaluated = self.evaluated, "Exit requested by server");
                    return Step::Stop;
                }
                Some(SignalKind::Evaluate) => self.evaluate(&entry.signal),
                _ => debug!(key = entry.signal.key(), "Ignoring signal"),
            }
        }

        if worked {
            Step::Continue
        } else {
            Step::Idle
        }
    }

    /// Tick until `Exit`, or until the server is gone and redialing fails
    pub fn run(&mut self) -> Step {
        loop {
            let step = self.tick();
            if step.is_terminal() {
                return step;
            }
            if step == Step::Idle && self.session.is_closed() && !self.session.recover() {
                return Step::Error("connection lost".to_string());
            }
        }
    }

    /// Replies echo the request payload verbatim so the server can match them
    fn evaluate(&mut self, request: &Signal) {
        let project = request.payload_str().to_string();
        self.session.send(&Signal::text(SignalKind::Idle, "0"));
        info!(project = %project, "Evaluating");

        let outcome = self.run_command(&project);
        self.evaluated += 1;

        self.session.send(&outcome.to_signal());
        if outcome.success {
            self.session.reply_success(request, &project);
        } else {
            self.session.reply_failure(request, &project);
        }
        self.session.send(&Signal::text(SignalKind::Idle, "1"));
    }

    fn run_command(&mut self, project: &str) -> EvalOutcome {
        let started = Instant::now();
        let outcome = |success: bool, message: String| EvalOutcome {
            project: project.to_string(),
            success,
            message,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let Some((program, args)) = self.command.split_first() else {
            error!("No evaluation command configured");
            return outcome(false, "no evaluation command configured".to_string());
        };

        let mut child = match Command::new(program)
            .args(args)
            .arg(project.trim())
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(program = %program, error = %e, "Failed to start evaluation");
                return outcome(false, format!("failed to start {}: {}", program, e));
            }
        };

        self.session
            .send(&Signal::text(SignalKind::Process, &child.id().to_string()));

        match child.wait() {
            Ok(status) if status.success() => outcome(true, "ok".to_string()),
            Ok(status) => outcome(false, format!("evaluation exited with {}", status)),
            Err(e) => outcome(false, format!("evaluation wait failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_signal() {
        let outcome = EvalOutcome {
            project: "proj1".to_string(),
            success: true,
            message: "ok".to_string(),
            duration_ms: 12,
        };
        let signal = outcome.to_signal();
        assert_eq!(signal.kind(), Some(SignalKind::Result));
        assert_eq!(EvalOutcome::from_signal(&signal), Some(outcome));
        assert_eq!(
            EvalOutcome::from_signal(&Signal::text(SignalKind::Result, "garbage")),
            None
        );
    }
}
