//! Multi-robot measurement
//!
//! A coordinator owns the server and drives every robot instance through the
//! same cycle: open template, move and measure at each position, compute,
//! export, close. Each request is answered per instance with a correlated
//! `Success`/`Failure`; the coordinator waits for all answers with a bounded
//! wait. A failed or timed-out step is reported to the caller and the
//! coordinator stays usable for the next cycle.

use crate::host::{HostError, MeasurementHost};
use crate::session::{Session, SignalLink, Transition};
use crate::wait::{wait_until, Step, WaitCheck, WaitError, WaitPolicy};
use fxhash::{FxHashMap, FxHashSet};
use kiosk_core::{CommError, CommunicationServer, HandlerId};
use kiosk_ipc::{RemoteTodos, Signal, SignalKind};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Instance side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotState {
    Waiting,
    /// Connected, robot not initialized
    Ready,
    Initialized,
    TemplateOpen,
    /// At least one series measured since the template was opened
    Measured,
}

impl fmt::Display for RobotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotAction {
    Init,
    OpenTemplate,
    Move,
    Measure,
    Compute,
    Export,
    Close,
    Exit,
}

/// Action and follow-up state for a coordinator request, `None` if not allowed
pub fn robot_transition(state: RobotState, kind: SignalKind) -> Option<(RobotAction, RobotState)> {
    use RobotState::*;
    use SignalKind as K;

    let template = matches!(state, TemplateOpen | Measured);

    match (state, kind) {
        (_, K::RobotExit | K::Exit) => Some((RobotAction::Exit, state)),
        (Ready, K::RobotInit) => Some((RobotAction::Init, Initialized)),
        (Initialized, K::RobotOpenTemplate) => Some((RobotAction::OpenTemplate, TemplateOpen)),
        (_, K::RobotMove) if template => Some((RobotAction::Move, state)),
        (_, K::RobotMeasure) if template => Some((RobotAction::Measure, Measured)),
        (Measured, K::RobotCompute) => Some((RobotAction::Compute, Measured)),
        (Measured, K::RobotExport) => Some((RobotAction::Export, Measured)),
        (_, K::RobotClose) if template => Some((RobotAction::Close, Initialized)),
        _ => None,
    }
}

/// One robot-driven measurement instance
pub struct MultiRobotMeasure<L, H> {
    session: Session<L>,
    host: H,
    state: RobotState,
}

impl<L: SignalLink, H: MeasurementHost> MultiRobotMeasure<L, H> {
    pub fn new(link: L, host: H, poll_timeout: Duration) -> Self {
        Self {
            session: Session::new(link, poll_timeout),
            host,
            state: RobotState::Waiting,
        }
    }

    /// Redial policy used once the primary's connection closes
    pub fn with_reconnect(mut self, policy: WaitPolicy) -> Self {
        self.session.set_reconnect_policy(policy);
        self
    }

    pub fn tick(&mut self) -> Step {
        match self.session.collect_pkts().transition {
            Some(Transition::FirstConnection) => {
                self.state = RobotState::Ready;
                self.session.send(&Signal::empty(SignalKind::RobotReady));
            }
            Some(Transition::ConnectionLost) => {
                warn!(state = %self.state, "Coordinator connection lost");
                if matches!(self.state, RobotState::TemplateOpen | RobotState::Measured) {
                    self.host.abort();
                    if let Err(e) = self.host.close_template() {
                        warn!(error = %e, "Could not close template");
                    }
                }
                self.state = RobotState::Waiting;
            }
            None => {}
        }

        if self.session.exit_requested() && !self.session.is_connected() {
            return Step::Stop;
        }

        let mut worked = false;
        while let Some(entry) = self.session.next_todo() {
            worked = true;
            if self.dispatch(&entry.signal) == Step::Stop {
                return Step::Stop;
            }
        }
        if worked {
            Step::Continue
        } else {
            Step::Idle
        }
    }

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

    fn dispatch(&mut self, signal: &Signal) -> Step {
        let transition = signal
            .kind()
            .and_then(|kind| robot_transition(self.state, kind));
        let Some((action, next)) = transition else {
            error!(
                state = %self.state,
                key = signal.key(),
                "Unexpected coordinator request, dropped"
            );
            return Step::Continue;
        };
        if action == RobotAction::Exit {
            info!("Exit requested by coordinator");
            return Step::Stop;
        }

        let payload = signal.payload_str().into_owned();
        match self.perform(action, &payload) {
            Ok(text) => {
                self.state = next;
                self.session.reply_success(signal, &text);
                match action {
                    RobotAction::Move => {
                        self.session
                            .send(&Signal::text(SignalKind::RobotPosition, &payload));
                    }
                    RobotAction::Measure => {
                        self.session
                            .send(&Signal::text(SignalKind::RobotMeasureDone, &text));
                    }
                    _ => {}
                }
            }
            Err(e) => {
                warn!(?action, error = %e, "Robot request failed");
                self.session.reply_failure(signal, &e.to_string());
                self.session
                    .send(&Signal::text(SignalKind::RobotError, &e.to_string()));
            }
        }
        Step::Continue
    }

    fn perform(&mut self, action: RobotAction, payload: &str) -> Result<String, HostError> {
        match action {
            RobotAction::Init => self.host.move_home().map(|_| String::new()),
            RobotAction::OpenTemplate => {
                self.host.open_template(payload)?;
                self.host.init_sensor()?;
                Ok(String::new())
            }
            RobotAction::Move => self.host.move_to(payload).map(|_| String::new()),
            RobotAction::Measure => self.host.measure(payload),
            RobotAction::Compute => self.host.compute().map(|_| String::new()),
            RobotAction::Export => self.host.export(payload).map(|_| String::new()),
            RobotAction::Close => {
                self.host.deinit_sensor()?;
                self.host.close_template().map(|_| String::new())
            }
            RobotAction::Exit => Ok(String::new()),
        }
    }

    pub fn state(&self) -> RobotState {
        self.state
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn session_mut(&mut self) -> &mut Session<L> {
        &mut self.session
    }
}

// ---------------------------------------------------------------------------
// Coordinator side
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("{step} not answered by {pending} instance(s): {source}")]
    Timeout {
        step: SignalKind,
        pending: usize,
        source: WaitError,
    },

    #[error("{step} rejected by {handler}: {reason}")]
    Rejected {
        step: SignalKind,
        handler: HandlerId,
        reason: String,
    },

    #[error("Instance {handler} lost during {step}")]
    PeerLost { step: SignalKind, handler: HandlerId },

    #[error("Only {ready} of {expected} instances reported ready")]
    NotReady { ready: usize, expected: usize },

    #[error(transparent)]
    Comm(#[from] CommError),
}

/// Positions and names for one cycle
#[derive(Debug, Clone)]
pub struct CyclePlan {
    pub template: String,
    pub positions: Vec<String>,
    pub series: String,
    pub export_target: String,
}

/// Answer of one instance to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReply {
    pub handler: HandlerId,
    pub success: bool,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub steps: usize,
    /// Result names reported with `RobotMeasureDone`, per instance
    pub results: Vec<(HandlerId, String)>,
    pub duration: Duration,
}

pub struct MultiRobotCoordinator {
    server: CommunicationServer,
    expected: usize,
    policy: WaitPolicy,
    ready: FxHashSet<HandlerId>,
    /// Outstanding requests per instance; context is the request label
    pending: FxHashMap<HandlerId, RemoteTodos<String>>,
    measured: Vec<(HandlerId, String)>,
}

impl MultiRobotCoordinator {
    pub fn new(server: CommunicationServer, expected: usize, policy: WaitPolicy) -> Self {
        Self {
            server,
            expected,
            policy,
            ready: FxHashSet::default(),
            pending: FxHashMap::default(),
            measured: Vec::new(),
        }
    }

    pub fn server(&self) -> &CommunicationServer {
        &self.server
    }

    /// Wait for `expected` handshakes, then for each instance's `RobotReady`.
    ///
    /// A handshake timeout is returned as [`CycleError::Comm`] carrying
    /// [`CommError::HandshakeTimeout`].
    pub fn wait_ready(&mut self, handshake: WaitPolicy) -> Result<(), CycleError> {
        self.server
            .wait_for_first_connection(self.expected, handshake.retries, handshake.delay)?;

        let expected = self.expected;
        let result = wait_until(self.policy, |slice| {
            self.server.process_signals(slice);
            self.absorb(None);
            if self.ready.len() >= expected {
                WaitCheck::Ready(())
            } else {
                WaitCheck::Empty
            }
        });
        match result {
            Ok(()) => {
                info!(instances = self.ready.len(), "All instances ready");
                Ok(())
            }
            Err(_) => Err(CycleError::NotReady {
                ready: self.ready.len(),
                expected,
            }),
        }
    }

    /// Send one request to every ready instance and wait for all answers
    pub fn request(&mut self, kind: SignalKind, payload: &str) -> Result<Vec<StepReply>, CycleError> {
        let signal = Signal::text(kind, payload);
        let mut targets: Vec<HandlerId> = self.ready.iter().copied().collect();
        targets.sort();

        for id in &targets {
            self.pending
                .entry(*id)
                .or_default()
                .append_todo(signal.clone(), Some(format!("{} {}", kind, payload)));
            if let Err(e) = self.server.send_to(*id, &signal) {
                warn!(handler = %id, error = %e, "Request not delivered");
            }
        }
        debug!(step = %kind, instances = targets.len(), "Request sent");

        let mut replies = Vec::with_capacity(targets.len());
        let mut lost = None;
        let outcome = wait_until(self.policy, |slice| {
            self.server.process_signals(slice);
            if let Some(handler) = self.absorb(Some(&mut replies)) {
                lost = Some(handler);
                return WaitCheck::Lost;
            }
            let outstanding = targets
                .iter()
                .filter(|id| {
                    self.pending
                        .get(*id)
                        .is_some_and(|t| t.has_key(kind.key()))
                })
                .count();
            if outstanding == 0 {
                WaitCheck::Ready(())
            } else {
                WaitCheck::Empty
            }
        });

        match outcome {
            Ok(()) => {}
            Err(WaitError::ConnectionLost) => {
                let handler = lost.unwrap_or(HandlerId(0));
                self.drop_step(kind);
                return Err(CycleError::PeerLost { step: kind, handler });
            }
            Err(source) => {
                let pending = self.drop_step(kind);
                return Err(CycleError::Timeout {
                    step: kind,
                    pending,
                    source,
                });
            }
        }

        if let Some(failed) = replies.iter().find(|r| !r.success) {
            return Err(CycleError::Rejected {
                step: kind,
                handler: failed.handler,
                reason: failed.text.clone(),
            });
        }
        Ok(replies)
    }

    /// Forget unanswered requests of `kind`; returns how many there were
    fn drop_step(&mut self, kind: SignalKind) -> usize {
        let probe = Signal::empty(kind);
        let mut dropped = 0;
        for todos in self.pending.values_mut() {
            while todos.get_todo(&probe).is_some() {
                dropped += 1;
            }
        }
        dropped
    }

    /// Route received signals; returns a lost instance if any
    fn absorb(&mut self, mut replies: Option<&mut Vec<StepReply>>) -> Option<HandlerId> {
        while let Some(inbound) = self.server.pop_result() {
            let id = inbound.handler;
            let signal = inbound.signal;
            match signal.kind() {
                Some(SignalKind::RobotReady) => {
                    info!(handler = %id, "Instance ready");
                    self.ready.insert(id);
                }
                Some(SignalKind::Success | SignalKind::Failure) => {
                    let todos = self.pending.entry(id).or_default();
                    match todos.get_todo(&signal) {
                        Some(entry) => {
                            let success = signal == SignalKind::Success;
                            let text = signal
                                .reply_parts()
                                .map(|(_, text)| text.into_owned())
                                .unwrap_or_default();
                            debug!(
                                handler = %id,
                                request = entry.context.as_deref().unwrap_or(""),
                                success,
                                "Reply"
                            );
                            if let Some(replies) = replies.as_deref_mut() {
                                replies.push(StepReply {
                                    handler: id,
                                    success,
                                    text,
                                });
                            }
                        }
                        None => warn!(handler = %id, payload = %signal.payload_str(), "Reply without request"),
                    }
                }
                Some(SignalKind::RobotMeasureDone) => {
                    self.measured
                        .push((id, signal.payload_str().into_owned()));
                }
                Some(SignalKind::RobotPosition) => {
                    debug!(handler = %id, position = %signal.payload_str(), "Instance positioned");
                }
                Some(SignalKind::RobotError) => {
                    error!(handler = %id, error = %signal.payload_str(), "Instance error");
                }
                _ => error!(
                    handler = %id,
                    signal = %self.server.registry().label(&signal),
                    "Unexpected signal from instance, dropped"
                ),
            }
        }

        let mut lost = None;
        for peer in self.server.drain_lost() {
            if self.ready.remove(&peer.handler) {
                warn!(handler = %peer.handler, "Instance lost");
                self.pending.remove(&peer.handler);
                lost = Some(peer.handler);
            }
        }
        lost
    }

    /// Run one full cycle over every ready instance
    pub fn run_cycle(&mut self, plan: &CyclePlan) -> Result<CycleSummary, CycleError> {
        let started = Instant::now();
        self.measured.clear();
        let mut steps = 0;

        self.request(SignalKind::RobotOpenTemplate, &plan.template)?;
        steps += 1;
        for position in &plan.positions {
            self.request(SignalKind::RobotMove, position)?;
            self.request(SignalKind::RobotMeasure, &plan.series)?;
            steps += 2;
        }
        self.request(SignalKind::RobotCompute, "")?;
        self.request(SignalKind::RobotExport, &plan.export_target)?;
        self.request(SignalKind::RobotClose, "")?;
        steps += 3;

        // Measure-done reports trail the Success replies
        self.server.process_signals(Duration::from_millis(10));
        self.absorb(None);

        let summary = CycleSummary {
            steps,
            results: std::mem::take(&mut self.measured),
            duration: started.elapsed(),
        };
        info!(
            steps = summary.steps,
            results = summary.results.len(),
            duration = ?summary.duration,
            "Cycle complete"
        );
        Ok(summary)
    }

    /// Initialize every ready instance
    pub fn init(&mut self) -> Result<(), CycleError> {
        self.request(SignalKind::RobotInit, "").map(|_| ())
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Tell every instance to exit and close the server
    pub fn shutdown(&mut self) {
        self.server.send_signal(&Signal::empty(SignalKind::RobotExit));
        self.server.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SimulatedHost;
    use crate::session::testing::MockLink;
    use kiosk_core::{ClientConfig, CommunicationClient, ServerConfig};
    use kiosk_ipc::SignalRegistry;
    use std::sync::Arc;

    fn instance() -> MultiRobotMeasure<MockLink, SimulatedHost> {
        let mut robot = MultiRobotMeasure::new(MockLink::connected(), SimulatedHost::new(), Duration::ZERO);
        assert_eq!(robot.tick(), Step::Idle);
        robot
    }

    #[test]
    fn test_instance_cycle() {
        let mut robot = instance();
        let link = robot.session_mut().link_mut();
        link.push(Signal::empty(SignalKind::RobotInit));
        link.push(Signal::text(SignalKind::RobotOpenTemplate, "part_a"));
        link.push(Signal::text(SignalKind::RobotMove, "p1"));
        link.push(Signal::text(SignalKind::RobotMeasure, "scan"));
        link.push(Signal::empty(SignalKind::RobotCompute));
        link.push(Signal::text(SignalKind::RobotExport, "out"));
        link.push(Signal::empty(SignalKind::RobotClose));
        assert_eq!(robot.tick(), Step::Continue);

        assert_eq!(robot.state(), RobotState::Initialized);
        let sent = robot.session_mut().link_mut().sent_payloads();
        assert_eq!(sent[0], (SignalKind::RobotReady.key(), String::new()));
        assert!(sent.contains(&(SignalKind::RobotPosition.key(), "p1".to_string())));
        assert!(sent.contains(&(SignalKind::RobotMeasureDone.key(), "scan_001".to_string())));
        assert!(sent.contains(&(SignalKind::Success.key(), "54-scan_001".to_string())));
        let failures = sent
            .iter()
            .filter(|(key, _)| *key == SignalKind::Failure.key())
            .count();
        assert_eq!(failures, 0);
    }

    #[test]
    fn test_compute_before_measure_is_dropped() {
        let mut robot = instance();
        robot
            .session_mut()
            .link_mut()
            .push(Signal::empty(SignalKind::RobotCompute));
        robot.tick();
        assert_eq!(robot.state(), RobotState::Ready);
        assert_eq!(robot.session_mut().link_mut().sent.len(), 1);
    }

    #[test]
    fn test_host_error_reports_failure_and_error() {
        let mut robot = MultiRobotMeasure::new(
            MockLink::connected(),
            SimulatedHost::new().reject("move_home"),
            Duration::ZERO,
        );
        robot.tick();
        robot
            .session_mut()
            .link_mut()
            .push(Signal::empty(SignalKind::RobotInit));
        robot.tick();

        assert_eq!(robot.state(), RobotState::Ready);
        let sent = robot.session_mut().link_mut().sent_payloads();
        assert_eq!(sent[1].0, SignalKind::Failure.key());
        assert!(sent[1].1.starts_with("50-"));
        assert_eq!(sent[2].0, SignalKind::RobotError.key());
    }

    #[test]
    fn test_coordinator_runs_cycle_against_instance() {
        let registry = Arc::new(SignalRegistry::with_protocol());
        let server = CommunicationServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            ServerConfig::default(),
            Arc::clone(&registry),
        )
        .unwrap();
        let addr = server.local_addr();

        let instance = std::thread::spawn(move || {
            let client = CommunicationClient::connect(addr, ClientConfig::default(), registry).unwrap();
            let mut robot =
                MultiRobotMeasure::new(client, SimulatedHost::new(), Duration::from_millis(10));
            let step = robot.run();
            (step, robot.host().calls.clone())
        });

        let policy = WaitPolicy::new(300, Duration::from_millis(10));
        let mut coordinator = MultiRobotCoordinator::new(server, 1, policy);
        coordinator.wait_ready(policy).unwrap();
        assert_eq!(coordinator.ready_count(), 1);
        coordinator.init().unwrap();

        let plan = CyclePlan {
            template: "part_a".to_string(),
            positions: vec!["p1".to_string(), "p2".to_string()],
            series: "scan".to_string(),
            export_target: "out".to_string(),
        };
        let summary = coordinator.run_cycle(&plan).unwrap();
        assert_eq!(summary.steps, 8);
        let names: Vec<&str> = summary.results.iter().map(|(_, name)| name.as_str()).collect();
        assert_eq!(names, vec!["scan_001", "scan_002"]);

        coordinator.shutdown();
        let (step, calls) = instance.join().unwrap();
        assert_eq!(step, Step::Stop);
        assert!(calls.contains(&"move_to p2".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("close_template"));
    }

    #[test]
    fn test_request_without_answer_times_out() {
        let registry = Arc::new(SignalRegistry::with_protocol());
        let server = CommunicationServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            ServerConfig::default(),
            Arc::clone(&registry),
        )
        .unwrap();
        let addr = server.local_addr();
        let policy = WaitPolicy::new(100, Duration::from_millis(10));
        let mut coordinator = MultiRobotCoordinator::new(server, 1, policy);

        // Announces itself but never answers requests
        let mut mute = CommunicationClient::connect(addr, ClientConfig::default(), registry).unwrap();
        let announcer = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !mute.is_handshaked() && Instant::now() < deadline {
                mute.process_signals(Duration::from_millis(10));
            }
            mute.send_signal(&Signal::empty(SignalKind::RobotReady)).unwrap();
            mute
        });
        coordinator.wait_ready(policy).unwrap();
        let _mute = announcer.join().unwrap();

        coordinator.policy = WaitPolicy::new(3, Duration::from_millis(5));
        match coordinator.init() {
            Err(CycleError::Timeout { step, pending, .. }) => {
                assert_eq!(step, SignalKind::RobotInit);
                assert_eq!(pending, 1);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(coordinator.ready_count(), 1);
    }

    #[test]
    fn test_robot_exit_stops() {
        let mut robot = instance();
        robot
            .session_mut()
            .link_mut()
            .push(Signal::empty(SignalKind::RobotExit));
        assert_eq!(robot.tick(), Step::Stop);
    }
}
