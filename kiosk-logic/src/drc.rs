//! DRC Secondary
//!
//! The second measurement instance of a double-robot cell. It connects to
//! the primary, announces itself with `SecondaryReady` and then executes the
//! primary's requests one at a time, answering each with a correlated
//! `Success`/`Failure`.
//!
//! Which request is accepted in which state is decided by [`transition`].
//! Requests that are unknown, or not allowed in the current state, are logged
//! and dropped without a reply.

use crate::host::{HostError, MeasurementHost};
use crate::session::{Session, SignalLink, Transition};
use crate::wait::{Step, WaitPolicy};
use kiosk_ipc::{Signal, SignalKind};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrcState {
    /// Not connected to the primary
    Waiting,
    /// Connected, no template open
    Ready,
    TemplateOpen,
    SensorReady,
}

impl fmt::Display for DrcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DrcState::Waiting => "waiting",
            DrcState::Ready => "ready",
            DrcState::TemplateOpen => "template open",
            DrcState::SensorReady => "sensor ready",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrcAction {
    OpenTemplate,
    CloseTemplate,
    InitSensor,
    DeinitSensor,
    Calibrate,
    Measure,
    Export,
    MoveHome,
    Abort,
    CycleDone,
    Exit,
}

/// Action and follow-up state for a request, `None` if not allowed.
///
/// The follow-up state only applies when the action succeeds.
pub fn transition(state: DrcState, kind: SignalKind) -> Option<(DrcAction, DrcState)> {
    use DrcState::*;
    use SignalKind as K;

    let connected = state != Waiting;
    let template = matches!(state, TemplateOpen | SensorReady);

    match (state, kind) {
        (_, K::Exit) => Some((DrcAction::Exit, state)),
        (Ready, K::OpenTemplate) => Some((DrcAction::OpenTemplate, TemplateOpen)),
        (TemplateOpen, K::InitSensor) => Some((DrcAction::InitSensor, SensorReady)),
        (SensorReady, K::DeinitSensor) => Some((DrcAction::DeinitSensor, TemplateOpen)),
        (SensorReady, K::Calibrate) => Some((DrcAction::Calibrate, SensorReady)),
        (SensorReady, K::StartMeasurement) => Some((DrcAction::Measure, SensorReady)),
        (_, K::ExportResults) if template => Some((DrcAction::Export, state)),
        (_, K::CloseTemplate) if template => Some((DrcAction::CloseTemplate, Ready)),
        (_, K::MoveHome) if connected => Some((DrcAction::MoveHome, state)),
        (SensorReady, K::Abort) => Some((DrcAction::Abort, TemplateOpen)),
        (_, K::Abort) if connected => Some((DrcAction::Abort, state)),
        (_, K::CycleDone) if connected => Some((DrcAction::CycleDone, state)),
        _ => None,
    }
}

/// Counters for the lifetime of one secondary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrcStats {
    pub handled: u64,
    pub failed: u64,
    pub rejected: u64,
    pub cycles: u64,
}

pub struct DrcSecondary<L, H> {
    session: Session<L>,
    host: H,
    state: DrcState,
    stats: DrcStats,
}

impl<L: SignalLink, H: MeasurementHost> DrcSecondary<L, H> {
    pub fn new(link: L, host: H, poll_timeout: Duration) -> Self {
        Self {
            session: Session::new(link, poll_timeout),
            host,
            state: DrcState::Waiting,
            stats: DrcStats::default(),
        }
    }

    /// Redial policy used once the primary's connection closes
    pub fn with_reconnect(mut self, policy: WaitPolicy) -> Self {
        self.session.set_reconnect_policy(policy);
        self
    }

    /// Collect pending signals and dispatch all of them
    pub fn tick(&mut self) -> Step {
        let collected = self.session.collect_pkts();
        match collected.transition {
            Some(Transition::FirstConnection) => self.on_first_connection(),
            Some(Transition::ConnectionLost) => self.on_connection_lost(),
            None => {}
        }

        if self.session.exit_requested() && !self.session.is_connected() {
            info!("Primary requested exit before disconnecting");
            return Step::Stop;
        }

        let mut worked = false;
        while let Some(entry) = self.session.next_todo() {
            worked = true;
            let step = self.dispatch(&entry.signal);
            if step.is_terminal() {
                return step;
            }
        }

        if worked {
            Step::Continue
        } else {
            Step::Idle
        }
    }

    /// Tick until the primary sends `Exit` or an error ends the loop
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

    fn on_first_connection(&mut self) {
        self.state = DrcState::Ready;
        if self.session.send(&Signal::empty(SignalKind::SecondaryReady)) {
            info!("Secondary ready");
        }
    }

    fn on_connection_lost(&mut self) {
        warn!(state = %self.state, "Primary connection lost");
        if matches!(self.state, DrcState::TemplateOpen | DrcState::SensorReady) {
            self.host.abort();
            if let Err(e) = self.host.close_template() {
                warn!(error = %e, "Could not close template after connection loss");
            }
        }
        self.state = DrcState::Waiting;
    }

    /// Handle one request
    pub fn dispatch(&mut self, signal: &Signal) -> Step {
        let Some(kind) = signal.kind() else {
            error!(key = signal.key(), "Unknown signal, dropped");
            self.stats.rejected += 1;
            return Step::Continue;
        };
        let Some((action, next)) = transition(self.state, kind) else {
            error!(state = %self.state, signal = %kind, "Signal not expected in this state, dropped");
            self.stats.rejected += 1;
            return Step::Continue;
        };

        if action == DrcAction::Exit {
            info!("Exit requested by primary");
            return Step::Stop;
        }

        debug!(state = %self.state, signal = %kind, ?action, "Dispatching");
        let payload = signal.payload_str().into_owned();
        match self.perform(action, &payload) {
            Ok(text) => {
                self.state = next;
                self.stats.handled += 1;
                self.session.reply_success(signal, &text);
                if action == DrcAction::Measure {
                    self.session
                        .send(&Signal::text(SignalKind::MeasurementDone, &payload));
                    self.session.send(&Signal::text(SignalKind::ResultName, &text));
                }
            }
            Err(e) => {
                warn!(signal = %kind, error = %e, "Request failed");
                self.stats.failed += 1;
                self.session.reply_failure(signal, &e.to_string());
            }
        }
        Step::Continue
    }

    /// Run the host side of `action`, returning the reply text
    fn perform(&mut self, action: DrcAction, payload: &str) -> Result<String, HostError> {
        match action {
            DrcAction::OpenTemplate => self.host.open_template(payload).map(|_| String::new()),
            DrcAction::CloseTemplate => self.host.close_template().map(|_| String::new()),
            DrcAction::InitSensor => self.host.init_sensor().map(|_| String::new()),
            DrcAction::DeinitSensor => self.host.deinit_sensor().map(|_| String::new()),
            DrcAction::Calibrate => self.host.calibrate().map(|_| String::new()),
            DrcAction::Measure => self.host.measure(payload),
            DrcAction::Export => self.host.export(payload).map(|_| String::new()),
            DrcAction::MoveHome => self.host.move_home().map(|_| String::new()),
            DrcAction::Abort => {
                self.host.abort();
                Ok(String::new())
            }
            DrcAction::CycleDone => {
                self.stats.cycles += 1;
                info!(cycles = self.stats.cycles, "Cycle finished");
                Ok(String::new())
            }
            DrcAction::Exit => Ok(String::new()),
        }
    }

    pub fn state(&self) -> DrcState {
        self.state
    }

    pub fn stats(&self) -> DrcStats {
        self.stats
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn session(&self) -> &Session<L> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<L> {
        &mut self.session
    }
}
