//! Orchestration Session
//!
//! The polling half of every orchestration object: drains the link into a
//! local [`RemoteTodos`] and reports connection transitions exactly once.

use crate::wait::{wait_until, WaitCheck, WaitPolicy};
use kiosk_core::CommunicationClient;
use kiosk_ipc::{RemoteTodos, Signal, SignalKind, TodoEntry};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transport seen by an orchestration object
pub trait SignalLink {
    /// Run one I/O tick of at most `timeout`
    fn poll(&mut self, timeout: Duration) -> bool;

    /// Connected and handshaked
    fn is_ready(&self) -> bool;

    /// Send and flush, `false` if the signal could not be delivered
    fn send(&mut self, signal: &Signal) -> bool;

    /// Next received, non-protocol signal
    fn next_signal(&mut self) -> Option<Signal>;

    /// Transport still open, handshake possibly pending
    fn is_open(&self) -> bool;

    /// Dial the peer again after the transport closed
    fn redial(&mut self) -> bool;
}

impl SignalLink for CommunicationClient {
    fn poll(&mut self, timeout: Duration) -> bool {
        self.process_signals(timeout)
    }

    fn is_ready(&self) -> bool {
        self.is_connected() && self.is_handshaked()
    }

    fn send(&mut self, signal: &Signal) -> bool {
        match self.send_signal(signal) {
            Ok(()) => true,
            Err(e) => {
                warn!(signal = %self.registry().label(signal), error = %e, "Send failed");
                false
            }
        }
    }

    fn next_signal(&mut self) -> Option<Signal> {
        self.pop_result()
    }

    fn is_open(&self) -> bool {
        self.is_connected()
    }

    fn redial(&mut self) -> bool {
        match self.reconnect() {
            Ok(()) => true,
            Err(e) => {
                debug!(server = %self.server_addr(), error = %e, "Redial failed");
                false
            }
        }
    }
}

/// Connection state change observed by `collect_pkts`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    FirstConnection,
    ConnectionLost,
}

/// What one `collect_pkts` call saw
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Collected {
    pub received: usize,
    pub transition: Option<Transition>,
}

pub struct Session<L, C = ()> {
    link: L,
    todos: RemoteTodos<C>,
    connected: bool,
    exit_requested: bool,
    poll_timeout: Duration,
    reconnect: WaitPolicy,
}

impl<L: SignalLink, C> Session<L, C> {
    pub fn new(link: L, poll_timeout: Duration) -> Self {
        Self {
            link,
            todos: RemoteTodos::new(),
            connected: false,
            exit_requested: false,
            poll_timeout,
            reconnect: WaitPolicy::default(),
        }
    }

    /// Attempts and delay used by [`recover`](Self::recover)
    pub fn set_reconnect_policy(&mut self, policy: WaitPolicy) {
        self.reconnect = policy;
    }

    /// Whether the transport closed and only a redial can bring it back
    pub fn is_closed(&self) -> bool {
        !self.link.is_open()
    }

    /// Redial a closed link within the reconnect policy.
    ///
    /// Returns `false` once every attempt failed. A successful redial is
    /// reported by the next `collect_pkts` as `FirstConnection` after the
    /// handshake completes.
    pub fn recover(&mut self) -> bool {
        let policy = self.reconnect;
        let link = &mut self.link;
        let result = wait_until(policy, |delay| {
            if link.redial() {
                WaitCheck::Ready(())
            } else {
                std::thread::sleep(delay);
                WaitCheck::Empty
            }
        });
        match result {
            Ok(()) => {
                info!("Link re-established");
                true
            }
            Err(e) => {
                warn!(error = %e, "Giving up on the link");
                false
            }
        }
    }

    /// Poll the link once and move every received signal into the todos.
    ///
    /// Reports `FirstConnection` when the link became ready since the last
    /// call and `ConnectionLost` when it stopped being ready; a loss also
    /// clears the todos.
    pub fn collect_pkts(&mut self) -> Collected {
        self.link.poll(self.poll_timeout);

        let mut received = 0;
        while let Some(signal) = self.link.next_signal() {
            if signal == SignalKind::Exit {
                self.exit_requested = true;
            }
            self.todos.append_todo(signal, None);
            received += 1;
        }

        let ready = self.link.is_ready();
        let transition = match (self.connected, ready) {
            (false, true) => {
                info!("Connection established");
                Some(Transition::FirstConnection)
            }
            (true, false) => {
                warn!(dropped = self.todos.len(), "Connection lost, clearing todos");
                self.todos.clear();
                Some(Transition::ConnectionLost)
            }
            _ => None,
        };
        self.connected = ready;

        if received > 0 {
            debug!(received, pending = self.todos.len(), "Collected signals");
        }
        Collected {
            received,
            transition,
        }
    }

    /// Oldest pending todo
    pub fn next_todo(&mut self) -> Option<TodoEntry<C>> {
        self.todos.pop_front()
    }

    pub fn send(&mut self, signal: &Signal) -> bool {
        self.link.send(signal)
    }

    /// Correlated `Success` for `request`
    pub fn reply_success(&mut self, request: &Signal, text: &str) -> bool {
        self.link.send(&Signal::success_for(request.key(), text))
    }

    /// Correlated `Failure` for `request`
    pub fn reply_failure(&mut self, request: &Signal, text: &str) -> bool {
        self.link.send(&Signal::failure_for(request.key(), text))
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// An `Exit` arrived, even if the connection dropped right after
    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub fn todos(&self) -> &RemoteTodos<C> {
        &self.todos
    }

    pub fn todos_mut(&mut self) -> &mut RemoteTodos<C> {
        &mut self.todos
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory link driven by the test
    #[derive(Default)]
    pub struct MockLink {
        pub ready: bool,
        pub incoming: VecDeque<Signal>,
        pub sent: Vec<Signal>,
        pub polls: usize,
        pub closed: bool,
        /// Whether `redial` succeeds
        pub accept_redial: bool,
        /// Delivered once a redial succeeds
        pub after_redial: VecDeque<Signal>,
        pub redials: usize,
    }

    impl MockLink {
        pub fn connected() -> Self {
            Self {
                ready: true,
                ..Default::default()
            }
        }

        pub fn push(&mut self, signal: Signal) {
            self.incoming.push_back(signal);
        }

        pub fn sent_payloads(&self) -> Vec<(i32, String)> {
            self.sent
                .iter()
                .map(|s| (s.key(), s.payload_str().into_owned()))
                .collect()
        }
    }

    impl SignalLink for MockLink {
        fn poll(&mut self, _timeout: Duration) -> bool {
            self.polls += 1;
            !self.incoming.is_empty()
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        fn send(&mut self, signal: &Signal) -> bool {
            if !self.ready {
                return false;
            }
            self.sent.push(signal.clone());
            true
        }

        fn next_signal(&mut self) -> Option<Signal> {
            self.incoming.pop_front()
        }

        fn is_open(&self) -> bool {
            !self.closed
        }

        fn redial(&mut self) -> bool {
            self.redials += 1;
            if !self.accept_redial {
                return false;
            }
            self.closed = false;
            self.ready = true;
            self.incoming.append(&mut self.after_redial);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockLink;
    use super::*;

    #[test]
    fn test_transitions_fire_once() {
        let mut session: Session<MockLink> = Session::new(MockLink::default(), Duration::ZERO);
        assert_eq!(session.collect_pkts().transition, None);

        session.link_mut().ready = true;
        assert_eq!(
            session.collect_pkts().transition,
            Some(Transition::FirstConnection)
        );
        assert_eq!(session.collect_pkts().transition, None);

        session.link_mut().push(Signal::empty(SignalKind::OpenTemplate));
        session.link_mut().push(Signal::empty(SignalKind::InitSensor));
        assert_eq!(session.collect_pkts().received, 2);
        assert_eq!(session.todos().len(), 2);

        session.link_mut().ready = false;
        assert_eq!(
            session.collect_pkts().transition,
            Some(Transition::ConnectionLost)
        );
        assert!(session.todos().is_empty());
        assert_eq!(session.collect_pkts().transition, None);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_exit_is_remembered_across_loss() {
        let mut session: Session<MockLink> = Session::new(MockLink::connected(), Duration::ZERO);
        session.collect_pkts();

        session.link_mut().push(Signal::empty(SignalKind::Exit));
        session.link_mut().ready = false;
        let collected = session.collect_pkts();
        assert_eq!(collected.transition, Some(Transition::ConnectionLost));
        assert!(session.exit_requested());
    }

    #[test]
    fn test_recover_gives_up_after_policy() {
        let mut link = MockLink::default();
        link.closed = true;
        let mut session: Session<MockLink> = Session::new(link, Duration::ZERO);
        session.set_reconnect_policy(WaitPolicy::new(2, Duration::ZERO));

        assert!(session.is_closed());
        assert!(!session.recover());
        assert_eq!(session.link().redials, 3);
    }

    #[test]
    fn test_recover_reopens_link() {
        let mut link = MockLink::default();
        link.closed = true;
        link.accept_redial = true;
        let mut session: Session<MockLink> = Session::new(link, Duration::ZERO);

        assert!(session.recover());
        assert!(!session.is_closed());
        assert_eq!(session.link().redials, 1);
        assert_eq!(
            session.collect_pkts().transition,
            Some(Transition::FirstConnection)
        );
    }

    #[test]
    fn test_replies_are_correlated() {
        let mut session: Session<MockLink> = Session::new(MockLink::connected(), Duration::ZERO);
        let request = Signal::text(SignalKind::OpenTemplate, "part_a");
        assert!(session.reply_success(&request, "opened"));
        assert!(session.reply_failure(&request, ""));
        assert_eq!(
            session.link().sent_payloads(),
            vec![(10, "12-opened".to_string()), (11, "12".to_string())]
        );
    }
}
