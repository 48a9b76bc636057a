//! Signal Values
//!
//! A signal is the protocol's message: an integer key plus an opaque payload.
//! Identity is the key alone, so `Signal::text(SignalKind::Evaluate, "a")` and
//! `Signal::text(SignalKind::Evaluate, "b")` compare equal. Dispatchers match on
//! [`SignalKind`], the closed enumeration of keys known to this protocol version.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::debug;

macro_rules! signal_kinds {
    ($($(#[$meta:meta])* $variant:ident = $key:literal => $desc:literal,)+) => {
        /// Signal keys reserved by protocol version 1.
        ///
        /// Values are bit-exact with deployed peers. New signals take keys from
        /// an unused range, never a recycled value.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i32)]
        pub enum SignalKind {
            $($(#[$meta])* $variant = $key,)+
        }

        impl SignalKind {
            /// Every kind, in key order
            pub const ALL: &'static [SignalKind] = &[$(SignalKind::$variant,)+];

            /// Look up the kind for a raw key
            pub fn from_key(key: i32) -> Option<Self> {
                match key {
                    $($key => Some(SignalKind::$variant),)+
                    _ => None,
                }
            }

            /// Default human-readable description
            pub fn description(self) -> &'static str {
                match self {
                    $(SignalKind::$variant => $desc,)+
                }
            }
        }
    };
}

signal_kinds! {
    /// Payload: decimal process id of the sender
    Handshake = 0 => "handshake",
    Exit = 1 => "exit",
    /// Payload: project to evaluate
    Evaluate = 2 => "evaluate",
    /// Payload: JSON evaluation result
    Result = 3 => "result",
    /// Payload: decimal pid of the peer's evaluation subprocess
    Process = 4 => "process",
    Idle = 5 => "idle",
    Image = 6 => "image",
    ServerAlive = 7 => "server alive",
    ClientAlive = 8 => "client alive",
    /// Payload: `"<request key>-<text>"`
    Success = 10 => "success",
    /// Payload: `"<request key>-<text>"`
    Failure = 11 => "failure",
    OpenTemplate = 12 => "open template",
    CloseTemplate = 13 => "close template",
    InitSensor = 14 => "init sensor",
    DeinitSensor = 15 => "deinit sensor",
    StartMeasurement = 16 => "start measurement",
    Calibrate = 17 => "calibrate",
    ExportResults = 18 => "export results",
    MoveHome = 19 => "move home",
    Abort = 20 => "abort",
    ErrorReport = 21 => "error report",
    SecondaryReady = 22 => "secondary ready",
    MeasurementDone = 23 => "measurement done",
    ResultName = 24 => "result name",
    CycleDone = 25 => "cycle done",
    PrepareStart = 30 => "inline prepare start",
    PrepareDone = 31 => "inline prepare done",
    PrepareFailed = 32 => "inline prepare failed",
    PrepareAbort = 33 => "inline prepare abort",
    RobotInit = 50 => "robot init",
    RobotReady = 51 => "robot ready",
    RobotOpenTemplate = 52 => "robot open template",
    RobotMove = 53 => "robot move",
    RobotMeasure = 54 => "robot measure",
    RobotMeasureDone = 55 => "robot measure done",
    RobotCompute = 56 => "robot compute",
    RobotExport = 57 => "robot export",
    RobotClose = 58 => "robot close",
    RobotError = 59 => "robot error",
    RobotPosition = 60 => "robot position",
    RobotExit = 61 => "robot exit",
    InlineStart = 100 => "inline start",
    InlineStop = 101 => "inline stop",
    InlinePause = 102 => "inline pause",
    InlineResume = 103 => "inline resume",
    InlineStatus = 104 => "inline status",
    InlineResult = 105 => "inline result",
    InlineReset = 106 => "inline reset",
    InlineHeartbeat = 107 => "inline heartbeat",
}

impl SignalKind {
    /// Raw wire key
    #[inline]
    pub fn key(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.description(), self.key())
    }
}

/// Reserved key ranges, used to label keys that have no named kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRange {
    Core,
    Drc,
    InlinePrepare,
    MultiRobot,
    InlineControl,
    Unassigned,
}

impl KeyRange {
    /// Classify a raw key
    pub fn of(key: i32) -> Self {
        match key {
            0..=9 => KeyRange::Core,
            10..=25 => KeyRange::Drc,
            30..=33 => KeyRange::InlinePrepare,
            50..=61 => KeyRange::MultiRobot,
            100..=139 => KeyRange::InlineControl,
            _ => KeyRange::Unassigned,
        }
    }
}

/// Protocol message: key plus opaque payload
#[derive(Clone)]
pub struct Signal {
    key: i32,
    payload: Vec<u8>,
}

impl Signal {
    /// Create a signal from a raw key
    pub fn new(key: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }

    /// Signal of a known kind without payload
    pub fn empty(kind: SignalKind) -> Self {
        Self::new(kind.key(), Vec::new())
    }

    /// Signal of a known kind with a UTF-8 payload
    pub fn text(kind: SignalKind, text: &str) -> Self {
        Self::new(kind.key(), text.as_bytes().to_vec())
    }

    /// `Success` reply correlated to the request with key `request_key`
    pub fn success_for(request_key: i32, text: &str) -> Self {
        Self::reply(SignalKind::Success, request_key, text)
    }

    /// `Failure` reply correlated to the request with key `request_key`
    pub fn failure_for(request_key: i32, text: &str) -> Self {
        Self::reply(SignalKind::Failure, request_key, text)
    }

    fn reply(kind: SignalKind, request_key: i32, text: &str) -> Self {
        let payload = if text.is_empty() {
            request_key.to_string()
        } else {
            format!("{}-{}", request_key, text)
        };
        Self::new(kind.key(), payload.into_bytes())
    }

    /// Raw wire key
    #[inline]
    pub fn key(&self) -> i32 {
        self.key
    }

    /// Named kind, if the key belongs to this protocol version
    #[inline]
    pub fn kind(&self) -> Option<SignalKind> {
        SignalKind::from_key(self.key)
    }

    /// Raw payload
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload decoded as UTF-8, lossy
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Whether this is a correlated `Success`/`Failure` reply
    pub fn is_reply(&self) -> bool {
        matches!(self.kind(), Some(SignalKind::Success | SignalKind::Failure))
    }

    /// Split a reply payload into the correlated request key and free text.
    ///
    /// The id is the decimal text up to the first `-`. Returns `None` when
    /// that prefix does not parse.
    pub fn reply_parts(&self) -> Option<(i32, Cow<'_, str>)> {
        let text = self.payload_str();
        let (id, rest) = match text.find('-') {
            Some(pos) => (&text[..pos], &text[pos + 1..]),
            None => (&text[..], ""),
        };
        let id = id.trim().parse::<i32>().ok()?;
        Some((id, Cow::Owned(rest.to_string())))
    }
}

impl PartialEq for Signal {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Signal {}

impl Hash for Signal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialEq<SignalKind> for Signal {
    fn eq(&self, other: &SignalKind) -> bool {
        self.key == other.key()
    }
}

impl From<SignalKind> for Signal {
    fn from(kind: SignalKind) -> Self {
        Signal::empty(kind)
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("key", &self.key)
            .field("kind", &self.kind())
            .field("payload", &self.payload_str())
            .finish()
    }
}

/// Key to description mapping used for diagnostics.
///
/// Built once at startup and shared by reference. The first description
/// registered for a key wins.
#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    descriptions: HashMap<i32, String>,
}

impl SignalRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every [`SignalKind`]
    pub fn with_protocol() -> Self {
        let mut registry = Self::new();
        for kind in SignalKind::ALL {
            registry.register(kind.key(), kind.description());
        }
        registry
    }

    /// Register a description. Returns `false` if the key was already known,
    /// in which case the existing description is kept.
    pub fn register(&mut self, key: i32, description: impl Into<String>) -> bool {
        use std::collections::hash_map::Entry;
        match self.descriptions.entry(key) {
            Entry::Occupied(existing) => {
                let ignored: String = description.into();
                debug!(key, kept = %existing.get(), %ignored, "Signal key already registered");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(description.into());
                true
            }
        }
    }

    pub fn describe(&self, key: i32) -> Option<&str> {
        self.descriptions.get(&key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }

    /// Log label such as `evaluate(2)` or `key 42 (multi-robot)`
    pub fn label(&self, signal: &Signal) -> String {
        self.label_key(signal.key())
    }

    pub fn label_key(&self, key: i32) -> String {
        match self.describe(key) {
            Some(desc) => format!("{}({})", desc, key),
            None => match KeyRange::of(key) {
                KeyRange::Unassigned => format!("key {}", key),
                range => format!("key {} ({:?})", key, range),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_payload() {
        let a = Signal::new(42, b"one".to_vec());
        let b = Signal::new(42, b"two".to_vec());
        let c = Signal::new(43, b"one".to_vec());

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_equality_with_kind() {
        let signal = Signal::text(SignalKind::Evaluate, "proj1");
        assert!(signal == SignalKind::Evaluate);
        assert!(signal != SignalKind::Result);
    }

    #[test]
    fn test_kind_keys_are_bit_exact() {
        assert_eq!(SignalKind::Handshake.key(), 0);
        assert_eq!(SignalKind::Exit.key(), 1);
        assert_eq!(SignalKind::Evaluate.key(), 2);
        assert_eq!(SignalKind::Result.key(), 3);
        assert_eq!(SignalKind::Process.key(), 4);
        assert_eq!(SignalKind::Idle.key(), 5);
        assert_eq!(SignalKind::Image.key(), 6);
        assert_eq!(SignalKind::ServerAlive.key(), 7);
        assert_eq!(SignalKind::ClientAlive.key(), 8);
    }

    #[test]
    fn test_from_key_round_trips_every_kind() {
        for kind in SignalKind::ALL {
            assert_eq!(SignalKind::from_key(kind.key()), Some(*kind));
        }
        assert_eq!(SignalKind::from_key(9), None);
        assert_eq!(SignalKind::from_key(-1), None);
    }

    #[test]
    fn test_reply_parts() {
        let reply = Signal::success_for(2, "proj1 done");
        assert_eq!(reply.payload_str(), "2-proj1 done");
        let (id, text) = reply.reply_parts().unwrap();
        assert_eq!(id, 2);
        assert_eq!(text, "proj1 done");

        let bare = Signal::text(SignalKind::Success, "2");
        assert_eq!(bare.reply_parts().unwrap().0, 2);

        let broken = Signal::text(SignalKind::Failure, "abc-oops");
        assert!(broken.reply_parts().is_none());
    }

    #[test]
    fn test_registry_first_registration_wins() {
        let mut registry = SignalRegistry::new();
        assert!(registry.register(200, "first"));
        assert!(!registry.register(200, "second"));
        assert_eq!(registry.describe(200), Some("first"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_labels() {
        let registry = SignalRegistry::with_protocol();
        assert_eq!(registry.label(&Signal::empty(SignalKind::Evaluate)), "evaluate(2)");
        assert_eq!(registry.label_key(120), "key 120 (InlineControl)");
        assert_eq!(registry.label_key(999), "key 999");
    }

    #[test]
    fn test_key_ranges() {
        assert_eq!(KeyRange::of(0), KeyRange::Core);
        assert_eq!(KeyRange::of(25), KeyRange::Drc);
        assert_eq!(KeyRange::of(31), KeyRange::InlinePrepare);
        assert_eq!(KeyRange::of(61), KeyRange::MultiRobot);
        assert_eq!(KeyRange::of(139), KeyRange::InlineControl);
        assert_eq!(KeyRange::of(40), KeyRange::Unassigned);
    }
}
