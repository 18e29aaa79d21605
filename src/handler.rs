//! Helpers for programs the agent runs as event handlers.
//!
//! The agent invokes a handler once per event, describing the event through
//! `SERF_*` environment variables and, for user events and queries, writing
//! the payload to the handler's standard input. [`SerfEvent`] captures that
//! invocation and [`Handler`] routes it to registered callbacks.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, IsTerminal, Read};
use std::str::FromStr;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// Largest inline payload read from standard input.
pub const MAX_PAYLOAD_BYTES: u64 = 4096;

const ENV_PREFIX: &str = "SERF";
const EVENT_VAR: &str = "SERF_EVENT";
const USER_EVENT_VAR: &str = "SERF_USER_EVENT";
const QUERY_NAME_VAR: &str = "SERF_QUERY_NAME";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("SERF_EVENT is not set; not running under the agent")]
    MissingEvent,

    #[error("failed to read event payload: {0}")]
    Io(#[from] io::Error),

    #[error("invalid event name pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Event type announced in `SERF_EVENT`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    MemberJoin,
    MemberLeave,
    MemberFailed,
    MemberUpdate,
    MemberReap,
    User,
    Query,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::MemberJoin => "member-join",
            EventKind::MemberLeave => "member-leave",
            EventKind::MemberFailed => "member-failed",
            EventKind::MemberUpdate => "member-update",
            EventKind::MemberReap => "member-reap",
            EventKind::User => "user",
            EventKind::Query => "query",
            EventKind::Other(other) => other,
        }
    }

    /// User events and queries carry a name and a payload.
    pub fn is_named(&self) -> bool {
        matches!(self, EventKind::User | EventKind::Query)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "member-join" => EventKind::MemberJoin,
            "member-leave" => EventKind::MemberLeave,
            "member-failed" => EventKind::MemberFailed,
            "member-update" => EventKind::MemberUpdate,
            "member-reap" => EventKind::MemberReap,
            "user" => EventKind::User,
            "query" => EventKind::Query,
            other => EventKind::Other(other.to_string()),
        };
        Ok(kind)
    }
}

/// One handler invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct SerfEvent {
    /// Every `SERF*` variable, values trimmed.
    pub environment: BTreeMap<String, String>,
    pub event_type: EventKind,
    /// User event or query name.
    pub name: Option<String>,
    /// Inline payload for user events and queries, whitespace trimmed.
    pub payload: Option<Vec<u8>>,
}

impl SerfEvent {
    /// Reads the current process's environment and, for user events and
    /// queries, its standard input.
    pub fn from_env() -> Result<Self, HandlerError> {
        let vars = std::env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, value.into_string().ok()?))
        });
        let stdin = io::stdin();
        if stdin.is_terminal() {
            Self::from_parts(vars, None::<io::Empty>)
        } else {
            Self::from_parts(vars, Some(stdin.lock()))
        }
    }

    /// Builds an event from explicit variables and an optional payload source.
    pub fn from_parts<I, K, V, R>(vars: I, payload: Option<R>) -> Result<Self, HandlerError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
        R: Read,
    {
        let environment: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.as_ref().trim().to_string()))
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();

        let event_type = environment
            .get(EVENT_VAR)
            .filter(|value| !value.is_empty())
            .ok_or(HandlerError::MissingEvent)?
            .parse::<EventKind>()
            .unwrap_or_else(|never| match never {});

        let (name, payload) = match event_type {
            EventKind::User => (environment.get(USER_EVENT_VAR).cloned(), read_payload(payload)?),
            EventKind::Query => (environment.get(QUERY_NAME_VAR).cloned(), read_payload(payload)?),
            _ => (None, None),
        };

        debug!(event = "serf_event_loaded", kind = %event_type, name = ?name);
        Ok(Self {
            environment,
            event_type,
            name,
            payload,
        })
    }

    pub fn payload_str(&self) -> Option<String> {
        self.payload
            .as_deref()
            .map(|payload| String::from_utf8_lossy(payload).into_owned())
    }
}

fn read_payload<R: Read>(source: Option<R>) -> Result<Option<Vec<u8>>, HandlerError> {
    let Some(source) = source else {
        return Ok(None);
    };
    let mut payload = Vec::new();
    source.take(MAX_PAYLOAD_BYTES).read_to_end(&mut payload)?;
    Ok(Some(payload.trim_ascii().to_vec()))
}

/// Selects events by name.
#[derive(Clone, Debug)]
pub enum NameMatcher {
    Exact(String),
    Pattern(Regex),
}

impl NameMatcher {
    /// Matches one event name exactly.
    pub fn exact(name: impl Into<String>) -> Self {
        NameMatcher::Exact(name.into())
    }

    /// Matches names the regex `pattern` finds a match in.
    pub fn pattern(pattern: &str) -> Result<Self, HandlerError> {
        Ok(NameMatcher::Pattern(Regex::new(pattern)?))
    }

    pub fn matches(&self, name: Option<&str>) -> bool {
        match (self, name) {
            (NameMatcher::Exact(expected), Some(name)) => expected == name,
            (NameMatcher::Pattern(pattern), Some(name)) => pattern.is_match(name),
            (_, None) => false,
        }
    }
}

impl From<&str> for NameMatcher {
    fn from(name: &str) -> Self {
        NameMatcher::exact(name)
    }
}

impl From<Regex> for NameMatcher {
    fn from(pattern: Regex) -> Self {
        NameMatcher::Pattern(pattern)
    }
}

type Callback = Box<dyn FnMut(&SerfEvent) + Send>;

struct Registration {
    kind: EventKind,
    matcher: Option<NameMatcher>,
    callback: Callback,
}

/// Routes a handler invocation to the callbacks registered for it.
#[derive(Default)]
pub struct Handler {
    registrations: Vec<Registration>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("callbacks", &self.registrations.len())
            .finish()
    }
}

impl Handler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `kind`. Without a matcher every event of that
    /// kind is delivered.
    pub fn on<F>(&mut self, kind: EventKind, matcher: Option<NameMatcher>, callback: F) -> &mut Self
    where
        F: FnMut(&SerfEvent) + Send + 'static,
    {
        self.registrations.push(Registration {
            kind,
            matcher,
            callback: Box::new(callback),
        });
        self
    }

    /// Calls every matching callback in registration order and returns how
    /// many ran.
    pub fn dispatch(&mut self, event: &SerfEvent) -> usize {
        let mut invoked = 0;
        for registration in &mut self.registrations {
            if registration.kind != event.event_type {
                continue;
            }
            let matched = registration
                .matcher
                .as_ref()
                .map_or(true, |matcher| matcher.matches(event.name.as_deref()));
            if matched {
                (registration.callback)(event);
                invoked += 1;
            }
        }
        debug!(event = "serf_event_dispatched", kind = %event.event_type, invoked);
        invoked
    }

    /// Loads the current invocation and dispatches it.
    pub fn run(&mut self) -> Result<usize, HandlerError> {
        let event = SerfEvent::from_env()?;
        Ok(self.dispatch(&event))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn user_event(name: &str, payload: &str) -> SerfEvent {
        SerfEvent::from_parts(
            [
                ("SERF_EVENT", "user"),
                ("SERF_USER_EVENT", name),
                ("SERF_SELF_NAME", " web-1 "),
                ("PATH", "/usr/bin"),
            ],
            Some(payload.as_bytes()),
        )
        .expect("event")
    }

    #[test]
    fn user_event_reads_name_payload_and_serf_vars_only() {
        let event = user_event("deploy", "  v1.2.3\n");
        assert_eq!(event.event_type, EventKind::User);
        assert_eq!(event.name.as_deref(), Some("deploy"));
        assert_eq!(event.payload.as_deref(), Some(&b"v1.2.3"[..]));
        assert_eq!(
            event.environment.get("SERF_SELF_NAME").map(String::as_str),
            Some("web-1")
        );
        assert!(!event.environment.contains_key("PATH"));
    }

    #[test]
    fn query_name_comes_from_query_variable() {
        let event = SerfEvent::from_parts(
            [("SERF_EVENT", "query"), ("SERF_QUERY_NAME", "uptime")],
            Some(&b""[..]),
        )
        .expect("event");
        assert_eq!(event.event_type, EventKind::Query);
        assert_eq!(event.name.as_deref(), Some("uptime"));
        assert_eq!(event.payload.as_deref(), Some(&b""[..]));
    }

    #[test]
    fn member_events_skip_payload() {
        let event = SerfEvent::from_parts(
            [("SERF_EVENT", "member-join")],
            Some(&b"ignored"[..]),
        )
        .expect("event");
        assert_eq!(event.event_type, EventKind::MemberJoin);
        assert!(event.name.is_none());
        assert!(event.payload.is_none());
    }

    #[test]
    fn payload_is_capped() {
        let large = "x".repeat(10_000);
        let event = user_event("bulk", &large);
        assert_eq!(event.payload.map(|payload| payload.len()), Some(4096));
    }

    #[test]
    fn missing_event_type_is_an_error() {
        let err = SerfEvent::from_parts([("SERF_SELF_NAME", "web-1")], None::<&[u8]>)
            .expect_err("no event");
        assert!(matches!(err, HandlerError::MissingEvent));
    }

    #[test]
    fn dispatch_honours_kind_and_matchers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handler = Handler::new();
        for (label, matcher) in [
            ("any", None),
            ("exact", Some(NameMatcher::from("deploy"))),
            ("pattern", Some(NameMatcher::pattern("^dep").expect("regex"))),
            ("other", Some(NameMatcher::from("restart"))),
        ] {
            let seen = Arc::clone(&seen);
            handler.on(EventKind::User, matcher, move |event| {
                seen.lock()
                    .expect("lock")
                    .push(format!("{label}:{}", event.name.as_deref().unwrap_or("")));
            });
        }
        handler.on(EventKind::Query, None, |_| panic!("wrong kind"));

        assert_eq!(handler.dispatch(&user_event("deploy", "")), 3);
        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["any:deploy", "exact:deploy", "pattern:deploy"]
        );
    }

    #[test]
    fn invalid_pattern_is_reported() {
        assert!(matches!(
            NameMatcher::pattern("(unclosed"),
            Err(HandlerError::Pattern(_))
        ));
    }

    #[test]
    fn event_kind_parses_agent_names() {
        assert_eq!("member-failed".parse::<EventKind>(), Ok(EventKind::MemberFailed));
        assert_eq!("USER".parse::<EventKind>(), Ok(EventKind::User));
        assert_eq!(
            "custom".parse::<EventKind>(),
            Ok(EventKind::Other("custom".to_string()))
        );
    }
}
