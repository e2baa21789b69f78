//! Topic grammar
//!
//! The first segment of a topic is its namespace. For `user` topics the second
//! segment is the application topic and the third (inbound only) names the
//! control phase. For `service` topics the second segment names the operation.

use std::fmt;

/// Namespace of application traffic
pub const USER_NAMESPACE: &str = "user";

/// Namespace of protocol traffic
pub const SERVICE_NAMESPACE: &str = "service";

/// Subscription token matching every application topic
pub const WILDCARD: &str = "#";

/// Control phase of an inbound user envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Prepare,
    Schedule,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Schedule => "schedule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepare" => Some(Phase::Prepare),
            "schedule" => Some(Phase::Schedule),
            _ => None,
        }
    }
}

/// Service operation named by a `service.<op>` topic
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceOp<'a> {
    Initialize,
    Synchronize,
    InitialState,
    ReportState,
    Other(&'a str),
}

impl<'a> ServiceOp<'a> {
    pub fn parse(s: &'a str) -> Self {
        match s {
            "initialize" => ServiceOp::Initialize,
            "synchronize" => ServiceOp::Synchronize,
            "initialState" => ServiceOp::InitialState,
            "reportstate" => ServiceOp::ReportState,
            other => ServiceOp::Other(other),
        }
    }

    pub fn as_str(&self) -> &'a str {
        match self {
            ServiceOp::Initialize => "initialize",
            ServiceOp::Synchronize => "synchronize",
            ServiceOp::InitialState => "initialState",
            ServiceOp::ReportState => "reportstate",
            ServiceOp::Other(op) => op,
        }
    }
}

/// Classification of an envelope topic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route<'a> {
    /// `user.<topic>.prepare` or `user.<topic>.schedule`
    Control { topic: &'a str, phase: Phase },
    /// Any other `user.<topic>[.<sub>]`
    User { topic: &'a str, sub: Option<&'a str> },
    /// `service.<op>`
    Service(ServiceOp<'a>),
    /// Unknown namespace or missing application topic
    Unknown(&'a str),
}

impl<'a> Route<'a> {
    pub fn parse(topic: &'a str) -> Self {
        let mut parts = topic.split('.');
        let namespace = parts.next().unwrap_or_default();

        match namespace {
            USER_NAMESPACE => {
                let app = match parts.next() {
                    Some(app) if !app.is_empty() => app,
                    _ => return Route::Unknown(topic),
                };
                match parts.next() {
                    Some(sub) => match Phase::parse(sub) {
                        Some(phase) => Route::Control { topic: app, phase },
                        None => Route::User {
                            topic: app,
                            sub: Some(sub),
                        },
                    },
                    None => Route::User {
                        topic: app,
                        sub: None,
                    },
                }
            }
            SERVICE_NAMESPACE => Route::Service(ServiceOp::parse(parts.next().unwrap_or_default())),
            _ => Route::Unknown(topic),
        }
    }
}

/// `user.<app>`
pub fn user_topic(app: &str) -> String {
    format!("{USER_NAMESPACE}.{app}")
}

/// `user.<app>.<phase>`
pub fn control_topic(app: &str, phase: Phase) -> String {
    format!("{USER_NAMESPACE}.{app}.{}", phase.as_str())
}

/// `service.<op>`
pub fn service_topic(op: ServiceOp<'_>) -> String {
    format!("{SERVICE_NAMESPACE}.{}", op.as_str())
}

/// Which application topics a subscription covers
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum TopicFilter {
    /// Every application topic
    Any,
    /// Exactly one application topic
    Exact(String),
}

impl TopicFilter {
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::Any => true,
            TopicFilter::Exact(exact) => exact == topic,
        }
    }
}

impl From<&str> for TopicFilter {
    fn from(topic: &str) -> Self {
        if topic == WILDCARD {
            TopicFilter::Any
        } else {
            TopicFilter::Exact(topic.to_owned())
        }
    }
}

impl From<String> for TopicFilter {
    fn from(topic: String) -> Self {
        if topic == WILDCARD {
            TopicFilter::Any
        } else {
            TopicFilter::Exact(topic)
        }
    }
}

impl fmt::Debug for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicFilter::Any => f.write_str("Topic(*)"),
            TopicFilter::Exact(topic) => write!(f, "Topic({topic})"),
        }
    }
}
