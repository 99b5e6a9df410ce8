use std::{fmt, net::SocketAddr};

/// Client-facing endpoint of a flow (the socket the proxy accepted / received on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ClientAddr(pub(crate) SocketAddr);

impl From<SocketAddr> for ClientAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The flow's intended destination, recovered from the kernel redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TargetAddr(pub(crate) SocketAddr);

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol class, derived from target port, used for policy matching and
/// per-class counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ProtocolClass {
    Http,
    Https,
    Dns,
    Other,
}

impl ProtocolClass {
    pub(crate) fn from_port(port: u16) -> Self {
        match port {
            80 => ProtocolClass::Http,
            443 => ProtocolClass::Https,
            53 => ProtocolClass::Dns,
            _ => ProtocolClass::Other,
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ProtocolClass::Http => "http",
            ProtocolClass::Https => "https",
            ProtocolClass::Dns => "dns",
            ProtocolClass::Other => "other",
        }
    }

    /// Matches a rule's `proto` predicate, which may be a class name or `"any"`.
    pub(crate) fn matches(&self, rule_proto: &str) -> bool {
        let rule_proto = rule_proto.to_ascii_lowercase();
        rule_proto == "any" || rule_proto == self.as_str()
    }
}

/// Outcome of policy evaluation for a single flow (spec §3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Socks,
    Direct,
    Drop,
    Reset,
    Wait,
}

impl Action {
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "socks" => Some(Action::Socks),
            "direct" => Some(Action::Direct),
            "drop" => Some(Action::Drop),
            "reset" => Some(Action::Reset),
            "wait" => Some(Action::Wait),
            _ => None,
        }
    }
}

/// Policy applied when every backend is unavailable and no rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum AllSocksDownPolicy {
    Direct,
    Drop,
    Wait,
}

impl Default for AllSocksDownPolicy {
    fn default() -> Self {
        AllSocksDownPolicy::Direct
    }
}

impl std::str::FromStr for AllSocksDownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(AllSocksDownPolicy::Direct),
            "drop" => Ok(AllSocksDownPolicy::Drop),
            "wait" => Ok(AllSocksDownPolicy::Wait),
            other => Err(format!("invalid ALL_SOCKS_DOWN_POLICY: {other}")),
        }
    }
}

/// The reason a connection or session was torn down by something other than
/// a natural EOF, recorded on the registry record for admin/telemetry use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KillReason {
    UiRequested,
    SocksRecovered,
    PolicyReset,
    IdleTimeout,
    ControlClosed,
}

impl KillReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            KillReason::UiRequested => "ui_requested",
            KillReason::SocksRecovered => "socks_recovered",
            KillReason::PolicyReset => "policy_reset",
            KillReason::IdleTimeout => "idle_timeout",
            KillReason::ControlClosed => "control_closed",
        }
    }
}
