use std::fmt;

/// One of the two clusters sitting behind the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterType {
    Origin,
    Target,
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterType::Origin => write!(f, "origin"),
            ClusterType::Target => write!(f, "target"),
        }
    }
}

/// Where a client request has to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardDecision {
    Origin,
    Target,
    Both,
}

impl ForwardDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ForwardDecision::Origin => "origin",
            ForwardDecision::Target => "target",
            ForwardDecision::Both => "both",
        }
    }
}

/// What the proxy remembers about a prepared statement besides its ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedStatementInfo {
    pub forward_decision: ForwardDecision,
}

impl PreparedStatementInfo {
    pub fn new(forward_decision: ForwardDecision) -> Self {
        Self { forward_decision }
    }
}
