use crate::types::{PaymentResult, Route};
use std::fmt;

/// Failures that tell us which edge to stop using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    TemporaryChannelFailure,
    UnknownNextPeer,
    FeeInsufficient,
    ChannelDisabled,
}

const FAILURE_TABLE: [(u32, FailureKind); 4] = [
    (15, FailureKind::TemporaryChannelFailure),
    (18, FailureKind::UnknownNextPeer),
    (12, FailureKind::FeeInsufficient),
    (14, FailureKind::ChannelDisabled),
];

impl FailureKind {
    pub fn from_code(code: u32) -> Option<Self> {
        FAILURE_TABLE
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, kind)| *kind)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureKind::TemporaryChannelFailure => "Temporary channel failure",
            FailureKind::UnknownNextPeer => "Unknown next peer",
            FailureKind::FeeInsufficient => "Fee insufficient",
            FailureKind::ChannelDisabled => "Channel disabled",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Exclude the edge at which `failure_source` failed.
    ExcludeEdgeOnRoute {
        kind: FailureKind,
        failure_source: String,
    },
    /// Nothing learned; the raw code is reported only.
    Report {
        code: u32,
        failure_source_index: usize,
    },
}

/// Identity of the node that reported the failure. Index 0 is the final
/// node, index i the node reached by hop i - 1.
pub fn failure_source_pubkey<'r>(result: &PaymentResult, route: &'r Route) -> Option<&'r str> {
    let hop = match result.failure_source_index {
        0 => route.last_hop(),
        i => route.hops.get(i - 1),
    };
    hop.map(|h| h.pub_key.as_str())
}

pub fn classify(result: &PaymentResult, route: &Route) -> FailureAction {
    let report = FailureAction::Report {
        code: result.failure_code,
        failure_source_index: result.failure_source_index,
    };
    let Some(kind) = FailureKind::from_code(result.failure_code) else {
        return report;
    };
    match failure_source_pubkey(result, route) {
        Some(pubkey) => FailureAction::ExcludeEdgeOnRoute {
            kind,
            failure_source: pubkey.to_string(),
        },
        None => report,
    }
}
