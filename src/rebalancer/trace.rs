//! Structured record of the decisions taken during one rebalance session.
//!
//! Every event is logged when recorded; the full list is returned with the
//! session outcome so callers and tests can inspect it.

use crate::rebalancer::failure::FailureKind;
use log::{debug, info, warn};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Why a channel was taken out of the search before any route was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedReason {
    /// Forced first hop may not also bring funds back.
    ForcedFirstHop,
    /// Forced last hop may not also carry funds out.
    ForcedLastHop,
    /// Receiving the amount would leave too much local balance.
    HighRatioAfterReceiving,
    /// Sending the amount would leave too little local balance.
    LowRatioAfterSending,
    /// Our fee rate on the channel exceeds the forced last hop's.
    FeeRateAboveLastHop,
    /// Listed in the configured exclusions.
    Configured,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeeRejection {
    Flat {
        fee_msat: i64,
        limit_msat: f64,
    },
    Economic {
        expected_fee: f64,
        econ_fee_factor: f64,
        rebalance_fee: f64,
        missed_fee: f64,
        difference: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    FeeLimitSet {
        limit_sat: f64,
        econ_fee_factor: f64,
    },
    FeeRateCapped {
        chan_id: u64,
        original: i64,
        capped: i64,
    },
    ChannelExcluded {
        chan_id: u64,
        reason: SeedReason,
    },
    ChannelUnavailable {
        chan_id: u64,
    },
    RatioRejected {
        chan_id: u64,
        direction: Direction,
        ratio: f64,
        target: f64,
    },
    TopologyRejected {
        chan_id: u64,
    },
    /// Route enters or leaves through another channel than the forced one.
    ForcedHopMismatch {
        direction: Direction,
        expected: u64,
        actual: u64,
    },
    FeeRejected(FeeRejection),
    AttemptStarted {
        attempt: usize,
        path: Vec<u64>,
        fee_msat: i64,
    },
    FailureClassified {
        kind: FailureKind,
        failure_source: String,
    },
    UnknownFailure {
        code: u32,
        failure_source_index: usize,
    },
    Succeeded {
        attempts: usize,
        amount: i64,
        fee_sat: i64,
        inbound_decreased: String,
        inbound_increased: String,
    },
    Exhausted {
        attempts: usize,
    },
}

impl TraceEvent {
    fn log(&self) {
        match self {
            TraceEvent::ChannelExcluded { .. } => debug!("Rebalancer: {}", self),
            TraceEvent::ChannelUnavailable { .. } | TraceEvent::UnknownFailure { .. } => {
                warn!("Rebalancer: {}", self)
            }
            _ => info!("Rebalancer: {}", self),
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::FeeLimitSet {
                limit_sat,
                econ_fee_factor,
            } => write!(
                f,
                "setting fee limit to {} sat (economic, factor {})",
                *limit_sat as i64, econ_fee_factor
            ),
            TraceEvent::FeeRateCapped {
                chan_id,
                original,
                capped,
            } => write!(
                f,
                "using capped fee rate {} for channel {} (original fee rate {})",
                capped, chan_id, original
            ),
            TraceEvent::ChannelExcluded { chan_id, reason } => {
                write!(f, "ignoring channel {} ({:?})", chan_id, reason)
            }
            TraceEvent::ChannelUnavailable { chan_id } => {
                write!(f, "unable to get channel information for {}", chan_id)
            }
            TraceEvent::RatioRejected {
                chan_id,
                direction: Direction::Outbound,
                ratio,
                target,
            } => write!(
                f,
                "outbound channel {} would have low local ratio {:.3} (< {}) after sending",
                chan_id, ratio, target
            ),
            TraceEvent::RatioRejected {
                chan_id,
                direction: Direction::Inbound,
                ratio,
                target,
            } => write!(
                f,
                "inbound channel {} would have high local ratio {:.3} (> {}) after receiving",
                chan_id, ratio, target
            ),
            TraceEvent::ForcedHopMismatch {
                direction,
                expected,
                actual,
            } => write!(
                f,
                "skipping route using channel {} instead of forced {:?} channel {}",
                actual, direction, expected
            ),
            TraceEvent::TopologyRejected { chan_id } => write!(
                f,
                "outbound and inbound channel {} are identical",
                chan_id
            ),
            TraceEvent::FeeRejected(FeeRejection::Flat {
                fee_msat,
                limit_msat,
            }) => write!(
                f,
                "high fees ({} sat over limit of {} sat)",
                (*fee_msat as f64 - limit_msat) as i64 / 1000,
                *limit_msat as i64 / 1000
            ),
            TraceEvent::FeeRejected(FeeRejection::Economic {
                expected_fee,
                econ_fee_factor,
                rebalance_fee,
                missed_fee,
                difference,
            }) => write!(
                f,
                "high fees ({} expected future fee income for inbound channel (factor {}), \
                 have to pay {} now, missing out on {} future fees for outbound channel, \
                 difference {})",
                expected_fee.floor(),
                econ_fee_factor,
                *rebalance_fee as i64,
                missed_fee.ceil(),
                difference.ceil()
            ),
            TraceEvent::AttemptStarted {
                attempt,
                path,
                fee_msat,
            } => write!(
                f,
                "trying route #{} over {:?} ({} msat fees)",
                attempt, path, fee_msat
            ),
            TraceEvent::FailureClassified {
                kind,
                failure_source,
            } => write!(f, "{}, ignoring edge at {}", kind, failure_source),
            TraceEvent::UnknownFailure {
                code,
                failure_source_index,
            } => write!(
                f,
                "unknown error code {} (failure source index {})",
                code, failure_source_index
            ),
            TraceEvent::Succeeded {
                attempts,
                amount,
                fee_sat,
                inbound_decreased,
                inbound_increased,
            } => write!(
                f,
                "success after {} attempt(s): decreased inbound liquidity on {} by {} sat, \
                 increased inbound liquidity on {}, fee {} sat",
                attempts, inbound_decreased, amount, inbound_increased, fee_sat
            ),
            TraceEvent::Exhausted { attempts } => write!(
                f,
                "could not find any suitable route ({} attempt(s))",
                attempts
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn record(&mut self, event: TraceEvent) {
        event.log();
        self.events.push(event);
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }
}
