//! Pre-payment checks on a candidate route.
//!
//! Routes that do not use the forced channels are dropped first. The
//! remaining checks run in a fixed order and the first failing one decides
//! the verdict: outbound liquidity, identical first and last channel,
//! inbound liquidity, fees.

use super::trace::{Direction, FeeRejection, TraceEvent};
use super::Rebalancer;
use crate::client::NodeClient;
use crate::fees::{flat_reference_cost_msat, EconomicFees, FeeMode};
use crate::types::{Channel, Hop, Route};

/// What the route source should stop offering after a rejection.
#[derive(Debug, Clone, PartialEq)]
pub enum Exclusion {
    Nothing,
    FirstHop(Channel),
    Edge {
        chan_id: u64,
        from_pubkey: String,
        to_pubkey: String,
    },
    HighFeeHops,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Valid,
    Invalid(Exclusion),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }
}

impl<'a, C: NodeClient> Rebalancer<'a, C> {
    pub async fn validate(&mut self, route: &Route) -> anyhow::Result<Verdict> {
        let (Some(first), Some(last), Some(before_last)) =
            (route.first_hop(), route.last_hop(), route.hop_before_last())
        else {
            return Ok(Verdict::Invalid(Exclusion::Nothing));
        };

        if let Some(verdict) = self.check_forced_hops(first, before_last, last) {
            return Ok(verdict);
        }

        if let Some(verdict) = self.check_outbound(first, route.total_amt).await? {
            return Ok(verdict);
        }

        if first.chan_id == last.chan_id {
            self.trace.record(TraceEvent::TopologyRejected {
                chan_id: last.chan_id,
            });
            return Ok(Verdict::Invalid(last_hop_edge(before_last, last)));
        }

        if let Some(verdict) = self.check_inbound(before_last, last).await? {
            return Ok(verdict);
        }

        if self.fees_too_high(route, first, last).await? {
            return Ok(Verdict::Invalid(Exclusion::HighFeeHops));
        }

        Ok(Verdict::Valid)
    }

    /// LND pins the outgoing channel but only the last hop's peer, so a
    /// second channel to that peer can still show up as the last hop.
    fn check_forced_hops(&mut self, first: &Hop, before_last: &Hop, last: &Hop) -> Option<Verdict> {
        if let Some(forced) = &self.config.first_hop {
            if first.chan_id != forced.chan_id {
                let expected = forced.chan_id;
                self.trace.record(TraceEvent::ForcedHopMismatch {
                    direction: Direction::Outbound,
                    expected,
                    actual: first.chan_id,
                });
                return Some(Verdict::Invalid(Exclusion::Edge {
                    chan_id: first.chan_id,
                    from_pubkey: last.pub_key.clone(),
                    to_pubkey: first.pub_key.clone(),
                }));
            }
        }
        if let Some(forced) = &self.config.last_hop {
            if last.chan_id != forced.chan_id {
                let expected = forced.chan_id;
                self.trace.record(TraceEvent::ForcedHopMismatch {
                    direction: Direction::Inbound,
                    expected,
                    actual: last.chan_id,
                });
                return Some(Verdict::Invalid(last_hop_edge(before_last, last)));
            }
        }
        None
    }

    async fn check_outbound(&mut self, first: &Hop, total_amt: i64) -> anyhow::Result<Option<Verdict>> {
        // A forced first hop is drained on purpose.
        if self.config.first_hop.is_some() {
            return Ok(None);
        }
        let Some(channel) = self.find_channel(first.chan_id).await? else {
            self.trace.record(TraceEvent::ChannelUnavailable {
                chan_id: first.chan_id,
            });
            return Ok(Some(Verdict::Invalid(Exclusion::Nothing)));
        };
        let ratio = channel.ratio_after_sending(total_amt);
        if ratio < self.config.channel_ratio {
            self.trace.record(TraceEvent::RatioRejected {
                chan_id: channel.chan_id,
                direction: Direction::Outbound,
                ratio,
                target: self.config.channel_ratio,
            });
            return Ok(Some(Verdict::Invalid(Exclusion::FirstHop(channel))));
        }
        Ok(None)
    }

    async fn check_inbound(&mut self, before_last: &Hop, last: &Hop) -> anyhow::Result<Option<Verdict>> {
        if self.config.last_hop.is_some() {
            return Ok(None);
        }
        let Some(channel) = self.find_channel(last.chan_id).await? else {
            self.trace.record(TraceEvent::ChannelUnavailable {
                chan_id: last.chan_id,
            });
            return Ok(Some(Verdict::Invalid(Exclusion::Nothing)));
        };
        let ratio = channel.ratio_after_receiving(last.amt_to_forward);
        if ratio > self.config.channel_ratio {
            self.trace.record(TraceEvent::RatioRejected {
                chan_id: channel.chan_id,
                direction: Direction::Inbound,
                ratio,
                target: self.config.channel_ratio,
            });
            return Ok(Some(Verdict::Invalid(last_hop_edge(before_last, last))));
        }
        Ok(None)
    }

    async fn fees_too_high(&mut self, route: &Route, first: &Hop, last: &Hop) -> anyhow::Result<bool> {
        match self.config.fee_mode {
            FeeMode::Flat { max_fee_factor } => {
                let reference =
                    flat_reference_cost_msat(route.hops_with_fees(), self.config.amount, &self.constants);
                let limit_msat = max_fee_factor * reference;
                if route.total_fees_msat as f64 <= limit_msat {
                    return Ok(false);
                }
                self.trace.record(TraceEvent::FeeRejected(FeeRejection::Flat {
                    fee_msat: route.total_fees_msat,
                    limit_msat,
                }));
                Ok(true)
            }
            FeeMode::Economic { econ_fee_factor } => {
                let first_policy = self.client.get_forwarding_policy(first.chan_id).await?;
                let last_policy = self.client.get_forwarding_policy(last.chan_id).await?;
                let fees = EconomicFees::evaluate(
                    route.total_amt,
                    route.total_fees,
                    &first_policy,
                    &last_policy,
                    econ_fee_factor,
                    &self.constants,
                );
                self.note_capped_rate(last.chan_id, fees.last_hop_rate);
                if !fees.too_high() {
                    return Ok(false);
                }
                self.trace.record(TraceEvent::FeeRejected(FeeRejection::Economic {
                    expected_fee: fees.expected_fee,
                    econ_fee_factor,
                    rebalance_fee: fees.rebalance_fee,
                    missed_fee: fees.missed_fee,
                    difference: fees.difference(),
                }));
                Ok(true)
            }
        }
    }
}

/// The edge from the final intermediary back to us.
fn last_hop_edge(before_last: &Hop, last: &Hop) -> Exclusion {
    Exclusion::Edge {
        chan_id: last.chan_id,
        from_pubkey: before_last.pub_key.clone(),
        to_pubkey: last.pub_key.clone(),
    }
}
