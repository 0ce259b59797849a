pub mod amount;
pub mod failure;
pub mod history;
pub mod trace;
pub mod validator;

use crate::client::NodeClient;
use crate::config::Config;
use crate::db::Database;
use crate::fees::{self, CappedRate, FeeConstants, FeeLimit, FeeMode};
use crate::routes::{RouteRequest, RouteSource, Routes};
use crate::types::{Channel, Route};
use failure::FailureAction;
use history::SessionRecord;
use log::{debug, info, warn};
use std::collections::HashSet;
use trace::{SeedReason, Trace, TraceEvent};
use validator::{Exclusion, Verdict};

/// Everything one rebalance session needs to know up front.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceConfig {
    /// Amount to move (sat).
    pub amount: i64,
    /// Channel the funds must leave through.
    pub first_hop: Option<Channel>,
    /// Channel the funds must come back through.
    pub last_hop: Option<Channel>,
    /// Target local ratio (0.0 to 1.0).
    pub channel_ratio: f64,
    /// Channels never used as first hop.
    pub excluded: Vec<u64>,
    pub fee_mode: FeeMode,
}

/// Per-run choices from the command line. Unset fields fall back to the
/// `[rebalance]` section of the config file.
#[derive(Debug, Default, Clone)]
pub struct RebalanceArgs {
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: Option<i64>,
    pub ratio_percent: Option<f64>,
    pub excluded: Vec<u64>,
    pub max_fee_factor: Option<f64>,
    pub econ_fee: bool,
    pub econ_fee_factor: Option<f64>,
}

impl RebalanceConfig {
    pub fn from_args(config: &Config, args: &RebalanceArgs, channels: &[Channel]) -> anyhow::Result<Self> {
        if args.from.is_none() && args.to.is_none() {
            anyhow::bail!("At least one of --from or --to is required");
        }
        let first_hop = args
            .from
            .as_deref()
            .map(|s| amount::resolve_channel(channels, s))
            .transpose()?;
        let last_hop = args
            .to
            .as_deref()
            .map(|s| amount::resolve_channel(channels, s))
            .transpose()?;

        let channel_ratio = args
            .ratio_percent
            .map(|p| p / 100.0)
            .unwrap_or(config.rebalance.channel_ratio);
        if !(0.0..=1.0).contains(&channel_ratio) {
            anyhow::bail!("Ratio must be between 0 and 100 percent");
        }

        let amount = amount::plan_amount(first_hop.as_ref(), last_hop.as_ref(), channel_ratio, args.amount)?;

        let mut excluded = config.rebalance.excluded.clone();
        excluded.extend(args.excluded.iter().copied());

        let fee_mode = if args.econ_fee || config.rebalance.econ_fee {
            FeeMode::economic(args.econ_fee_factor.or(config.rebalance.econ_fee_factor))
        } else {
            FeeMode::Flat {
                max_fee_factor: args
                    .max_fee_factor
                    .unwrap_or(config.rebalance.max_fee_factor),
            }
        };

        Ok(Self {
            amount,
            first_hop,
            last_hop,
            channel_ratio,
            excluded,
            fee_mode,
        })
    }
}

#[derive(Debug)]
pub struct RebalanceOutcome {
    pub success: bool,
    /// Routes a payment was attempted on, in order.
    pub attempts: Vec<Route>,
    pub fee_paid_sats: i64,
    pub events: Vec<TraceEvent>,
}

impl RebalanceOutcome {
    pub fn successful_route(&self) -> Option<&Route> {
        if self.success {
            self.attempts.last()
        } else {
            None
        }
    }
}

/// Drives one rebalance session against a route source.
pub struct Rebalancer<'a, C: NodeClient> {
    client: &'a C,
    config: RebalanceConfig,
    constants: FeeConstants,
    trace: Trace,
    capped_reported: HashSet<u64>,
}

impl<'a, C: NodeClient> Rebalancer<'a, C> {
    pub fn new(client: &'a C, config: RebalanceConfig, constants: FeeConstants) -> Self {
        Self {
            client,
            config,
            constants,
            trace: Trace::default(),
            capped_reported: HashSet::new(),
        }
    }

    /// Compute the fee limit and create the self-addressed invoice.
    pub async fn prepare(&mut self) -> anyhow::Result<RouteRequest> {
        let fee_limit = self.fee_limit().await?;

        let memo_channel = self
            .config
            .last_hop
            .as_ref()
            .or(self.config.first_hop.as_ref())
            .ok_or_else(|| anyhow::anyhow!("A first or last hop channel is required"))?;
        let memo = format!("Rebalance of channel with ID {}", memo_channel.chan_id);

        match &self.config.last_hop {
            Some(last) => {
                let alias = self.client.resolve_alias(&last.remote_pubkey).await?;
                info!(
                    "Rebalancer: sending {} sat to rebalance channel {} ({})",
                    self.config.amount, last.chan_id, alias
                );
            }
            None => info!("Rebalancer: sending {} sat", self.config.amount),
        }
        if self.config.channel_ratio != 0.5 {
            info!(
                "Rebalancer: channel ratio used is {}%",
                (self.config.channel_ratio * 100.0) as i64
            );
        }
        if let Some(first) = &self.config.first_hop {
            let alias = self.client.resolve_alias(&first.remote_pubkey).await?;
            info!("Rebalancer: forced first channel {} ({})", first.chan_id, alias);
        }

        let invoice = self.client.generate_invoice(&memo, self.config.amount).await?;

        let hop_fee_budget_msat = match self.config.fee_mode {
            FeeMode::Flat { max_fee_factor } => {
                Some(max_fee_factor * fees::flat_reference_cost_msat(1, self.config.amount, &self.constants))
            }
            FeeMode::Economic { .. } => None,
        };

        Ok(RouteRequest {
            invoice,
            first_hop: self.config.first_hop.clone(),
            last_hop: self.config.last_hop.clone(),
            fee_limit_msat: fee_limit.map(|l| l.limit_msat()),
            hop_fee_budget_msat,
        })
    }

    async fn fee_limit(&mut self) -> anyhow::Result<Option<FeeLimit>> {
        let last_hop = match (&self.config.fee_mode, &self.config.last_hop) {
            (FeeMode::Economic { .. }, Some(last)) => last.chan_id,
            _ => return Ok(None),
        };
        let policy = self.client.get_forwarding_policy(last_hop).await?;
        let Some(limit) = fees::fee_limit(&self.config.fee_mode, self.config.amount, Some(&policy), &self.constants)
        else {
            return Ok(None);
        };
        self.note_capped_rate(last_hop, limit.rate);
        self.trace.record(TraceEvent::FeeLimitSet {
            limit_sat: limit.limit_sat,
            econ_fee_factor: limit.econ_fee_factor,
        });
        Ok(Some(limit))
    }

    /// Take out channels that can never serve their role before the first
    /// route is requested.
    pub async fn seed_exclusions<R: RouteSource>(&mut self, routes: &mut R) -> anyhow::Result<()> {
        let own = self.client.get_own_identity().await?;
        let channels = self.client.list_channels().await?;
        let amount = self.config.amount;
        let target = self.config.channel_ratio;

        if let Some(first) = self.config.first_hop.clone() {
            routes.exclude_edge_between(first.chan_id, &first.remote_pubkey, &own, false);
            self.record_seed(first.chan_id, SeedReason::ForcedFirstHop);
            if self.config.last_hop.is_none() {
                for channel in &channels {
                    if channel.ratio_after_receiving(amount) > target {
                        routes.exclude_edge_between(channel.chan_id, &channel.remote_pubkey, &own, false);
                        self.record_seed(channel.chan_id, SeedReason::HighRatioAfterReceiving);
                    }
                }
            }
        }

        if let Some(last) = self.config.last_hop.clone() {
            routes.exclude_edge_between(last.chan_id, &own, &last.remote_pubkey, false);
            self.record_seed(last.chan_id, SeedReason::ForcedLastHop);
            if self.config.fee_mode.is_economic() {
                let last_rate = self
                    .client
                    .get_forwarding_policy(last.chan_id)
                    .await?
                    .fee_rate_milli_msat;
                for channel in &channels {
                    let policy = self.client.get_forwarding_policy(channel.chan_id).await?;
                    if policy.fee_rate_milli_msat > last_rate {
                        routes.exclude_edge_between(channel.chan_id, &own, &channel.remote_pubkey, false);
                        self.record_seed(channel.chan_id, SeedReason::FeeRateAboveLastHop);
                    }
                }
            }
        }

        for channel in &channels {
            if self.config.first_hop.is_none() && channel.ratio_after_sending(amount) < target {
                routes.exclude_first_hop(channel, false);
                self.record_seed(channel.chan_id, SeedReason::LowRatioAfterSending);
            }
            if self.config.excluded.contains(&channel.chan_id) {
                routes.exclude_first_hop(channel, true);
                self.record_seed(channel.chan_id, SeedReason::Configured);
            }
        }
        Ok(())
    }

    /// Fetch, validate and attempt routes until one succeeds or the source
    /// runs dry.
    pub async fn execute<R: RouteSource>(
        mut self,
        request: &RouteRequest,
        routes: &mut R,
    ) -> anyhow::Result<RebalanceOutcome> {
        self.seed_exclusions(routes).await?;

        let mut attempts: Vec<Route> = Vec::new();
        while routes.has_next().await? {
            let Some(route) = routes.next() else {
                break;
            };

            if let Verdict::Invalid(exclusion) = self.validate(&route).await? {
                apply_exclusion(routes, exclusion, &route);
                continue;
            }

            attempts.push(route.clone());
            self.trace.record(TraceEvent::AttemptStarted {
                attempt: attempts.len(),
                path: route.channel_path(),
                fee_msat: route.total_fees_msat,
            });
            debug!("Rebalancer: route #{}\n{}", attempts.len(), route);

            let result = self.client.send_payment(&request.invoice, &route).await?;
            if result.is_success() {
                self.report_success(&route, attempts.len()).await?;
                let fee_paid_sats = route.total_fees;
                return Ok(self.finish(true, attempts, fee_paid_sats));
            }

            match failure::classify(&result, &route) {
                FailureAction::ExcludeEdgeOnRoute {
                    kind,
                    failure_source,
                } => {
                    routes.exclude_edge_on_route(&failure_source, &route);
                    self.trace.record(TraceEvent::FailureClassified {
                        kind,
                        failure_source,
                    });
                }
                FailureAction::Report {
                    code,
                    failure_source_index,
                } => self.trace.record(TraceEvent::UnknownFailure {
                    code,
                    failure_source_index,
                }),
            }
        }

        self.trace.record(TraceEvent::Exhausted {
            attempts: attempts.len(),
        });
        Ok(self.finish(false, attempts, 0))
    }

    async fn report_success(&mut self, route: &Route, attempts: usize) -> anyhow::Result<()> {
        let (Some(first), Some(before_last), Some(last)) =
            (route.first_hop(), route.hop_before_last(), route.last_hop())
        else {
            return Ok(());
        };
        let inbound_decreased = self.client.resolve_alias(&before_last.pub_key).await?;
        let inbound_increased = self.client.resolve_alias(&first.pub_key).await?;
        self.trace.record(TraceEvent::Succeeded {
            attempts,
            amount: last.amt_to_forward,
            fee_sat: route.total_fees,
            inbound_decreased,
            inbound_increased,
        });
        info!("Rebalancer: successful route\n{}", route);
        Ok(())
    }

    fn finish(self, success: bool, attempts: Vec<Route>, fee_paid_sats: i64) -> RebalanceOutcome {
        RebalanceOutcome {
            success,
            attempts,
            fee_paid_sats,
            events: self.trace.into_events(),
        }
    }

    async fn find_channel(&self, chan_id: u64) -> anyhow::Result<Option<Channel>> {
        let channels = self.client.list_channels().await?;
        Ok(channels.into_iter().find(|c| c.chan_id == chan_id))
    }

    fn note_capped_rate(&mut self, chan_id: u64, rate: CappedRate) {
        if rate.was_capped() && self.capped_reported.insert(chan_id) {
            self.trace.record(TraceEvent::FeeRateCapped {
                chan_id,
                original: rate.original,
                capped: rate.rate,
            });
        }
    }

    fn record_seed(&mut self, chan_id: u64, reason: SeedReason) {
        self.trace.record(TraceEvent::ChannelExcluded { chan_id, reason });
    }
}

fn apply_exclusion<R: RouteSource>(routes: &mut R, exclusion: Exclusion, route: &Route) {
    match exclusion {
        Exclusion::Nothing => {}
        Exclusion::FirstHop(channel) => routes.exclude_first_hop(&channel, true),
        Exclusion::Edge {
            chan_id,
            from_pubkey,
            to_pubkey,
        } => routes.exclude_edge_between(chan_id, &from_pubkey, &to_pubkey, true),
        Exclusion::HighFeeHops => routes.exclude_high_fee_hops(route),
    }
}

/// Run one session against the node's own pathfinder.
pub async fn rebalance<C: NodeClient>(
    client: &C,
    config: RebalanceConfig,
    constants: FeeConstants,
) -> anyhow::Result<RebalanceOutcome> {
    let mut rebalancer = Rebalancer::new(client, config, constants);
    let request = rebalancer.prepare().await?;
    let mut routes = Routes::new(client, &request).await?;
    rebalancer.execute(&request, &mut routes).await
}

/// Resolve the command line against the node, rebalance, and record the
/// session.
pub async fn run<C: NodeClient>(
    config: &Config,
    client: &C,
    db: &Database,
    args: &RebalanceArgs,
) -> anyhow::Result<RebalanceOutcome> {
    let channels = client.list_channels().await?;
    let session = RebalanceConfig::from_args(config, args, &channels)?;
    let started_at = chrono::Utc::now().timestamp();

    let outcome = match rebalance(client, session.clone(), FeeConstants::from(&config.fees)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // Attempts made before the error are not known here.
            let record = SessionRecord {
                first_hop_chan_id: session.first_hop.as_ref().map(|c| c.chan_id),
                last_hop_chan_id: session.last_hop.as_ref().map(|c| c.chan_id),
                amount_sats: session.amount,
                success: false,
                attempts: 0,
                fee_paid_sats: 0,
                route: None,
                started_at,
                finished_at: chrono::Utc::now().timestamp(),
            };
            if let Err(db_err) = history::record(db, &record) {
                warn!("Failed to record aborted rebalance: {:#}", db_err);
            }
            return Err(e);
        }
    };

    let route = outcome.successful_route().map(|r| {
        r.channel_path()
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    });
    history::record(
        db,
        &SessionRecord {
            first_hop_chan_id: session.first_hop.as_ref().map(|c| c.chan_id),
            last_hop_chan_id: session.last_hop.as_ref().map(|c| c.chan_id),
            amount_sats: session.amount,
            success: outcome.success,
            attempts: outcome.attempts.len(),
            fee_paid_sats: outcome.fee_paid_sats,
            route,
            started_at,
            finished_at: chrono::Utc::now().timestamp(),
        },
    )?;
    Ok(outcome)
}
