//! Fee economics of a rebalance.
//!
//! Amounts are whole satoshis, base fees millisatoshis and fee rates
//! millionths ("milli-msat" in LND terms). `compute_fee` yields satoshis.

use crate::config::FeesConfig;
use crate::types::ForwardingPolicy;

pub const DEFAULT_BASE_FEE_MSAT: f64 = 1000.0;
pub const DEFAULT_FEE_RATE: f64 = 0.001;
/// Fee rates above this are treated as this value in economic computations.
pub const MAX_FEE_RATE: i64 = 1000;

/// Constants of the reference cost model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeConstants {
    /// Base fee of a "typical" hop, msat.
    pub default_base_fee_msat: f64,
    /// Proportional fee of a "typical" hop, as a fraction of the amount.
    pub default_fee_rate: f64,
    pub max_fee_rate: i64,
}

impl Default for FeeConstants {
    fn default() -> Self {
        Self {
            default_base_fee_msat: DEFAULT_BASE_FEE_MSAT,
            default_fee_rate: DEFAULT_FEE_RATE,
            max_fee_rate: MAX_FEE_RATE,
        }
    }
}

impl From<&FeesConfig> for FeeConstants {
    fn from(config: &FeesConfig) -> Self {
        Self {
            default_base_fee_msat: config.default_base_fee_msat as f64,
            default_fee_rate: config.default_fee_rate,
            max_fee_rate: config.max_fee_rate,
        }
    }
}

/// How much a rebalance may cost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeeMode {
    /// Bounded by `max_fee_factor` times the reference cost of the route.
    Flat { max_fee_factor: f64 },
    /// Bounded by the future forwarding income the rebalance unlocks.
    Economic { econ_fee_factor: f64 },
}

impl FeeMode {
    /// Economic mode; an unset or zero factor means 1.0.
    pub fn economic(econ_fee_factor: Option<f64>) -> Self {
        let econ_fee_factor = match econ_fee_factor {
            Some(f) if f != 0.0 => f,
            _ => 1.0,
        };
        FeeMode::Economic { econ_fee_factor }
    }

    pub fn is_economic(&self) -> bool {
        matches!(self, FeeMode::Economic { .. })
    }
}

/// Fee (sat) for forwarding `amount` sat at `fee_rate` with the policy's base fee.
pub fn compute_fee(amount: i64, fee_rate_milli_msat: i64, policy: &ForwardingPolicy) -> f64 {
    amount as f64 / 1_000_000.0 * fee_rate_milli_msat as f64 + policy.fee_base_msat as f64 / 1000.0
}

/// A fee rate after applying the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CappedRate {
    pub rate: i64,
    pub original: i64,
}

impl CappedRate {
    pub fn was_capped(&self) -> bool {
        self.rate != self.original
    }
}

pub fn cap_fee_rate(rate: i64, max_fee_rate: i64) -> CappedRate {
    CappedRate {
        rate: rate.min(max_fee_rate),
        original: rate,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeLimit {
    pub limit_sat: f64,
    pub econ_fee_factor: f64,
    pub rate: CappedRate,
}

impl FeeLimit {
    pub fn limit_msat(&self) -> i64 {
        (self.limit_sat * 1000.0) as i64
    }
}

/// Upper bound on the fee of any attempt.
///
/// Only economic mode with a known (forced) last hop has one; in flat mode the
/// route validator decides per route.
pub fn fee_limit(
    mode: &FeeMode,
    amount: i64,
    last_hop_policy: Option<&ForwardingPolicy>,
    constants: &FeeConstants,
) -> Option<FeeLimit> {
    let (FeeMode::Economic { econ_fee_factor }, Some(policy)) = (mode, last_hop_policy) else {
        return None;
    };
    let rate = cap_fee_rate(policy.fee_rate_milli_msat, constants.max_fee_rate);
    Some(FeeLimit {
        limit_sat: econ_fee_factor * compute_fee(amount, rate.rate, policy),
        econ_fee_factor: *econ_fee_factor,
        rate,
    })
}

/// Flat-mode reference cost (msat) of a route with `hops_with_fees` charging hops.
pub fn flat_reference_cost_msat(hops_with_fees: usize, amount: i64, constants: &FeeConstants) -> f64 {
    hops_with_fees as f64
        * (constants.default_base_fee_msat + amount as f64 * constants.default_fee_rate)
}

/// Economic view of one candidate route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EconomicFees {
    /// What we would have earned forwarding the amount out of the first hop.
    pub missed_fee: f64,
    /// Expected future income from the refilled last hop, scaled by the factor.
    pub expected_fee: f64,
    /// What the route charges now (sat).
    pub rebalance_fee: f64,
    pub last_hop_rate: CappedRate,
}

impl EconomicFees {
    pub fn evaluate(
        amount: i64,
        route_fee_sat: i64,
        first_hop_policy: &ForwardingPolicy,
        last_hop_policy: &ForwardingPolicy,
        econ_fee_factor: f64,
        constants: &FeeConstants,
    ) -> Self {
        let missed_fee = compute_fee(amount, first_hop_policy.fee_rate_milli_msat, first_hop_policy);
        let last_hop_rate = cap_fee_rate(last_hop_policy.fee_rate_milli_msat, constants.max_fee_rate);
        let expected_fee = econ_fee_factor * compute_fee(amount, last_hop_rate.rate, last_hop_policy);
        Self {
            missed_fee,
            expected_fee,
            rebalance_fee: route_fee_sat as f64,
            last_hop_rate,
        }
    }

    pub fn difference(&self) -> f64 {
        self.rebalance_fee + self.missed_fee - self.expected_fee
    }

    pub fn too_high(&self) -> bool {
        self.rebalance_fee + self.missed_fee > self.expected_fee
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: i64, rate: i64) -> ForwardingPolicy {
        ForwardingPolicy {
            fee_base_msat: base,
            fee_rate_milli_msat: rate,
        }
    }

    #[test]
    fn test_compute_fee() {
        assert_eq!(compute_fee(50_000, 500, &policy(0, 500)), 25.0);
        assert_eq!(compute_fee(1_000_000, 100, &policy(1000, 100)), 101.0);
    }

    #[test]
    fn test_compute_fee_monotonic() {
        let p = policy(1000, 0);
        let mut last = f64::MIN;
        for amount in [0, 1, 10_000, 100_000, 5_000_000] {
            let fee = compute_fee(amount, 250, &p);
            assert!(fee >= last);
            last = fee;
        }
        let mut last = f64::MIN;
        for rate in [0, 1, 100, 1000, 50_000] {
            let fee = compute_fee(100_000, rate, &p);
            assert!(fee >= last);
            last = fee;
        }
    }

    #[test]
    fn test_cap_fee_rate() {
        let capped = cap_fee_rate(2500, MAX_FEE_RATE);
        assert_eq!(capped.rate, 1000);
        assert_eq!(capped.original, 2500);
        assert!(capped.was_capped());
        assert!(!cap_fee_rate(1000, MAX_FEE_RATE).was_capped());
    }

    #[test]
    fn test_economic_factor_defaults() {
        assert_eq!(FeeMode::economic(None), FeeMode::Economic { econ_fee_factor: 1.0 });
        assert_eq!(FeeMode::economic(Some(0.0)), FeeMode::Economic { econ_fee_factor: 1.0 });
        assert_eq!(FeeMode::economic(Some(0.5)), FeeMode::Economic { econ_fee_factor: 0.5 });
    }

    #[test]
    fn test_fee_limit_economic() {
        let limit = fee_limit(
            &FeeMode::economic(None),
            50_000,
            Some(&policy(0, 500)),
            &FeeConstants::default(),
        )
        .unwrap();
        assert_eq!(limit.limit_sat, 25.0);
        assert_eq!(limit.limit_msat(), 25_000);
        assert!(!limit.rate.was_capped());
    }

    #[test]
    fn test_fee_limit_uses_capped_rate() {
        let limit = fee_limit(
            &FeeMode::economic(Some(2.0)),
            1_000_000,
            Some(&policy(0, 5000)),
            &FeeConstants::default(),
        )
        .unwrap();
        assert_eq!(limit.limit_sat, 2000.0);
        assert_eq!(limit.rate.original, 5000);
    }

    #[test]
    fn test_no_fee_limit_in_flat_mode_or_without_last_hop() {
        let constants = FeeConstants::default();
        let flat = FeeMode::Flat { max_fee_factor: 10.0 };
        assert!(fee_limit(&flat, 50_000, Some(&policy(0, 500)), &constants).is_none());
        assert!(fee_limit(&FeeMode::economic(None), 50_000, None, &constants).is_none());
    }

    #[test]
    fn test_flat_reference_cost() {
        let cost = flat_reference_cost_msat(1, 100_000, &FeeConstants::default());
        assert!((cost - 1100.0).abs() < 1e-9);
        let cost = flat_reference_cost_msat(3, 100_000, &FeeConstants::default());
        assert!((cost - 3300.0).abs() < 1e-9);
    }

    #[test]
    fn test_economic_fees() {
        let constants = FeeConstants::default();
        // Earn 10 sat/100k out, 50 sat/100k in.
        let fees = EconomicFees::evaluate(
            100_000,
            30,
            &policy(0, 100),
            &policy(0, 500),
            1.0,
            &constants,
        );
        assert_eq!(fees.missed_fee, 10.0);
        assert_eq!(fees.expected_fee, 50.0);
        assert!(!fees.too_high());

        let fees = EconomicFees::evaluate(
            100_000,
            45,
            &policy(0, 100),
            &policy(0, 500),
            1.0,
            &constants,
        );
        assert!(fees.too_high());
        assert_eq!(fees.difference(), 5.0);
    }

    #[test]
    fn test_economic_fees_cap_last_hop_only() {
        let constants = FeeConstants::default();
        let fees = EconomicFees::evaluate(
            1_000_000,
            0,
            &policy(0, 3000),
            &policy(0, 3000),
            1.0,
            &constants,
        );
        assert_eq!(fees.missed_fee, 3000.0);
        assert_eq!(fees.expected_fee, 1000.0);
        assert!(fees.last_hop_rate.was_capped());
        assert!(fees.too_high());
    }
}
