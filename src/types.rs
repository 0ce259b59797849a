use std::fmt;

/// Snapshot of one of our channels as reported by the node.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub chan_id: u64,
    pub remote_pubkey: String,
    pub local_balance: i64,
    pub remote_balance: i64,
}

impl Channel {
    /// Build a channel from node data. Unreported balances count as zero.
    pub fn new(
        chan_id: u64,
        remote_pubkey: impl Into<String>,
        local_balance: Option<i64>,
        remote_balance: Option<i64>,
    ) -> Self {
        Self {
            chan_id,
            remote_pubkey: remote_pubkey.into(),
            local_balance: local_balance.unwrap_or(0).max(0),
            remote_balance: remote_balance.unwrap_or(0).max(0),
        }
    }

    pub fn capacity(&self) -> i64 {
        self.local_balance + self.remote_balance
    }

    /// Current local ratio. NaN for a channel without any balance.
    pub fn ratio(&self) -> f64 {
        local_ratio(self.local_balance, self.remote_balance)
    }

    /// Local ratio after `amount` leaves through this channel.
    pub fn ratio_after_sending(&self, amount: i64) -> f64 {
        local_ratio(self.local_balance - amount, self.remote_balance + amount)
    }

    /// Local ratio after `amount` arrives through this channel.
    pub fn ratio_after_receiving(&self, amount: i64) -> f64 {
        local_ratio(self.local_balance + amount, self.remote_balance - amount)
    }
}

fn local_ratio(local: i64, remote: i64) -> f64 {
    local as f64 / (local + remote) as f64
}

/// Our own advertised forwarding policy on a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ForwardingPolicy {
    pub fee_base_msat: i64,
    pub fee_rate_milli_msat: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub chan_id: u64,
    /// Node reached through `chan_id`.
    pub pub_key: String,
    /// Amount (sat) this hop's node forwards onwards.
    pub amt_to_forward: i64,
    /// Fee this hop's node charges for forwarding to the next hop.
    pub fee_msat: i64,
}

/// A circular route from our node back to itself.
///
/// The last hop's `pub_key` is our own identity; `hops[len - 2]` is the final
/// intermediary.
#[derive(Debug, Clone)]
pub struct Route {
    pub hops: Vec<Hop>,
    /// Amount leaving our node, fees included (sat).
    pub total_amt: i64,
    pub total_fees: i64,
    pub total_fees_msat: i64,
    /// The node's own encoding of the route, handed back verbatim on send.
    pub wire: serde_json::Value,
}

impl Route {
    pub fn first_hop(&self) -> Option<&Hop> {
        self.hops.first()
    }

    pub fn last_hop(&self) -> Option<&Hop> {
        self.hops.last()
    }

    pub fn hop_before_last(&self) -> Option<&Hop> {
        self.hops.len().checked_sub(2).and_then(|i| self.hops.get(i))
    }

    /// Channel ids in route order; two routes over the same path are the same
    /// candidate.
    pub fn channel_path(&self) -> Vec<u64> {
        self.hops.iter().map(|h| h.chan_id).collect()
    }

    pub fn hops_with_fees(&self) -> usize {
        self.hops.len().saturating_sub(1)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hop in &self.hops {
            writeln!(
                f,
                "  {:>18} | {:>10} sat | {:>8} msat fee | {}",
                hop.chan_id, hop.amt_to_forward, hop.fee_msat, hop.pub_key
            )?;
        }
        write!(
            f,
            "  total {} sat, fees {} msat",
            self.total_amt, self.total_fees_msat
        )
    }
}

/// A self-addressed invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    pub payment_request: String,
    /// Payment hash, base64 as returned by the node.
    pub r_hash: String,
    /// Payment address, base64 as returned by the node.
    pub payment_addr: String,
    pub amount_sat: i64,
}

/// Outcome of a single payment attempt along a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentResult {
    /// 0 on success, otherwise the onion failure code.
    pub failure_code: u32,
    /// Position of the reporting node along the route; 0 is the final node.
    pub failure_source_index: usize,
}

impl PaymentResult {
    pub fn success() -> Self {
        Self {
            failure_code: 0,
            failure_source_index: 0,
        }
    }

    pub fn failure(failure_code: u32, failure_source_index: usize) -> Self {
        Self {
            failure_code,
            failure_source_index,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure_code == 0
    }
}

/// A directed channel the route search must avoid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IgnoredEdge {
    pub channel_id: u64,
    /// True when the edge runs from the lexicographically greater pubkey.
    pub direction_reverse: bool,
}

impl IgnoredEdge {
    pub fn between(channel_id: u64, from_pubkey: &str, to_pubkey: &str) -> Self {
        Self {
            channel_id,
            direction_reverse: from_pubkey > to_pubkey,
        }
    }
}

/// Parameters for one route query against the node's pathfinder.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteQuery {
    pub destination: String,
    pub amount_sat: i64,
    pub outgoing_chan_id: Option<u64>,
    pub last_hop_pubkey: Option<String>,
    pub ignored_edges: Vec<IgnoredEdge>,
    pub fee_limit_msat: Option<i64>,
}
