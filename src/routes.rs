use crate::client::NodeClient;
use crate::types::{Channel, IgnoredEdge, Invoice, Route, RouteQuery};
use log::{debug, info};
use std::collections::{HashSet, VecDeque};

/// Upper bound on pathfinding queries per session. Guarantees the session
/// ends even when failures teach the search nothing.
pub const MAX_ROUTE_QUERIES: usize = 60;

/// Lazy source of candidate routes whose search space shrinks as edges are
/// excluded. Exclusions only affect candidates generated afterwards.
#[async_trait::async_trait]
pub trait RouteSource: Send {
    async fn has_next(&mut self) -> anyhow::Result<bool>;
    fn next(&mut self) -> Option<Route>;
    /// Exclude the edge at which `failure_source_pubkey` failed along `route`.
    fn exclude_edge_on_route(&mut self, failure_source_pubkey: &str, route: &Route);
    fn exclude_edge_between(&mut self, chan_id: u64, from_pubkey: &str, to_pubkey: &str, show_message: bool);
    /// Never leave through `channel` again this session.
    fn exclude_first_hop(&mut self, channel: &Channel, show_message: bool);
    fn exclude_high_fee_hops(&mut self, route: &Route);
}

/// What the route engine is asked to find.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub invoice: Invoice,
    pub first_hop: Option<Channel>,
    pub last_hop: Option<Channel>,
    /// No candidate may charge more than this.
    pub fee_limit_msat: Option<i64>,
    /// Fee a single hop may charge when no fee limit applies.
    pub hop_fee_budget_msat: Option<f64>,
}

/// Route source backed by the node's own pathfinder.
pub struct Routes<'a, C: NodeClient> {
    client: &'a C,
    own_pubkey: String,
    amount_sat: i64,
    outgoing_chan_id: Option<u64>,
    last_hop_pubkey: Option<String>,
    fee_limit_msat: Option<i64>,
    hop_fee_budget_msat: Option<f64>,
    pending: VecDeque<Route>,
    returned: HashSet<Vec<u64>>,
    ignored_edges: Vec<IgnoredEdge>,
    queries: usize,
    exhausted: bool,
}

impl<'a, C: NodeClient> Routes<'a, C> {
    pub async fn new(client: &'a C, request: &RouteRequest) -> anyhow::Result<Self> {
        let own_pubkey = client.get_own_identity().await?;
        Ok(Self {
            client,
            own_pubkey,
            amount_sat: request.invoice.amount_sat,
            outgoing_chan_id: request.first_hop.as_ref().map(|c| c.chan_id),
            last_hop_pubkey: request.last_hop.as_ref().map(|c| c.remote_pubkey.clone()),
            fee_limit_msat: request.fee_limit_msat,
            hop_fee_budget_msat: request.hop_fee_budget_msat,
            pending: VecDeque::new(),
            returned: HashSet::new(),
            ignored_edges: Vec::new(),
            queries: 0,
            exhausted: false,
        })
    }

    pub fn ignored_edges(&self) -> &[IgnoredEdge] {
        &self.ignored_edges
    }

    fn query(&self) -> RouteQuery {
        RouteQuery {
            destination: self.own_pubkey.clone(),
            amount_sat: self.amount_sat,
            outgoing_chan_id: self.outgoing_chan_id,
            last_hop_pubkey: self.last_hop_pubkey.clone(),
            ignored_edges: self.ignored_edges.clone(),
            fee_limit_msat: self.fee_limit_msat,
        }
    }

    async fn request_routes(&mut self) -> anyhow::Result<()> {
        self.queries += 1;
        let routes = self.client.query_routes(&self.query()).await?;
        if routes.is_empty() {
            debug!("Routes: pathfinding found no further route");
            self.exhausted = true;
            return Ok(());
        }
        for route in routes {
            self.add_route(route);
        }
        Ok(())
    }

    fn add_route(&mut self, route: Route) {
        if route.hops.len() < 2 {
            debug!("Routes: dropping non-circular route of {} hops", route.hops.len());
            return;
        }
        let path = route.channel_path();
        if self.returned.contains(&path) || self.pending.iter().any(|r| r.channel_path() == path) {
            return;
        }
        if let Some(limit) = self.fee_limit_msat {
            if route.total_fees_msat > limit {
                debug!(
                    "Routes: dropping route with fee {} msat over limit {} msat",
                    route.total_fees_msat, limit
                );
                self.returned.insert(path);
                self.exclude_high_fee_hops(&route);
                return;
            }
        }
        self.pending.push_back(route);
    }

    fn hop_fee_threshold_msat(&self, route: &Route) -> Option<f64> {
        match self.fee_limit_msat {
            Some(limit) => Some(limit as f64 / route.hops_with_fees().max(1) as f64),
            None => self.hop_fee_budget_msat,
        }
    }
}

#[async_trait::async_trait]
impl<'a, C: NodeClient> RouteSource for Routes<'a, C> {
    async fn has_next(&mut self) -> anyhow::Result<bool> {
        while self.pending.is_empty() && !self.exhausted {
            if self.queries >= MAX_ROUTE_QUERIES {
                debug!("Routes: query budget of {} used up", MAX_ROUTE_QUERIES);
                self.exhausted = true;
                break;
            }
            self.request_routes().await?;
        }
        Ok(!self.pending.is_empty())
    }

    fn next(&mut self) -> Option<Route> {
        let route = self.pending.pop_front()?;
        self.returned.insert(route.channel_path());
        Some(route)
    }

    fn exclude_edge_on_route(&mut self, failure_source_pubkey: &str, route: &Route) {
        let Some(i) = route.hops.iter().position(|h| h.pub_key == failure_source_pubkey) else {
            debug!("Routes: failure source {} is not on the route", failure_source_pubkey);
            return;
        };
        if let Some(next) = route.hops.get(i + 1) {
            self.exclude_edge_between(next.chan_id, failure_source_pubkey, &next.pub_key, true);
        } else {
            // Final node: the edge entering it.
            let from = match i.checked_sub(1) {
                Some(prev) => route.hops[prev].pub_key.clone(),
                None => self.own_pubkey.clone(),
            };
            self.exclude_edge_between(route.hops[i].chan_id, &from, failure_source_pubkey, true);
        }
    }

    fn exclude_edge_between(&mut self, chan_id: u64, from_pubkey: &str, to_pubkey: &str, show_message: bool) {
        if show_message {
            info!(
                "Ignoring channel {} ({} -> {})",
                chan_id, from_pubkey, to_pubkey
            );
        } else {
            debug!(
                "Ignoring channel {} ({} -> {})",
                chan_id, from_pubkey, to_pubkey
            );
        }
        let edge = IgnoredEdge::between(chan_id, from_pubkey, to_pubkey);
        if !self.ignored_edges.contains(&edge) {
            self.ignored_edges.push(edge);
        }
    }

    fn exclude_first_hop(&mut self, channel: &Channel, show_message: bool) {
        let own = self.own_pubkey.clone();
        self.exclude_edge_between(channel.chan_id, &own, &channel.remote_pubkey, show_message);
    }

    fn exclude_high_fee_hops(&mut self, route: &Route) {
        // hops[i].fee_msat is charged for the edge hops[i] -> hops[i + 1].
        let charging = route.hops_with_fees();
        if charging == 0 {
            return;
        }
        let mut chosen: Vec<usize> = match self.hop_fee_threshold_msat(route) {
            Some(threshold) => (0..charging)
                .filter(|&i| route.hops[i].fee_msat as f64 > threshold)
                .collect(),
            None => Vec::new(),
        };
        if chosen.is_empty() {
            if let Some(i) = (0..charging).max_by_key(|&i| route.hops[i].fee_msat) {
                chosen.push(i);
            }
        }
        for i in chosen {
            let (from, to) = (&route.hops[i], &route.hops[i + 1]);
            self.exclude_edge_between(to.chan_id, &from.pub_key, &to.pub_key, true);
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted route source for testing
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::types::Hop;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Exclusion {
        EdgeOnRoute { pubkey: String, path: Vec<u64> },
        EdgeBetween { chan_id: u64, from: String, to: String, show_message: bool },
        FirstHop { chan_id: u64, show_message: bool },
        HighFeeHops { path: Vec<u64> },
    }

    /// Hands out a fixed list of candidates and records every exclusion.
    pub struct MockRoutes {
        pub candidates: VecDeque<Route>,
        pub exclusions: Vec<Exclusion>,
    }

    impl MockRoutes {
        pub fn new(candidates: Vec<Route>) -> Self {
            Self {
                candidates: candidates.into(),
                exclusions: Vec::new(),
            }
        }

        pub fn first_hop_exclusions(&self) -> Vec<u64> {
            self.exclusions
                .iter()
                .filter_map(|e| match e {
                    Exclusion::FirstHop { chan_id, .. } => Some(*chan_id),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl RouteSource for MockRoutes {
        async fn has_next(&mut self) -> anyhow::Result<bool> {
            Ok(!self.candidates.is_empty())
        }

        fn next(&mut self) -> Option<Route> {
            self.candidates.pop_front()
        }

        fn exclude_edge_on_route(&mut self, failure_source_pubkey: &str, route: &Route) {
            self.exclusions.push(Exclusion::EdgeOnRoute {
                pubkey: failure_source_pubkey.to_string(),
                path: route.channel_path(),
            });
        }

        fn exclude_edge_between(&mut self, chan_id: u64, from_pubkey: &str, to_pubkey: &str, show_message: bool) {
            self.exclusions.push(Exclusion::EdgeBetween {
                chan_id,
                from: from_pubkey.to_string(),
                to: to_pubkey.to_string(),
                show_message,
            });
        }

        fn exclude_first_hop(&mut self, channel: &Channel, show_message: bool) {
            self.exclusions.push(Exclusion::FirstHop {
                chan_id: channel.chan_id,
                show_message,
            });
        }

        fn exclude_high_fee_hops(&mut self, route: &Route) {
            self.exclusions.push(Exclusion::HighFeeHops {
                path: route.channel_path(),
            });
        }
    }

    /// Build a circular route delivering `amount` sat. Each hop is
    /// (channel, node reached, fee charged by that node in msat).
    pub fn route(amount: i64, hops: &[(u64, &str, i64)]) -> Route {
        let total_fees_msat: i64 = hops.iter().map(|h| h.2).sum();
        Route {
            hops: hops
                .iter()
                .map(|&(chan_id, pub_key, fee_msat)| Hop {
                    chan_id,
                    pub_key: pub_key.to_string(),
                    amt_to_forward: amount,
                    fee_msat,
                })
                .collect(),
            total_amt: amount + total_fees_msat / 1000,
            total_fees: total_fees_msat / 1000,
            total_fees_msat,
            wire: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::route;
    use super::*;
    use crate::client::mock::{MockNodeClient, OWN_ID};

    fn request(amount_sat: i64) -> RouteRequest {
        RouteRequest {
            invoice: Invoice {
                payment_request: "lnbcrt1".to_string(),
                r_hash: String::new(),
                payment_addr: String::new(),
                amount_sat,
            },
            first_hop: None,
            last_hop: None,
            fee_limit_msat: None,
            hop_fee_budget_msat: None,
        }
    }

    fn circular(a: u64, b: u64, c: u64) -> Route {
        route(
            100_000,
            &[(a, "02aa", 1000), (b, "02bb", 500), (c, OWN_ID, 0)],
        )
    }

    #[tokio::test]
    async fn test_empty_query_exhausts() {
        let client = MockNodeClient::new();
        let mut routes = Routes::new(&client, &request(100_000)).await.unwrap();
        assert!(!routes.has_next().await.unwrap());
        assert!(routes.next().is_none());
        assert_eq!(client.route_queries.lock().unwrap().len(), 1);
        // Exhaustion is sticky
        assert!(!routes.has_next().await.unwrap());
        assert_eq!(client.route_queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_routes_are_buffered_and_returned_once() {
        let client = MockNodeClient::new();
        client.push_routes(vec![circular(1, 2, 3), circular(4, 5, 6)]);
        let mut routes = Routes::new(&client, &request(100_000)).await.unwrap();

        assert!(routes.has_next().await.unwrap());
        assert_eq!(routes.next().unwrap().channel_path(), vec![1, 2, 3]);
        assert!(routes.has_next().await.unwrap());
        assert_eq!(routes.next().unwrap().channel_path(), vec![4, 5, 6]);
        // Only one query was needed for both
        assert_eq!(client.route_queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_already_returned_path_is_not_offered_again() {
        let client = MockNodeClient::new();
        client.push_routes(vec![circular(1, 2, 3)]);
        client.push_routes(vec![circular(1, 2, 3)]);
        client.push_routes(vec![circular(7, 8, 9)]);
        let mut routes = Routes::new(&client, &request(100_000)).await.unwrap();

        assert!(routes.has_next().await.unwrap());
        routes.next().unwrap();
        assert!(routes.has_next().await.unwrap());
        assert_eq!(routes.next().unwrap().channel_path(), vec![7, 8, 9]);
        assert_eq!(client.route_queries.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_query_budget_bounds_the_search() {
        let client = MockNodeClient::new();
        for _ in 0..(MAX_ROUTE_QUERIES + 10) {
            client.push_routes(vec![circular(1, 2, 3)]);
        }
        let mut routes = Routes::new(&client, &request(100_000)).await.unwrap();
        assert!(routes.has_next().await.unwrap());
        routes.next().unwrap();
        // The same path keeps coming back; the engine gives up at the bound.
        assert!(!routes.has_next().await.unwrap());
        assert_eq!(client.route_queries.lock().unwrap().len(), MAX_ROUTE_QUERIES);
    }

    #[tokio::test]
    async fn test_non_circular_routes_are_dropped() {
        let client = MockNodeClient::new();
        client.push_routes(vec![route(100_000, &[(1, OWN_ID, 0)])]);
        let mut routes = Routes::new(&client, &request(100_000)).await.unwrap();
        assert!(!routes.has_next().await.unwrap());
    }

    #[tokio::test]
    async fn test_query_carries_forced_hops_and_fee_limit() {
        let client = MockNodeClient::new();
        let mut req = request(50_000);
        req.first_hop = Some(Channel::new(11, "02first", Some(900_000), Some(100_000)));
        req.last_hop = Some(Channel::new(22, "02last", Some(100_000), Some(900_000)));
        req.fee_limit_msat = Some(25_000);
        let mut routes = Routes::new(&client, &req).await.unwrap();
        routes.has_next().await.unwrap();

        let queries = client.route_queries.lock().unwrap();
        assert_eq!(queries[0].destination, OWN_ID);
        assert_eq!(queries[0].amount_sat, 50_000);
        assert_eq!(queries[0].outgoing_chan_id, Some(11));
        assert_eq!(queries[0].last_hop_pubkey.as_deref(), Some("02last"));
        assert_eq!(queries[0].fee_limit_msat, Some(25_000));
    }

    #[tokio::test]
    async fn test_routes_over_fee_limit_are_never_offered() {
        let client = MockNodeClient::new();
        // 30 sat fee against a 25 sat limit
        client.push_routes(vec![route(
            50_000,
            &[(1, "02aa", 30_000), (2, OWN_ID, 0)],
        )]);
        let mut req = request(50_000);
        req.fee_limit_msat = Some(25_000);
        let mut routes = Routes::new(&client, &req).await.unwrap();

        assert!(!routes.has_next().await.unwrap());
        assert!(client.send_calls.lock().unwrap().is_empty());
        // The expensive edge is excluded from further searches
        assert_eq!(
            routes.ignored_edges(),
            &[IgnoredEdge::between(2, "02aa", OWN_ID)]
        );
    }

    #[tokio::test]
    async fn test_exclusions_reach_the_next_query() {
        let client = MockNodeClient::new();
        client.push_routes(vec![circular(1, 2, 3)]);
        let mut routes = Routes::new(&client, &request(100_000)).await.unwrap();
        assert!(routes.has_next().await.unwrap());
        let r = routes.next().unwrap();

        routes.exclude_edge_on_route("02aa", &r);
        assert!(!routes.has_next().await.unwrap());

        let queries = client.route_queries.lock().unwrap();
        assert_eq!(queries.len(), 2);
        assert!(queries[0].ignored_edges.is_empty());
        assert_eq!(
            queries[1].ignored_edges,
            vec![IgnoredEdge::between(2, "02aa", "02bb")]
        );
    }

    #[tokio::test]
    async fn test_exclude_edge_on_route_at_final_node() {
        let client = MockNodeClient::new();
        let mut routes = Routes::new(&client, &request(100_000)).await.unwrap();
        let r = circular(1, 2, 3);
        routes.exclude_edge_on_route(OWN_ID, &r);
        assert_eq!(
            routes.ignored_edges(),
            &[IgnoredEdge::between(3, "02bb", OWN_ID)]
        );
    }

    #[tokio::test]
    async fn test_exclude_edge_on_route_unknown_source() {
        let client = MockNodeClient::new();
        let mut routes = Routes::new(&client, &request(100_000)).await.unwrap();
        routes.exclude_edge_on_route("02zz", &circular(1, 2, 3));
        assert!(routes.ignored_edges().is_empty());
    }

    #[tokio::test]
    async fn test_exclude_first_hop_uses_own_identity() {
        let client = MockNodeClient::new();
        let mut routes = Routes::new(&client, &request(100_000)).await.unwrap();
        let channel = Channel::new(9, "03peer", Some(1), Some(1));
        routes.exclude_first_hop(&channel, false);
        routes.exclude_first_hop(&channel, true);
        assert_eq!(
            routes.ignored_edges(),
            &[IgnoredEdge::between(9, OWN_ID, "03peer")]
        );
    }

    #[tokio::test]
    async fn test_exclude_high_fee_hops_without_threshold_takes_most_expensive() {
        let client = MockNodeClient::new();
        let mut routes = Routes::new(&client, &request(100_000)).await.unwrap();
        routes.exclude_high_fee_hops(&circular(1, 2, 3));
        // hops[0] (02aa) charges most, for the edge 02aa -> 02bb on channel 2
        assert_eq!(
            routes.ignored_edges(),
            &[IgnoredEdge::between(2, "02aa", "02bb")]
        );
    }

    #[tokio::test]
    async fn test_exclude_high_fee_hops_over_budget() {
        let client = MockNodeClient::new();
        let mut req = request(100_000);
        req.hop_fee_budget_msat = Some(400.0);
        let mut routes = Routes::new(&client, &req).await.unwrap();
        routes.exclude_high_fee_hops(&circular(1, 2, 3));
        // Both charging hops exceed 400 msat
        assert_eq!(
            routes.ignored_edges(),
            &[
                IgnoredEdge::between(2, "02aa", "02bb"),
                IgnoredEdge::between(3, "02bb", OWN_ID),
            ]
        );
    }

    #[tokio::test]
    async fn test_exclude_high_fee_hops_shares_fee_limit() {
        let client = MockNodeClient::new();
        let mut req = request(100_000);
        // 1200 msat over two charging hops = 600 per hop
        req.fee_limit_msat = Some(1200);
        let mut routes = Routes::new(&client, &req).await.unwrap();
        routes.exclude_high_fee_hops(&circular(1, 2, 3));
        assert_eq!(
            routes.ignored_edges(),
            &[IgnoredEdge::between(2, "02aa", "02bb")]
        );
    }
}
