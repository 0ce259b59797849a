use anyhow::Context;
use base64::Engine as _;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tokio::time::sleep;

use crate::config::Config;
use crate::types::{Channel, ForwardingPolicy, Hop, Invoice, PaymentResult, Route, RouteQuery};

/// Trait abstracting the node operations a rebalance needs.
///
/// This enables mock-based testing of whole sessions without a live node.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync {
    async fn list_channels(&self) -> anyhow::Result<Vec<Channel>>;
    /// Our own forwarding policy on the given channel.
    async fn get_forwarding_policy(&self, channel_id: u64) -> anyhow::Result<ForwardingPolicy>;
    async fn get_own_identity(&self) -> anyhow::Result<String>;
    async fn resolve_alias(&self, pubkey: &str) -> anyhow::Result<String>;
    async fn generate_invoice(&self, memo: &str, amount_sat: i64) -> anyhow::Result<Invoice>;
    async fn send_payment(&self, invoice: &Invoice, route: &Route) -> anyhow::Result<PaymentResult>;
    /// Ask the node's pathfinder for candidate routes. Empty when no path exists.
    async fn query_routes(&self, query: &RouteQuery) -> anyhow::Result<Vec<Route>>;
}

/// Rate-limited, retrying client for LND's REST gateway.
pub struct LndRestClient {
    http: reqwest::Client,
    base_url: String,
    /// Semaphore for rate limiting (1 concurrent request)
    rate_limiter: Arc<Semaphore>,
    own_identity: OnceCell<String>,
    aliases: Mutex<HashMap<String, String>>,
}

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 1000;
const RATE_LIMIT_DELAY_MS: u64 = 25;
const REQUEST_TIMEOUT_SECS: u64 = 120;
const INVOICE_EXPIRY_SECS: u64 = 3600;

/// Failure code reported when the node gives no failure detail.
pub const UNKNOWN_FAILURE_CODE: u32 = 998;

/// LND failure enum names and their onion failure codes.
const FAILURE_CODES: &[(&str, u32)] = &[
    ("RESERVED", 0),
    ("INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS", 1),
    ("INCORRECT_PAYMENT_AMOUNT", 2),
    ("FINAL_INCORRECT_CLTV_EXPIRY", 3),
    ("FINAL_INCORRECT_HTLC_AMOUNT", 4),
    ("FINAL_EXPIRY_TOO_SOON", 5),
    ("INVALID_REALM", 6),
    ("EXPIRY_TOO_SOON", 7),
    ("INVALID_ONION_VERSION", 8),
    ("INVALID_ONION_HMAC", 9),
    ("INVALID_ONION_KEY", 10),
    ("AMOUNT_BELOW_MINIMUM", 11),
    ("FEE_INSUFFICIENT", 12),
    ("INCORRECT_CLTV_EXPIRY", 13),
    ("CHANNEL_DISABLED", 14),
    ("TEMPORARY_CHANNEL_FAILURE", 15),
    ("REQUIRED_NODE_FEATURE_MISSING", 16),
    ("REQUIRED_CHANNEL_FEATURE_MISSING", 17),
    ("UNKNOWN_NEXT_PEER", 18),
    ("TEMPORARY_NODE_FAILURE", 19),
    ("PERMANENT_NODE_FAILURE", 20),
    ("PERMANENT_CHANNEL_FAILURE", 21),
    ("EXPIRY_TOO_FAR", 22),
    ("MPP_TIMEOUT", 23),
    ("INVALID_ONION_PAYLOAD", 24),
    ("INTERNAL_FAILURE", 997),
    ("UNKNOWN_FAILURE", 998),
    ("UNREADABLE_FAILURE", 999),
];

impl LndRestClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read(&config.lnd.tls_cert_path).with_context(|| {
            format!(
                "Failed to read TLS cert at {}",
                config.lnd.tls_cert_path.display()
            )
        })?;
        let macaroon = std::fs::read(&config.lnd.macaroon_path).with_context(|| {
            format!(
                "Failed to read macaroon at {}",
                config.lnd.macaroon_path.display()
            )
        })?;

        let mut macaroon_header = HeaderValue::from_str(&hex::encode(macaroon))?;
        macaroon_header.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert("Grpc-Metadata-macaroon", macaroon_header);

        let http = reqwest::Client::builder()
            .add_root_certificate(
                reqwest::Certificate::from_pem(&cert_pem)
                    .context("TLS cert is not valid PEM")?,
            )
            .default_headers(headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create LND REST client")?;

        Ok(Self {
            http,
            base_url: config.lnd.rest_url.trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(Semaphore::new(1)),
            own_identity: OnceCell::new(),
            aliases: Mutex::new(HashMap::new()),
        })
    }

    async fn rate_limit(&self) -> anyhow::Result<()> {
        let _permit = self.rate_limiter.acquire().await
            .map_err(|_| anyhow::anyhow!("Rate limiter semaphore closed"))?;
        sleep(Duration::from_millis(RATE_LIMIT_DELAY_MS)).await;
        Ok(())
    }

    async fn with_retry<F, Fut, T>(&self, name: &str, f: F) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        for attempt in 0..MAX_RETRIES {
            self.rate_limit().await?;
            match f().await {
                Ok(resp) => {
                    debug!("{}: success", name);
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt < MAX_RETRIES - 1 {
                        let delay = RETRY_BASE_MS * 2u64.pow(attempt);
                        warn!(
                            "{}: attempt {} failed ({:#}), retrying in {}ms",
                            name,
                            attempt + 1,
                            e,
                            delay
                        );
                        sleep(Duration::from_millis(delay)).await;
                    } else {
                        return Err(anyhow::anyhow!(
                            "{}: all {} attempts failed: {:#}",
                            name,
                            MAX_RETRIES,
                            e
                        ));
                    }
                }
            }
        }
        unreachable!()
    }

    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, path))?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            anyhow::bail!("{} {} returned {}: {}", method, path, status, text.trim());
        }
        serde_json::from_str(&text).with_context(|| format!("Malformed response from {}", path))
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, name: &str, path: &str) -> anyhow::Result<T> {
        let value = self
            .with_retry(name, || self.call(Method::GET, path, None))
            .await?;
        serde_json::from_value(value).with_context(|| format!("{}: unexpected response shape", name))
    }
}

#[async_trait::async_trait]
impl NodeClient for LndRestClient {
    async fn list_channels(&self) -> anyhow::Result<Vec<Channel>> {
        let resp: WireChannels = self.get("ListChannels", "/v1/channels").await?;
        Ok(resp.channels.into_iter().map(WireChannel::into_channel).collect())
    }

    async fn get_forwarding_policy(&self, channel_id: u64) -> anyhow::Result<ForwardingPolicy> {
        let own = self.get_own_identity().await?;
        let edge: WireEdge = self
            .get("GetChanInfo", &format!("/v1/graph/edge/{}", channel_id))
            .await?;
        Ok(edge.own_policy(&own).unwrap_or_else(|| {
            debug!("No policy of ours on channel {}, assuming zero fees", channel_id);
            ForwardingPolicy::default()
        }))
    }

    async fn get_own_identity(&self) -> anyhow::Result<String> {
        self.own_identity
            .get_or_try_init(|| async move {
                let info: WireInfo = self.get("GetInfo", "/v1/getinfo").await?;
                Ok::<_, anyhow::Error>(info.identity_pubkey)
            })
            .await
            .cloned()
    }

    async fn resolve_alias(&self, pubkey: &str) -> anyhow::Result<String> {
        let cached = self.aliases.lock().unwrap().get(pubkey).cloned();
        if let Some(alias) = cached {
            return Ok(alias);
        }
        // Private peers are absent from the graph; their pubkey stands in.
        let alias = match self
            .get::<WireNodeInfo>("GetNodeInfo", &format!("/v1/graph/node/{}", pubkey))
            .await
        {
            Ok(info) if !info.node.alias.is_empty() => info.node.alias,
            Ok(_) => pubkey.to_string(),
            Err(e) => {
                debug!("Alias lookup for {} failed: {:#}", pubkey, e);
                pubkey.to_string()
            }
        };
        self.aliases
            .lock()
            .unwrap()
            .insert(pubkey.to_string(), alias.clone());
        Ok(alias)
    }

    async fn generate_invoice(&self, memo: &str, amount_sat: i64) -> anyhow::Result<Invoice> {
        let body = json!({
            "memo": memo,
            "value": amount_sat.to_string(),
            "expiry": INVOICE_EXPIRY_SECS.to_string(),
        });
        let value = self
            .with_retry("AddInvoice", || self.call(Method::POST, "/v1/invoices", Some(&body)))
            .await?;
        let resp: WireInvoice =
            serde_json::from_value(value).context("AddInvoice: unexpected response shape")?;
        Ok(Invoice {
            payment_request: resp.payment_request,
            r_hash: resp.r_hash,
            payment_addr: resp.payment_addr,
            amount_sat,
        })
    }

    async fn send_payment(&self, invoice: &Invoice, route: &Route) -> anyhow::Result<PaymentResult> {
        let body = json!({
            "payment_hash": invoice.r_hash,
            "route": route_to_wire(route, invoice)?,
        });
        // Never retried: a payment attempt is not idempotent.
        self.rate_limit().await?;
        let value = self
            .call(Method::POST, "/v2/router/route/send", Some(&body))
            .await?;
        let attempt: WireAttempt =
            serde_json::from_value(value).context("SendToRoute: unexpected response shape")?;
        Ok(attempt.into_result())
    }

    async fn query_routes(&self, query: &RouteQuery) -> anyhow::Result<Vec<Route>> {
        let path = format!("/v1/graph/routes/{}/{}", query.destination, query.amount_sat);
        let body = route_query_body(query)?;
        let (path, body) = (&path, &body);
        let value = self
            .with_retry("QueryRoutes", || async move {
                match self.call(Method::POST, path, Some(body)).await {
                    Ok(v) => Ok(Some(v)),
                    Err(e) if format!("{:#}", e).contains("unable to find a path") => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;
        let Some(value) = value else {
            return Ok(Vec::new());
        };
        let resp: WireRoutes =
            serde_json::from_value(value).context("QueryRoutes: unexpected response shape")?;
        resp.routes.into_iter().map(route_from_wire).collect()
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// The REST gateway encodes 64-bit integers as strings and omits zero values.
#[derive(Deserialize)]
#[serde(untagged)]
enum Num<T> {
    Int(T),
    Str(String),
}

fn de_opt_num<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: fmt::Display,
{
    match Option::<Num<T>>::deserialize(d)? {
        None => Ok(None),
        Some(Num::Int(v)) => Ok(Some(v)),
        Some(Num::Str(s)) if s.is_empty() => Ok(None),
        Some(Num::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

fn de_num<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr + Default,
    T::Err: fmt::Display,
{
    Ok(de_opt_num(d)?.unwrap_or_default())
}

#[derive(Deserialize)]
struct WireChannels {
    #[serde(default)]
    channels: Vec<WireChannel>,
}

#[derive(Deserialize)]
struct WireChannel {
    #[serde(deserialize_with = "de_num")]
    chan_id: u64,
    remote_pubkey: String,
    #[serde(default, deserialize_with = "de_opt_num")]
    local_balance: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_num")]
    remote_balance: Option<i64>,
}

impl WireChannel {
    fn into_channel(self) -> Channel {
        Channel::new(
            self.chan_id,
            self.remote_pubkey,
            self.local_balance,
            self.remote_balance,
        )
    }
}

#[derive(Deserialize)]
struct WirePolicy {
    #[serde(default, deserialize_with = "de_num")]
    fee_base_msat: i64,
    #[serde(default, deserialize_with = "de_num")]
    fee_rate_milli_msat: i64,
}

#[derive(Deserialize)]
struct WireEdge {
    node1_pub: String,
    node2_pub: String,
    #[serde(default)]
    node1_policy: Option<WirePolicy>,
    #[serde(default)]
    node2_policy: Option<WirePolicy>,
}

impl WireEdge {
    /// nodeX_policy governs payments leaving nodeX.
    fn own_policy(&self, own_pubkey: &str) -> Option<ForwardingPolicy> {
        let policy = if self.node1_pub == own_pubkey {
            self.node1_policy.as_ref()
        } else if self.node2_pub == own_pubkey {
            self.node2_policy.as_ref()
        } else {
            None
        };
        policy.map(|p| ForwardingPolicy {
            fee_base_msat: p.fee_base_msat,
            fee_rate_milli_msat: p.fee_rate_milli_msat,
        })
    }
}

#[derive(Deserialize)]
struct WireInfo {
    identity_pubkey: String,
}

#[derive(Deserialize)]
struct WireNodeInfo {
    node: WireNode,
}

#[derive(Deserialize)]
struct WireNode {
    #[serde(default)]
    alias: String,
}

#[derive(Deserialize)]
struct WireInvoice {
    r_hash: String,
    payment_request: String,
    #[serde(default)]
    payment_addr: String,
}

#[derive(Deserialize)]
struct WireRoutes {
    #[serde(default)]
    routes: Vec<Value>,
}

#[derive(Deserialize)]
struct WireRoute {
    #[serde(default, deserialize_with = "de_num")]
    total_amt: i64,
    #[serde(default, deserialize_with = "de_num")]
    total_fees: i64,
    #[serde(default, deserialize_with = "de_num")]
    total_fees_msat: i64,
    #[serde(default)]
    hops: Vec<WireHop>,
}

#[derive(Deserialize)]
struct WireHop {
    #[serde(deserialize_with = "de_num")]
    chan_id: u64,
    pub_key: String,
    #[serde(default, deserialize_with = "de_num")]
    amt_to_forward: i64,
    #[serde(default, deserialize_with = "de_num")]
    fee_msat: i64,
}

#[derive(Deserialize)]
struct WireAttempt {
    #[serde(default)]
    status: String,
    #[serde(default)]
    failure: Option<WireFailure>,
}

#[derive(Deserialize)]
struct WireFailure {
    #[serde(default)]
    code: Value,
    #[serde(default, deserialize_with = "de_num")]
    failure_source_index: u32,
}

impl WireAttempt {
    fn into_result(self) -> PaymentResult {
        if self.status == "SUCCEEDED" {
            return PaymentResult::success();
        }
        match self.failure {
            // A failed attempt must never read as success.
            Some(f) => match failure_code_from_wire(&f.code) {
                0 => PaymentResult::failure(UNKNOWN_FAILURE_CODE, f.failure_source_index as usize),
                code => PaymentResult::failure(code, f.failure_source_index as usize),
            },
            None => PaymentResult::failure(UNKNOWN_FAILURE_CODE, 0),
        }
    }
}

fn failure_code_from_wire(code: &Value) -> u32 {
    match code {
        Value::Number(n) => n
            .as_u64()
            .and_then(|c| u32::try_from(c).ok())
            .unwrap_or(UNKNOWN_FAILURE_CODE),
        Value::String(name) => FAILURE_CODES
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| *c)
            .or_else(|| name.parse().ok())
            .unwrap_or(UNKNOWN_FAILURE_CODE),
        _ => UNKNOWN_FAILURE_CODE,
    }
}

fn route_from_wire(wire: Value) -> anyhow::Result<Route> {
    let parsed: WireRoute =
        serde_json::from_value(wire.clone()).context("Malformed route from QueryRoutes")?;
    Ok(Route {
        hops: parsed
            .hops
            .into_iter()
            .map(|h| Hop {
                chan_id: h.chan_id,
                pub_key: h.pub_key,
                amt_to_forward: h.amt_to_forward,
                fee_msat: h.fee_msat,
            })
            .collect(),
        total_amt: parsed.total_amt,
        total_fees: parsed.total_fees,
        total_fees_msat: parsed.total_fees_msat,
        wire,
    })
}

/// The node's route with the invoice's MPP record attached to the final hop.
fn route_to_wire(route: &Route, invoice: &Invoice) -> anyhow::Result<Value> {
    let mut wire = route.wire.clone();
    let last_hop = wire
        .get_mut("hops")
        .and_then(Value::as_array_mut)
        .and_then(|hops| hops.last_mut())
        .and_then(Value::as_object_mut)
        .context("Route has no node encoding to send")?;
    last_hop.insert(
        "mpp_record".to_string(),
        json!({
            "payment_addr": invoice.payment_addr,
            "total_amt_msat": (invoice.amount_sat * 1000).to_string(),
        }),
    );
    Ok(wire)
}

fn route_query_body(query: &RouteQuery) -> anyhow::Result<Value> {
    let mut body = json!({
        "pub_key": query.destination,
        "amt": query.amount_sat.to_string(),
        "use_mission_control": true,
        "ignored_edges": query
            .ignored_edges
            .iter()
            .map(|e| json!({
                "channel_id": e.channel_id.to_string(),
                "direction_reverse": e.direction_reverse,
            }))
            .collect::<Vec<_>>(),
    });
    if let Some(chan_id) = query.outgoing_chan_id {
        body["outgoing_chan_id"] = json!(chan_id.to_string());
    }
    if let Some(pubkey) = &query.last_hop_pubkey {
        let raw = hex::decode(pubkey).with_context(|| format!("Invalid pubkey {}", pubkey))?;
        body["last_hop_pubkey"] = json!(base64::engine::general_purpose::STANDARD.encode(raw));
    }
    if let Some(fee_limit_msat) = query.fee_limit_msat {
        body["fee_limit"] = json!({ "fixed_msat": fee_limit_msat.to_string() });
    }
    Ok(body)
}

// ---------------------------------------------------------------------------
// Mock client for integration testing
// ---------------------------------------------------------------------------
