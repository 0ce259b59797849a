use crate::client::NodeClient;
use crate::rebalancer::amount::{amount_to_receive, amount_to_send};
use crate::types::Channel;
use log::debug;

/// What a channel can do for a rebalance at a given target ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Above target: can be drained with `--from`.
    Source,
    /// Below target: can be filled with `--to`.
    Target,
    Balanced,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub channel: Channel,
    pub alias: String,
    pub ratio: f64,
    pub role: Role,
    /// Amount (sat) that brings the channel to the target ratio.
    pub amount: i64,
}

/// Snapshot of our node taken at the start of a command.
pub struct NodeState {
    pub own_identity: String,
    pub channels: Vec<Channel>,
}

impl NodeState {
    pub async fn collect(client: &impl NodeClient) -> anyhow::Result<Self> {
        let own_identity = client.get_own_identity().await?;
        let channels = client.list_channels().await?;
        debug!(
            "Collected state: {} channels, {} sat local, {} sat remote",
            channels.len(),
            channels.iter().map(|c| c.local_balance).sum::<i64>(),
            channels.iter().map(|c| c.remote_balance).sum::<i64>(),
        );
        Ok(Self {
            own_identity,
            channels,
        })
    }

    pub fn total_capacity_sats(&self) -> i64 {
        self.channels.iter().map(|c| c.capacity()).sum()
    }

    /// Every channel with its role, most unbalanced first.
    pub async fn candidates(&self, client: &impl NodeClient, ratio: f64) -> anyhow::Result<Vec<Candidate>> {
        let mut candidates = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let alias = client.resolve_alias(&channel.remote_pubkey).await?;
            let current = channel.ratio();
            let (role, amount) = if current > ratio {
                (Role::Source, amount_to_send(channel, ratio))
            } else if current < ratio {
                (Role::Target, amount_to_receive(channel, ratio))
            } else {
                (Role::Balanced, 0)
            };
            candidates.push(Candidate {
                channel: channel.clone(),
                alias,
                ratio: current,
                role,
                amount,
            });
        }
        candidates.sort_by(|a, b| b.amount.cmp(&a.amount));
        Ok(candidates)
    }
}
