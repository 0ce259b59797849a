use crate::types::Channel;

/// Largest amount a single non-wumbo HTLC can carry (sat).
pub const MAX_SATOSHIS_PER_TRANSACTION: i64 = 4_294_967;

const PUBKEY_HEX_LEN: usize = 66;

/// Find a channel by numeric id, or the first channel with a peer given by
/// its hex pubkey.
pub fn resolve_channel(channels: &[Channel], selector: &str) -> anyhow::Result<Channel> {
    let found = if selector.len() == PUBKEY_HEX_LEN && selector.chars().all(|c| c.is_ascii_hexdigit()) {
        channels.iter().find(|c| c.remote_pubkey == selector)
    } else {
        let chan_id: u64 = selector
            .parse()
            .map_err(|_| anyhow::anyhow!("'{}' is neither a channel id nor a node pubkey", selector))?;
        channels.iter().find(|c| c.chan_id == chan_id)
    };
    found
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("No channel found for '{}'", selector))
}

/// Amount that moves `channel` to `ratio` when funds arrive through it.
pub fn amount_to_receive(channel: &Channel, ratio: f64) -> i64 {
    (channel.capacity() as f64 * ratio) as i64 - channel.local_balance
}

/// Amount that moves `channel` to `ratio` when funds leave through it.
pub fn amount_to_send(channel: &Channel, ratio: f64) -> i64 {
    channel.local_balance - (channel.capacity() as f64 * ratio) as i64
}

/// Amount to rebalance. An explicit amount wins; otherwise the amount that
/// brings the given channel(s) to `ratio`, the smaller one if both are set.
pub fn plan_amount(
    first_hop: Option<&Channel>,
    last_hop: Option<&Channel>,
    ratio: f64,
    explicit: Option<i64>,
) -> anyhow::Result<i64> {
    let amount = match explicit {
        Some(amount) => amount,
        None => {
            let to_receive = last_hop.map(|c| amount_to_receive(c, ratio));
            let to_send = first_hop.map(|c| amount_to_send(c, ratio));
            match (to_send, to_receive) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => anyhow::bail!("Need a channel to send from or to"),
            }
        }
    };
    if amount <= 0 {
        anyhow::bail!("Nothing to rebalance: amount would be {} sat", amount);
    }
    Ok(amount.min(MAX_SATOSHIS_PER_TRANSACTION))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "03bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn channels() -> Vec<Channel> {
        vec![
            Channel::new(100, "02aa", Some(800_000), Some(200_000)),
            Channel::new(200, PEER, Some(100_000), Some(900_000)),
        ]
    }

    #[test]
    fn test_resolve_by_id() {
        let ch = resolve_channel(&channels(), "100").unwrap();
        assert_eq!(ch.remote_pubkey, "02aa");
    }

    #[test]
    fn test_resolve_by_pubkey() {
        assert_eq!(PEER.len(), 66);
        let ch = resolve_channel(&channels(), PEER).unwrap();
        assert_eq!(ch.chan_id, 200);
    }

    #[test]
    fn test_resolve_unknown() {
        assert!(resolve_channel(&channels(), "300").is_err());
        assert!(resolve_channel(&channels(), "not-a-channel").is_err());
    }

    #[test]
    fn test_amount_for_last_hop() {
        let chans = channels();
        // 1M capacity, 100k local, target 50% -> 400k
        assert_eq!(plan_amount(None, Some(&chans[1]), 0.5, None).unwrap(), 400_000);
    }

    #[test]
    fn test_amount_for_first_hop() {
        let chans = channels();
        assert_eq!(plan_amount(Some(&chans[0]), None, 0.5, None).unwrap(), 300_000);
    }

    #[test]
    fn test_amount_with_both_hops_takes_smaller() {
        let chans = channels();
        assert_eq!(
            plan_amount(Some(&chans[0]), Some(&chans[1]), 0.5, None).unwrap(),
            300_000
        );
    }

    #[test]
    fn test_explicit_amount_wins() {
        let chans = channels();
        assert_eq!(plan_amount(None, Some(&chans[1]), 0.5, Some(12_345)).unwrap(), 12_345);
    }

    #[test]
    fn test_balanced_channel_is_an_error() {
        let balanced = Channel::new(1, "02aa", Some(500_000), Some(500_000));
        let err = plan_amount(None, Some(&balanced), 0.5, None).unwrap_err();
        assert!(err.to_string().contains("Nothing to rebalance"));
    }

    #[test]
    fn test_amount_is_capped() {
        let big = Channel::new(1, "02aa", Some(0), Some(16_000_000));
        assert_eq!(
            plan_amount(None, Some(&big), 0.5, None).unwrap(),
            MAX_SATOSHIS_PER_TRANSACTION
        );
    }
}
