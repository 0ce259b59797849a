use crate::db::Database;

/// One finished rebalance session as stored in `rebalances`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub first_hop_chan_id: Option<u64>,
    pub last_hop_chan_id: Option<u64>,
    pub amount_sats: i64,
    pub success: bool,
    pub attempts: usize,
    pub fee_paid_sats: i64,
    /// Channel path of the successful route, comma separated.
    pub route: Option<String>,
    pub started_at: i64,
    pub finished_at: i64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct HistorySummary {
    pub sessions: i64,
    pub successes: i64,
    pub amount_moved_sats: i64,
    pub fees_paid_sats: i64,
}

impl HistorySummary {
    /// Fees paid per million sat moved.
    pub fn effective_ppm(&self) -> f64 {
        if self.amount_moved_sats == 0 {
            return 0.0;
        }
        self.fees_paid_sats as f64 / self.amount_moved_sats as f64 * 1_000_000.0
    }
}

pub fn record(db: &Database, session: &SessionRecord) -> anyhow::Result<()> {
    db.conn().execute(
        "INSERT INTO rebalances \
         (first_hop_chan_id, last_hop_chan_id, amount_sats, success, attempts, \
          fee_paid_sats, route, started_at, finished_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            session.first_hop_chan_id.map(|id| id as i64),
            session.last_hop_chan_id.map(|id| id as i64),
            session.amount_sats,
            session.success,
            session.attempts as i64,
            session.fee_paid_sats,
            session.route,
            session.started_at,
            session.finished_at,
        ],
    )?;
    Ok(())
}

pub fn summary(db: &Database) -> anyhow::Result<HistorySummary> {
    let summary = db.conn().query_row(
        "SELECT COUNT(*), \
                COALESCE(SUM(success), 0), \
                COALESCE(SUM(CASE WHEN success = 1 THEN amount_sats ELSE 0 END), 0), \
                COALESCE(SUM(fee_paid_sats), 0) \
         FROM rebalances",
        [],
        |row| {
            Ok(HistorySummary {
                sessions: row.get(0)?,
                successes: row.get(1)?,
                amount_moved_sats: row.get(2)?,
                fees_paid_sats: row.get(3)?,
            })
        },
    )?;
    Ok(summary)
}

/// Most recent sessions, newest first.
pub fn recent(db: &Database, limit: usize) -> anyhow::Result<Vec<SessionRecord>> {
    let mut stmt = db.conn().prepare(
        "SELECT first_hop_chan_id, last_hop_chan_id, amount_sats, success, attempts, \
                fee_paid_sats, route, started_at, finished_at \
         FROM rebalances ORDER BY finished_at DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
        Ok(SessionRecord {
            first_hop_chan_id: row.get::<_, Option<i64>>(0)?.map(|id| id as u64),
            last_hop_chan_id: row.get::<_, Option<i64>>(1)?.map(|id| id as u64),
            amount_sats: row.get(2)?,
            success: row.get(3)?,
            attempts: row.get::<_, i64>(4)? as usize,
            fee_paid_sats: row.get(5)?,
            route: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
        })
    })?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?);
    }
    Ok(sessions)
}
