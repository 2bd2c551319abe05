use anyhow::Result;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::warn;

pub mod models;
use models::*;

/// Bounded retry for writes: the store is treated as eventually consistent
/// and a transiently locked database is not an error worth losing a trade
/// record over.
const WRITE_ATTEMPTS: u32 = 3;

/// Thread-safe SQLite handle (single connection behind a mutex).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at the given path. `:memory:` works
    /// for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent).
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn write_with_retry<F>(&self, what: &str, mut op: F)
    where
        F: FnMut(&Connection) -> rusqlite::Result<usize>,
    {
        for attempt in 1..=WRITE_ATTEMPTS {
            let result = {
                let conn = self.conn.lock().unwrap();
                op(&conn)
            };
            match result {
                Ok(_) => return,
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    warn!("db write '{}' attempt {} failed: {}", what, attempt, e);
                    std::thread::sleep(std::time::Duration::from_millis(50 * attempt as u64));
                }
                Err(e) => {
                    warn!("db write '{}' failed {} times, giving up: {}", what, WRITE_ATTEMPTS, e);
                }
            }
        }
    }

    // ── Trade records ────────────────────────────────────────────────────────

    /// Insert or replace a trade record.
    pub fn save_trade(&self, t: &TradeRecord) {
        self.write_with_retry("trade", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO trade_records (
                    signal_id, event, sport, leg1_source, leg2_source,
                    leg1_outcome, leg2_outcome, leg1_price, leg2_price,
                    stake1, stake2, profit_pct, status, clv_leg1, clv_leg2,
                    realized_profit, settled_at, created_at, commence_time
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
                params![
                    t.signal_id,
                    t.event,
                    t.sport,
                    t.leg1_source,
                    t.leg2_source,
                    t.leg1_outcome,
                    t.leg2_outcome,
                    t.leg1_price.to_string(),
                    t.leg2_price.to_string(),
                    t.stake1,
                    t.stake2,
                    t.profit_pct.to_string(),
                    t.status.as_str(),
                    t.clv_leg1,
                    t.clv_leg2,
                    t.realized_profit,
                    t.settled_at,
                    t.created_at,
                    t.commence_time,
                ],
            )
        });
    }

    /// Load the most recent trade records (newest last, ready to append to
    /// the in-memory list).
    pub fn load_trades(&self, limit: i64) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT signal_id, event, sport, leg1_source, leg2_source,
                    leg1_outcome, leg2_outcome, leg1_price, leg2_price,
                    stake1, stake2, profit_pct, status, clv_leg1, clv_leg2,
                    realized_profit, settled_at, created_at, commence_time
             FROM trade_records ORDER BY created_at DESC LIMIT ?1",
        )?;
        let mut trades = stmt
            .query_map(params![limit], map_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        trades.reverse();
        Ok(trades)
    }

    // ── Opportunity log ──────────────────────────────────────────────────────

    pub fn save_opportunity(&self, row: &OpportunityRow) {
        self.write_with_retry("opportunity", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO opportunity_log (
                    id, event, sport, profit_pct,
                    leg1_source, leg1_price, leg2_source, leg2_price,
                    stake1, stake2, created_at, status
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    row.id,
                    row.event,
                    row.sport,
                    row.profit_pct.to_string(),
                    row.leg1_source,
                    row.leg1_price.to_string(),
                    row.leg2_source,
                    row.leg2_price.to_string(),
                    row.stake1,
                    row.stake2,
                    row.created_at,
                    row.status,
                ],
            )
        });
    }

    pub fn update_opportunity_status(&self, id: &str, status: &str) {
        let id = id.to_string();
        let status = status.to_string();
        self.write_with_retry("opportunity status", move |conn| {
            conn.execute(
                "UPDATE opportunity_log SET status=?1 WHERE id=?2",
                params![status, id],
            )
        });
    }

    pub fn load_opportunities(&self, limit: i64) -> Result<Vec<OpportunityRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, event, sport, profit_pct,
                    leg1_source, leg1_price, leg2_source, leg2_price,
                    stake1, stake2, created_at, status
             FROM opportunity_log ORDER BY created_at DESC LIMIT ?1",
        )?;
        let mut rows = stmt
            .query_map(params![limit], map_opportunity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    // ── Line movements ───────────────────────────────────────────────────────

    pub fn save_line_movement(&self, lm: &LineMovement) {
        self.write_with_retry("line movement", |conn| {
            conn.execute(
                "INSERT INTO line_movements (
                    event, sport, source, outcome, price_before, price_after,
                    pct_change, direction, is_steam, is_rlm, ts
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                params![
                    lm.event,
                    lm.sport,
                    lm.source,
                    lm.outcome,
                    lm.price_before.to_string(),
                    lm.price_after.to_string(),
                    lm.pct_change.to_string(),
                    lm.direction.as_str(),
                    lm.is_steam,
                    lm.is_rlm,
                    lm.ts,
                ],
            )
        });
    }

    pub fn load_line_movements(&self, limit: i64) -> Result<Vec<LineMovement>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event, sport, source, outcome, price_before, price_after,
                    pct_change, direction, is_steam, is_rlm, ts
             FROM line_movements ORDER BY ts DESC LIMIT ?1",
        )?;
        let mut rows = stmt
            .query_map(params![limit], map_line_movement)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    // ── Key-value state ──────────────────────────────────────────────────────

    pub fn save_state(&self, key: &str, value: &str) {
        let key = key.to_string();
        let value = value.to_string();
        self.write_with_retry("state", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO bot_state (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
        });
    }

    pub fn load_state(&self, key: &str, default: &str) -> String {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM bot_state WHERE key=?1",
            params![key],
            |row| row.get(0),
        )
        .unwrap_or_else(|_| default.to_string())
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn get_decimal(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Ok(Decimal::from_str(&s).unwrap_or_default())
}

fn map_trade(row: &rusqlite::Row) -> rusqlite::Result<TradeRecord> {
    let status: String = row.get(12)?;
    Ok(TradeRecord {
        signal_id: row.get(0)?,
        event: row.get(1)?,
        sport: row.get(2)?,
        leg1_source: row.get(3)?,
        leg2_source: row.get(4)?,
        leg1_outcome: row.get(5)?,
        leg2_outcome: row.get(6)?,
        leg1_price: get_decimal(row, 7)?,
        leg2_price: get_decimal(row, 8)?,
        stake1: row.get(9)?,
        stake2: row.get(10)?,
        profit_pct: get_decimal(row, 11)?,
        status: TradeStatus::parse(&status).unwrap_or(TradeStatus::Rejected),
        clv_leg1: row.get(13)?,
        clv_leg2: row.get(14)?,
        realized_profit: row.get(15)?,
        settled_at: row.get(16)?,
        created_at: row.get(17)?,
        commence_time: row.get(18)?,
    })
}

fn map_opportunity(row: &rusqlite::Row) -> rusqlite::Result<OpportunityRow> {
    Ok(OpportunityRow {
        id: row.get(0)?,
        event: row.get(1)?,
        sport: row.get(2)?,
        profit_pct: get_decimal(row, 3)?,
        leg1_source: row.get(4)?,
        leg1_price: get_decimal(row, 5)?,
        leg2_source: row.get(6)?,
        leg2_price: get_decimal(row, 7)?,
        stake1: row.get(8)?,
        stake2: row.get(9)?,
        created_at: row.get(10)?,
        status: row.get(11)?,
    })
}

fn map_line_movement(row: &rusqlite::Row) -> rusqlite::Result<LineMovement> {
    let direction: String = row.get(7)?;
    Ok(LineMovement {
        event: row.get(0)?,
        sport: row.get(1)?,
        source: row.get(2)?,
        outcome: row.get(3)?,
        price_before: get_decimal(row, 4)?,
        price_after: get_decimal(row, 5)?,
        pct_change: get_decimal(row, 6)?,
        direction: if direction == "up" {
            MoveDirection::Up
        } else {
            MoveDirection::Down
        },
        is_steam: row.get(8)?,
        is_rlm: row.get(9)?,
        ts: row.get(10)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trade_records (
    signal_id       TEXT    PRIMARY KEY,
    event           TEXT    NOT NULL,
    sport           TEXT    NOT NULL,
    leg1_source     TEXT    NOT NULL,
    leg2_source     TEXT    NOT NULL,
    leg1_outcome    TEXT    NOT NULL DEFAULT '',
    leg2_outcome    TEXT    NOT NULL DEFAULT '',
    leg1_price      TEXT    NOT NULL,
    leg2_price      TEXT    NOT NULL,
    stake1          INTEGER NOT NULL,
    stake2          INTEGER NOT NULL,
    profit_pct      TEXT    NOT NULL,
    status          TEXT    NOT NULL,
    clv_leg1        REAL,
    clv_leg2        REAL,
    realized_profit INTEGER,
    settled_at      TEXT,
    created_at      TEXT    NOT NULL,
    commence_time   TEXT
);

CREATE TABLE IF NOT EXISTS opportunity_log (
    id          TEXT    PRIMARY KEY,
    event       TEXT    NOT NULL,
    sport       TEXT    NOT NULL,
    profit_pct  TEXT    NOT NULL,
    leg1_source TEXT    NOT NULL,
    leg1_price  TEXT    NOT NULL,
    leg2_source TEXT    NOT NULL,
    leg2_price  TEXT    NOT NULL,
    stake1      INTEGER NOT NULL,
    stake2      INTEGER NOT NULL,
    created_at  TEXT    NOT NULL,
    status      TEXT    NOT NULL DEFAULT 'pending'
);

CREATE TABLE IF NOT EXISTS line_movements (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    event        TEXT    NOT NULL,
    sport        TEXT    NOT NULL,
    source       TEXT    NOT NULL,
    outcome      TEXT    NOT NULL,
    price_before TEXT    NOT NULL,
    price_after  TEXT    NOT NULL,
    pct_change   TEXT    NOT NULL,
    direction    TEXT    NOT NULL,
    is_steam     INTEGER NOT NULL,
    is_rlm       INTEGER NOT NULL,
    ts           TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS bot_state (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_status ON trade_records(status);
CREATE INDEX IF NOT EXISTS idx_trades_created ON trade_records(created_at);
CREATE INDEX IF NOT EXISTS idx_moves_ts ON line_movements(ts);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn test_db() -> Database {
        Database::open(":memory:").unwrap()
    }

    fn trade(id: &str) -> TradeRecord {
        TradeRecord {
            signal_id: id.to_string(),
            event: "Arsenal vs Chelsea".to_string(),
            sport: "soccer_epl".to_string(),
            leg1_source: "pinnacle".to_string(),
            leg2_source: "polymarket".to_string(),
            leg1_outcome: "Arsenal".to_string(),
            leg2_outcome: "Chelsea".to_string(),
            leg1_price: dec!(2.10),
            leg2_price: dec!(2.15),
            stake1: 10000,
            stake2: 10500,
            profit_pct: dec!(0.0625),
            status: TradeStatus::Confirmed,
            clv_leg1: None,
            clv_leg2: None,
            realized_profit: None,
            settled_at: None,
            created_at: Utc::now(),
            commence_time: Some(Utc::now() + Duration::hours(2)),
        }
    }

    #[test]
    fn test_trade_round_trip() {
        let db = test_db();
        db.save_trade(&trade("t1"));
        let loaded = db.load_trades(10).unwrap();
        assert_eq!(loaded.len(), 1);
        let t = &loaded[0];
        assert_eq!(t.signal_id, "t1");
        assert_eq!(t.leg1_price, dec!(2.10));
        assert_eq!(t.profit_pct, dec!(0.0625));
        assert_eq!(t.status, TradeStatus::Confirmed);
        assert!(t.commence_time.is_some());
    }

    #[test]
    fn test_trade_settlement_update_replaces_row() {
        let db = test_db();
        let mut t = trade("t1");
        db.save_trade(&t);
        t.realized_profit = Some(912);
        t.settled_at = Some(Utc::now());
        db.save_trade(&t);
        let loaded = db.load_trades(10).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].realized_profit, Some(912));
        assert!(loaded[0].settled_at.is_some());
    }

    #[test]
    fn test_opportunity_status_update() {
        let db = test_db();
        db.save_opportunity(&OpportunityRow {
            id: "o1".to_string(),
            event: "Arsenal vs Chelsea".to_string(),
            sport: "soccer_epl".to_string(),
            profit_pct: dec!(0.03),
            leg1_source: "Pinnacle".to_string(),
            leg1_price: dec!(2.10),
            leg2_source: "Polymarket".to_string(),
            leg2_price: dec!(2.15),
            stake1: 10000,
            stake2: 10500,
            created_at: Utc::now(),
            status: "pending".to_string(),
        });
        db.update_opportunity_status("o1", "confirmed");
        let rows = db.load_opportunities(10).unwrap();
        assert_eq!(rows[0].status, "confirmed");
    }

    #[test]
    fn test_line_movement_round_trip() {
        let db = test_db();
        db.save_line_movement(&LineMovement {
            event: "Arsenal vs Chelsea".to_string(),
            sport: "soccer_epl".to_string(),
            source: "Pinnacle".to_string(),
            outcome: "Arsenal".to_string(),
            price_before: dec!(2.00),
            price_after: dec!(1.88),
            pct_change: dec!(-0.06),
            direction: MoveDirection::Down,
            is_steam: true,
            is_rlm: true,
            ts: Utc::now(),
        });
        let rows = db.load_line_movements(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].direction, MoveDirection::Down);
        assert!(rows[0].is_rlm);
        assert_eq!(rows[0].pct_change, dec!(-0.06));
    }

    #[test]
    fn test_state_round_trip_and_default() {
        let db = test_db();
        assert_eq!(db.load_state("scan_count", "0"), "0");
        db.save_state("scan_count", "42");
        assert_eq!(db.load_state("scan_count", "0"), "42");
    }
}
