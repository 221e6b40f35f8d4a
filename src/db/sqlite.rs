use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info, warn};

use super::{empty_level_counts, RiskStore};
use crate::error::{AppError, Result};
use crate::types::{now_ns, Bid, Flag, RiskLevel, RiskScore, TenderRecord};

/// SQLite caps bound parameters per statement.
const IN_CHUNK: usize = 500;

const TENDER_COLUMNS: &str = "id, title, procuring_entity, winner, cpv_code, procedure_type, status, \
     num_bidders, estimated_value, awarded_value, amended_value, amendment_count, complaint_count, \
     num_lots, evaluation_criteria, publication_date, deadline_date, award_date, contract_signing_date";

const FLAG_COLUMNS: &str =
    "id, record_id, flag_type, indicator, severity, score, weight, description, evidence, is_false_positive";

const SCORE_COLUMNS: &str = "record_id, risk_score, risk_level, flag_count, flags_summary, ci_lower, \
     ci_upper, uncertainty_level, data_completeness, last_analyzed";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and runs migrations.
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self::from_pool(pool).await?;
        info!("[STORE] database ready at {db_path}");
        Ok(store)
    }

    /// Single-connection in-memory database; every connection would
    /// otherwise see its own empty schema.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts or replaces tender records together with their bids.
    pub async fn insert_records(&self, records: &[TenderRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            let criteria = r.evaluation_criteria.map(|c| serde_json::to_string(&c)).transpose()?;
            sqlx::query(
                r#"
                INSERT INTO tenders (
                    id, title, procuring_entity, winner, cpv_code, procedure_type, status,
                    num_bidders, estimated_value, awarded_value, amended_value,
                    amendment_count, complaint_count, num_lots, evaluation_criteria,
                    publication_date, deadline_date, award_date, contract_signing_date
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    procuring_entity = excluded.procuring_entity,
                    winner = excluded.winner,
                    cpv_code = excluded.cpv_code,
                    procedure_type = excluded.procedure_type,
                    status = excluded.status,
                    num_bidders = excluded.num_bidders,
                    estimated_value = excluded.estimated_value,
                    awarded_value = excluded.awarded_value,
                    amended_value = excluded.amended_value,
                    amendment_count = excluded.amendment_count,
                    complaint_count = excluded.complaint_count,
                    num_lots = excluded.num_lots,
                    evaluation_criteria = excluded.evaluation_criteria,
                    publication_date = excluded.publication_date,
                    deadline_date = excluded.deadline_date,
                    award_date = excluded.award_date,
                    contract_signing_date = excluded.contract_signing_date
                "#,
            )
            .bind(&r.id)
            .bind(&r.title)
            .bind(&r.procuring_entity)
            .bind(&r.winner)
            .bind(&r.cpv_code)
            .bind(r.procedure_type.map(|p| p.as_str()))
            .bind(r.status.as_str())
            .bind(r.num_bidders.map(i64::from))
            .bind(r.estimated_value)
            .bind(r.awarded_value)
            .bind(r.amended_value)
            .bind(i64::from(r.amendment_count))
            .bind(i64::from(r.complaint_count))
            .bind(r.num_lots.map(i64::from))
            .bind(criteria)
            .bind(r.publication_date.map(|d| d.to_string()))
            .bind(r.deadline_date.map(|d| d.to_string()))
            .bind(r.award_date.map(|d| d.to_string()))
            .bind(r.contract_signing_date.map(|d| d.to_string()))
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM bids WHERE tender_id = ?")
                .bind(&r.id)
                .execute(&mut *tx)
                .await?;
            for bid in &r.bids {
                sqlx::query("INSERT INTO bids (tender_id, bidder, amount, disqualified) VALUES (?, ?, ?, ?)")
                    .bind(&r.id)
                    .bind(&bid.bidder)
                    .bind(bid.amount)
                    .bind(bid.disqualified)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        debug!(count = records.len(), "[STORE] tenders written");
        Ok(())
    }

    async fn bids_by_tender(&self, in_scope_only: bool, tender_id: Option<&str>) -> Result<HashMap<String, Vec<Bid>>> {
        let rows = match tender_id {
            Some(id) => {
                sqlx::query("SELECT tender_id, bidder, amount, disqualified FROM bids WHERE tender_id = ? ORDER BY id")
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let filter = if in_scope_only { "WHERE t.status IN ('awarded', 'completed')" } else { "" };
                sqlx::query(&format!(
                    "SELECT b.tender_id, b.bidder, b.amount, b.disqualified FROM bids b \
                     JOIN tenders t ON t.id = b.tender_id {filter} ORDER BY b.id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut out: HashMap<String, Vec<Bid>> = HashMap::new();
        for row in rows {
            let tender_id: String = row.try_get("tender_id")?;
            out.entry(tender_id).or_default().push(Bid {
                bidder: row.try_get("bidder")?,
                amount: row.try_get("amount")?,
                disqualified: row.try_get("disqualified")?,
            });
        }
        Ok(out)
    }
}

impl RiskStore for SqliteStore {
    async fn in_scope_records(&self) -> Result<Vec<TenderRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {TENDER_COLUMNS} FROM tenders WHERE status IN ('awarded', 'completed') ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        let mut bids = self.bids_by_tender(true, None).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match tender_from_row(row) {
                Ok(mut record) => {
                    record.bids = bids.remove(&record.id).unwrap_or_default();
                    records.push(record);
                }
                Err(e) => {
                    let id: Option<String> = row.try_get("id").ok();
                    warn!(record_id = id.as_deref().unwrap_or("?"), "[STORE] skipping unreadable tender row: {e}");
                }
            }
        }
        Ok(records)
    }

    async fn load_record(&self, record_id: &str) -> Result<Option<TenderRecord>> {
        let row = sqlx::query(&format!("SELECT {TENDER_COLUMNS} FROM tenders WHERE id = ?"))
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut record = tender_from_row(&row)?;
        record.bids = self
            .bids_by_tender(false, Some(record_id))
            .await?
            .remove(record_id)
            .unwrap_or_default();
        Ok(Some(record))
    }

    async fn flags_for(&self, record_ids: &[String]) -> Result<HashMap<String, Vec<Flag>>> {
        let mut out: HashMap<String, Vec<Flag>> = HashMap::new();
        for chunk in record_ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {FLAG_COLUMNS} FROM flags WHERE record_id IN ("));
            let mut ids = qb.separated(", ");
            for id in chunk {
                ids.push_bind(id.as_str());
            }
            ids.push_unseparated(") ORDER BY id");

            for row in qb.build().fetch_all(&self.pool).await? {
                match flag_from_row(&row) {
                    Ok(flag) => out.entry(flag.record_id.clone()).or_default().push(flag),
                    Err(e) => {
                        let id: Option<i64> = row.try_get("id").ok();
                        warn!(flag_id = ?id, "[STORE] skipping unreadable flag row: {e}");
                    }
                }
            }
        }
        Ok(out)
    }

    async fn save_flags(&self, flags: &[Flag]) -> Result<()> {
        if flags.is_empty() {
            return Ok(());
        }
        let now = now_ns();
        let mut tx = self.pool.begin().await?;
        for flag in flags {
            let evidence = serde_json::to_string(&flag.evidence)?;
            sqlx::query(
                r#"
                INSERT INTO flags (
                    record_id, flag_type, indicator, severity, score, weight, description,
                    evidence, is_false_positive, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(record_id, indicator) DO UPDATE SET
                    flag_type = excluded.flag_type,
                    severity = excluded.severity,
                    score = excluded.score,
                    weight = excluded.weight,
                    description = excluded.description,
                    evidence = excluded.evidence,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&flag.record_id)
            .bind(flag.flag_type.as_str())
            .bind(&flag.indicator)
            .bind(flag.severity.to_string())
            .bind(flag.score)
            .bind(flag.weight)
            .bind(&flag.description)
            .bind(evidence)
            .bind(flag.is_false_positive)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = flags.len(), "[STORE] flags saved");
        Ok(())
    }

    async fn mark_false_positive(&self, flag_id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE flags SET is_false_positive = 1, updated_at = ? WHERE id = ?")
            .bind(now_ns())
            .bind(flag_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("flag {flag_id}")));
        }
        info!(flag_id, "[STORE] flag marked false positive");
        Ok(())
    }

    async fn upsert_scores(&self, rows: &[RiskScore]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO risk_scores (
                    record_id, risk_score, risk_level, flag_count, flags_summary,
                    ci_lower, ci_upper, uncertainty_level, data_completeness, last_analyzed
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(record_id) DO UPDATE SET
                    risk_score = excluded.risk_score,
                    risk_level = excluded.risk_level,
                    flag_count = excluded.flag_count,
                    flags_summary = excluded.flags_summary,
                    ci_lower = excluded.ci_lower,
                    ci_upper = excluded.ci_upper,
                    uncertainty_level = excluded.uncertainty_level,
                    data_completeness = excluded.data_completeness,
                    last_analyzed = excluded.last_analyzed
                "#,
            )
            .bind(&row.record_id)
            .bind(i64::from(row.risk_score))
            .bind(row.risk_level.as_str())
            .bind(i64::from(row.flag_count))
            .bind(&row.flags_summary)
            .bind(row.ci_lower)
            .bind(row.ci_upper)
            .bind(row.uncertainty_level.to_string())
            .bind(row.data_completeness)
            .bind(row.last_analyzed)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn risk_score(&self, record_id: &str) -> Result<Option<RiskScore>> {
        let row = sqlx::query(&format!("SELECT {SCORE_COLUMNS} FROM risk_scores WHERE record_id = ?"))
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(score_from_row).transpose()
    }

    async fn risk_level_counts(&self) -> Result<BTreeMap<RiskLevel, u64>> {
        let rows = sqlx::query("SELECT risk_level, COUNT(*) AS n FROM risk_scores GROUP BY risk_level")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = empty_level_counts();
        for row in rows {
            let level: String = row.try_get("risk_level")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(parse_column(&level)?, n.max(0) as u64);
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_column<T: FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse::<T>().map_err(AppError::InvalidData)
}

fn optional_u32(row: &SqliteRow, column: &str) -> Result<Option<u32>> {
    let raw: Option<i64> = row.try_get(column)?;
    raw.map(|v| u32::try_from(v).map_err(|_| AppError::InvalidData(format!("{column} out of range: {v}"))))
        .transpose()
}

fn optional_date(row: &SqliteRow, column: &str) -> Result<Option<NaiveDate>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map_err(|e| AppError::InvalidData(format!("{column} {s:?}: {e}")))
    })
    .transpose()
}

fn tender_from_row(row: &SqliteRow) -> Result<TenderRecord> {
    let procedure: Option<String> = row.try_get("procedure_type")?;
    let status: String = row.try_get("status")?;
    let criteria: Option<String> = row.try_get("evaluation_criteria")?;
    Ok(TenderRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        procuring_entity: row.try_get("procuring_entity")?,
        winner: row.try_get("winner")?,
        cpv_code: row.try_get("cpv_code")?,
        procedure_type: procedure.as_deref().map(parse_column).transpose()?,
        status: parse_column(&status)?,
        num_bidders: optional_u32(row, "num_bidders")?,
        estimated_value: row.try_get("estimated_value")?,
        awarded_value: row.try_get("awarded_value")?,
        amended_value: row.try_get("amended_value")?,
        amendment_count: optional_u32(row, "amendment_count")?.unwrap_or(0),
        complaint_count: optional_u32(row, "complaint_count")?.unwrap_or(0),
        num_lots: optional_u32(row, "num_lots")?,
        evaluation_criteria: criteria.as_deref().map(serde_json::from_str).transpose()?,
        publication_date: optional_date(row, "publication_date")?,
        deadline_date: optional_date(row, "deadline_date")?,
        award_date: optional_date(row, "award_date")?,
        contract_signing_date: optional_date(row, "contract_signing_date")?,
        bids: Vec::new(),
    })
}

fn flag_from_row(row: &SqliteRow) -> Result<Flag> {
    let flag_type: String = row.try_get("flag_type")?;
    let severity: String = row.try_get("severity")?;
    let evidence: String = row.try_get("evidence")?;
    Ok(Flag {
        id: Some(row.try_get("id")?),
        record_id: row.try_get("record_id")?,
        flag_type: parse_column(&flag_type)?,
        indicator: row.try_get("indicator")?,
        severity: parse_column(&severity)?,
        score: row.try_get("score")?,
        weight: row.try_get("weight")?,
        description: row.try_get("description")?,
        evidence: serde_json::from_str(&evidence)?,
        is_false_positive: row.try_get("is_false_positive")?,
    })
}

fn score_from_row(row: &SqliteRow) -> Result<RiskScore> {
    let score: i64 = row.try_get("risk_score")?;
    let level: String = row.try_get("risk_level")?;
    let uncertainty: String = row.try_get("uncertainty_level")?;
    Ok(RiskScore {
        record_id: row.try_get("record_id")?,
        risk_score: u8::try_from(score).map_err(|_| AppError::InvalidData(format!("risk_score {score}")))?,
        risk_level: parse_column(&level)?,
        flag_count: optional_u32(row, "flag_count")?.unwrap_or(0),
        flags_summary: row.try_get("flags_summary")?,
        ci_lower: row.try_get("ci_lower")?,
        ci_upper: row.try_get("ci_upper")?,
        uncertainty_level: parse_column(&uncertainty)?,
        data_completeness: row.try_get("data_completeness")?,
        last_analyzed: row.try_get("last_analyzed")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EvaluationCriteria, FlagType, ProcedureType, TenderStatus, UncertaintyLevel};

    fn tender(id: &str, status: TenderStatus) -> TenderRecord {
        let mut r = TenderRecord::new(id);
        r.status = status;
        r.title = Some("Road maintenance framework".to_string());
        r.procedure_type = Some(ProcedureType::Restricted);
        r.num_bidders = Some(2);
        r.awarded_value = Some(120_000.0);
        r.evaluation_criteria = Some(EvaluationCriteria::BestValue { price_weight: 0.4 });
        r.award_date = NaiveDate::from_ymd_opt(2024, 3, 1);
        r.bids = vec![
            Bid { bidder: "acme".to_string(), amount: Some(120_000.0), disqualified: false },
            Bid { bidder: "globex".to_string(), amount: Some(125_000.0), disqualified: true },
        ];
        r
    }

    fn row(id: &str, score: u8) -> RiskScore {
        RiskScore {
            record_id: id.to_string(),
            risk_score: score,
            risk_level: RiskLevel::from_score(score),
            flag_count: 2,
            flags_summary: r#"{"strategy":"batch"}"#.to_string(),
            ci_lower: f64::from(score) - 3.5,
            ci_upper: f64::from(score) + 2.0,
            uncertainty_level: UncertaintyLevel::Medium,
            data_completeness: 0.62,
            last_analyzed: 1_700_000_000_000_000_000,
        }
    }

    #[tokio::test]
    async fn records_round_trip_with_bids() {
        let store = SqliteStore::in_memory().await.unwrap();
        let original = tender("t-1", TenderStatus::Awarded);
        store
            .insert_records(&[original.clone(), tender("t-2", TenderStatus::Cancelled)])
            .await
            .unwrap();

        let in_scope = store.in_scope_records().await.unwrap();
        assert_eq!(in_scope.len(), 1);
        assert_eq!(in_scope[0], original);
        assert_eq!(store.load_record("t-2").await.unwrap().unwrap().bids.len(), 2);
        assert!(store.load_record("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scores_upsert_by_record() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_scores(&[row("a", 30), row("b", 85)]).await.unwrap();
        store.upsert_scores(&[row("a", 64)]).await.unwrap();

        let a = store.risk_score("a").await.unwrap().unwrap();
        assert_eq!(a, row("a", 64));

        let counts = store.risk_level_counts().await.unwrap();
        assert_eq!(counts[&RiskLevel::High], 1);
        assert_eq!(counts[&RiskLevel::Critical], 1);
        assert_eq!(counts[&RiskLevel::Low], 0);
    }

    #[tokio::test]
    async fn flag_upsert_preserves_review() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut flag = Flag::new("t-1", FlagType::SingleBidder, 100.0);
        flag.indicator = Some("single_bidder".to_string());
        flag.evidence.insert("num_bidders".to_string(), serde_json::json!(1));
        let external = Flag::new("t-1", FlagType::RepeatWinner, 70.0);
        store.save_flags(&[flag.clone(), external.clone(), external]).await.unwrap();

        let flags = store.flags_for(&["t-1".to_string()]).await.unwrap();
        // Flags without an indicator never collide.
        assert_eq!(flags["t-1"].len(), 3);
        let id = flags["t-1"][0].id.unwrap();
        store.mark_false_positive(id).await.unwrap();

        flag.score = 95.0;
        store.save_flags(&[flag]).await.unwrap();
        let flags = store.flags_for(&["t-1".to_string()]).await.unwrap();
        let reviewed = flags["t-1"].iter().find(|f| f.id == Some(id)).unwrap();
        assert!(reviewed.is_false_positive);
        assert_eq!(reviewed.score, 95.0);
        assert_eq!(reviewed.evidence["num_bidders"], 1);

        assert!(matches!(store.mark_false_positive(9_999).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn unreadable_rows_are_skipped() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .insert_records(&[tender("a", TenderStatus::Awarded), tender("b", TenderStatus::Completed)])
            .await
            .unwrap();
        sqlx::query("INSERT INTO tenders (id, status, procedure_type) VALUES ('c', 'awarded', 'sealed_envelope')")
            .execute(store.pool())
            .await
            .unwrap();

        let mut good = Flag::new("a", FlagType::SingleBidder, 100.0);
        good.indicator = Some("single_bidder".to_string());
        good.weight = 1.1;
        store.save_flags(&[good]).await.unwrap();
        sqlx::query(
            "INSERT INTO flags (record_id, flag_type, indicator, severity, score, created_at, updated_at) \
             VALUES ('a', 'legacy_type', 'retired_check', 'high', 80.0, 0, 0)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let ids: Vec<String> = store.in_scope_records().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let flags = store.flags_for(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(flags["a"].len(), 1);
        assert_eq!(flags["a"][0].flag_type, FlagType::SingleBidder);
        assert_eq!(flags["a"][0].weight, 1.1);
        assert!(!flags.contains_key("b"));
    }
}
