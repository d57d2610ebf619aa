//! Ranked candidates per job

use crate::db::sqlite::models::Candidate;
use crate::error::{AppError, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection};

/// Replace the stored candidates of a job
pub fn save_candidates(conn: &mut Connection, job_id: &str, candidates: &[Candidate]) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM job_candidates WHERE job_id = ?", [job_id])?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO job_candidates
                (job_id, rank, symbol, contract_id, expiration, strike, option_type,
                 mid, dte, alignment, score, features, data_tags)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;

        for c in candidates {
            stmt.execute(params![
                job_id,
                c.rank,
                c.symbol,
                c.contract_id,
                c.expiration.format("%Y-%m-%d").to_string(),
                c.strike,
                c.option_type.as_str(),
                c.mid,
                c.dte,
                c.score.alignment,
                serde_json::to_string(&c.score)?,
                serde_json::to_string(&c.features)?,
                serde_json::to_string(&c.data_tags)?,
            ])?;
        }
    }

    tx.commit()?;
    Ok(())
}

/// Candidates of a job in rank order
pub fn list_candidates(conn: &Connection, job_id: &str) -> Result<Vec<Candidate>> {
    let mut stmt = conn.prepare(
        "SELECT rank, symbol, contract_id, expiration, strike, option_type, mid, dte,
                score, features, data_tags
         FROM job_candidates WHERE job_id = ? ORDER BY rank ASC",
    )?;

    let rows = stmt
        .query_map([job_id], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(rank, symbol, contract_id, expiration, strike, option_type, mid, dte, score, features, tags)|
             -> Result<Candidate> {
                Ok(Candidate {
                    rank,
                    symbol,
                    expiration: NaiveDate::parse_from_str(&expiration, "%Y-%m-%d").map_err(|e| {
                        AppError::Internal(format!(
                            "Invalid expiration '{}' on {}: {}",
                            expiration, contract_id, e
                        ))
                    })?,
                    contract_id,
                    strike,
                    option_type: option_type.parse().map_err(AppError::Internal)?,
                    mid,
                    dte,
                    score: serde_json::from_str(&score)?,
                    features: serde_json::from_str(&features)?,
                    data_tags: serde_json::from_str(&tags)?,
                })
            },
        )
        .collect()
}
