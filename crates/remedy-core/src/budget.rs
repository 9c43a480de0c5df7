use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Local, Utc};

use crate::db::Store;
use crate::types::GateDecision;

/// Round for display only; admission always compares unrounded values.
pub fn display_usd(v: f64) -> String {
    format!("{:.4}", (v * 10_000.0).round() / 10_000.0)
}

/// Next local midnight, when daily windows reset.
pub fn next_local_midnight() -> chrono::DateTime<Utc> {
    let tomorrow = Local::now().date_naive() + Duration::days(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(Local).single())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() + Duration::days(1))
}

/// Refuses work that would push spend past the daily or monthly limit.
pub struct BudgetGate {
    store: Arc<Store>,
    pub daily_limit_usd: f64,
    pub monthly_limit_usd: f64,
}

impl BudgetGate {
    pub fn new(store: Arc<Store>, daily_limit_usd: f64, monthly_limit_usd: f64) -> Self {
        Self { store, daily_limit_usd, monthly_limit_usd }
    }

    /// Admission check with an optional estimated cost for the run ahead.
    pub fn can_proceed(&self, estimated_usd: Option<f64>) -> Result<GateDecision> {
        let e = estimated_usd.unwrap_or(0.0);
        let today = self.store.today_cost()?;
        if today + e > self.daily_limit_usd {
            return Ok(GateDecision {
                can_proceed: false,
                reason: Some("Estimated cost would exceed daily limit".into()),
                next_available: Some(next_local_midnight()),
            });
        }
        let month = self.store.month_cost()?;
        if month + e > self.monthly_limit_usd {
            return Ok(GateDecision {
                can_proceed: false,
                reason: Some("Estimated cost would exceed monthly limit".into()),
                next_available: None,
            });
        }
        Ok(GateDecision::allow())
    }
}

/// Caps how many proposals go out per day, globally and per project.
pub struct RateGate {
    store: Arc<Store>,
    pub max_per_day: u32,
    pub max_per_project_per_day: u32,
}

impl RateGate {
    pub fn new(store: Arc<Store>, max_per_day: u32, max_per_project_per_day: u32) -> Self {
        Self { store, max_per_day, max_per_project_per_day }
    }

    /// Project keys are `owner/repo` verbatim; no case folding.
    pub fn can_publish(&self, project: &str) -> Result<GateDecision> {
        let today = self.store.today_proposal_count()?;
        if today >= i64::from(self.max_per_day) {
            return Ok(GateDecision {
                can_proceed: false,
                reason: Some(format!("Daily proposal limit reached ({today})")),
                next_available: Some(next_local_midnight()),
            });
        }
        let per_project = self.store.today_proposal_count_for(project)?;
        if per_project >= i64::from(self.max_per_project_per_day) {
            return Ok(GateDecision {
                can_proceed: false,
                reason: Some(format!("Daily proposal limit for {project} reached ({per_project})")),
                next_available: Some(next_local_midnight()),
            });
        }
        Ok(GateDecision::allow())
    }
}
