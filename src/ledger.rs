//! Per-user request counters with calendar day / month rollover.
//!
//! Every mutation is a single conditional `UPDATE`, so concurrent requests
//! for the same user never lose increments. Calendar boundaries are UTC.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::RelayError;

pub const DEFAULT_DAILY_LIMIT: i64 = 100;
pub const DEFAULT_MONTHLY_LIMIT: i64 = 3000;

/// Request quotas applied per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageLimits {
    pub daily: i64,
    pub monthly: i64,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            daily: DEFAULT_DAILY_LIMIT,
            monthly: DEFAULT_MONTHLY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaWindow {
    Daily,
    Monthly,
}

impl QuotaWindow {
    pub fn reason(self, limit: i64) -> String {
        format!("{self} limit of {limit} requests exceeded")
    }
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaWindow::Daily => f.write_str("Daily"),
            QuotaWindow::Monthly => f.write_str("Monthly"),
        }
    }
}

/// Outcome of [`UsageLedger::check_limit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub exceeded: Option<QuotaWindow>,
}

impl LimitCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            exceeded: None,
        }
    }

    fn denied(window: QuotaWindow, limit: i64) -> Self {
        Self {
            allowed: false,
            reason: Some(window.reason(limit)),
            exceeded: Some(window),
        }
    }
}

/// Stored counters for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCounters {
    pub user_id: String,
    pub daily_count: i64,
    pub monthly_count: i64,
    pub total_tokens: i64,
    pub daily_window_start: DateTime<Utc>,
    pub monthly_window_start: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageCounters {
    /// Daily count as seen at `now`; a window from an earlier day counts as zero.
    pub fn daily_count_at(&self, now: DateTime<Utc>) -> i64 {
        if self.daily_window_start.date_naive() == now.date_naive() {
            self.daily_count
        } else {
            0
        }
    }

    pub fn monthly_count_at(&self, now: DateTime<Utc>) -> i64 {
        let start = self.monthly_window_start;
        if start.year() == now.year() && start.month() == now.month() {
            self.monthly_count
        } else {
            0
        }
    }

    fn from_row(row: SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            user_id: row.try_get("user_id")?,
            daily_count: row.try_get("daily_count")?,
            monthly_count: row.try_get("monthly_count")?,
            total_tokens: row.try_get("total_tokens")?,
            daily_window_start: from_timestamp(row.try_get("daily_window_start")?),
            monthly_window_start: from_timestamp(row.try_get("monthly_window_start")?),
            updated_at: from_timestamp(row.try_get("updated_at")?),
        })
    }
}

/// Half-open `[start, end)` unix-second ranges of the day and month containing `now`.
#[derive(Debug, Clone, Copy)]
struct Windows {
    now: i64,
    day_start: i64,
    day_end: i64,
    month_start: i64,
    month_end: i64,
}

impl Windows {
    fn at(now: DateTime<Utc>) -> Self {
        let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let month_start = start_of_month(now);
        let month_end = if now.month() == 12 {
            Utc.with_ymd_and_hms(now.year() + 1, 1, 1, 0, 0, 0)
        } else {
            Utc.with_ymd_and_hms(now.year(), now.month() + 1, 1, 0, 0, 0)
        }
        .single()
        .unwrap_or(month_start + Duration::days(31));

        Self {
            now: now.timestamp(),
            day_start: day_start.timestamp(),
            day_end: (day_start + Duration::days(1)).timestamp(),
            month_start: month_start.timestamp(),
            month_end: month_end.timestamp(),
        }
    }
}

const DAILY_CURRENT: &str = "(daily_window_start >= ? AND daily_window_start < ?)";
const MONTHLY_CURRENT: &str = "(monthly_window_start >= ? AND monthly_window_start < ?)";

/// Usage accounting backed by the `usage_counters` table.
#[derive(Debug, Clone)]
pub struct UsageLedger {
    pool: SqlitePool,
}

impl UsageLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_counters (
                user_id TEXT PRIMARY KEY,
                daily_count INTEGER NOT NULL DEFAULT 0,
                monthly_count INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                daily_window_start INTEGER NOT NULL,
                monthly_window_start INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_or_create(&self, user_id: &str) -> Result<UsageCounters, RelayError> {
        self.get_or_create_at(user_id, Utc::now()).await
    }

    pub async fn get_or_create_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UsageCounters, RelayError> {
        self.ensure_row(user_id, now.timestamp()).await?;

        let row = sqlx::query(
            r#"
            SELECT
                user_id,
                daily_count,
                monthly_count,
                total_tokens,
                daily_window_start,
                monthly_window_start,
                updated_at
            FROM usage_counters
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageCounters::from_row(row)?)
    }

    pub async fn check_limit(
        &self,
        user_id: &str,
        limits: UsageLimits,
    ) -> Result<LimitCheck, RelayError> {
        self.check_limit_at(user_id, limits, Utc::now()).await
    }

    /// Compare the counters against `limits` without touching them.
    pub async fn check_limit_at(
        &self,
        user_id: &str,
        limits: UsageLimits,
        now: DateTime<Utc>,
    ) -> Result<LimitCheck, RelayError> {
        let counters = self.get_or_create_at(user_id, now).await?;
        Ok(evaluate_limits(&counters, limits, now))
    }

    pub async fn increment_daily(&self, user_id: &str) -> Result<(), RelayError> {
        self.increment_daily_at(user_id, Utc::now()).await
    }

    /// Reset to 1 if the stored day is not today, otherwise add one.
    pub async fn increment_daily_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        let windows = Windows::at(now);
        self.ensure_row(user_id, windows.now).await?;

        let sql = format!(
            r#"
            UPDATE usage_counters
            SET daily_count = CASE WHEN {DAILY_CURRENT} THEN daily_count + 1 ELSE 1 END,
                daily_window_start = CASE WHEN {DAILY_CURRENT} THEN daily_window_start ELSE ? END,
                updated_at = ?
            WHERE user_id = ?
            "#
        );
        sqlx::query(&sql)
            .bind(windows.day_start)
            .bind(windows.day_end)
            .bind(windows.day_start)
            .bind(windows.day_end)
            .bind(windows.now)
            .bind(windows.now)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_monthly(&self, user_id: &str) -> Result<(), RelayError> {
        self.increment_monthly_at(user_id, Utc::now()).await
    }

    /// Reset to 1 if the stored month or year differs from now, otherwise add one.
    pub async fn increment_monthly_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        let windows = Windows::at(now);
        self.ensure_row(user_id, windows.now).await?;

        let sql = format!(
            r#"
            UPDATE usage_counters
            SET monthly_count = CASE WHEN {MONTHLY_CURRENT} THEN monthly_count + 1 ELSE 1 END,
                monthly_window_start = CASE WHEN {MONTHLY_CURRENT} THEN monthly_window_start ELSE ? END,
                updated_at = ?
            WHERE user_id = ?
            "#
        );
        sqlx::query(&sql)
            .bind(windows.month_start)
            .bind(windows.month_end)
            .bind(windows.month_start)
            .bind(windows.month_end)
            .bind(windows.now)
            .bind(windows.now)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_tokens(&self, user_id: &str, tokens: u32) -> Result<(), RelayError> {
        let now = Utc::now().timestamp();
        self.ensure_row(user_id, now).await?;

        sqlx::query(
            r#"
            UPDATE usage_counters
            SET total_tokens = total_tokens + ?, updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(i64::from(tokens))
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn try_consume(&self, user_id: &str, limits: UsageLimits) -> Result<(), RelayError> {
        self.try_consume_at(user_id, limits, Utc::now()).await
    }

    /// Gate and increment both counters in one statement.
    ///
    /// The row is only updated while both effective counts are below their
    /// limits, so two racing requests cannot both take the last slot.
    pub async fn try_consume_at(
        &self,
        user_id: &str,
        limits: UsageLimits,
        now: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        let windows = Windows::at(now);
        self.ensure_row(user_id, windows.now).await?;

        let sql = format!(
            r#"
            UPDATE usage_counters
            SET daily_count = CASE WHEN {DAILY_CURRENT} THEN daily_count + 1 ELSE 1 END,
                daily_window_start = CASE WHEN {DAILY_CURRENT} THEN daily_window_start ELSE ? END,
                monthly_count = CASE WHEN {MONTHLY_CURRENT} THEN monthly_count + 1 ELSE 1 END,
                monthly_window_start = CASE WHEN {MONTHLY_CURRENT} THEN monthly_window_start ELSE ? END,
                updated_at = ?
            WHERE user_id = ?
              AND (CASE WHEN {DAILY_CURRENT} THEN daily_count ELSE 0 END) < ?
              AND (CASE WHEN {MONTHLY_CURRENT} THEN monthly_count ELSE 0 END) < ?
            "#
        );
        let result = sqlx::query(&sql)
            .bind(windows.day_start)
            .bind(windows.day_end)
            .bind(windows.day_start)
            .bind(windows.day_end)
            .bind(windows.now)
            .bind(windows.month_start)
            .bind(windows.month_end)
            .bind(windows.month_start)
            .bind(windows.month_end)
            .bind(windows.now)
            .bind(windows.now)
            .bind(user_id)
            .bind(windows.day_start)
            .bind(windows.day_end)
            .bind(limits.daily)
            .bind(windows.month_start)
            .bind(windows.month_end)
            .bind(limits.monthly)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let check = self.check_limit_at(user_id, limits, now).await?;
        let window = check.exceeded.unwrap_or(QuotaWindow::Daily);
        let limit = match window {
            QuotaWindow::Daily => limits.daily,
            QuotaWindow::Monthly => limits.monthly,
        };
        Err(RelayError::QuotaExceeded { window, limit })
    }

    pub async fn refund(&self, user_id: &str) -> Result<(), RelayError> {
        self.refund_at(user_id, Utc::now()).await
    }

    /// Give back one slot taken by [`UsageLedger::try_consume`]. Windows that
    /// rolled over in the meantime are left alone.
    pub async fn refund_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), RelayError> {
        let windows = Windows::at(now);
        let sql = format!(
            r#"
            UPDATE usage_counters
            SET daily_count = CASE WHEN {DAILY_CURRENT} AND daily_count > 0
                                   THEN daily_count - 1 ELSE daily_count END,
                monthly_count = CASE WHEN {MONTHLY_CURRENT} AND monthly_count > 0
                                     THEN monthly_count - 1 ELSE monthly_count END,
                updated_at = ?
            WHERE user_id = ?
            "#
        );
        sqlx::query(&sql)
            .bind(windows.day_start)
            .bind(windows.day_end)
            .bind(windows.month_start)
            .bind(windows.month_end)
            .bind(windows.now)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ensure_row(&self, user_id: &str, now: i64) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            INSERT INTO usage_counters (
                user_id,
                daily_count,
                monthly_count,
                total_tokens,
                daily_window_start,
                monthly_window_start,
                created_at,
                updated_at
            ) VALUES (?, 0, 0, 0, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn evaluate_limits(counters: &UsageCounters, limits: UsageLimits, now: DateTime<Utc>) -> LimitCheck {
    if counters.daily_count_at(now) >= limits.daily {
        return LimitCheck::denied(QuotaWindow::Daily, limits.daily);
    }
    if counters.monthly_count_at(now) >= limits.monthly {
        return LimitCheck::denied(QuotaWindow::Monthly, limits.monthly);
    }
    LimitCheck::allowed()
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or_else(|| now.date_naive().and_time(NaiveTime::MIN).and_utc())
}

fn from_timestamp(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_default()
}
