//! PostgreSQL implementation of [`SubscriptionStore`].

use super::metrics::DB_QUERY_DURATION;
use super::store::{AttemptSettlement, SubscriptionStore, SubscriptionWrite};
use crate::models::{
    AttemptStatus, BillingCycle, ChangeType, CheckoutHandle, HandleKind, PaymentAttempt,
    PaymentPurpose, Plan, PlanFeatures, PlanPrice, PlanType, ScheduledChange, Subscription,
    SubscriptionState,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const PLAN_COLUMNS: &str =
    "name, display_name, tier, plan_type, storage_gb, pricing, features, is_best_value, is_active";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, plan_name, plan_type, tier, cycle, \
     price_paid, state, auto_renew, period_start, expiry_date, scheduled_change_type, scheduled_plan_name, \
     scheduled_cycle, scheduled_effective_date, external_subscription_id, last_payment_id, \
     created_utc, updated_utc";

const ATTEMPT_COLUMNS: &str = "attempt_id, user_id, purpose, plan_name, cycle, subscription_id, \
     handle_kind, provider_ref, amount, proration_credit, currency, status, payment_id, \
     failure_reason, created_utc, updated_utc";

#[derive(FromRow)]
struct PlanRow {
    name: String,
    display_name: String,
    tier: i32,
    plan_type: String,
    storage_gb: i32,
    pricing: Json<BTreeMap<BillingCycle, PlanPrice>>,
    features: Json<PlanFeatures>,
    is_best_value: bool,
    is_active: bool,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            name: row.name,
            display_name: row.display_name,
            tier: row.tier,
            plan_type: PlanType::from_string(&row.plan_type),
            storage_gb: row.storage_gb,
            pricing: row.pricing.0,
            features: row.features.0,
            is_best_value: row.is_best_value,
            is_active: row.is_active,
        }
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    user_id: String,
    plan_name: String,
    plan_type: String,
    tier: i32,
    cycle: String,
    price_paid: Decimal,
    state: String,
    auto_renew: bool,
    period_start: NaiveDate,
    expiry_date: NaiveDate,
    scheduled_change_type: Option<String>,
    scheduled_plan_name: Option<String>,
    scheduled_cycle: Option<String>,
    scheduled_effective_date: Option<NaiveDate>,
    external_subscription_id: Option<String>,
    last_payment_id: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        let scheduled_change = match (
            row.scheduled_change_type,
            row.scheduled_plan_name,
            row.scheduled_cycle.as_deref().and_then(BillingCycle::from_string),
            row.scheduled_effective_date,
        ) {
            (Some(change_type), Some(new_plan_name), Some(new_cycle), Some(effective_date)) => {
                Some(ScheduledChange {
                    change_type: ChangeType::from_string(&change_type),
                    new_plan_name,
                    new_cycle,
                    effective_date,
                })
            }
            _ => None,
        };

        Subscription {
            subscription_id: row.subscription_id,
            user_id: row.user_id,
            plan_name: row.plan_name,
            plan_type: PlanType::from_string(&row.plan_type),
            tier: row.tier,
            cycle: BillingCycle::from_string(&row.cycle).unwrap_or(BillingCycle::Monthly),
            price_paid: row.price_paid,
            state: SubscriptionState::from_string(&row.state),
            auto_renew: row.auto_renew,
            period_start: row.period_start,
            expiry_date: row.expiry_date,
            scheduled_change,
            external_subscription_id: row.external_subscription_id,
            last_payment_id: row.last_payment_id,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(FromRow)]
struct AttemptRow {
    attempt_id: Uuid,
    user_id: String,
    purpose: String,
    plan_name: String,
    cycle: String,
    subscription_id: Option<Uuid>,
    handle_kind: String,
    provider_ref: String,
    amount: Decimal,
    proration_credit: Decimal,
    currency: String,
    status: String,
    payment_id: Option<String>,
    failure_reason: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<AttemptRow> for PaymentAttempt {
    fn from(row: AttemptRow) -> Self {
        PaymentAttempt {
            attempt_id: row.attempt_id,
            user_id: row.user_id,
            purpose: PaymentPurpose::from_string(&row.purpose),
            plan_name: row.plan_name,
            cycle: BillingCycle::from_string(&row.cycle).unwrap_or(BillingCycle::Monthly),
            subscription_id: row.subscription_id,
            handle: CheckoutHandle::from_parts(
                HandleKind::from_string(&row.handle_kind),
                row.provider_ref,
            ),
            amount: row.amount,
            proration_credit: row.proration_credit,
            currency: row.currency,
            status: AttemptStatus::from_string(&row.status),
            payment_id: row.payment_id,
            failure_reason: row.failure_reason,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return AppError::Conflict(anyhow::anyhow!("{}: duplicate value", context));
        }
    }
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

fn concurrent_change(subscription_id: Uuid) -> AppError {
    AppError::Conflict(anyhow::anyhow!(
        "Subscription {} changed concurrently; retry the request",
        subscription_id
    ))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn apply_write(
        conn: &mut PgConnection,
        write: &SubscriptionWrite,
    ) -> Result<Option<Subscription>, AppError> {
        match write {
            SubscriptionWrite::Insert(sub) => {
                let change = sub.scheduled_change.as_ref();
                let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
                    r#"
                    INSERT INTO subscriptions (subscription_id, user_id, plan_name, plan_type, tier, cycle, state, auto_renew, period_start, expiry_date, scheduled_change_type, scheduled_plan_name, scheduled_cycle, scheduled_effective_date, external_subscription_id, last_payment_id, price_paid)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                    RETURNING {SUBSCRIPTION_COLUMNS}
                    "#
                ))
                .bind(sub.subscription_id)
                .bind(&sub.user_id)
                .bind(&sub.plan_name)
                .bind(sub.plan_type.as_str())
                .bind(sub.tier)
                .bind(sub.cycle.as_str())
                .bind(sub.state.as_str())
                .bind(sub.auto_renew)
                .bind(sub.period_start)
                .bind(sub.expiry_date)
                .bind(change.map(|c| c.change_type.as_str()))
                .bind(change.map(|c| c.new_plan_name.clone()))
                .bind(change.map(|c| c.new_cycle.as_str()))
                .bind(change.map(|c| c.effective_date))
                .bind(&sub.external_subscription_id)
                .bind(&sub.last_payment_id)
                .bind(sub.price_paid)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| db_error("Failed to insert subscription", e))?;
                Ok(Some(row.into()))
            }
            SubscriptionWrite::Update {
                subscription: sub,
                expected_state,
            } => {
                let change = sub.scheduled_change.as_ref();
                let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
                    r#"
                    UPDATE subscriptions
                    SET plan_name = $3, plan_type = $4, tier = $5, cycle = $6, state = $7, auto_renew = $8,
                        period_start = $9, expiry_date = $10, scheduled_change_type = $11, scheduled_plan_name = $12,
                        scheduled_cycle = $13, scheduled_effective_date = $14, external_subscription_id = $15,
                        last_payment_id = $16, price_paid = $17, updated_utc = NOW()
                    WHERE subscription_id = $1 AND state = $2
                    RETURNING {SUBSCRIPTION_COLUMNS}
                    "#
                ))
                .bind(sub.subscription_id)
                .bind(expected_state.as_str())
                .bind(&sub.plan_name)
                .bind(sub.plan_type.as_str())
                .bind(sub.tier)
                .bind(sub.cycle.as_str())
                .bind(sub.state.as_str())
                .bind(sub.auto_renew)
                .bind(sub.period_start)
                .bind(sub.expiry_date)
                .bind(change.map(|c| c.change_type.as_str()))
                .bind(change.map(|c| c.new_plan_name.clone()))
                .bind(change.map(|c| c.new_cycle.as_str()))
                .bind(change.map(|c| c.effective_date))
                .bind(&sub.external_subscription_id)
                .bind(&sub.last_payment_id)
                .bind(sub.price_paid)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| db_error("Failed to update subscription", e))?;
                Ok(row.map(Into::into))
            }
        }
    }

    /// Apply `write`, failing when a guarded update does not match.
    async fn apply_required_write(
        conn: &mut PgConnection,
        write: &SubscriptionWrite,
    ) -> Result<(), AppError> {
        match Self::apply_write(conn, write).await? {
            Some(_) => Ok(()),
            None => {
                let id = match write {
                    SubscriptionWrite::Insert(sub) => sub.subscription_id,
                    SubscriptionWrite::Update { subscription, .. } => subscription.subscription_id,
                };
                Err(concurrent_change(id))
            }
        }
    }
}

#[async_trait]
impl SubscriptionStore for Database {
    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Plan Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_plans(&self, include_archived: bool) -> Result<Vec<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_plans"])
            .start_timer();

        let rows = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE is_active OR $1 ORDER BY plan_type DESC, tier, name"
        ))
        .bind(include_archived)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list plans", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn get_plan(&self, name: &str) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get plan", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, plan), fields(plan = %plan.name))]
    async fn upsert_plan(&self, plan: &Plan) -> Result<Plan, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_plan"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanRow>(&format!(
            r#"
            INSERT INTO plans (name, display_name, tier, plan_type, storage_gb, pricing, features, is_best_value, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (name) DO UPDATE
            SET display_name = EXCLUDED.display_name, tier = EXCLUDED.tier, plan_type = EXCLUDED.plan_type,
                storage_gb = EXCLUDED.storage_gb, pricing = EXCLUDED.pricing, features = EXCLUDED.features,
                is_best_value = EXCLUDED.is_best_value, is_active = EXCLUDED.is_active, updated_utc = NOW()
            RETURNING {PLAN_COLUMNS}
            "#
        ))
        .bind(&plan.name)
        .bind(&plan.display_name)
        .bind(plan.tier)
        .bind(plan.plan_type.as_str())
        .bind(plan.storage_gb)
        .bind(Json(&plan.pricing))
        .bind(Json(&plan.features))
        .bind(plan.is_best_value)
        .bind(plan.is_active)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to upsert plan", e))?;

        timer.observe_duration();
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn set_plan_active(&self, name: &str, active: bool) -> Result<Option<Plan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_plan_active"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanRow>(&format!(
            "UPDATE plans SET is_active = $2, updated_utc = NOW() WHERE name = $1 RETURNING {PLAN_COLUMNS}"
        ))
        .bind(name)
        .bind(active)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update plan", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    // =========================================================================
    // Subscription Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_user_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_user_subscriptions"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1 ORDER BY created_utc"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list subscriptions", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE subscription_id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get subscription", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn find_by_external_subscription(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_by_external_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE external_subscription_id = $1"
        ))
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find subscription", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, write))]
    async fn write_subscription(
        &self,
        write: &SubscriptionWrite,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["write_subscription"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_error("Failed to acquire connection", e))?;
        let result = Self::apply_write(&mut conn, write).await?;

        timer.observe_duration();
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn list_due_subscriptions(
        &self,
        today: NaiveDate,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_due_subscriptions"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE state <> 'expired' AND expiry_date <= $1 ORDER BY expiry_date"
        ))
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list due subscriptions", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // =========================================================================
    // Payment Attempt Operations
    // =========================================================================

    #[instrument(skip(self, attempt, write), fields(attempt_id = %attempt.attempt_id, purpose = attempt.purpose.as_str()))]
    async fn record_checkout(
        &self,
        attempt: &PaymentAttempt,
        write: Option<&SubscriptionWrite>,
    ) -> Result<PaymentAttempt, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_checkout"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        if let Some(write) = write {
            Self::apply_required_write(&mut tx, write).await?;
        }

        if let Some(subscription_id) = attempt.subscription_id {
            sqlx::query(
                r#"
                UPDATE payment_attempts
                SET status = 'abandoned', failure_reason = 'Superseded by a newer checkout', updated_utc = NOW()
                WHERE subscription_id = $1 AND status = 'pending'
                "#,
            )
            .bind(subscription_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to abandon previous attempts", e))?;
        }

        let row = sqlx::query_as::<_, AttemptRow>(&format!(
            r#"
            INSERT INTO payment_attempts (attempt_id, user_id, purpose, plan_name, cycle, subscription_id, handle_kind, provider_ref, amount, proration_credit, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {ATTEMPT_COLUMNS}
            "#
        ))
        .bind(attempt.attempt_id)
        .bind(&attempt.user_id)
        .bind(attempt.purpose.as_str())
        .bind(&attempt.plan_name)
        .bind(attempt.cycle.as_str())
        .bind(attempt.subscription_id)
        .bind(attempt.handle.kind().as_str())
        .bind(attempt.handle.provider_ref())
        .bind(attempt.amount)
        .bind(attempt.proration_credit)
        .bind(&attempt.currency)
        .bind(attempt.status.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to record payment attempt", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit checkout", e))?;

        timer.observe_duration();
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn get_attempt_by_handle(
        &self,
        kind: HandleKind,
        provider_ref: &str,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_attempt_by_handle"])
            .start_timer();

        let row = sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM payment_attempts WHERE handle_kind = $1 AND provider_ref = $2"
        ))
        .bind(kind.as_str())
        .bind(provider_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get payment attempt", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, settlement, write), fields(status = settlement.status.as_str()))]
    async fn settle_attempt(
        &self,
        attempt_id: Uuid,
        settlement: &AttemptSettlement,
        write: Option<&SubscriptionWrite>,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["settle_attempt"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let row = sqlx::query_as::<_, AttemptRow>(&format!(
            r#"
            UPDATE payment_attempts
            SET status = $2, payment_id = COALESCE($3, payment_id), failure_reason = $4, updated_utc = NOW()
            WHERE attempt_id = $1 AND status = 'pending'
            RETURNING {ATTEMPT_COLUMNS}
            "#
        ))
        .bind(attempt_id)
        .bind(settlement.status.as_str())
        .bind(&settlement.payment_id)
        .bind(&settlement.failure_reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to settle payment attempt", e))?;

        let Some(row) = row else {
            // Already settled by another request; leave everything untouched.
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back", e))?;
            timer.observe_duration();
            return Ok(None);
        };

        if let Some(write) = write {
            Self::apply_required_write(&mut tx, write).await?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit settlement", e))?;

        timer.observe_duration();
        Ok(Some(row.into()))
    }

    #[instrument(skip(self))]
    async fn list_stale_attempts(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_stale_attempts"])
            .start_timer();

        let rows = sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM payment_attempts WHERE status = 'pending' AND created_utc < $1"
        ))
        .bind(created_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list stale attempts", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // =========================================================================
    // Storage Usage
    // =========================================================================

    #[instrument(skip(self))]
    async fn storage_used(&self, user_id: &str) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["storage_used"])
            .start_timer();

        let used: Option<i64> =
            sqlx::query_scalar("SELECT used_bytes FROM storage_usage WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("Failed to read storage usage", e))?;

        timer.observe_duration();
        Ok(used.unwrap_or(0))
    }

    #[instrument(skip(self))]
    async fn set_storage_used(&self, user_id: &str, bytes: i64) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_storage_used"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO storage_usage (user_id, used_bytes) VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET used_bytes = EXCLUDED.used_bytes, updated_utc = NOW()
            "#,
        )
        .bind(user_id)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to record storage usage", e))?;

        timer.observe_duration();
        Ok(())
    }
}
