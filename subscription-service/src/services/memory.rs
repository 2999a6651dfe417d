//! In-process store for tests and local runs without Postgres.

use super::store::{AttemptSettlement, SubscriptionStore, SubscriptionWrite};
use crate::models::{
    AttemptStatus, HandleKind, PaymentAttempt, Plan, Subscription, SubscriptionState,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use service_core::error::AppError;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    plans: HashMap<String, Plan>,
    subscriptions: HashMap<Uuid, Subscription>,
    attempts: HashMap<Uuid, PaymentAttempt>,
}

/// Plans, subscriptions and attempts live behind one lock so multi-record
/// writes are atomic; storage usage is independent.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    storage: DashMap<String, i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(plans: impl IntoIterator<Item = Plan>) -> Self {
        let tables = Tables {
            plans: plans.into_iter().map(|p| (p.name.clone(), p)).collect(),
            ..Default::default()
        };
        Self {
            tables: Mutex::new(tables),
            storage: DashMap::new(),
        }
    }
}

fn conflict(subscription_id: Uuid) -> AppError {
    AppError::Conflict(anyhow::anyhow!(
        "Subscription {} changed concurrently; retry the request",
        subscription_id
    ))
}

/// Returns `None` when a guarded update does not match.
fn apply_write(tables: &mut Tables, write: &SubscriptionWrite) -> Option<Subscription> {
    match write {
        SubscriptionWrite::Insert(sub) => {
            tables.subscriptions.insert(sub.subscription_id, sub.clone());
            Some(sub.clone())
        }
        SubscriptionWrite::Update {
            subscription,
            expected_state,
        } => {
            let current = tables.subscriptions.get_mut(&subscription.subscription_id)?;
            if current.state != *expected_state {
                return None;
            }
            let mut next = subscription.clone();
            next.updated_utc = Utc::now();
            *current = next.clone();
            Some(next)
        }
    }
}

fn can_apply(tables: &Tables, write: &SubscriptionWrite) -> bool {
    match write {
        SubscriptionWrite::Insert(_) => true,
        SubscriptionWrite::Update {
            subscription,
            expected_state,
        } => tables
            .subscriptions
            .get(&subscription.subscription_id)
            .is_some_and(|s| s.state == *expected_state),
    }
}

fn write_target(write: &SubscriptionWrite) -> Uuid {
    match write {
        SubscriptionWrite::Insert(sub) => sub.subscription_id,
        SubscriptionWrite::Update { subscription, .. } => subscription.subscription_id,
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn list_plans(&self, include_archived: bool) -> Result<Vec<Plan>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .plans
            .values()
            .filter(|p| include_archived || p.is_active)
            .cloned()
            .collect())
    }

    async fn get_plan(&self, name: &str) -> Result<Option<Plan>, AppError> {
        Ok(self.tables.lock().await.plans.get(name).cloned())
    }

    async fn upsert_plan(&self, plan: &Plan) -> Result<Plan, AppError> {
        let mut tables = self.tables.lock().await;
        tables.plans.insert(plan.name.clone(), plan.clone());
        Ok(plan.clone())
    }

    async fn set_plan_active(&self, name: &str, active: bool) -> Result<Option<Plan>, AppError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.plans.get_mut(name).map(|plan| {
            plan.is_active = active;
            plan.clone()
        }))
    }

    async fn list_user_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>, AppError> {
        let tables = self.tables.lock().await;
        let mut subs: Vec<_> = tables
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_utc);
        Ok(subs)
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .subscriptions
            .get(&subscription_id)
            .cloned())
    }

    async fn find_by_external_subscription(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .values()
            .find(|s| s.external_subscription_id.as_deref() == Some(external_subscription_id))
            .cloned())
    }

    async fn write_subscription(
        &self,
        write: &SubscriptionWrite,
    ) -> Result<Option<Subscription>, AppError> {
        let mut tables = self.tables.lock().await;
        Ok(apply_write(&mut tables, write))
    }

    async fn list_due_subscriptions(
        &self,
        today: NaiveDate,
    ) -> Result<Vec<Subscription>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .values()
            .filter(|s| s.state != SubscriptionState::Expired && s.expiry_date <= today)
            .cloned()
            .collect())
    }

    async fn record_checkout(
        &self,
        attempt: &PaymentAttempt,
        write: Option<&SubscriptionWrite>,
    ) -> Result<PaymentAttempt, AppError> {
        let mut tables = self.tables.lock().await;

        if let Some(write) = write {
            if !can_apply(&tables, write) {
                return Err(conflict(write_target(write)));
            }
            apply_write(&mut tables, write);
        }

        if let Some(subscription_id) = attempt.subscription_id {
            let now = Utc::now();
            for previous in tables.attempts.values_mut().filter(|a| {
                a.subscription_id == Some(subscription_id) && a.status == AttemptStatus::Pending
            }) {
                previous.status = AttemptStatus::Abandoned;
                previous.failure_reason = Some("Superseded by a newer checkout".to_string());
                previous.updated_utc = now;
            }
        }

        tables.attempts.insert(attempt.attempt_id, attempt.clone());
        Ok(attempt.clone())
    }

    async fn get_attempt_by_handle(
        &self,
        kind: HandleKind,
        provider_ref: &str,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .attempts
            .values()
            .find(|a| a.handle.kind() == kind && a.handle.provider_ref() == provider_ref)
            .cloned())
    }

    async fn settle_attempt(
        &self,
        attempt_id: Uuid,
        settlement: &AttemptSettlement,
        write: Option<&SubscriptionWrite>,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let mut tables = self.tables.lock().await;

        let pending = tables
            .attempts
            .get(&attempt_id)
            .is_some_and(|a| a.status == AttemptStatus::Pending);
        if !pending {
            return Ok(None);
        }

        if let Some(write) = write {
            if !can_apply(&tables, write) {
                return Err(conflict(write_target(write)));
            }
            apply_write(&mut tables, write);
        }

        let attempt = tables.attempts.get_mut(&attempt_id).map(|a| {
            a.status = settlement.status;
            a.payment_id = settlement.payment_id.clone().or(a.payment_id.take());
            a.failure_reason = settlement.failure_reason.clone();
            a.updated_utc = Utc::now();
            a.clone()
        });
        Ok(attempt)
    }

    async fn list_stale_attempts(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentAttempt>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .attempts
            .values()
            .filter(|a| a.status == AttemptStatus::Pending && a.created_utc < created_before)
            .cloned()
            .collect())
    }

    async fn storage_used(&self, user_id: &str) -> Result<i64, AppError> {
        Ok(self.storage.get(user_id).map(|v| *v).unwrap_or(0))
    }

    async fn set_storage_used(&self, user_id: &str, bytes: i64) -> Result<(), AppError> {
        self.storage.insert(user_id.to_string(), bytes);
        Ok(())
    }
}
