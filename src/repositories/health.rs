use serde::Serialize;
use sqlx::PgPool;

use crate::repositories::jobs::QueueTable;

const PRIVILEGED_FUNCTIONS: [&str; 3] = [
    "learning_worker_update_completed(uuid, text, text, jsonb)",
    "learning_worker_update_failed(uuid, text, text)",
    "learning_worker_mark_retry(uuid, text, text, timestamptz)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum CheckStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct HealthCheck {
    pub(crate) check: &'static str,
    pub(crate) status: CheckStatus,
    pub(crate) detail: Option<String>,
}

impl HealthCheck {
    fn ok(check: &'static str) -> Self {
        Self { check, status: CheckStatus::Ok, detail: None }
    }

    fn failed(check: &'static str, detail: impl Into<String>) -> Self {
        Self { check, status: CheckStatus::Failed, detail: Some(detail.into()) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HealthReport {
    pub(crate) status: &'static str,
    pub(crate) current_role: Option<String>,
    pub(crate) checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub(crate) fn from_checks(current_role: Option<String>, checks: Vec<HealthCheck>) -> Self {
        let healthy =
            !checks.is_empty() && checks.iter().all(|check| check.status == CheckStatus::Ok);
        Self { status: if healthy { "healthy" } else { "degraded" }, current_role, checks }
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Verifies the database prerequisites of the worker without touching submission rows.
pub(crate) async fn check_worker(pool: &PgPool, queue: QueueTable) -> HealthReport {
    let mut checks = Vec::with_capacity(3);

    let current_role = match sqlx::query_scalar::<_, String>("SELECT current_user::text")
        .fetch_one(pool)
        .await
    {
        Ok(role) => {
            checks.push(HealthCheck::ok("db_role"));
            Some(role)
        }
        Err(err) => {
            checks.push(HealthCheck::failed("db_role", format!("check_error: {err}")));
            return HealthReport::from_checks(None, checks);
        }
    };

    let visibility = format!("SELECT EXISTS (SELECT 1 FROM {} LIMIT 1)", queue.name());
    match sqlx::query_scalar::<_, bool>(&visibility).fetch_one(pool).await {
        Ok(_) => checks.push(HealthCheck::ok("queue_visibility")),
        Err(err) => checks.push(HealthCheck::failed(
            "queue_visibility",
            format!("{} not readable: {err}", queue.name()),
        )),
    }

    let mut missing = Vec::new();
    for signature in PRIVILEGED_FUNCTIONS {
        match sqlx::query_scalar::<_, Option<String>>("SELECT to_regprocedure($1)::text")
            .bind(format!("public.{signature}"))
            .fetch_one(pool)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => missing.push(signature),
            Err(err) => {
                tracing::warn!(error = %err, function = signature, "Failed to look up function");
                missing.push(signature);
            }
        }
    }
    if missing.is_empty() {
        checks.push(HealthCheck::ok("privileged_functions"));
    } else {
        checks.push(HealthCheck::failed(
            "privileged_functions",
            format!("missing: {}", missing.join(", ")),
        ));
    }

    HealthReport::from_checks(current_role, checks)
}
