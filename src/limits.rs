//! Limit resolution and gating decisions.
//!
//! A metric's effective limit is resolved from up to three plan-limit
//! scopes; customer overrides beat plan limits, which beat business
//! defaults. The gate evaluation is pure so it can be exercised without
//! actors.

use crate::models::{BreachAction, BreachOperator, LimitScope, PlanLimit};
use serde::Serialize;
use std::collections::HashMap;

/// The limit a metric actor enforces after scope resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveLimit {
    pub value: f64,
    pub operator: BreachOperator,
    pub action: BreachAction,
    pub webhook_urls: Option<Vec<String>>,
    pub scope: LimitScope,
}

impl EffectiveLimit {
    pub fn from_plan_limit(limit: &PlanLimit) -> Self {
        Self {
            value: limit.limit_value,
            operator: limit.breach_operator,
            action: limit.breach_action,
            webhook_urls: limit.webhook_urls.clone(),
            scope: limit.scope(),
        }
    }

    pub fn is_breached(&self, current: f64) -> bool {
        self.operator.evaluate(current, self.value)
    }
}

/// Collapse raw plan-limit rows into one effective limit per metric name,
/// keeping the highest-precedence scope.
pub fn resolve_effective_limits(rows: &[PlanLimit]) -> HashMap<String, PlanLimit> {
    let mut effective: HashMap<String, PlanLimit> = HashMap::new();
    for row in rows {
        match effective.get(&row.metric_name) {
            Some(existing) if existing.scope() >= row.scope() => {}
            _ => {
                effective.insert(row.metric_name.clone(), row.clone());
            }
        }
    }
    effective
}

/// Breach summary attached to gated responses.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BreachStatus {
    pub is_breached: bool,
    pub current_usage: f64,
    pub limit_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breach_action: Option<String>,
}

/// What the gate decided for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// No limit configured; forward and increment on success.
    Allow,
    /// Limit exists but is not breached.
    AllowWithin(BreachStatus),
    /// Breached with `allow_overage`: forward, increment on success, and
    /// bill overage units.
    AllowOverage(BreachStatus),
    /// Breached with `webhook`: forward, increment on success, fire hooks.
    AllowNotify(BreachStatus),
    /// Breached with `log`: forward and log.
    AllowLogged(BreachStatus),
    /// Breached with `deny`: do not forward, do not increment.
    Deny(BreachStatus),
}

impl GateDecision {
    pub fn breach_status(&self) -> Option<&BreachStatus> {
        match self {
            GateDecision::Allow => None,
            GateDecision::AllowWithin(s)
            | GateDecision::AllowOverage(s)
            | GateDecision::AllowNotify(s)
            | GateDecision::AllowLogged(s)
            | GateDecision::Deny(s) => Some(s),
        }
    }

    pub fn forwards(&self) -> bool {
        !matches!(self, GateDecision::Deny(_))
    }
}

/// Evaluate the gate for a current value against an optional limit.
pub fn evaluate_gate(current: f64, limit: Option<&EffectiveLimit>) -> GateDecision {
    let Some(limit) = limit else {
        return GateDecision::Allow;
    };

    let breached = limit.is_breached(current);
    // Remaining only makes sense for upper-bound operators.
    let remaining = match limit.operator {
        BreachOperator::Gte | BreachOperator::Gt => Some((limit.value - current).max(0.0)),
        _ => None,
    };
    let status = BreachStatus {
        is_breached: breached,
        current_usage: current,
        limit_value: limit.value,
        remaining,
        breach_action: breached.then(|| limit.action.as_str().to_string()),
    };

    if !breached {
        return GateDecision::AllowWithin(status);
    }
    match limit.action {
        BreachAction::Deny => GateDecision::Deny(status),
        BreachAction::AllowOverage => GateDecision::AllowOverage(status),
        BreachAction::Webhook => GateDecision::AllowNotify(status),
        BreachAction::Log => GateDecision::AllowLogged(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricType;

    fn limit_row(id: &str, plan: Option<&str>, cust: Option<&str>, value: f64) -> PlanLimit {
        PlanLimit {
            id: id.into(),
            business_id: "biz_1".into(),
            plan_id: plan.map(str::to_string),
            customer_id: cust.map(str::to_string),
            metric_name: "api_calls".into(),
            limit_value: value,
            limit_period: Some("tick_1d".into()),
            breach_operator: BreachOperator::Gte,
            breach_action: BreachAction::Deny,
            webhook_urls: None,
            metric_type: MetricType::Reset,
        }
    }

    #[test]
    fn test_customer_override_beats_plan_beats_default() {
        let rows = vec![
            limit_row("default", None, None, 100.0),
            limit_row("plan", Some("plan_pro"), None, 1000.0),
            limit_row("override", None, Some("cust_1"), 5000.0),
        ];
        let effective = resolve_effective_limits(&rows);
        assert_eq!(effective["api_calls"].id, "override");

        // Without an override the plan row wins.
        let effective = resolve_effective_limits(&rows[..2]);
        assert_eq!(effective["api_calls"].id, "plan");

        // Defaults apply when nothing else is configured.
        let effective = resolve_effective_limits(&rows[..1]);
        assert_eq!(effective["api_calls"].id, "default");
    }

    #[test]
    fn test_resolution_is_order_independent() {
        let mut rows = vec![
            limit_row("override", None, Some("cust_1"), 5000.0),
            limit_row("default", None, None, 100.0),
            limit_row("plan", Some("plan_pro"), None, 1000.0),
        ];
        assert_eq!(resolve_effective_limits(&rows)["api_calls"].id, "override");
        rows.reverse();
        assert_eq!(resolve_effective_limits(&rows)["api_calls"].id, "override");
    }

    #[test]
    fn test_resolution_is_per_metric() {
        let mut storage = limit_row("storage_default", None, None, 50.0);
        storage.metric_name = "storage_gb".into();
        let rows = vec![limit_row("plan", Some("plan_pro"), None, 1000.0), storage];

        let effective = resolve_effective_limits(&rows);
        assert_eq!(effective.len(), 2);
        assert_eq!(effective["api_calls"].id, "plan");
        assert_eq!(effective["storage_gb"].id, "storage_default");
    }

    fn gate_limit(action: BreachAction) -> EffectiveLimit {
        EffectiveLimit {
            value: 1000.0,
            operator: BreachOperator::Gte,
            action,
            webhook_urls: None,
            scope: LimitScope::Plan,
        }
    }

    #[test]
    fn test_gate_without_limit_allows() {
        assert_eq!(evaluate_gate(1_000_000.0, None), GateDecision::Allow);
    }

    #[test]
    fn test_gate_under_limit_reports_remaining() {
        let decision = evaluate_gate(999.0, Some(&gate_limit(BreachAction::Deny)));
        let GateDecision::AllowWithin(status) = decision else {
            panic!("expected AllowWithin, got {decision:?}");
        };
        assert!(!status.is_breached);
        assert_eq!(status.remaining, Some(1.0));
        assert!(status.breach_action.is_none());
    }

    #[test]
    fn test_gate_deny_at_limit() {
        let decision = evaluate_gate(1000.0, Some(&gate_limit(BreachAction::Deny)));
        let GateDecision::Deny(status) = decision else {
            panic!("expected Deny, got {decision:?}");
        };
        assert!(status.is_breached);
        assert_eq!(status.current_usage, 1000.0);
        assert_eq!(status.limit_value, 1000.0);
        assert_eq!(status.remaining, Some(0.0));
        assert!(!GateDecision::Deny(status).forwards());
    }

    #[test]
    fn test_gate_overage_and_webhook_forward() {
        let over = evaluate_gate(1001.0, Some(&gate_limit(BreachAction::AllowOverage)));
        assert!(matches!(over, GateDecision::AllowOverage(_)));
        assert!(over.forwards());

        let hook = evaluate_gate(1001.0, Some(&gate_limit(BreachAction::Webhook)));
        assert!(matches!(hook, GateDecision::AllowNotify(_)));
        assert!(hook.forwards());
    }

    #[test]
    fn test_gate_lower_bound_operator_has_no_remaining() {
        let floor = EffectiveLimit {
            value: 10.0,
            operator: BreachOperator::Lte,
            action: BreachAction::Webhook,
            webhook_urls: None,
            scope: LimitScope::BusinessDefault,
        };
        let decision = evaluate_gate(5.0, Some(&floor));
        let status = decision.breach_status().unwrap();
        assert!(status.is_breached);
        assert_eq!(status.remaining, None);
    }
}
