//! Reports: the public execution surface of the core.
//!
//! A report is request-scoped: it owns its ad-hoc fields, its planner
//! state and (transiently) a combined layer. Execution walks a forward-
//! only state machine; `kill()` is honored at the next safe suspension
//! point.

pub mod criteria;
pub mod result;

pub use criteria::{CriteriaOperator, Criterion};
pub use result::ReportResult;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::combined::{CombinedLayer, FinishSpec, OrderBy, Rollup, RowFilter};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::metadata::MetadataStore;
use crate::model::field::{AdHocField, Field};
use crate::model::technical::Technical;
use crate::planner::{Plan, Planner, ReportScope};

/// Lifecycle states. Transitions are forward-only; the active states
/// may divert to `Killed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Created,
    Ready,
    Planning,
    Queued,
    Running,
    Combining,
    Finished,
    Failed,
    Killed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Finished | ExecutionState::Failed | ExecutionState::Killed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            ExecutionState::Created => 0,
            ExecutionState::Ready => 1,
            ExecutionState::Planning => 2,
            ExecutionState::Queued => 3,
            ExecutionState::Running => 4,
            ExecutionState::Combining => 5,
            ExecutionState::Finished | ExecutionState::Failed | ExecutionState::Killed => 6,
        }
    }

    /// Whether moving to `next` is legal.
    pub fn can_transition(&self, next: ExecutionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ExecutionState::Killed | ExecutionState::Failed => !matches!(
                self,
                ExecutionState::Created
            ),
            _ => next.rank() == self.rank() + 1,
        }
    }
}

/// A requested metric: a known name or an inline ad-hoc formula metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricRequest {
    Name(String),
    AdHoc {
        name: String,
        formula: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rounding: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        technical: Option<String>,
    },
}

impl MetricRequest {
    pub fn name(&self) -> &str {
        match self {
            MetricRequest::Name(n) => n,
            MetricRequest::AdHoc { name, .. } => name,
        }
    }
}

/// A requested dimension: a known name or an inline formula dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimensionRequest {
    Name(String),
    AdHoc { name: String, formula: String },
}

impl DimensionRequest {
    pub fn name(&self) -> &str {
        match self {
            DimensionRequest::Name(n) => n,
            DimensionRequest::AdHoc { name, .. } => name,
        }
    }
}

/// The full parameter set of a report request. Stored verbatim by the
/// metadata store; execution always recomputes the plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportParams {
    #[serde(default)]
    pub metrics: Vec<MetricRequest>,

    #[serde(default)]
    pub dimensions: Vec<DimensionRequest>,

    #[serde(default)]
    pub criteria: Vec<Criterion>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollup: Option<Rollup>,

    #[serde(default)]
    pub row_filters: Vec<RowFilter>,

    #[serde(default)]
    pub order_by: Vec<OrderBy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(default)]
    pub pivot: Vec<String>,

    #[serde(default)]
    pub allow_partial: bool,
}

static NEXT_REPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Kill handles of live reports, keyed by report id.
static RUNNING_REPORTS: Lazy<Mutex<HashMap<u64, KillHandle>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Request cancellation of a live report by id. Unknown (or already
/// finished) ids are a no-op, keeping the call idempotent.
pub fn kill(report_id: u64) {
    let handle = RUNNING_REPORTS
        .lock()
        .expect("report registry poisoned")
        .get(&report_id)
        .cloned();
    if let Some(handle) = handle {
        handle.kill();
    }
}

/// Shared handle for killing a running report from another thread.
#[derive(Debug, Clone)]
pub struct KillHandle {
    flag: Arc<AtomicBool>,
    state: Arc<Mutex<ExecutionState>>,
}

impl KillHandle {
    /// Request cancellation. Idempotent; a no-op on terminal states.
    pub fn kill(&self) {
        let state = *self.state.lock().expect("state lock poisoned");
        if state.is_terminal() {
            return;
        }
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.lock().expect("state lock poisoned")
    }
}

pub struct Report<'a> {
    /// Process-unique id; the target of [`kill`].
    pub id: u64,
    warehouse: &'a crate::warehouse::Warehouse,
    params: ReportParams,
    scope: ReportScope<'a>,
    /// Criteria with subreport operators resolved to value lists.
    resolved_criteria: Vec<Criterion>,
    state: Arc<Mutex<ExecutionState>>,
    kill_flag: Arc<AtomicBool>,
    plan: Option<Plan>,
}

impl<'a> Report<'a> {
    /// Build a report: register ad-hoc fields and resolve subreport
    /// criteria (subreports execute eagerly here).
    pub fn new(warehouse: &'a crate::warehouse::Warehouse, params: ReportParams) -> Result<Self> {
        let mut scope = ReportScope::new(warehouse);

        for metric in &params.metrics {
            if let MetricRequest::AdHoc {
                name,
                formula,
                rounding,
                technical,
            } = metric
            {
                if warehouse.has_field(name) {
                    return Err(Error::field_config(
                        name,
                        "ad hoc metric shadows an existing field",
                    ));
                }
                crate::model::formula::check_allowed_sql(formula)?;
                let mut field = AdHocField::metric(name, formula);
                field.rounding = *rounding;
                field.technical = technical
                    .as_deref()
                    .map(Technical::parse)
                    .transpose()?;
                scope.adhoc.insert(Field::AdHoc(field), false)?;
            }
        }
        for dimension in &params.dimensions {
            if let DimensionRequest::AdHoc { name, formula } = dimension {
                if warehouse.has_field(name) {
                    return Err(Error::field_config(
                        name,
                        "ad hoc dimension shadows an existing field",
                    ));
                }
                crate::model::formula::check_allowed_sql(formula)?;
                scope
                    .adhoc
                    .insert(Field::AdHoc(AdHocField::dimension(name, formula)), false)?;
            }
        }

        let resolved_criteria = resolve_subreports(warehouse, &params.criteria)?;

        let report = Self {
            id: NEXT_REPORT_ID.fetch_add(1, Ordering::Relaxed),
            warehouse,
            params,
            scope,
            resolved_criteria,
            state: Arc::new(Mutex::new(ExecutionState::Created)),
            kill_flag: Arc::new(AtomicBool::new(false)),
            plan: None,
        };
        report.transition(ExecutionState::Ready)?;
        RUNNING_REPORTS
            .lock()
            .expect("report registry poisoned")
            .insert(report.id, report.kill_handle());
        Ok(report)
    }

    pub fn params(&self) -> &ReportParams {
        &self.params
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            flag: Arc::clone(&self.kill_flag),
            state: Arc::clone(&self.state),
        }
    }

    /// Request cancellation; honored at the next safe suspension point.
    pub fn kill(&self) {
        self.kill_handle().kill();
    }

    fn transition(&self, next: ExecutionState) -> Result<()> {
        let mut state = self.state.lock().expect("state lock poisoned");
        if !state.can_transition(next) {
            return Err(Error::UnsupportedOperation(format!(
                "illegal state transition {:?} -> {:?}",
                *state, next
            )));
        }
        tracing::debug!(from = ?*state, to = ?next, "report state");
        *state = next;
        Ok(())
    }

    fn check_killed(&self) -> Result<()> {
        if self.kill_flag.load(Ordering::SeqCst) {
            self.transition(ExecutionState::Killed)?;
            return Err(Error::ReportKilled);
        }
        Ok(())
    }

    /// Plan, execute and combine. Consumes the report's transient
    /// state; terminal state reflects the outcome.
    pub fn execute(&mut self) -> Result<ReportResult> {
        let started = Instant::now();
        match self.execute_inner(started) {
            Ok(result) => {
                self.transition(ExecutionState::Finished)?;
                Ok(result)
            }
            Err(Error::ReportKilled) => {
                let state = self.state();
                if !state.is_terminal() {
                    let _ = self.transition(ExecutionState::Killed);
                }
                Err(Error::ReportKilled)
            }
            Err(err) => {
                let state = self.state();
                if !state.is_terminal() {
                    let _ = self.transition(ExecutionState::Failed);
                }
                Err(err)
            }
        }
    }

    fn execute_inner(&mut self, started: Instant) -> Result<ReportResult> {
        self.check_killed()?;
        self.transition(ExecutionState::Planning)?;

        let metric_names: Vec<String> = self
            .params
            .metrics
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        let dimension_names: Vec<String> = self
            .params
            .dimensions
            .iter()
            .map(|d| d.name().to_string())
            .collect();

        let planner = Planner::new(&self.scope);
        let plan = planner.plan(&metric_names, &dimension_names, &self.resolved_criteria)?;
        tracing::info!(
            queries = plan.queries.len(),
            grain = ?plan.grain,
            "report planned"
        );
        self.plan = Some(plan);
        let plan = self.plan.as_ref().expect("plan just set");

        self.check_killed()?;
        self.transition(ExecutionState::Queued)?;
        self.transition(ExecutionState::Running)?;

        let executor = Executor::new(self.warehouse, Arc::clone(&self.kill_flag));
        let outcome = executor.execute(&plan.queries, self.params.allow_partial)?;

        if !outcome.failures.is_empty() && !self.params.allow_partial {
            let (_, err) = outcome
                .failures
                .into_iter()
                .next()
                .expect("non-empty failures");
            return Err(err);
        }
        if self.kill_flag.load(Ordering::SeqCst) {
            return Err(Error::ReportKilled);
        }

        self.transition(ExecutionState::Combining)?;

        let mut combined = CombinedLayer::new(&self.scope, plan)?;
        for (index, err) in &outcome.failures {
            combined.add_warning(format!(
                "plan {} failed, its metrics are NULL: {}",
                index, err
            ));
        }
        let chunk_size = self.warehouse.settings.load_table_chunk_size;
        let mut timings = Vec::new();
        for result in &outcome.results {
            combined.load(
                result.index,
                &plan.queries[result.index].schema,
                &result.frame,
                chunk_size,
            )?;
            timings.push(result.timing.clone());
        }

        let spec = FinishSpec {
            rollup: self.params.rollup,
            row_filters: &self.params.row_filters,
            order_by: &self.params.order_by,
            limit: self.params.limit,
            pivot: &self.params.pivot,
        };
        let output = combined.finish(&spec)?;
        self.check_killed()?;

        Ok(ReportResult {
            frame: output.frame,
            rollup_rows: output.rollup_rows,
            timings,
            warnings: output.warnings,
            duration_seconds: started.elapsed().as_secs_f64(),
        })
    }
}

impl Drop for Report<'_> {
    fn drop(&mut self) {
        RUNNING_REPORTS
            .lock()
            .expect("report registry poisoned")
            .remove(&self.id);
    }
}

/// Execute `in report` / `not in report` subreports and substitute
/// their first result column into plain `in` / `not in` lists.
fn resolve_subreports(
    warehouse: &crate::warehouse::Warehouse,
    criteria: &[Criterion],
) -> Result<Vec<Criterion>> {
    let mut out = Vec::with_capacity(criteria.len());
    for criterion in criteria {
        if !criterion.op.is_subreport() {
            out.push(criterion.clone());
            continue;
        }

        let params: ReportParams = match &criterion.value {
            serde_json::Value::Number(n) => {
                let id = n.as_i64().ok_or_else(|| {
                    Error::UnsupportedOperation("subreport id must be an integer".into())
                })?;
                let store = MetadataStore::open(&warehouse.settings.db_url)?;
                store.load_report(id)?.params
            }
            serde_json::Value::Object(_) => serde_json::from_value(criterion.value.clone())?,
            _ => {
                return Err(Error::UnsupportedOperation(
                    "subreport criteria take a spec id or an inline params object".into(),
                ))
            }
        };

        let result = Report::new(warehouse, params)?.execute()?;
        let values: Vec<serde_json::Value> = result
            .data_rows()
            .filter_map(|row| row.first())
            .map(|v| match v {
                crate::frame::Value::Int(i) => serde_json::json!(i),
                crate::frame::Value::Float(f) => serde_json::json!(f),
                crate::frame::Value::Bool(b) => serde_json::json!(b),
                other => serde_json::json!(other.to_string()),
            })
            .collect();

        let op = match criterion.op {
            CriteriaOperator::InReport => CriteriaOperator::In,
            _ => CriteriaOperator::NotIn,
        };
        out.push(Criterion {
            field: criterion.field.clone(),
            op,
            value: serde_json::Value::Array(values),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_forward_only() {
        use ExecutionState::*;
        assert!(Created.can_transition(Ready));
        assert!(Ready.can_transition(Planning));
        assert!(Planning.can_transition(Queued));
        assert!(Queued.can_transition(Running));
        assert!(Running.can_transition(Combining));
        assert!(Combining.can_transition(Finished));

        // No skipping or going backwards.
        assert!(!Ready.can_transition(Running));
        assert!(!Running.can_transition(Planning));

        // Active states may fail or be killed.
        assert!(Planning.can_transition(Killed));
        assert!(Running.can_transition(Failed));
        assert!(Combining.can_transition(Killed));
        assert!(!Created.can_transition(Killed));

        // Terminal states are final.
        assert!(!Finished.can_transition(Failed));
        assert!(!Killed.can_transition(Ready));
        assert!(Finished.is_terminal());
    }

    #[test]
    fn test_params_round_trip() {
        let params: ReportParams = serde_json::from_str(
            r#"{
                "metrics": ["revenue", {"name": "my_rpl", "formula": "{revenue}/{leads}"}],
                "dimensions": ["partner_name"],
                "criteria": [["partner_name", "=", "Partner A"]],
                "rollup": "all",
                "order_by": [["revenue", "desc"]],
                "limit": 10
            }"#,
        )
        .unwrap();
        assert_eq!(params.metrics.len(), 2);
        assert_eq!(params.metrics[1].name(), "my_rpl");
        assert_eq!(params.rollup, Some(Rollup::All));

        let json = serde_json::to_string(&params).unwrap();
        let back: ReportParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
