//! The execution plan: an insertion-ordered DAG of steps for one task.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::{PlanResult, PlanningError};
use super::step::{Params, RecoveryInfo, Step, StepId, StepStatus};

/// A template step that was left out because its tool is unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanGap {
    pub intent: String,
    pub missing_tool: String,
    /// Descriptions of the omitted steps, in template order.
    pub omitted: Vec<String>,
}

/// One row of the caller-facing plan summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub index: usize,
    pub id: StepId,
    pub status: StepStatus,
    pub tool_name: String,
    pub description: String,
    pub depends_on: Vec<StepId>,
}

/// Serializable summary of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub task: String,
    pub steps: Vec<StepSummary>,
}

impl PlanSummary {
    /// Hex SHA-256 over the serialized step rows.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.steps).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// How a plan ended, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlanOutcome {
    Completed,
    /// Some step failed without a successful remedy, or could never run.
    Incomplete {
        failed: Vec<StepId>,
        blocked: Vec<StepId>,
    },
    /// The walk was cancelled by the caller.
    Cancelled {
        interrupted: Vec<StepId>,
        pending: Vec<StepId>,
    },
}

impl PlanOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PlanOutcome::Completed)
    }
}

/// The dependency graph of steps for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    id: Uuid,
    task: String,
    context: Params,
    created_at: DateTime<Utc>,
    steps: Vec<Step>,
    gaps: Vec<PlanGap>,
    /// Tool names the plan was built against; replanning only picks from these.
    #[serde(default)]
    available_tools: Vec<String>,
}

impl ExecutionPlan {
    pub fn new(task: impl Into<String>, context: Params) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            context,
            created_at: Utc::now(),
            steps: Vec::new(),
            gaps: Vec::new(),
            available_tools: Vec::new(),
        }
    }

    /// Record the tool universe, sorted and deduplicated.
    pub fn with_available_tools<S: AsRef<str>>(mut self, tools: &[S]) -> Self {
        let mut names: Vec<String> = tools.iter().map(|t| t.as_ref().to_string()).collect();
        names.sort();
        names.dedup();
        self.available_tools = names;
        self
    }

    /// Build a plan from pre-made steps, failing fast on duplicate ids,
    /// dangling dependencies, self-loops, or cycles.
    pub fn from_steps(
        task: impl Into<String>,
        context: Params,
        steps: Vec<Step>,
    ) -> PlanResult<Self> {
        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.id().clone()) {
                return Err(PlanningError::DuplicateStep {
                    step: step.id().clone(),
                });
            }
        }
        let mut plan = Self::new(task, context);
        plan.steps = steps;
        plan.validate()?;
        Ok(plan)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn context(&self) -> &Params {
        &self.context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn gaps(&self) -> &[PlanGap] {
        &self.gaps
    }

    pub fn available_tools(&self) -> &[String] {
        &self.available_tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.available_tools.iter().any(|t| t == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id() == id)
    }

    fn position(&self, id: &StepId) -> PlanResult<usize> {
        self.steps
            .iter()
            .position(|s| s.id() == id)
            .ok_or_else(|| PlanningError::UnknownStep { step: id.clone() })
    }

    fn next_id(&self) -> StepId {
        let mut n = self.steps.len() + 1;
        loop {
            let candidate = StepId::nth(n);
            if self.step(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    pub(crate) fn record_gap(&mut self, gap: PlanGap) {
        self.gaps.push(gap);
    }

    /// Append a step. Dependencies must already exist, which keeps the graph
    /// acyclic by construction.
    pub fn add_step(
        &mut self,
        tool: impl Into<String>,
        params: Params,
        description: impl Into<String>,
        depends_on: Vec<StepId>,
    ) -> PlanResult<StepId> {
        let id = self.next_id();
        for dep in &depends_on {
            if self.step(dep).is_none() {
                return Err(PlanningError::UnknownDependency {
                    step: id,
                    dependency: dep.clone(),
                });
            }
        }
        self.steps
            .push(Step::new(id.clone(), tool, params, description, depends_on));
        Ok(id)
    }

    /// Check dependency existence, self-loops, and acyclicity (Kahn's
    /// algorithm over insertion order).
    pub fn validate(&self) -> PlanResult<()> {
        let index: HashMap<&StepId, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id(), i))
            .collect();

        let mut indegree = vec![0usize; self.steps.len()];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in step.depends_on() {
                if dep == step.id() {
                    return Err(PlanningError::SelfDependency {
                        step: step.id().clone(),
                    });
                }
                let Some(&d) = index.get(dep) else {
                    return Err(PlanningError::UnknownDependency {
                        step: step.id().clone(),
                        dependency: dep.clone(),
                    });
                };
                edges[d].push(i);
                indegree[i] += 1;
            }
        }

        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &n in &edges[node] {
                indegree[n] -= 1;
                if indegree[n] == 0 {
                    queue.push_back(n);
                }
            }
        }

        if visited != self.steps.len() {
            let stuck = indegree
                .iter()
                .position(|d| *d > 0)
                .map(|i| self.steps[i].id().clone())
                .unwrap_or_else(|| StepId::from("?"));
            return Err(PlanningError::CycleDetected { step: stuck });
        }
        Ok(())
    }

    /// Apply one status transition, rejecting anything the state machine
    /// does not allow.
    pub fn transition(&mut self, id: &StepId, next: StepStatus) -> PlanResult<()> {
        let pos = self.position(id)?;
        let step = &mut self.steps[pos];
        if !step.status().can_transition_to(next) {
            return Err(PlanningError::InvalidTransition {
                step: id.clone(),
                from: step.status(),
                to: next,
            });
        }
        step.set_status(next, Utc::now());
        Ok(())
    }

    pub fn mark_running(&mut self, id: &StepId) -> PlanResult<()> {
        self.transition(id, StepStatus::Running)
    }

    pub fn mark_completed(&mut self, id: &StepId, result: Value) -> PlanResult<()> {
        self.transition(id, StepStatus::Completed)?;
        let pos = self.position(id)?;
        self.steps[pos].set_result(result);
        Ok(())
    }

    pub fn mark_failed(&mut self, id: &StepId, error: impl Into<String>) -> PlanResult<()> {
        self.transition(id, StepStatus::Failed)?;
        let pos = self.position(id)?;
        self.steps[pos].set_error(error);
        Ok(())
    }

    /// A dependency is satisfied when it completed, or when it failed and was
    /// superseded by a remedial recovery step that completed.
    pub fn dependency_satisfied(&self, dep: &StepId) -> bool {
        let Some(step) = self.step(dep) else {
            return false;
        };
        match step.status() {
            StepStatus::Completed => true,
            StepStatus::Failed => self.remedied(step),
            _ => false,
        }
    }

    fn remedied(&self, failed: &Step) -> bool {
        failed
            .superseded_by()
            .and_then(|r| self.step(r))
            .is_some_and(|r| {
                r.status() == StepStatus::Completed
                    && r.recovery().is_some_and(|info| info.strategy.is_remedial())
            })
    }

    /// Pending steps whose dependencies are all satisfied, in insertion order.
    pub fn ready_steps(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status() == StepStatus::Pending)
            .filter(|s| s.depends_on().iter().all(|d| self.dependency_satisfied(d)))
            .map(|s| s.id().clone())
            .collect()
    }

    pub fn running_steps(&self) -> Vec<StepId> {
        self.ids_with_status(StepStatus::Running)
    }

    pub fn pending_steps(&self) -> Vec<StepId> {
        self.ids_with_status(StepStatus::Pending)
    }

    fn ids_with_status(&self, status: StepStatus) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status() == status)
            .map(|s| s.id().clone())
            .collect()
    }

    /// Failed steps that were never remedied.
    pub fn unresolved_failures(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status() == StepStatus::Failed && !self.remedied(s))
            .map(|s| s.id().clone())
            .collect()
    }

    /// Nothing is running and nothing more can become ready.
    pub fn is_settled(&self) -> bool {
        self.running_steps().is_empty() && self.ready_steps().is_empty()
    }

    /// Outcome of a settled plan. Remaining `Pending` steps are blocked.
    pub fn outcome(&self) -> PlanOutcome {
        let failed = self.unresolved_failures();
        let blocked = self.pending_steps();
        if failed.is_empty() && blocked.is_empty() && self.running_steps().is_empty() {
            PlanOutcome::Completed
        } else {
            PlanOutcome::Incomplete { failed, blocked }
        }
    }

    /// Steps that list `id` as a direct dependency.
    pub fn dependents_of(&self, id: &StepId) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.depends_on().contains(id))
            .map(|s| s.id().clone())
            .collect()
    }

    /// Whether `from` reaches `target` by following dependency edges.
    pub fn depends_transitively(&self, from: &StepId, target: &StepId) -> bool {
        let mut stack = vec![from.clone()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let Some(step) = self.step(&current) else {
                continue;
            };
            for dep in step.depends_on() {
                if dep == target {
                    return true;
                }
                stack.push(dep.clone());
            }
        }
        false
    }

    /// Insert a recovery step for `failed` and rewire its dependents.
    ///
    /// The recovery step takes `depends_on`; every direct dependent of
    /// `failed` also gains a dependency on it. Rejected if any recovery
    /// dependency already (transitively) depends on one of those dependents.
    pub(crate) fn splice_recovery(
        &mut self,
        failed: &StepId,
        tool: impl Into<String>,
        params: Params,
        description: impl Into<String>,
        depends_on: Vec<StepId>,
        recovery: RecoveryInfo,
    ) -> PlanResult<StepId> {
        let failed_pos = self.position(failed)?;
        let dependents = self.dependents_of(failed);

        for dep in &depends_on {
            if self.step(dep).is_none() {
                return Err(PlanningError::UnknownDependency {
                    step: failed.clone(),
                    dependency: dep.clone(),
                });
            }
            for dependent in &dependents {
                if dep == dependent || self.depends_transitively(dep, dependent) {
                    return Err(PlanningError::WouldCreateCycle {
                        step: failed.clone(),
                        via: dependent.clone(),
                    });
                }
            }
        }

        let id = self.next_id();
        let mut step = Step::new(id.clone(), tool, params, description, depends_on);
        step.set_recovery(recovery);

        let mut next = self.clone();
        next.steps.push(step);
        next.steps[failed_pos].set_superseded_by(id.clone());
        for dependent in &dependents {
            let pos = next.position(dependent)?;
            next.steps[pos].add_dependency(id.clone());
        }
        next.validate()?;

        *self = next;
        Ok(id)
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            task: self.task.clone(),
            steps: self
                .steps
                .iter()
                .enumerate()
                .map(|(i, s)| StepSummary {
                    index: i + 1,
                    id: s.id().clone(),
                    status: s.status(),
                    tool_name: s.tool().to_string(),
                    description: s.description().to_string(),
                    depends_on: s.depends_on().to_vec(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::step::RecoveryStrategy;

    fn chain() -> ExecutionPlan {
        let mut plan = ExecutionPlan::new("test", Params::new());
        let s1 = plan.add_step("search", Params::new(), "find", vec![]).unwrap();
        let s2 = plan
            .add_step("file_read", Params::new(), "read", vec![s1])
            .unwrap();
        plan.add_step("file_write", Params::new(), "write", vec![s2])
            .unwrap();
        plan
    }

    #[test]
    fn test_add_step_assigns_sequential_ids() {
        let plan = chain();
        let ids: Vec<_> = plan.steps().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["step_1", "step_2", "step_3"]);
    }

    #[test]
    fn test_add_step_rejects_unknown_dependency() {
        let mut plan = ExecutionPlan::new("t", Params::new());
        let err = plan
            .add_step("shell", Params::new(), "x", vec![StepId::from("step_9")])
            .unwrap_err();
        assert!(matches!(err, PlanningError::UnknownDependency { .. }));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_from_steps_detects_cycle() {
        let a = Step::new(StepId::from("a"), "shell", Params::new(), "a", vec!["b".into()]);
        let b = Step::new(StepId::from("b"), "shell", Params::new(), "b", vec!["a".into()]);
        let err = ExecutionPlan::from_steps("t", Params::new(), vec![a, b]).unwrap_err();
        assert!(matches!(err, PlanningError::CycleDetected { .. }));
    }

    #[test]
    fn test_from_steps_detects_self_loop_and_duplicates() {
        let a = Step::new(StepId::from("a"), "shell", Params::new(), "a", vec!["a".into()]);
        let err = ExecutionPlan::from_steps("t", Params::new(), vec![a]).unwrap_err();
        assert!(matches!(err, PlanningError::SelfDependency { .. }));

        let a1 = Step::new(StepId::from("a"), "shell", Params::new(), "a", vec![]);
        let a2 = Step::new(StepId::from("a"), "shell", Params::new(), "a", vec![]);
        let err = ExecutionPlan::from_steps("t", Params::new(), vec![a1, a2]).unwrap_err();
        assert!(matches!(err, PlanningError::DuplicateStep { .. }));
    }

    #[test]
    fn test_ready_steps_follow_dependencies() {
        let mut plan = chain();
        assert_eq!(plan.ready_steps(), vec![StepId::nth(1)]);

        plan.mark_running(&StepId::nth(1)).unwrap();
        assert!(plan.ready_steps().is_empty());
        plan.mark_completed(&StepId::nth(1), Value::Null).unwrap();
        assert_eq!(plan.ready_steps(), vec![StepId::nth(2)]);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut plan = chain();
        let id = StepId::nth(1);
        let err = plan.mark_completed(&id, Value::Null).unwrap_err();
        assert!(matches!(err, PlanningError::InvalidTransition { .. }));

        plan.mark_running(&id).unwrap();
        plan.mark_failed(&id, "boom").unwrap();
        assert!(plan.mark_running(&id).is_err());
        assert_eq!(plan.step(&id).unwrap().error(), Some("boom"));
    }

    #[test]
    fn test_outcome_reports_failed_and_blocked() {
        let mut plan = chain();
        plan.mark_running(&StepId::nth(1)).unwrap();
        plan.mark_failed(&StepId::nth(1), "nope").unwrap();
        assert!(plan.is_settled());
        match plan.outcome() {
            PlanOutcome::Incomplete { failed, blocked } => {
                assert_eq!(failed, vec![StepId::nth(1)]);
                assert_eq!(blocked, vec![StepId::nth(2), StepId::nth(3)]);
            }
            other => panic!("expected Incomplete, got {other:?}"),
        }
    }

    #[test]
    fn test_splice_rewires_dependents_and_remedial_completion_unblocks() {
        let mut plan = chain();
        let s2 = StepId::nth(2);
        plan.mark_running(&StepId::nth(1)).unwrap();
        plan.mark_completed(&StepId::nth(1), Value::Null).unwrap();
        plan.mark_running(&s2).unwrap();
        plan.mark_failed(&s2, "file not found").unwrap();

        let rec = plan
            .splice_recovery(
                &s2,
                "search",
                Params::new(),
                "locate",
                vec![StepId::nth(1)],
                RecoveryInfo {
                    supersedes: s2.clone(),
                    strategy: RecoveryStrategy::Search,
                },
            )
            .unwrap();
        assert_eq!(rec, StepId::nth(4));
        assert_eq!(plan.step(&s2).unwrap().superseded_by(), Some(&rec));
        assert!(plan
            .step(&StepId::nth(3))
            .unwrap()
            .depends_on()
            .contains(&rec));

        assert_eq!(plan.ready_steps(), vec![rec.clone()]);
        plan.mark_running(&rec).unwrap();
        plan.mark_completed(&rec, Value::Null).unwrap();
        assert_eq!(plan.ready_steps(), vec![StepId::nth(3)]);
    }

    #[test]
    fn test_splice_rejects_recovery_that_closes_a_cycle() {
        let mut plan = chain();
        let s2 = StepId::nth(2);
        let s4 = plan
            .add_step("shell", Params::new(), "after write", vec![StepId::nth(3)])
            .unwrap();
        plan.mark_running(&StepId::nth(1)).unwrap();
        plan.mark_completed(&StepId::nth(1), Value::Null).unwrap();
        plan.mark_running(&s2).unwrap();
        plan.mark_failed(&s2, "file not found").unwrap();
        let before = plan.clone();

        // step_4 reaches step_3, which would gain a dependency on the recovery.
        let err = plan
            .splice_recovery(
                &s2,
                "search",
                Params::new(),
                "locate",
                vec![s4],
                RecoveryInfo {
                    supersedes: s2.clone(),
                    strategy: RecoveryStrategy::Search,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PlanningError::WouldCreateCycle { ref step, ref via }
                if *step == s2 && *via == StepId::nth(3)
        ));
        assert_eq!(plan, before);
        assert!(plan.step(&s2).unwrap().superseded_by().is_none());

        let err = plan
            .splice_recovery(
                &s2,
                "search",
                Params::new(),
                "locate",
                vec![StepId::nth(3)],
                RecoveryInfo {
                    supersedes: s2.clone(),
                    strategy: RecoveryStrategy::Search,
                },
            )
            .unwrap_err();
        assert!(matches!(err, PlanningError::WouldCreateCycle { .. }));
        assert_eq!(plan, before);
    }

    #[test]
    fn test_depends_transitively() {
        let plan = chain();
        assert!(plan.depends_transitively(&StepId::nth(3), &StepId::nth(1)));
        assert!(!plan.depends_transitively(&StepId::nth(1), &StepId::nth(3)));
    }

    #[test]
    fn test_summary_rows_and_stable_digest() {
        let plan = chain();
        let summary = plan.summary();
        assert_eq!(summary.steps.len(), 3);
        assert_eq!(summary.steps[2].index, 3);
        assert_eq!(summary.steps[2].depends_on, vec![StepId::nth(2)]);

        let json = serde_json::to_value(&summary.steps[1]).unwrap();
        assert_eq!(json["toolName"], "file_read");
        assert_eq!(json["dependsOn"][0], "step_1");

        assert_eq!(summary.digest(), chain().summary().digest());
        assert_eq!(summary.digest().len(), 64);
    }
}
