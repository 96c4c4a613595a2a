//! Structural and parameter validation for workflow definitions.
//!
//! Validation never panics and never errors: every problem becomes a
//! human-readable message in a [`ValidationReport`]. Problems attributable
//! to a single task also record that task's ID so the orchestrator can
//! fault its run.

use std::collections::{HashMap, HashSet};

use helix_types::workflow::{Stage, TaskInstance, TaskTemplate, WorkflowDefinition};
use serde::Serialize;
use uuid::Uuid;

use super::plan::dependency_order;

// ---------------------------------------------------------------------------
// ValidationReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub messages: Vec<String>,
    /// Tasks with at least one task-level problem, in discovery order.
    pub invalid_tasks: Vec<Uuid>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            messages: Vec::new(),
            invalid_tasks: Vec::new(),
        }
    }

    /// Record a problem not attributable to one task.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.messages.push(message.into());
    }

    /// Record a problem with one task.
    pub fn fail_task(&mut self, task_id: Uuid, message: impl Into<String>) {
        self.fail(message);
        if !self.invalid_tasks.contains(&task_id) {
            self.invalid_tasks.push(task_id);
        }
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.valid &= other.valid;
        self.messages.extend(other.messages);
        for id in other.invalid_tasks {
            if !self.invalid_tasks.contains(&id) {
                self.invalid_tasks.push(id);
            }
        }
    }

    /// Messages concatenated for a single error field.
    pub fn summary(&self) -> String {
        self.messages.join("; ")
    }
}

// ---------------------------------------------------------------------------
// Task level
// ---------------------------------------------------------------------------

/// Validate a task instance against its template.
pub fn validate_task(task: &TaskInstance, template: &TaskTemplate) -> ValidationReport {
    let mut report = ValidationReport::ok();
    let name = task.name.as_str();

    if task.template_id != template.id {
        report.fail_task(
            task.id,
            format!(
                "task '{name}' references template {} but was checked against {}",
                task.template_id, template.id
            ),
        );
    }

    if task.tenant_id != template.tenant_id {
        report.fail_task(
            task.id,
            format!(
                "task '{name}' belongs to tenant {} but template '{}' belongs to tenant {}",
                task.tenant_id, template.name, template.tenant_id
            ),
        );
    }

    for spec in template.parameters.iter().filter(|p| p.required) {
        match task.parameters.get(&spec.name) {
            None | Some(serde_json::Value::Null) => report.fail_task(
                task.id,
                format!("task '{name}' is missing required parameter '{}'", spec.name),
            ),
            Some(_) => {}
        }
    }

    for (key, value) in &task.parameters {
        match template.parameter(key) {
            None => report.fail_task(
                task.id,
                format!(
                    "task '{name}' supplies unknown parameter '{key}' (template '{}')",
                    template.name
                ),
            ),
            Some(spec) if !value.is_null() && !spec.param_type.accepts(value) => report
                .fail_task(
                    task.id,
                    format!(
                        "task '{name}' parameter '{key}' must be of type {}",
                        spec.param_type
                    ),
                ),
            Some(_) => {}
        }
    }

    if let Some(retry) = &task.retry {
        if retry.max_attempts < 1 {
            report.fail_task(
                task.id,
                format!("task '{name}' retry max_attempts must be at least 1"),
            );
        }
        if !(0.0..=1.0).contains(&retry.backoff_coefficient) {
            report.fail_task(
                task.id,
                format!("task '{name}' retry backoff_coefficient must be within [0, 1]"),
            );
        }
    }

    if task.timeout_secs == Some(0) {
        report.fail_task(task.id, format!("task '{name}' timeout_secs must be positive"));
    }

    report
}

// ---------------------------------------------------------------------------
// Stage level
// ---------------------------------------------------------------------------

/// Validate the structural rules of one stage.
pub fn validate_stage(stage: &Stage) -> ValidationReport {
    let mut report = ValidationReport::ok();

    if stage.tasks.is_empty() {
        report.fail(format!("stage '{}' has no tasks", stage.name));
        return report;
    }

    let mut seen = HashSet::new();
    for task in &stage.tasks {
        if !seen.insert(task.id) {
            report.fail_task(
                task.id,
                format!("stage '{}' declares task {} more than once", stage.name, task.id),
            );
        }
    }

    let position: HashMap<Uuid, usize> = stage
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id, i))
        .collect();

    for (i, task) in stage.tasks.iter().enumerate() {
        for dep in &task.depends_on {
            let Some(&dep_pos) = position.get(dep) else {
                continue;
            };
            if stage.run_in_parallel {
                report.fail_task(
                    task.id,
                    format!(
                        "task '{}' depends on sibling {dep} in parallel stage '{}'",
                        task.name, stage.name
                    ),
                );
            } else if dep_pos >= i {
                report.fail_task(
                    task.id,
                    format!(
                        "task '{}' depends on {dep}, which is not declared before it in stage '{}'",
                        task.name, stage.name
                    ),
                );
            }
        }
    }

    report
}

// ---------------------------------------------------------------------------
// Workflow level
// ---------------------------------------------------------------------------

/// Validate a whole definition against the template catalog.
pub fn validate_workflow(
    definition: &WorkflowDefinition,
    templates: &HashMap<Uuid, TaskTemplate>,
) -> ValidationReport {
    let mut report = ValidationReport::ok();

    if definition.name.trim().is_empty() {
        report.fail("workflow name must not be empty");
    }
    if definition.stages.is_empty() {
        report.fail(format!("workflow '{}' has no stages", definition.name));
    }

    let mut stage_ids = HashSet::new();
    let mut task_ids = HashSet::new();
    // task id -> owning stage priority and stage id
    let mut owners: HashMap<Uuid, (i64, Uuid)> = HashMap::new();

    for stage in &definition.stages {
        if stage.priority < 0 {
            report.fail(format!(
                "stage '{}' has negative priority {}",
                stage.name, stage.priority
            ));
        }
        if !stage_ids.insert(stage.id) {
            report.fail(format!("stage id {} is declared more than once", stage.id));
        }
        report.merge(validate_stage(stage));

        for task in &stage.tasks {
            if !task_ids.insert(task.id) && owners.get(&task.id).map(|o| o.1) != Some(stage.id) {
                report.fail_task(
                    task.id,
                    format!("task id {} is declared in more than one stage", task.id),
                );
            }
            owners.entry(task.id).or_insert((stage.priority, stage.id));

            if task.tenant_id != definition.tenant_id {
                report.fail_task(
                    task.id,
                    format!(
                        "task '{}' belongs to tenant {} but workflow '{}' belongs to tenant {}",
                        task.name, task.tenant_id, definition.name, definition.tenant_id
                    ),
                );
            }

            match templates.get(&task.template_id) {
                Some(template) => {
                    if template.tenant_id != definition.tenant_id {
                        report.fail_task(
                            task.id,
                            format!(
                                "template '{}' belongs to tenant {} but workflow '{}' belongs to tenant {}",
                                template.name,
                                template.tenant_id,
                                definition.name,
                                definition.tenant_id
                            ),
                        );
                    }
                    report.merge(validate_task(task, template));
                }
                None => report.fail_task(
                    task.id,
                    format!(
                        "task '{}' references unknown template {}",
                        task.name, task.template_id
                    ),
                ),
            }
        }
    }

    for stage in &definition.stages {
        for task in &stage.tasks {
            for dep in &task.depends_on {
                match owners.get(dep) {
                    None => report.fail_task(
                        task.id,
                        format!("task '{}' depends on unknown task {dep}", task.name),
                    ),
                    Some(&(_, dep_stage)) if dep_stage == stage.id => {}
                    Some(&(dep_priority, _)) if dep_priority < stage.priority => {}
                    Some(_) => report.fail_task(
                        task.id,
                        format!(
                            "task '{}' depends on {dep}, which does not run in an earlier stage",
                            task.name
                        ),
                    ),
                }
            }
        }
    }

    if let Err(node) = dependency_order(definition) {
        let name = definition
            .tasks()
            .find(|(_, t)| t.id == node)
            .map(|(_, t)| t.name.clone())
            .unwrap_or_else(|| node.to_string());
        report.fail_task(node, format!("dependency cycle detected involving task '{name}'"));
    }

    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
