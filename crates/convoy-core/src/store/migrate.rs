//! One-off consolidation of legacy task-list documents into a single id space.
//!
//! Legacy documents look like `{"tasks": {"<old id>": {...}}}` and several of them may
//! reuse the same ids. Migration runs in two passes:
//! 1. create one record per legacy task, renaming ids that collide across sources;
//! 2. rewire dependencies and subtasks through the per-source id map, dropping
//!    references to unknown tasks and edges that would close a cycle.
//!
//! Every rename and dropped reference is reported; nothing is merged silently.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{Priority, TaskId, TaskRecord, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use crate::store::{DependencyGraph, Snapshot, TaskStore};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyDocument {
    #[serde(default)]
    pub tasks: BTreeMap<String, LegacyTask>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyTask {
    pub title: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    pub status: Option<String>,
    pub priority: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub completion_percentage: Option<f64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// One legacy document and the name used to disambiguate its ids.
#[derive(Debug, Clone)]
pub struct LegacySource {
    pub name: String,
    pub document: LegacyDocument,
}

impl LegacySource {
    pub fn from_json(name: impl Into<String>, raw: &str) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            document: serde_json::from_str(raw)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationIssue {
    pub source: String,
    pub task: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub total: usize,
    pub migrated: usize,
    pub renamed: Vec<MigrationIssue>,
    pub failed: Vec<MigrationIssue>,
    pub dropped_references: Vec<MigrationIssue>,
}

impl MigrationReport {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.migrated as f64 / self.total as f64 * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub snapshot: Snapshot,
    pub report: MigrationReport,
}

/// Source names key the id maps and suffix renamed ids, so they must be unique.
pub fn migrate(sources: &[LegacySource], now: DateTime<Utc>) -> Result<Migration> {
    let mut names = HashSet::new();
    if let Some(dup) = sources.iter().find(|s| !names.insert(s.name.as_str())) {
        return Err(Error::validation(format!(
            "legacy source name {} is used more than once",
            dup.name
        )));
    }

    let mut report = MigrationReport::default();
    let mut store = TaskStore::new();
    let mut graph = DependencyGraph::new();
    let mut id_maps: HashMap<&str, HashMap<&str, TaskId>> = HashMap::new();

    // First pass: records without relationships.
    for source in sources {
        let map = id_maps.entry(source.name.as_str()).or_default();
        for (old_id, legacy) in &source.document.tasks {
            report.total += 1;
            let issue = |detail: String| MigrationIssue {
                source: source.name.clone(),
                task: old_id.clone(),
                detail,
            };
            if old_id.trim().is_empty() {
                report.failed.push(issue("blank task id".into()));
                continue;
            }
            let mut new_id = TaskId::new(old_id.as_str());
            if store.contains(&new_id) {
                let renamed = TaskId::new(format!("{old_id}-{}", source.name));
                if store.contains(&renamed) {
                    report
                        .failed
                        .push(issue(format!("id collides and {renamed} is taken too")));
                    continue;
                }
                report.renamed.push(issue(format!("renamed to {renamed}")));
                new_id = renamed;
            }
            let record = legacy_record(new_id.clone(), old_id, &source.name, legacy, now);
            store.insert(record)?;
            graph.add_task(new_id.clone());
            map.insert(old_id.as_str(), new_id);
            report.migrated += 1;
        }
    }

    // Second pass: dependencies and subtasks through each source's id map.
    for source in sources {
        let Some(map) = id_maps.get(source.name.as_str()) else {
            continue;
        };
        for (old_id, legacy) in &source.document.tasks {
            let Some(new_id) = map.get(old_id.as_str()) else {
                continue;
            };
            let issue = |detail: String| MigrationIssue {
                source: source.name.clone(),
                task: old_id.clone(),
                detail,
            };
            for dep in &legacy.dependencies {
                let Some(dep_id) = map.get(dep.as_str()) else {
                    report
                        .dropped_references
                        .push(issue(format!("unknown dependency {dep}")));
                    continue;
                };
                match graph.add_dependency(new_id, dep_id) {
                    Ok(()) => {
                        store.require_mut(new_id)?.dependencies.insert(dep_id.clone());
                    }
                    Err(Error::Cycle { path }) => {
                        let path: Vec<&str> = path.iter().map(TaskId::as_str).collect();
                        report.dropped_references.push(issue(format!(
                            "dependency {dep} would close cycle {}",
                            path.join(" -> ")
                        )));
                    }
                    Err(other) => return Err(other),
                }
            }
            for sub in &legacy.subtasks {
                let Some(sub_id) = map.get(sub.as_str()) else {
                    report
                        .dropped_references
                        .push(issue(format!("unknown subtask {sub}")));
                    continue;
                };
                store.require_mut(new_id)?.subtasks.push(sub_id.clone());
                store.require_mut(sub_id)?.parent_id = Some(new_id.clone());
            }
        }
    }

    // Blocked means "waiting on a dependency" and nothing else.
    let waiting: Vec<(TaskId, bool)> = store
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked))
        .map(|t| (t.id.clone(), graph.dependencies_satisfied(&t.id, &store)))
        .collect();
    for (id, satisfied) in waiting {
        let record = store.require_mut(&id)?;
        if satisfied {
            record.status = TaskStatus::Pending;
        } else {
            record.status = TaskStatus::Blocked;
        }
    }

    if !report.failed.is_empty() || !report.dropped_references.is_empty() {
        warn!(
            failed = report.failed.len(),
            dropped = report.dropped_references.len(),
            "migration finished with issues"
        );
    }
    info!(
        total = report.total,
        migrated = report.migrated,
        renamed = report.renamed.len(),
        "migration complete"
    );

    let tasks = store.sorted().into_iter().cloned().collect();
    Ok(Migration {
        snapshot: Snapshot::new(now, tasks, Vec::new()),
        report,
    })
}

fn legacy_record(
    id: TaskId,
    old_id: &str,
    source: &str,
    legacy: &LegacyTask,
    now: DateTime<Utc>,
) -> TaskRecord {
    let title = legacy
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| legacy.name.clone().filter(|n| !n.trim().is_empty()))
        .unwrap_or_else(|| "Untitled Task".to_string());
    let priority = legacy
        .priority
        .as_deref()
        .and_then(|p| p.parse().ok())
        .unwrap_or(Priority::Medium);
    let status = legacy
        .status
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(TaskStatus::Pending);

    let mut spec = TaskSpec::new(id.clone(), title).with_priority(priority);
    spec.description = legacy.description.clone();
    spec.required_capabilities = legacy.required_capabilities.clone();
    spec.tags = legacy.tags.clone();
    spec.metadata = legacy.metadata.clone();
    spec.metadata
        .insert("original_id".into(), serde_json::Value::from(old_id));
    spec.metadata
        .insert("migration_source".into(), serde_json::Value::from(source));
    spec.metadata.insert(
        "migration_date".into(),
        serde_json::Value::from(now.to_rfc3339()),
    );

    let created_at = legacy
        .created_at
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(now);
    let updated_at = legacy
        .updated_at
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(created_at);

    let mut record = TaskRecord::from_spec(id, spec, created_at);
    record.updated_at = updated_at;
    record.progress = legacy
        .completion_percentage
        .filter(|p| p.is_finite())
        .map(|p| p.clamp(0.0, 100.0) as f32)
        .unwrap_or(0.0);
    record.status = match status {
        // no live assignment survives a migration
        TaskStatus::Assigned | TaskStatus::InProgress => TaskStatus::Pending,
        other => other,
    };
    if record.status == TaskStatus::Completed {
        record.progress = 100.0;
        record.completed_at = Some(updated_at);
    }
    record
}

/// RFC 3339, or a naive ISO timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
