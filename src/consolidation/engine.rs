use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Consolidation, ConsolidationStatus, ConsolidationStore, FileReport, MergeFailure, MergePlan,
    MergePreview, MergeResult, MergeStrategy, PlannedFile, Resolution, ResolutionAction,
    WorkerDiffs, conflict, diff::parse_unified_diff, score,
};
use crate::config::ConsolidationConfig;
use crate::error::{MusterError, Result};
use crate::events::{EventBus, OrchEvent};
use crate::registry::Registry;
use crate::vcs::VcsAdapter;

pub struct Consolidator {
    vcs: Arc<dyn VcsAdapter>,
    registry: Arc<Registry>,
    events: EventBus,
    store: ConsolidationStore,
    /// Worktree root relative to the project, shared with the supervisor.
    worktree_root: String,
    write_lock: Mutex<()>,
}

impl Consolidator {
    pub fn new(
        config: &ConsolidationConfig,
        store_path: PathBuf,
        worktree_root: String,
        vcs: Arc<dyn VcsAdapter>,
        registry: Arc<Registry>,
        events: EventBus,
    ) -> Self {
        Self {
            vcs,
            registry,
            events,
            store: ConsolidationStore::new(store_path, Duration::from_secs(config.cache_ttl_secs)),
            worktree_root,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn create(
        &self,
        id: Option<String>,
        project: PathBuf,
        base_revision: String,
        participants: Vec<String>,
        strategy: Option<MergeStrategy>,
    ) -> Result<Consolidation> {
        if participants.is_empty() {
            return Err(MusterError::Validation(
                "consolidation requires at least one participant".into(),
            ));
        }
        for participant in &participants {
            if self.registry.get(participant).is_none() {
                return Err(MusterError::NotFound(format!("worker {participant}")));
            }
        }

        let _guard = self.write_lock.lock().await;
        let mut records = self.store.load().await;

        if let Some(id) = &id
            && let Some(existing) = records.iter().find(|c| &c.id == id)
        {
            return Ok(existing.clone());
        }

        let mut consolidation = Consolidation::new(
            id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            project,
            base_revision,
            participants,
        );
        if let Some(strategy) = strategy {
            consolidation.strategy = strategy;
        }

        records.push(consolidation.clone());
        self.persist(&records).await;
        info!(consolidation_id = %consolidation.id, "Consolidation created");
        Ok(consolidation)
    }

    pub async fn list(&self) -> Vec<Consolidation> {
        self.store.load().await
    }

    pub async fn get(&self, id: &str) -> Result<Consolidation> {
        self.store
            .load()
            .await
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| MusterError::NotFound(format!("consolidation {id}")))
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.store.load().await;
        let before = records.len();
        records.retain(|c| c.id != id);
        if records.len() == before {
            return Err(MusterError::NotFound(format!("consolidation {id}")));
        }
        self.persist(&records).await;
        Ok(())
    }

    /// Diff every participant against the base revision, score the changed
    /// files, and classify pairwise conflicts.
    pub async fn analyze(&self, id: &str) -> Result<MergePreview> {
        let consolidation = self.get(id).await?;
        if consolidation.status.rank() >= ConsolidationStatus::Ready.rank() {
            return Err(MusterError::Conflict(format!(
                "consolidation {id} is already {}",
                consolidation.status.as_str()
            )));
        }

        self.transition(id, ConsolidationStatus::Analyzing, |_| {}).await?;
        self.events.emit(OrchEvent::ConsolidationAnalyzing { id: id.to_string() });

        let mut diffs: WorkerDiffs = HashMap::new();
        for participant in &consolidation.participants {
            let worker = self
                .registry
                .get(participant)
                .ok_or_else(|| MusterError::NotFound(format!("worker {participant}")))?;
            let raw = self
                .vcs
                .diff_against_base(&worker.worktree_path, &consolidation.base_revision)
                .await?;
            diffs.insert(participant.clone(), parse_unified_diff(&raw));
        }

        let preview = self.build_preview(&consolidation, &diffs).await;

        let stored = preview.clone();
        self.transition(id, ConsolidationStatus::Analyzed, move |c| {
            c.preview = Some(stored);
        })
        .await?;

        self.events.emit(OrchEvent::ConsolidationAnalyzed {
            id: id.to_string(),
            total_files: preview.total_files,
            conflicts: preview.conflicts.len(),
        });
        info!(
            consolidation_id = %id,
            files = preview.total_files,
            conflicts = preview.conflicts.len(),
            "Consolidation analyzed"
        );
        Ok(preview)
    }

    async fn build_preview(
        &self,
        consolidation: &Consolidation,
        diffs: &WorkerDiffs,
    ) -> MergePreview {
        // Per-worker test-to-code ratio over the whole change set.
        let mut test_ratio: HashMap<String, f64> = HashMap::new();
        for (worker, file_diffs) in diffs {
            let (mut test_lines, mut code_lines) = (0usize, 0usize);
            for d in file_diffs {
                if score::is_test_file(&d.path) {
                    test_lines += d.added_lines;
                } else {
                    code_lines += d.added_lines;
                }
            }
            test_ratio.insert(
                worker.clone(),
                test_lines as f64 / code_lines.max(1) as f64,
            );
        }

        // Code-quality contribution per (path, worker), from the worker's
        // version of the file.
        let mut contributions: HashMap<String, Vec<(String, f64, score::FileMetrics)>> =
            HashMap::new();
        for (worker, file_diffs) in diffs {
            let worktree = self
                .registry
                .get(worker)
                .map(|w| w.worktree_path)
                .unwrap_or_default();
            for d in file_diffs {
                let content = if d.is_deleted {
                    String::new()
                } else {
                    tokio::fs::read_to_string(worktree.join(&d.path))
                        .await
                        .unwrap_or_else(|_| d.added().collect::<Vec<_>>().join("\n"))
                };
                let metrics = score::compute_metrics(&content);
                let quality = score::code_quality(&metrics);
                contributions
                    .entry(d.path.clone())
                    .or_default()
                    .push((worker.clone(), quality, metrics));
            }
        }

        let mut files = Vec::new();
        for (worker, file_diffs) in diffs {
            for d in file_diffs {
                let per_path = contributions.get(&d.path);
                let quality_values: Vec<f64> = per_path
                    .map(|v| v.iter().map(|(_, q, _)| *q).collect())
                    .unwrap_or_default();
                let (code_quality, metrics) = per_path
                    .and_then(|v| v.iter().find(|(w, _, _)| w == worker))
                    .map(|(_, q, m)| (*q, m.clone()))
                    .unwrap_or_default();

                let is_test = score::is_test_file(&d.path);
                let ratio = test_ratio.get(worker).copied().unwrap_or(0.0);
                let quality = score::total_score(
                    score::consistency(&quality_values),
                    score::test_coverage(ratio, is_test),
                    code_quality,
                    score::efficiency(d.net_change()),
                );

                files.push(FileReport {
                    path: d.path.clone(),
                    source_worker: worker.clone(),
                    score: quality,
                    metrics,
                    is_test_file: is_test,
                    test_line_ratio: ratio,
                });
            }
        }
        files.sort_by(|a, b| (&a.path, &a.source_worker).cmp(&(&b.path, &b.source_worker)));

        let conflicts = conflict::detect_conflicts(&consolidation.participants, diffs);
        let recommended = conflict::recommended_strategy(&conflicts);

        let all_paths: BTreeSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
        let conflicting_paths: BTreeSet<&str> =
            conflicts.iter().map(|c| c.path.as_str()).collect();

        MergePreview {
            total_files: all_paths.len(),
            auto_mergeable: all_paths.len() - conflicting_paths.len(),
            conflicting: conflicting_paths.len(),
            files,
            conflicts,
            recommended,
        }
    }

    /// Validate per-path resolutions against the preview and produce the
    /// deterministic merge plan.
    pub async fn resolve(&self, id: &str, resolutions: Vec<Resolution>) -> Result<MergePlan> {
        let consolidation = self.get(id).await?;
        if consolidation.status == ConsolidationStatus::Completed {
            return Err(MusterError::Conflict(format!(
                "consolidation {id} is already completed"
            )));
        }
        let preview = consolidation.preview.clone().ok_or_else(|| {
            MusterError::Conflict(format!("consolidation {id} has not been analyzed"))
        })?;

        let known_paths: BTreeSet<&str> =
            preview.files.iter().map(|f| f.path.as_str()).collect();
        for resolution in &resolutions {
            if !known_paths.contains(resolution.path.as_str()) {
                return Err(MusterError::Validation(format!(
                    "path {} does not appear in the preview",
                    resolution.path
                )));
            }
        }

        let mut planned = Vec::new();
        for resolution in resolutions {
            match resolution.action {
                ResolutionAction::Reject => continue,
                ResolutionAction::Manual => {
                    let content = resolution.content.ok_or_else(|| {
                        MusterError::Validation(format!(
                            "manual resolution for {} requires content",
                            resolution.path
                        ))
                    })?;
                    planned.push(PlannedFile {
                        path: resolution.path,
                        action: ResolutionAction::Manual,
                        source_worker: None,
                        content: Some(content),
                    });
                }
                ResolutionAction::Union => {
                    let content = self
                        .union_content(&consolidation, &preview, &resolution.path)
                        .await;
                    planned.push(PlannedFile {
                        path: resolution.path,
                        action: ResolutionAction::Union,
                        source_worker: None,
                        content: Some(content?),
                    });
                }
                action => {
                    let source = self.pick_source(
                        &consolidation,
                        &preview,
                        &resolution.path,
                        action,
                        resolution.source_worker,
                    )?;
                    planned.push(PlannedFile {
                        path: resolution.path,
                        action,
                        source_worker: Some(source),
                        content: None,
                    });
                }
            }
        }
        planned.sort_by(|a, b| a.path.cmp(&b.path));
        let plan = MergePlan { files: planned };

        let stored = plan.clone();
        self.transition(id, ConsolidationStatus::Ready, move |c| {
            c.plan = Some(stored);
        })
        .await?;

        self.events.emit(OrchEvent::ConsolidationReady {
            id: id.to_string(),
            planned_files: plan.files.len(),
        });
        Ok(plan)
    }

    fn pick_source(
        &self,
        consolidation: &Consolidation,
        preview: &MergePreview,
        path: &str,
        action: ResolutionAction,
        explicit: Option<String>,
    ) -> Result<String> {
        if let Some(source) = explicit {
            if !consolidation.participants.contains(&source) {
                return Err(MusterError::Validation(format!(
                    "{source} is not a participant"
                )));
            }
            return Ok(source);
        }

        let touching: Vec<&FileReport> =
            preview.files.iter().filter(|f| f.path == path).collect();
        let conflict_pair = preview
            .conflicts
            .iter()
            .find(|c| c.path == path)
            .map(|c| c.workers.clone());

        let chosen = match action {
            ResolutionAction::KeepOurs => conflict_pair
                .as_ref()
                .map(|(ours, _)| ours.clone())
                .or_else(|| touching.first().map(|f| f.source_worker.clone())),
            ResolutionAction::KeepTheirs => conflict_pair
                .as_ref()
                .map(|(_, theirs)| theirs.clone())
                .or_else(|| touching.last().map(|f| f.source_worker.clone())),
            // Voting and plain merge pick the highest-quality version.
            _ => touching
                .iter()
                .max_by(|a, b| {
                    a.score
                        .total
                        .partial_cmp(&b.score.total)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|f| f.source_worker.clone()),
        };

        chosen.ok_or_else(|| {
            MusterError::Validation(format!("no source worker available for {path}"))
        })
    }

    /// Union resolution for import/export conflicts: the first side's file
    /// plus the second side's added import/export lines that are missing.
    async fn union_content(
        &self,
        consolidation: &Consolidation,
        preview: &MergePreview,
        path: &str,
    ) -> Result<String> {
        let pair = preview
            .conflicts
            .iter()
            .find(|c| c.path == path)
            .map(|c| c.workers.clone())
            .or_else(|| {
                let touching: Vec<&FileReport> =
                    preview.files.iter().filter(|f| f.path == path).collect();
                match touching.as_slice() {
                    [a, b, ..] => Some((a.source_worker.clone(), b.source_worker.clone())),
                    _ => None,
                }
            })
            .ok_or_else(|| {
                MusterError::Validation(format!("union needs two versions of {path}"))
            })?;

        let read = |worker: &str| -> Option<PathBuf> {
            self.registry.get(worker).map(|w| w.worktree_path.join(path))
        };
        let ours_path = read(&pair.0)
            .ok_or_else(|| MusterError::NotFound(format!("worker {}", pair.0)))?;
        let theirs_path = read(&pair.1)
            .ok_or_else(|| MusterError::NotFound(format!("worker {}", pair.1)))?;

        let ours = tokio::fs::read_to_string(&ours_path).await.unwrap_or_default();
        let theirs = tokio::fs::read_to_string(&theirs_path)
            .await
            .unwrap_or_default();

        let mut merged = ours.trim_end().to_string();
        for line in theirs.lines() {
            let trimmed = line.trim();
            let is_binding = trimmed.starts_with("import ")
                || trimmed.starts_with("export ")
                || trimmed.starts_with("use ")
                || trimmed.starts_with("pub ");
            if is_binding && !ours.contains(trimmed) {
                merged.push('\n');
                merged.push_str(line);
            }
        }
        merged.push('\n');
        Ok(merged)
    }

    /// Apply the merge plan onto a fresh checkout of the base revision and
    /// commit to the target branch. File-level failures are recorded but do
    /// not abort the export.
    pub async fn export(
        &self,
        id: &str,
        target_branch: &str,
        message: &str,
    ) -> Result<MergeResult> {
        let consolidation = self.get(id).await?;
        if consolidation.status == ConsolidationStatus::Completed {
            if let Some(result) = consolidation.result {
                return Ok(result);
            }
        }
        if consolidation.status != ConsolidationStatus::Ready {
            return Err(MusterError::Conflict(format!(
                "consolidation {id} is {}, expected ready",
                consolidation.status.as_str()
            )));
        }
        let plan = consolidation
            .plan
            .clone()
            .ok_or_else(|| MusterError::Conflict(format!("consolidation {id} has no plan")))?;

        let export_dir = consolidation
            .project
            .join(&self.worktree_root)
            .join(format!("consolidation-{id}"));
        self.vcs
            .worktree_add(
                &consolidation.project,
                &export_dir,
                target_branch,
                &consolidation.base_revision,
            )
            .await?;

        let mut result = MergeResult::default();
        for planned in &plan.files {
            match self
                .apply_planned_file(&consolidation, planned, &export_dir)
                .await
            {
                Ok(()) => result.merged.push(planned.path.clone()),
                Err(e) => {
                    warn!(path = %planned.path, error = %e, "Merge plan entry failed");
                    result.failed.push(MergeFailure {
                        path: planned.path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Err(e) = self.vcs.stage_all(&export_dir).await {
            warn!(error = %e, "Failed to stage merged files");
        }
        match self.vcs.commit(&export_dir, message).await {
            Ok(commit) => result.commit = commit,
            Err(e) => warn!(error = %e, "Merge commit failed"),
        }

        if let Err(e) = self
            .vcs
            .worktree_remove(&consolidation.project, &export_dir)
            .await
        {
            debug!(error = %e, "Export worktree cleanup failed");
        }

        let completed = result.failed.is_empty();
        let stored = result.clone();
        if completed {
            self.transition(id, ConsolidationStatus::Completed, move |c| {
                c.result = Some(stored);
            })
            .await?;
            self.events.emit(OrchEvent::ConsolidationCompleted {
                id: id.to_string(),
                merged: result.merged.len(),
                commit: result.commit.clone(),
            });
        } else {
            // Keep the record at ready so the caller can retry after fixing
            // the failures; the partial result is still recorded.
            self.transition(id, ConsolidationStatus::Ready, move |c| {
                c.result = Some(stored);
            })
            .await?;
            self.events.emit(OrchEvent::ConsolidationFailed {
                id: id.to_string(),
                error: format!("{} file(s) failed to merge", result.failed.len()),
            });
        }

        info!(
            consolidation_id = %id,
            merged = result.merged.len(),
            failed = result.failed.len(),
            commit = ?result.commit,
            "Consolidation export finished"
        );
        Ok(result)
    }

    async fn apply_planned_file(
        &self,
        consolidation: &Consolidation,
        planned: &PlannedFile,
        export_dir: &Path,
    ) -> Result<()> {
        let target = export_dir.join(&planned.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Some(content) = &planned.content {
            tokio::fs::write(&target, content).await?;
            return Ok(());
        }

        let source = planned.source_worker.as_ref().ok_or_else(|| {
            MusterError::Validation(format!("{} has no source worker", planned.path))
        })?;
        let worker = self
            .registry
            .get(source)
            .ok_or_else(|| MusterError::NotFound(format!("worker {source}")))?;
        if !consolidation.participants.contains(source) {
            return Err(MusterError::Validation(format!(
                "{source} is not a participant"
            )));
        }

        let source_path = worker.worktree_path.join(&planned.path);
        let content = tokio::fs::read(&source_path).await?;
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    /// Monotone status transition plus a record mutation, persisted under
    /// the write lock.
    async fn transition(
        &self,
        id: &str,
        status: ConsolidationStatus,
        mutate: impl FnOnce(&mut Consolidation),
    ) -> Result<Consolidation> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.store.load().await;
        let record = records
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| MusterError::NotFound(format!("consolidation {id}")))?;

        if status.rank() >= record.status.rank() {
            record.status = status;
        }
        mutate(record);
        record.updated_at = Utc::now();
        let updated = record.clone();

        self.persist(&records).await;
        Ok(updated)
    }

    async fn persist(&self, records: &[Consolidation]) {
        if let Err(e) = self.store.save(records).await {
            warn!(error = %e, "Consolidation persistence failed, in-memory state is authoritative");
        }
    }
}
