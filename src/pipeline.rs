//! Stage orchestration.
//!
//! `Validate → Align → InferTrees → ExtractSubtrees → Compare → Persist`.
//! Every stage fans its items out on the run's [`TaskPool`] and ends on a
//! barrier; the next stage starts only once every unit has reported.
//! Per-item validation failures and missing artifacts shrink the item set,
//! anything else aborts the run before the next stage.
use crate::{
    align::{self, Aligner},
    config::{RunConfig, RunPaths, TreeFormat, TreeMethod},
    error::PipelineError,
    fasta::{self, SequenceStats},
    host,
    matrix::{comparison_count, CandidateMatrix},
    phylo,
    pool::{split_balanced, StageFailure, TaskPool},
    provenance::{Provenance, RunOutcome},
    similarity::{self, ComparisonSummary},
    store::{RecordSink, ResultStore, StoreSummary, StoreWriter, DEFAULT_BATCH_SIZE},
    subtree::{self, Subtree},
    tree_io,
};
use anyhow::{Context, Result};
use chrono::Local;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use thiserror::Error;

pub const DB_NAME: &str = "similarity.db";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Validate,
    Align,
    InferTrees,
    ExtractSubtrees,
    Compare,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Validate => "validate",
            Stage::Align => "align",
            Stage::InferTrees => "infer_trees",
            Stage::ExtractSubtrees => "extract_subtrees",
            Stage::Compare => "compare",
            Stage::Persist => "persist",
        })
    }
}

#[derive(Debug, Error)]
#[error("{stage} stage failed: {cause:#}")]
pub struct StageError {
    pub stage: Stage,
    pub cause: anyhow::Error,
}

impl StageError {
    pub fn new(stage: Stage, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }
}

/// Errors that carry no [`PipelineError`] kind are treated as fatal.
fn is_fatal(e: &anyhow::Error) -> bool {
    e.chain()
        .find_map(|c| c.downcast_ref::<PipelineError>())
        .is_none_or(PipelineError::is_fatal)
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file stem", path.display()))
}

/// An input that passed validation, possibly replaced by its
/// deduplicated copy.
#[derive(Clone, Debug)]
pub struct ValidatedInput {
    pub stats: SequenceStats,
    pub path: PathBuf,
}

/// Everything a run needs, passed explicitly to every stage.
pub struct RunContext {
    pub config: Arc<RunConfig>,
    pub paths: Arc<RunPaths>,
    pub pool: TaskPool,
    /// Workers for splitting one large intersection. Never the stage pool.
    pub nested: Arc<TaskPool>,
    pub batch_size: usize,
    pub db_path: PathBuf,
    /// Overrides the aligner executable for this run.
    pub aligner_program: Option<String>,
    pub keep_scratch: bool,
}

impl RunContext {
    pub fn new(
        config: RunConfig,
        paths: RunPaths,
        workers: usize,
        nested_workers: usize,
    ) -> Result<Self> {
        let pool = TaskPool::new(workers, "stage")?;
        let nested = Arc::new(TaskPool::new(nested_workers, "intersect")?);
        let db_path = paths.similarity.join(DB_NAME);
        Ok(Self {
            config: Arc::new(config),
            paths: Arc::new(paths),
            pool,
            nested,
            batch_size: DEFAULT_BATCH_SIZE,
            db_path,
            aligner_program: None,
            keep_scratch: false,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_aligner_program(mut self, program: impl Into<String>) -> Self {
        self.aligner_program = Some(program.into());
        self
    }

    pub fn with_keep_scratch(mut self, keep: bool) -> Self {
        self.keep_scratch = keep;
        self
    }

    /// Splits `items` into one balanced chunk per worker and runs `work` on
    /// every item. Non-fatal item errors are logged and dropped; fatal ones
    /// fail the stage after the barrier. Results keep input order.
    fn fan_out<T, R, F>(&self, stage: Stage, items: Vec<T>, work: F) -> Result<Vec<R>, StageError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R> + Send + Sync + 'static,
    {
        let t0 = Instant::now();
        let total = items.len();
        if total == 0 {
            info!("{stage}: nothing to do");
            return Ok(Vec::new());
        }
        let work = Arc::new(work);
        let handles: Vec<_> = split_balanced(items, self.pool.workers())
            .into_iter()
            .enumerate()
            .map(|(c, chunk)| {
                let work = Arc::clone(&work);
                self.pool.submit(format!("{stage} chunk {c}"), move || {
                    Ok(chunk.into_iter().map(|item| work(item)).collect::<Vec<_>>())
                })
            })
            .collect();
        let outcomes = TaskPool::await_all(handles).map_err(|e| StageError::new(stage, e))?;

        let mut values = Vec::with_capacity(total);
        let mut fatal = Vec::new();
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Ok(v) => values.push(v),
                Err(e) if is_fatal(&e) => {
                    error!("{stage}: {e:#}");
                    fatal.push(format!("{e:#}"));
                }
                Err(e) => warn!("{stage}: skipping item: {e:#}"),
            }
        }
        if !fatal.is_empty() {
            return Err(StageError::new(stage, StageFailure { failures: fatal, total }));
        }
        info!(
            "{stage}: {}/{total} item(s) in {:>6} ms",
            values.len(),
            t0.elapsed().as_millis()
        );
        Ok(values)
    }

    /// Validates every configured input; invalid files are excluded.
    /// Inputs with repeated ids are replaced by a deduplicated copy.
    pub fn validate(&self) -> Result<Vec<ValidatedInput>, StageError> {
        let input_dir = self.paths.input.clone();
        let unique_dir = self.paths.unique.clone();
        self.fan_out(Stage::Validate, self.config.entradas.clone(), move |name: String| {
            let path = input_dir.join(&name);
            fasta::validate_protein(&path)?;
            let stats = fasta::analyze(&path)?;
            let path = if fasta::has_duplicate_ids(&path)? {
                fasta::remove_duplicates(&path, &unique_dir)?
            } else {
                path
            };
            debug!("{name}: {} record(s)", stats.quantidade);
            Ok(ValidatedInput { stats, path })
        })
    }

    /// Runs the configured aligner once per input into `aligned/{stem}.aln`.
    pub fn align(&self, inputs: Vec<ValidatedInput>) -> Result<Vec<PathBuf>, StageError> {
        let aligner: Aligner = self.config.algorithm;
        let params: Map<String, Value> = self.config.parameters.clone();
        let program = self.aligner_program.clone();
        let out_dir = self.paths.aligned.clone();
        self.fan_out(Stage::Align, inputs, move |input: ValidatedInput| {
            let output = out_dir.join(format!("{}.aln", file_stem(&input.path)?));
            let cmd = aligner.command(program.as_deref(), &params, &input.path, &output);
            align::run(aligner, &cmd, &input.path)?;
            Ok(output)
        })
    }

    /// Infers one tree per alignment into `trees/{stem}.{ext}`.
    pub fn infer_trees(&self, alignments: Vec<PathBuf>) -> Result<Vec<PathBuf>, StageError> {
        let method: TreeMethod = self.config.tree_method;
        let format: TreeFormat = self.config.tree_format;
        let out_dir = self.paths.trees.clone();
        self.fan_out(Stage::InferTrees, alignments, move |aln_path: PathBuf| {
            let stem = file_stem(&aln_path)?;
            let aln = align::read_clustal(&aln_path)?;
            let (text, _) = phylo::infer(&aln, method)
                .with_context(|| format!("infer tree for {}", aln_path.display()))?;
            let out = out_dir.join(format!("{stem}.{}", format.extension()));
            tree_io::write_tree(&out, &text, format)?;
            Ok(out)
        })
    }

    /// Materializes the subtrees of every tree, grouped by tree in input
    /// order.
    pub fn extract_subtrees(&self, trees: Vec<PathBuf>) -> Result<Vec<Subtree>, StageError> {
        let format = self.config.tree_format;
        let out_dir = self.paths.subtrees.clone();
        let per_tree = self.fan_out(Stage::ExtractSubtrees, trees, move |tree: PathBuf| {
            subtree::extract_file(&tree, format, &out_dir)
        })?;
        Ok(per_tree.into_iter().flatten().collect())
    }

    /// Fresh result table behind its writer thread.
    pub fn open_store(&self) -> Result<StoreWriter, StageError> {
        let store = ResultStore::open_fresh(&self.db_path, self.batch_size)
            .map_err(|e| StageError::new(Stage::Compare, e))?;
        StoreWriter::spawn(store, self.pool.workers() * 2)
            .map_err(|e| StageError::new(Stage::Compare, e))
    }

    /// All-pairs agreement between subtrees of different trees, streamed
    /// into `sink`.
    pub fn compare(
        &self,
        subtrees: Vec<Subtree>,
        sink: RecordSink,
    ) -> Result<ComparisonSummary, StageError> {
        let matrix = CandidateMatrix::build(subtrees).pad();
        info!(
            "matrix: {} tree(s) x {} column(s), {} subtree(s), at most {} comparison(s)",
            matrix.rows(),
            matrix.columns(),
            matrix.subtree_count(),
            comparison_count(matrix.rows() as u64, matrix.columns() as u64)
        );
        similarity::compare_all(&self.pool, Arc::clone(&self.nested), Arc::new(matrix), sink)
            .map_err(|e| StageError::new(Stage::Compare, e))
    }

    /// Ends the record stream and waits for the last flush.
    pub fn persist(&self, writer: StoreWriter) -> Result<StoreSummary, StageError> {
        writer
            .finish()
            .map_err(|e| StageError::new(Stage::Persist, e))
    }
}

/// What a run produced. `failure` is set when a stage aborted the run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub comparisons: ComparisonSummary,
    pub store: Option<StoreSummary>,
    pub provenance: Option<PathBuf>,
    pub failure: Option<StageError>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct Pipeline {
    ctx: RunContext,
}

impl Pipeline {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Runs every stage. Setup errors are returned as `Err`; a stage
    /// failure is reported in [`RunReport::failure`] after provenance has
    /// been written.
    pub fn run(&self) -> Result<RunReport> {
        let ctx = &self.ctx;
        ctx.paths.create_all()?;
        ctx.paths.clean_scratch()?;
        let mut provenance = Provenance::begin(&ctx.paths.provenance, &ctx.config)?;
        let started = Local::now();
        let t0 = Instant::now();
        info!(
            "run started: {} input(s), {} with {} worker(s)",
            ctx.config.entradas.len(),
            ctx.config.algorithm.name(),
            ctx.pool.workers()
        );

        let mut report = RunReport::default();
        let failure = self.run_stages(&mut provenance, &mut report).err();
        if let Some(e) = &failure {
            error!("run aborted: {e}");
        }

        let outcome = RunOutcome {
            inicio: started,
            fim: Local::now(),
            elapsed_secs: t0.elapsed().as_secs_f64(),
            num_procs: ctx.pool.workers(),
            status: if failure.is_none() { "ok" } else { "failed" },
            failed_stage: failure.as_ref().map(|e| e.stage.to_string()),
            error: failure.as_ref().map(|e| format!("{:#}", e.cause)),
            store: report.store,
        };
        match provenance.finish(&outcome, &host::summary()) {
            Ok(path) => {
                info!("provenance written to {}", path.display());
                report.provenance = Some(path);
            }
            Err(e) => warn!("could not write provenance: {e:#}"),
        }
        if !ctx.keep_scratch {
            if let Err(e) = ctx.paths.clean_scratch() {
                warn!("scratch cleanup failed: {e:#}");
            }
        }
        info!("run finished in {:.3} s", outcome.elapsed_secs);
        report.failure = failure;
        Ok(report)
    }

    fn run_stages(
        &self,
        provenance: &mut Provenance,
        report: &mut RunReport,
    ) -> Result<(), StageError> {
        let ctx = &self.ctx;
        let inputs = ctx.validate()?;
        let stats: Vec<SequenceStats> = inputs.iter().map(|i| i.stats.clone()).collect();
        provenance
            .set_inputs(&stats)
            .map_err(|e| StageError::new(Stage::Validate, e))?;

        let alignments = ctx.align(inputs)?;
        let trees = ctx.infer_trees(alignments)?;
        let subtrees = ctx.extract_subtrees(trees)?;

        let writer = ctx.open_store()?;
        let compared = ctx.compare(subtrees, writer.sink());
        // the writer is closed even when the sweep failed; its own error is
        // the root cause of any failed send
        let stored = ctx.persist(writer);
        match (compared, stored) {
            (Ok(c), Ok(s)) => {
                report.comparisons = c;
                report.store = Some(s);
                Ok(())
            }
            (_, Err(e)) => Err(e),
            (Err(e), Ok(s)) => {
                report.store = Some(s);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn context(dir: &Path, entradas: &[&str], workers: usize) -> RunContext {
        let cfg = RunConfig {
            algorithm: Aligner::Mafft,
            parameters: Map::new(),
            tree_format: TreeFormat::Newick,
            tree_method: TreeMethod::Upgma,
            entradas: entradas.iter().map(|s| s.to_string()).collect(),
        };
        let paths = RunPaths::new(dir, Some(dir.join("in").as_path()));
        paths.create_all().unwrap();
        fs::create_dir_all(&paths.input).unwrap();
        RunContext::new(cfg, paths, workers, 1).unwrap()
    }

    #[test]
    fn stage_names() {
        assert_eq!(Stage::InferTrees.to_string(), "infer_trees");
        assert_eq!(Stage::Persist.to_string(), "persist");
    }

    #[test]
    fn invalid_inputs_are_excluded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), &["ok.fasta", "bad.fasta", "gone.fasta"], 2);
        fs::write(ctx.paths.input.join("ok.fasta"), ">a\nMKV\n>b\nMKL\n").unwrap();
        fs::write(ctx.paths.input.join("bad.fasta"), ">a\nMK1\n").unwrap();
        let valid = ctx.validate().unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].stats.arquivo, "ok.fasta");
        assert_eq!(valid[0].stats.quantidade, 2);
    }

    #[test]
    fn repeated_ids_are_replaced_by_unique_copy() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), &["dup.fasta"], 1);
        fs::write(ctx.paths.input.join("dup.fasta"), ">a\nMKV\n>a\nMKL\n>c\nMKW\n").unwrap();
        let valid = ctx.validate().unwrap();
        assert_eq!(valid[0].path, ctx.paths.unique.join("dup.fasta"));
        assert_eq!(fasta::count_records(&valid[0].path).unwrap(), 2);
    }

    #[test]
    fn empty_stages_complete_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), &[], 3);
        assert!(ctx.validate().unwrap().is_empty());
        assert!(ctx.align(Vec::new()).unwrap().is_empty());
        assert!(ctx.infer_trees(Vec::new()).unwrap().is_empty());
        assert!(ctx.extract_subtrees(Vec::new()).unwrap().is_empty());
        let writer = ctx.open_store().unwrap();
        let c = ctx.compare(Vec::new(), writer.sink()).unwrap();
        assert_eq!(c, ComparisonSummary::default());
        assert_eq!(ctx.persist(writer).unwrap(), StoreSummary::default());
    }

    #[test]
    fn unreadable_alignment_fails_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), &[], 2);
        let aln = ctx.paths.aligned.join("x.aln");
        fs::write(&aln, "not an alignment\n").unwrap();
        let err = ctx.infer_trees(vec![aln]).unwrap_err();
        assert_eq!(err.stage, Stage::InferTrees);
        assert!(err.to_string().starts_with("infer_trees stage failed"));
    }

    #[test]
    fn missing_tree_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), &[], 2);
        let present = ctx.paths.trees.join("T1.newick");
        fs::write(&present, "((a:1,b:1)Inner1:1,c:1)Inner2;\n").unwrap();
        let subs = ctx
            .extract_subtrees(vec![present, ctx.paths.trees.join("T2.newick")])
            .unwrap();
        assert!(subs.iter().all(|s| s.origin == "T1"));
        assert_eq!(subs.len(), 2);
    }
}
