//! A store kept in a local directory.
//!
//! Builds are planned into a dependency graph, split into waves where every
//! derivation only depends on earlier waves, and each wave runs concurrently
//! bounded by `max_jobs`.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::builder::{BuilderError, run_builder};
use super::{
  BuildMode, BuildResult, BuildStatus, Derivation, KeyedBuildResult, Realisation, Store, StoreDir, StoreError,
  StorePath, output_path_of, resolve_drv_path,
};
use crate::consts::STORE_META_DIR;
use crate::derived::{DerivedPath, OutputsSpec, SingleDerivedPath};
use crate::placeholder::{self, PlaceholderError, Resolver};
use crate::util::hash::hash_path;

pub struct LocalStore {
  store_dir: StoreDir,
  max_jobs: usize,
  /// Derivations computed in read-only mode; readable but not on disk.
  pending: RefCell<HashMap<StorePath, Derivation>>,
}

impl LocalStore {
  /// Open (creating if needed) a store rooted at `root`.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
    let root = root.into();
    for dir in ["valid", "derivers", "tmp"] {
      let dir = root.join(STORE_META_DIR).join(dir);
      fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
    }
    let max_jobs = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    Ok(Self {
      store_dir: StoreDir::new(root),
      max_jobs,
      pending: RefCell::new(HashMap::new()),
    })
  }

  /// Open the store at `$REALIZE_STORE_DIR` or the per-user default.
  pub fn open_default() -> Result<Self, StoreError> {
    Self::open(crate::platform::paths::store_dir())
  }

  pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
    self.max_jobs = max_jobs.max(1);
    self
  }

  fn meta_dir(&self, kind: &str) -> PathBuf {
    self.store_dir.path().join(STORE_META_DIR).join(kind)
  }

  fn valid_marker(&self, path: &StorePath) -> PathBuf {
    self.meta_dir("valid").join(path.to_string())
  }

  fn mark_valid(&self, path: &StorePath) -> Result<(), StoreError> {
    let marker = self.valid_marker(path);
    fs::write(&marker, b"").map_err(|e| StoreError::io(&marker, e))
  }

  fn invalidate(&self, path: &StorePath) -> Result<(), StoreError> {
    let marker = self.valid_marker(path);
    match fs::remove_file(&marker) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(StoreError::io(&marker, e)),
    }
  }

  fn register_deriver(&self, output: &StorePath, drv_path: &StorePath) -> Result<(), StoreError> {
    let record = self.meta_dir("derivers").join(output.to_string());
    let existing = fs::read_to_string(&record).unwrap_or_default();
    if existing.lines().any(|line| line == drv_path.to_string()) {
      return Ok(());
    }
    let mut file = fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&record)
      .map_err(|e| StoreError::io(&record, e))?;
    writeln!(file, "{drv_path}").map_err(|e| StoreError::io(&record, e))
  }

  fn write_atomic(&self, target: &Path, content: &[u8]) -> Result<(), StoreError> {
    let tmp_dir = self.meta_dir("tmp");
    let mut file = tempfile::NamedTempFile::new_in(&tmp_dir).map_err(|e| StoreError::io(&tmp_dir, e))?;
    file.write_all(content).map_err(|e| StoreError::io(file.path(), e))?;
    file.persist(target).map_err(|e| StoreError::io(target, e.error))?;
    Ok(())
  }

  /// Read a derivation, copying it in from `eval_store` when this store
  /// does not have it yet.
  fn load_derivation(&self, drv_path: &StorePath, eval_store: &dyn Store) -> Result<Derivation, StoreError> {
    if self.is_known_derivation(drv_path) {
      let drv = self.read_derivation(drv_path)?;
      if !self.is_valid_path(drv_path) {
        self.write_derivation(&drv, false)?;
      }
      return Ok(drv);
    }
    let drv = eval_store.read_derivation(drv_path)?;
    self.write_derivation(&drv, false)?;
    Ok(drv)
  }

  /// Resolve `drv_path` to a concrete derivation, building generating
  /// derivations first when it is dynamic, and plan its build.
  fn plan_request(&self, ctx: &mut BuildContext<'_>, drv_path: &SingleDerivedPath, force: bool) -> Result<StorePath, StoreError> {
    let concrete = match drv_path {
      SingleDerivedPath::Opaque(path) => path.clone(),
      SingleDerivedPath::Built { .. } => self.realize_dynamic(ctx, drv_path)?,
    };
    self.plan(ctx, &concrete, force)?;
    Ok(concrete)
  }

  fn realize_dynamic(&self, ctx: &mut BuildContext<'_>, drv_path: &SingleDerivedPath) -> Result<StorePath, StoreError> {
    let SingleDerivedPath::Built { drv_path: inner, output } = drv_path else {
      return resolve_drv_path(self, drv_path);
    };
    debug!(path = %drv_path, "realizing generating derivation first");
    let generator = self.plan_request(ctx, inner, false)?;
    self.execute(ctx)?;
    if let Some(result) = ctx.outcomes.get(&generator).filter(|r| !r.success()) {
      return Err(StoreError::BuildFailed {
        path: format!("{}^{}", self.store_dir.print_path(&generator), output),
        status: result.status,
        message: result.error_msg.clone(),
      });
    }
    resolve_drv_path(self, drv_path)
  }

  fn plan(&self, ctx: &mut BuildContext<'_>, drv_path: &StorePath, force: bool) -> Result<Planned<()>, StoreError> {
    if ctx.nodes.contains_key(drv_path) {
      return Ok(Planned::Pending(()));
    }
    if let Some(result) = ctx.outcomes.get(drv_path) {
      return Ok(if result.success() { Planned::Valid } else { Planned::Failed });
    }

    let drv = self.load_derivation(drv_path, ctx.eval_store)?;
    let outputs = drv.output_paths(drv_path)?;
    if !force && outputs.values().all(|p| self.is_valid_path(p)) {
      return Ok(Planned::Valid);
    }

    // Planning a dynamic input runs the builds planned so far, so
    // dependencies are remembered by path and linked once all are planned.
    let mut deps = Vec::new();
    for input in drv.input_drvs.keys() {
      let planned = match input {
        SingleDerivedPath::Opaque(input) => self.plan(ctx, input, false)?.map(|()| input.clone()),
        SingleDerivedPath::Built { .. } => match self.realize_dynamic(ctx, input) {
          Ok(input) => self.plan(ctx, &input, false)?.map(|()| input),
          Err(e) => {
            warn!(drv = %drv_path, input = %input, error = %e, "dynamic input could not be realized");
            Planned::Failed
          }
        },
      };
      match planned {
        Planned::Valid => {}
        Planned::Pending(dep) => deps.push(dep),
        Planned::Failed => {
          ctx.outcomes.insert(
            drv_path.clone(),
            BuildResult::failure(
              BuildStatus::DependencyFailed,
              format!("dependency '{input}' of '{drv_path}' failed"),
            ),
          );
          return Ok(Planned::Failed);
        }
      }
    }

    let mut dep_nodes = Vec::new();
    for dep in &deps {
      match (ctx.nodes.get(dep), ctx.outcomes.get(dep)) {
        (Some(&idx), _) => dep_nodes.push(idx),
        (None, Some(result)) if !result.success() => {
          ctx.outcomes.insert(
            drv_path.clone(),
            BuildResult::failure(
              BuildStatus::DependencyFailed,
              format!("dependency '{dep}' of '{drv_path}' failed"),
            ),
          );
          return Ok(Planned::Failed);
        }
        _ => {}
      }
    }

    let idx = ctx.graph.add_node(drv_path.clone());
    for dep in dep_nodes {
      ctx.graph.add_edge(dep, idx, ());
    }
    ctx.nodes.insert(drv_path.clone(), idx);
    if force {
      ctx.forced.insert(drv_path.clone());
    }
    ctx.drvs.insert(drv_path.clone(), drv);
    Ok(Planned::Pending(()))
  }

  /// Run everything planned so far.
  fn execute(&self, ctx: &mut BuildContext<'_>) -> Result<(), StoreError> {
    let waves = build_waves(&ctx.graph)?;
    info!(wave_count = waves.len(), drv_count = ctx.graph.node_count(), "executing build plan");

    for (wave_idx, wave) in waves.iter().enumerate() {
      debug!(wave = wave_idx, builds = wave.len(), "executing wave");
      let mut jobs = Vec::new();

      for &idx in wave {
        let drv_path = ctx.graph[idx].clone();
        let failed_dep = ctx
          .graph
          .neighbors_directed(idx, Direction::Incoming)
          .map(|dep| ctx.graph[dep].clone())
          .find(|dep| ctx.outcomes.get(dep).is_none_or(|r| !r.success()));
        if let Some(dep) = failed_dep {
          warn!(drv = %drv_path, failed_dep = %dep, "skipping build due to failed dependency");
          ctx.outcomes.insert(
            drv_path.clone(),
            BuildResult::failure(BuildStatus::DependencyFailed, format!("dependency '{dep}' failed")),
          );
          continue;
        }

        let check = ctx.mode == BuildMode::Check && ctx.forced.contains(&drv_path);
        match self.prepare_job(&ctx.drvs[&drv_path], &drv_path, check) {
          Ok(job) => jobs.push(job),
          Err(e) => {
            error!(drv = %drv_path, error = %e, "failed to prepare build");
            ctx
              .outcomes
              .insert(drv_path, BuildResult::failure(BuildStatus::MiscFailure, e.to_string()));
          }
        }
      }

      if jobs.is_empty() {
        continue;
      }
      for (job, result) in ctx.runtime.block_on(run_wave(jobs, self.max_jobs)) {
        let drv_path = job.drv_path.clone();
        let outcome = self.finish_job(job, result)?;
        if outcome.success() {
          info!(drv = %drv_path, "build succeeded");
        } else {
          error!(drv = %drv_path, error = %outcome.error_msg, "build failed");
        }
        ctx.outcomes.insert(drv_path, outcome);
      }
    }

    ctx.graph.clear();
    ctx.nodes.clear();
    Ok(())
  }

  fn prepare_job(&self, drv: &Derivation, drv_path: &StorePath, check: bool) -> Result<BuildJob, StoreError> {
    let resolver = StoreResolver { store: self };
    let script = placeholder::substitute(&drv.builder, &resolver)?;
    let env = drv
      .env
      .iter()
      .map(|(k, v)| Ok((k.clone(), placeholder::substitute(v, &resolver)?)))
      .collect::<Result<BTreeMap<_, _>, StoreError>>()?;

    let mut outputs = BTreeMap::new();
    let mut backups = Vec::new();
    let build_dir = TempDir::new_in(self.meta_dir("tmp")).map_err(|e| StoreError::io(self.meta_dir("tmp"), e))?;

    for (name, path) in drv.output_paths(drv_path)? {
      let full = self.store_dir.to_path(&path);
      if check && self.is_valid_path(&path) {
        let backup = build_dir.path().join(format!("check-{name}"));
        fs::rename(&full, &backup).map_err(|e| StoreError::io(&full, e))?;
        backups.push((name.clone(), backup));
      } else {
        self.invalidate(&path)?;
        remove_path(&full)?;
      }
      outputs.insert(name, full);
    }

    Ok(BuildJob {
      drv_path: drv_path.clone(),
      name: drv.name.clone(),
      script,
      env,
      outputs,
      backups,
      build_dir,
    })
  }

  fn finish_job(&self, job: BuildJob, result: Result<String, BuilderError>) -> Result<BuildResult, StoreError> {
    if let Err(e) = result {
      self.discard_outputs(&job)?;
      return Ok(BuildResult::failure(BuildStatus::PermanentFailure, e.to_string()));
    }

    if let Some(missing) = job.outputs.iter().find(|(_, path)| fs::symlink_metadata(path).is_err()) {
      self.discard_outputs(&job)?;
      return Ok(BuildResult::failure(
        BuildStatus::OutputRejected,
        format!(
          "builder for '{}' failed to produce output path for output '{}'",
          self.store_dir.print_path(&job.drv_path),
          missing.0
        ),
      ));
    }

    for (name, backup) in &job.backups {
      let built = &job.outputs[name];
      if hash_path(built, &[])? != hash_path(backup, &[])? {
        self.discard_outputs(&job)?;
        return Ok(BuildResult::failure(
          BuildStatus::NotDeterministic,
          format!(
            "derivation '{}' may not be deterministic: output '{}' differs",
            self.store_dir.print_path(&job.drv_path),
            name
          ),
        ));
      }
    }

    let mut result = BuildResult::new(BuildStatus::Built);
    result.times_built = 1;
    for (name, full) in &job.outputs {
      let out_path = self.store_dir.to_store_path(&full.to_string_lossy())?.0;
      self.mark_valid(&out_path)?;
      self.register_deriver(&out_path, &job.drv_path)?;
      result.built_outputs.insert(
        name.clone(),
        Realisation {
          drv_path: job.drv_path.clone(),
          output: name.clone(),
          out_path,
        },
      );
    }
    Ok(result)
  }

  /// Remove whatever a failed build left behind and restore outputs that
  /// were moved aside for checking.
  fn discard_outputs(&self, job: &BuildJob) -> Result<(), StoreError> {
    for path in job.outputs.values() {
      remove_path(path)?;
    }
    for (name, backup) in &job.backups {
      let target = &job.outputs[name];
      fs::rename(backup, target).map_err(|e| StoreError::io(target, e))?;
    }
    Ok(())
  }

  fn result_for(&self, ctx: &BuildContext<'_>, request: Request) -> Result<BuildResult, StoreError> {
    let (drv_path, wanted) = match request {
      Request::Opaque(path) => {
        return Ok(if self.is_valid_path(&path) {
          BuildResult::new(BuildStatus::AlreadyValid)
        } else {
          BuildResult::failure(
            BuildStatus::MiscFailure,
            format!(
              "path '{}' is required, but there is no derivation known to produce it",
              self.store_dir.print_path(&path)
            ),
          )
        });
      }
      Request::Failed(status, message) => return Ok(BuildResult::failure(status, message)),
      Request::Built(drv_path, wanted) => (drv_path, wanted),
    };

    if let Some(outcome) = ctx.outcomes.get(&drv_path).filter(|r| !r.success()) {
      return Ok(outcome.clone());
    }

    let drv = self.read_derivation(&drv_path)?;
    if let OutputsSpec::Names(names) = &wanted {
      if let Some(unknown) = names.iter().find(|n| !drv.outputs.contains(*n)) {
        return Ok(BuildResult::failure(
          BuildStatus::MiscFailure,
          format!(
            "derivation '{}' does not have wanted output '{}'",
            self.store_dir.print_path(&drv_path),
            unknown
          ),
        ));
      }
    }

    let mut result = match ctx.outcomes.get(&drv_path) {
      Some(outcome) => BuildResult {
        built_outputs: BTreeMap::new(),
        ..outcome.clone()
      },
      None => BuildResult::new(BuildStatus::AlreadyValid),
    };
    for (name, out_path) in drv.output_paths(&drv_path)? {
      if !wanted.contains(&name) {
        continue;
      }
      if !self.is_valid_path(&out_path) {
        return Ok(BuildResult::failure(
          BuildStatus::MiscFailure,
          format!("output '{}' of '{}' is not valid", name, self.store_dir.print_path(&drv_path)),
        ));
      }
      result.built_outputs.insert(
        name.clone(),
        Realisation {
          drv_path: drv_path.clone(),
          output: name,
          out_path,
        },
      );
    }
    Ok(result)
  }
}

impl Store for LocalStore {
  fn store_dir(&self) -> &StoreDir {
    &self.store_dir
  }

  fn is_valid_path(&self, path: &StorePath) -> bool {
    self.valid_marker(path).exists() && fs::symlink_metadata(self.store_dir.to_path(path)).is_ok()
  }

  fn is_known_derivation(&self, drv_path: &StorePath) -> bool {
    self.pending.borrow().contains_key(drv_path) || self.is_valid_path(drv_path)
  }

  fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation, StoreError> {
    if let Some(drv) = self.pending.borrow().get(drv_path) {
      return Ok(drv.clone());
    }
    if !self.is_valid_path(drv_path) {
      return Err(StoreError::UnknownDerivation(self.store_dir.print_path(drv_path)));
    }
    let file = self.store_dir.to_path(drv_path);
    let content = fs::read_to_string(&file).map_err(|e| StoreError::io(&file, e))?;
    Ok(serde_json::from_str(&content)?)
  }

  fn write_derivation(&self, drv: &Derivation, read_only: bool) -> Result<StorePath, StoreError> {
    drv.validate()?;
    let path = drv.path()?;
    if read_only {
      self.pending.borrow_mut().entry(path.clone()).or_insert_with(|| drv.clone());
      return Ok(path);
    }
    if !self.is_valid_path(&path) {
      debug!(drv = %path, "writing derivation");
      self.write_atomic(&self.store_dir.to_path(&path), serde_json::to_string_pretty(drv)?.as_bytes())?;
      self.mark_valid(&path)?;
    }
    self.pending.borrow_mut().remove(&path);
    Ok(path)
  }

  fn query_valid_derivers(&self, path: &StorePath) -> Result<Vec<StorePath>, StoreError> {
    let record = self.meta_dir("derivers").join(path.to_string());
    let content = match fs::read_to_string(&record) {
      Ok(content) => content,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(StoreError::io(&record, e)),
    };
    Ok(
      content
        .lines()
        .filter_map(|line| StorePath::from_base_name(line.trim()).ok())
        .filter(|drv| self.is_valid_path(drv))
        .collect(),
    )
  }

  fn build_paths_with_results(
    &self,
    paths: &[DerivedPath],
    mode: BuildMode,
    eval_store: &dyn Store,
  ) -> Result<Vec<KeyedBuildResult>, StoreError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .map_err(|e| StoreError::Runtime(e.to_string()))?;
    let mut ctx = BuildContext {
      eval_store,
      mode,
      runtime: &runtime,
      graph: DiGraph::new(),
      nodes: HashMap::new(),
      drvs: HashMap::new(),
      forced: HashSet::new(),
      outcomes: HashMap::new(),
    };

    let mut requests = Vec::with_capacity(paths.len());
    for path in paths {
      let request = match path {
        DerivedPath::Opaque(path) => Request::Opaque(path.clone()),
        DerivedPath::Built { drv_path, outputs } => match self.plan_request(&mut ctx, drv_path, mode != BuildMode::Normal) {
          Ok(drv) => Request::Built(drv, outputs.clone()),
          Err(StoreError::BuildFailed { status, message, .. }) => Request::Failed(status, message),
          Err(e) => Request::Failed(BuildStatus::MiscFailure, e.to_string()),
        },
      };
      requests.push(request);
    }

    self.execute(&mut ctx)?;

    paths
      .iter()
      .zip(requests)
      .map(|(path, request)| {
        Ok(KeyedBuildResult {
          path: path.clone(),
          result: self.result_for(&ctx, request)?,
        })
      })
      .collect()
  }
}

struct BuildContext<'a> {
  eval_store: &'a dyn Store,
  mode: BuildMode,
  runtime: &'a Runtime,
  graph: DiGraph<StorePath, ()>,
  nodes: HashMap<StorePath, NodeIndex>,
  drvs: HashMap<StorePath, Derivation>,
  forced: HashSet<StorePath>,
  outcomes: HashMap<StorePath, BuildResult>,
}

enum Planned<T> {
  Valid,
  Pending(T),
  Failed,
}

impl<T> Planned<T> {
  fn map<U>(self, f: impl FnOnce(T) -> U) -> Planned<U> {
    match self {
      Self::Valid => Planned::Valid,
      Self::Pending(t) => Planned::Pending(f(t)),
      Self::Failed => Planned::Failed,
    }
  }
}

enum Request {
  Opaque(StorePath),
  Built(StorePath, OutputsSpec),
  Failed(BuildStatus, String),
}

struct BuildJob {
  drv_path: StorePath,
  name: String,
  script: String,
  env: BTreeMap<String, String>,
  outputs: BTreeMap<String, PathBuf>,
  backups: Vec<(String, PathBuf)>,
  build_dir: TempDir,
}

struct StoreResolver<'a> {
  store: &'a LocalStore,
}

impl Resolver for StoreResolver<'_> {
  fn resolve_built(&self, path: &SingleDerivedPath) -> Result<String, PlaceholderError> {
    let resolved = match path {
      SingleDerivedPath::Opaque(path) => Ok(path.clone()),
      SingleDerivedPath::Built { drv_path, output } => {
        resolve_drv_path(self.store, drv_path).and_then(|drv| output_path_of(self.store, &drv, output))
      }
    };
    resolved
      .map(|p| self.store.store_dir.print_path(&p))
      .map_err(|_| PlaceholderError::Unresolved(path.to_string()))
  }
}

async fn run_wave(jobs: Vec<BuildJob>, max_jobs: usize) -> Vec<(BuildJob, Result<String, BuilderError>)> {
  let semaphore = Arc::new(Semaphore::new(max_jobs));
  let mut join_set = JoinSet::new();

  for job in jobs {
    let semaphore = semaphore.clone();
    join_set.spawn(async move {
      let _permit = semaphore.acquire_owned().await.ok();
      let result = run_builder(&job.name, &job.script, &job.env, &job.outputs, job.build_dir.path()).await;
      (job, result)
    });
  }

  let mut results = Vec::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok(result) => results.push(result),
      Err(e) => error!(error = %e, "build task panicked"),
    }
  }
  results
}

/// Group nodes into levels so that every node comes after all of its
/// dependencies (Kahn's algorithm).
fn build_waves(graph: &DiGraph<StorePath, ()>) -> Result<Vec<Vec<NodeIndex>>, StoreError> {
  let mut in_degree: HashMap<NodeIndex, usize> = graph
    .node_indices()
    .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
    .collect();
  let mut remaining: HashSet<NodeIndex> = graph.node_indices().collect();
  let mut waves = Vec::new();

  while !remaining.is_empty() {
    let mut ready: Vec<NodeIndex> = remaining.iter().filter(|idx| in_degree[idx] == 0).copied().collect();
    if ready.is_empty() {
      return Err(StoreError::Runtime("dependency cycle between derivations".to_string()));
    }
    ready.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
    for idx in &ready {
      remaining.remove(idx);
      for next in graph.neighbors_directed(*idx, Direction::Outgoing) {
        if let Some(deg) = in_degree.get_mut(&next) {
          *deg = deg.saturating_sub(1);
        }
      }
    }
    waves.push(ready);
  }
  Ok(waves)
}

fn remove_path(path: &Path) -> Result<(), StoreError> {
  let Ok(meta) = fs::symlink_metadata(path) else {
    return Ok(());
  };
  let result = if meta.is_dir() {
    fs::remove_dir_all(path)
  } else {
    fs::remove_file(path)
  };
  result.map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeSet;

  fn drv(name: &str, builder: &str) -> Derivation {
    Derivation {
      name: name.to_string(),
      system: crate::platform::current_system(),
      builder: builder.to_string(),
      outputs: BTreeSet::from(["out".to_string()]),
      env: BTreeMap::new(),
      input_drvs: BTreeMap::new(),
      input_srcs: BTreeSet::new(),
    }
  }

  fn built(drv_path: &StorePath) -> DerivedPath {
    DerivedPath::Built {
      drv_path: SingleDerivedPath::Opaque(drv_path.clone()),
      outputs: OutputsSpec::names(["out"]),
    }
  }

  mod derivations {
    use super::*;

    #[test]
    fn read_only_writes_are_kept_in_memory() {
      let temp = TempDir::new().unwrap();
      let store = LocalStore::open(temp.path()).unwrap();
      let d = drv("hello", "echo hi > $out");

      let path = store.write_derivation(&d, true).unwrap();
      assert!(!store.is_valid_path(&path));
      assert!(store.is_known_derivation(&path));
      assert!(!store.store_dir().to_path(&path).exists());
      assert_eq!(store.read_derivation(&path).unwrap(), d);

      assert_eq!(store.write_derivation(&d, false).unwrap(), path);
      assert!(store.is_valid_path(&path));
    }

    #[test]
    fn unknown_derivation_is_an_error() {
      let temp = TempDir::new().unwrap();
      let store = LocalStore::open(temp.path()).unwrap();
      let path = drv("x", "true").path().unwrap();
      assert!(matches!(
        store.read_derivation(&path),
        Err(StoreError::UnknownDerivation(_))
      ));
    }
  }

  #[cfg(unix)]
  mod building {
    use super::*;

    #[test]
    fn builds_and_records_deriver() {
      let temp = TempDir::new().unwrap();
      let store = LocalStore::open(temp.path()).unwrap();
      let drv_path = store.write_derivation(&drv("hello", "echo hi > $out"), false).unwrap();

      let results = store.build_paths_with_results(&[built(&drv_path)], BuildMode::Normal, &store).unwrap();
      assert_eq!(results.len(), 1);
      let result = &results[0].result;
      assert_eq!(result.status, BuildStatus::Built);
      let out = &result.built_outputs["out"].out_path;
      assert!(store.is_valid_path(out));
      assert_eq!(fs::read_to_string(store.store_dir().to_path(out)).unwrap(), "hi\n");
      assert_eq!(store.query_valid_derivers(out).unwrap(), vec![drv_path.clone()]);

      let again = store.build_paths_with_results(&[built(&drv_path)], BuildMode::Normal, &store).unwrap();
      assert_eq!(again[0].result.status, BuildStatus::AlreadyValid);
    }

    #[test]
    fn dependencies_build_first() {
      let temp = TempDir::new().unwrap();
      let store = LocalStore::open(temp.path()).unwrap();
      let dep = drv("dep", "echo dep > $out");
      let dep_path = store.write_derivation(&dep, false).unwrap();
      let dep_out = dep.output_path(&dep_path, "out").unwrap();

      let mut top = drv("top", "read line < $dep; echo \"top $line\" > $out");
      top.env.insert("dep".to_string(), store.store_dir().print_path(&dep_out));
      top
        .input_drvs
        .insert(SingleDerivedPath::Opaque(dep_path), BTreeSet::from(["out".to_string()]));
      let top_path = store.write_derivation(&top, false).unwrap();

      let results = store.build_paths_with_results(&[built(&top_path)], BuildMode::Normal, &store).unwrap();
      let out = &results[0].result.built_outputs["out"].out_path;
      assert_eq!(fs::read_to_string(store.store_dir().to_path(out)).unwrap(), "top dep\n");
      assert!(store.is_valid_path(&dep_out));
    }

    #[test]
    fn failing_dependency_fails_dependents() {
      let temp = TempDir::new().unwrap();
      let store = LocalStore::open(temp.path()).unwrap();
      let dep_path = store.write_derivation(&drv("dep", "exit 1"), false).unwrap();
      let mut top = drv("top", "echo > $out");
      top
        .input_drvs
        .insert(SingleDerivedPath::Opaque(dep_path), BTreeSet::from(["out".to_string()]));
      let top_path = store.write_derivation(&top, false).unwrap();

      let results = store.build_paths_with_results(&[built(&top_path)], BuildMode::Normal, &store).unwrap();
      assert_eq!(results[0].result.status, BuildStatus::DependencyFailed);
    }

    #[test]
    fn missing_output_is_rejected() {
      let temp = TempDir::new().unwrap();
      let store = LocalStore::open(temp.path()).unwrap();
      let drv_path = store.write_derivation(&drv("lazy", "true"), false).unwrap();

      let results = store.build_paths_with_results(&[built(&drv_path)], BuildMode::Normal, &store).unwrap();
      let result = &results[0].result;
      assert_eq!(result.status, BuildStatus::OutputRejected);
      assert!(result.error_msg.contains("failed to produce output path"));
    }

    #[test]
    fn check_detects_nondeterminism() {
      let temp = TempDir::new().unwrap();
      let store = LocalStore::open(temp.path()).unwrap();
      let drv_path = store.write_derivation(&drv("flaky", "echo $$ > $out"), false).unwrap();

      let first = store.build_paths_with_results(&[built(&drv_path)], BuildMode::Normal, &store).unwrap();
      let out = first[0].result.built_outputs["out"].out_path.clone();
      let before = fs::read_to_string(store.store_dir().to_path(&out)).unwrap();

      let checked = store.build_paths_with_results(&[built(&drv_path)], BuildMode::Check, &store).unwrap();
      assert_eq!(checked[0].result.status, BuildStatus::NotDeterministic);
      assert_eq!(fs::read_to_string(store.store_dir().to_path(&out)).unwrap(), before);
      assert!(store.is_valid_path(&out));
    }

    #[test]
    fn check_accepts_deterministic_builds() {
      let temp = TempDir::new().unwrap();
      let store = LocalStore::open(temp.path()).unwrap();
      let drv_path = store.write_derivation(&drv("stable", "echo same > $out"), false).unwrap();
      store.build_paths_with_results(&[built(&drv_path)], BuildMode::Normal, &store).unwrap();

      let checked = store.build_paths_with_results(&[built(&drv_path)], BuildMode::Check, &store).unwrap();
      assert_eq!(checked[0].result.status, BuildStatus::Built);
    }

    #[test]
    fn dynamic_derivation_builds_generator_first() {
      let temp = TempDir::new().unwrap();
      let store = LocalStore::open(temp.path()).unwrap();

      let inner = drv("inner", "echo from-inner > $out");
      let inner_json = serde_json::to_string(&inner).unwrap();
      let generator = drv("inner.drv", &format!("printf '%s' '{inner_json}' > $out"));
      let gen_path = store.write_derivation(&generator, false).unwrap();

      let dynamic = SingleDerivedPath::built(SingleDerivedPath::Opaque(gen_path.clone()), "out");
      assert!(matches!(
        resolve_drv_path(&store, &dynamic),
        Err(StoreError::NotRealized { .. })
      ));

      let request = DerivedPath::Built {
        drv_path: dynamic.clone(),
        outputs: OutputsSpec::names(["out"]),
      };
      let results = store.build_paths_with_results(&[request], BuildMode::Normal, &store).unwrap();
      let result = &results[0].result;
      assert!(result.success(), "{}", result.error_msg);

      let inner_drv = resolve_drv_path(&store, &dynamic).unwrap();
      assert_eq!(inner_drv.name(), "inner.drv");
      let out = &result.built_outputs["out"];
      assert_eq!(out.drv_path, inner_drv);
      assert_eq!(
        fs::read_to_string(store.store_dir().to_path(&out.out_path)).unwrap(),
        "from-inner\n"
      );
    }

    #[test]
    fn opaque_paths_are_checked_not_built() {
      let temp = TempDir::new().unwrap();
      let store = LocalStore::open(temp.path()).unwrap();
      let missing = drv("nothing", "true").output_path(&drv("nothing", "true").path().unwrap(), "out").unwrap();

      let results = store
        .build_paths_with_results(&[DerivedPath::Opaque(missing)], BuildMode::Normal, &store)
        .unwrap();
      assert_eq!(results[0].result.status, BuildStatus::MiscFailure);
    }
  }

  #[test]
  fn waves_respect_dependencies() {
    let mut graph = DiGraph::new();
    let sp = |n: &str| StorePath::from_base_name(&format!("0123456789abcdef0123456789abcdef-{n}")).unwrap();
    let a = graph.add_node(sp("a"));
    let b = graph.add_node(sp("b"));
    let c = graph.add_node(sp("c"));
    graph.add_edge(a, c, ());
    graph.add_edge(b, c, ());

    let waves = build_waves(&graph).unwrap();
    assert_eq!(waves, vec![vec![a, b], vec![c]]);
  }
}
