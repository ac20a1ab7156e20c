//! The driver loop.
//!
//! [`Orchestrator::run`] validates the registry, resolves the build order and
//! then schedules projects from a ready queue: a project starts once all of
//! its dependencies are done, with at most `parallelism` projects in flight.
//! Each project runs the same pipeline:
//!
//! ```text
//! lock -> skip check -> fetch -> patch (fresh sources only) -> env pushes
//!      -> pre_build -> configure -> compile | build hooks -> post_build
//!      -> install (toolchain) -> artifact installer -> post_install
//!      -> install files staged by post_install
//! ```
//!
//! A failed project marks every transitive dependent as skipped; independent
//! projects keep building.

mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use types::{
  BuildRequest, BuildState, OrchestrateError, ProjectError, ProjectReport, RunSummary, StateTracker, TransitionError,
};
use types::millis;

use crate::builder::{BuildError, StageContext, install_stage};
use crate::config::{BuildConfiguration, Config};
use crate::context::BuildContext;
use crate::fetch::{self, FetchOptions};
use crate::graph::{DependencyGraph, ResolveError};
use crate::hooks::{Hook, run_hooks};
use crate::install::{ArtifactInstaller, InstallRecord};
use crate::lock::{FileLock, LockError, LockMode};
use crate::patch::PatchEngine;
use crate::platform::TargetArch;
use crate::process::ProcessRunner;
use crate::project::{Project, ProjectPaths, Source};
use crate::recipe::{EnvPush, HookPoint, HookSpec, InstallMapping, OptionValue, ToolchainKind};
use crate::registry::ProjectRegistry;
use crate::util::hash::{Fingerprint, Hashable};

/// Everything that decides whether an installed project can be reused.
#[derive(Serialize)]
struct BuildIdentity<'a> {
  name: &'a str,
  version: &'a str,
  source: &'a Source,
  toolchain: ToolchainKind,
  options: &'a BTreeMap<String, OptionValue>,
  install: &'a [InstallMapping],
  hooks: Vec<&'a HookSpec>,
  /// Names of programmatic hooks; their bodies cannot be hashed.
  hook_fns: Vec<String>,
  env: &'a [EnvPush],
  patches: Vec<(&'a str, String)>,
  configuration: BuildConfiguration,
  arch: TargetArch,
  dependencies: &'a BTreeMap<String, Fingerprint>,
}

impl Hashable for BuildIdentity<'_> {}

fn fingerprint(
  project: &Project,
  version: &str,
  digests: &[String],
  context: &BuildContext,
  dependencies: &BTreeMap<String, Fingerprint>,
) -> Result<Fingerprint, ProjectError> {
  let recipe = &project.recipe;

  let identity = BuildIdentity {
    name: project.name(),
    version,
    source: &project.source,
    toolchain: project.toolchain,
    options: &recipe.options,
    install: &recipe.install,
    hooks: project
      .hooks
      .iter()
      .filter_map(|h| match h {
        Hook::Spec(spec) => Some(spec),
        Hook::Fn { .. } => None,
      })
      .collect(),
    hook_fns: project
      .hooks
      .iter()
      .filter(|h| matches!(h, Hook::Fn { .. }))
      .map(Hook::name)
      .collect(),
    env: &recipe.env,
    patches: recipe.patches.iter().map(String::as_str).zip(digests.iter().cloned()).collect(),
    configuration: context.configuration(),
    arch: context.arch(),
    dependencies,
  };

  Ok(identity.fingerprint()?)
}

/// Outcome of a project that reached `Done`.
#[derive(Debug)]
struct Completed {
  fingerprint: Fingerprint,
  version: String,
  up_to_date: bool,
}

/// Shared, forward-only state of every project in the run.
#[derive(Clone)]
struct States(Arc<Mutex<StateTracker>>);

impl States {
  fn advance(&self, name: &str, next: BuildState) -> Result<(), TransitionError> {
    let mut tracker = self.0.lock().unwrap_or_else(|e| e.into_inner());
    tracker.advance(name, next)
  }

  fn get(&self, name: &str) -> BuildState {
    let tracker = self.0.lock().unwrap_or_else(|e| e.into_inner());
    tracker.get(name).cloned().unwrap_or(BuildState::Pending)
  }
}

/// One project's pipeline, owned by its task.
struct ProjectJob {
  project: Arc<Project>,
  config: Arc<Config>,
  context: Arc<BuildContext>,
  installer: ArtifactInstaller,
  patches: PatchEngine,
  dependencies: BTreeMap<String, Fingerprint>,
  force: bool,
  cancel: CancellationToken,
  states: States,
}

async fn blocking<T: Send + 'static>(
  f: impl FnOnce() -> Result<T, ProjectError> + Send + 'static,
) -> Result<T, ProjectError> {
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| ProjectError::Task(e.to_string()))?
}

fn reset_dir(path: &Path) -> Result<(), ProjectError> {
  match fs::remove_dir_all(path) {
    Ok(()) => {}
    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
    Err(source) => {
      return Err(ProjectError::Io {
        path: path.to_path_buf(),
        source,
      });
    }
  }
  fs::create_dir_all(path).map_err(|source| ProjectError::Io {
    path: path.to_path_buf(),
    source,
  })
}

impl ProjectJob {
  fn name(&self) -> &str {
    self.project.name()
  }

  fn advance(&self, state: BuildState) -> Result<(), ProjectError> {
    Ok(self.states.advance(self.name(), state)?)
  }

  async fn run(self) -> (Option<String>, Result<Completed, ProjectError>) {
    let mut version = None;
    let result = self.pipeline(&mut version).await;
    (version, result)
  }

  async fn pipeline(&self, resolved: &mut Option<String>) -> Result<Completed, ProjectError> {
    let name = self.name().to_string();
    let paths = ProjectPaths::new(&self.config.build_root, &name);

    let lock_path = self.config.project_lock_path(&name);
    let _lock = FileLock::try_acquire(&lock_path, LockMode::Exclusive, &format!("nbuild build {name}")).map_err(
      |e| match e {
        LockError::Contention { .. } | LockError::ContentionUnknown { .. } => ProjectError::Locked {
          project: name.clone(),
          source: e,
        },
        other => ProjectError::Lock(other),
      },
    )?;

    let fetch_opts = FetchOptions::from_config(&self.config, self.cancel.clone()).with_force(self.force);
    let resolved_version = fetch::resolve_version(&self.project, &fetch_opts).await?;
    let version = resolved_version.version.clone();
    *resolved = Some(version.clone());

    let digests = self.patches.digests(&name, &self.project.recipe.patches);
    let fingerprint = fingerprint(&self.project, &version, &digests, &self.context, &self.dependencies)?;

    if !self.force {
      let installer = self.installer.clone();
      let project = name.clone();
      let entry = blocking(move || Ok(installer.entry(&project)?)).await?;
      if let Some(entry) = entry
        && entry.fingerprint == fingerprint
        && self.installer.is_intact(&entry)
      {
        info!(project = %name, version = %version, "up to date");
        return Ok(Completed {
          fingerprint,
          version,
          up_to_date: true,
        });
      }
    }

    self.advance(BuildState::Fetching)?;
    reset_dir(&paths.logs)?;
    let outcome = fetch::fetch(&self.project, &resolved_version, &digests, &paths.source, &fetch_opts).await?;

    let runner = ProcessRunner::new(paths.logs.clone(), self.cancel.clone());
    let env = self.context.lane();

    if outcome.fresh && !self.project.recipe.patches.is_empty() {
      self.advance(BuildState::Patching)?;
      let applied = self
        .patches
        .apply(&name, &outcome.source_root, &self.project.recipe.patches, &runner, &env)
        .await;
      if let Err(e) = applied {
        // The tree is partially patched; force the next run to re-extract.
        fetch::invalidate(&paths.source).map_err(ProjectError::Fetch)?;
        return Err(e.into());
      }
    }

    self.advance(BuildState::Building)?;
    reset_dir(&paths.build)?;
    reset_dir(&paths.stage)?;

    let mut cx = StageContext {
      project: &self.project,
      version: version.clone(),
      paths,
      env,
      runner,
      context: &self.context,
    };
    for push in &self.project.recipe.env {
      let value = cx.expand(&push.value);
      cx.env.push(&push.var, value);
    }

    let builder = self.project.toolchain.builder();
    run_hooks(HookPoint::PreBuild, &mut cx).await?;
    builder.configure(&cx).await?;
    if self.project.hooks_at(HookPoint::Build).next().is_some() {
      run_hooks(HookPoint::Build, &mut cx).await?;
    } else {
      builder.compile(&cx).await?;
    }
    run_hooks(HookPoint::PostBuild, &mut cx).await?;

    self.advance(BuildState::Installing)?;
    install_stage(builder.as_ref(), &cx).await?;

    if self.cancel.is_cancelled() {
      return Err(ProjectError::Build(BuildError::Cancelled));
    }

    let installer = self.installer.clone();
    let (project, stage) = (name.clone(), cx.paths.stage.clone());
    let record = InstallRecord {
      version: version.clone(),
      fingerprint: fingerprint.clone(),
      source_hash: outcome.source_hash.clone(),
    };
    blocking(move || Ok(installer.install(&project, &stage, record)?)).await?;

    // post_install hooks stage into an emptied stage directory.
    reset_dir(&cx.paths.stage)?;
    let post_install = match run_hooks(HookPoint::PostInstall, &mut cx).await {
      Ok(_) => {
        let installer = self.installer.clone();
        let (project, stage) = (name.clone(), cx.paths.stage.clone());
        blocking(move || Ok(installer.install_extra(&project, &stage)?)).await
      }
      Err(e) => Err(e.into()),
    };
    if let Err(e) = post_install {
      let installer = self.installer.clone();
      let project = name.clone();
      blocking(move || Ok(installer.invalidate(&project)?)).await?;
      return Err(e);
    }

    Ok(Completed {
      fingerprint,
      version,
      up_to_date: false,
    })
  }
}

pub struct Orchestrator {
  registry: Arc<ProjectRegistry>,
  config: Arc<Config>,
  context: Arc<BuildContext>,
}

impl Orchestrator {
  /// Snapshots the process environment for the run's build context.
  pub fn new(registry: Arc<ProjectRegistry>, config: Config) -> Self {
    let context = BuildContext::from_config(&config);
    Self::with_context(registry, config, context)
  }

  pub fn with_context(registry: Arc<ProjectRegistry>, config: Config, context: BuildContext) -> Self {
    Self {
      registry,
      config: Arc::new(config),
      context: Arc::new(context),
    }
  }

  pub fn registry(&self) -> &ProjectRegistry {
    &self.registry
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Build the requested projects.
  ///
  /// Registry and resolution errors are returned before anything runs.
  /// Project failures do not fail the run; they are reported in the summary.
  pub async fn run(&self, request: &BuildRequest, cancel: CancellationToken) -> Result<RunSummary, OrchestrateError> {
    let started = Instant::now();

    self.registry.validate()?;
    let graph = DependencyGraph::new(&self.registry);
    let order = graph.order(&request.targets)?;
    for name in &request.rebuild {
      self.registry.resolve(name)?;
    }
    fs::create_dir_all(&self.config.build_root).map_err(|source| OrchestrateError::Io {
      path: self.config.build_root.clone(),
      source,
    })?;

    let parallelism = self.config.parallelism.max(1);
    info!(projects = order.len(), parallelism, "starting build");

    let position: HashMap<&str, usize> = order.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
    let mut waiting: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for name in &order {
      let project = self.registry.resolve(name)?;
      let deps: BTreeSet<&str> = project.dependencies().iter().map(String::as_str).collect();
      waiting.insert(name.as_str(), deps.len());
      for dep in deps {
        dependents.entry(dep).or_default().push(name.as_str());
      }
    }

    let states = States(Arc::new(Mutex::new(StateTracker::new(&order))));
    let mut ready: BTreeSet<usize> = order
      .iter()
      .enumerate()
      .filter(|(_, n)| waiting.get(n.as_str()) == Some(&0))
      .map(|(i, _)| i)
      .collect();
    let mut reports: HashMap<String, ProjectReport> = order
      .iter()
      .map(|n| {
        let report = ProjectReport {
          name: n.clone(),
          state: BuildState::Pending,
          version: None,
          up_to_date: false,
          duration_ms: 0,
        };
        (n.clone(), report)
      })
      .collect();
    let mut fingerprints: HashMap<String, Fingerprint> = HashMap::new();
    let mut running: HashMap<tokio::task::Id, (String, Instant)> = HashMap::new();
    let mut join_set = JoinSet::new();

    let installer = ArtifactInstaller::new(&self.config.install_root);
    let patches = PatchEngine::new(&self.config.patch_dir, &self.config.programs.patch);

    loop {
      while join_set.len() < parallelism && !cancel.is_cancelled() {
        let Some(next) = ready.pop_first() else {
          break;
        };
        let name = &order[next];
        let project = Arc::clone(self.registry.resolve(name)?);
        let dependencies = project
          .dependencies()
          .iter()
          .filter_map(|d| fingerprints.get(d).map(|f| (d.clone(), f.clone())))
          .collect();

        let job = ProjectJob {
          project,
          config: Arc::clone(&self.config),
          context: Arc::clone(&self.context),
          installer: installer.clone(),
          patches: patches.clone(),
          dependencies,
          force: request.force || request.rebuild.contains(name),
          cancel: cancel.clone(),
          states: states.clone(),
        };

        debug!(project = %name, "starting project");
        let handle = join_set.spawn(job.run());
        running.insert(handle.id(), (name.clone(), Instant::now()));
      }

      let Some(joined) = join_set.join_next_with_id().await else {
        break;
      };
      let (id, result) = match joined {
        Ok((id, output)) => (id, Ok(output)),
        Err(e) => (e.id(), Err(ProjectError::Task(e.to_string()))),
      };
      let Some((name, project_started)) = running.remove(&id) else {
        continue;
      };

      let mut version = None;
      let result = result.and_then(|(v, r)| {
        version = v;
        r
      });
      if let Some(report) = reports.get_mut(&name) {
        report.duration_ms = millis(project_started.elapsed());
        report.version = version;
      }

      match result {
        Ok(completed) => {
          if let Err(e) = states.advance(&name, BuildState::Done) {
            warn!(project = %name, error = %e, "unexpected state transition");
          }
          info!(project = %name, version = %completed.version, up_to_date = completed.up_to_date, "project done");
          if let Some(report) = reports.get_mut(&name) {
            report.up_to_date = completed.up_to_date;
          }
          fingerprints.insert(name.clone(), completed.fingerprint);

          for dependent in dependents.get(name.as_str()).into_iter().flatten() {
            if let Some(count) = waiting.get_mut(dependent) {
              *count = count.saturating_sub(1);
              if *count == 0 && states.get(dependent) == BuildState::Pending {
                ready.insert(position[dependent]);
              }
            }
          }
        }
        Err(e) => {
          if e.is_cancelled() {
            warn!(project = %name, "project cancelled");
          } else {
            error!(project = %name, error = %e, "project failed");
          }
          let reason = e.to_string();
          if let Err(e) = states.advance(&name, BuildState::Failed { reason }) {
            warn!(project = %name, error = %e, "unexpected state transition");
          }
          self.skip_dependents(&graph, &states, &position, &name)?;
        }
      }
    }

    for name in &order {
      if states.get(name) == BuildState::Pending {
        let _ = states.advance(name, BuildState::Cancelled);
      }
    }

    let projects: Vec<ProjectReport> = order
      .iter()
      .filter_map(|n| reports.remove(n))
      .map(|mut report| {
        report.state = states.get(&report.name);
        report
      })
      .collect();

    let summary = RunSummary {
      order,
      projects,
      duration_ms: millis(started.elapsed()),
    };

    info!(
      done = summary.count(BuildState::is_done),
      failed = summary.count(|s| matches!(s, BuildState::Failed { .. })),
      skipped = summary.count(|s| matches!(s, BuildState::SkippedDueToDependencyFailure { .. })),
      cancelled = summary.count(|s| matches!(s, BuildState::Cancelled)),
      elapsed = %humantime::format_duration(Duration::from_millis(summary.duration_ms)),
      "build complete"
    );

    Ok(summary)
  }

  fn skip_dependents(
    &self,
    graph: &DependencyGraph<'_>,
    states: &States,
    position: &HashMap<&str, usize>,
    failed: &str,
  ) -> Result<(), ResolveError> {
    for dependent in graph.dependents_closure(failed)? {
      if !position.contains_key(dependent.as_str()) || states.get(&dependent) != BuildState::Pending {
        continue;
      }
      warn!(project = %dependent, failed_dep = %failed, "skipping project due to failed dependency");
      let skipped = BuildState::SkippedDueToDependencyFailure {
        failed: failed.to_string(),
      };
      if let Err(e) = states.advance(&dependent, skipped) {
        warn!(project = %dependent, error = %e, "unexpected state transition");
      }
    }
    Ok(())
  }
}
