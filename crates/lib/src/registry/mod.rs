//! The project registry: every known project, indexed by name.
//!
//! Built once during setup and shared read-only (`Arc<ProjectRegistry>`)
//! while projects build. Registration order is kept and used as the
//! tie-break wherever an order is otherwise free.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::project::Project;
use crate::recipe::{self, Recipe, RecipeError};

#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("project '{0}' is already registered")]
  DuplicateName(String),

  #[error("unknown project '{0}'")]
  NotFound(String),

  #[error("project '{project}' depends on unknown project '{dependency}'")]
  MissingDependency { project: String, dependency: String },

  #[error(transparent)]
  Recipe(#[from] RecipeError),
}

#[derive(Debug, Default)]
pub struct ProjectRegistry {
  projects: Vec<Arc<Project>>,
  index: HashMap<String, usize>,
}

impl ProjectRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, project: Project) -> Result<(), RegistryError> {
    let name = project.name().to_string();
    if self.index.contains_key(&name) {
      return Err(RegistryError::DuplicateName(name));
    }
    debug!(project = %name, toolchain = %project.toolchain, source = project.source.kind(), "registered");
    self.index.insert(name, self.projects.len());
    self.projects.push(Arc::new(project));
    Ok(())
  }

  /// Validate and register each recipe in order.
  pub fn register_recipes(&mut self, recipes: impl IntoIterator<Item = Recipe>) -> Result<usize, RegistryError> {
    let mut count = 0;
    for recipe in recipes {
      self.register(Project::from_recipe(recipe)?)?;
      count += 1;
    }
    Ok(count)
  }

  /// Register every recipe file of `dir` in sorted file order.
  pub fn load_dir(&mut self, dir: &Path) -> Result<usize, RegistryError> {
    self.load_dir_with_features(dir, &BTreeSet::new())
  }

  /// Like [`ProjectRegistry::load_dir`], folding in the recipe overlays of
  /// the enabled `features` first.
  pub fn load_dir_with_features(&mut self, dir: &Path, features: &BTreeSet<String>) -> Result<usize, RegistryError> {
    let recipes = recipe::load_dir(dir)?;
    self.register_recipes(recipes.into_iter().map(|r| r.with_features(features)))
  }

  pub fn resolve(&self, name: &str) -> Result<&Arc<Project>, RegistryError> {
    self
      .index
      .get(name)
      .map(|&i| &self.projects[i])
      .ok_or_else(|| RegistryError::NotFound(name.to_string()))
  }

  /// Position in registration order.
  pub fn index_of(&self, name: &str) -> Option<usize> {
    self.index.get(name).copied()
  }

  /// All projects in registration order.
  pub fn all(&self) -> &[Arc<Project>] {
    &self.projects
  }

  pub fn len(&self) -> usize {
    self.projects.len()
  }

  pub fn is_empty(&self) -> bool {
    self.projects.is_empty()
  }

  /// Every dependency name must resolve. Reports the first dangling one in
  /// registration order.
  pub fn validate(&self) -> Result<(), RegistryError> {
    for project in &self.projects {
      for dependency in project.dependencies() {
        if !self.index.contains_key(dependency) {
          return Err(RegistryError::MissingDependency {
            project: project.name().to_string(),
            dependency: dependency.clone(),
          });
        }
      }
    }
    Ok(())
  }
}
