//! Recipe file loading.
//!
//! A TOML recipe file holds a `[[project]]` array; a JSON file holds an array
//! of recipe objects. A directory is loaded file by file in sorted name order,
//! so registration order (and with it every tie-break) is reproducible.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;
use walkdir::WalkDir;

use super::types::{Recipe, RecipeError};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlRecipeFile {
  #[serde(default)]
  project: Vec<Recipe>,
}

fn is_recipe_file(path: &Path) -> bool {
  matches!(
    path.extension().and_then(|e| e.to_str()),
    Some("toml") | Some("json")
  )
}

/// Parse recipe file content; `path` selects the format and is used in errors.
pub fn parse_recipes(content: &str, path: &Path) -> Result<Vec<Recipe>, RecipeError> {
  let parse_error = |message: String| RecipeError::Parse {
    path: path.to_path_buf(),
    message,
  };

  let recipes = match path.extension().and_then(|e| e.to_str()) {
    Some("toml") => {
      toml::from_str::<TomlRecipeFile>(content)
        .map_err(|e| parse_error(e.to_string()))?
        .project
    }
    Some("json") => serde_json::from_str::<Vec<Recipe>>(content).map_err(|e| parse_error(e.to_string()))?,
    _ => return Err(parse_error("unsupported recipe format (expected .toml or .json)".to_string())),
  };

  for recipe in &recipes {
    recipe.validate()?;
  }

  Ok(recipes)
}

pub fn load_file(path: &Path) -> Result<Vec<Recipe>, RecipeError> {
  let content = std::fs::read_to_string(path).map_err(|source| RecipeError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  let recipes = parse_recipes(&content, path)?;
  debug!(path = %path.display(), count = recipes.len(), "loaded recipe file");
  Ok(recipes)
}

/// Load every `*.toml` / `*.json` file directly inside `dir`.
pub fn load_dir(dir: &Path) -> Result<Vec<Recipe>, RecipeError> {
  let mut files: Vec<PathBuf> = Vec::new();

  for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
    let entry = entry.map_err(|e| RecipeError::Read {
      path: dir.to_path_buf(),
      source: e.into(),
    })?;
    if entry.file_type().is_file() && is_recipe_file(entry.path()) {
      files.push(entry.into_path());
    }
  }

  let mut recipes = Vec::new();
  for file in files {
    recipes.extend(load_file(&file)?);
  }

  Ok(recipes)
}
