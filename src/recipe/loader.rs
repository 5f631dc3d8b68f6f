// src/recipe/loader.rs

//! Thin TOML recipe loader.
//!
//! Each managed package is a directory under the repository checkout holding a
//! `recipe.toml`. Only the scheduling-relevant fields are read here; the rest
//! of the recipe belongs to the external builder.
//!
//! ```toml
//! depends = ["libfoo", "tools:tools-extra"]
//!
//! [[update_on]]
//! source = "github"
//! throttle = "1d"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::recipe::{ArtifactResolver, Catalog, Dependency, Recipe, UpstreamSource};

/// Result of a catalog load: the recipes that parsed, plus per-package errors
pub struct LoadedCatalog {
    pub catalog: Catalog,
    /// Packages whose recipe failed to load, with the failure detail
    pub errors: Vec<(String, String)>,
}

/// Loads the recipe catalog from a repository checkout
pub trait RecipeLoader {
    fn load(&self, repodir: &Path) -> Result<LoadedCatalog>;
}

/// File name of a package recipe within its directory
pub const RECIPE_FILE: &str = "recipe.toml";

#[derive(Debug, Deserialize)]
struct RawRecipe {
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    update_on: Vec<RawSource>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    source: String,
    #[serde(default)]
    throttle: Option<String>,
}

/// Default loader: one directory per package, artifacts resolved in destdir
pub struct TomlRecipeLoader {
    destdir: PathBuf,
}

impl TomlRecipeLoader {
    pub fn new(destdir: PathBuf) -> Self {
        Self { destdir }
    }

    fn load_one(&self, pkgbase: &str, path: &Path) -> Result<Recipe> {
        let text = std::fs::read_to_string(path)?;
        let raw: RawRecipe = toml::from_str(&text).map_err(|e| Error::RecipeLoad {
            pkgbase: pkgbase.to_string(),
            detail: e.to_string(),
        })?;

        let mut recipe = Recipe::new(pkgbase);

        for spec in &raw.depends {
            // "pkgbase" or "pkgbase:pkgname" for split packages
            let (dep_base, dep_name) = match spec.split_once(':') {
                Some((base, name)) => (base, name),
                None => (spec.as_str(), spec.as_str()),
            };
            let resolver = Arc::new(ArtifactResolver {
                destdir: self.destdir.clone(),
                pkgname: dep_name.to_string(),
            });
            recipe
                .deps
                .push(Dependency::new(dep_base, dep_name, resolver));
        }

        let mut throttle = BTreeMap::new();
        for (idx, source) in raw.update_on.iter().enumerate() {
            recipe.update_on.push(UpstreamSource {
                source: source.source.clone(),
            });
            if let Some(interval) = &source.throttle {
                let interval = parse_interval(interval).map_err(|e| Error::RecipeLoad {
                    pkgbase: pkgbase.to_string(),
                    detail: format!("bad throttle on source {}: {}", idx, e),
                })?;
                throttle.insert(idx, interval);
            }
        }
        recipe.throttle = throttle;

        Ok(recipe)
    }
}

impl RecipeLoader for TomlRecipeLoader {
    fn load(&self, repodir: &Path) -> Result<LoadedCatalog> {
        let mut catalog = Catalog::new();
        let mut errors = Vec::new();

        let mut dirs: Vec<PathBuf> = std::fs::read_dir(repodir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir() && p.join(RECIPE_FILE).is_file())
            .collect();
        dirs.sort();

        for dir in dirs {
            let pkgbase = match dir.file_name().and_then(|n| n.to_str()) {
                Some(name) if !name.starts_with('.') => name.to_string(),
                _ => continue,
            };
            match self.load_one(&pkgbase, &dir.join(RECIPE_FILE)) {
                Ok(recipe) => catalog.insert(recipe),
                Err(e) => {
                    debug!("recipe {} failed to load: {}", pkgbase, e);
                    errors.push((pkgbase, e.to_string()));
                }
            }
        }

        Ok(LoadedCatalog { catalog, errors })
    }
}

/// Parse a throttle interval: a number with an `s`/`m`/`h`/`d` suffix, or a
/// bare number meaning seconds
fn parse_interval(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (digits, scale) = if let Some(rest) = s.strip_suffix('s') {
        (rest, 1)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 60 * 60)
    } else if let Some(rest) = s.strip_suffix('d') {
        (rest, 24 * 60 * 60)
    } else if s.ends_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(Error::Config(format!("invalid interval unit in {:?}", s)));
    } else {
        (s, 1)
    };
    let count: u64 = digits
        .parse()
        .map_err(|_| Error::Config(format!("invalid interval {:?}", s)))?;
    Ok(Duration::from_secs(count * scale))
}
