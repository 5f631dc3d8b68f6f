// src/recipe/mod.rs

//! Recipe catalog: per-package metadata the scheduler consumes.
//!
//! A recipe is opaque to the scheduling kernel beyond three things: its
//! intra-repo dependency list, its ordered upstream sources, and optional
//! per-source throttle intervals. Parsing and build semantics live in the
//! loader and the external builder respectively.

pub mod loader;

pub use loader::{RecipeLoader, TomlRecipeLoader};

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Predicate reporting whether a satisfying built artifact exists on disk.
///
/// The scheduler treats this as referentially transparent for the duration of
/// one ready-list query but re-queries between queries; dependencies completing
/// during the cycle flip the answer.
pub trait Resolver: Send + Sync {
    fn resolve(&self) -> bool;
}

/// Default resolver: look for a `<pkgname>-*.pkg.tar*` artifact in destdir
pub struct ArtifactResolver {
    pub destdir: PathBuf,
    pub pkgname: String,
}

impl Resolver for ArtifactResolver {
    fn resolve(&self) -> bool {
        let entries = match std::fs::read_dir(&self.destdir) {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        let prefix = format!("{}-", self.pkgname);
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.contains(".pkg.tar") {
                return true;
            }
        }
        false
    }
}

/// A dependency on another package in the repository.
///
/// `pkgname` may differ from `pkgbase` when one recipe produces several
/// packages; the resolver checks for the artifact under `pkgname`.
#[derive(Clone)]
pub struct Dependency {
    pub pkgbase: String,
    pub pkgname: String,
    resolver: Arc<dyn Resolver>,
}

impl Dependency {
    pub fn new(
        pkgbase: impl Into<String>,
        pkgname: impl Into<String>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            pkgbase: pkgbase.into(),
            pkgname: pkgname.into(),
            resolver,
        }
    }

    /// Whether a satisfying built artifact is currently available
    pub fn resolve(&self) -> bool {
        self.resolver.resolve()
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("pkgbase", &self.pkgbase)
            .field("pkgname", &self.pkgname)
            .finish()
    }
}

/// One configured upstream version source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSource {
    /// Source kind, e.g. `"github"`, `"pypi"`, `"manual"`
    pub source: String,
}

/// Scheduling-relevant metadata of one package recipe
#[derive(Debug, Clone)]
pub struct Recipe {
    pub pkgbase: String,
    /// Dependencies on packages that may or may not be managed by this repo
    pub deps: Vec<Dependency>,
    /// Ordered upstream sources; index is the identity used by build reasons
    pub update_on: Vec<UpstreamSource>,
    /// Minimum interval between upstream-triggered rebuilds, per source index
    pub throttle: BTreeMap<usize, Duration>,
}

impl Recipe {
    pub fn new(pkgbase: impl Into<String>) -> Self {
        Self {
            pkgbase: pkgbase.into(),
            deps: Vec::new(),
            update_on: Vec::new(),
            throttle: BTreeMap::new(),
        }
    }
}

/// The loaded recipe catalog: every package managed by this repository
#[derive(Debug, Default)]
pub struct Catalog {
    recipes: BTreeMap<String, Recipe>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, recipe: Recipe) {
        self.recipes.insert(recipe.pkgbase.clone(), recipe);
    }

    pub fn get(&self, pkgbase: &str) -> Option<&Recipe> {
        self.recipes.get(pkgbase)
    }

    /// Whether the repository manages this package
    pub fn contains(&self, pkgbase: &str) -> bool {
        self.recipes.contains_key(pkgbase)
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    /// All managed package names, sorted
    pub fn names(&self) -> Vec<String> {
        self.recipes.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Recipe)> {
        self.recipes.iter()
    }

    /// The given packages plus everything they transitively depend on within
    /// the repository. Used to restrict upstream checks when specific packages
    /// were requested on the command line.
    pub fn dependency_closure(&self, roots: &[String]) -> HashSet<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = roots
            .iter()
            .filter(|p| self.contains(p))
            .cloned()
            .collect();

        while let Some(pkg) = queue.pop_front() {
            if !seen.insert(pkg.clone()) {
                continue;
            }
            if let Some(recipe) = self.recipes.get(&pkg) {
                for dep in &recipe.deps {
                    if self.contains(&dep.pkgbase) && !seen.contains(&dep.pkgbase) {
                        queue.push_back(dep.pkgbase.clone());
                    }
                }
            }
        }

        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedResolver(AtomicBool);

    impl Resolver for FixedResolver {
        fn resolve(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn dep(pkgbase: &str, resolved: bool) -> Dependency {
        Dependency::new(
            pkgbase,
            pkgbase,
            Arc::new(FixedResolver(AtomicBool::new(resolved))),
        )
    }

    #[test]
    fn test_catalog_lookup() {
        let mut catalog = Catalog::new();
        catalog.insert(Recipe::new("alpha"));
        catalog.insert(Recipe::new("beta"));

        assert!(catalog.contains("alpha"));
        assert!(!catalog.contains("gamma"));
        assert_eq!(catalog.names(), vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn test_dependency_closure() {
        let mut catalog = Catalog::new();

        let mut app = Recipe::new("app");
        app.deps.push(dep("lib", false));
        catalog.insert(app);

        let mut lib = Recipe::new("lib");
        lib.deps.push(dep("core", true));
        lib.deps.push(dep("unmanaged", false));
        catalog.insert(lib);

        catalog.insert(Recipe::new("core"));
        catalog.insert(Recipe::new("bystander"));

        let closure = catalog.dependency_closure(&["app".to_string()]);
        assert!(closure.contains("app"));
        assert!(closure.contains("lib"));
        assert!(closure.contains("core"));
        assert!(!closure.contains("unmanaged"));
        assert!(!closure.contains("bystander"));
    }

    #[test]
    fn test_artifact_resolver() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ArtifactResolver {
            destdir: dir.path().to_path_buf(),
            pkgname: "foo".to_string(),
        };
        assert!(!resolver.resolve());

        std::fs::write(dir.path().join("foo-1.2-1-x86_64.pkg.tar.zst"), b"").unwrap();
        assert!(resolver.resolve());

        // a different package's artifact does not satisfy us
        let other = ArtifactResolver {
            destdir: dir.path().to_path_buf(),
            pkgname: "foobar".to_string(),
        };
        assert!(!other.resolve());
    }
}
