//! Branch bootstrap: namespace from `lib/` archives plus a child execution scope

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  sync::Arc,
};

use tracing::{debug, trace};

use super::branch::{Branch, BranchRuntime};
use crate::{
  domain::config::DeployConfig,
  host::{HostError, HostRuntime},
};

pub const LIB_DIR: &str = "lib";

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
  #[error("Failed to read library directory {path}: {source}")]
  Lib {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Bad archive {path}: {reason}")]
  Archive { path: PathBuf, reason: String },

  #[error("Parent branch {0} has no running scope")]
  ParentNotReady(String),

  #[error("Failed to start branch scope: {0}")]
  Scope(#[from] HostError),
}

pub struct Bootstrapper {
  host: Arc<dyn HostRuntime>,
  archive_extensions: Vec<String>,
}

impl Bootstrapper {
  pub fn new(host: Arc<dyn HostRuntime>, config: &DeployConfig) -> Self {
    Self {
      host,
      archive_extensions: config
        .archive_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect(),
    }
  }

  pub fn host(&self) -> &Arc<dyn HostRuntime> {
    &self.host
  }

  fn is_archive(&self, path: &Path) -> bool {
    path
      .extension()
      .and_then(|e| e.to_str())
      .is_some_and(|e| self.archive_extensions.iter().any(|a| a.eq_ignore_ascii_case(e)))
  }

  /// Archive files directly under `dir/lib`, sorted by name.
  ///
  /// A missing `lib/` is not an error. An archive that is empty or not a
  /// regular file is.
  pub async fn lib_archives(&self, dir: &Path) -> Result<Vec<PathBuf>, BootstrapError> {
    let lib = dir.join(LIB_DIR);
    let mut entries = match tokio::fs::read_dir(&lib).await {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(source) => return Err(BootstrapError::Lib { path: lib, source }),
    };

    let mut archives = Vec::new();
    loop {
      let entry = match entries.next_entry().await {
        Ok(Some(entry)) => entry,
        Ok(None) => break,
        Err(source) => return Err(BootstrapError::Lib { path: lib, source }),
      };
      let path = entry.path();
      if !self.is_archive(&path) {
        trace!(path = %path.display(), "Skipping non-archive in lib");
        continue;
      }

      let meta = tokio::fs::metadata(&path).await.map_err(|e| BootstrapError::Archive {
        path: path.clone(),
        reason: e.to_string(),
      })?;
      if !meta.is_file() {
        return Err(BootstrapError::Archive {
          path,
          reason: "not a regular file".to_string(),
        });
      }
      if meta.len() == 0 {
        return Err(BootstrapError::Archive {
          path,
          reason: "empty archive".to_string(),
        });
      }
      archives.push(path);
    }

    archives.sort();
    Ok(archives)
  }

  /// Build the namespace and start the scope for `branch`.
  ///
  /// Top-level branches hang off the host's root scope; nested branches off
  /// their parent branch's scope, which must already be running.
  pub async fn bootstrap(&self, branch: &Branch) -> Result<BranchRuntime, BootstrapError> {
    let parent_scope = match branch.parent() {
      Some(parent) => parent
        .runtime()
        .map(|rt| rt.scope)
        .ok_or_else(|| BootstrapError::ParentNotReady(parent.address().to_string()))?,
      None => self.host.root_scope(),
    };

    let archives = self.lib_archives(branch.dir()).await?;
    let namespace = crate::host::Namespace::child(
      &parent_scope.namespace(),
      branch.address().to_string(),
      branch.dir(),
      archives,
    );

    let mut tags = BTreeMap::new();
    tags.insert("branch.address".to_string(), branch.address().to_string());
    tags.insert("branch.dir".to_string(), branch.dir().display().to_string());
    tags.insert("branch.root".to_string(), branch.root().display().to_string());
    tags.insert("namespace".to_string(), namespace.name().to_string());

    let scope = self
      .host
      .start_child_scope(&parent_scope, namespace.clone(), tags)
      .await?;

    debug!(
      branch = %branch.address(),
      scope = scope.id(),
      archives = namespace.own_sources().len(),
      "Branch bootstrapped"
    );

    Ok(BranchRuntime { namespace, scope })
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use pretty_assertions::assert_eq;
  use tempfile::TempDir;
  use tokio_util::sync::CancellationToken;

  use super::*;
  use crate::{deploy::tree::DeploymentTree, host::LocalHost};

  fn bootstrapper() -> Bootstrapper {
    Bootstrapper::new(Arc::new(LocalHost::new()), &DeployConfig::default())
  }

  async fn branch(tree: &DeploymentTree, dir: &Path) -> Arc<Branch> {
    fs::create_dir_all(dir).unwrap();
    tree.resolve_or_create(dir).await.unwrap().0
  }

  #[tokio::test]
  async fn test_lib_archives_filters_and_sorts() {
    let temp = TempDir::new().unwrap();
    let lib = temp.path().join(LIB_DIR);
    fs::create_dir_all(&lib).unwrap();
    fs::write(lib.join("b.jar"), b"PK").unwrap();
    fs::write(lib.join("a.ZIP"), b"PK").unwrap();
    fs::write(lib.join("README.md"), b"notes").unwrap();

    let archives = bootstrapper().lib_archives(temp.path()).await.unwrap();
    assert_eq!(archives, vec![lib.join("a.ZIP"), lib.join("b.jar")]);
  }

  #[tokio::test]
  async fn test_missing_lib_is_empty() {
    let temp = TempDir::new().unwrap();
    assert!(bootstrapper().lib_archives(temp.path()).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_empty_archive_fails() {
    let temp = TempDir::new().unwrap();
    let lib = temp.path().join(LIB_DIR);
    fs::create_dir_all(&lib).unwrap();
    fs::write(lib.join("broken.jar"), b"").unwrap();

    let err = bootstrapper().lib_archives(temp.path()).await.unwrap_err();
    assert!(matches!(err, BootstrapError::Archive { .. }));
  }

  #[tokio::test]
  async fn test_nested_branch_chains_namespaces() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().to_path_buf();
    let tree = DeploymentTree::new(CancellationToken::new());
    tree.add_root(&root).unwrap();

    let app = root.join("app-orders");
    let env = app.join("env-prod");
    fs::create_dir_all(app.join(LIB_DIR)).unwrap();
    fs::write(app.join(LIB_DIR).join("shared.jar"), b"PK").unwrap();

    let bootstrapper = bootstrapper();
    let parent = branch(&tree, &app).await;
    let child = branch(&tree, &env).await;

    // Parent first; a child of an unbootstrapped parent cannot start
    let err = bootstrapper.bootstrap(&child).await.unwrap_err();
    assert!(matches!(err, BootstrapError::ParentNotReady(_)));

    let parent_rt = bootstrapper.bootstrap(&parent).await.unwrap();
    parent.set_runtime(parent_rt.clone());
    let child_rt = bootstrapper.bootstrap(&child).await.unwrap();

    assert!(child_rt.scope.is_running());
    assert_eq!(child_rt.scope.tags().get("branch.address").unwrap(), "app=orders,env=prod");
    assert_eq!(child_rt.namespace.sources(), vec![app.join(LIB_DIR).join("shared.jar")]);
    assert_eq!(child_rt.scope.parent().unwrap().id(), parent_rt.scope.id());
  }
}
