//! Dry run of branch discovery.
//!
//! Walks the configured roots the way the deployer scans them and reports the
//! branches and sources it would deploy, without watching, compiling or
//! starting anything.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::Arc,
};

use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::{
  component::{ComponentCompiler, ScriptCompiler},
  domain::{
    address::{Segment, resolve_address},
    config::Config,
  },
};

/// A directory that would become a branch, or could not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedBranch {
  pub dir: PathBuf,
  /// `None` when the directory cannot be addressed
  pub address: Option<String>,
  /// 1 for directories directly under the root
  pub depth: usize,
  pub sources: Vec<PathBuf>,
  pub problem: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootPlan {
  pub root: PathBuf,
  /// Why the root would not be watched at all
  pub skipped: Option<String>,
  pub branches: Vec<PlannedBranch>,
}

/// Plan every configured root, disabled ones included.
pub fn plan(config: &Config, script: Arc<dyn ScriptCompiler>) -> Vec<RootPlan> {
  let compiler = ComponentCompiler::new(script, &config.deploy);
  config
    .roots
    .iter()
    .map(|root| {
      let path = root.path.canonicalize().unwrap_or_else(|_| root.path.clone());
      let skipped = if !root.enabled {
        Some("disabled".to_string())
      } else if !path.is_dir() {
        Some("not a directory".to_string())
      } else {
        None
      };
      let branches = if skipped.is_none() {
        plan_root(&path, &compiler)
      } else {
        Vec::new()
      };
      RootPlan {
        root: path,
        skipped,
        branches,
      }
    })
    .collect()
}

/// Branches under one root in walk order (parents before children).
pub fn plan_root(root: &Path, compiler: &ComponentCompiler) -> Vec<PlannedBranch> {
  let mut branches: Vec<PlannedBranch> = Vec::new();
  let mut claimed: HashMap<String, PathBuf> = HashMap::new();

  let mut walker = WalkDir::new(root)
    .follow_links(false)
    .min_depth(1)
    .sort_by_file_name()
    .into_iter();

  while let Some(entry) = walker.next() {
    let entry = match entry {
      Ok(entry) => entry,
      Err(e) => {
        debug!(error = %e, "Skipping unreadable entry");
        continue;
      }
    };
    let path = entry.path();

    if entry.file_type().is_dir() {
      if Segment::from_dir(path).is_none() {
        walker.skip_current_dir();
        continue;
      }
      let (address, problem) = match resolve_address(path, Some(root)) {
        Ok(resolved) => {
          let address = resolved.address.to_string();
          let problem = claimed
            .get(&address)
            .map(|other| format!("address already used by {}", other.display()));
          if problem.is_none() {
            claimed.insert(address.clone(), path.to_path_buf());
          }
          (Some(address), problem)
        }
        Err(e) => (None, Some(e.to_string())),
      };
      // Nothing below an unusable directory is deployed
      if problem.is_some() {
        walker.skip_current_dir();
      }
      branches.push(PlannedBranch {
        dir: path.to_path_buf(),
        address,
        depth: entry.depth(),
        sources: Vec::new(),
        problem,
      });
      continue;
    }

    if entry.depth() > 1
      && entry.file_type().is_file()
      && compiler.is_eligible(path)
      && let Some(branch) = branches.iter_mut().rev().find(|b| path.parent() == Some(b.dir.as_path()))
    {
      branch.sources.push(path.to_path_buf());
    }
  }

  branches
}
