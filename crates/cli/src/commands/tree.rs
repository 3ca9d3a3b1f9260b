//! Dry-run view of the deployment tree

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use collectord::{
  RuntimeConfig,
  component::ManifestCompiler,
  deploy::{self, RootPlan},
};

/// Print the branches the engine would create for the configured roots
pub fn cmd_tree(runtime: &RuntimeConfig, json: bool) -> Result<()> {
  let config = runtime.effective_config();
  let plans = deploy::plan(&config, Arc::new(ManifestCompiler));

  if json {
    let out = serde_json::to_string_pretty(&plans).context("Failed to serialize plan")?;
    println!("{}", out);
    return Ok(());
  }

  if plans.is_empty() {
    println!("No deployment roots configured.");
    println!("Add [[roots]] to the config file or pass --root <DIR>.");
    return Ok(());
  }

  for plan in &plans {
    print_root(plan);
  }
  Ok(())
}

fn print_root(plan: &RootPlan) {
  match &plan.skipped {
    Some(reason) => {
      println!("{} (skipped: {})", plan.root.display(), reason);
      return;
    }
    None => println!("{}", plan.root.display()),
  }

  if plan.branches.is_empty() {
    println!("  (no branches)");
  }

  for branch in &plan.branches {
    let indent = "  ".repeat(branch.depth);
    let rel = relative(&plan.root, &branch.dir);
    match (&branch.address, &branch.problem) {
      (Some(address), None) => println!("{indent}{address:<32} {rel}"),
      (_, Some(problem)) => println!("{indent}! {rel}: {problem}"),
      (None, None) => println!("{indent}? {rel}"),
    }
    for source in &branch.sources {
      println!("{indent}  - {}", relative(&branch.dir, source));
    }
  }
  println!();
}

fn relative(base: &Path, path: &Path) -> String {
  path.strip_prefix(base).unwrap_or(path).display().to_string()
}
