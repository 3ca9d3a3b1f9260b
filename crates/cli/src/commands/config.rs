//! Configuration commands

use anyhow::{Context, Result, bail};
use collectord::{RuntimeConfig, config::Config};

/// Show the effective configuration and where it came from
pub fn cmd_config_show(runtime: &RuntimeConfig) -> Result<()> {
  match &runtime.config_path {
    Some(path) => println!("Using config file: {}", path.display()),
    None => println!(
      "Using default configuration (no file at {})",
      Config::user_config_path().display()
    ),
  }
  println!();

  let toml_str = toml::to_string_pretty(&runtime.effective_config()).context("Failed to render configuration")?;
  println!("{}", toml_str);
  Ok(())
}

/// Write the commented template to the user config path
pub fn cmd_config_init(force: bool) -> Result<()> {
  let path = Config::user_config_path();
  if path.exists() && !force {
    bail!("Config file already exists: {} (use --force to overwrite)", path.display());
  }

  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
  }
  std::fs::write(&path, Config::generate_template()).with_context(|| format!("Failed to write {}", path.display()))?;

  println!("Created config: {}", path.display());
  println!("Add [[roots]] entries, then start with: collectord run");
  Ok(())
}
