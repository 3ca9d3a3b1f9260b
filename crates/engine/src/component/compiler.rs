//! Component compiler
//!
//! Language compilation is delegated to a `ScriptCompiler`. This module owns
//! what happens around it:
//!
//! - which files are compiled at all (eligibility policy)
//! - the name a component gets when its source does not declare one
//! - capability detection: declared markers are matched against a fixed table
//!   and the object is wrapped in a `ScriptInstance` carrying exactly the
//!   interfaces those markers imply

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use super::capability::{Capability, CapabilitySet, CompiledObject, ScriptError, ScriptInstance};
use crate::{domain::config::DeployConfig, host::Namespace};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
  #[error("Failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{path} is {size} bytes, larger than the {limit} byte limit")]
  TooLarge { path: PathBuf, size: u64, limit: u64 },

  #[error("{0} is not valid UTF-8")]
  NotUtf8(PathBuf),

  #[error("Failed to compile {name}: {source}")]
  Script {
    name: String,
    #[source]
    source: ScriptError,
  },

  #[error("{name} declares the {capability} marker but does not implement it")]
  MissingCapability { name: String, capability: Capability },
}

/// The language runtime that turns source text into a compiled object
#[async_trait]
pub trait ScriptCompiler: Send + Sync {
  /// Whether files at this path are sources for this compiler.
  fn accepts(&self, path: &Path) -> bool;

  async fn compile(
    &self,
    source: &str,
    synthetic_name: &str,
    namespace: &Namespace,
  ) -> Result<Arc<dyn CompiledObject>, ScriptError>;
}

/// A compiled, capability-wrapped component ready to be started
#[derive(Debug, Clone)]
pub struct CompiledComponent {
  pub name: String,
  /// Source file, `None` for inline sources
  pub source: Option<PathBuf>,
  /// SHA-256 of the source text, hex encoded
  pub digest: String,
  pub instance: ScriptInstance,
}

/// Marker spellings, matched case-insensitively with any leading `@` dropped
const MARKERS: &[(&str, Capability)] = &[
  ("collector", Capability::Collector),
  ("schedule", Capability::Schedulable),
  ("schedulable", Capability::Schedulable),
  ("listener", Capability::EventListener),
  ("eventlistener", Capability::EventListener),
  ("inject", Capability::Dependent),
  ("dependent", Capability::Dependent),
  ("connector", Capability::Connector),
  ("named", Capability::Named),
  ("lifecycle", Capability::Lifecycle),
];

/// Hex SHA-256 of a source text.
pub fn digest(bytes: &[u8]) -> String {
  hex::encode(Sha256::digest(bytes))
}

/// Capability set implied by a list of markers. Unknown markers are ignored.
pub fn detect_capabilities(markers: &[String]) -> CapabilitySet {
  markers
    .iter()
    .filter_map(|marker| {
      let normalized = marker.trim().trim_start_matches('@').to_lowercase();
      let found = MARKERS.iter().find(|(name, _)| *name == normalized).map(|(_, c)| *c);
      if found.is_none() {
        trace!(marker = %marker, "Ignoring unknown marker");
      }
      found
    })
    .collect()
}

/// Name for a component whose source does not declare one.
///
/// File sources become `<stem>_<8 hex>`, inline sources `inline_<8 hex>`.
pub fn synthetic_name(source: Option<&Path>, digest: &str) -> String {
  let short = &digest[..digest.len().min(8)];
  let stem = source
    .and_then(|p| p.file_stem())
    .and_then(|s| s.to_str())
    .map(|s| {
      s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
    })
    .filter(|s| !s.is_empty());
  match stem {
    Some(stem) => format!("{stem}_{short}"),
    None => format!("inline_{short}"),
  }
}

pub struct ComponentCompiler {
  script: Arc<dyn ScriptCompiler>,
  max_source_bytes: u64,
  ignore_hidden: bool,
}

impl ComponentCompiler {
  pub fn new(script: Arc<dyn ScriptCompiler>, config: &DeployConfig) -> Self {
    Self {
      script,
      max_source_bytes: config.max_source_bytes,
      ignore_hidden: config.ignore_hidden,
    }
  }

  /// Whether a file under a branch is watched and compiled at all.
  ///
  /// Dot-files and editor leftovers are skipped when `ignore_hidden` is set.
  /// Anything else is up to the script compiler.
  pub fn is_eligible(&self, path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
      return false;
    };
    if self.ignore_hidden
      && (name.starts_with('.') || name.ends_with('~') || name.ends_with(".swp") || name.ends_with(".tmp"))
    {
      return false;
    }
    self.script.accepts(path)
  }

  /// Read a source file, enforcing the size limit. Returns the text and its digest.
  pub async fn read_source(&self, path: &Path) -> Result<(String, String), CompileError> {
    let meta = tokio::fs::metadata(path).await.map_err(|source| CompileError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    if meta.len() > self.max_source_bytes {
      return Err(CompileError::TooLarge {
        path: path.to_path_buf(),
        size: meta.len(),
        limit: self.max_source_bytes,
      });
    }

    let bytes = tokio::fs::read(path).await.map_err(|source| CompileError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let text = String::from_utf8(bytes).map_err(|_| CompileError::NotUtf8(path.to_path_buf()))?;
    let digest = digest(text.as_bytes());
    Ok((text, digest))
  }

  /// Read, digest and compile a source file.
  pub async fn compile_file(&self, path: &Path, namespace: &Namespace) -> Result<CompiledComponent, CompileError> {
    let (text, _) = self.read_source(path).await?;
    self.compile_source(&text, Some(path), namespace).await
  }

  /// Compile source text. `origin` is the file it came from, if any.
  pub async fn compile_source(
    &self,
    text: &str,
    origin: Option<&Path>,
    namespace: &Namespace,
  ) -> Result<CompiledComponent, CompileError> {
    let digest = digest(text.as_bytes());
    let synthetic = synthetic_name(origin, &digest);

    let object = self
      .script
      .compile(text, &synthetic, namespace)
      .await
      .map_err(|source| CompileError::Script {
        name: synthetic.clone(),
        source,
      })?;

    let capabilities = detect_capabilities(&object.markers());
    let instance = adapt(object, capabilities).map_err(|capability| CompileError::MissingCapability {
      name: synthetic.clone(),
      capability,
    })?;

    let name = instance
      .named()
      .map(|n| n.name())
      .filter(|n| !n.trim().is_empty())
      .unwrap_or(synthetic);

    debug!(
      component = %name,
      capabilities = %capabilities,
      namespace = namespace.name(),
      "Compiled component"
    );

    Ok(CompiledComponent {
      name,
      source: origin.map(Path::to_path_buf),
      digest,
      instance,
    })
  }
}

/// Attach one interface per detected capability.
fn adapt(object: Arc<dyn CompiledObject>, capabilities: CapabilitySet) -> Result<ScriptInstance, Capability> {
  let mut instance = ScriptInstance {
    capabilities,
    ..Default::default()
  };
  for capability in capabilities.iter() {
    let obj = Arc::clone(&object);
    let attached = match capability {
      Capability::Lifecycle => obj.as_lifecycle().map(|i| instance.lifecycle = Some(i)),
      Capability::Collector => obj.as_collector().map(|i| instance.collector = Some(i)),
      Capability::Schedulable => obj.as_schedulable().map(|i| instance.schedulable = Some(i)),
      Capability::EventListener => obj.as_event_listener().map(|i| instance.event_listener = Some(i)),
      Capability::Dependent => obj.as_dependent().map(|i| instance.dependent = Some(i)),
      Capability::Connector => obj.as_connector().map(|i| instance.connector = Some(i)),
      Capability::Named => obj.as_named().map(|i| instance.named = Some(i)),
    };
    if attached.is_none() {
      return Err(capability);
    }
  }
  Ok(instance)
}
