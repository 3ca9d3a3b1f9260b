//! Hierarchical branch addresses
//!
//! A deployment branch is a directory named `key-value`. Its address is the set
//! of `key=value` segments contributed by the directory itself and every
//! consecutive dash-named ancestor above it. The first ancestor that does not
//! parse (or the deployment root) terminates the chain.
//!
//! The address is an unordered label set: `{app=orders, env=prod}` is the same
//! address no matter which of the two directories is nested inside the other.
//! It is stored as a `BTreeSet` so display and hashing are stable.

use std::{
  collections::BTreeSet,
  fmt,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Key reserved for addressing components inside a branch.
///
/// A directory named `component-foo` would collide with the management
/// address of a component called `foo`, so it is rejected.
pub const RESERVED_KEY: &str = "component";

/// One `key=value` pair parsed from a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Segment {
  pub key: String,
  pub value: String,
}

impl Segment {
  /// Parse a directory name of the form `key-value`, splitting at the first `-`.
  ///
  /// Both halves must be non-empty and may not contain the characters the
  /// management address uses as separators (`=`, `,`, `:`).
  pub fn parse(name: &str) -> Option<Self> {
    let (key, value) = name.split_once('-')?;
    if key.is_empty() || value.is_empty() {
      return None;
    }
    if [key, value].iter().any(|s| s.contains(['=', ',', ':'])) {
      return None;
    }
    Some(Self {
      key: key.to_string(),
      value: value.to_string(),
    })
  }

  /// Parse the final component of a directory path.
  pub fn from_dir(dir: &Path) -> Option<Self> {
    dir.file_name().and_then(|n| n.to_str()).and_then(Self::parse)
  }

  pub fn is_reserved(&self) -> bool {
    self.key == RESERVED_KEY
  }
}

impl fmt::Display for Segment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}={}", self.key, self.value)
  }
}

/// Unordered set of segments identifying a branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchAddress(BTreeSet<Segment>);

impl BranchAddress {
  pub fn new(segments: impl IntoIterator<Item = Segment>) -> Self {
    Self(segments.into_iter().collect())
  }

  pub fn segments(&self) -> impl Iterator<Item = &Segment> {
    self.0.iter()
  }

  pub fn contains(&self, segment: &Segment) -> bool {
    self.0.contains(segment)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Look up the value bound to `key`, if any.
  pub fn get(&self, key: &str) -> Option<&str> {
    self.0.iter().find(|s| s.key == key).map(|s| s.value.as_str())
  }

  /// Parse the display form (`app=orders,env=prod`) back into an address.
  pub fn parse(text: &str) -> Option<Self> {
    let mut segments = BTreeSet::new();
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
      let (key, value) = part.split_once('=')?;
      segments.insert(Segment {
        key: key.trim().to_string(),
        value: value.trim().to_string(),
      });
    }
    if segments.is_empty() { None } else { Some(Self(segments)) }
  }
}

impl fmt::Display for BranchAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut first = true;
    for segment in &self.0 {
      if !first {
        f.write_str(",")?;
      }
      write!(f, "{}", segment)?;
      first = false;
    }
    Ok(())
  }
}

/// Result of resolving a directory into its address chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
  /// The directory's own segment
  pub segment: Segment,
  /// Full address (own segment plus all contributing ancestors)
  pub address: BranchAddress,
  /// Nearest ancestor directory that contributed a segment, with its address
  pub parent: Option<(PathBuf, BranchAddress)>,
}

/// Why a directory cannot be a branch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
  #[error("directory name is not of the form key-value: {0}")]
  Unparsable(PathBuf),
  #[error("directory uses the reserved key '{RESERVED_KEY}': {0}")]
  Reserved(PathBuf),
}

/// Compute the address of `dir`.
///
/// Ancestors are walked upward while they parse as `key-value`. The walk also
/// stops at `boundary` (the deployment root): nothing at or above it
/// contributes a segment.
pub fn resolve_address(dir: &Path, boundary: Option<&Path>) -> Result<ResolvedAddress, AddressError> {
  let segment = Segment::from_dir(dir).ok_or_else(|| AddressError::Unparsable(dir.to_path_buf()))?;
  if segment.is_reserved() {
    return Err(AddressError::Reserved(dir.to_path_buf()));
  }

  // nearest-first
  let mut chain: Vec<(PathBuf, Segment)> = Vec::new();
  let mut current = dir.parent();
  while let Some(ancestor) = current {
    if boundary.is_some_and(|b| ancestor == b) || ancestor.parent().is_none() {
      break;
    }
    match Segment::from_dir(ancestor) {
      Some(seg) if !seg.is_reserved() => chain.push((ancestor.to_path_buf(), seg)),
      _ => break,
    }
    current = ancestor.parent();
  }

  let parent = chain
    .first()
    .map(|(path, _)| (path.clone(), BranchAddress::new(chain.iter().map(|(_, s)| s.clone()))));
  let address = BranchAddress::new(chain.into_iter().map(|(_, s)| s).chain(std::iter::once(segment.clone())));

  Ok(ResolvedAddress {
    segment,
    address,
    parent,
  })
}
