//! Directory-driven deployment: the branch tree, branch bootstrap and the
//! deployer that maps file events onto components

pub mod bootstrap;
pub mod branch;
pub mod deployer;
pub mod plan;
pub mod tree;

pub use bootstrap::{BootstrapError, Bootstrapper, LIB_DIR};
pub use branch::{Branch, BranchRuntime, BranchSnapshot, ComponentSnapshot, Slot};
pub use deployer::{Deployer, DeployerParts};
pub use plan::{PlannedBranch, RootPlan, plan, plan_root};
pub use tree::{DeploymentRoot, DeploymentTree, TreeError};
