//! Branch discovery, redeploys and teardown driven by filesystem changes

use std::time::Duration;

use pretty_assertions::assert_eq;

use super::helpers::{EngineTestContext, wait_for};
use crate::{
  address::BranchAddress,
  component::ComponentEventKind,
  management::{Managed, ObjectAddress},
  state::{BranchStatus, CollectorState},
};

const HEALTH: &str = "name = \"health\"\nresult = \"complete\"\nperiod_ms = 100\n";

#[tokio::test]
async fn test_keyed_directory_becomes_branch_with_component() {
  let ctx = EngineTestContext::with_root_name("deploy", |root| {
    std::fs::create_dir_all(root.join("app-orders")).unwrap();
    std::fs::write(root.join("app-orders/health.probe"), HEALTH).unwrap();
  })
  .await;

  let branch = ctx.engine.branch("app=orders").expect("branch app=orders");
  assert_eq!(branch.address().to_string(), "app=orders");
  assert!(branch.parent().is_none());
  assert!(ctx.wait_for_state("app-orders/health.probe", CollectorState::Started).await);

  let component = ctx.engine.component(&ctx.path("app-orders/health.probe")).await.unwrap();
  assert_eq!(component.name(), "health");
  assert!(ctx.engine.deployer().scheduler().is_scheduled(&component));
  assert!(wait_for(Duration::from_secs(5), || async { ctx.stats.collects("health") > 0 }).await);

  ctx.remove("app-orders/health.probe").await;
  assert!(ctx.wait_for_gone("app-orders/health.probe").await);
  assert!(wait_for(Duration::from_secs(5), || async { ctx.stats.stops("health") == 1 }).await);
  assert!(!ctx.engine.deployer().scheduler().is_scheduled(&component));

  // The branch outlives its last component
  let branch = ctx.engine.branch("app=orders").expect("branch survives");
  assert!(branch.status().is_ready());
  assert!(branch.components().await.is_empty());

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_burst_of_writes_redeploys_once() {
  let ctx = EngineTestContext::with_root_name("deploy", |root| {
    std::fs::create_dir_all(root.join("app-orders")).unwrap();
    std::fs::write(root.join("app-orders/health.probe"), HEALTH).unwrap();
  })
  .await;
  assert!(ctx.wait_for_state("app-orders/health.probe", CollectorState::Started).await);
  let compiles = ctx.stats.compiles();

  for revision in 1..=5 {
    ctx
      .write("app-orders/health.probe", &format!("{HEALTH}revision = {revision}\n"))
      .await;
    tokio::time::sleep(Duration::from_millis(80)).await;
  }

  assert!(wait_for(Duration::from_secs(5), || async { ctx.stats.starts("health") == 2 }).await);
  // Nothing else trickles in after the settle delay
  tokio::time::sleep(Duration::from_millis(600)).await;
  ctx.settle().await;

  assert_eq!(ctx.stats.compiles(), compiles + 1);
  assert_eq!(ctx.stats.starts("health"), 2);
  assert_eq!(ctx.stats.stops("health"), 1);
  let component = ctx.engine.component(&ctx.path("app-orders/health.probe")).await.unwrap();
  assert_eq!(component.state(), CollectorState::Started);
  assert_eq!(ctx.engine.deployer().scheduler().len(), 1);

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_touch_without_content_change_does_not_recompile() {
  let ctx = EngineTestContext::with_root_name("deploy", |root| {
    std::fs::create_dir_all(root.join("app-orders")).unwrap();
    std::fs::write(root.join("app-orders/health.probe"), HEALTH).unwrap();
  })
  .await;
  assert!(ctx.wait_for_state("app-orders/health.probe", CollectorState::Started).await);
  let compiles = ctx.stats.compiles();

  ctx.touch("app-orders/health.probe");
  tokio::time::sleep(Duration::from_millis(500)).await;
  ctx.settle().await;

  assert_eq!(ctx.stats.compiles(), compiles);
  assert_eq!(ctx.stats.starts("health"), 1);

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_root_name_contributes_no_segment() {
  let ctx = EngineTestContext::with_root_name("env-prod", |root| {
    std::fs::create_dir_all(root.join("app-web")).unwrap();
    std::fs::write(root.join("app-web/ping.probe"), HEALTH).unwrap();
    // Sources directly under a root belong to no branch
    std::fs::write(root.join("stray.probe"), HEALTH).unwrap();
  })
  .await;

  assert!(ctx.engine.branch("app=web").is_some());
  assert!(ctx.engine.branch("env=prod,app=web").is_none());
  assert!(ctx.engine.branch_for_dir(&ctx.root).is_none());
  assert!(ctx.engine.component(&ctx.path("stray.probe")).await.is_none());

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_nested_directory_extends_parent_address() {
  let ctx = EngineTestContext::new().await;

  ctx.mkdir("app-orders").await;
  assert!(ctx.wait_for_branch("app-orders").await);
  ctx.write("app-orders/env-prod/db.probe", HEALTH).await;
  assert!(ctx.wait_for_branch("app-orders/env-prod").await);
  assert!(ctx.wait_for_state("app-orders/env-prod/db.probe", CollectorState::Started).await);

  let parent = ctx.engine.branch("app=orders").unwrap();
  let child = ctx.engine.branch("app=orders,env=prod").expect("nested branch");
  assert_eq!(child.address(), &BranchAddress::parse("app=orders,env=prod").unwrap());
  assert!(std::sync::Arc::ptr_eq(&child.parent().unwrap(), &parent));
  assert_eq!(child.attributes()["segment"], "env=prod");

  // Child scopes hang off the parent scope
  let parent_scope = parent.runtime().unwrap().scope;
  let child_scope = child.runtime().unwrap().scope;
  assert_eq!(child_scope.parent().map(|p| p.id().to_string()).as_deref(), Some(parent_scope.id()));

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_non_keyed_directories_are_ignored() {
  let ctx = EngineTestContext::new().await;

  ctx.write("scratch/notes.probe", HEALTH).await;
  ctx.write("app-orders/misc/other.probe", HEALTH).await;
  assert!(ctx.wait_for_branch("app-orders").await);
  tokio::time::sleep(Duration::from_millis(400)).await;
  ctx.settle().await;

  assert!(ctx.engine.branch_for_dir(&ctx.path("scratch")).is_none());
  assert!(ctx.engine.branch_for_dir(&ctx.path("app-orders/misc")).is_none());
  assert_eq!(ctx.stats.compiles(), 0);

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_compile_error_then_fix() {
  let ctx = EngineTestContext::new().await;

  ctx.write("app-orders/broken.probe", "name = \"broken\"\nresult = ").await;
  let branch_dir = ctx.path("app-orders");
  let source = ctx.path("app-orders/broken.probe");
  let bust = wait_for(Duration::from_secs(10), || async {
    match ctx.engine.branch_for_dir(&branch_dir) {
      Some(branch) => branch
        .snapshot()
        .await
        .components
        .iter()
        .any(|c| c.source == source && c.state == CollectorState::Bust),
      None => false,
    }
  })
  .await;
  assert!(bust);
  assert!(ctx.engine.component(&source).await.is_none());
  assert_eq!(ctx.engine.deployer().scheduler().len(), 0);

  ctx.write("app-orders/broken.probe", HEALTH).await;
  assert!(ctx.wait_for_state("app-orders/broken.probe", CollectorState::Started).await);
  let snapshot = ctx.engine.branch("app=orders").unwrap().snapshot().await;
  assert_eq!(snapshot.components.len(), 1);
  assert_eq!(snapshot.components[0].error, None);

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_empty_lib_archive_breaks_branch_until_fixed() {
  let ctx = EngineTestContext::with_root_name("deploy", |root| {
    std::fs::create_dir_all(root.join("app-orders/lib")).unwrap();
    std::fs::write(root.join("app-orders/lib/driver.jar"), b"").unwrap();
    std::fs::write(root.join("app-orders/health.probe"), HEALTH).unwrap();
  })
  .await;

  let branch = ctx.engine.branch("app=orders").unwrap();
  assert!(branch.status().is_broken());
  assert!(ctx.engine.component(&ctx.path("app-orders/health.probe")).await.is_none());
  assert_eq!(ctx.stats.compiles(), 0);

  ctx.write("app-orders/lib/driver.jar", "PK").await;
  assert!(ctx.wait_for_branch("app-orders").await);
  assert!(ctx.wait_for_state("app-orders/health.probe", CollectorState::Started).await);

  let snapshot = ctx.engine.branch("app=orders").unwrap().snapshot().await;
  assert_eq!(snapshot.namespace, vec![ctx.path("app-orders/lib/driver.jar")]);

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_removing_branch_directory_destroys_it() {
  let ctx = EngineTestContext::with_root_name("deploy", |root| {
    std::fs::create_dir_all(root.join("app-orders/env-prod")).unwrap();
    std::fs::write(root.join("app-orders/health.probe"), HEALTH).unwrap();
    std::fs::write(root.join("app-orders/env-prod/db.probe"), "name = \"db\"\n").unwrap();
  })
  .await;
  let parent = ctx.engine.branch("app=orders").unwrap();
  let child = ctx.engine.branch("app=orders,env=prod").unwrap();
  let branch_addr = ObjectAddress::branch(parent.address());
  let component_addr = ObjectAddress::component(parent.address(), "health");
  assert!(ctx.management.contains(&branch_addr));
  assert!(ctx.management.contains(&component_addr));

  ctx.remove("app-orders").await;
  let gone = wait_for(Duration::from_secs(10), || async {
    ctx.engine.branch("app=orders").is_none() && ctx.engine.branch("app=orders,env=prod").is_none()
  })
  .await;
  assert!(gone);

  assert_eq!(parent.status(), BranchStatus::Destroyed);
  assert_eq!(child.status(), BranchStatus::Destroyed);
  assert!(parent.cancel_token().is_cancelled());
  assert!(child.cancel_token().is_cancelled());
  assert!(!ctx.management.contains(&branch_addr));
  assert!(!ctx.management.contains(&component_addr));
  assert_eq!(ctx.stats.stops("health"), 1);
  assert_eq!(ctx.stats.stops("db"), 1);
  assert!(ctx.engine.deployer().scheduler().is_empty());
  assert!(
    ctx
      .management
      .notifications()
      .iter()
      .any(|n| n.address == branch_addr && n.kind == "branch.destroyed")
  );

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_removing_branch_abandons_inflight_compile() {
  // A single events worker is busy with the slow deploy the whole time
  let ctx = EngineTestContext::with_config(|config| config.pools.events = 1).await;

  // Fully written before the directory shows up under the root
  ctx.write("staging/slow.probe", "name = \"slow\"\ncompile_ms = 3000\n").await;
  tokio::fs::rename(ctx.path("staging"), ctx.path("app-slow")).await.unwrap();
  assert!(wait_for(Duration::from_secs(10), || async { ctx.stats.compiles() == 1 }).await);
  let branch = ctx.engine.branch("app=slow").expect("branch exists while compiling");

  ctx.remove("app-slow").await;
  assert!(
    wait_for(Duration::from_secs(2), || async {
      ctx.engine.branch_for_dir(&ctx.path("app-slow")).is_none()
    })
    .await,
    "branch should be torn down while its compile is still running"
  );
  assert_eq!(branch.status(), BranchStatus::Destroyed);
  assert!(branch.cancel_token().is_cancelled());

  // Past the point the compile would have finished
  tokio::time::sleep(Duration::from_millis(3500)).await;
  assert_eq!(ctx.stats.compiled(), 0);
  assert_eq!(ctx.stats.starts("slow"), 0);
  assert!(ctx.engine.deployer().scheduler().is_empty());

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_listener_sees_sibling_deployments() {
  let ctx = EngineTestContext::with_root_name("deploy", |root| {
    std::fs::create_dir_all(root.join("app-orders")).unwrap();
    std::fs::write(root.join("app-orders/audit.probe"), "name = \"audit\"\nlisten = true\n").unwrap();
  })
  .await;
  assert!(ctx.wait_for_state("app-orders/audit.probe", CollectorState::Started).await);

  ctx.write("app-orders/health.probe", HEALTH).await;
  assert!(ctx.wait_for_state("app-orders/health.probe", CollectorState::Started).await);
  ctx.remove("app-orders/health.probe").await;
  assert!(ctx.wait_for_gone("app-orders/health.probe").await);

  let seen = wait_for(Duration::from_secs(5), || async { ctx.stats.events_for("audit").len() == 2 }).await;
  assert!(seen);
  let events = ctx.stats.events_for("audit");
  assert_eq!(
    events.iter().map(|e| e.kind).collect::<Vec<_>>(),
    vec![ComponentEventKind::Deployed, ComponentEventKind::Undeployed]
  );
  assert!(events.iter().all(|e| e.component == "health" && e.branch == "app=orders"));

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_component_name_is_bust() {
  let ctx = EngineTestContext::with_root_name("deploy", |root| {
    std::fs::create_dir_all(root.join("app-orders")).unwrap();
    std::fs::write(root.join("app-orders/a.probe"), HEALTH).unwrap();
  })
  .await;
  assert!(ctx.wait_for_state("app-orders/a.probe", CollectorState::Started).await);

  ctx.write("app-orders/b.probe", HEALTH).await;
  let branch = ctx.engine.branch("app=orders").unwrap();
  let source = ctx.path("app-orders/b.probe");
  let bust = wait_for(Duration::from_secs(10), || async {
    branch
      .snapshot()
      .await
      .components
      .iter()
      .any(|c| c.source == source && c.state == CollectorState::Bust)
  })
  .await;
  assert!(bust);

  // The first deployment is untouched
  assert_eq!(ctx.stats.starts("health"), 1);
  assert_eq!(ctx.stats.stops("health"), 0);
  assert!(ctx.engine.component(&ctx.path("app-orders/a.probe")).await.is_some());

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_remove_roots_reports_summary() {
  let ctx = EngineTestContext::with_root_name("deploy", |root| {
    std::fs::create_dir_all(root.join("app-orders")).unwrap();
    std::fs::write(root.join("app-orders/health.probe"), HEALTH).unwrap();
  })
  .await;
  let missing = ctx.temp.path().join("missing");

  let summary = ctx.engine.remove_roots(&[ctx.root.clone(), missing.clone()]).await;
  assert_eq!(summary.removed, vec![ctx.root.clone()]);
  assert_eq!(summary.skipped.len(), 1);
  assert_eq!(summary.skipped[0].0, missing);

  assert!(ctx.engine.roots().is_empty());
  assert!(ctx.engine.branch("app=orders").is_none());
  assert_eq!(ctx.stats.stops("health"), 1);

  // Adding it back redeploys from scratch
  let summary = ctx.engine.add_roots(&[ctx.root.clone()]).await;
  assert_eq!(summary.added, vec![ctx.root.clone()]);
  assert!(ctx.wait_for_state("app-orders/health.probe", CollectorState::Started).await);
  assert_eq!(ctx.stats.starts("health"), 2);

  ctx.engine.shutdown().await;
}
