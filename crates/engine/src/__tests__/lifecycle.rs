//! Component lifecycle as seen through a running engine

use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use super::helpers::{EngineTestContext, wait_for};
use crate::{EngineError, state::CollectorState};

const FAILING: &str = "name = \"flaky\"\nresult = \"noconn\"\nperiod_ms = 50\n";
const STEADY: &str = "name = \"steady\"\nresult = \"complete\"\nperiod_ms = 50\n";

async fn deployed(source: &str, content: &str) -> EngineTestContext {
  let rel = format!("app-orders/{source}");
  let content = content.to_string();
  EngineTestContext::with_root_name("deploy", |root| {
    std::fs::create_dir_all(root.join("app-orders")).unwrap();
    std::fs::write(root.join(&rel), content).unwrap();
  })
  .await
}

#[tokio::test]
async fn test_consecutive_failures_isolate_then_reset_reschedules() {
  let ctx = deployed("flaky.probe", FAILING).await;
  let source = ctx.path("app-orders/flaky.probe");

  assert!(ctx.wait_for_state("app-orders/flaky.probe", CollectorState::Isolated).await);
  let component = ctx.engine.component(&source).await.unwrap();
  assert_eq!(ctx.stats.collects("flaky"), 3);
  assert_eq!(component.consecutive_failures(), 3);

  // An isolated component is off the schedule
  assert!(wait_for(Duration::from_secs(2), || async { !ctx.engine.deployer().scheduler().is_scheduled(&component) }).await);
  tokio::time::sleep(Duration::from_millis(250)).await;
  assert_eq!(ctx.stats.collects("flaky"), 3);

  ctx.engine.reset(&source).await.unwrap();
  assert_eq!(component.consecutive_failures(), 0);
  assert!(ctx.engine.deployer().scheduler().is_scheduled(&component));

  let again = wait_for(Duration::from_secs(5), || async {
    component.state() == CollectorState::Isolated && ctx.stats.collects("flaky") == 6
  })
  .await;
  assert!(again);

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_reset_requires_isolated() {
  let ctx = deployed("steady.probe", STEADY).await;
  let source = ctx.path("app-orders/steady.probe");
  assert!(ctx.wait_for_state("app-orders/steady.probe", CollectorState::Started).await);

  let result = ctx.engine.reset(&source).await;
  assert!(matches!(result, Err(EngineError::Lifecycle(_))));

  let missing = ctx.engine.reset(&ctx.path("app-orders/nope.probe")).await;
  assert!(matches!(missing, Err(EngineError::ComponentNotFound(_))));

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_pause_skips_collections_until_resumed() {
  let ctx = deployed("steady.probe", STEADY).await;
  let source = ctx.path("app-orders/steady.probe");
  assert!(wait_for(Duration::from_secs(5), || async { ctx.stats.collects("steady") > 0 }).await);

  let paused = wait_for(Duration::from_secs(5), || async { ctx.engine.pause(&source).await.is_ok() }).await;
  assert!(paused);
  let component = ctx.engine.component(&source).await.unwrap();
  assert_eq!(component.state(), CollectorState::Paused);

  let before = ctx.stats.collects("steady");
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(ctx.stats.collects("steady"), before);
  // Still on the schedule, just skipping
  assert!(ctx.engine.deployer().scheduler().is_scheduled(&component));

  ctx.engine.resume(&source).await.unwrap();
  assert!(wait_for(Duration::from_secs(5), || async { ctx.stats.collects("steady") > before }).await);

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_blackout_expires_back_to_started() {
  let ctx = deployed("steady.probe", STEADY).await;
  let source = ctx.path("app-orders/steady.probe");
  assert!(ctx.wait_for_state("app-orders/steady.probe", CollectorState::Started).await);

  let blacked_out = wait_for(Duration::from_secs(5), || async {
    ctx.engine.blackout(&source, Duration::from_millis(400)).await.is_ok()
  })
  .await;
  assert!(blacked_out);
  let component = ctx.engine.component(&source).await.unwrap();
  assert_eq!(component.state(), CollectorState::Blackout);

  let before = ctx.stats.collects("steady");
  assert!(ctx.wait_for_state("app-orders/steady.probe", CollectorState::Started).await);
  assert!(wait_for(Duration::from_secs(5), || async { ctx.stats.collects("steady") > before }).await);

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_start_failure_is_bust_and_retried_on_touch() {
  let ctx = deployed("needy.probe", "name = \"needy\"\nneeds = [\"datasource\"]\n").await;
  let source = ctx.path("app-orders/needy.probe");
  let branch = ctx.engine.branch("app=orders").unwrap();

  let snapshot = branch.snapshot().await;
  assert_eq!(snapshot.components.len(), 1);
  assert_eq!(snapshot.components[0].state, CollectorState::Bust);
  assert_eq!(snapshot.components[0].name.as_deref(), Some("needy"));
  assert!(snapshot.components[0].error.as_deref().unwrap().contains("datasource"));
  assert!(ctx.engine.component(&source).await.is_none());
  assert_eq!(ctx.stats.starts("needy"), 0);

  ctx
    .engine
    .host()
    .root_scope()
    .register_bean("datasource", Arc::new(42u32))
    .unwrap();
  ctx.touch("app-orders/needy.probe");

  assert!(ctx.wait_for_state("app-orders/needy.probe", CollectorState::Started).await);
  assert_eq!(ctx.stats.starts("needy"), 1);

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_refused_start_leaves_no_schedule() {
  let ctx = deployed("grumpy.probe", "name = \"grumpy\"\nresult = \"complete\"\nperiod_ms = 50\nfail_start = true\n").await;
  let branch = ctx.engine.branch("app=orders").unwrap();

  let snapshot = branch.snapshot().await;
  assert_eq!(snapshot.components[0].state, CollectorState::Bust);
  assert!(ctx.engine.deployer().scheduler().is_empty());
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!(ctx.stats.collects("grumpy"), 0);

  ctx.engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_every_component() {
  let ctx = EngineTestContext::with_root_name("deploy", |root| {
    std::fs::create_dir_all(root.join("app-orders/env-prod")).unwrap();
    std::fs::write(root.join("app-orders/steady.probe"), STEADY).unwrap();
    std::fs::write(root.join("app-orders/env-prod/db.probe"), "name = \"db\"\n").unwrap();
  })
  .await;
  assert!(ctx.wait_for_state("app-orders/steady.probe", CollectorState::Started).await);

  ctx.engine.shutdown().await;

  assert_eq!(ctx.stats.stops("steady"), 1);
  assert_eq!(ctx.stats.stops("db"), 1);
  assert!(ctx.engine.roots().is_empty());
  assert!(ctx.engine.cancel_token().is_cancelled());
  let status = ctx.engine.status().await;
  assert!(status.branches.is_empty());
  assert!(status.scheduled.is_empty());
}

#[tokio::test]
async fn test_undeploy_cuts_off_hung_interruptible_collection() {
  let hung = "name = \"hung\"\nresult = \"complete\"\nperiod_ms = 50\ncollect_ms = 10000\ninterruptible = true\n";
  let ctx = deployed("hung.probe", hung).await;
  assert!(wait_for(Duration::from_secs(10), || async { ctx.stats.collects("hung") == 1 }).await);

  let active_collections = || async {
    ctx
      .engine
      .status()
      .await
      .pools
      .into_iter()
      .find(|p| p.name == "collections")
      .map(|p| p.active)
      .unwrap_or(0)
  };
  assert_eq!(active_collections().await, 1);

  ctx.remove("app-orders/hung.probe").await;
  assert!(ctx.wait_for_gone("app-orders/hung.probe").await);
  // Interrupt is ignored, so the worker is reclaimed once the grace period runs out
  assert!(
    wait_for(Duration::from_secs(2), || async { active_collections().await == 0 }).await,
    "hung collection should be cancelled after the grace period"
  );
  assert_eq!(ctx.stats.interrupts(), 1);
  assert_eq!(ctx.stats.collects("hung"), 1);

  ctx.engine.shutdown().await;
}
