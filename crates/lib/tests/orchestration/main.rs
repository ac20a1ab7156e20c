//! End-to-end builds of small script projects through the orchestrator.

#![cfg(unix)]

mod common;

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;

use common::*;
use nbuild_lib::builder::BuildError;
use nbuild_lib::hooks::Hook;
use nbuild_lib::lock::{FileLock, LockMode};
use nbuild_lib::orchestrate::{BuildRequest, BuildState};
use nbuild_lib::recipe::HookPoint;

fn targets(names: &[&str]) -> BuildRequest {
  BuildRequest {
    targets: names.iter().map(|n| n.to_string()).collect(),
    ..BuildRequest::default()
  }
}

/// Dependents check that their dependencies are already installed.
fn needs(dep: &str) -> String {
  format!("test -f {{install_root}}/lib/{dep}.txt")
}

#[tokio::test]
async fn diamond_builds_dependencies_first() {
  let ws = Workspace::new();
  let (needs_a, needs_b, needs_c) = (needs("A"), needs("B"), needs("C"));
  let orchestrator = ws.orchestrator(vec![
    ws.project("D", &["B", "C"], &[needs_b.as_str(), needs_c.as_str(), COMPILE], ""),
    ws.project("C", &["A"], &[needs_a.as_str(), COMPILE], ""),
    ws.project("B", &["A"], &[needs_a.as_str(), COMPILE], ""),
    ws.project("A", &[], &[COMPILE], ""),
  ]);

  let summary = run(&orchestrator, targets(&["D"])).await;

  assert!(summary.is_success(), "{summary:?}");
  assert_eq!(summary.exit_code(), 0);
  assert_eq!(position(&summary, "A"), 0);
  assert_eq!(position(&summary, "D"), 3);
  for name in ["A", "B", "C", "D"] {
    assert_eq!(summary.state(name), Some(&BuildState::Done));
    let installed = ws.installed(&format!("lib/{name}.txt"));
    assert_eq!(read(&installed), format!("source of {name}\n"));
  }
}

#[tokio::test]
async fn failure_skips_dependents_but_not_independent_projects() {
  let ws = Workspace::new();
  let orchestrator = ws.orchestrator(vec![
    ws.project("X", &[], &["exit 3"], ""),
    ws.project("Y", &["X"], &[COMPILE], ""),
    ws.project("Z", &[], &[COMPILE], ""),
  ]);

  let summary = run(&orchestrator, targets(&["Y", "Z"])).await;

  match summary.state("X") {
    Some(BuildState::Failed { reason }) => assert!(reason.contains("exit code 3"), "{reason}"),
    other => panic!("unexpected state for X: {other:?}"),
  }
  assert_eq!(
    summary.state("Y"),
    Some(&BuildState::SkippedDueToDependencyFailure { failed: "X".to_string() })
  );
  assert_eq!(summary.state("Z"), Some(&BuildState::Done));
  assert_eq!(summary.exit_code(), 1);
  assert!(!ws.installed("lib/Y.txt").exists());
  assert!(ws.installed("lib/Z.txt").exists());
}

#[tokio::test]
async fn unchanged_rerun_is_up_to_date() {
  let ws = Workspace::new();
  let needs_a = needs("A");
  let projects = || {
    vec![
      ws.project("A", &[], &[COMPILE], ""),
      ws.project("B", &["A"], &[needs_a.as_str(), COMPILE], ""),
    ]
  };

  let first = run(&ws.orchestrator(projects()), targets(&["B"])).await;
  assert!(first.is_success());
  assert!(first.projects.iter().all(|p| !p.up_to_date));
  let manifest = ws.manifest_bytes();

  let second = run(&ws.orchestrator(projects()), targets(&["B"])).await;
  assert!(second.is_success());
  assert!(second.projects.iter().all(|p| p.up_to_date), "{second:?}");
  assert_eq!(ws.manifest_bytes(), manifest);
}

#[tokio::test]
async fn rebuild_set_only_rebuilds_named_projects() {
  let ws = Workspace::new();
  let needs_a = needs("A");
  let projects = || {
    vec![
      ws.project("A", &[], &[COMPILE], ""),
      ws.project("B", &["A"], &[needs_a.as_str(), COMPILE], ""),
    ]
  };
  run(&ws.orchestrator(projects()), targets(&["B"])).await;

  let request = BuildRequest {
    rebuild: BTreeSet::from(["B".to_string()]),
    ..targets(&["B"])
  };
  let summary = run(&ws.orchestrator(projects()), request).await;

  assert!(summary.is_success());
  assert!(summary.get("A").unwrap().up_to_date);
  assert!(!summary.get("B").unwrap().up_to_date);
}

#[tokio::test]
async fn environment_pushes_stay_in_their_project() {
  let ws = Workspace::new();
  let show = r#"printf '%s' "${NBUILD_TEST_FOO:-unset}" > built.txt"#;
  let orchestrator = ws.orchestrator(vec![
    ws.project(
      "E",
      &[],
      &[show],
      "[[env]]\nvar = \"NBUILD_TEST_FOO\"\nvalue = \"from-{name}\"\n",
    ),
    ws.project("F", &["E"], &[show], ""),
  ]);

  let summary = run(&orchestrator, targets(&["F"])).await;

  assert!(summary.is_success(), "{summary:?}");
  assert_eq!(read(&ws.installed("lib/E.txt")), "from-E");
  assert_eq!(read(&ws.installed("lib/F.txt")), "unset");
}

#[tokio::test]
async fn patches_apply_once_per_extraction() {
  let mut ws = Workspace::new();
  let root = ws.root();
  let log = root.join("patch.log");
  let fake_patch = root.join("fake-patch");
  fs::write(&fake_patch, format!("#!/bin/sh\necho \"$5\" >> {}\n", log.display())).unwrap();
  fs::set_permissions(&fake_patch, fs::Permissions::from_mode(0o755)).unwrap();
  fs::create_dir_all(&ws.config.patch_dir).unwrap();
  fs::write(ws.config.patch_dir.join("0001-fix.patch"), "--- a\n+++ b\n").unwrap();
  ws.config.programs.patch = fake_patch.to_string_lossy().into_owned();

  let project = || ws.project("P", &[], &[COMPILE], "patches = [\"0001-fix.patch\"]");
  let first = run(&ws.orchestrator(vec![project()]), targets(&["P"])).await;
  assert!(first.is_success(), "{first:?}");
  assert_eq!(read(&log).lines().count(), 1);

  // A missing installed file forces a rebuild, but the extracted and
  // patched source is reused.
  fs::remove_file(ws.installed("lib/P.txt")).unwrap();
  let second = run(&ws.orchestrator(vec![project()]), targets(&["P"])).await;
  assert!(second.is_success(), "{second:?}");
  assert!(!second.get("P").unwrap().up_to_date);
  assert!(ws.installed("lib/P.txt").exists());
  assert_eq!(read(&log).lines().count(), 1);
}

#[tokio::test]
async fn added_patch_is_applied_to_a_fresh_tree() {
  let mut ws = Workspace::new();
  let root = ws.root();
  let log = root.join("patch.log");
  let fake_patch = root.join("fake-patch");
  fs::write(
    &fake_patch,
    format!(
      "#!/bin/sh\nname=$(basename \"$5\")\ntest ! -f \"$name.done\" || exit 1\ntouch \"$name.done\"\necho \"$name\" >> {}\n",
      log.display()
    ),
  )
  .unwrap();
  fs::set_permissions(&fake_patch, fs::Permissions::from_mode(0o755)).unwrap();
  fs::create_dir_all(&ws.config.patch_dir).unwrap();
  fs::write(ws.config.patch_dir.join("0001-fix.patch"), "--- a\n+++ b\n").unwrap();
  fs::write(ws.config.patch_dir.join("0002-new.patch"), "--- a\n+++ b\n").unwrap();
  ws.config.programs.patch = fake_patch.to_string_lossy().into_owned();

  let first = ws.project("P", &[], &[COMPILE], "patches = [\"0001-fix.patch\"]");
  let summary = run(&ws.orchestrator(vec![first]), targets(&["P"])).await;
  assert!(summary.is_success(), "{summary:?}");

  let grown = ws.project("P", &[], &[COMPILE], "patches = [\"0001-fix.patch\", \"0002-new.patch\"]");
  let summary = run(&ws.orchestrator(vec![grown]), targets(&["P"])).await;
  assert!(summary.is_success(), "{summary:?}");
  assert!(!summary.get("P").unwrap().up_to_date);

  // The tree was re-extracted, so both patches went onto pristine sources.
  assert_eq!(
    read(&log).lines().collect::<Vec<_>>(),
    vec!["0001-fix.patch", "0001-fix.patch", "0002-new.patch"]
  );
}

#[tokio::test]
async fn post_install_copy_is_installed_and_recorded() {
  let ws = Workspace::new();
  let project = || {
    ws.project(
      "G",
      &[],
      &[COMPILE],
      r#"
[[hooks]]
at = "post_install"
kind = "copy"
from = "src.txt"
to = "share/doc/G"
"#,
    )
  };

  let summary = run(&ws.orchestrator(vec![project()]), targets(&["G"])).await;
  assert!(summary.is_success(), "{summary:?}");
  assert_eq!(read(&ws.installed("share/doc/G/src.txt")), "source of G\n");
  assert!(ws.installed("lib/G.txt").is_file());

  let manifest: serde_json::Value = serde_json::from_slice(&ws.manifest_bytes()).unwrap();
  let files = &manifest["projects"]["G"]["files"];
  assert!(files.as_array().unwrap().iter().any(|f| f == "share/doc/G/src.txt"), "{files}");

  let again = run(&ws.orchestrator(vec![project()]), targets(&["G"])).await;
  assert!(again.get("G").unwrap().up_to_date);
}

#[tokio::test]
async fn post_install_hook_sees_installed_files() {
  let ws = Workspace::new();
  let project = ws
    .project("H", &[], &[COMPILE], "")
    .with_hook(Hook::func(HookPoint::PostInstall, "check-installed", |cx| {
      let installed = cx.install_root.join("lib").join(format!("{}.txt", cx.project.name()));
      if !installed.is_file() {
        return Err(BuildError::Hook {
          point: HookPoint::PostInstall,
          name: "check-installed".to_string(),
          reason: format!("{} missing", installed.display()),
        });
      }
      fs::write(cx.install_root.join("hook.txt"), cx.version).map_err(|source| BuildError::Io {
        path: cx.install_root.join("hook.txt"),
        source,
      })
    }));

  let summary = run(&ws.orchestrator(vec![project]), targets(&["H"])).await;

  assert!(summary.is_success(), "{summary:?}");
  assert_eq!(read(&ws.installed("hook.txt")), "1.0");
}

#[tokio::test]
async fn locked_project_fails_without_building() {
  let ws = Workspace::new();
  let _held = FileLock::try_acquire(&ws.config.project_lock_path("A"), LockMode::Exclusive, "other build").unwrap();
  let orchestrator = ws.orchestrator(vec![ws.project("A", &[], &[COMPILE], "")]);

  let summary = run(&orchestrator, targets(&["A"])).await;

  match summary.state("A") {
    Some(BuildState::Failed { reason }) => assert!(reason.contains("another process"), "{reason}"),
    other => panic!("unexpected state for A: {other:?}"),
  }
  assert!(!ws.installed("lib/A.txt").exists());
}

#[test]
fn demo_recipes_resolve() {
  let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/recipes");
  let mut registry = nbuild_lib::registry::ProjectRegistry::new();
  registry.load_dir(&dir).unwrap();
  registry.validate().unwrap();

  let graph = nbuild_lib::graph::DependencyGraph::new(&registry);
  let order = graph.order(&["gtk3".to_string()]).unwrap();
  let at = |name: &str| order.iter().position(|n| n == name).unwrap();

  assert_eq!(order.first().map(String::as_str), Some("zlib"));
  assert_eq!(order.last().map(String::as_str), Some("gtk3"));
  assert!(at("freetype") < at("fontconfig"));
  assert!(at("fontconfig") < at("cairo"));
  assert!(at("glib") < at("gtk3"));
  assert!(!order.iter().any(|n| n == "gobject-introspection"));

  let mut with_gi = nbuild_lib::registry::ProjectRegistry::new();
  with_gi
    .load_dir_with_features(&dir, &BTreeSet::from(["gi".to_string()]))
    .unwrap();
  let graph = nbuild_lib::graph::DependencyGraph::new(&with_gi);
  let order = graph.order(&["gtk3".to_string()]).unwrap();
  let at = |name: &str| order.iter().position(|n| n == name).unwrap();
  assert!(at("glib") < at("gobject-introspection"));
  assert!(at("gobject-introspection") < at("gtk3"));
}
