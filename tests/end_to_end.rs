use std::fs;
use std::path::Path;
use std::process::Command;

use cauldron::Error;
use cauldron::fetcher::sha256_file;
use cauldron::interpreter::{BuildOptions, Interpreter};
use cauldron::platform::HostPlatform;
use cauldron::registry::Registry;
use cauldron::resolver::{self, Closure};
use cauldron::steps::{StepRegistry, register_build_defaults, register_test_defaults};
use cauldron::testrunner::TestRunner;
use tempfile::tempdir;

/// A local git repository standing in for the quiche upstream.
fn init_quiche_upstream(root: &Path) -> String {
    let repo = root.join("quiche-upstream");
    fs::create_dir_all(repo.join("quiche")).unwrap();
    fs::write(
        repo.join("quiche/Cargo.toml"),
        "[lib]\ncrate-type = [\"lib\", \"cdylib\"]\n",
    )
    .unwrap();

    let git = |args: &[&str]| {
        let status = Command::new("git")
            .args([
                "-c",
                "user.name=cauldron-test",
                "-c",
                "user.email=cauldron@test.invalid",
            ])
            .args(args)
            .current_dir(&repo)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    };
    git(&["init", "-q", "-b", "master"]);
    git(&["add", "."]);
    git(&["commit", "-q", "-m", "import"]);

    repo.display().to_string()
}

fn library_recipe(name: &str, source_url: &str, sha256: &str) -> String {
    format!(
        r#"name: {name}
version: '1.0'
source:
  url: {source_url}
  sha256: {sha256}
build:
  - step: run
    params:
      command: sh
      args: ["-c", "mkdir -p {{prefix}} && touch {{prefix}}/installed"]
"#
    )
}

#[test]
fn curl_shaped_build_resolves_builds_and_reports_test_failure() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let recipes_dir = root.join("recipes");
    fs::create_dir_all(&recipes_dir).unwrap();

    // Upstream payloads served over file://.
    let payload = root.join("payload.bin");
    fs::write(&payload, b"upstream source payload").unwrap();
    let payload_url = format!("file://{}", payload.display());
    let payload_sha = sha256_file(&payload).unwrap();
    let quiche_git = init_quiche_upstream(root);

    let libraries = [
        "brotli",
        "libidn2",
        "libnghttp2",
        "libssh2",
        "openldap",
        "rtmpdump",
        "zstd",
    ];
    for name in libraries {
        fs::write(
            recipes_dir.join(format!("{name}.yaml")),
            library_recipe(name, &payload_url, &payload_sha),
        )
        .unwrap();
    }

    // quiche: git source, a pre-build substitution, and a cargo-style
    // compile step that installs a static lib.
    fs::write(
        recipes_dir.join("quiche.yaml"),
        format!(
            r#"name: quiche
version: master
source:
  git: file://{quiche_git}
  branch: master
build:
  - step: substitute
    params:
      file: quiche/Cargo.toml
      pattern: '(?m)^crate-type = .*'
      replace: 'crate-type = ["staticlib"]'
  - step: run
    params:
      command: sh
      args:
        - "-c"
        - "grep -q staticlib quiche/Cargo.toml && mkdir -p {{prefix}}/lib && touch {{prefix}}/lib/libquiche.a"
"#
        ),
    )
    .unwrap();

    // curl: build-only quiche dependency, seven runtime libraries, one
    // host-provided dependency, and a test sequence whose final fetch-check
    // is doomed to fail.
    fs::write(
        recipes_dir.join("curl.yaml"),
        format!(
            r#"name: curl
version: '8.18.0'
source:
  url: {payload_url}
  sha256: {payload_sha}
dependencies:
  - name: quiche
    scope: build
  - name: brotli
  - name: libidn2
  - name: libnghttp2
  - name: libssh2
  - name: openldap
  - name: rtmpdump
  - name: zstd
  - name: posix-shell
    scope: host
    probe: sh
build:
  - step: run
    params:
      command: sh
      args:
        - "-c"
        - "test -f {{dep:quiche}}/lib/libquiche.a"
  - step: run
    params:
      command: sh
      args:
        - "-c"
        - "mkdir -p {{prefix}}/bin && printf '#!/bin/sh\necho curl-ok > \"$1\"\n' > {{prefix}}/bin/curl && chmod +x {{prefix}}/bin/curl"
test:
  - step: run
    params:
      command: "{{prefix}}/bin/curl"
      args: ["out.txt"]
  - step: assert_exists
    params:
      path: out.txt
  - step: checksum
    params:
      path: out.txt
      sha256: 5a237fcf13db5b6b5c8fd2a4a5f2ab47c571e2dfe5ce901d553a2a01d9f62742
  - step: fetch_check
    params:
      url: {payload_url}
      sha256: "{bad_sha}"
"#,
            bad_sha = "0".repeat(64),
        ),
    )
    .unwrap();

    let registry = Registry::load_dir(&recipes_dir).unwrap();

    // Resolution: quiche and all seven libraries strictly before curl, the
    // host-provided dependency probed but never ordered.
    let order = resolver::resolve(&registry, "curl", Closure::Build, true).unwrap();
    let position = |name: &str| order.iter().position(|n| n == name).unwrap();
    for dep in libraries.iter().copied().chain(std::iter::once("quiche")) {
        assert!(position(dep) < position("curl"), "'{dep}' must precede curl");
    }
    assert!(!order.iter().any(|n| n == "posix-shell"));

    // Build the whole closure in resolved order.
    let mut build_steps = StepRegistry::new();
    register_build_defaults(&mut build_steps);
    let prefix_root = root.join("cellar");
    let interpreter = Interpreter::new(
        &registry,
        &build_steps,
        HostPlatform::Linux,
        prefix_root.clone(),
    )
    .unwrap();
    let opts = BuildOptions {
        head: false,
        dry_run: false,
        jobs: 1,
    };
    for entry in &order {
        let recipe = registry.lookup(entry).unwrap();
        interpreter
            .build(recipe, &root.join("work").join(entry), &opts)
            .unwrap();
    }

    let curl_bin = prefix_root.join("curl/8.18.0/bin/curl");
    assert!(curl_bin.exists());
    assert!(prefix_root.join("quiche/master/lib/libquiche.a").exists());

    // Test phase: steps 1 and 2 pass, the fetch-check fails, and the
    // install is not rolled back.
    let mut test_steps = StepRegistry::new();
    register_test_defaults(&mut test_steps);
    let runner = TestRunner::new(
        &registry,
        &test_steps,
        HostPlatform::Linux,
        prefix_root.clone(),
        1,
    );
    let curl = registry.lookup("curl").unwrap();
    let err = runner.run(curl, &root.join("test-scratch")).unwrap_err();
    match err {
        Error::TestFailure { index, reason } => {
            assert_eq!(index, 4);
            assert!(reason.contains("mismatch"), "reason: {reason}");
        }
        other => panic!("expected TestFailure, got {other:?}"),
    }
    assert!(curl_bin.exists(), "install must survive a test failure");

    let snapshot = runner.metrics().snapshot();
    assert_eq!(snapshot.test_passes, 3);
    assert_eq!(snapshot.test_failures, 1);
}
