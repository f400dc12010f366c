use cauldron::recipe::Recipe;
use cauldron::registry::Registry;
use cauldron::steps::{StepRegistry, register_build_defaults, register_test_defaults};
use cauldron::validation::validate_recipe;

fn registries() -> (StepRegistry, StepRegistry) {
    let mut build = StepRegistry::new();
    register_build_defaults(&mut build);
    let mut test = StepRegistry::new();
    register_test_defaults(&mut test);
    (build, test)
}

fn recipe_from(yaml: &str) -> Recipe {
    serde_yaml::from_str(yaml).unwrap()
}

#[test]
fn remote_archive_without_hash_is_an_error() {
    let recipe = recipe_from(
        "name: demo\nversion: '1.0'\nsource:\n  url: https://example.org/demo-1.0.tar.gz\n",
    );
    let (build, test) = registries();
    let report = validate_recipe(&recipe, None, &build, &test);
    assert!(!report.is_ok());
    assert!(
        report.errors.iter().any(|e| e.contains("sha256")),
        "errors: {:?}",
        report.errors
    );
}

#[test]
fn unknown_step_kind_is_an_error() {
    let recipe = recipe_from(
        r#"name: demo
version: '1.0'
source:
  git: https://example.org/demo.git
build:
  - step: conjure
"#,
    );
    let (build, test) = registries();
    let report = validate_recipe(&recipe, None, &build, &test);
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("build step 1") && e.contains("conjure")),
        "errors: {:?}",
        report.errors
    );
}

#[test]
fn undeclared_dep_reference_is_an_error() {
    let recipe = recipe_from(
        r#"name: demo
version: '1.0'
source:
  git: https://example.org/demo.git
build:
  - step: run
    params:
      command: ./configure
      args: ["--with-quiche={dep:quiche}"]
"#,
    );
    let (build, test) = registries();
    let report = validate_recipe(&recipe, None, &build, &test);
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("undeclared dependency 'quiche'")),
        "errors: {:?}",
        report.errors
    );
}

#[test]
fn host_dep_reference_has_no_prefix() {
    let recipe = recipe_from(
        r#"name: demo
version: '1.0'
source:
  git: https://example.org/demo.git
dependencies:
  - name: krb5
    scope: host
build:
  - step: run
    params:
      command: ./configure
      args: ["--with-gssapi={dep:krb5}"]
"#,
    );
    let (build, test) = registries();
    let report = validate_recipe(&recipe, None, &build, &test);
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("host-provided")),
        "errors: {:?}",
        report.errors
    );
}

#[test]
fn missing_registry_dependency_is_reported_when_registry_is_known() {
    let recipe = recipe_from(
        r#"name: demo
version: '1.0'
source:
  git: https://example.org/demo.git
dependencies:
  - name: ghost
"#,
    );
    let registry = Registry::from_recipes(vec![recipe.clone()]).unwrap();
    let (build, test) = registries();
    let report = validate_recipe(&recipe, Some(&registry), &build, &test);
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("'ghost'") && e.contains("not in the registry")),
        "errors: {:?}",
        report.errors
    );
}

#[test]
fn livecheck_without_capture_group_warns() {
    let recipe = recipe_from(
        r#"name: demo
version: '1.0'
source:
  git: https://example.org/demo.git
livecheck:
  url: https://example.org/downloads/
  pattern: 'demo-[0-9.]+\.tar'
"#,
    );
    let (build, test) = registries();
    let report = validate_recipe(&recipe, None, &build, &test);
    assert!(report.is_ok());
    assert!(
        report.warnings.iter().any(|w| w.contains("capture group")),
        "warnings: {:?}",
        report.warnings
    );
}
