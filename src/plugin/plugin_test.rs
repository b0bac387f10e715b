use super::*;
use crate::error::PipelineError;
use crate::node::{NodeKind, NodeOptions};
use crate::pipeline::NodeSpec;
use crate::value::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn register_echo(table: &mut SymbolTable) {
  table.register("Echo", crate::nodes::passthrough::build);
  table.register("EchoWithFeedback", crate::nodes::passthrough_with_feedback::build);
}

fn register_panicking(_table: &mut SymbolTable) {
  panic!("registration exploded");
}

fn loader() -> PluginLoader {
  PluginLoader::with_linked(
    LinkedLoader::new()
      .with_unit("echo_unit", register_echo)
      .with_unit("panicking_unit", register_panicking),
  )
}

fn plugin_folder(root: &Path, name: &str, manifest: Option<&str>, artifact: Option<(&str, &str)>) -> PathBuf {
  let folder = root.join(name);
  fs::create_dir_all(&folder).unwrap();
  if let Some(manifest) = manifest {
    fs::write(folder.join(MANIFEST_FILE), manifest).unwrap();
  }
  if let Some((file, content)) = artifact {
    fs::write(folder.join(file), content).unwrap();
  }
  folder
}

const ECHO_MANIFEST: &str = r#"
[remote]
class_name = "Echo"
synchroniser = "one_per_origin"

[arguments]
delay_ms = 5
label = "echo"
"#;

#[test]
fn test_missing_folder_is_not_found() {
  let root = TempDir::new().unwrap();
  let err = loader().load_class(&root.path().join("absent")).unwrap_err();
  assert!(matches!(err, PipelineError::NotFound { ref what, .. } if what == "plugin folder"));
}

#[test]
fn test_file_instead_of_folder_is_not_found() {
  let root = TempDir::new().unwrap();
  let file = root.path().join("echo");
  fs::write(&file, "not a folder").unwrap();
  let err = loader().load_class(&file).unwrap_err();
  assert!(matches!(err, PipelineError::NotFound { .. }));
}

#[test]
fn test_missing_manifest_is_not_found() {
  let root = TempDir::new().unwrap();
  let folder = plugin_folder(root.path(), "echo", None, Some(("echo.linked", "echo_unit")));
  let err = loader().load_class(&folder).unwrap_err();
  assert!(matches!(err, PipelineError::NotFound { ref what, .. } if what == MANIFEST_FILE));
}

#[test]
fn test_malformed_manifest_is_a_configuration_error() {
  let root = TempDir::new().unwrap();
  let folder = plugin_folder(
    root.path(),
    "echo",
    Some("[remote\nclass_name = "),
    Some(("echo.linked", "echo_unit")),
  );
  let err = loader().load_class(&folder).unwrap_err();
  assert!(matches!(err, PipelineError::Configuration { .. }));
}

#[test]
fn test_manifest_without_class_name_is_a_configuration_error() {
  let root = TempDir::new().unwrap();
  let folder = plugin_folder(
    root.path(),
    "echo",
    Some("[remote]\nsynchroniser = \"passthrough\"\n"),
    Some(("echo.linked", "echo_unit")),
  );
  let err = loader().load_class(&folder).unwrap_err();
  assert!(matches!(err, PipelineError::Configuration { .. }));
  assert!(err.to_string().contains("class_name"));
}

#[test]
fn test_missing_artifact_lists_searched_names() {
  let root = TempDir::new().unwrap();
  let folder = plugin_folder(root.path(), "echo", Some(ECHO_MANIFEST), Some(("other.linked", "echo_unit")));
  let err = loader().load_class(&folder).unwrap_err();
  assert!(matches!(err, PipelineError::NotFound { .. }));
  assert!(err.to_string().contains("echo.linked"));
}

#[test]
fn test_unloadable_artifacts_are_load_errors() {
  let root = TempDir::new().unwrap();
  let cases = [
    ("empty", "# nothing here\n\n"),
    ("unknown", "some_other_unit"),
    ("panicking", "panicking_unit"),
  ];
  for (name, content) in cases {
    let artifact = format!("{name}.linked");
    let folder = plugin_folder(root.path(), name, Some(ECHO_MANIFEST), Some((&artifact, content)));
    let err = loader().load_class(&folder).unwrap_err();
    match err {
      PipelineError::Load { plugin, .. } => assert_eq!(plugin, name),
      other => panic!("{name}: unexpected error {other:?}"),
    }
  }
}

#[test]
fn test_missing_entry_point_lists_available_names() {
  let root = TempDir::new().unwrap();
  let folder = plugin_folder(
    root.path(),
    "echo",
    Some("[remote]\nclass_name = \"Missing\"\n"),
    Some(("echo.linked", "echo_unit")),
  );
  match loader().load_class(&folder).unwrap_err() {
    PipelineError::EntryPointNotFound {
      class_name,
      available,
      ..
    } => {
      assert_eq!(class_name, "Missing");
      assert_eq!(available, vec!["Echo", "EchoWithFeedback"]);
    }
    other => panic!("unexpected error {other:?}"),
  }
}

#[test]
fn test_load_class_returns_factory_and_defaults() {
  let root = TempDir::new().unwrap();
  let folder = plugin_folder(root.path(), "echo", Some(ECHO_MANIFEST), Some(("echo.linked", "echo_unit")));
  let loader = loader();

  let plugin = loader.load_class(&folder).unwrap();
  assert_eq!(plugin.manifest.class_name, "Echo");
  assert_eq!(plugin.manifest.synchroniser.as_deref(), Some("one_per_origin"));
  assert_eq!(plugin.manifest.arguments.get("label"), Some(&Value::from("echo")));
  assert_eq!(plugin.namespace.name(), "echo");
  assert!((plugin.factory)(NodeOptions::new("n", "p")).is_ok());

  let again = loader.load_class(&folder).unwrap();
  assert!(Arc::ptr_eq(&plugin.namespace, &again.namespace));
  assert_eq!(loader.cached(), 1);
}

#[test]
fn test_colliding_entry_names_stay_in_their_namespace() {
  let root = TempDir::new().unwrap();
  let first = plugin_folder(root.path(), "first", Some(ECHO_MANIFEST), Some(("first.linked", "echo_unit")));
  let second = plugin_folder(
    root.path(),
    "second",
    Some("[remote]\nclass_name = \"Echo\"\n"),
    Some(("second.linked", "echo_unit")),
  );
  let loader = loader();

  let first = loader.load_class(&first).unwrap();
  let second = loader.load_class(&second).unwrap();
  assert_eq!(first.namespace.name(), "first");
  assert_eq!(second.namespace.name(), "second");
  assert!(!Arc::ptr_eq(&first.namespace, &second.namespace));
  assert_eq!(loader.cached(), 2);
}

#[test]
fn test_underscored_folder_accepts_stripped_artifact_name() {
  let root = TempDir::new().unwrap();
  let folder = plugin_folder(root.path(), "_echo", Some(ECHO_MANIFEST), Some(("echo.linked", "echo_unit")));
  let plugin = loader().load_class(&folder).unwrap();
  assert_eq!(plugin.namespace.name(), "_echo");
}

#[test]
fn test_resolver_prefers_builtins_then_searches_plugin_roots() {
  let root = TempDir::new().unwrap();
  plugin_folder(
    &root.path().join("nodes").join("proc"),
    "_echo",
    Some(ECHO_MANIFEST),
    Some(("_echo.linked", "echo_unit")),
  );
  let resolver = NodeResolver::new(NodeRegistry::with_builtins(), loader());
  let roots = vec![root.path().to_path_buf()];

  let builtin = resolver.resolve(&NodeSpec::new("a", "passthrough"), &roots).unwrap();
  assert_eq!(builtin.source, NodeSource::Builtin);
  assert!(builtin.defaults.is_empty());

  let mut entry = NodeSpec::new("b", "echo");
  entry.kind = NodeKind::Proc;
  let plugin = resolver.resolve(&entry, &roots).unwrap();
  assert_eq!(
    plugin.source,
    NodeSource::Plugin(root.path().join("nodes").join("proc").join("_echo"))
  );
  assert_eq!(plugin.defaults.get("delay_ms"), Some(&Value::from(5u64)));
  assert_eq!(plugin.sync.as_deref(), Some("one_per_origin"));

  entry.kind = NodeKind::Sink;
  let err = resolver.resolve(&entry, &roots).unwrap_err();
  assert!(matches!(err, PipelineError::NotFound { ref what, .. } if what == "node type"));
}

#[test]
fn test_resolver_uses_explicit_remote_folder() {
  let root = TempDir::new().unwrap();
  let folder = plugin_folder(root.path(), "custom", Some(ECHO_MANIFEST), Some(("custom.linked", "echo_unit")));
  let resolver = NodeResolver::new(NodeRegistry::with_builtins(), loader());

  let mut entry = NodeSpec::new("c", "passthrough");
  entry.remote = Some(folder.clone());
  let resolved = resolver.resolve(&entry, &[]).unwrap();
  assert_eq!(resolved.source, NodeSource::Plugin(folder));
  assert!(resolved.namespace.is_some());
}
