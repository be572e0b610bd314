//! End-to-end transform scenarios, driven through a caller-supplied loader.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};

use iidy::codec::DocFormat;
use iidy::loader::{LoadedImport, Loader};
use iidy::location::ImportType;
use iidy::transform_with_loader;

/// In-memory loader keyed by exact location string.
#[derive(Debug, Default)]
struct MapLoader {
    entries: HashMap<String, String>,
}

impl MapLoader {
    fn new() -> Self {
        Self::default()
    }

    fn with(mut self, location: &str, data: &str) -> Self {
        self.entries.insert(location.to_owned(), data.to_owned());
        self
    }
}

#[async_trait]
impl Loader for MapLoader {
    async fn load(&self, location: &str, _base_location: &str) -> Result<LoadedImport> {
        let Some(data) = self.entries.get(location) else {
            bail!("import of '{location}' failed: not present in the test loader");
        };
        let doc = match DocFormat::from_location(location) {
            Some(format) => iidy::codec::parse_str(data, format)?,
            None => Value::String(data.clone()),
        };
        Ok(LoadedImport {
            import_type: ImportType::File,
            resolved_location: location.to_owned(),
            data: data.clone(),
            doc,
        })
    }
}

fn yaml(text: &str) -> Value {
    serde_yaml::from_str(text).unwrap()
}

async fn run(root: &str, loader: &MapLoader) -> Result<Value> {
    transform_with_loader(yaml(root), "root.yaml", loader).await
}

fn get<'a>(map: &'a Value, key: &str) -> &'a Value {
    map.as_mapping()
        .and_then(|m| m.get(key))
        .unwrap_or_else(|| panic!("missing key '{key}' in {map:?}"))
}

/// Every `$`-prefixed reserved key, at any depth.
fn find_meta_keys(value: &Value, found: &mut Vec<String>) {
    const META: &[&str] = &["$imports", "$defs", "$envValues", "$params", "$location"];
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                if let Some(k) = k.as_str() {
                    if META.contains(&k) {
                        found.push(k.to_owned());
                    }
                }
                find_meta_keys(v, found);
            }
        }
        Value::Sequence(seq) => seq.iter().for_each(|v| find_meta_keys(v, found)),
        Value::Tagged(t) => find_meta_keys(&t.value, found),
        _ => {}
    }
}

// S1: literal $defs and interpolation.
#[tokio::test]
async fn s1_defs_and_interpolation() {
    let out = run("$defs: {name: world}\nMessage: 'hello {{name}}'", &MapLoader::new())
        .await
        .unwrap();
    assert_eq!(out, yaml("Message: hello world"));
}

// S2: $include with a dotted selector.
#[tokio::test]
async fn s2_include_with_selector() {
    let out = run("$defs: {cfg: {a: {b: 42}}}\nX: !$include cfg.a.b", &MapLoader::new())
        .await
        .unwrap();
    assert_eq!(out, yaml("X: 42"));
}

// S3: $map over an included sequence.
#[tokio::test]
async fn s3_map() {
    let out = run(
        "$defs: {xs: [1, 2, 3]}\nYs: !$map {items: !$include xs, template: '{{item}}!'}",
        &MapLoader::new(),
    )
    .await
    .unwrap();
    assert_eq!(out, yaml("Ys: ['1!', '2!', '3!']"));
}

const SERVICE_TEMPLATE: &str = r#"
$params:
  - Name: N
Resources:
  R:
    Type: AWS::X
    Properties:
      V: '{{N}}'
"#;

// S4: template expansion with a name prefix.
#[tokio::test]
async fn s4_template_expansion_with_prefix() {
    let loader = MapLoader::new().with("service.yaml", SERVICE_TEMPLATE);
    let out = run(
        "$imports: {T: service.yaml}\nResources:\n  foo:\n    Type: T\n    NamePrefix: Pre\n    Properties: {N: hi}",
        &loader,
    )
    .await
    .unwrap();

    let resource = get(get(&out, "Resources"), "PreR");
    assert_eq!(get(resource, "Type"), &Value::String("AWS::X".into()));
    assert_eq!(get(get(resource, "Properties"), "V"), &Value::String("hi".into()));
}

// S5: AllowedValues rejection cites the calling resource.
#[tokio::test]
async fn s5_allowed_values_rejection() {
    let loader = MapLoader::new().with(
        "service.yaml",
        "$params:\n  - Name: N\n    AllowedValues: [a, b]\nResources:\n  R: {Type: AWS::X}",
    );
    let err = run(
        "$imports: {T: service.yaml}\nResources:\n  foo:\n    Type: T\n    Properties: {N: c}",
        &loader,
    )
    .await
    .unwrap_err();

    let msg = err.to_string();
    assert!(msg.contains("'N'"), "{msg}");
    assert!(msg.contains("foo"), "{msg}");
    assert!(msg.contains("allowed values"), "{msg}");
}

// S6: provenance metadata carries the import log.
#[tokio::test]
async fn s6_metadata_provenance() {
    let body = "size: 1\n";
    let loader = MapLoader::new().with("cfg.yaml", body);
    let out = run(
        "AWSTemplateFormatVersion: '2010-09-09'\n$imports: {cfg: cfg.yaml}\nResources: {}",
        &loader,
    )
    .await
    .unwrap();

    assert_eq!(get(&out, "AWSTemplateFormatVersion"), &Value::String("2010-09-09".into()));

    let imports = get(get(get(&out, "Metadata"), "iidy"), "Imports").as_sequence().unwrap();
    assert_eq!(imports.len(), 1);
    let entry = &imports[0];
    assert_eq!(get(entry, "key"), &Value::String("cfg".into()));
    assert_eq!(get(entry, "from"), &Value::String("cfg.yaml".into()));
    assert_eq!(get(entry, "imported"), &Value::String("cfg.yaml".into()));
    assert_eq!(
        get(entry, "sha256Digest"),
        &Value::String(hex::encode(Sha256::digest(body.as_bytes())))
    );
}

// Property 1: identity on the pure subset.
#[tokio::test]
async fn pure_documents_transform_to_themselves() {
    let doc = "Message: plain\nNested:\n  list: [1, 2, {a: b}]\nCount: 7\n";
    let out = run(doc, &MapLoader::new()).await.unwrap();
    assert_eq!(out, yaml(doc));
}

// Property 3: no meta-keys anywhere in the output.
#[tokio::test]
async fn output_has_no_meta_keys_at_any_depth() {
    let loader = MapLoader::new()
        .with("service.yaml", SERVICE_TEMPLATE)
        .with("cfg.yaml", "$defs: {x: 1}\nvalue: !$include x\n");
    let out = run(
        r#"
$defs: {stage: prod}
$imports:
  T: service.yaml
  cfg: cfg.yaml
Resources:
  app:
    Type: T
    Properties: {N: '{{stage}}'}
  raw:
    Type: AWS::Y
    Properties:
      Config: !$include cfg
"#,
        &loader,
    )
    .await
    .unwrap();

    let mut found = Vec::new();
    find_meta_keys(&out, &mut found);
    assert!(found.is_empty(), "meta keys left in output: {found:?}\n{out:?}");
}

// Property 5: Ref rewriting inside expansions, AWS pseudo-refs preserved.
#[tokio::test]
async fn refs_are_prefixed_except_aws_pseudo_refs() {
    let loader = MapLoader::new().with(
        "service.yaml",
        r#"
$params:
  - Name: N
Resources:
  R:
    Type: AWS::X
    Properties:
      Own: !Ref Queue
      Pseudo: !Ref 'AWS::Region'
"#,
    );
    let out = run(
        "$imports: {T: service.yaml}\nResources:\n  app:\n    Type: T\n    Properties: {N: x}",
        &loader,
    )
    .await
    .unwrap();

    let props = get(get(get(&out, "Resources"), "appR"), "Properties");
    match get(props, "Own") {
        Value::Tagged(t) => assert_eq!(t.value, Value::String("appQueue".into())),
        other => panic!("expected rewritten Ref, got {other:?}"),
    }
    match get(props, "Pseudo") {
        Value::Tagged(t) => assert_eq!(t.value, Value::String("AWS::Region".into())),
        other => panic!("expected preserved Ref, got {other:?}"),
    }
}

// Property 4: hoisted section keys are prefixed too.
#[tokio::test]
async fn hoisted_sections_carry_the_prefix() {
    let loader = MapLoader::new().with(
        "service.yaml",
        r#"
$params:
  - Name: N
Resources:
  R: {Type: AWS::X}
Outputs:
  Url:
    Value: '{{N}}'
Parameters:
  Extra:
    Type: String
"#,
    );
    let out = run(
        "$imports: {T: service.yaml}\nResources:\n  web:\n    Type: T\n    Properties: {N: x}",
        &loader,
    )
    .await
    .unwrap();

    assert!(get(&out, "Outputs").as_mapping().unwrap().len() == 1);
    assert_eq!(get(get(get(&out, "Outputs"), "webUrl"), "Value"), &Value::String("x".into()));
    assert!(get(get(&out, "Parameters"), "webExtra").is_mapping());
}

// Property 7: transforming the output again is the identity.
#[tokio::test]
async fn transform_is_idempotent_on_its_own_output() {
    let loader = MapLoader::new().with("service.yaml", SERVICE_TEMPLATE);
    let once = run(
        "$imports: {T: service.yaml}\nResources:\n  foo:\n    Type: T\n    Properties: {N: hi}",
        &loader,
    )
    .await
    .unwrap();

    let twice = transform_with_loader(once.clone(), "root.yaml", &MapLoader::new())
        .await
        .unwrap();
    assert_eq!(once, twice);
}

// Hygiene: an imported document's body resolves against its own scope,
// even when the caller binds the same names.
#[tokio::test]
async fn imported_scopes_are_hygienic() {
    let loader = MapLoader::new().with(
        "greeting.yaml",
        "$defs: {who: import}\nMessage: 'hello {{who}}'\n",
    );
    let out = run(
        "$defs: {who: caller}\n$imports: {greeting: greeting.yaml}\nX: !$include greeting\nY: 'bye {{who}}'",
        &loader,
    )
    .await
    .unwrap();

    assert_eq!(get(get(&out, "X"), "Message"), &Value::String("hello import".into()));
    assert_eq!(get(&out, "Y"), &Value::String("bye caller".into()));
}

// Failure policy: loader errors abort with no partial output.
#[tokio::test]
async fn loader_failure_aborts_the_transform() {
    let err = run("$imports: {cfg: missing.yaml}\nBody: 1", &MapLoader::new())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("missing.yaml"), "{err:#}");
}

// $merge collisions surface as errors with the offending key.
#[tokio::test]
async fn merge_conflicts_are_reported() {
    let err = run(
        "$defs: {extra: {Port: 80}}\nListener:\n  Port: 443\n  $merge: !$include extra",
        &MapLoader::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("'Port'"), "{err}");
}

// Nested expansion: a template using another template composes prefixes.
#[tokio::test]
async fn nested_template_expansion_composes_prefixes() {
    let loader = MapLoader::new()
        .with(
            "outer.yaml",
            r#"
$imports:
  Inner: inner.yaml
$params:
  - Name: N
Resources:
  mid:
    Type: Inner
    Properties: {M: '{{N}}'}
"#,
        )
        .with(
            "inner.yaml",
            r#"
$params:
  - Name: M
Resources:
  leaf:
    Type: AWS::X
    Properties: {V: '{{M}}'}
"#,
        );
    let out = run(
        "$imports: {Outer: outer.yaml}\nResources:\n  top:\n    Type: Outer\n    Properties: {N: deep}",
        &loader,
    )
    .await
    .unwrap();

    let resources = get(&out, "Resources").as_mapping().unwrap();
    let name = resources
        .keys()
        .filter_map(Value::as_str)
        .find(|k| k.ends_with("leaf"))
        .expect("an expanded leaf resource");
    assert_eq!(name, "topmidleaf");

    let leaf = get(get(&out, "Resources"), name);
    assert_eq!(get(get(leaf, "Properties"), "V"), &Value::String("deep".into()));
}

// JSON imports participate like YAML ones.
#[tokio::test]
async fn json_imports_are_decoded() {
    let loader = MapLoader::new().with("params.json", r#"{"size": "large"}"#);
    let out = run(
        "$imports: {params: params.json}\nSize: !$include params.size",
        &loader,
    )
    .await
    .unwrap();
    assert_eq!(get(&out, "Size"), &Value::String("large".into()));
}

// Unstructured imports stay raw strings.
#[tokio::test]
async fn raw_imports_stay_strings() {
    let loader = MapLoader::new().with("banner.txt", "MOTD");
    let out = run(
        "$imports: {banner: banner.txt}\nGreeting: '{{banner}}!'",
        &loader,
    )
    .await
    .unwrap();
    assert_eq!(get(&out, "Greeting"), &Value::String("MOTD!".into()));
}

// An empty mapping root stays empty: no spurious skeleton.
#[tokio::test]
async fn empty_root_is_left_alone() {
    let out = run("{}", &MapLoader::new()).await.unwrap();
    assert_eq!(out, Value::Mapping(Mapping::new()));
}
