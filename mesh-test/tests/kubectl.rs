use mesh_test::{Error, Kubectl};
use std::path::Path;

/// A stand-in CLI that records its arguments and answers a few commands the
/// way `kubectl` does.
fn fake_cli(dir: &Path) -> Kubectl {
    let script = dir.join("kubectl.sh");
    let body = format!(
        r#"
state={dir}
echo "$@" >> "$state/calls"
case "$1" in
  config)
    echo "$KUBECONFIG"
    ;;
  get)
    echo "httpbin-7d9c6 httpbin-f2k8p"
    ;;
  create)
    if [ "$2" = namespace ] && [ "$3" = existing ]; then
      echo 'Error from server (AlreadyExists): namespaces "existing" already exists' >&2
      exit 1
    fi
    ;;
  apply)
    cat > "$state/applied.yaml"
    if [ ! -f "$state/webhook-ready" ]; then
      touch "$state/webhook-ready"
      echo 'Internal error occurred: failed calling webhook' >&2
      exit 1
    fi
    ;;
  delete)
    if [ "$2" = namespace ]; then
      exit 0
    fi
    echo 'error: the server does not allow this method' >&2
    exit 1
    ;;
esac
"#,
        dir = mesh_test::kubectl::quote(&dir.display().to_string()),
    );
    std::fs::write(&script, body).expect("must write script");
    // Run through `sh` so the script need not be executable.
    Kubectl::new(format!(
        "sh {}",
        mesh_test::kubectl::quote(&script.display().to_string())
    ))
}

fn calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test(flavor = "current_thread")]
async fn kubeconfig_is_exported() {
    let _tracing = mesh_test::init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let out = fake_cli(dir.path())
        .kubeconfig("/tmp/mesh1.kubeconfig")
        .run("config view")
        .await
        .unwrap();
    assert_eq!(out, "/tmp/mesh1.kubeconfig");
}

#[tokio::test(flavor = "current_thread")]
async fn pod_names_are_split() {
    let _tracing = mesh_test::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let kubectl = fake_cli(dir.path());

    let names = kubectl.pod_names("bookinfo", "app=httpbin").await.unwrap();
    assert_eq!(names, vec!["httpbin-7d9c6", "httpbin-f2k8p"]);
    assert_eq!(
        calls(dir.path()),
        vec!["get pods -l app=httpbin -n bookinfo -o jsonpath={.items[*].metadata.name}"]
    );

    let err = kubectl.pod_name("bookinfo", "app=httpbin").await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedOutput { .. }), "{err}");
}

#[tokio::test(flavor = "current_thread")]
async fn set_based_selectors_are_passed_as_one_argument() {
    let _tracing = mesh_test::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let kubectl = fake_cli(dir.path());

    let names = kubectl
        .pod_names("bookinfo", "app in (httpbin, sleep),version!=v2")
        .await
        .unwrap();
    assert_eq!(names.len(), 2);

    let out = kubectl
        .get_jsonpath_by_selector("", "deployments", "app=reviews", "{.items[0].metadata.name}")
        .await
        .unwrap();
    assert_eq!(out, "httpbin-7d9c6 httpbin-f2k8p");
    assert_eq!(
        calls(dir.path()),
        vec![
            "get pods -l app in (httpbin, sleep),version!=v2 -n bookinfo -o jsonpath={.items[*].metadata.name}",
            "get deployments -l app=reviews -o jsonpath={.items[0].metadata.name}",
        ]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn existing_namespace_is_not_an_error() {
    let _tracing = mesh_test::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let kubectl = fake_cli(dir.path());

    kubectl.create_namespace("fresh").await.unwrap();
    kubectl.create_namespace("existing").await.unwrap();
    kubectl.delete_namespace(&["fresh", "existing"]).await.unwrap();
    kubectl.delete_namespace(&[]).await.unwrap();
    assert_eq!(
        calls(dir.path()),
        vec![
            "create namespace fresh",
            "create namespace existing",
            "delete namespace fresh existing --ignore-not-found",
        ]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn apply_is_retried() {
    let _tracing = mesh_test::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let kubectl = fake_cli(dir.path());

    let yaml = "kind: PeerAuthentication\n";
    kubectl.apply("foo", yaml).await.unwrap();
    assert_eq!(calls(dir.path()), vec!["apply -n foo -f -", "apply -n foo -f -"]);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("applied.yaml")).unwrap(),
        yaml
    );
}

#[tokio::test(flavor = "current_thread")]
async fn failures_keep_the_cli_diagnostics() {
    let _tracing = mesh_test::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let kubectl = fake_cli(dir.path());

    let err = kubectl
        .delete_resource("foo", "peerauthentication", "default")
        .await
        .unwrap_err();
    match err {
        Error::CommandFailed { code, stderr, .. } => {
            assert_eq!(code, Some(1));
            assert!(stderr.contains("does not allow this method"), "{stderr}");
        }
        err => panic!("unexpected error: {err}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn exec_and_patch_render_arguments() {
    let _tracing = mesh_test::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let kubectl = fake_cli(dir.path());

    kubectl
        .exec("foo", "sleep-1", Some("sleep"), "curl -s http://httpbin:8000/ip")
        .await
        .unwrap();
    kubectl
        .patch(
            "istio-system",
            "smcp",
            "basic",
            &serde_json::json!({"spec": {"security": {"dataPlane": {"mtls": true}}}}),
        )
        .await
        .unwrap();
    assert_eq!(
        calls(dir.path()),
        vec![
            "exec sleep-1 -n foo -c sleep -- curl -s http://httpbin:8000/ip",
            r#"patch smcp basic -n istio-system --type=merge -p {"spec":{"security":{"dataPlane":{"mtls":true}}}}"#,
        ]
    );
}
