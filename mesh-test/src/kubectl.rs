//! Typed wrappers around the cluster CLI (`kubectl` or `oc`).
//!
//! Every call renders one command line and runs it through [`Shell`], with
//! `KUBECONFIG` set when a kubeconfig is configured. The namespace is an
//! explicit argument of every namespaced operation; an empty namespace means
//! the CLI's default (or cluster scope for cluster-scoped kinds).

use crate::{
    retry::{self, RetryOptions},
    shell::{Shell, Verbosity},
    Env, Error, Result,
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Clone, Debug)]
pub struct Kubectl {
    binary: String,
    kubeconfig: Option<PathBuf>,
}

impl Kubectl {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig: None,
        }
    }

    /// The CLI named by `MESH_TEST_CLI`, pointed at `KUBECONFIG`.
    pub fn from_env(env: &Env) -> Self {
        let kubectl = Self::new(env.cli.clone());
        match &env.kubeconfig {
            Some(path) => kubectl.kubeconfig(path),
            None => kubectl,
        }
    }

    pub fn kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Builds (without running) the invocation of `args`.
    pub fn shell(&self, args: impl AsRef<str>) -> Shell {
        let sh = Shell::new(format!("{} {}", self.binary, args.as_ref()));
        match &self.kubeconfig {
            Some(path) => sh.env("KUBECONFIG", path.display().to_string()),
            None => sh,
        }
    }

    /// Runs the CLI with raw `args`.
    pub async fn run(&self, args: impl AsRef<str>) -> Result<String> {
        self.shell(args).run().await
    }

    /// Applies `yaml` from stdin. Retried, since admission webhooks of a
    /// freshly installed control plane may briefly reject requests.
    pub async fn apply(&self, ns: &str, yaml: &str) -> Result<()> {
        let sh = self
            .shell(format!("apply{} -f -", ns_flag(ns)))
            .input(yaml);
        let options = RetryOptions::default()
            .max_attempts(5)
            .delay_between_attempts(Duration::from_secs(1));
        retry::until_success_with_options(&options, "apply manifest", |_| sh.run()).await?;
        Ok(())
    }

    pub async fn apply_file(&self, ns: &str, path: &Path) -> Result<()> {
        self.run(format!(
            "apply{} -f {}",
            ns_flag(ns),
            quote(&path.display().to_string())
        ))
        .await?;
        Ok(())
    }

    /// Deletes the objects of `yaml`, ignoring those that do not exist.
    pub async fn delete(&self, ns: &str, yaml: &str) -> Result<()> {
        self.shell(format!("delete{} --ignore-not-found -f -", ns_flag(ns)))
            .input(yaml)
            .run()
            .await?;
        Ok(())
    }

    pub async fn delete_resource(&self, ns: &str, kind: &str, name: &str) -> Result<()> {
        self.run(format!(
            "delete {kind} {name}{} --ignore-not-found",
            ns_flag(ns)
        ))
        .await?;
        Ok(())
    }

    /// Applies a JSON merge patch.
    pub async fn patch(&self, ns: &str, kind: &str, name: &str, patch: &serde_json::Value) -> Result<()> {
        self.patch_with_type(ns, kind, name, "merge", &patch.to_string())
            .await
    }

    /// Applies a patch of `patch_type` (`merge`, `json` or `strategic`).
    pub async fn patch_with_type(
        &self,
        ns: &str,
        kind: &str,
        name: &str,
        patch_type: &str,
        patch: &str,
    ) -> Result<()> {
        self.run(format!(
            "patch {kind} {name}{} --type={patch_type} -p {}",
            ns_flag(ns),
            quote(patch)
        ))
        .await?;
        Ok(())
    }

    /// Runs `command` in a container of `pod`.
    pub async fn exec(&self, ns: &str, pod: &str, container: Option<&str>, command: &str) -> Result<String> {
        let container = container.map(|c| format!(" -c {c}")).unwrap_or_default();
        self.run(format!("exec {pod}{}{container} -- {command}", ns_flag(ns)))
            .await
    }

    pub async fn get_jsonpath(&self, ns: &str, kind: &str, name: &str, path: &str) -> Result<String> {
        self.jsonpath(ns, &format!("{kind} {name}"), path).await
    }

    /// Evaluates `path` over the list of `kind` objects matching the label
    /// `selector`.
    pub async fn get_jsonpath_by_selector(
        &self,
        ns: &str,
        kind: &str,
        selector: &str,
        path: &str,
    ) -> Result<String> {
        self.jsonpath(ns, &format!("{kind} -l {}", quote(selector)), path)
            .await
    }

    async fn jsonpath(&self, ns: &str, target: &str, path: &str) -> Result<String> {
        self.shell(format!("get {target}{} -o jsonpath={}", ns_flag(ns), quote(path)))
            .mute_output()
            .run()
            .await
    }

    pub async fn logs(&self, ns: &str, pod: &str, container: Option<&str>) -> Result<String> {
        let container = container.map(|c| format!(" -c {c}")).unwrap_or_default();
        self.shell(format!("logs {pod}{}{container}", ns_flag(ns)))
            .mute_output()
            .run()
            .await
    }

    /// Waits for a rollout of `kind/name` to complete.
    pub async fn rollout_status(&self, ns: &str, kind: &str, name: &str, timeout: Duration) -> Result<()> {
        self.run(format!(
            "rollout status {kind}/{name}{} --timeout={}s",
            ns_flag(ns),
            timeout.as_secs()
        ))
        .await?;
        Ok(())
    }

    /// Sets `label` (`key=value`, or `key-` to remove it).
    pub async fn label(&self, ns: &str, kind: &str, name: &str, label: &str) -> Result<()> {
        self.run(format!(
            "label {kind} {name}{} {label} --overwrite",
            ns_flag(ns)
        ))
        .await?;
        Ok(())
    }

    /// Waits until `resource` (e.g. `pod -l app=httpbin` or
    /// `deployment/httpbin`) reaches `condition` (e.g. `condition=Ready`).
    pub async fn wait_for(&self, ns: &str, resource: &str, condition: &str, timeout: Duration) -> Result<()> {
        self.run(format!(
            "wait --for={condition} {resource}{} --timeout={}s",
            ns_flag(ns),
            timeout.as_secs()
        ))
        .await?;
        Ok(())
    }

    pub async fn create_tls_secret(&self, ns: &str, name: &str, cert: &Path, key: &Path) -> Result<()> {
        self.shell(format!(
            "create secret tls {name}{} --cert={} --key={}",
            ns_flag(ns),
            quote(&cert.display().to_string()),
            quote(&key.display().to_string())
        ))
        .verbosity(Verbosity::MuteOutput)
        .run()
        .await?;
        Ok(())
    }

    /// Creates a generic secret with one key per file.
    pub async fn create_generic_secret(&self, ns: &str, name: &str, files: &[(&str, &Path)]) -> Result<()> {
        self.shell(format!(
            "create secret generic {name}{}{}",
            ns_flag(ns),
            from_files(files)
        ))
        .verbosity(Verbosity::MuteOutput)
        .run()
        .await?;
        Ok(())
    }

    /// Creates a config map with one key per file.
    pub async fn create_configmap(&self, ns: &str, name: &str, files: &[(&str, &Path)]) -> Result<()> {
        self.run(format!(
            "create configmap {name}{}{}",
            ns_flag(ns),
            from_files(files)
        ))
        .await?;
        Ok(())
    }

    /// Names of the pods matching a label `selector`.
    pub async fn pod_names(&self, ns: &str, selector: &str) -> Result<Vec<String>> {
        let out = self
            .get_jsonpath_by_selector(ns, "pods", selector, "{.items[*].metadata.name}")
            .await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    /// The single pod matching `selector`.
    pub async fn pod_name(&self, ns: &str, selector: &str) -> Result<String> {
        let mut names = self.pod_names(ns, selector).await?;
        match names.len() {
            1 => Ok(names.remove(0)),
            n => Err(Error::UnexpectedOutput {
                command: format!("get pods -l {selector}"),
                reason: format!("expected exactly one pod, found {n}"),
            }),
        }
    }

    /// Creates a namespace; an existing one is left as is.
    pub async fn create_namespace(&self, ns: &str) -> Result<()> {
        match self.shell(format!("create namespace {ns}")).run().await {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { stderr, .. }) if stderr.contains("AlreadyExists") => {
                tracing::debug!(%ns, "namespace already exists");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    pub async fn delete_namespace(&self, ns: &[&str]) -> Result<()> {
        if ns.is_empty() {
            return Ok(());
        }
        self.run(format!("delete namespace {} --ignore-not-found", ns.join(" ")))
            .await?;
        Ok(())
    }
}

fn ns_flag(ns: &str) -> String {
    if ns.is_empty() {
        String::new()
    } else {
        format!(" -n {ns}")
    }
}

fn from_files(files: &[(&str, &Path)]) -> String {
    files
        .iter()
        .map(|(key, path)| format!(" --from-file={}", quote(&format!("{key}={}", path.display()))))
        .collect()
}

/// Quotes `s` as a single POSIX shell word.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
