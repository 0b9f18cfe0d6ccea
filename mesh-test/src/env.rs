use crate::{case::Group, version::Version, Error, Result};
use clap::Parser;
use std::{path::PathBuf, sync::OnceLock};

/// Name of the variable holding the log filter of test runs.
pub const LOG_ENV: &str = "MESH_TEST_LOG";

/// Settings of a test run.
///
/// Test binaries take no arguments of their own, so every setting is read
/// from the environment. Flags exist so that tests can build settings
/// explicitly.
#[derive(Clone, Debug, Parser)]
#[clap(name = "mesh-test", about = "Service mesh end-to-end test settings")]
pub struct Env {
    /// Kubeconfig of the cluster under test. The client's default discovery
    /// applies when unset.
    #[clap(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the first cluster of a federation/multi-cluster pair.
    #[clap(long, env = "MESH1_KUBECONFIG")]
    pub mesh1_kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the second cluster of a federation/multi-cluster pair.
    #[clap(long, env = "MESH2_KUBECONFIG")]
    pub mesh2_kubeconfig: Option<PathBuf>,

    /// Namespace of the control plane.
    #[clap(long, env = "SMCP_NAMESPACE", default_value = "istio-system")]
    pub smcp_namespace: String,

    /// Name of the control plane resource.
    #[clap(long, env = "SMCP_NAME", default_value = "basic")]
    pub smcp_name: String,

    /// Version of the control plane under test. Cases declaring a minimum
    /// or maximum version are skipped outside their range.
    #[clap(long, env = "SMCP_VERSION", default_value = "v2.6")]
    pub smcp_version: Version,

    /// Group of test cases to run.
    #[clap(long, env = "TEST_GROUP", default_value = "full")]
    pub test_group: Group,

    /// Architecture of the cluster nodes. `arm` selects the `arm` group
    /// regardless of `TEST_GROUP`.
    #[clap(long, env = "OCP_ARCH", default_value = "x86")]
    pub arch: String,

    /// Logs every failed retry attempt at warn level. When false they are
    /// only visible at debug level.
    #[clap(
        long,
        env = "LOG_FAILED_RETRY_ATTEMPTS",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub log_failed_retry_attempts: bool,

    /// Root of the expected-response fixtures.
    #[clap(long, env = "TESTDATA_DIR", default_value = "testdata")]
    pub testdata_dir: PathBuf,

    /// Scratch directory for generated certificates, manifests and
    /// mismatching response bodies.
    #[clap(long, env = "OUTPUT_DIR", default_value = "/tmp/mesh-test")]
    pub output_dir: PathBuf,

    /// Cluster CLI binary (`kubectl` or `oc`).
    #[clap(long, env = "MESH_TEST_CLI", default_value = "kubectl")]
    pub cli: String,

    /// Captures cluster state with `<cli> adm must-gather` into
    /// `OUTPUT_DIR/failures-must-gather` when a case or sub-test fails.
    #[clap(
        long,
        env = "MUST_GATHER",
        default_value = "false",
        action = clap::ArgAction::Set
    )]
    pub must_gather: bool,

    /// Image passed to must-gather. The CLI's default image is used when
    /// unset.
    #[clap(long, env = "MUST_GATHER_IMAGE")]
    pub must_gather_image: Option<String>,

    /// Maximum number of runs of a case executed with flakiness detection.
    #[clap(long, env = "MAX_FLAKINESS_CHECK_RUNS", default_value = "10")]
    pub max_flakiness_check_runs: u32,

    /// Stops re-running a failed case as soon as one re-run passes.
    #[clap(
        long,
        env = "STOP_FLAKINESS_CHECK_ON_FIRST_SUCCESS",
        default_value = "false",
        action = clap::ArgAction::Set
    )]
    pub stop_flakiness_check_on_first_success: bool,
}

static ENV: OnceLock<Env> = OnceLock::new();

// === impl Env ===

impl Env {
    /// Reads the settings from the process environment once; later calls
    /// return the same settings.
    pub fn load() -> Result<&'static Self> {
        if let Some(env) = ENV.get() {
            return Ok(env);
        }
        let env = Self::try_parse_from(["mesh-test"]).map_err(|e| Error::Config(e.to_string()))?;
        tracing::debug!(?env, "loaded settings");
        Ok(ENV.get_or_init(|| env))
    }

    /// The group cases are selected by.
    pub fn selected_group(&self) -> Group {
        if self.arch == "arm" {
            Group::Arm
        } else {
            self.test_group
        }
    }

    /// Kubeconfig of the `n`th cluster of a multi-cluster test, 1-based.
    pub fn mesh_kubeconfig(&self, n: usize) -> Option<&PathBuf> {
        match n {
            1 => self.mesh1_kubeconfig.as_ref(),
            2 => self.mesh2_kubeconfig.as_ref(),
            _ => None,
        }
    }
}

/// Whether failed retry attempts are logged at warn level. Defaults to true
/// when the environment cannot be read.
pub(crate) fn log_failed_retry_attempts() -> bool {
    Env::load()
        .map(|env| env.log_failed_retry_attempts)
        .unwrap_or(true)
}
