//! The test-case runner.
//!
//! ```ignore
//! #[tokio::test(flavor = "current_thread")]
//! async fn mtls_strict() {
//!     TestCase::new("mTLS STRICT mode")
//!         .id("T1")
//!         .groups(&[Group::Full, Group::Smoke])
//!         .min_version(SMCP_2_1)
//!         .run(|ctx| async move {
//!             ctx.step("Apply STRICT PeerAuthentication");
//!             ctx.subtest("plain-text requests are rejected", |ctx| async move {
//!                 // ...
//!                 Ok(())
//!             })
//!             .await;
//!             Ok(())
//!         })
//!         .await;
//! }
//! ```

use crate::{
    cluster::Cluster, kubectl::quote, samples::SidecarInject, version::Version, Env, Kubectl,
    Result, Shell,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{
    any::Any,
    fmt,
    future::Future,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::time::Instant;
use tracing::Instrument;

/// A named set of test cases selected with `TEST_GROUP`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Group {
    Full,
    Smoke,
    Arm,
    Interop,
    Disconnected,
}

/// A top-level test case.
#[derive(Clone, Debug)]
#[must_use]
pub struct TestCase {
    name: String,
    id: Option<String>,
    groups: Vec<Group>,
    min_version: Option<Version>,
    max_version: Option<Version>,
    env: Option<&'static Env>,
}

/// Handle passed to the body of a test case or sub-test.
#[derive(Clone)]
pub struct Context {
    name: Arc<str>,
    env: &'static Env,
    kubectl: Kubectl,
    cluster: Arc<tokio::sync::OnceCell<Cluster>>,
    steps: Arc<AtomicUsize>,
    cleanups: Arc<Mutex<Vec<Cleanup>>>,
    failed_subtests: Arc<Mutex<Vec<String>>>,
}

struct Cleanup {
    what: String,
    task: BoxFuture<'static, Result<()>>,
}

/// How one execution of a body ended.
enum Verdict {
    Passed,
    Failed(String),
    Panicked(Box<dyn Any + Send>),
}

const MUST_GATHER_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Serializes test cases within a process: cargo runs tests on parallel
/// threads, but cases mutate cluster-wide mesh configuration.
fn serial() -> &'static tokio::sync::Mutex<()> {
    static SERIAL: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    SERIAL.get_or_init(|| tokio::sync::Mutex::new(()))
}

// === impl Group ===

impl FromStr for Group {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "smoke" => Ok(Self::Smoke),
            "arm" => Ok(Self::Arm),
            "interop" => Ok(Self::Interop),
            "disconnected" => Ok(Self::Disconnected),
            s => Err(format!(
                "invalid test group: {s} (expected full, smoke, arm, interop or disconnected)"
            )),
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Smoke => "smoke",
            Self::Arm => "arm",
            Self::Interop => "interop",
            Self::Disconnected => "disconnected",
        })
    }
}

// === impl TestCase ===

impl TestCase {
    /// A case in the `full` group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            groups: vec![Group::Full],
            min_version: None,
            max_version: None,
            env: None,
        }
    }

    /// Identifier of the case in the test plan.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Replaces the groups the case belongs to.
    pub fn groups(mut self, groups: &[Group]) -> Self {
        self.groups = groups.to_vec();
        self
    }

    /// Skips the case on control planes older than `version`.
    pub fn min_version(mut self, version: Version) -> Self {
        self.min_version = Some(version);
        self
    }

    /// Skips the case on control planes newer than `version`.
    pub fn max_version(mut self, version: Version) -> Self {
        self.max_version = Some(version);
        self
    }

    /// Runs with `env` instead of the settings read from the process
    /// environment.
    pub fn with_env(mut self, env: &'static Env) -> Self {
        self.env = Some(env);
        self
    }

    pub fn is_part_of(&self, group: Group) -> bool {
        self.groups.contains(&group)
    }

    /// Why the case does not apply to `env`, if it doesn't.
    pub fn skip_reason(&self, env: &Env) -> Option<String> {
        let group = env.selected_group();
        if !self.is_part_of(group) {
            return Some(format!("not part of the {group} test group"));
        }
        let current = env.smcp_version;
        if let Some(min) = self.min_version {
            if current < min {
                return Some(format!(
                    "doesn't support control plane version {current} (min version is {min})"
                ));
            }
        }
        if let Some(max) = self.max_version {
            if current > max {
                return Some(format!(
                    "doesn't support control plane version {current} (max version is {max})"
                ));
            }
        }
        None
    }

    /// Runs `body` unless the case does not apply to the configured group
    /// and control plane version.
    ///
    /// Registered cleanups run in reverse order once the body finishes,
    /// whether it returned `Ok`, returned `Err` or panicked. A panic is then
    /// re-raised and an error becomes a panic carrying its full chain, so the
    /// surrounding `#[tokio::test]` fails. The case also fails when any of its
    /// sub-tests failed.
    pub async fn run<F, Fut>(self, body: F)
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let _tracing = crate::init_tracing();
        let Some((label, env)) = self.admit() else {
            return;
        };

        let _serial = serial().lock().await;
        match execute(&label, env, body).await {
            Verdict::Passed => {}
            Verdict::Failed(reason) => panic!("{label} failed: {reason}"),
            Verdict::Panicked(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Like [`TestCase::run`], but a failing case is re-run up to
    /// `MAX_FLAKINESS_CHECK_RUNS` times in total.
    ///
    /// A case that fails on some runs and passes on others is reported as
    /// flaky and passes. It fails only when every run failed. With
    /// `STOP_FLAKINESS_CHECK_ON_FIRST_SUCCESS`, re-running stops at the first
    /// passing run.
    pub async fn run_detecting_flakiness<F, Fut>(self, body: F)
    where
        F: Fn(Context) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let _tracing = crate::init_tracing();
        let Some((label, env)) = self.admit() else {
            return;
        };

        let _serial = serial().lock().await;
        let max_runs = env.max_flakiness_check_runs.max(1);
        let (mut passed, mut failed) = (0u32, 0u32);
        let mut last_failure = None;
        for run in 0..max_runs {
            if run > 0 {
                tracing::info!(case = %label, "=== RERUN #{run}");
            }
            match execute(&label, env, &body).await {
                Verdict::Passed => {
                    passed += 1;
                    if run == 0 || env.stop_flakiness_check_on_first_success {
                        break;
                    }
                }
                verdict => {
                    failed += 1;
                    if run == 0 && max_runs > 1 {
                        tracing::warn!(case = %label, "failed; re-running to detect flakiness");
                    }
                    last_failure = Some(verdict);
                }
            }
        }

        if passed > 0 && failed > 0 {
            let runs = passed + failed;
            if env.stop_flakiness_check_on_first_success {
                tracing::warn!(case = %label, "flaky: passed after {runs} attempts");
            } else {
                tracing::warn!(case = %label, "flaky: passed {passed}/{runs} times");
            }
            return;
        }
        match last_failure {
            Some(Verdict::Panicked(panic)) if passed == 0 => {
                tracing::error!(case = %label, "failed {failed} times");
                std::panic::resume_unwind(panic)
            }
            Some(Verdict::Failed(reason)) if passed == 0 => {
                panic!("{label} failed {failed} times; last failure: {reason}")
            }
            _ => {}
        }
    }

    /// Resolves the settings and decides whether the case runs.
    fn admit(&self) -> Option<(String, &'static Env)> {
        let env = match self.env {
            Some(env) => env,
            None => match Env::load() {
                Ok(env) => env,
                Err(error) => panic!("invalid test environment: {error}"),
            },
        };
        let label = match &self.id {
            Some(id) => format!("[{id}] {}", self.name),
            None => self.name.clone(),
        };
        if let Some(reason) = self.skip_reason(env) {
            tracing::info!(case = %label, "skipping: {reason}");
            return None;
        }
        Some((label, env))
    }
}

/// Runs one execution of a case body, then its cleanups.
async fn execute<F, Fut>(label: &str, env: &'static Env, body: F) -> Verdict
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let ctx = Context::new(label.to_string(), env);

    tracing::info!(case = %label, "starting");
    let start = Instant::now();
    let res = tokio::spawn(body(ctx.clone()).instrument(tracing::info_span!("case", name = %label))).await;
    let elapsed = start.elapsed();

    let verdict = match (res, ctx.failed_subtests()) {
        (Ok(Ok(())), failed) if failed.is_empty() => Verdict::Passed,
        (Ok(Ok(())), failed) => Verdict::Failed(format!("sub-test(s) failed: {}", failed.join(", "))),
        (Ok(Err(error)), failed) if failed.is_empty() => Verdict::Failed(format!("{error:#}")),
        (Ok(Err(error)), failed) => Verdict::Failed(format!(
            "{error:#} (sub-test(s) failed: {})",
            failed.join(", ")
        )),
        (Err(error), _) => match error.try_into_panic() {
            Ok(panic) => Verdict::Panicked(panic),
            Err(error) => Verdict::Failed(format!("cancelled: {error}")),
        },
    };

    if let Verdict::Passed = verdict {
        tracing::info!(case = %label, "completed in {:.2}s (excluding cleanup)", elapsed.as_secs_f64());
    } else {
        tracing::error!(case = %label, "failed in {:.2}s (excluding cleanup)", elapsed.as_secs_f64());
        ctx.capture_must_gather().await;
    }
    ctx.run_cleanups().await;
    verdict
}

// === impl Context ===

impl Context {
    fn new(name: String, env: &'static Env) -> Self {
        Self {
            name: name.into(),
            env,
            kubectl: Kubectl::from_env(env),
            cluster: Default::default(),
            steps: Default::default(),
            cleanups: Default::default(),
            failed_subtests: Default::default(),
        }
    }

    /// A context for a sub-test. It shares the cluster client but has its own
    /// steps and cleanups.
    fn child(&self, name: String) -> Self {
        Self {
            name: name.into(),
            env: self.env,
            kubectl: self.kubectl.clone(),
            cluster: self.cluster.clone(),
            steps: Default::default(),
            cleanups: Default::default(),
            failed_subtests: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &'static Env {
        self.env
    }

    pub fn kubectl(&self) -> &Kubectl {
        &self.kubectl
    }

    /// The API client of the cluster under test, connected on first use.
    pub async fn cluster(&self) -> Result<&Cluster> {
        self.cluster
            .get_or_try_init(|| Cluster::from_env(self.env))
            .await
    }

    /// Logs the start of the next step of the case. Returns its number.
    pub fn step(&self, msg: impl fmt::Display) -> usize {
        let n = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!("STEP {n}: {msg}");
        n
    }

    /// Registers teardown that runs after the body, in reverse order of
    /// registration. Failures are logged and do not fail the case.
    pub fn cleanup<Fut>(&self, what: impl Into<String>, task: Fut)
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.cleanups.lock().push(Cleanup {
            what: what.into(),
            task: Box::pin(task),
        });
    }

    /// Runs `body` as the sub-test `name` and returns whether it passed.
    ///
    /// A sub-test that returns `Err` or panics is logged and recorded, and
    /// later sub-tests still run. Its cleanups run before this returns. The
    /// case fails once its body finishes, naming every failed sub-test.
    pub async fn subtest<F, Fut>(&self, name: &str, body: F) -> bool
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let ctx = self.child(format!("{}/{name}", self.name));

        tracing::info!(subtest = %ctx.name, "starting");
        let start = Instant::now();
        let res = tokio::spawn(body(ctx.clone()).instrument(tracing::info_span!("subtest", %name))).await;
        let elapsed = start.elapsed();

        let failure = match res {
            Ok(Ok(())) => {
                let nested = ctx.failed_subtests();
                (!nested.is_empty()).then(|| format!("sub-test(s) failed: {}", nested.join(", ")))
            }
            Ok(Err(error)) => Some(format!("{error:#}")),
            Err(error) => Some(match error.try_into_panic() {
                Ok(panic) => format!("panicked: {}", panic_message(&*panic)),
                Err(error) => format!("cancelled: {error}"),
            }),
        };

        match &failure {
            None => {
                tracing::info!(subtest = %ctx.name, "completed in {:.2}s (excluding cleanup)", elapsed.as_secs_f64());
            }
            Some(reason) => {
                tracing::error!(subtest = %ctx.name, %reason, "failed in {:.2}s (excluding cleanup)", elapsed.as_secs_f64());
                self.failed_subtests.lock().push(name.to_string());
                ctx.capture_must_gather().await;
            }
        }
        ctx.run_cleanups().await;
        failure.is_none()
    }

    /// Names of the sub-tests of this context that failed so far.
    pub fn failed_subtests(&self) -> Vec<String> {
        self.failed_subtests.lock().clone()
    }

    /// Collects cluster state with `<cli> adm must-gather` when
    /// `MUST_GATHER` is enabled. Returns the directory written to, or `None`
    /// when disabled or when collection failed.
    pub async fn capture_must_gather(&self) -> Option<PathBuf> {
        if !self.env.must_gather {
            return None;
        }
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let dir = self
            .env
            .output_dir
            .join("failures-must-gather")
            .join(format!("{stamp}-{}", dir_name(&self.name)));
        if let Err(error) = std::fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), %error, "cannot create must-gather directory");
            return None;
        }

        tracing::info!(dir = %dir.display(), "capturing cluster state");
        let sh = must_gather(&self.kubectl, &dir, self.env.must_gather_image.as_deref());
        match sh.run().await {
            Ok(_) => Some(dir),
            Err(error) => {
                tracing::warn!(error = %error.chain_to_string(), "must-gather failed");
                None
            }
        }
    }

    /// Creates a namespace with a random name and deletes it on cleanup.
    pub async fn temp_namespace(&self, prefix: &str, inject: SidecarInject) -> Result<String> {
        let name = format!("{prefix}-{}", crate::random_suffix(6));
        let cluster = self.cluster().await?.clone();
        cluster.create_namespace(&name, inject).await?;
        let ns = name.clone();
        self.cleanup(format!("delete namespace {name}"), async move {
            cluster.delete_namespace(&ns).await
        });
        Ok(name)
    }

    async fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        if cleanups.is_empty() {
            return;
        }
        tracing::debug!(case = %self.name, count = cleanups.len(), "cleaning up");
        let start = Instant::now();
        for Cleanup { what, task } in cleanups.into_iter().rev() {
            tracing::debug!(%what, "cleanup");
            match tokio::spawn(task).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(%what, error = %error.chain_to_string(), "cleanup failed")
                }
                Err(error) => tracing::warn!(%what, %error, "cleanup panicked"),
            }
        }
        tracing::debug!("cleanup completed in {:.2}s", start.elapsed().as_secs_f64());
    }
}

/// The must-gather invocation writing into `dir`.
fn must_gather(kubectl: &Kubectl, dir: &Path, image: Option<&str>) -> Shell {
    let image = image
        .map(|image| format!(" --image={}", quote(image)))
        .unwrap_or_default();
    kubectl
        .shell(format!(
            "adm must-gather --dest-dir={}{image}",
            quote(&dir.display().to_string())
        ))
        .mute_output()
        .timeout(MUST_GATHER_TIMEOUT)
}

/// `name` with everything but ASCII letters, digits, `.` and `_` replaced by
/// `-`.
fn dir_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '.' || c == '_' => c,
            _ => '-',
        })
        .collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("steps", &self.steps.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
