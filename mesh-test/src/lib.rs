#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Reusable harness for end-to-end tests of a service-mesh control plane.
//!
//! Test cases drive a live cluster through the cluster CLI ([`kubectl`]) and
//! the Kubernetes API ([`cluster`]), probe workloads over HTTP ([`probe`]),
//! and assert over what they observe ([`check`], [`fixture`]). Anything that
//! converges eventually is wrapped in [`retry`].

pub mod case;
pub mod check;
pub mod cluster;
pub mod env;
mod error;
pub mod fixture;
pub mod heredoc;
pub mod kubectl;
pub mod manifest;
pub mod probe;
pub mod retry;
pub mod samples;
pub mod shell;
pub mod version;

pub use self::{
    case::{Context, Group, TestCase},
    check::{Checks, Failure},
    env::Env,
    error::{BoxError, Error, Result},
    heredoc::doc,
    kubectl::Kubectl,
    probe::{Probe, ProbeResponse},
    retry::{Attempt, RetryOptions},
    shell::Shell,
    version::Version,
};

/// Formats its arguments and strips the common indentation of the result.
///
/// ```
/// let ns = "bookinfo";
/// let yaml = mesh_test::docf!(
///     "
///     metadata:
///       namespace: {ns}"
/// );
/// assert_eq!(yaml, "metadata:\n  namespace: bookinfo");
/// ```
#[macro_export]
macro_rules! docf {
    ($($arg:tt)*) => {
        $crate::heredoc::doc(&::std::format!($($arg)*))
    };
}

/// Installs a test-scoped subscriber that writes through the test harness's
/// captured output.
///
/// The filter is read from `MESH_TEST_LOG`, falling back to
/// `mesh_test=debug,info`.
pub fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_env(env::LOG_ENV)
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mesh_test=debug,info")),
            )
            .finish(),
    )
}

/// Returns a random string of lowercase letters and digits, suitable as a
/// suffix of Kubernetes object names.
pub fn random_suffix(len: usize) -> String {
    use rand::Rng;

    let rng = &mut rand::thread_rng();
    (0..len)
        .map(|_| rng.sample(LowercaseAlphanumeric) as char)
        .collect()
}

struct LowercaseAlphanumeric;

// Modified from `rand::distributions::Alphanumeric`
//
// Copyright 2018 Developers of the Rand project
// Copyright (c) 2014 The Rust Project Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
impl rand::distributions::Distribution<u8> for LowercaseAlphanumeric {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> u8 {
        const RANGE: u32 = 26 + 10;
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        loop {
            let var = rng.next_u32() >> (32 - 6);
            if var < RANGE {
                return CHARSET[var as usize];
            }
        }
    }
}
