//! Comparison of response bodies against stored fixture files.

use crate::{check::Failure, Env, Error, Result};
use std::path::{Path, PathBuf};

/// A directory of expected responses.
#[derive(Clone, Debug)]
pub struct Fixtures {
    root: PathBuf,
    output_dir: Option<PathBuf>,
}

// === impl Fixtures ===

impl Fixtures {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            output_dir: None,
        }
    }

    /// Fixtures under `TESTDATA_DIR`, with mismatching bodies saved under
    /// `OUTPUT_DIR`.
    pub fn from_env(env: &Env) -> Self {
        Self::new(&env.testdata_dir).output_dir(&env.output_dir)
    }

    /// Saves the actual body of every mismatch under `dir` for inspection.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.root.join(name);
        std::fs::read(&path).map_err(|e| Error::io(path.display(), e))
    }

    /// Fails with a unified diff unless `actual` equals the fixture `name`
    /// byte for byte.
    pub fn compare(&self, actual: &[u8], name: &str) -> Result<()> {
        self.compare_with_alternatives(actual, name, &[])
    }

    /// Like [`Fixtures::compare`], but when `actual` does not match `name`,
    /// names the alternative fixture it matched instead (e.g. the page
    /// rendered for another reviews version).
    pub fn compare_with_alternatives(
        &self,
        actual: &[u8],
        name: &str,
        alternatives: &[&str],
    ) -> Result<()> {
        let expected = self.load(name)?;
        if expected == actual {
            tracing::info!("SUCCESS: response matches {name}");
            return Ok(());
        }

        let saved = self.save_actual(actual, name);
        let mut message = format!("response did not match {name}");
        if let Some(other) = self.matches_any(actual, alternatives)? {
            message.push_str(&format!(" (it matched {other} instead)"));
        }
        if let Some(path) = saved {
            message.push_str(&format!("; actual body saved to {}", path.display()));
        }

        let expected = String::from_utf8_lossy(&expected);
        let actual = String::from_utf8_lossy(actual);
        let diff = similar::TextDiff::from_lines(expected.as_ref(), actual.as_ref())
            .unified_diff()
            .context_radius(3)
            .header(name, "actual")
            .to_string();
        Err(Failure::new(message).with_detail(diff).into())
    }

    /// Returns the first of `names` whose content equals `actual`.
    pub fn matches_any(&self, actual: &[u8], names: &[&str]) -> Result<Option<String>> {
        for name in names {
            if self.load(name)? == actual {
                return Ok(Some(name.to_string()));
            }
        }
        Ok(None)
    }

    fn save_actual(&self, actual: &[u8], name: &str) -> Option<PathBuf> {
        let dir = self.output_dir.as_ref()?;
        let file = Path::new(name).file_name()?.to_string_lossy().into_owned();
        let path = dir.join(format!("{file}.actual"));
        let res = std::fs::create_dir_all(dir).and_then(|()| std::fs::write(&path, actual));
        match res {
            Ok(()) => Some(path),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "failed to save response body");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (tempfile::TempDir, Fixtures) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("html")).unwrap();
        std::fs::write(dir.path().join("html/productpage-v1.html"), "<p>reviews v1</p>\n").unwrap();
        std::fs::write(dir.path().join("html/productpage-v2.html"), "<p>reviews v2</p>\n").unwrap();
        let fixtures = Fixtures::new(dir.path()).output_dir(dir.path().join("out"));
        (dir, fixtures)
    }

    #[test]
    fn fixture_matches_itself() {
        let (_dir, fixtures) = fixtures();
        let own = fixtures.load("html/productpage-v1.html").unwrap();
        fixtures.compare(&own, "html/productpage-v1.html").unwrap();
    }

    #[test]
    fn mismatch_reports_diff_and_alternative() {
        let (dir, fixtures) = fixtures();
        let err = fixtures
            .compare_with_alternatives(
                b"<p>reviews v2</p>\n",
                "html/productpage-v1.html",
                &["html/productpage-v2.html"],
            )
            .unwrap_err();
        let failure = match err {
            Error::Assertion(failure) => failure,
            err => panic!("unexpected error: {err}"),
        };
        assert!(failure
            .message()
            .contains("it matched html/productpage-v2.html instead"));
        let diff = failure.detail().unwrap();
        assert!(diff.contains("-<p>reviews v1</p>"), "{diff}");
        assert!(diff.contains("+<p>reviews v2</p>"), "{diff}");

        let saved = std::fs::read(dir.path().join("out/productpage-v1.html.actual")).unwrap();
        assert_eq!(saved, b"<p>reviews v2</p>\n");
    }

    #[test]
    fn missing_fixture_is_an_io_error() {
        let (_dir, fixtures) = fixtures();
        assert!(matches!(
            fixtures.compare(b"", "html/missing.html"),
            Err(Error::Io { .. })
        ));
    }
}
