//! Triage directory layout.
//!
//! ```text
//! <out>/<STATUS>/[IGNORE/]<counter><file>   fault artifacts
//! <out>/INVALID/<counter><file>             statically invalid programs
//! <out>/REDUCED/<STATUS>/<counter><file>    minimized fault reproducers
//! <out>/MISMATCH/<counter><file>            reference/variant disagreements
//! <out>/temp/                               per-job scratch space
//! ```
//!
//! Every directory is created with `create_dir_all`, so concurrent workers
//! filing into the same status directory never race on creation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::job::{JobStatus, ShaderJob};
use crate::reducer::ReductionReport;

pub const IGNORE_DIR: &str = "IGNORE";
pub const INVALID_DIR: &str = "INVALID";
pub const REDUCED_DIR: &str = "REDUCED";
pub const MISMATCH_DIR: &str = "MISMATCH";
pub const SCRATCH_DIR: &str = "temp";

#[derive(Debug, Error)]
pub enum TriageError {
    #[error("triage I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("artifact {path} has no file name")]
    UnnamedArtifact { path: PathBuf },
    #[error("failed to encode triage artifact: {0}")]
    Encode(String),
}

impl TriageError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "triage_io",
            Self::UnnamedArtifact { .. } => "triage_unnamed_artifact",
            Self::Encode(_) => "triage_encode",
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Four-digit, zero-padded artifact prefix.
pub fn counter_prefix(counter: u64) -> String {
    format!("{counter:04}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageLayout {
    root: PathBuf,
}

impl TriageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, TriageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| TriageError::io(&root, err))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status_dir(&self, status: JobStatus, ignored: bool) -> PathBuf {
        let dir = self.root.join(status.as_str());
        if ignored { dir.join(IGNORE_DIR) } else { dir }
    }

    pub fn invalid_dir(&self) -> PathBuf {
        self.root.join(INVALID_DIR)
    }

    pub fn reduced_dir(&self, status: JobStatus) -> PathBuf {
        self.root.join(REDUCED_DIR).join(status.as_str())
    }

    pub fn mismatch_dir(&self) -> PathBuf {
        self.root.join(MISMATCH_DIR)
    }

    /// `temp/` for a lone worker, `temp/worker-<id>/` inside a pool.
    pub fn scratch_dir(&self, worker: Option<usize>) -> PathBuf {
        let scratch = self.root.join(SCRATCH_DIR);
        match worker {
            Some(id) => scratch.join(format!("worker-{id}")),
            None => scratch,
        }
    }

    /// Empties `dir`, creating it if absent.
    pub fn reset_scratch(&self, dir: &Path) -> Result<(), TriageError> {
        match fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(TriageError::io(dir, err)),
        }
        fs::create_dir_all(dir).map_err(|err| TriageError::io(dir, err))
    }

    pub fn file_failure(
        &self,
        status: JobStatus,
        ignored: bool,
        counter: u64,
        artifacts: &[PathBuf],
    ) -> Result<Vec<PathBuf>, TriageError> {
        copy_artifacts(&self.status_dir(status, ignored), counter, artifacts)
    }

    pub fn file_invalid(
        &self,
        counter: u64,
        artifacts: &[PathBuf],
    ) -> Result<Vec<PathBuf>, TriageError> {
        copy_artifacts(&self.invalid_dir(), counter, artifacts)
    }

    pub fn file_mismatch(
        &self,
        counter: u64,
        artifacts: &[PathBuf],
    ) -> Result<Vec<PathBuf>, TriageError> {
        copy_artifacts(&self.mismatch_dir(), counter, artifacts)
    }

    /// Writes the minimized job, its rendered source, and the reduction
    /// report under `REDUCED/<STATUS>/`.
    pub fn file_reduction(
        &self,
        status: JobStatus,
        counter: u64,
        job: &ShaderJob,
        report: &ReductionReport,
    ) -> Result<Vec<PathBuf>, TriageError> {
        let dir = self.reduced_dir(status);
        let stem = format!("{}{}", counter_prefix(counter), job.name);
        let job_json = job
            .to_json()
            .map_err(|err| TriageError::Encode(err.to_string()))?;
        let report_json = serde_json::to_string_pretty(report)
            .map_err(|err| TriageError::Encode(err.to_string()))?;

        let outputs = [
            (dir.join(format!("{stem}.json")), job_json),
            (dir.join(format!("{stem}.frag")), job.program.render()),
            (dir.join(format!("{stem}.reduction.json")), report_json),
        ];
        let mut written = Vec::with_capacity(outputs.len());
        for (path, contents) in outputs {
            write_atomic(&path, contents.as_bytes())?;
            written.push(path);
        }
        Ok(written)
    }
}

fn copy_artifacts(
    dir: &Path,
    counter: u64,
    artifacts: &[PathBuf],
) -> Result<Vec<PathBuf>, TriageError> {
    fs::create_dir_all(dir).map_err(|err| TriageError::io(dir, err))?;
    let prefix = counter_prefix(counter);
    let mut copied = Vec::with_capacity(artifacts.len());
    for source in artifacts {
        let Some(name) = source.file_name() else {
            return Err(TriageError::UnnamedArtifact {
                path: source.clone(),
            });
        };
        let target = dir.join(format!("{prefix}{}", name.to_string_lossy()));
        fs::copy(source, &target).map_err(|err| TriageError::io(source, err))?;
        copied.push(target);
    }
    Ok(copied)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TriageError> {
    let parent = path
        .parent()
        .ok_or_else(|| TriageError::UnnamedArtifact {
            path: path.to_path_buf(),
        })?;
    fs::create_dir_all(parent).map_err(|err| TriageError::io(parent, err))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|err| TriageError::io(&tmp, err))?;
    fs::rename(&tmp, path).map_err(|err| TriageError::io(path, err))
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::program_tree::{AstDecl, ProgramAst};
    use crate::reducer::{ReductionStats, Termination};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "franken_reducer_{label}_{nanos}_{}",
            std::process::id()
        ))
    }

    fn scratch_file(layout: &TriageLayout, name: &str, contents: &str) -> PathBuf {
        let scratch = layout.scratch_dir(None);
        fs::create_dir_all(&scratch).expect("scratch");
        let path = scratch.join(name);
        fs::write(&path, contents).expect("write");
        path
    }

    #[test]
    fn counter_is_zero_padded() {
        assert_eq!(counter_prefix(0), "0000");
        assert_eq!(counter_prefix(42), "0042");
        assert_eq!(counter_prefix(12345), "12345");
    }

    #[test]
    fn failures_land_in_status_directories() {
        let layout = TriageLayout::new(temp_dir("status")).expect("layout");
        let variant = scratch_file(&layout, "variant.json", "{}");
        let info = scratch_file(&layout, "variant.info.json", "{}");

        let filed = layout
            .file_failure(JobStatus::Crash, true, 0, &[variant.clone(), info])
            .expect("file");
        assert_eq!(filed[0], layout.root().join("CRASH/IGNORE/0000variant.json"));
        assert!(filed.iter().all(|path| path.exists()));

        let filed = layout
            .file_failure(JobStatus::Timeout, false, 7, &[variant])
            .expect("file");
        assert_eq!(filed[0], layout.root().join("TIMEOUT/0007variant.json"));
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn refiling_into_existing_directory_succeeds() {
        let layout = TriageLayout::new(temp_dir("idempotent")).expect("layout");
        let variant = scratch_file(&layout, "variant.json", "{}");
        layout.file_invalid(0, &[variant.clone()]).expect("first");
        layout.file_invalid(1, &[variant]).expect("second");
        assert!(layout.invalid_dir().join("0000variant.json").exists());
        assert!(layout.invalid_dir().join("0001variant.json").exists());
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn reset_scratch_clears_previous_job() {
        let layout = TriageLayout::new(temp_dir("scratch")).expect("layout");
        let leftover = scratch_file(&layout, "stale.json", "{}");
        layout
            .reset_scratch(&layout.scratch_dir(None))
            .expect("reset");
        assert!(!leftover.exists());
        assert!(layout.scratch_dir(None).is_dir());

        let pooled = layout.scratch_dir(Some(3));
        layout.reset_scratch(&pooled).expect("reset pooled");
        assert!(pooled.ends_with("temp/worker-3"));
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn reductions_write_job_source_and_report() {
        let layout = TriageLayout::new(temp_dir("reduced")).expect("layout");
        let job = ShaderJob::new(
            "variant",
            "glsl-310es",
            ProgramAst::new(vec![AstDecl::function("void", "main", Vec::new(), Vec::new())]),
        );
        let report = ReductionReport {
            job_name: "variant".to_string(),
            trace_id: "t".to_string(),
            termination: Termination::Fixpoint,
            commits: Vec::new(),
            stats: ReductionStats::default(),
            events: Vec::new(),
        };
        let written = layout
            .file_reduction(JobStatus::Crash, 2, &job, &report)
            .expect("file");
        assert_eq!(written.len(), 3);
        assert_eq!(written[0], layout.root().join("REDUCED/CRASH/0002variant.json"));
        let decoded =
            ShaderJob::from_json(&fs::read_to_string(&written[0]).expect("read")).expect("decode");
        assert_eq!(decoded, job);
        assert!(
            fs::read_to_string(&written[1])
                .expect("read")
                .contains("void main()")
        );
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn missing_artifact_is_a_triage_error() {
        let layout = TriageLayout::new(temp_dir("missing")).expect("layout");
        let error = layout
            .file_mismatch(0, &[layout.root().join("nope.json")])
            .expect_err("missing source");
        assert_eq!(error.error_code(), "triage_io");
        fs::remove_dir_all(layout.root()).ok();
    }
}
