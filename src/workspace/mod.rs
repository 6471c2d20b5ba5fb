//! Per-run workspace sandboxes and fixture staging
//!
//! Every run owns a fresh directory under the system temp dir, seeded from
//! the task's declared fixtures and destroyed when the run ends. Staging is
//! a security boundary: destinations are validated before any write so that
//! nothing the spec declares can place a file outside the workspace root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::fs;

use crate::spec::ResourceSpec;

/// Bound on workspace removal; cleanup beyond this is abandoned and logged.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixture staging failures.
#[derive(Error, Debug)]
pub enum StagingError {
    /// The declared destination would land outside the workspace root.
    #[error("destination '{dest}' escapes the workspace")]
    PathEscape { dest: String },

    /// The source path does not exist under the fixtures root.
    #[error("fixture source '{src_path}' not found")]
    MissingSource { src_path: String },

    /// Filesystem failure after one retry.
    #[error("staging io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An isolated per-run directory.
///
/// Exclusively owned by its run executor for the run's lifetime. Removal is
/// best-effort: failures are logged and never surfaced as run failures.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace directory at `<tmp>/waza-<random>`.
    pub async fn create() -> std::io::Result<Self> {
        let base = std::env::temp_dir();
        // A handful of attempts covers the unlikely suffix collision.
        for _ in 0..4 {
            let suffix: u32 = rand::random();
            let root = base.join(format!("waza-{suffix:08x}"));
            match fs::create_dir(&root).await {
                Ok(()) => return Ok(Self { root }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(std::io::Error::other("could not allocate workspace directory"))
    }

    /// The workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stage the declared fixtures into this workspace.
    pub async fn stage(
        &self,
        fixtures_root: &Path,
        resources: &[ResourceSpec],
    ) -> Result<(), StagingError> {
        stage_resources(fixtures_root, &self.root, resources).await
    }

    /// Remove the workspace directory, bounded by [`CLEANUP_TIMEOUT`].
    ///
    /// Runs under its own clock, independent of any run cancellation, so a
    /// cancelled benchmark still cleans up after itself.
    pub async fn cleanup(self) {
        let root = self.root;
        let removal = fs::remove_dir_all(&root);
        match tokio::time::timeout(CLEANUP_TIMEOUT, removal).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Ok(Err(e)) => {
                tracing::warn!(workspace = %root.display(), "workspace cleanup failed: {e}");
            }
            Err(_) => {
                tracing::warn!(
                    workspace = %root.display(),
                    "workspace cleanup timed out after {CLEANUP_TIMEOUT:?}"
                );
            }
        }
    }
}

/// Stage resources into `workspace_root`, validating every destination.
///
/// For each `{source, dest}` pair:
/// - `dest` must be relative and free of `..` segments, and the joined path
///   must canonicalize to a location under the workspace root
/// - `source` resolves against `fixtures_root`; files are copied with mode
///   0644 (0755 when the source is executable), directories recursively
///   with parents created as 0755
///
/// An empty resource list is legal and leaves the workspace empty. IO
/// failures are retried once before becoming fatal.
pub async fn stage_resources(
    fixtures_root: &Path,
    workspace_root: &Path,
    resources: &[ResourceSpec],
) -> Result<(), StagingError> {
    if resources.is_empty() {
        return Ok(());
    }

    let canonical_root = fs::canonicalize(workspace_root).await?;

    for resource in resources {
        let dest = validate_destination(&canonical_root, &resource.dest)?;

        let source = fixtures_root.join(&resource.source);
        if !source.exists() {
            return Err(StagingError::MissingSource {
                src_path: resource.source.display().to_string(),
            });
        }

        if let Some(parent) = dest.parent() {
            with_retry(|| create_dir_tree(parent)).await?;

            // Parent dirs now exist, so the canonical prefix check can run
            // against the real filesystem.
            let canonical_parent = fs::canonicalize(parent).await?;
            if !canonical_parent.starts_with(&canonical_root) {
                return Err(StagingError::PathEscape {
                    dest: resource.dest.display().to_string(),
                });
            }
        }

        if source.is_dir() {
            with_retry(|| copy_tree(&source, &dest)).await?;
        } else {
            with_retry(|| copy_file(&source, &dest)).await?;
        }
    }

    Ok(())
}

/// Reject absolute destinations and any path containing `..` segments, then
/// return the joined path.
fn validate_destination(workspace_root: &Path, dest: &Path) -> Result<PathBuf, StagingError> {
    use std::path::Component;

    let escape = || StagingError::PathEscape {
        dest: dest.display().to_string(),
    };

    if dest.as_os_str().is_empty() || dest.is_absolute() {
        return Err(escape());
    }
    for component in dest.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escape());
            }
        }
    }

    Ok(workspace_root.join(dest))
}

async fn with_retry<F, Fut>(mut op: F) -> Result<(), StagingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(first) = op().await {
        tracing::debug!("staging io failed, retrying once: {first}");
        op().await?;
    }
    Ok(())
}

async fn create_dir_tree(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path).await?;
    set_mode(path, 0o755).await
}

async fn copy_file(source: &Path, dest: &Path) -> std::io::Result<()> {
    fs::copy(source, dest).await?;
    let mode = if is_executable(source).await { 0o755 } else { 0o644 };
    set_mode(dest, mode).await
}

async fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    let mut stack = vec![(source.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        fs::create_dir_all(&to).await?;
        set_mode(&to, 0o755).await?;

        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let from_child = entry.path();
            let to_child = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                stack.push((from_child, to_child));
            } else {
                copy_file(&from_child, &to_child).await?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match fs::metadata(path).await {
        Ok(meta) => meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
async fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(source: &str, dest: &str) -> ResourceSpec {
        ResourceSpec {
            source: PathBuf::from(source),
            dest: PathBuf::from(dest),
        }
    }

    #[tokio::test]
    async fn test_workspace_create_and_cleanup() {
        let ws = Workspace::create().await.unwrap();
        let root = ws.root().to_path_buf();
        assert!(root.exists());
        assert!(
            root.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("waza-")
        );

        ws.cleanup().await;
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_stage_empty_resources_is_legal() {
        let fixtures = tempfile::tempdir().unwrap();
        let ws = Workspace::create().await.unwrap();

        ws.stage(fixtures.path(), &[]).await.unwrap();
        assert_eq!(std::fs::read_dir(ws.root()).unwrap().count(), 0);

        ws.cleanup().await;
    }

    #[tokio::test]
    async fn test_stage_copies_file_into_nested_dest() {
        let fixtures = tempfile::tempdir().unwrap();
        std::fs::write(fixtures.path().join("seed.txt"), "hello").unwrap();

        let ws = Workspace::create().await.unwrap();
        ws.stage(fixtures.path(), &[resource("seed.txt", "nested/dir/seed.txt")])
            .await
            .unwrap();

        let staged = ws.root().join("nested/dir/seed.txt");
        assert_eq!(std::fs::read_to_string(&staged).unwrap(), "hello");

        ws.cleanup().await;
    }

    #[tokio::test]
    async fn test_stage_copies_directory_tree() {
        let fixtures = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(fixtures.path().join("proj/src")).unwrap();
        std::fs::write(fixtures.path().join("proj/src/main.py"), "print(1)").unwrap();
        std::fs::write(fixtures.path().join("proj/README.md"), "# proj").unwrap();

        let ws = Workspace::create().await.unwrap();
        ws.stage(fixtures.path(), &[resource("proj", "project")])
            .await
            .unwrap();

        assert!(ws.root().join("project/src/main.py").exists());
        assert!(ws.root().join("project/README.md").exists());

        ws.cleanup().await;
    }

    #[tokio::test]
    async fn test_absolute_dest_is_rejected() {
        let fixtures = tempfile::tempdir().unwrap();
        std::fs::write(fixtures.path().join("seed.txt"), "x").unwrap();

        let ws = Workspace::create().await.unwrap();
        let err = ws
            .stage(fixtures.path(), &[resource("seed.txt", "/etc/seed.txt")])
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::PathEscape { .. }));

        ws.cleanup().await;
    }

    #[tokio::test]
    async fn test_parent_traversal_dest_is_rejected() {
        let fixtures = tempfile::tempdir().unwrap();
        std::fs::write(fixtures.path().join("seed.txt"), "x").unwrap();

        let ws = Workspace::create().await.unwrap();
        let err = ws
            .stage(fixtures.path(), &[resource("seed.txt", "ok/../../escape.txt")])
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::PathEscape { .. }));

        ws.cleanup().await;
    }

    #[tokio::test]
    async fn test_missing_source_is_reported() {
        let fixtures = tempfile::tempdir().unwrap();
        let ws = Workspace::create().await.unwrap();

        let err = ws
            .stage(fixtures.path(), &[resource("ghost.txt", "ghost.txt")])
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::MissingSource { .. }));

        ws.cleanup().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executable_bit_is_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let fixtures = tempfile::tempdir().unwrap();
        let script = fixtures.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let ws = Workspace::create().await.unwrap();
        ws.stage(fixtures.path(), &[resource("run.sh", "run.sh")])
            .await
            .unwrap();

        let staged = std::fs::metadata(ws.root().join("run.sh")).unwrap();
        assert_eq!(staged.permissions().mode() & 0o111, 0o111);

        ws.cleanup().await;
    }
}
