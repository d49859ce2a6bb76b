//! Version-control plumbing for the publish pipeline
//!
//! The publish loop talks to its remote through the [`VersionControl`]
//! trait: read the shared document, write the merged result back, commit
//! and push. The push reports whether the remote accepted the commit or
//! rejected it as non-fast-forward, which is the signal the publisher's
//! retry loop is built around. [`GitCli`] is the production implementation,
//! shelling out to the `git` binary in a working copy.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Errors produced by version-control operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`], spawning the binary or touching the
    /// working copy.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A git command exited unsuccessfully.
    #[error("`git {args}` failed with {status}: {stderr}")]
    Command {
        /// Arguments the command was invoked with.
        args: String,
        /// Exit status of the command.
        status: std::process::ExitStatus,
        /// Captured standard error.
        stderr: String,
    },
}

/// Outcome of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The remote accepted the commit.
    Accepted,
    /// The remote rejected the commit as non-fast-forward; someone else
    /// pushed first and the working copy must re-sync before retrying.
    Rejected,
}

/// Operations the publish loop needs from a versioned remote.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Switch the working copy to `branch`, creating it if absent.
    async fn checkout(&self, branch: &str) -> Result<(), Error>;

    /// Fast-forward the working copy to the remote tip. A branch with no
    /// remote counterpart yet is not an error.
    async fn pull(&self) -> Result<(), Error>;

    /// Fetch remote refs without touching the working copy.
    async fn fetch(&self) -> Result<(), Error>;

    /// Discard local commits and state, resetting the working copy to
    /// `target`.
    async fn hard_reset(&self, target: &str) -> Result<(), Error>;

    /// Read a file from the working copy, `None` if it does not exist.
    async fn read_file(&self, path: &Path) -> Result<Option<String>, Error>;

    /// Write a file into the working copy.
    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), Error>;

    /// Stage a file.
    async fn add(&self, path: &Path) -> Result<(), Error>;

    /// Commit staged changes.
    async fn commit(&self, message: &str) -> Result<(), Error>;

    /// Push the current branch, distinguishing acceptance from a
    /// non-fast-forward rejection.
    async fn push(&self) -> Result<PushOutcome, Error>;
}

/// [`VersionControl`] implementation shelling out to the `git` binary.
#[derive(Debug)]
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    /// Clone `url` into `workdir` and return a handle operating on the
    /// resulting working copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the clone fails.
    pub async fn clone_repo(url: &str, workdir: impl Into<PathBuf>) -> Result<Self, Error> {
        let workdir = workdir.into();
        let output = Command::new("git")
            .args(["clone", url])
            .arg(&workdir)
            .output()
            .await?;
        check_status(&["clone", url], &output)?;
        Ok(Self { workdir })
    }

    /// A handle over an existing working copy.
    #[must_use]
    pub fn at(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Absolute path of a file inside the working copy.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.workdir.join(path)
    }

    async fn run_raw(&self, args: &[&str]) -> Result<Output, Error> {
        debug!(args = args.join(" "), workdir = %self.workdir.display(), "running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await?;
        Ok(output)
    }

    async fn run(&self, args: &[&str]) -> Result<Output, Error> {
        let output = self.run_raw(args).await?;
        check_status(args, &output)?;
        Ok(output)
    }
}

fn check_status(args: &[&str], output: &Output) -> Result<(), Error> {
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Command {
            args: args.join(" "),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn checkout(&self, branch: &str) -> Result<(), Error> {
        let output = self.run_raw(&["checkout", branch]).await?;
        if output.status.success() {
            return Ok(());
        }
        self.run(&["checkout", "-b", branch]).await?;
        Ok(())
    }

    async fn pull(&self) -> Result<(), Error> {
        let output = self.run_raw(&["pull", "--ff-only"]).await?;
        if output.status.success() {
            return Ok(());
        }
        // A branch nobody has pushed yet has nothing to pull from.
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("couldn't find remote ref")
            || stderr.contains("no tracking information")
        {
            return Ok(());
        }
        check_status(&["pull", "--ff-only"], &output)
    }

    async fn fetch(&self) -> Result<(), Error> {
        self.run(&["fetch", "origin"]).await?;
        Ok(())
    }

    async fn hard_reset(&self, target: &str) -> Result<(), Error> {
        self.run(&["reset", "--hard", target]).await?;
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>, Error> {
        match tokio::fs::read_to_string(self.resolve(path)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::Io(err)),
        }
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), Error> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, contents).await?;
        Ok(())
    }

    async fn add(&self, path: &Path) -> Result<(), Error> {
        let path = path.to_string_lossy();
        self.run(&["add", path.as_ref()]).await?;
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<(), Error> {
        self.run(&["commit", "-m", message]).await?;
        Ok(())
    }

    async fn push(&self) -> Result<PushOutcome, Error> {
        let args = ["push", "--porcelain", "--set-upstream", "origin", "HEAD"];
        let output = self.run_raw(&args).await?;
        if output.status.success() {
            return Ok(PushOutcome::Accepted);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let rejected = stdout.lines().any(|line| line.starts_with('!'))
            || stderr.contains("non-fast-forward")
            || stderr.contains("fetch first")
            || stderr.contains("[rejected]");
        if rejected {
            return Ok(PushOutcome::Rejected);
        }
        check_status(&args, &output)?;
        Ok(PushOutcome::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success())
    }

    fn configure_identity(workdir: &Path) {
        for (key, value) in [("user.name", "perfchart-test"), ("user.email", "t@t")] {
            let status = std::process::Command::new("git")
                .args(["config", key, value])
                .current_dir(workdir)
                .status()
                .unwrap();
            assert!(status.success());
        }
    }

    async fn bare_remote(dir: &Path) -> String {
        let remote = dir.join("remote.git");
        let output = Command::new("git")
            .args(["init", "--bare", "-b", "main"])
            .arg(&remote)
            .output()
            .await
            .unwrap();
        assert!(output.status.success());
        remote.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn push_accepted_then_rejected_on_divergence() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let url = bare_remote(dir.path()).await;

        let first = GitCli::clone_repo(&url, dir.path().join("first"))
            .await
            .unwrap();
        configure_identity(&first.workdir);
        let second = GitCli::clone_repo(&url, dir.path().join("second"))
            .await
            .unwrap();
        configure_identity(&second.workdir);

        first.checkout("main").await.unwrap();
        first
            .write_file(Path::new("chart.json"), "{\"traces\": []}")
            .await
            .unwrap();
        first.add(Path::new("chart.json")).await.unwrap();
        first.commit("first publish").await.unwrap();
        assert_eq!(first.push().await.unwrap(), PushOutcome::Accepted);

        // The second clone never saw the first push; its commit must come
        // back rejected rather than as a hard error.
        second.checkout("main").await.unwrap();
        second
            .write_file(Path::new("chart.json"), "{\"traces\": [1]}")
            .await
            .unwrap();
        second.add(Path::new("chart.json")).await.unwrap();
        second.commit("conflicting publish").await.unwrap();
        assert_eq!(second.push().await.unwrap(), PushOutcome::Rejected);

        // After re-syncing to the remote tip the retry goes through.
        second.fetch().await.unwrap();
        second.hard_reset("origin/main").await.unwrap();
        second
            .write_file(Path::new("chart.json"), "{\"traces\": [1, 2]}")
            .await
            .unwrap();
        second.add(Path::new("chart.json")).await.unwrap();
        second.commit("retried publish").await.unwrap();
        assert_eq!(second.push().await.unwrap(), PushOutcome::Accepted);
    }

    #[tokio::test]
    async fn read_file_distinguishes_missing_from_failing() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let url = bare_remote(dir.path()).await;
        let clone = GitCli::clone_repo(&url, dir.path().join("clone"))
            .await
            .unwrap();

        assert!(clone
            .read_file(Path::new("absent.json"))
            .await
            .unwrap()
            .is_none());

        clone
            .write_file(Path::new("present.json"), "{}")
            .await
            .unwrap();
        assert_eq!(
            clone.read_file(Path::new("present.json")).await.unwrap(),
            Some("{}".to_string())
        );
    }
}
