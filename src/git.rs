//! Git repository discovery and branch queries.
//!
//! Used to derive tag names from the current branch (`tag add --from-branch`).

use std::path::Path;

use git2::{ErrorCode, Repository};

use crate::error::{Error, Result};

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Discover a git repository from a starting path.
pub fn discover_repo(start: &Path) -> Result<Repository> {
    Repository::discover(start).map_err(|err| {
        if err.code() == ErrorCode::NotFound {
            Error::RepoNotFound(start.to_path_buf())
        } else {
            Error::Git(err)
        }
    })
}

/// Short name of the branch HEAD points at.
///
/// Works on a freshly initialised repository whose branch has no commits yet.
/// A detached HEAD has no branch and is an error.
pub fn current_branch(repo: &Repository) -> Result<String> {
    match repo.head() {
        Ok(head) => {
            if !head.is_branch() {
                return Err(Error::OperationFailed(
                    "HEAD is detached; check out a branch first".to_string(),
                ));
            }
            head.shorthand()
                .map(|name| name.to_string())
                .ok_or_else(|| Error::OperationFailed("branch name is not valid UTF-8".to_string()))
        }
        Err(err) if err.code() == ErrorCode::UnbornBranch => {
            let head = repo.find_reference("HEAD")?;
            head.symbolic_target()
                .and_then(|target| target.strip_prefix(BRANCH_REF_PREFIX))
                .map(|name| name.to_string())
                .ok_or_else(|| Error::OperationFailed("HEAD does not name a branch".to_string()))
        }
        Err(err) => Err(Error::Git(err)),
    }
}

/// Discover the repository containing `start` and return its current branch.
pub fn current_branch_at(start: &Path) -> Result<String> {
    let repo = discover_repo(start)?;
    current_branch(&repo)
}
