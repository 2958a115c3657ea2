//! Projects: a workspace plus the collaborators that act on it.

use crate::ci::{CiMerger, GhCiMerger};
use crate::executor::{FinalizeExecutor, GitFinalizeExecutor};
use crate::git::{CommandGit, GitService};
use crate::publisher::EventPublisher;
use crate::storage::TaskStore;
use landing_core::Config;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("unknown project: {0}")]
    Unknown(String),
}

/// One workspace and its finalize collaborators.
#[derive(Clone)]
pub struct Project {
    pub id: String,
    pub work_dir: PathBuf,
    pub config: Arc<Config>,
    pub store: Arc<dyn TaskStore>,
    pub git: Arc<dyn GitService>,
    pub executor: Arc<dyn FinalizeExecutor>,
    pub ci: Arc<dyn CiMerger>,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("id", &self.id)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

impl Project {
    /// Project backed by the git/gh collaborators.
    pub fn open(
        id: impl Into<String>,
        work_dir: PathBuf,
        config: Config,
        store: Arc<dyn TaskStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            id: id.into(),
            git: Arc::new(CommandGit::new(&config)),
            executor: Arc::new(GitFinalizeExecutor::new(&config, publisher)),
            ci: Arc::new(GhCiMerger::new(&config)),
            config: Arc::new(config),
            store,
            work_dir,
        }
    }
}

/// Resolves project ids; the empty id is the daemon's own workspace.
#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    default: Project,
    projects: HashMap<String, Project>,
}

impl ProjectRegistry {
    pub fn new(default: Project) -> Self {
        Self {
            default,
            projects: HashMap::new(),
        }
    }

    pub fn with_project(mut self, project: Project) -> Self {
        self.projects.insert(project.id.clone(), project);
        self
    }

    pub fn default_project(&self) -> &Project {
        &self.default
    }

    pub fn resolve(&self, project_id: &str) -> Result<&Project, ProjectError> {
        if project_id.is_empty() || project_id == self.default.id {
            return Ok(&self.default);
        }
        self.projects
            .get(project_id)
            .ok_or_else(|| ProjectError::Unknown(project_id.to_string()))
    }

    /// Default project first, then the rest in id order.
    pub fn all(&self) -> Vec<&Project> {
        let mut rest: Vec<&Project> = self.projects.values().collect();
        rest.sort_by(|a, b| a.id.cmp(&b.id));
        std::iter::once(&self.default).chain(rest).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::Broadcaster;
    use crate::storage::MemoryStore;

    fn project(id: &str) -> Project {
        Project::open(
            id,
            PathBuf::from(format!("/work/{id}")),
            Config::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(Broadcaster::default()),
        )
    }

    #[test]
    fn empty_id_resolves_to_default() {
        let registry = ProjectRegistry::new(project("home")).with_project(project("api"));
        assert_eq!(registry.resolve("").unwrap().id, "home");
        assert_eq!(registry.resolve("home").unwrap().id, "home");
        assert_eq!(registry.resolve("api").unwrap().work_dir, PathBuf::from("/work/api"));
    }

    #[test]
    fn unknown_project_is_an_error() {
        let registry = ProjectRegistry::new(project("home"));
        assert!(matches!(
            registry.resolve("nope"),
            Err(ProjectError::Unknown(id)) if id == "nope"
        ));
    }

    #[test]
    fn all_lists_default_first() {
        let registry = ProjectRegistry::new(project("home"))
            .with_project(project("web"))
            .with_project(project("api"));
        let ids: Vec<_> = registry.all().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["home", "api", "web"]);
    }
}
