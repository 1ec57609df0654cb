//! Session configuration

/// Behaviour knobs shared by every session of a feed graph
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Owner `PROGRESS` follows the transient flag of its active dependencies
    pub forward_dependency_progress: bool,
    /// Owner `PROGRESS` is raised while a reload execution runs
    pub transient_on_reload: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            forward_dependency_progress: true,
            transient_on_reload: false,
        }
    }
}

impl SessionConfig {
    /// Owners only ever publish their own results
    pub fn quiet() -> Self {
        SessionConfig {
            forward_dependency_progress: false,
            transient_on_reload: false,
        }
    }

    /// Owners report both upstream loading and their own reloads
    pub fn verbose() -> Self {
        SessionConfig {
            forward_dependency_progress: true,
            transient_on_reload: true,
        }
    }
}
