//! Operations manager configuration

use std::fmt;
use std::str::FromStr;

use feedflow_core::FeedError;

/// Policy applied to overlapping asynchronous submissions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ConcurrencyMode {
    /// Sequential, FIFO: a submission while busy is buffered
    #[default]
    Queue,
    /// Last wins: a submission cancels the running operation
    AbortPrevious,
    /// First wins: a submission while busy is dropped
    IgnoreNew,
    /// Every submission runs immediately
    Parallel,
}

impl ConcurrencyMode {
    pub const ALL: [ConcurrencyMode; 4] = [
        ConcurrencyMode::Queue,
        ConcurrencyMode::AbortPrevious,
        ConcurrencyMode::IgnoreNew,
        ConcurrencyMode::Parallel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConcurrencyMode::Queue => "queue",
            ConcurrencyMode::AbortPrevious => "abort-previous",
            ConcurrencyMode::IgnoreNew => "ignore-new",
            ConcurrencyMode::Parallel => "parallel",
        }
    }
}

impl fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConcurrencyMode {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "queue" | "sequential" => Ok(ConcurrencyMode::Queue),
            "abortprevious" | "lastwins" => Ok(ConcurrencyMode::AbortPrevious),
            "ignorenew" | "firstwins" => Ok(ConcurrencyMode::IgnoreNew),
            "parallel" => Ok(ConcurrencyMode::Parallel),
            _ => Err(FeedError::InvalidConfig(format!(
                "unknown concurrency mode '{}'",
                s
            ))),
        }
    }
}

/// Operations manager configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct OperationsConfig {
    /// Concurrency policy
    pub mode: ConcurrencyMode,
    /// Log failures and keep going instead of faulting the manager
    pub silent_errors: bool,
}

impl OperationsConfig {
    pub fn new(mode: ConcurrencyMode) -> Self {
        OperationsConfig {
            mode,
            silent_errors: false,
        }
    }

    /// Preset for commands bound to UI actions: last wins, failures logged
    pub fn command() -> Self {
        OperationsConfig {
            mode: ConcurrencyMode::AbortPrevious,
            silent_errors: true,
        }
    }

    pub fn with_silent_errors(mut self, silent_errors: bool) -> Self {
        self.silent_errors = silent_errors;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_parse_ignores_case(index in 0usize..4, upper in proptest::collection::vec(any::<bool>(), 16)) {
            let mode = ConcurrencyMode::ALL[index];
            let mangled: String = mode
                .as_str()
                .chars()
                .zip(upper.iter().cycle())
                .map(|(c, up)| if *up { c.to_ascii_uppercase() } else { c })
                .collect();
            prop_assert_eq!(mangled.parse::<ConcurrencyMode>(), Ok(mode));
        }
    }

    #[test]
    fn test_mode_parse_aliases() {
        assert_eq!("Queue".parse::<ConcurrencyMode>().unwrap(), ConcurrencyMode::Queue);
        assert_eq!(
            "abort_previous".parse::<ConcurrencyMode>().unwrap(),
            ConcurrencyMode::AbortPrevious
        );
        assert_eq!(
            "first-wins".parse::<ConcurrencyMode>().unwrap(),
            ConcurrencyMode::IgnoreNew
        );
        assert!(matches!(
            "round-robin".parse::<ConcurrencyMode>(),
            Err(FeedError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_mode_display_round_trips() {
        for mode in ConcurrencyMode::ALL {
            assert_eq!(mode.to_string().parse::<ConcurrencyMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_config_presets() {
        let config = OperationsConfig::default();
        assert_eq!(config.mode, ConcurrencyMode::Queue);
        assert!(!config.silent_errors);

        let command = OperationsConfig::command();
        assert_eq!(command.mode, ConcurrencyMode::AbortPrevious);
        assert!(command.silent_errors);
    }
}
