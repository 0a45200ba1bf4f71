//! Route topology, issue knowledge base and configuration for the dev proxy
//! manager. Everything here is synchronous and free of I/O beyond reading the
//! route and knowledge directories.

pub mod config;
pub mod knowledge;
pub mod topology;

#[cfg(test)]
mod test_support;

pub use config::{load_config, resolve_config_path, Config, ConfigError};
pub use knowledge::{KnowledgeBase, KnowledgeError, MatchedIssue, Solution, SolutionKind};
pub use topology::{RouteTopology, TopologyError};

/// Split a configured command line into an argument vector.
///
/// Whitespace separated; an empty or blank command yields an empty vector.
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
