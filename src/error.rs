//! Fatal configuration and graph-integrity errors.
//!
//! These abort a build before (or instead of) dispatching more work.  Task
//! failures are not errors in this sense; they are reported through the
//! build status.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle: {0}")]
    Cycle(String),

    #[error(
        "{path} is used by {command} but is not declared as an output; \
         a generated file was used without being declared as an output"
    )]
    UndeclaredOutput { path: String, command: String },

    #[error(
        "{command} depends on {path}, but the command producing it is not \
         known to run first; declare the dependency explicitly"
    )]
    AmbiguousOrder { path: String, command: String },

    #[error("{path} is declared as an output of both {first} and {second}")]
    DuplicateOutput {
        path: String,
        first: String,
        second: String,
    },

    #[error("{path} is used as both a {existing} and a {requested}")]
    PathConflict {
        path: String,
        existing: String,
        requested: String,
    },

    #[error("refactoring: new {kind} {path} would be added to the graph")]
    Refactor { kind: &'static str, path: String },

    #[error("build database is unreadable ({0}); delete it and reconfigure from scratch")]
    Corrupt(String),
}
