pub mod collaborator;
pub mod committer;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod external;
pub mod git;
pub mod graph;
pub mod history;
pub mod io;
pub mod lock;
pub mod paths;
pub mod pending;
pub mod project;
pub mod stage;
pub mod store;
pub mod types;

pub use error::{Result, StageError};
