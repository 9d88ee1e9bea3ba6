//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                          |
//! |-----------|-----------------------------------------------------------|
//! | `project` | `Init`, `Status`, `Archive`                               |
//! | `phase`   | `Start`, `Complete`, `Fail`, `Skip`, `Abort`, `Finish`, `Agent` |
//! | `review`  | `Review`, `Queue`                                         |
//! | `config`  | `Config`                                                  |

pub mod config;
pub mod phase;
pub mod project;
pub mod review;

pub use config::cmd_config;
pub use phase::{cmd_abort, cmd_agent, cmd_complete, cmd_fail, cmd_finish, cmd_skip, cmd_start};
pub use project::{cmd_archive, cmd_init, cmd_status};
pub use review::{cmd_queue, cmd_review};

use anyhow::{Context, Result};
use conductor::config::ConductorConfig;
use conductor::phase::PhaseMachine;
use conductor::state::StateStore;
use serde_json::Value;

/// Phase machine over the configured project directory.
pub(crate) fn machine(config: &ConductorConfig) -> PhaseMachine {
    PhaseMachine::new(StateStore::from_config(config), config.project_dir.clone())
}

/// Parse an optional JSON command-line argument.
pub(crate) fn parse_json(arg: Option<&str>, what: &str) -> Result<Option<Value>> {
    arg.map(|raw| serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", what)))
        .transpose()
}
