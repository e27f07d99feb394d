//! CLI command implementations.
//!
//! | Module  | Commands handled |
//! |---------|------------------|
//! | `init`  | `Init`           |
//! | `serve` | `Serve`          |
//! | `run`   | `Run`            |

pub mod init;
pub mod run;
pub mod serve;

pub use init::cmd_init;
pub use run::cmd_run;
pub use serve::cmd_serve;
