//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module  | Commands handled   |
//! |---------|--------------------|
//! | `run`   | `Run`              |
//! | `board` | `List`, `Status`   |
//! | `card`  | `Validate`         |
//! | `locks` | `Locks`            |

pub mod board;
pub mod card;
pub mod locks;
pub mod run;

pub use board::{cmd_list, cmd_status};
pub use card::cmd_validate;
pub use locks::cmd_locks;
pub use run::cmd_run;
