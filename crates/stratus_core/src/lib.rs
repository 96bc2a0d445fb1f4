//! # Stratus Core
//!
//! Types, traits and state machines shared by every stratus backend.
//!
//! - **[`Runner`](runner::Runner)**: One execution backend, driven through [`drive`](runner::drive).
//! - **[`ObjectStore`](traits::ObjectStore)**, **[`BatchApi`](traits::BatchApi)**, **[`LogApi`](traits::LogApi)**: Seams to the remote services.
//! - **[`InterruptCoordinator`](interrupt::InterruptCoordinator)**: Turns Ctrl-C presses into warn/cancel decisions.
//! - **[`PatternSet`](glob::PatternSet)**: Glob rules for upload exclusion and download selection.

pub mod config;
pub mod console;
pub mod constants;
pub mod env;
pub mod error;
pub mod glob;
pub mod interrupt;
pub mod job;
pub mod layout;
pub mod manifest;
pub mod retry;
pub mod runner;
pub mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::console::*;
    pub use crate::constants::*;
    pub use crate::env::*;
    pub use crate::error::*;
    pub use crate::glob::*;
    pub use crate::interrupt::*;
    pub use crate::job::*;
    pub use crate::layout::*;
    pub use crate::manifest::*;
    pub use crate::retry::*;
    pub use crate::runner::*;
    pub use crate::traits::*;
}
