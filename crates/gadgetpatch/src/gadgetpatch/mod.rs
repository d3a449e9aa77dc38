pub mod prelude {
    pub use crate::gadgetpatch::cli::{Cli, program};
    pub use crate::gadgetpatch::tui::progress;
    pub use crate::gadgetpatch::utils::writer::MultiProgressWriter;
    pub use clap::Parser;
    pub use std::sync::Arc;
    pub use tracing_subscriber::fmt::format::FmtSpan;
}

pub mod adb;
pub mod apk;
pub mod arch;
pub mod cli;
pub mod config;
pub mod deps;
pub mod error;
pub mod gadget;
pub mod patch;
pub mod pipeline;
pub mod tui;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;
