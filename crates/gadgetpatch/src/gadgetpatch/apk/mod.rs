pub mod apk_utils;
pub mod toolchain;
pub mod working_tree;
pub mod zipalign;

pub use toolchain::{Apktool, ToolOutput, Toolchain};
pub use working_tree::{DecodedApk, WorkingTree};
