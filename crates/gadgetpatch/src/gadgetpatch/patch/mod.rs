pub mod injector;
pub mod manifest;
pub mod smali;

pub use injector::{ApplyOutcome, InjectionPlan};
pub use manifest::{ManifestEdit, ManifestInfo};
