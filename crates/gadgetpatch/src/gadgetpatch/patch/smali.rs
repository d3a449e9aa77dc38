//! Text-level edits to smali class files.

use crop::Rope;
use once_cell::sync::Lazy;
use regex::Regex;

/// Library name handed to `System.loadLibrary`; the runtime maps it to
/// `lib<name>.so` in the app's native library directory.
pub const GADGET_LIBRARY: &str = "frida-gadget";

static LOADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*const-string(?:/jumbo)?[ \t]+[vp]\d+,[ \t]*"frida-gadget"[ \t]*\r?\n(?:[ \t]*\r?\n)*[ \t]*invoke-static[^\n]*Ljava/lang/System;->loadLibrary\(Ljava/lang/String;\)V"#,
    )
    .unwrap()
});

static CLINIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\.method[^\n]*[ \t]<clinit>\(\)V[ \t]*\r?$").unwrap());

static END_METHOD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\.end method").unwrap());

static REGISTERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*\.(?:locals|registers)[ \t]+(\d+)[ \t]*\r?$").unwrap());

static DIRECT_METHODS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^# direct methods[ \t]*\r?\n").unwrap());

static ANY_METHOD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\.method ").unwrap());

/// How the loader call gets into the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The class has a static initializer; prepend the call to it
    PatchExistingInitializer,
    /// No static initializer; add one
    InsertInitializer,
}

/// Number of `loadLibrary("frida-gadget")` sequences in `source`.
pub fn count_loaders(source: &str) -> usize {
    LOADER.find_iter(source).count()
}

pub fn has_loader(source: &str) -> bool {
    LOADER.is_match(source)
}

pub fn choose_strategy(source: &str) -> Strategy {
    if CLINIT.is_match(source) {
        Strategy::PatchExistingInitializer
    } else {
        Strategy::InsertInitializer
    }
}

fn loader_lines() -> String {
    format!(
        "\n\n    const-string v0, \"{GADGET_LIBRARY}\"\n\n    invoke-static {{v0}}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V"
    )
}

fn new_initializer() -> String {
    format!(
        ".method static constructor <clinit>()V\n    .locals 1{}\n\n    return-void\n.end method\n\n",
        loader_lines()
    )
}

/// Returns `source` with the gadget loaded first thing in the static
/// initializer.
pub fn inject_loader(source: &str, strategy: Strategy) -> String {
    let mut rope = Rope::from(source);

    match strategy {
        Strategy::PatchExistingInitializer => patch_initializer(source, &mut rope),
        Strategy::InsertInitializer => insert_initializer(source, &mut rope),
    }

    rope.to_string()
}

fn patch_initializer(source: &str, rope: &mut Rope) {
    let Some(method) = CLINIT.find(source) else {
        return insert_initializer(source, rope);
    };

    let body_start = method.end();
    let body_end = END_METHOD
        .find_at(source, body_start)
        .map_or(source.len(), |m| m.start());
    let body = &source[body_start..body_end];

    match REGISTERS.captures(body) {
        Some(caps) => {
            let directive = caps.get(0).map_or(0..0, |m| m.range());
            let count = caps.get(1).map_or(0..0, |m| m.range());

            rope.insert(body_start + directive.end, loader_lines());

            if &body[count.clone()] == "0" {
                let at = body_start + count.start;
                rope.replace(at..at + 1, "1");
            }
        }
        None => {
            let with_locals = format!("\n    .locals 1{}", loader_lines());
            rope.insert(body_start, with_locals);
        }
    }
}

fn insert_initializer(source: &str, rope: &mut Rope) {
    let at = DIRECT_METHODS
        .find(source)
        .map(|m| m.end())
        .or_else(|| ANY_METHOD.find(source).map(|m| m.start()));

    match at {
        Some(at) => rope.insert(at, new_initializer()),
        None => {
            let separator = if source.ends_with('\n') { "\n" } else { "\n\n" };
            rope.insert(source.len(), format!("{separator}{}", new_initializer()));
        }
    }
}
