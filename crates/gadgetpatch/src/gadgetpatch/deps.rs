use crate::gadgetpatch::error::{PatchError, Result};
use tracing::{debug, error, info};
use which::which;

/// An external program the pipeline shells out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub name: &'static str,
    pub command: &'static str,
    pub hint: &'static str,
}

pub const APKTOOL: Dependency = Dependency {
    name: "APKTool",
    command: "apktool",
    hint: "Download from https://apktool.org/docs/install",
};

pub const JAVA: Dependency = Dependency {
    name: "Java",
    command: "java",
    hint: "Install a Java runtime (JDK 17 or newer)",
};

pub const ZIPALIGN: Dependency = Dependency {
    name: "Zipalign",
    command: "zipalign",
    hint: "Install Android SDK Build Tools",
};

pub const APKSIGNER: Dependency = Dependency {
    name: "APKSigner",
    command: "apksigner",
    hint: "Install Android SDK Build Tools",
};

pub const KEYTOOL: Dependency = Dependency {
    name: "Keytool",
    command: "keytool",
    hint: "Install a Java JDK",
};

pub const FRIDA: Dependency = Dependency {
    name: "Frida",
    command: "frida",
    hint: "pip3 install frida-tools",
};

pub fn is_available(dep: &Dependency) -> bool {
    which(dep.command).is_ok()
}

/// Fails with every missing tool at once, so the user can fix them in one go.
pub fn ensure(deps: &[Dependency]) -> Result<()> {
    let missing: Vec<&Dependency> = deps.iter().filter(|dep| !is_available(dep)).collect();

    if missing.is_empty() {
        debug!("All {} external tools found on PATH", deps.len());
        return Ok(());
    }

    for dep in &missing {
        error!("{} ({}) not found in PATH", dep.name, dep.command);
        info!("  {}: {}", dep.command, dep.hint);
    }

    Err(PatchError::DependencyMissing {
        missing: missing.iter().map(|dep| dep.command.to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_is_satisfied() {
        assert!(ensure(&[]).is_ok());
    }

    #[test]
    fn reports_every_missing_command() {
        let ghost = Dependency {
            name: "Ghost",
            command: "gadgetpatch-definitely-not-installed",
            hint: "",
        };
        let other = Dependency {
            command: "gadgetpatch-also-missing",
            ..ghost
        };

        match ensure(&[ghost, other]) {
            Err(PatchError::DependencyMissing { missing }) => assert_eq!(
                missing,
                ["gadgetpatch-definitely-not-installed", "gadgetpatch-also-missing"]
            ),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
