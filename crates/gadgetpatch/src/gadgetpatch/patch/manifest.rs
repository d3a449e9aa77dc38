//! Reads and edits the decoded `AndroidManifest.xml` and the network
//! security config it references.
//!
//! Edits stream the document through `quick-xml` and change attributes and
//! elements in place, so formatting and everything we don't touch survives.
//! Every rewritten document is parsed again before it replaces the original.

use crate::gadgetpatch::apk::DecodedApk;
use crate::gadgetpatch::error::{PatchError, Result};
use crate::gadgetpatch::utils::write_atomic;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";
pub const INTERNET_PERMISSION: &str = "android.permission.INTERNET";
pub const DEFAULT_NSC_NAME: &str = "network_security_config";

const EXTRACT_NATIVE_LIBS: &str = "android:extractNativeLibs";
const NETWORK_SECURITY_CONFIG: &str = "android:networkSecurityConfig";

const DEFAULT_NSC: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<network-security-config>
    <base-config cleartextTrafficPermitted="true">
        <trust-anchors>
            <certificates src="system" />
            <certificates src="user" />
        </trust-anchors>
    </base-config>
</network-security-config>
"#;

fn manifest_err(msg: impl Into<String>) -> PatchError {
    PatchError::ManifestPatch(msg.into())
}

/// What the pipeline needs to know about the app.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestInfo {
    pub package: String,
    /// `<application android:name>`, fully qualified
    pub application_class: Option<String>,
    /// First activity (or alias target) with `MAIN` + `LAUNCHER`, fully qualified
    pub launcher_activity: Option<String>,
    pub permissions: Vec<String>,
    /// Raw `android:networkSecurityConfig` value, e.g. `@xml/network_security_config`
    pub network_security_config: Option<String>,
    pub extract_native_libs: Option<String>,
}

impl ManifestInfo {
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| PatchError::from_io(path, e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(text)
            .map_err(|e| manifest_err(format!("manifest is not well-formed XML: {e}")))?;
        let root = doc.root_element();

        if !root.has_tag_name("manifest") {
            return Err(manifest_err(format!(
                "root element is <{}>, expected <manifest>",
                root.tag_name().name()
            )));
        }

        let package = root
            .attribute("package")
            .ok_or_else(|| manifest_err("<manifest> has no package attribute"))?
            .to_string();

        let permissions = root
            .children()
            .filter(|n| n.has_tag_name("uses-permission"))
            .filter_map(|n| n.attribute((ANDROID_NS, "name")))
            .map(str::to_string)
            .collect();

        let application = root.children().find(|n| n.has_tag_name("application"));

        let mut info = Self {
            package,
            permissions,
            ..Self::default()
        };

        let Some(application) = application else {
            return Ok(info);
        };

        info.application_class = application
            .attribute((ANDROID_NS, "name"))
            .map(|name| qualify(&info.package, name));
        info.network_security_config = application
            .attribute((ANDROID_NS, "networkSecurityConfig"))
            .map(str::to_string);
        info.extract_native_libs = application
            .attribute((ANDROID_NS, "extractNativeLibs"))
            .map(str::to_string);

        info.launcher_activity = application
            .children()
            .filter(|n| n.has_tag_name("activity") || n.has_tag_name("activity-alias"))
            .find(|activity| is_launcher(activity))
            .and_then(|activity| {
                if activity.has_tag_name("activity-alias") {
                    activity.attribute((ANDROID_NS, "targetActivity"))
                } else {
                    activity.attribute((ANDROID_NS, "name"))
                }
            })
            .map(|name| qualify(&info.package, name));

        Ok(info)
    }

    /// The class whose static initializer runs first: the custom
    /// `Application` when declared, otherwise the launcher activity.
    pub fn entry_point(&self) -> Option<&str> {
        self.application_class
            .as_deref()
            .or(self.launcher_activity.as_deref())
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

fn is_launcher(activity: &roxmltree::Node) -> bool {
    activity
        .children()
        .filter(|n| n.has_tag_name("intent-filter"))
        .any(|filter| {
            let has = |tag: &str, value: &str| {
                filter.children().any(|n| {
                    n.has_tag_name(tag) && n.attribute((ANDROID_NS, "name")) == Some(value)
                })
            };

            has("action", "android.intent.action.MAIN")
                && has("category", "android.intent.category.LAUNCHER")
        })
}

/// Expands `.Main` and `Main` against the manifest package.
pub fn qualify(package: &str, name: &str) -> String {
    if let Some(relative) = name.strip_prefix('.') {
        format!("{package}.{relative}")
    } else if !name.contains('.') {
        format!("{package}.{name}")
    } else {
        name.to_string()
    }
}

/// Requested manifest changes. Every edit is idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestEdit {
    pub add_permissions: Vec<String>,
    pub extract_native_libs: bool,
    pub user_certificates: bool,
}

impl ManifestEdit {
    pub fn is_empty(&self) -> bool {
        self.add_permissions.is_empty() && !self.extract_native_libs && !self.user_certificates
    }
}

/// Files touched by [`apply_edits`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestReport {
    pub manifest_changed: bool,
    pub network_security_config: Option<PathBuf>,
}

pub fn apply_edits(decoded: &DecodedApk, edit: &ManifestEdit) -> Result<ManifestReport> {
    let mut report = ManifestReport::default();

    if edit.is_empty() {
        return Ok(report);
    }

    if !decoded.resources_decoded() {
        return Err(manifest_err(
            "resources were not decoded, the manifest is still binary",
        ));
    }

    let manifest_path = decoded.manifest_path();
    let original =
        fs::read_to_string(&manifest_path).map_err(|e| PatchError::from_io(&manifest_path, e))?;
    let info = ManifestInfo::parse(&original)?;

    let mut rewrite = Rewrite::default();

    for permission in &edit.add_permissions {
        if !info.has_permission(permission) && !rewrite.permissions.contains(permission) {
            rewrite.permissions.push(permission.clone());
        }
    }

    if edit.extract_native_libs && info.extract_native_libs.as_deref() != Some("true") {
        rewrite
            .attributes
            .push((EXTRACT_NATIVE_LIBS, "true".to_string()));
    }

    let mut nsc_update = None;
    if edit.user_certificates {
        let reference = match &info.network_security_config {
            Some(reference) => reference.clone(),
            None => {
                let reference = format!("@xml/{DEFAULT_NSC_NAME}");
                rewrite
                    .attributes
                    .push((NETWORK_SECURITY_CONFIG, reference.clone()));
                reference
            }
        };

        let nsc_path = nsc_path(decoded, &reference)?;
        if let Some(contents) = user_certificate_config(&nsc_path)? {
            nsc_update = Some((nsc_path, contents));
        }
    }

    let patched = if rewrite.is_empty() {
        debug!("Manifest already carries every requested edit");
        None
    } else {
        let patched = rewrite_manifest(&original, &rewrite)?;
        ManifestInfo::parse(&patched)
            .map_err(|e| manifest_err(format!("rewritten manifest failed to parse: {e}")))?;
        Some(patched)
    };

    // nothing is written until every document is built and checked
    if let Some((path, contents)) = nsc_update {
        write_nsc(&path, &contents)?;
        report.network_security_config = Some(path);
    }

    let Some(patched) = patched else {
        return Ok(report);
    };

    write_atomic(&manifest_path, patched)?;
    report.manifest_changed = true;

    for permission in &rewrite.permissions {
        info!("Added <uses-permission android:name=\"{permission}\"/>");
    }
    for (name, value) in &rewrite.attributes {
        info!("Set <application {name}=\"{value}\">");
    }

    Ok(report)
}

fn nsc_path(decoded: &DecodedApk, reference: &str) -> Result<PathBuf> {
    let name = reference.strip_prefix("@xml/").ok_or_else(|| {
        manifest_err(format!(
            "networkSecurityConfig '{reference}' is not an @xml resource"
        ))
    })?;

    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(manifest_err(format!("bad networkSecurityConfig '{reference}'")));
    }

    Ok(decoded.res_dir().join("xml").join(format!("{name}.xml")))
}

#[derive(Debug, Default)]
struct Rewrite {
    permissions: Vec<String>,
    attributes: Vec<(&'static str, String)>,
}

impl Rewrite {
    fn is_empty(&self) -> bool {
        self.permissions.is_empty() && self.attributes.is_empty()
    }
}

fn xml_err(reader: &Reader<&[u8]>, e: impl std::fmt::Display) -> PatchError {
    manifest_err(format!("at byte {}: {e}", reader.buffer_position()))
}

fn write_err(e: impl std::fmt::Display) -> PatchError {
    manifest_err(format!("failed to serialize manifest: {e}"))
}

fn finish(writer: Writer<Cursor<Vec<u8>>>) -> Result<String> {
    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| manifest_err(format!("rewritten document is not UTF-8: {e}")))
}

/// `start` with `attributes` set, replacing existing ones of the same name.
fn with_attributes<'a>(
    start: &BytesStart<'a>,
    attributes: &[(&str, String)],
) -> std::result::Result<BytesStart<'static>, String> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut rebuilt = BytesStart::new(name);

    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = attr.key.as_ref();

        if attributes.iter().any(|(name, _)| name.as_bytes() == key) {
            continue;
        }

        rebuilt.push_attribute((key, attr.value.as_ref()));
    }

    for (name, value) in attributes {
        rebuilt.push_attribute((*name, value.as_str()));
    }

    Ok(rebuilt)
}

fn rewrite_manifest(original: &str, rewrite: &Rewrite) -> Result<String> {
    let mut reader = Reader::from_str(original);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut seen_application = false;

    loop {
        let event = reader.read_event().map_err(|e| xml_err(&reader, e))?;

        match event {
            Event::Eof => break,
            Event::Start(ref e) if e.name().as_ref() == b"manifest" => {
                writer.write_event(event.borrow()).map_err(write_err)?;

                for permission in &rewrite.permissions {
                    writer
                        .write_event(Event::Text(BytesText::new("\n    ")))
                        .map_err(write_err)?;
                    let element = BytesStart::new("uses-permission")
                        .with_attributes([("android:name", permission.as_str())]);
                    writer.write_event(Event::Empty(element)).map_err(write_err)?;
                }
            }
            Event::Start(ref e) | Event::Empty(ref e)
                if e.name().as_ref() == b"application" && !seen_application =>
            {
                seen_application = true;
                let rebuilt = with_attributes(e, &rewrite.attributes)
                    .map_err(|msg| xml_err(&reader, msg))?;

                let rebuilt = if matches!(event, Event::Empty(_)) {
                    Event::Empty(rebuilt)
                } else {
                    Event::Start(rebuilt)
                };
                writer.write_event(rebuilt).map_err(write_err)?;
            }
            other => writer.write_event(other).map_err(write_err)?,
        }
    }

    if !rewrite.attributes.is_empty() && !seen_application {
        return Err(manifest_err("manifest has no <application> element"));
    }

    finish(writer)
}

/// Makes the network security config at `path` trust user-installed CAs.
/// Returns whether the file changed.
pub fn merge_user_certificates(path: &Path) -> Result<bool> {
    match user_certificate_config(path)? {
        Some(contents) => {
            write_nsc(path, &contents)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// The config `path` should hold to trust user CAs, or `None` when it
/// already does. Touches nothing.
fn user_certificate_config(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(Some(DEFAULT_NSC.to_string()));
    }

    let original = fs::read_to_string(path).map_err(|e| PatchError::from_io(path, e))?;
    let Some(merged) = merge_nsc(&original)? else {
        debug!("{} already trusts user certificates", path.display());
        return Ok(None);
    };

    roxmltree::Document::parse(&merged)
        .map_err(|e| manifest_err(format!("merged network security config is invalid: {e}")))?;

    Ok(Some(merged))
}

fn write_nsc(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PatchError::from_io(parent, e))?;
    }

    let created = !path.exists();
    write_atomic(path, contents)?;

    if created {
        info!("Created {}", path.display());
    } else {
        info!("Enabled user certificates in {}", path.display());
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NscShape {
    UserTrusted,
    HasTrustAnchors,
    HasBaseConfig,
    Bare,
}

fn nsc_shape(text: &str) -> Result<NscShape> {
    let doc = roxmltree::Document::parse(text)
        .map_err(|e| manifest_err(format!("network security config is not well-formed: {e}")))?;
    let root = doc.root_element();

    if !root.has_tag_name("network-security-config") {
        return Err(manifest_err(format!(
            "network security config root is <{}>",
            root.tag_name().name()
        )));
    }

    let Some(base) = root.children().find(|n| n.has_tag_name("base-config")) else {
        return Ok(NscShape::Bare);
    };

    let Some(anchors) = base.children().find(|n| n.has_tag_name("trust-anchors")) else {
        return Ok(NscShape::HasBaseConfig);
    };

    let trusts_user = anchors
        .children()
        .any(|n| n.has_tag_name("certificates") && n.attribute("src") == Some("user"));

    Ok(if trusts_user {
        NscShape::UserTrusted
    } else {
        NscShape::HasTrustAnchors
    })
}

fn certificates(src: &str) -> Event<'static> {
    Event::Empty(BytesStart::new("certificates").with_attributes([("src", src)]))
}

fn text(s: &str) -> Event<'_> {
    Event::Text(BytesText::new(s))
}

/// Writes the events that open `<trust-anchors>`, list `srcs` and close it.
fn write_trust_anchors(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    indent: &str,
    srcs: &[&str],
) -> Result<()> {
    let inner = format!("{indent}    ");

    writer.write_event(text(&format!("\n{indent}"))).map_err(write_err)?;
    writer
        .write_event(Event::Start(BytesStart::new("trust-anchors")))
        .map_err(write_err)?;
    for src in srcs {
        writer.write_event(text(&format!("\n{inner}"))).map_err(write_err)?;
        writer.write_event(certificates(src)).map_err(write_err)?;
    }
    writer.write_event(text(&format!("\n{indent}"))).map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("trust-anchors")))
        .map_err(write_err)
}

fn merge_nsc(original: &str) -> Result<Option<String>> {
    let shape = nsc_shape(original)?;
    if shape == NscShape::UserTrusted {
        return Ok(None);
    }

    let mut reader = Reader::from_str(original);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut done = false;

    loop {
        let event = reader.read_event().map_err(|e| xml_err(&reader, e))?;
        let in_base_config = stack.last().is_some_and(|name| name == b"base-config");

        match event {
            Event::Eof => break,

            // <trust-anchors> inside <base-config>: prepend the user source
            Event::Start(ref e)
                if !done
                    && shape == NscShape::HasTrustAnchors
                    && e.name().as_ref() == b"trust-anchors"
                    && in_base_config =>
            {
                done = true;
                stack.push(e.name().as_ref().to_vec());
                writer.write_event(event.borrow()).map_err(write_err)?;
                writer.write_event(text("\n            ")).map_err(write_err)?;
                writer.write_event(certificates("user")).map_err(write_err)?;
            }
            Event::Empty(ref e)
                if !done
                    && shape == NscShape::HasTrustAnchors
                    && e.name().as_ref() == b"trust-anchors"
                    && in_base_config =>
            {
                done = true;
                writer
                    .write_event(Event::Start(BytesStart::new("trust-anchors")))
                    .map_err(write_err)?;
                writer.write_event(text("\n            ")).map_err(write_err)?;
                writer.write_event(certificates("user")).map_err(write_err)?;
                writer.write_event(text("\n        ")).map_err(write_err)?;
                writer
                    .write_event(Event::End(BytesEnd::new("trust-anchors")))
                    .map_err(write_err)?;
            }

            // <base-config> without anchors: add system + user
            Event::Start(ref e)
                if !done
                    && shape == NscShape::HasBaseConfig
                    && e.name().as_ref() == b"base-config" =>
            {
                done = true;
                stack.push(e.name().as_ref().to_vec());
                writer.write_event(event.borrow()).map_err(write_err)?;
                write_trust_anchors(&mut writer, "        ", &["system", "user"])?;
            }
            Event::Empty(ref e)
                if !done
                    && shape == NscShape::HasBaseConfig
                    && e.name().as_ref() == b"base-config" =>
            {
                done = true;
                writer
                    .write_event(Event::Start(e.to_owned()))
                    .map_err(write_err)?;
                write_trust_anchors(&mut writer, "        ", &["system", "user"])?;
                writer.write_event(text("\n    ")).map_err(write_err)?;
                writer
                    .write_event(Event::End(BytesEnd::new("base-config")))
                    .map_err(write_err)?;
            }

            // no <base-config> at all
            Event::Start(ref e)
                if !done
                    && shape == NscShape::Bare
                    && e.name().as_ref() == b"network-security-config" =>
            {
                done = true;
                stack.push(e.name().as_ref().to_vec());
                writer.write_event(event.borrow()).map_err(write_err)?;
                write_base_config(&mut writer)?;
            }
            Event::Empty(ref e)
                if !done
                    && shape == NscShape::Bare
                    && e.name().as_ref() == b"network-security-config" =>
            {
                done = true;
                writer
                    .write_event(Event::Start(e.to_owned()))
                    .map_err(write_err)?;
                write_base_config(&mut writer)?;
                writer.write_event(text("\n")).map_err(write_err)?;
                writer
                    .write_event(Event::End(BytesEnd::new("network-security-config")))
                    .map_err(write_err)?;
            }

            Event::Start(ref e) => {
                stack.push(e.name().as_ref().to_vec());
                writer.write_event(event.borrow()).map_err(write_err)?;
            }
            Event::End(_) => {
                stack.pop();
                writer.write_event(event).map_err(write_err)?;
            }
            other => writer.write_event(other).map_err(write_err)?,
        }
    }

    if !done {
        warn!("Could not find where to add user certificates");
        return Err(manifest_err(
            "network security config has an unexpected structure",
        ));
    }

    finish(writer).map(Some)
}

fn write_base_config(writer: &mut Writer<Cursor<Vec<u8>>>) -> Result<()> {
    writer.write_event(text("\n    ")).map_err(write_err)?;
    writer
        .write_event(Event::Start(BytesStart::new("base-config")))
        .map_err(write_err)?;
    write_trust_anchors(writer, "        ", &["system", "user"])?;
    writer.write_event(text("\n    ")).map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("base-config")))
        .map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadgetpatch::testing::{MANIFEST, decoded_fixture};

    fn gadget_edit() -> ManifestEdit {
        ManifestEdit {
            add_permissions: vec![INTERNET_PERMISSION.to_string()],
            extract_native_libs: true,
            user_certificates: false,
        }
    }

    #[test]
    fn reads_launcher_and_package() {
        let info = ManifestInfo::parse(MANIFEST).unwrap();

        assert_eq!(info.package, "com.example");
        assert_eq!(info.application_class, None);
        assert_eq!(info.launcher_activity.as_deref(), Some("com.example.Main"));
        assert_eq!(info.entry_point(), Some("com.example.Main"));
        assert!(info.permissions.is_empty());
    }

    #[test]
    fn application_class_wins_and_relative_names_resolve() {
        let manifest = MANIFEST
            .replace("<application ", "<application android:name=\".App\" ")
            .replace("com.example.Main", "Main");
        let info = ManifestInfo::parse(&manifest).unwrap();

        assert_eq!(info.application_class.as_deref(), Some("com.example.App"));
        assert_eq!(info.launcher_activity.as_deref(), Some("com.example.Main"));
        assert_eq!(info.entry_point(), Some("com.example.App"));
    }

    #[test]
    fn alias_resolves_to_target_activity() {
        let manifest = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="org.demo">
    <application>
        <activity android:name="org.demo.ui.Home"/>
        <activity-alias android:name=".Launcher" android:targetActivity=".ui.Home">
            <intent-filter>
                <action android:name="android.intent.action.MAIN"/>
                <category android:name="android.intent.category.LAUNCHER"/>
            </intent-filter>
        </activity-alias>
    </application>
</manifest>"#;

        let info = ManifestInfo::parse(manifest).unwrap();
        assert_eq!(info.launcher_activity.as_deref(), Some("org.demo.ui.Home"));
    }

    #[test]
    fn gadget_edits_apply_once() {
        let dir = tempfile::tempdir().unwrap();
        let decoded = decoded_fixture(dir.path(), &[]);

        let first = apply_edits(&decoded, &gadget_edit()).unwrap();
        let after_first = fs::read_to_string(decoded.manifest_path()).unwrap();
        let second = apply_edits(&decoded, &gadget_edit()).unwrap();
        let after_second = fs::read_to_string(decoded.manifest_path()).unwrap();

        assert!(first.manifest_changed);
        assert!(!second.manifest_changed);
        assert_eq!(after_first, after_second);

        let info = ManifestInfo::parse(&after_first).unwrap();
        assert!(info.has_permission(INTERNET_PERMISSION));
        assert_eq!(info.extract_native_libs.as_deref(), Some("true"));
        assert_eq!(info.launcher_activity.as_deref(), Some("com.example.Main"));
        assert!(after_first.contains("android:label=\"@string/app_name\""));
    }

    #[test]
    fn extract_native_libs_false_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let decoded = decoded_fixture(dir.path(), &[]);
        let manifest = MANIFEST.replace(
            "<application ",
            "<application android:extractNativeLibs=\"false\" ",
        );
        fs::write(decoded.manifest_path(), manifest).unwrap();

        apply_edits(&decoded, &gadget_edit()).unwrap();

        let patched = fs::read_to_string(decoded.manifest_path()).unwrap();
        assert_eq!(patched.matches("extractNativeLibs").count(), 1);
        assert!(patched.contains("android:extractNativeLibs=\"true\""));
    }

    #[test]
    fn user_certificates_create_config_and_reference() {
        let dir = tempfile::tempdir().unwrap();
        let decoded = decoded_fixture(dir.path(), &[]);
        let edit = ManifestEdit {
            user_certificates: true,
            ..ManifestEdit::default()
        };

        let report = apply_edits(&decoded, &edit).unwrap();
        let nsc = decoded.res_dir().join("xml/network_security_config.xml");

        assert_eq!(report.network_security_config.as_deref(), Some(nsc.as_path()));
        assert_eq!(fs::read_to_string(&nsc).unwrap(), DEFAULT_NSC);
        let info = ManifestInfo::read(&decoded.manifest_path()).unwrap();
        assert_eq!(
            info.network_security_config.as_deref(),
            Some("@xml/network_security_config")
        );

        let manifest = fs::read_to_string(decoded.manifest_path()).unwrap();
        let again = apply_edits(&decoded, &edit).unwrap();
        assert_eq!(again, ManifestReport::default());
        assert_eq!(fs::read_to_string(decoded.manifest_path()).unwrap(), manifest);
        assert_eq!(fs::read_to_string(&nsc).unwrap(), DEFAULT_NSC);
    }

    fn merged(original: &str) -> String {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsc.xml");
        fs::write(&path, original).unwrap();

        assert!(merge_user_certificates(&path).unwrap());
        let once = fs::read_to_string(&path).unwrap();
        assert!(!merge_user_certificates(&path).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), once);

        assert_eq!(nsc_shape(&once).unwrap(), NscShape::UserTrusted);
        once
    }

    #[test]
    fn merge_adds_user_to_existing_anchors() {
        let out = merged(
            r#"<?xml version="1.0" encoding="utf-8"?>
<network-security-config>
    <domain-config>
        <domain includeSubdomains="true">example.com</domain>
        <trust-anchors>
            <certificates src="@raw/pinned"/>
        </trust-anchors>
    </domain-config>
    <base-config>
        <trust-anchors>
            <certificates src="system"/>
        </trust-anchors>
    </base-config>
</network-security-config>
"#,
        );

        assert_eq!(out.matches("src=\"user\"").count(), 1);
        assert!(out.contains("<certificates src=\"@raw/pinned\"/>"));
        let base = out.find("<base-config>").unwrap();
        assert!(out.find("src=\"user\"").unwrap() > base);
    }

    #[test]
    fn merge_fills_base_config_without_anchors() {
        let out = merged(
            "<network-security-config><base-config cleartextTrafficPermitted=\"false\"/></network-security-config>",
        );

        assert!(out.contains("<base-config cleartextTrafficPermitted=\"false\">"));
        assert!(out.contains("src=\"system\""));
        assert!(out.contains("src=\"user\""));
    }

    #[test]
    fn merge_adds_base_config_when_missing() {
        let out = merged(
            r#"<network-security-config>
    <domain-config cleartextTrafficPermitted="true">
        <domain>10.0.2.2</domain>
    </domain-config>
</network-security-config>"#,
        );

        assert!(out.contains("<domain>10.0.2.2</domain>"));
        assert_eq!(out.matches("<base-config>").count(), 1);
    }

    #[test]
    fn binary_manifest_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        crate::gadgetpatch::testing::write_fixture_tree(dir.path(), &[]);
        let decoded = DecodedApk::scan(dir.path(), false).unwrap();

        assert!(matches!(
            apply_edits(&decoded, &gadget_edit()),
            Err(PatchError::ManifestPatch(_))
        ));
    }

    #[test]
    fn failed_rewrite_leaves_no_security_config() {
        let dir = tempfile::tempdir().unwrap();
        let decoded = decoded_fixture(dir.path(), &[]);
        let bare = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example"/>"#;
        fs::write(decoded.manifest_path(), bare).unwrap();

        let edit = ManifestEdit {
            user_certificates: true,
            ..ManifestEdit::default()
        };
        let err = apply_edits(&decoded, &edit).unwrap_err();

        assert!(matches!(err, PatchError::ManifestPatch(msg) if msg.contains("no <application>")));
        assert!(!decoded.res_dir().join("xml/network_security_config.xml").exists());
        assert_eq!(fs::read_to_string(decoded.manifest_path()).unwrap(), bare);
    }
}
