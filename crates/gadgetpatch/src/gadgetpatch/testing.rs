//! Hermetic stand-ins for the external collaborators, plus a small APK
//! fixture, shared by the unit tests.

use crate::gadgetpatch::adb::DeviceBridge;
use crate::gadgetpatch::apk::toolchain::{ToolOutput, Toolchain};
use crate::gadgetpatch::apk::DecodedApk;
use crate::gadgetpatch::arch::Architecture;
use crate::gadgetpatch::config::KeystoreConfig;
use crate::gadgetpatch::error::{PatchError, Result};
use crate::gadgetpatch::gadget::GadgetSource;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="no"?><manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example" platformBuildVersionCode="33">
    <application android:allowBackup="true" android:label="@string/app_name">
        <activity android:exported="true" android:name="com.example.Main">
            <intent-filter>
                <action android:name="android.intent.action.MAIN"/>
                <category android:name="android.intent.category.LAUNCHER"/>
            </intent-filter>
        </activity>
    </application>
</manifest>
"#;

pub const MAIN_SMALI: &str = r#".class public Lcom/example/Main;
.super Landroid/app/Activity;
.source "Main.java"


# direct methods
.method public constructor <init>()V
    .locals 0

    invoke-direct {p0}, Landroid/app/Activity;-><init>()V

    return-void
.end method


# virtual methods
.method protected onCreate(Landroid/os/Bundle;)V
    .locals 0

    invoke-super {p0, p1}, Landroid/app/Activity;->onCreate(Landroid/os/Bundle;)V

    return-void
.end method
"#;

const HELPER_SMALI: &str = r#".class public Lcom/example/util/Helper;
.super Ljava/lang/Object;
.source "Helper.java"
"#;

const STRINGS_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<resources>
    <string name="app_name">Example</string>
</resources>
"#;

/// Minimal 64-bit little-endian ELF header, enough to pass the magic check.
pub fn elf_bytes() -> Vec<u8> {
    let mut bytes = b"\x7fELF\x02\x01\x01".to_vec();
    bytes.resize(64, 0);
    bytes
}

pub fn xz_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Lays out a decoded `com.example` app under `root`, with one native
/// library per ABI directory in `abis`.
pub fn write_fixture_tree(root: &Path, abis: &[&str]) {
    let files: [(&str, &[u8]); 4] = [
        ("AndroidManifest.xml", MANIFEST.as_bytes()),
        ("smali/com/example/Main.smali", MAIN_SMALI.as_bytes()),
        ("smali_classes2/com/example/util/Helper.smali", HELPER_SMALI.as_bytes()),
        ("res/values/strings.xml", STRINGS_XML.as_bytes()),
    ];

    for (name, contents) in files {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    for abi in abis {
        let dir = root.join("lib").join(abi);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("libnative.so"), elf_bytes()).unwrap();
    }
}

pub fn decoded_fixture(root: &Path, abis: &[&str]) -> DecodedApk {
    write_fixture_tree(root, abis);
    DecodedApk::scan(root, true).unwrap()
}

/// Builds `<dir>/app.apk` from the fixture tree.
pub fn sample_apk(dir: &Path, abis: &[&str]) -> PathBuf {
    let staging = dir.join("fixture-src");
    write_fixture_tree(&staging, abis);

    let apk = dir.join("app.apk");
    zip_dir(&staging, &apk).unwrap();
    fs::remove_dir_all(&staging).unwrap();
    apk
}

/// Every regular file under `root`, as sorted `/`-separated relative paths.
pub fn walk(root: &Path) -> Vec<String> {
    fn visit(root: &Path, dir: &Path, out: &mut Vec<String>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                visit(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap();
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(name);
            }
        }
    }

    let mut out = Vec::new();
    visit(root, root, &mut out);
    out.sort();
    out
}

pub fn zip_dir(root: &Path, out: &Path) -> std::io::Result<()> {
    let mut zip = ZipWriter::new(File::create(out)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for name in walk(root) {
        zip.start_file(name.as_str(), options)?;
        zip.write_all(&fs::read(root.join(&name))?)?;
    }

    zip.finish()?;
    Ok(())
}

fn unzip(apk: &Path, out: &Path) -> std::io::Result<()> {
    let mut archive = ZipArchive::new(File::open(apk)?)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        let target = out.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        fs::write(target, bytes)?;
    }

    Ok(())
}

/// Entry name → contents.
pub fn read_zip_entries(apk: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = ZipArchive::new(File::open(apk).unwrap()).unwrap();
    let mut entries = BTreeMap::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        entries.insert(entry.name().to_string(), bytes);
    }

    entries
}

/// Toolchain that treats an APK as a plain zip: decode extracts, rebuild
/// re-zips, align copies, signing does nothing.
#[derive(Debug, Default)]
pub struct FakeToolchain {
    pub fail_decode: Option<String>,
    pub fail_rebuild: Option<String>,
    pub fail_sign: Option<String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeToolchain {
    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PatchError + '_ {
    move |e| PatchError::from_io(path, e)
}

impl Toolchain for FakeToolchain {
    fn decode(&self, apk: &Path, out_dir: &Path, _decode_resources: bool) -> Result<ToolOutput> {
        self.record("decode");
        if let Some(msg) = &self.fail_decode {
            return Err(PatchError::Decode(msg.clone()));
        }

        fs::create_dir_all(out_dir).map_err(io_err(out_dir))?;
        unzip(apk, out_dir).map_err(io_err(apk))?;
        Ok(ToolOutput::default())
    }

    fn rebuild(&self, tree: &Path, out_apk: &Path, _use_aapt2: bool) -> Result<ToolOutput> {
        self.record("rebuild");
        if let Some(msg) = &self.fail_rebuild {
            return Err(PatchError::Rebuild(msg.clone()));
        }

        zip_dir(tree, out_apk).map_err(io_err(out_apk))?;
        Ok(ToolOutput::default())
    }

    fn align(&self, input: &Path, output: &Path) -> Result<ToolOutput> {
        self.record("align");
        fs::copy(input, output).map_err(io_err(output))?;
        Ok(ToolOutput::default())
    }

    fn generate_keystore(&self, keystore: &KeystoreConfig) -> Result<ToolOutput> {
        self.record("keystore");
        fs::write(&keystore.path, b"fake keystore").map_err(io_err(&keystore.path))?;
        Ok(ToolOutput::default())
    }

    fn sign(&self, _apk: &Path, _keystore: &KeystoreConfig) -> Result<ToolOutput> {
        self.record("sign");
        if let Some(msg) = &self.fail_sign {
            return Err(PatchError::Signing(msg.clone()));
        }

        Ok(ToolOutput::default())
    }
}

/// Gadget source serving an xz-compressed ELF stub and counting fetches.
#[derive(Debug, Default)]
pub struct FakeSource {
    pub fetches: AtomicUsize,
    pub delay: Option<Duration>,
    /// Remaining fetches that fail with a network error
    pub fail_first: AtomicUsize,
    pub missing: bool,
    /// Uncompressed payload, ELF stub when unset
    pub payload: Option<Vec<u8>>,
}

impl FakeSource {
    pub const LATEST: &'static str = "16.1.4";

    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: AtomicUsize::new(n),
            ..Self::default()
        }
    }
}

impl GadgetSource for FakeSource {
    async fn latest_version(&self) -> Result<String> {
        Ok(Self::LATEST.to_string())
    }

    async fn fetch(&self, version: &str, architecture: Architecture) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.missing {
            return Err(PatchError::NotFound {
                version: version.to_string(),
                architecture,
            });
        }

        let failing = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PatchError::Network("connection reset by peer".to_string()));
        }

        let payload = self.payload.clone().unwrap_or_else(elf_bytes);
        Ok(xz_compress(&payload))
    }
}

/// Device bridge with a canned answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedDevice(pub Option<Architecture>);

impl DeviceBridge for FixedDevice {
    fn device_architecture(&self) -> anyhow::Result<Option<Architecture>> {
        Ok(self.0)
    }
}
