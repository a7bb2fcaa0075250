//! Shared fixtures for the integration tests.
//!
//! Samples are built in memory with the zip writer, the installer
//! decompiler is a generated shell script, and the network is a stub
//! fetcher.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use zip::write::SimpleFileOptions;

use droptrace::config::{self, Config};
use droptrace::error::{AnalysisError, Result};
use droptrace::payload::PayloadFetcher;

pub const CNC_URL: &str = "http://10.20.30.40:5050/index.php";
pub const ISO_URL: &str = "http://cdn.example.net/files/update.iso";

pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        writer.start_file(*name, options).expect("start file");
        writer.write_all(data).expect("write entry");
    }
    writer.finish().expect("finish").into_inner()
}

/// Sample archive holding one installer package.
pub fn write_sample(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(
        &path,
        build_zip(&[("setup/Installer.msi", b"\xD0\xCF\x11\xE0fake msi"), ("readme.txt", b"hi")]),
    )
    .expect("write sample");
    path
}

/// Sample archive without an installer package.
pub fn write_sample_without_installer(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, build_zip(&[("readme.txt", b"nothing to see")])).expect("write sample");
    path
}

pub fn config_in(dir: &Path, decompiler: &Path) -> Config {
    let mut cfg = config::load_config(None)
        .expect("config")
        .config
        .rooted_at(dir);
    cfg.decompiler.path = decompiler.to_path_buf();
    cfg.ensure_directories().expect("dirs");
    cfg
}

/// Octal-escaped bytes for `printf` in the generated script.
fn printf_escape(data: &[u8]) -> String {
    data.iter().map(|b| format!("\\{:03o}", b)).collect()
}

/// Shell script standing in for the installer decompiler. It writes an
/// install script naming `b.dll` with the known entry point, and a
/// `Binary/b.dll` whose strings carry `urls`.
#[cfg(unix)]
pub fn fake_decompiler(dir: &Path, urls: &[&str], exit_code: i32) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let mut dll = b"MZ\x90\x00\x03\x00\x00\x00".to_vec();
    for url in urls {
        dll.extend_from_slice(url.as_bytes());
        dll.extend_from_slice(b"\x00\x00");
    }
    for ch in "wide marker".encode_utf16() {
        dll.extend_from_slice(&ch.to_le_bytes());
    }

    let script = format!(
        r#"#!/bin/sh
mkdir -p "$3/Binary"
printf '{benign}' > "$3/Binary/a.dll"
printf '{dll}' > "$3/Binary/b.dll"
cat > "$5" <<'EOF'
<?xml version="1.0" encoding="utf-8"?>
<Wix xmlns="http://schemas.microsoft.com/wix/2006/wi">
  <Product Id="*" Name="Updater">
    <Binary Id="a.dll" SourceFile="SourceDir\Binary\a.dll" />
    <Binary Id="b.dll" SourceFile="SourceDir\Binary\b.dll" />
    <CustomAction Id="Helper" BinaryKey="aicustact.dll" DllEntry="VIPS0033939" />
    <CustomAction Id="Benign" BinaryKey="a.dll" DllEntry="Setup" />
    <CustomAction Id="Payload" BinaryKey="b.dll" DllEntry="VIPS0033939" />
  </Product>
</Wix>
EOF
echo "decompiled $1"
exit {exit_code}
"#,
        benign = printf_escape(b"MZ benign helper"),
        dll = printf_escape(&dll),
    );

    let path = dir.join("fake_dark.sh");
    std::fs::write(&path, script).expect("write tool");
    let mut perms = std::fs::metadata(&path).expect("meta").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

/// Disguised ISO body: base64(base64(zip holding `loader.exe`)).
pub fn disguised_iso(exe: &[u8]) -> Vec<u8> {
    let zip = build_zip(&[("loader.exe", exe), ("notes.txt", b"x")]);
    STANDARD.encode(STANDARD.encode(zip)).into_bytes()
}

pub struct StubFetcher {
    body: Vec<u8>,
    pub calls: AtomicUsize,
}

impl StubFetcher {
    pub fn serving(body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            body,
            calls: AtomicUsize::new(0),
        })
    }
}

impl PayloadFetcher for StubFetcher {
    fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.body.clone())
    }
}

pub struct OfflineFetcher;

impl PayloadFetcher for OfflineFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        Err(AnalysisError::Network(format!("connection failed for {url}")))
    }
}
