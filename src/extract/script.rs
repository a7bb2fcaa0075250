//! # Install Script Analysis
//!
//! The decompiled install script is WiX XML. Custom actions that call into a
//! binary expose `BinaryKey` (the DLL) and `DllEntry` (the exported entry
//! point). The dropper's payload DLL is the one whose entry point equals a
//! fixed signature.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AnalysisError, Result};
use crate::extract::walk_files;

/// Entry point exported by the payload DLL of this dropper family.
pub const ENTRY_POINT_SIGNATURE: &str = "VIPS0033939";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomAction {
    pub id: Option<String>,
    pub binary_key: Option<String>,
    pub dll_entry: Option<String>,
}

/// `Binary` table row: maps a binary key to the file the decompiler wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryEntry {
    pub id: String,
    pub source_file: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstallScript {
    pub custom_actions: Vec<CustomAction>,
    pub binaries: Vec<BinaryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaliciousComponent {
    pub binary_key: String,
    pub entry_point: String,
    pub action_id: Option<String>,
}

impl InstallScript {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim_start_matches('\u{feff}');
        let options = roxmltree::ParsingOptions {
            allow_dtd: true,
            ..roxmltree::ParsingOptions::default()
        };
        let doc = roxmltree::Document::parse_with_options(text, options).map_err(|err| {
            AnalysisError::Extraction(format!("install script is not well-formed: {err}"))
        })?;

        let mut script = InstallScript::default();
        for node in doc.descendants().filter(|n| n.is_element()) {
            match node.tag_name().name() {
                "CustomAction" => script.custom_actions.push(CustomAction {
                    id: node.attribute("Id").map(str::to_string),
                    binary_key: node.attribute("BinaryKey").map(str::to_string),
                    dll_entry: node.attribute("DllEntry").map(str::to_string),
                }),
                "Binary" => {
                    if let Some(id) = node.attribute("Id") {
                        script.binaries.push(BinaryEntry {
                            id: id.to_string(),
                            source_file: node.attribute("SourceFile").map(str::to_string),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(script)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::parse(&decode_script_text(&bytes))
    }

    /// Locate the file backing `binary_key` under the decompiler output.
    ///
    /// Tries `Binary/<key>`, then the file name of the `Binary` row's
    /// `SourceFile`, then any file named after the key. Keys that are not a
    /// bare file name (separators, `..`, roots) never resolve.
    pub fn resolve_binary(&self, extract_dir: &Path, binary_key: &str) -> Option<PathBuf> {
        let Some(key) = bare_file_name(binary_key) else {
            warn!("ignoring binary key that is not a plain file name: {binary_key}");
            return None;
        };
        let direct = extract_dir.join("Binary").join(key);
        if direct.is_file() {
            return Some(direct);
        }

        let mut wanted = vec![key];
        if let Some(source) = self
            .binaries
            .iter()
            .find(|b| b.id == binary_key)
            .and_then(|b| b.source_file.as_deref())
        {
            let last = source.rsplit(['/', '\\']).next().unwrap_or(source);
            if let Some(name) = bare_file_name(last) {
                wanted.insert(0, name);
            }
        }

        let files = walk_files(extract_dir);
        wanted.iter().find_map(|name| {
            files
                .iter()
                .find(|path| {
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.eq_ignore_ascii_case(name))
                })
                .cloned()
        })
    }
}

/// `name` when it is a single normal path component on every platform.
fn bare_file_name(name: &str) -> Option<&str> {
    if name.is_empty() || name.contains(['/', '\\', ':', '\0']) {
        return None;
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(name),
        _ => None,
    }
}

/// Install scripts are usually UTF-8; some decompiler builds emit UTF-16LE
/// with a BOM.
fn decode_script_text(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFFu8, 0xFE][..]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    String::from_utf8_lossy(bytes).to_string()
}

/// Selects the payload-bearing custom action.
#[derive(Debug, Clone)]
pub struct ComponentSelector {
    signature: String,
    excluded: Vec<String>,
}

impl ComponentSelector {
    pub fn new(signature: impl Into<String>, excluded: &[String]) -> Self {
        Self {
            signature: signature.into(),
            excluded: excluded.iter().map(|e| e.to_ascii_lowercase()).collect(),
        }
    }

    fn is_excluded(&self, binary_key: &str) -> bool {
        let lowered = binary_key.to_ascii_lowercase();
        self.excluded.iter().any(|e| *e == lowered)
    }

    /// First custom action in document order whose entry point equals the
    /// signature and whose binary is not excluded. Actions missing either
    /// attribute never match.
    pub fn select(&self, actions: &[CustomAction]) -> Option<MaliciousComponent> {
        let mut matches = actions.iter().filter_map(|action| {
            let key = action.binary_key.as_deref()?;
            let entry = action.dll_entry.as_deref()?;
            if entry != self.signature {
                return None;
            }
            if self.is_excluded(key) {
                debug!("excluded component {key} with matching entry point");
                return None;
            }
            Some(MaliciousComponent {
                binary_key: key.to_string(),
                entry_point: entry.to_string(),
                action_id: action.id.clone(),
            })
        });
        let selected = matches.next()?;
        let extra = matches.count();
        if extra > 0 {
            info!(
                "{extra} further matching components ignored; selected {}",
                selected.binary_key
            );
        }
        Some(selected)
    }

    pub fn find(&self, script_path: &Path) -> Result<Option<MaliciousComponent>> {
        let script = InstallScript::from_file(script_path)?;
        Ok(self.select(&script.custom_actions))
    }
}

/// Parse the install script at `script_path` and select the malicious
/// component using the known entry-point signature.
pub fn find_malicious_component(
    script_path: &Path,
    exclude_list: &[String],
) -> Result<Option<MaliciousComponent>> {
    ComponentSelector::new(ENTRY_POINT_SIGNATURE, exclude_list).find(script_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Wix xmlns="http://schemas.microsoft.com/wix/2006/wi">
  <Product Id="*" Name="Updater">
    <Binary Id="a.dll" SourceFile="SourceDir\Binary\a.dll" />
    <CustomAction Id="First" BinaryKey="a.dll" DllEntry="X" />
    <CustomAction Id="SetProp" Property="P" Value="1" />
    <CustomAction Id="Second" BinaryKey="b.dll" DllEntry="VIPS0033939" />
    <CustomAction Id="Third" BinaryKey="c.dll" DllEntry="VIPS0033939" />
  </Product>
</Wix>"#;

    fn write_script(dir: &Path) -> PathBuf {
        let path = dir.join("installer_script.wxs");
        std::fs::write(&path, SCRIPT).expect("write script");
        path
    }

    #[test]
    fn selects_first_match_in_document_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_script(dir.path());
        let component = find_malicious_component(&path, &[])
            .expect("parse")
            .expect("component");
        assert_eq!(component.binary_key, "b.dll");
        assert_eq!(component.action_id.as_deref(), Some("Second"));
    }

    #[test]
    fn honours_exclusion_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_script(dir.path());
        let component = find_malicious_component(&path, &["B.DLL".to_string()])
            .expect("parse")
            .expect("component");
        assert_eq!(component.binary_key, "c.dll");
    }

    #[test]
    fn no_match_returns_none() {
        let script = InstallScript::parse(
            r#"<Wix><CustomAction Id="A" BinaryKey="x.dll" DllEntry="Other" /><CustomAction Id="B" DllEntry="VIPS0033939" /></Wix>"#,
        )
        .expect("parse");
        let selector = ComponentSelector::new(ENTRY_POINT_SIGNATURE, &[]);
        assert!(selector.select(&script.custom_actions).is_none());
    }

    #[test]
    fn malformed_script_is_extraction_error() {
        let err = InstallScript::parse("<Wix><CustomAction").unwrap_err();
        assert!(matches!(err, AnalysisError::Extraction(_)));
    }

    #[test]
    fn decodes_utf16_scripts() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "<Wix><CustomAction BinaryKey=\"z.dll\" DllEntry=\"VIPS0033939\"/></Wix>".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("s.wxs");
        std::fs::write(&path, bytes).expect("write");
        let component = find_malicious_component(&path, &[])
            .expect("parse")
            .expect("component");
        assert_eq!(component.binary_key, "z.dll");
    }

    #[test]
    fn resolves_binary_through_source_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("Binary")).expect("dirs");
        std::fs::write(dir.path().join("Binary/b.dll"), b"MZ").expect("write");
        std::fs::write(dir.path().join("renamed.bin"), b"MZ").expect("write");

        let script = InstallScript::parse(
            r#"<Wix><Binary Id="key1" SourceFile="SourceDir\renamed.bin"/></Wix>"#,
        )
        .expect("parse");
        assert!(script
            .resolve_binary(dir.path(), "b.dll")
            .expect("direct")
            .ends_with("Binary/b.dll"));
        assert!(script
            .resolve_binary(dir.path(), "key1")
            .expect("source file")
            .ends_with("renamed.bin"));
        assert!(script.resolve_binary(dir.path(), "missing.dll").is_none());
    }

    #[test]
    fn binary_keys_cannot_leave_extract_dir() {
        let root = tempfile::tempdir().expect("tempdir");
        let extract_dir = root.path().join("work/installer");
        std::fs::create_dir_all(extract_dir.join("Binary")).expect("dirs");
        let outside = root.path().join("host_secret.txt");
        std::fs::write(&outside, b"secret").expect("write");

        let script = InstallScript::parse(&format!(
            r#"<Wix><Binary Id="evil" SourceFile="{}"/></Wix>"#,
            outside.display()
        ))
        .expect("parse");
        let absolute = outside.display().to_string();
        for key in [
            absolute.as_str(),
            "../../../host_secret.txt",
            "..\\..\\host_secret.txt",
            "..",
            "Binary/../../../host_secret.txt",
        ] {
            assert!(
                script.resolve_binary(&extract_dir, key).is_none(),
                "{key} resolved"
            );
        }
        // The SourceFile basename is only searched for inside the extract dir.
        assert!(script.resolve_binary(&extract_dir, "evil").is_none());
    }
}
