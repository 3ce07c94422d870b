//! Gradle project skeleton generation.
//!
//! Turns validated [`ProjectSources`] into the directory tree the Android
//! Gradle Plugin expects. The three supplied blobs are written verbatim; the
//! rest comes from the templates under `src/templates/`.

use crate::manifest;
use crate::request::ProjectSources;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const COMPILE_SDK: u32 = 33;
pub const MIN_SDK: u32 = 21;
pub const TARGET_SDK: u32 = 33;

const ROOT_BUILD_GRADLE: &str = include_str!("templates/root_build.gradle");
const APP_BUILD_GRADLE: &str = include_str!("templates/app_build.gradle");
const SETTINGS_GRADLE: &str = include_str!("templates/settings.gradle");
const GRADLE_PROPERTIES: &str = include_str!("templates/gradle.properties");
const STRINGS_XML: &str = include_str!("templates/strings.xml");

/// 1x1 transparent PNG used for every launcher icon density.
const PLACEHOLDER_ICON_PNG: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

const ICON_DENSITIES: [&str; 5] = ["mdpi", "hdpi", "xhdpi", "xxhdpi", "xxxhdpi"];
const ICON_NAMES: [&str; 2] = ["ic_launcher.png", "ic_launcher_round.png"];

const MAIN_DIR: &str = "app/src/main";

/// A single file of the generated project, relative to the workspace root.
#[derive(Debug, Clone)]
pub struct ProjectFile {
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

impl ProjectFile {
    fn new(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// Relative path of the main activity source for a package.
pub fn main_activity_path(package: &str) -> PathBuf {
    Path::new(MAIN_DIR)
        .join("java")
        .join(manifest::package_dir(package))
        .join("MainActivity.java")
}

/// Build the full file plan for a project. Pure apart from decoding the
/// embedded icon.
pub fn project_files(sources: &ProjectSources) -> io::Result<Vec<ProjectFile>> {
    let package = manifest::package_id(&sources.manifest);
    let main = Path::new(MAIN_DIR);
    let res = main.join("res");

    let mut files = vec![
        ProjectFile::new(main.join("AndroidManifest.xml"), sources.manifest.as_bytes()),
        ProjectFile::new(main_activity_path(&package), sources.main_activity.as_bytes()),
        ProjectFile::new(res.join("layout/activity_main.xml"), sources.layout.as_bytes()),
        ProjectFile::new(
            res.join("values/strings.xml"),
            STRINGS_XML.replace("{{APP_NAME}}", &escape_string_resource(&sources.app_name)),
        ),
        ProjectFile::new("build.gradle", ROOT_BUILD_GRADLE),
        ProjectFile::new("app/build.gradle", app_build_gradle(&package)),
        ProjectFile::new("settings.gradle", SETTINGS_GRADLE),
        ProjectFile::new("gradle.properties", GRADLE_PROPERTIES),
    ];

    let icon = STANDARD
        .decode(PLACEHOLDER_ICON_PNG)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    for density in ICON_DENSITIES {
        for name in ICON_NAMES {
            files.push(ProjectFile::new(
                res.join(format!("mipmap-{density}")).join(name),
                icon.clone(),
            ));
        }
    }

    Ok(files)
}

/// Write the complete project tree under `root`.
///
/// Stops at the first failing directory or file; the caller owns cleanup of
/// whatever was written so far.
pub fn materialize(root: &Path, sources: &ProjectSources) -> io::Result<Vec<PathBuf>> {
    let files = project_files(sources)?;
    let mut written = Vec::with_capacity(files.len());

    for file in files {
        let full_path = root.join(&file.path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full_path, &file.contents)?;
        debug!(path = %file.path.display(), bytes = file.contents.len(), "Wrote project file");
        written.push(full_path);
    }

    info!(root = %root.display(), files = written.len(), "Project materialized");
    Ok(written)
}

fn app_build_gradle(package: &str) -> String {
    APP_BUILD_GRADLE
        .replace("{{PACKAGE}}", package)
        .replace("{{COMPILE_SDK}}", &COMPILE_SDK.to_string())
        .replace("{{MIN_SDK}}", &MIN_SDK.to_string())
        .replace("{{TARGET_SDK}}", &TARGET_SDK.to_string())
}

/// Escape text for use as the body of an Android `<string>` resource.
pub fn escape_string_resource(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, c) in text.chars().enumerate() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '@' | '?' if i == 0 => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
