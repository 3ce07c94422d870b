//! Compile request payload and presence validation.

use serde::Deserialize;

/// Application name used when the request leaves `appName` unset or blank.
pub const DEFAULT_APP_NAME: &str = "MyApp";

/// Body of `POST /compile-apk`.
///
/// Every field is optional at the type level so that a missing source file
/// surfaces as [`MissingFiles`] instead of a generic deserialization error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub manifest: Option<String>,
    pub main_activity: Option<String>,
    pub layout: Option<String>,
    pub app_name: Option<String>,
}

/// Validated inputs for the workspace materializer.
#[derive(Debug, Clone)]
pub struct ProjectSources {
    pub manifest: String,
    pub main_activity: String,
    pub layout: String,
    pub app_name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Missing required files: manifest, mainActivity, or layout")]
pub struct MissingFiles;

impl CompileRequest {
    /// Check that all three source blobs are present and apply defaults.
    pub fn validate(self) -> Result<ProjectSources, MissingFiles> {
        let manifest = non_blank(self.manifest).ok_or(MissingFiles)?;
        let main_activity = non_blank(self.main_activity).ok_or(MissingFiles)?;
        let layout = non_blank(self.layout).ok_or(MissingFiles)?;
        let app_name = non_blank(self.app_name)
            .map(|name| name.trim().to_string())
            .unwrap_or_else(|| DEFAULT_APP_NAME.to_string());

        Ok(ProjectSources {
            manifest,
            main_activity,
            layout,
            app_name,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}
