//! Package identifier extraction from `AndroidManifest.xml`.

use std::path::PathBuf;
use tracing::warn;
use xml::reader::{EventReader, XmlEvent};

/// Identifier used when the manifest carries no usable `package` attribute.
pub const DEFAULT_PACKAGE: &str = "com.example.app";

/// Read the `package` attribute of the root `<manifest>` element.
///
/// Anything that cannot serve as a package directory (no attribute, blank
/// value, unparsable document, segments that would escape the source root)
/// yields [`DEFAULT_PACKAGE`].
pub fn package_id(manifest: &str) -> String {
    match root_package_attribute(manifest) {
        Ok(Some(package)) if is_path_safe(&package) => package,
        Ok(Some(package)) => {
            warn!(package = %package, "Manifest package is not usable as a path, using default");
            DEFAULT_PACKAGE.to_string()
        }
        Ok(None) => DEFAULT_PACKAGE.to_string(),
        Err(e) => {
            warn!(error = %e, "Could not parse manifest, using default package");
            DEFAULT_PACKAGE.to_string()
        }
    }
}

/// Turn `com.example.foo` into `com/example/foo`.
pub fn package_dir(package: &str) -> PathBuf {
    package.split('.').collect()
}

fn root_package_attribute(manifest: &str) -> Result<Option<String>, xml::reader::Error> {
    for event in EventReader::from_str(manifest) {
        if let XmlEvent::StartElement {
            name, attributes, ..
        } = event?
        {
            if name.local_name != "manifest" {
                return Ok(None);
            }
            let package = attributes
                .into_iter()
                .find(|attr| attr.name.prefix.is_none() && attr.name.local_name == "package")
                .map(|attr| attr.value.trim().to_string())
                .filter(|value| !value.is_empty());
            return Ok(package);
        }
    }
    Ok(None)
}

fn is_path_safe(package: &str) -> bool {
    package
        .split('.')
        .all(|segment| !segment.is_empty() && !segment.contains(['/', '\\', '\0']))
}
