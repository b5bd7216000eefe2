//! Add-on manifests
//!
//! Two formats are read: `manifest.json` and the legacy `package.json`.
//! Both are first checked against a template of required fields, so a
//! missing or mistyped field is reported by its dotted path before any value
//! is used.

use std::path::Path;

use semver::Version;
use serde::Serialize;
use serde_json::{Map, Value, json};

use super::checksum::{self, ChecksumError, SUMS_FILE};

pub const MANIFEST_VERSION: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("No manifest found for add-on {package}")]
    NoManifest { package: String },

    #[error("Failed to read {file} for add-on {package}: {source}")]
    Read {
        package: String,
        file: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {file} for add-on {package}: {source}")]
    Parse {
        package: String,
        file: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Error found in manifest for add-on {package}: {reason}")]
    Invalid { package: String, reason: String },

    #[error("Manifest version {found} for add-on {package} does not match expected version {expected}", expected = MANIFEST_VERSION)]
    ManifestVersion { package: String, found: Value },

    #[error("ID from manifest \"{found}\" doesn't match the ID of add-on \"{package}\"")]
    IdMismatch { package: String, found: String },

    #[error("File {file} missing for add-on {package}")]
    MissingFile { package: String, file: String },

    #[error("SHA256SUMS file missing for add-on {package}")]
    MissingSums { package: String },

    #[error("Checksum verification failed for add-on {package}: {source}")]
    Checksum {
        package: String,
        #[source]
        source: ChecksumError,
    },

    #[error("Add-on {package} supports API versions {min}-{max}, hub provides {api}")]
    ApiMismatch {
        package: String,
        min: u64,
        max: u64,
        api: u64,
    },

    #[error("Gateway version {gateway} is lower than minimum version {min} supported by add-on {package}")]
    VersionTooLow {
        package: String,
        gateway: Version,
        min: Version,
    },

    #[error("Gateway version {gateway} is higher than maximum version {max} supported by add-on {package}")]
    VersionTooHigh {
        package: String,
        gateway: Version,
        max: Version,
    },

    #[error("Unable to compare with non-semver version {0}")]
    BadVersion(String),
}

/// Hub facts a manifest is checked against
#[derive(Debug, Clone)]
pub struct ManifestContext<'a> {
    pub gateway_version: &'a str,
    pub api_version: u64,
    pub require_checksums: bool,
}

/// What the hub keeps from a validated manifest
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage_url: Option<String>,
    pub version: String,
    pub primary_type: String,
    pub exec: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl AddonRecord {
    /// Whether loading this add-on launches a process
    pub fn has_process(&self) -> bool {
        !self.exec.is_empty()
    }
}

/// A validated manifest plus the add-on's default config
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedManifest {
    pub record: AddonRecord,
    pub default_config: Value,
}

/// Read and validate the manifest of the add-on installed in `dir`
pub fn load_manifest(
    dir: &Path,
    package: &str,
    ctx: &ManifestContext<'_>,
) -> Result<LoadedManifest, ManifestError> {
    if dir.join("manifest.json").is_file() {
        let manifest = read_json(dir, package, "manifest.json")?;
        load_manifest_json(dir, package, &manifest, ctx)
    } else if dir.join("package.json").is_file() {
        let manifest = read_json(dir, package, "package.json")?;
        load_package_json(dir, package, &manifest, ctx)
    } else {
        Err(ManifestError::NoManifest {
            package: package.to_string(),
        })
    }
}

fn read_json(dir: &Path, package: &str, file: &'static str) -> Result<Value, ManifestError> {
    let text = std::fs::read_to_string(dir.join(file)).map_err(|source| ManifestError::Read {
        package: package.to_string(),
        file,
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ManifestError::Parse {
        package: package.to_string(),
        file,
        source,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Template validation
// ─────────────────────────────────────────────────────────────────────────────

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check `obj` against `template` one level at a time.
///
/// Every template key must exist with the same JSON type. Objects recurse;
/// a non-empty template array fixes the type of every element.
pub fn validate_object(prefix: &str, obj: &Map<String, Value>, template: &Map<String, Value>) -> Option<String> {
    for (key, expected) in template {
        let path = format!("{}{}", prefix, key);
        let Some(actual) = obj.get(key) else {
            return Some(format!("Manifest is missing: {}", path));
        };
        if type_name(actual) != type_name(expected) {
            return Some(format!(
                "Expecting {} to have type: {}, found: {}",
                path,
                type_name(expected),
                type_name(actual)
            ));
        }
        match (actual, expected) {
            (Value::Array(values), Value::Array(template_values)) => {
                if let Some(first) = template_values.first() {
                    let element = type_name(first);
                    if values.iter().any(|v| type_name(v) != element) {
                        return Some(format!(
                            "Expecting all values in {} to be of type {}",
                            path, element
                        ));
                    }
                }
            }
            (Value::Object(inner), Value::Object(inner_template)) => {
                if let Some(err) = validate_object(&format!("{}.", path), inner, inner_template) {
                    return Some(err);
                }
            }
            _ => {}
        }
    }
    None
}

fn invalid(package: &str, reason: impl Into<String>) -> ManifestError {
    ManifestError::Invalid {
        package: package.to_string(),
        reason: reason.into(),
    }
}

fn as_object<'a>(package: &str, value: &'a Value) -> Result<&'a Map<String, Value>, ManifestError> {
    value
        .as_object()
        .ok_or_else(|| invalid(package, "manifest is not a JSON object"))
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn string_at(value: &Value, pointer: &str) -> String {
    str_at(value, pointer).unwrap_or_default().to_string()
}

fn require_template(package: &str, manifest: &Value, template: &Value) -> Result<(), ManifestError> {
    let obj = as_object(package, manifest)?;
    let Value::Object(template) = template else {
        return Ok(());
    };
    match validate_object("", obj, template) {
        Some(reason) => Err(invalid(package, reason)),
        None => Ok(()),
    }
}

fn has_git_checkout(dir: &Path) -> bool {
    dir.join(".git").exists()
}

// ─────────────────────────────────────────────────────────────────────────────
// manifest.json
// ─────────────────────────────────────────────────────────────────────────────

fn manifest_json_template(primary_type: Option<&str>) -> Value {
    let mut template = json!({
        "author": "",
        "description": "",
        "gateway_specific_settings": {
            "webthings": {
                "primary_type": "",
            },
        },
        "homepage_url": "",
        "id": "",
        "license": "",
        "manifest_version": 0,
        "name": "",
        "version": "",
    });
    // Extensions run inside the hub and have nothing to exec.
    if primary_type != Some("extension") {
        if let Some(webthings) = template.pointer_mut("/gateway_specific_settings/webthings") {
            webthings["exec"] = json!("");
        }
    }
    template
}

fn load_manifest_json(
    dir: &Path,
    package: &str,
    manifest: &Value,
    ctx: &ManifestContext<'_>,
) -> Result<LoadedManifest, ManifestError> {
    let primary_type = str_at(manifest, "/gateway_specific_settings/webthings/primary_type");
    require_template(package, manifest, &manifest_json_template(primary_type))?;

    if manifest["manifest_version"].as_u64() != Some(MANIFEST_VERSION) {
        return Err(ManifestError::ManifestVersion {
            package: package.to_string(),
            found: manifest["manifest_version"].clone(),
        });
    }

    let id = string_at(manifest, "/id");
    if id != package {
        return Err(ManifestError::IdMismatch {
            package: package.to_string(),
            found: id,
        });
    }

    if !has_git_checkout(dir) {
        if dir.join(SUMS_FILE).is_file() {
            checksum::verify_tree(dir).map_err(|source| ManifestError::Checksum {
                package: package.to_string(),
                source,
            })?;
        } else if ctx.require_checksums {
            return Err(ManifestError::MissingSums {
                package: package.to_string(),
            });
        }
    }

    let webthings = &manifest["gateway_specific_settings"]["webthings"];
    check_gateway_version(package, ctx.gateway_version, webthings)?;

    let record = AddonRecord {
        id,
        name: string_at(manifest, "/name"),
        description: string_at(manifest, "/description"),
        author: str_at(manifest, "/author").map(str::to_string),
        homepage_url: str_at(manifest, "/homepage_url").map(str::to_string),
        version: string_at(manifest, "/version"),
        primary_type: string_at(webthings, "/primary_type"),
        exec: string_at(webthings, "/exec"),
        enabled: webthings["enabled"].as_bool().unwrap_or(false),
        schema: manifest.pointer("/options/schema").cloned(),
    };
    let default_config = manifest
        .pointer("/options/default")
        .cloned()
        .unwrap_or_else(|| json!({}));

    Ok(LoadedManifest {
        record,
        default_config,
    })
}

/// Loose semver parse: `1.2` becomes `1.2.0`, a leading `v` is skipped
pub fn coerce_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let mut parts = raw[start..]
        .split('.')
        .take(3)
        .map_while(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u64>().ok()
        });
    let major = parts.next()?;
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

fn check_gateway_version(package: &str, gateway: &str, webthings: &Value) -> Result<(), ManifestError> {
    let bound = |key: &str| {
        webthings[key]
            .as_str()
            .filter(|v| *v != "*")
            .map(|v| coerce_version(v).ok_or_else(|| ManifestError::BadVersion(v.to_string())))
            .transpose()
    };
    let min = bound("strict_min_version")?;
    let max = bound("strict_max_version")?;
    if min.is_none() && max.is_none() {
        return Ok(());
    }

    let gateway = coerce_version(gateway).ok_or_else(|| ManifestError::BadVersion(gateway.to_string()))?;
    if let Some(min) = min {
        if gateway < min {
            return Err(ManifestError::VersionTooLow {
                package: package.to_string(),
                gateway,
                min,
            });
        }
    }
    if let Some(max) = max {
        if gateway > max {
            return Err(ManifestError::VersionTooHigh {
                package: package.to_string(),
                gateway,
                max,
            });
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// package.json (legacy)
// ─────────────────────────────────────────────────────────────────────────────

fn package_json_template() -> Value {
    json!({
        "name": "",
        "display_name": "",
        "description": "",
        "version": "",
        "files": [""],
        "moziot": {
            "api": {
                "min": 0,
                "max": 0,
            },
            "exec": "",
        },
    })
}

fn load_package_json(
    dir: &Path,
    package: &str,
    manifest: &Value,
    ctx: &ManifestContext<'_>,
) -> Result<LoadedManifest, ManifestError> {
    require_template(package, manifest, &package_json_template())?;

    let name = string_at(manifest, "/name");
    if name != package {
        return Err(ManifestError::IdMismatch {
            package: package.to_string(),
            found: name,
        });
    }

    let files: Vec<&str> = manifest["files"]
        .as_array()
        .map(|files| files.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if files.is_empty() {
        return Err(invalid(package, "files array cannot be empty"));
    }
    for file in &files {
        if !dir.join(file).exists() {
            return Err(ManifestError::MissingFile {
                package: package.to_string(),
                file: file.to_string(),
            });
        }
    }

    if files.contains(&SUMS_FILE) && !has_git_checkout(dir) {
        checksum::verify_listed(dir).map_err(|source| ManifestError::Checksum {
            package: package.to_string(),
            source,
        })?;
    }

    let moziot = &manifest["moziot"];
    let min = moziot["api"]["min"].as_u64().unwrap_or(0);
    let max = moziot["api"]["max"].as_u64().unwrap_or(0);
    if ctx.api_version < min || ctx.api_version > max {
        return Err(ManifestError::ApiMismatch {
            package: package.to_string(),
            min,
            max,
            api: ctx.api_version,
        });
    }

    let record = AddonRecord {
        id: name,
        name: string_at(manifest, "/display_name"),
        description: string_at(manifest, "/description"),
        author: str_at(manifest, "/author").map(str::to_string),
        homepage_url: str_at(manifest, "/homepage").map(str::to_string),
        version: string_at(manifest, "/version"),
        primary_type: str_at(moziot, "/type").unwrap_or("adapter").to_string(),
        exec: string_at(moziot, "/exec"),
        enabled: moziot["enabled"].as_bool().unwrap_or(false),
        schema: moziot.get("schema").cloned(),
    };
    let default_config = moziot.get("config").cloned().unwrap_or_else(|| json!({}));

    Ok(LoadedManifest {
        record,
        default_config,
    })
}
