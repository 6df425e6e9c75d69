//! Built-in validation of composed adjustments.
//!
//! After the assembler produces a composed result, the engine first runs
//! these configuration-toggled policies, then hands the same read-only
//! bundle to any validator plugins. Any refusal aborts the request.

use std::collections::HashSet;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::api::{SecurityProfileKind, ValidateContainerAdjustmentRequest};
use crate::error::{Error, Result};

/// Pod or container annotation disabling the required-plugin check.
pub const TOLERATE_MISSING_PLUGINS_ANNOTATION: &str = "tolerate-missing-plugins.nri.io";
/// Pod or container annotation listing extra required plugins,
/// comma-separated.
pub const REQUIRED_PLUGINS_ANNOTATION: &str = "required-plugins.nri.io";

const DEFAULT_VALIDATOR: &str = "default-validator";

/// Toggles for the built-in validation policies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Reject any OCI hook injected by a plugin.
    pub reject_oci_hook_adjustment: bool,
    /// Reject seccomp changes to containers with a runtime-default profile.
    pub reject_runtime_default_seccomp_adjustment: bool,
    /// Reject seccomp changes to containers with a localhost profile.
    pub reject_custom_seccomp_adjustment: bool,
    /// Reject seccomp changes to unconfined containers.
    pub reject_unconfined_seccomp_adjustment: bool,
    /// Reject any Linux namespace set or replaced by a plugin.
    pub reject_namespace_adjustment: bool,
    /// Plugins that must be connected for requests to succeed.
    pub required_plugins: Vec<String>,
}

/// Apply the built-in policies to one validation request.
pub(crate) fn validate(
    config: &ValidatorConfig,
    request: &ValidateContainerAdjustmentRequest,
) -> Result<()> {
    validate_oci_hooks(config, request)?;
    validate_seccomp_policy(config, request)?;
    validate_namespaces(config, request)?;
    validate_required_plugins(config, request)?;
    debug!(
        "validated adjustment of container {}",
        request.container.id
    );
    Ok(())
}

fn reject(reason: &str) -> Error {
    Error::ValidationRejected {
        plugin: DEFAULT_VALIDATOR.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_oci_hooks(
    config: &ValidatorConfig,
    request: &ValidateContainerAdjustmentRequest,
) -> Result<()> {
    if !config.reject_oci_hook_adjustment {
        return Ok(());
    }
    let injected = request
        .adjust
        .as_ref()
        .and_then(|a| a.hooks.as_ref())
        .map_or(false, |h| !h.is_empty());
    if injected {
        return Err(reject("OCI hook injection is not allowed"));
    }
    Ok(())
}

fn validate_seccomp_policy(
    config: &ValidatorConfig,
    request: &ValidateContainerAdjustmentRequest,
) -> Result<()> {
    let adjusted = request
        .adjust
        .as_ref()
        .and_then(|a| a.linux.as_ref())
        .and_then(|l| l.seccomp_profile.as_ref())
        .is_some();
    if !adjusted {
        return Ok(());
    }

    // A container without an explicit profile runs with the runtime default.
    let original = request
        .container
        .linux
        .as_ref()
        .and_then(|l| l.seccomp_profile.as_ref())
        .map(|p| p.kind)
        .unwrap_or_default();

    match original {
        SecurityProfileKind::RuntimeDefault if config.reject_runtime_default_seccomp_adjustment => {
            Err(reject(
                "seccomp adjustment of runtime-default profile is not allowed",
            ))
        }
        SecurityProfileKind::Localhost if config.reject_custom_seccomp_adjustment => Err(reject(
            "seccomp adjustment of custom localhost profile is not allowed",
        )),
        SecurityProfileKind::Unconfined if config.reject_unconfined_seccomp_adjustment => {
            Err(reject(
                "seccomp adjustment of unconfined container is not allowed",
            ))
        }
        _ => Ok(()),
    }
}

fn validate_namespaces(
    config: &ValidatorConfig,
    request: &ValidateContainerAdjustmentRequest,
) -> Result<()> {
    if !config.reject_namespace_adjustment {
        return Ok(());
    }
    let adjusted = request
        .adjust
        .as_ref()
        .and_then(|a| a.linux.as_ref())
        .map_or(false, |l| !l.namespaces.is_empty());
    if adjusted {
        return Err(reject("Linux namespace adjustment is not allowed"));
    }
    Ok(())
}

fn validate_required_plugins(
    config: &ValidatorConfig,
    request: &ValidateContainerAdjustmentRequest,
) -> Result<()> {
    if annotation(request, TOLERATE_MISSING_PLUGINS_ANNOTATION)
        .map_or(false, |v| v.eq_ignore_ascii_case("true"))
    {
        return Ok(());
    }

    let connected: HashSet<&str> = request.plugins.iter().map(|p| p.name.as_str()).collect();

    let mut required: Vec<&str> = config.required_plugins.iter().map(String::as_str).collect();
    for source in [
        request.container.annotations.get(REQUIRED_PLUGINS_ANNOTATION),
        request.pod.annotations.get(REQUIRED_PLUGINS_ANNOTATION),
    ]
    .into_iter()
    .flatten()
    {
        required.extend(source.split(',').map(str::trim).filter(|s| !s.is_empty()));
    }

    for name in required {
        if !connected.contains(name) {
            return Err(Error::RequiredPlugin {
                plugin: name.to_string(),
            });
        }
    }
    Ok(())
}

// Container annotations take precedence over the pod's.
fn annotation<'a>(request: &'a ValidateContainerAdjustmentRequest, key: &str) -> Option<&'a str> {
    request
        .container
        .annotations
        .get(key)
        .or_else(|| request.pod.annotations.get(key))
        .map(String::as_str)
}
