//! Turns raw options into a validated [`Plan`]

use super::options::{RawBootstrap, RawInstall, RawOptions};
use super::plan::{
    BootstrapCredentials, HostPort, InstallMode, InstallSpec, Plan, Role, DEFAULT_DROPIN_PATH,
    DEFAULT_KUBEADM_PATH, DEFAULT_SERVICE_PATH, DEFAULT_SYSCONFIG_PATH,
};
use crate::error::{ProvisionError, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Resolve raw options into a plan.
///
/// Every violation is collected; the error lists all of them.
pub fn resolve(raw: &RawOptions) -> Result<Plan> {
    let mut errors = Vec::new();

    let requested_role = match raw.role.trim().to_ascii_lowercase().as_str() {
        "" => None,
        "master" => Some(Role::Master),
        "worker" => Some(Role::Worker),
        other => {
            errors.push(format!(
                "role: expected 'master' or 'worker', got '{}'",
                other
            ));
            None
        }
    };

    let join_target = match raw.join.trim() {
        "" => None,
        join => match HostPort::parse(join) {
            Ok(hp) => Some(hp),
            Err(e) => {
                errors.push(format!("join: {}", e));
                None
            }
        },
    };
    let wants_join = !raw.join.trim().is_empty();

    let listen = match raw.listen.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(listen) => match HostPort::parse(listen) {
            Ok(hp) => Some(hp),
            Err(e) => {
                errors.push(format!("listen: {}", e));
                None
            }
        },
    };

    if raw.drain && wants_join {
        errors.push("drain and join are mutually exclusive".to_string());
    }
    if wants_join && raw.role.trim().is_empty() {
        errors.push("role: must be 'master' or 'worker' when join is set".to_string());
    }

    let role = match (wants_join, requested_role) {
        (false, _) => Role::Seeder,
        (true, Some(role)) => role,
        // already reported
        (true, None) => Role::Worker,
    };

    let node_name = match raw.nodename.trim() {
        "" => None,
        name => {
            if let Err(e) = validate_node_name(name) {
                errors.push(format!("nodename: {}", e));
            }
            Some(name.to_string())
        }
    };

    let mut ignored_checks = BTreeSet::new();
    for check in &raw.ignore_checks {
        let check = check.trim();
        if check.is_empty() {
            errors.push("ignore_checks: empty check name".to_string());
        } else {
            ignored_checks.insert(check.to_string());
        }
    }

    let mut manifests = Vec::with_capacity(raw.manifests.len());
    for (index, manifest) in raw.manifests.iter().enumerate() {
        let manifest = manifest.trim();
        if manifest.is_empty() {
            errors.push(format!("manifests[{}]: empty path", index));
        } else {
            manifests.push(manifest.to_string());
        }
    }

    let install = raw
        .install
        .as_ref()
        .and_then(|install| resolve_install(install, &mut errors));

    let bootstrap = resolve_bootstrap(&raw.config, &mut errors);
    if wants_join && !raw.drain && bootstrap.token.is_none() {
        errors.push("config.token: required to join a cluster".to_string());
    }

    if !errors.is_empty() {
        return Err(ProvisionError::Config(errors));
    }

    Ok(Plan {
        role,
        join_target,
        drain: raw.drain,
        ignored_checks,
        node_name,
        listen,
        prevent_sudo: raw.prevent_sudo,
        manifests,
        install,
        bootstrap,
    })
}

fn resolve_install(raw: &RawInstall, errors: &mut Vec<String>) -> Option<InstallSpec> {
    let script = raw.script.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let inline = raw.inline.as_deref().filter(|s| !s.trim().is_empty());

    let mut modes = Vec::new();
    if raw.auto {
        modes.push(InstallMode::Auto);
    }
    if let Some(script) = script {
        modes.push(InstallMode::Script(PathBuf::from(script)));
    }
    if let Some(inline) = inline {
        modes.push(InstallMode::Inline(inline.to_string()));
    }

    let mode = match modes.len() {
        1 => modes.pop(),
        0 => {
            errors.push("install: one of 'auto', 'script' or 'inline' must be set".to_string());
            None
        }
        _ => {
            errors.push(
                "install: 'auto', 'script' and 'inline' are mutually exclusive".to_string(),
            );
            None
        }
    };

    let sysconfig_path = absolute_or_default(
        "install.sysconfig_path",
        raw.sysconfig_path.as_deref(),
        DEFAULT_SYSCONFIG_PATH,
        errors,
    );
    let service_path = absolute_or_default(
        "install.service_path",
        raw.service_path.as_deref(),
        DEFAULT_SERVICE_PATH,
        errors,
    );
    let dropin_path = absolute_or_default(
        "install.dropin_path",
        raw.dropin_path.as_deref(),
        DEFAULT_DROPIN_PATH,
        errors,
    );

    let kubeadm_path = match raw.kubeadm_path.as_deref().map(str::trim) {
        None | Some("") => DEFAULT_KUBEADM_PATH.to_string(),
        Some(path) if path.starts_with('/') || !path.contains('/') => path.to_string(),
        Some(path) => {
            errors.push(format!(
                "install.kubeadm_path: '{}' must be absolute or a bare command name",
                path
            ));
            path.to_string()
        }
    };

    let version = raw
        .version
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    Some(InstallSpec {
        mode: mode?,
        version,
        sysconfig_path,
        service_path,
        dropin_path,
        kubeadm_path,
    })
}

fn absolute_or_default(
    field: &str,
    value: Option<&str>,
    default: &str,
    errors: &mut Vec<String>,
) -> String {
    match value.map(str::trim) {
        None | Some("") => default.to_string(),
        Some(path) => {
            if !path.starts_with('/') {
                errors.push(format!("{}: '{}' is not an absolute path", field, path));
            }
            path.to_string()
        }
    }
}

fn resolve_bootstrap(raw: &RawBootstrap, errors: &mut Vec<String>) -> BootstrapCredentials {
    let non_empty = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let token = non_empty(&raw.token);
    if let Some(token) = &token {
        if !is_bootstrap_token(token) {
            errors.push(
                "config.token: expected the form [a-z0-9]{6}.[a-z0-9]{16}".to_string(),
            );
        }
    }

    let discovery_hash = non_empty(&raw.discovery_hash);
    if let Some(hash) = &discovery_hash {
        if !is_discovery_hash(hash) {
            errors.push("config.discovery_hash: expected sha256:<64 hex digits>".to_string());
        }
    }

    BootstrapCredentials {
        token,
        discovery_hash,
        certificate_key: non_empty(&raw.certificate_key),
    }
}

fn bootstrap_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]{6}\.[a-z0-9]{16}$").expect("bootstrap token pattern"))
}

fn discovery_hash_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^sha256:[0-9a-fA-F]{64}$").expect("discovery hash pattern"))
}

fn is_bootstrap_token(token: &str) -> bool {
    bootstrap_token_regex().is_match(token)
}

fn is_discovery_hash(hash: &str) -> bool {
    discovery_hash_regex().is_match(hash)
}

/// Lowercase RFC 1123 subdomain, as Kubernetes requires for node names
fn validate_node_name(name: &str) -> std::result::Result<(), String> {
    if name.len() > 253 {
        return Err(format!("'{}' is longer than 253 characters", name));
    }

    for label in name.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return Err(format!("'{}' is not a valid lowercase DNS name", name));
        }
    }

    Ok(())
}
