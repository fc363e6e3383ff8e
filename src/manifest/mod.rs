//! Applies Kubernetes manifests through the node's admin credentials

use crate::cluster::kubeadm::{kubectl, ADMIN_KUBECONFIG};
use crate::error::{ProvisionError, Result};
use crate::remote::{shell_quote, NodeSession, RemoteExecutor};
use crate::report::{StepResult, STEP_MANIFESTS};
use chrono::Utc;
use std::path::Path;
use tracing::info;

/// Where a manifest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource<'a> {
    /// Fetched by kubectl itself
    Url(&'a str),
    /// Read locally and uploaded
    File(&'a Path),
}

impl<'a> ManifestSource<'a> {
    pub fn classify(entry: &'a str) -> Self {
        let lower = entry.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ManifestSource::Url(entry)
        } else {
            ManifestSource::File(Path::new(entry))
        }
    }
}

/// Applies manifests in order, stopping at the first failure
pub struct ManifestApplier<'a, 'e, E: RemoteExecutor> {
    session: &'a NodeSession<'e, E>,
}

impl<'a, 'e, E: RemoteExecutor> ManifestApplier<'a, 'e, E> {
    pub fn new(session: &'a NodeSession<'e, E>) -> Self {
        Self { session }
    }

    /// Apply every manifest; an empty list is skipped
    pub async fn apply(&self, manifests: &[String]) -> StepResult {
        let started = Utc::now();
        if manifests.is_empty() {
            return StepResult::skipped(STEP_MANIFESTS, "no manifests to apply").timed(started);
        }

        for (index, manifest) in manifests.iter().enumerate() {
            if let Err(e) = self.apply_one(manifest).await {
                if matches!(
                    e,
                    ProvisionError::InsufficientPrivilege { .. } | ProvisionError::Cancelled(_)
                ) {
                    return StepResult::failed(STEP_MANIFESTS, &e, true).timed(started);
                }
                let error = ProvisionError::ManifestApplyFailure {
                    index,
                    manifest: manifest.clone(),
                    message: e.to_string(),
                };
                let mut step = StepResult::failed(STEP_MANIFESTS, &error, true);
                step.command = e.command().map(str::to_string);
                step.exit_code = e.exit_code();
                return step.timed(started);
            }
            info!(index, manifest = %manifest, "Applied manifest");
        }

        StepResult::success(
            STEP_MANIFESTS,
            format!("applied {} manifest(s)", manifests.len()),
        )
        .timed(started)
    }

    async fn apply_one(&self, manifest: &str) -> Result<()> {
        match ManifestSource::classify(manifest) {
            ManifestSource::Url(url) => {
                let args = format!("apply -f {}", shell_quote(url));
                self.session.check(kubectl(ADMIN_KUBECONFIG, &args)).await?;
                Ok(())
            }
            ManifestSource::File(path) => {
                let contents = tokio::fs::read(path).await?;
                let session = self.session;
                session
                    .with_temp_file("manifest", &contents, 0o644, |remote| async move {
                        let args = format!("apply -f {}", shell_quote(&remote));
                        session.check(kubectl(ADMIN_KUBECONFIG, &args)).await.map(|_| ())
                    })
                    .await
            }
        }
    }
}
