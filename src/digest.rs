//! Remote digest resolution and the local/remote comparison that decides
//! whether a container runs an outdated image.
use crate::runtime::{ContainerRuntime, RuntimeError};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ImageDigest(pub String);

impl ImageDigest {
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outcome of asking the registry for the digest behind a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteDigest {
    Found(ImageDigest),
    /// The registry does not know the reference, typically a local-only tag.
    NotFound,
}

pub async fn resolve_remote_digest<R: ContainerRuntime>(
    runtime: &R,
    image: &str,
) -> Result<RemoteDigest, RuntimeError> {
    match runtime.inspect_distribution(image).await {
        Ok(raw) => Ok(digest_from_distribution(&raw)
            .map(RemoteDigest::Found)
            .unwrap_or(RemoteDigest::NotFound)),
        Err(RuntimeError::NotFound(message)) => {
            debug!("no remote manifest for {image}: {message}");
            Ok(RemoteDigest::NotFound)
        }
        Err(e) => Err(e),
    }
}

fn digest_from_distribution(raw: &Value) -> Option<ImageDigest> {
    let descriptor = raw.get("Descriptor").or_else(|| raw.get("descriptor"))?;
    descriptor
        .get("Digest")
        .or_else(|| descriptor.get("digest"))
        .and_then(Value::as_str)
        .filter(|digest| !digest.is_empty())
        .map(ImageDigest::new)
}

/// Repo digests read `<repo>@<digest>`, so the remote digest is looked up by
/// containment rather than equality.
pub fn has_update(local_repo_digests: &[String], remote: &ImageDigest) -> bool {
    !local_repo_digests
        .iter()
        .any(|entry| entry.contains(remote.as_str()))
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckReason {
    UpdateAvailable,
    UpToDate,
    RemoteDigestNotFound,
    LocalImageNotFound,
    CheckFailed,
}

impl CheckReason {
    /// Whether the comparison could actually be made.
    pub fn is_determined(&self) -> bool {
        matches!(self, CheckReason::UpdateAvailable | CheckReason::UpToDate)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct UpdateCheckResult {
    pub container: String,
    pub image: String,
    pub image_id: String,
    pub remote_digest: Option<ImageDigest>,
    pub repo_digests: Vec<String>,
    pub has_update: bool,
    pub reason: CheckReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpdateCheckResult {
    fn undetermined(
        container: String,
        image: String,
        image_id: String,
        reason: CheckReason,
    ) -> Self {
        Self {
            container,
            image,
            image_id,
            remote_digest: None,
            repo_digests: vec![],
            has_update: false,
            reason,
            error: None,
        }
    }

    /// Entry for a container whose check itself errored.
    pub fn failed(container: &str, image: &str, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::undetermined(
                container.to_string(),
                image.to_string(),
                String::new(),
                CheckReason::CheckFailed,
            )
        }
    }
}

/// Compare the image a container runs against what the registry serves for
/// the reference it was created from.
pub async fn check_update<R: ContainerRuntime>(
    runtime: &R,
    container: &str,
) -> Result<UpdateCheckResult, RuntimeError> {
    let details = runtime.inspect_container(container).await?;
    let name = details
        .name
        .as_deref()
        .unwrap_or(container)
        .trim_start_matches('/')
        .to_string();
    let image = details
        .config
        .as_ref()
        .and_then(|config| config.image.clone())
        .unwrap_or_default();
    let image_id = details.image.clone().unwrap_or_default();

    let repo_digests = match runtime.inspect_image(&image_id).await {
        Ok(inspect) => inspect.repo_digests.unwrap_or_default(),
        Err(RuntimeError::NotFound(_)) => {
            debug!("{name}: local image {image_id} is gone");
            return Ok(UpdateCheckResult::undetermined(
                name,
                image,
                image_id,
                CheckReason::LocalImageNotFound,
            ));
        }
        Err(e) => return Err(e),
    };

    let remote = match resolve_remote_digest(runtime, &image).await? {
        RemoteDigest::Found(digest) => digest,
        RemoteDigest::NotFound => {
            return Ok(UpdateCheckResult {
                repo_digests,
                ..UpdateCheckResult::undetermined(
                    name,
                    image,
                    image_id,
                    CheckReason::RemoteDigestNotFound,
                )
            });
        }
    };

    let update = has_update(&repo_digests, &remote);
    debug!("{name}: remote {} update={update}", remote.as_str());
    Ok(UpdateCheckResult {
        container: name,
        image,
        image_id,
        remote_digest: Some(remote),
        repo_digests,
        has_update: update,
        reason: if update {
            CheckReason::UpdateAvailable
        } else {
            CheckReason::UpToDate
        },
        error: None,
    })
}
