//! `ImageService` for the systemd-backed runtime.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{async_trait, Request, Response, Status};

use crate::api::v1;
use crate::api::v1::image_service_server::ImageService;
use crate::cri::TonicResult;
use crate::error::Code;
use crate::images::puller::PullAuth;
use crate::images::{ImageReference, StoredImage};
use crate::runtime::Runtime;
use crate::state::now;

/// Wrapper around [`Runtime`] that implements [`ImageService`].
pub struct CriImageService(pub Arc<Runtime>);

#[async_trait]
impl ImageService for CriImageService {
    async fn list_images(
        &self,
        request: Request<v1::ListImagesRequest>,
    ) -> TonicResult<v1::ListImagesResponse> {
        let filter = request
            .into_inner()
            .filter
            .unwrap_or_default()
            .image
            .unwrap_or_default();

        let mut stored = self.0.images.list()?;
        if !filter.image.is_empty() {
            let wanted = ImageReference::parse(&filter.image)?.normalized();
            stored.retain(|image| {
                image.id == filter.image || image.repo_tags.iter().any(|tag| *tag == wanted)
            });
        }

        Ok(Response::new(v1::ListImagesResponse {
            images: stored.iter().map(cri_image).collect(),
        }))
    }

    async fn image_status(
        &self,
        request: Request<v1::ImageStatusRequest>,
    ) -> TonicResult<v1::ImageStatusResponse> {
        let image_spec = request.into_inner().image.unwrap_or_default();
        if image_spec.image.is_empty() {
            return Err(Status::invalid_argument("image-spec-empty"));
        }

        // An absent image is reported as an empty status, not an error.
        let image = match self.resolve(&image_spec.image)? {
            Some(stored) => Some(cri_image(&stored)),
            None => None,
        };

        Ok(Response::new(v1::ImageStatusResponse {
            image,
            info: HashMap::default(),
        }))
    }

    async fn pull_image(
        &self,
        request: Request<v1::PullImageRequest>,
    ) -> TonicResult<v1::PullImageResponse> {
        let request = request.into_inner();
        let image_spec = request.image.unwrap_or_default();
        if image_spec.image.is_empty() {
            return Err(Status::invalid_argument("image-spec-empty"));
        }
        let auth = request.auth.filter(|auth| !auth.username.is_empty()).map(|auth| PullAuth {
            username: auth.username,
            password: auth.password,
        });

        let image_ref = self.0.puller.pull(&image_spec.image, auth).await?;

        Ok(Response::new(v1::PullImageResponse { image_ref }))
    }

    async fn remove_image(
        &self,
        request: Request<v1::RemoveImageRequest>,
    ) -> TonicResult<v1::RemoveImageResponse> {
        let image_spec = request.into_inner().image.unwrap_or_default();
        if image_spec.image.is_empty() {
            return Err(Status::invalid_argument("image-spec-empty"));
        }

        // Removal of an absent image is success.
        if let Some(stored) = self.resolve(&image_spec.image)? {
            self.0
                .machined
                .remove_image(&crate::images::puller::machine_image_name(&stored.id))
                .await?;
            self.0.images.remove_image(&stored.id)?;
        }

        Ok(Response::new(v1::RemoveImageResponse {}))
    }

    async fn image_fs_info(
        &self,
        _request: Request<v1::ImageFsInfoRequest>,
    ) -> TonicResult<v1::ImageFsInfoResponse> {
        let usage = v1::FilesystemUsage {
            timestamp: now(),
            fs_id: Some(v1::FilesystemIdentifier {
                mountpoint: self.0.images.root().to_string_lossy().into_owned(),
            }),
            used_bytes: Some(v1::UInt64Value {
                value: self.0.images.blob_bytes(),
            }),
            inodes_used: None,
        };

        Ok(Response::new(v1::ImageFsInfoResponse {
            image_filesystems: vec![usage],
        }))
    }
}

impl CriImageService {
    /// Resolve a reference or digest to a stored image, if present.
    fn resolve(&self, reference: &str) -> Result<Option<StoredImage>, Status> {
        let digest = if reference.starts_with("sha256:") {
            String::from(reference)
        } else {
            match self.0.images.lookup(&ImageReference::parse(reference)?.normalized()) {
                Ok(digest) => digest,
                Err(status) if status.code() == Code::NotFound => return Ok(None),
                Err(status) => return Err(status),
            }
        };
        Ok(self
            .0
            .images
            .list()?
            .into_iter()
            .find(|image| image.id == digest))
    }
}

fn cri_image(stored: &StoredImage) -> v1::Image {
    v1::Image {
        id: stored.id.clone(),
        repo_tags: stored.repo_tags.clone(),
        repo_digests: stored
            .repo_tags
            .iter()
            .map(|tag| {
                let repository = match tag.split_once('@') {
                    Some((repository, _)) => repository,
                    None => match tag.rsplit_once(':') {
                        // A colon inside the final component is a tag; one
                        // earlier is a registry port.
                        Some((repository, suffix)) if !suffix.contains('/') => repository,
                        _ => tag.as_str(),
                    },
                };
                format!("{repository}@{}", stored.id)
            })
            .collect(),
        size: stored.size,
    }
}
