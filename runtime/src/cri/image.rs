//! `ImageService` — image pull, inspection, and removal.

use std::collections::HashMap;

use api_proto::runtime::v1 as v1;
use api_proto::runtime::v1::image_service_server::ImageService;
use tonic::{async_trait, Request, Response};

use super::{into_status, CriService, TonicResult};
use crate::pool::ImageRecord;

fn image_item(record: ImageRecord) -> v1::Image {
    v1::Image {
        id: record.name,
        repo_tags: Vec::new(),
        repo_digests: Vec::new(),
        size: Some(v1::UInt64Value { value: record.disk_usage_bytes }),
        pinned: record.read_only,
    }
}

#[async_trait]
impl ImageService for CriService {
    async fn list_images(&self, _request: Request<v1::ListImagesRequest>) -> TonicResult<v1::ListImagesResponse> {
        let images = self.engine.list_images().await.map_err(into_status)?;
        Ok(Response::new(v1::ListImagesResponse {
            images: images.into_iter().map(image_item).collect(),
        }))
    }

    async fn image_status(
        &self,
        request: Request<v1::ImageStatusRequest>,
    ) -> TonicResult<v1::ImageStatusResponse> {
        let image = request
            .into_inner()
            .image
            .map(|spec| spec.image)
            .unwrap_or_default();
        let record = self.engine.image_status(&image).await.map_err(into_status)?;
        Ok(Response::new(v1::ImageStatusResponse {
            image: record.map(image_item),
            info: HashMap::new(),
        }))
    }

    async fn pull_image(&self, request: Request<v1::PullImageRequest>) -> TonicResult<v1::PullImageResponse> {
        let image = request
            .into_inner()
            .image
            .map(|spec| spec.image)
            .unwrap_or_default();
        let image_ref = self.engine.pull_image(&image).await.map_err(into_status)?;
        Ok(Response::new(v1::PullImageResponse { image_ref }))
    }

    async fn remove_image(&self, request: Request<v1::RemoveImageRequest>) -> TonicResult<v1::RemoveImageResponse> {
        let image = request
            .into_inner()
            .image
            .map(|spec| spec.image)
            .unwrap_or_default();
        self.engine.remove_image(&image).await.map_err(into_status)?;
        Ok(Response::new(v1::RemoveImageResponse {}))
    }

    async fn image_fs_info(
        &self,
        _request: Request<v1::ImageFsInfoRequest>,
    ) -> TonicResult<v1::ImageFsInfoResponse> {
        let usage = self.engine.image_fs_info().await.map_err(into_status)?;
        Ok(Response::new(v1::ImageFsInfoResponse {
            image_filesystems: vec![v1::FilesystemUsage {
                timestamp: super::now_ns(),
                used_bytes: Some(v1::UInt64Value { value: usage.used_bytes }),
                inodes_used: None,
            }],
        }))
    }
}
