use std::time::Duration;

use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCategory {
    Drop,
    Pickup,
    Profile,
}

impl ImageCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Pickup => "pickup",
            Self::Profile => "profile",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredImage {
    pub image_url: String,
    pub file_name: String,
}

/// Image store for drop, pickup and enrolled-face captures. Images
/// travel as base64.
#[axum::async_trait]
pub trait VisionService: Send + Sync {
    async fn upload_image(
        &self,
        image_base64: &str,
        order_id: ObjectId,
        category: ImageCategory,
    ) -> Result<StoredImage, Error>;

    async fn download_image(
        &self,
        file_name: &str,
        category: ImageCategory,
    ) -> Result<String, Error>;
}

#[derive(Clone)]
pub struct VisionClient(pub std::sync::Arc<dyn VisionService>);

impl std::ops::Deref for VisionClient {
    type Target = dyn VisionService;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

/// HTTP-backed vision service speaking JSON to a configured base URL.
pub struct HttpVisionService {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest<'a> {
    image: &'a str,
    file_name: String,
    category: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    image: String,
}

impl HttpVisionService {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build vision http client");

        Self { client, base_url }
    }

    pub fn new_from_env() -> Self {
        Self::new(
            std::env::var("VISION_BASE_URL")
                .expect("Cannot retreive VISION_BASE_URL from environment variable."),
        )
    }
}

#[axum::async_trait]
impl VisionService for HttpVisionService {
    async fn upload_image(
        &self,
        image_base64: &str,
        order_id: ObjectId,
        category: ImageCategory,
    ) -> Result<StoredImage, Error> {
        let file_name = format!("{order_id}.jpg");

        let response = self
            .client
            .post(format!("{}/images", self.base_url))
            .json(&UploadRequest {
                image: image_base64,
                file_name: file_name.clone(),
                category: category.as_str(),
            })
            .send()
            .await
            .map_err(|err| Error::ImageServiceError(err.to_string()))?
            .error_for_status()
            .map_err(|err| Error::ImageServiceError(err.to_string()))?;

        response
            .json()
            .await
            .map_err(|err| Error::ImageServiceError(err.to_string()))
    }

    async fn download_image(
        &self,
        file_name: &str,
        category: ImageCategory,
    ) -> Result<String, Error> {
        let response = self
            .client
            .get(format!(
                "{}/images/{}/{file_name}",
                self.base_url,
                category.as_str()
            ))
            .send()
            .await
            .map_err(|err| Error::ImageServiceError(err.to_string()))?
            .error_for_status()
            .map_err(|err| Error::ImageServiceError(err.to_string()))?;

        let body: DownloadResponse = response
            .json()
            .await
            .map_err(|err| Error::ImageServiceError(err.to_string()))?;

        Ok(body.image)
    }
}

/// Development service: no network, canned results.
pub struct DevVisionService;

#[axum::async_trait]
impl VisionService for DevVisionService {
    async fn upload_image(
        &self,
        _image_base64: &str,
        order_id: ObjectId,
        category: ImageCategory,
    ) -> Result<StoredImage, Error> {
        let file_name = format!("{order_id}.jpg");
        Ok(StoredImage {
            image_url: format!("dev://{}/{file_name}", category.as_str()),
            file_name,
        })
    }

    async fn download_image(
        &self,
        _file_name: &str,
        _category: ImageCategory,
    ) -> Result<String, Error> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_service_names_files_by_order_id() {
        let vision = DevVisionService;
        let id = ObjectId::new();

        let stored = vision.upload_image("aGk=", id, ImageCategory::Drop).await.unwrap();
        assert_eq!(stored.file_name, format!("{id}.jpg"));
        assert!(stored.image_url.contains("drop"));
    }
}
