use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::warn;
use url::Url;

use super::{
    BackendError, ByteStream, Content, PresignOptions, PresignedUpload, PutOptions, StorageBackend,
    UploadHeader, UrlOptions, CHUNK_SIZE,
};

/// Parts below 5 MiB are rejected by S3 except for the last one.
const PART_SIZE: usize = 8 * 1024 * 1024;
const DEFAULT_URL_TTL_SECONDS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct S3Options {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub public_endpoint: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    public_endpoint: Option<String>,
}

impl S3Storage {
    pub async fn new(options: &S3Options) -> Result<Self> {
        let region_provider = RegionProviderChain::first_try(Region::new(options.region.clone()));
        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&shared_config)
            .region(shared_config.region().cloned());
        if let Some(endpoint) = &options.endpoint {
            s3_builder = s3_builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }
        if let Some(provider) = shared_config.credentials_provider() {
            s3_builder = s3_builder.credentials_provider(provider);
        }
        let s3_config = s3_builder.build();

        let client = Client::from_conf(s3_config);

        Ok(Self {
            client,
            bucket: options.bucket.clone(),
            prefix: options.prefix.clone(),
            public_endpoint: options.public_endpoint.clone(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key(&self, path: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), path),
            None => path.to_string(),
        }
    }

    fn public_url(&self, presigned: String) -> String {
        match &self.public_endpoint {
            Some(public_endpoint) => match rewrite_presigned_url(&presigned, public_endpoint) {
                Ok(rewritten) => rewritten,
                Err(err) => {
                    warn!(error = ?err, "failed to rewrite presigned URL");
                    presigned
                }
            },
            None => presigned,
        }
    }

    async fn put_single(&self, key: &str, body: Bytes, options: &PutOptions) -> Result<u64> {
        let len = body.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(options.content_type.clone())
            .body(S3Body::from(body))
            .send()
            .await?;
        Ok(len)
    }

    /// Stream a body of unknown length without holding it in memory: the first
    /// part is buffered, and only a body larger than one part goes multipart.
    async fn put_streamed(&self, key: &str, mut body: ByteStream, options: &PutOptions) -> Result<u64> {
        let mut buffer = BytesMut::with_capacity(CHUNK_SIZE);
        while buffer.len() < PART_SIZE {
            match body.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => return self.put_single(key, buffer.freeze(), options).await,
            }
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(options.content_type.clone())
            .send()
            .await?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| anyhow!("missing multipart upload id"))?
            .to_string();

        match self.upload_parts(key, &upload_id, buffer, body).await {
            Ok(written) => Ok(written),
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(error = ?abort_err, key, "failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut buffer: BytesMut,
        mut body: ByteStream,
    ) -> Result<u64> {
        let mut parts = Vec::new();
        let mut written = 0u64;
        let mut finished = false;

        while !finished {
            while buffer.len() < PART_SIZE {
                match body.next().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk?),
                    None => {
                        finished = true;
                        break;
                    }
                }
            }
            if buffer.is_empty() {
                break;
            }

            let part = buffer.split_to(buffer.len().min(PART_SIZE)).freeze();
            let part_number = parts.len() as i32 + 1;
            written += part.len() as u64;
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(S3Body::from(part))
                .send()
                .await?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await?;

        Ok(written)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn adapter(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, path: &str, content: Content, options: &PutOptions) -> Result<u64, BackendError> {
        let key = self.key(path);
        let written = match content {
            Content::Bytes(bytes) => self.put_single(&key, bytes, options).await?,
            Content::Stream(body) => self.put_streamed(&key, body, options).await?,
        };
        Ok(written)
    }

    async fn get(&self, path: &str) -> Result<Bytes, BackendError> {
        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(object) => object,
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_no_such_key() => {
                return Err(BackendError::NotFound(path.to_string()))
            }
            Err(err) => return Err(anyhow!(err).into()),
        };

        let data = object
            .body
            .collect()
            .await
            .map_err(|err| anyhow!(err))?
            .into_bytes();
        Ok(data)
    }

    async fn open(&self, path: &str) -> Result<ByteStream, BackendError> {
        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(object) => object,
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_no_such_key() => {
                return Err(BackendError::NotFound(path.to_string()))
            }
            Err(err) => return Err(anyhow!(err).into()),
        };

        Ok(ReaderStream::with_capacity(object.body.into_async_read(), CHUNK_SIZE).boxed())
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|err| anyhow!(err))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, BackendError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_not_found() => Ok(false),
            Err(err) => Err(anyhow!(err).into()),
        }
    }

    async fn url(&self, path: &str, options: &UrlOptions) -> Result<String, BackendError> {
        let expires_in = options
            .expires_in
            .unwrap_or(Duration::from_secs(DEFAULT_URL_TTL_SECONDS));
        let presign_config = PresigningConfig::expires_in(expires_in).map_err(|err| anyhow!(err))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .presigned(presign_config)
            .await
            .map_err(|err| anyhow!(err))?;

        Ok(self.public_url(presigned.uri().to_string()))
    }

    async fn presigned_upload_url(
        &self,
        path: &str,
        options: &PresignOptions,
    ) -> Result<PresignedUpload, BackendError> {
        let presign_config = PresigningConfig::expires_in(options.expires_in).map_err(|err| anyhow!(err))?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .set_content_type(options.content_type.clone())
            .set_content_length(options.content_length)
            .presigned(presign_config)
            .await
            .map_err(|err| anyhow!(err))?;

        let headers = presigned
            .headers()
            .map(|(name, value)| UploadHeader {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect();

        Ok(PresignedUpload {
            url: self.public_url(presigned.uri().to_string()),
            headers,
            expires_in_seconds: options.expires_in.as_secs(),
        })
    }
}

fn rewrite_presigned_url(original: &str, public_endpoint: &str) -> Result<String> {
    let mut original_url = Url::parse(original)?;
    let public_url = if public_endpoint.contains("://") {
        Url::parse(public_endpoint)?
    } else {
        Url::parse(&format!("http://{}", public_endpoint))?
    };

    original_url
        .set_scheme(public_url.scheme())
        .map_err(|_| anyhow!("invalid scheme for public endpoint"))?;
    original_url
        .set_host(public_url.host_str())
        .map_err(|_| anyhow!("invalid host for public endpoint"))?;
    original_url.set_port(public_url.port()).ok();

    Ok(original_url.to_string())
}
