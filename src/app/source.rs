use std::io;
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

use crate::app::sniffer::normalize_mime;
use crate::error::{MediaError, MediaResult};
use crate::infra::storage::{ByteStream, CHUNK_SIZE};

const FALLBACK_NAME: &str = "file";

/// Where ingested bytes come from.
#[derive(Debug, Clone)]
pub enum Source {
    /// A file on the local filesystem.
    Path(PathBuf),
    /// Bytes already in memory, e.g. a request body.
    Upload {
        bytes: Bytes,
        file_name: String,
        content_type: Option<String>,
    },
    /// An `http` or `https` URL fetched at finalize time.
    Remote { url: String, options: RemoteOptions },
}

#[derive(Debug, Clone, Default)]
pub struct RemoteOptions {
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl Source {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn upload(bytes: impl Into<Bytes>, file_name: impl Into<String>, content_type: Option<String>) -> Self {
        Self::Upload {
            bytes: bytes.into(),
            file_name: file_name.into(),
            content_type,
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self::Remote {
            url: url.into(),
            options: RemoteOptions::default(),
        }
    }

    pub fn remote_with(url: impl Into<String>, options: RemoteOptions) -> Self {
        Self::Remote {
            url: url.into(),
            options,
        }
    }
}

/// An opened source, ready to be sampled and streamed.
pub struct ResolvedSource {
    pub file_name: String,
    pub declared_mime: Option<String>,
    /// Known upfront from file metadata, buffer length or Content-Length.
    pub size_hint: Option<u64>,
    pub origin_url: Option<String>,
    /// Complete content when the source was already in memory.
    pub buffered: Option<Bytes>,
    pub body: ByteStream,
}

pub async fn resolve(source: Source, client: &reqwest::Client, timeout: Option<Duration>) -> MediaResult<ResolvedSource> {
    match source {
        Source::Path(path) => resolve_path(path).await,
        Source::Upload {
            bytes,
            file_name,
            content_type,
        } => {
            let declared_mime = content_type
                .map(|value| normalize_mime(&value))
                .filter(|mime| !mime.is_empty())
                .or_else(|| guess_mime(&file_name));
            let size = bytes.len() as u64;
            let body = stream::once({
                let bytes = bytes.clone();
                async move { Ok(bytes) }
            })
            .boxed();
            Ok(ResolvedSource {
                file_name,
                declared_mime,
                size_hint: Some(size),
                origin_url: None,
                buffered: Some(bytes),
                body,
            })
        }
        Source::Remote { url, options } => {
            let timeout = options.timeout.or(timeout);
            resolve_remote(&url, &options.headers, client, timeout).await
        }
    }
}

async fn resolve_path(path: PathBuf) -> MediaResult<ResolvedSource> {
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|err| MediaError::InvalidSource(format!("cannot open {}: {}", path.display(), err)))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|err| MediaError::InvalidSource(format!("cannot stat {}: {}", path.display(), err)))?;
    if !metadata.is_file() {
        return Err(MediaError::InvalidSource(format!("{} is not a regular file", path.display())));
    }

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(FALLBACK_NAME)
        .to_string();

    Ok(ResolvedSource {
        declared_mime: guess_mime(&file_name),
        file_name,
        size_hint: Some(metadata.len()),
        origin_url: None,
        buffered: None,
        body: ReaderStream::with_capacity(file, CHUNK_SIZE).boxed(),
    })
}

async fn resolve_remote(
    raw: &str,
    headers: &[(String, String)],
    client: &reqwest::Client,
    timeout: Option<Duration>,
) -> MediaResult<ResolvedSource> {
    let url = Url::parse(raw).map_err(|err| MediaError::InvalidSource(format!("invalid url {}: {}", raw, err)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(MediaError::InvalidSource(format!("unsupported url scheme {}", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(MediaError::InvalidSource(format!("url {} has no host", raw)));
    }

    let mut request = client.get(url.clone());
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(limit) = timeout {
        request = request.timeout(limit);
    }

    let response = request.send().await.map_err(|err| fetch_error(&url, err))?;
    let status = response.status();
    if !status.is_success() {
        return Err(MediaError::InvalidSource(format!("{} responded with {}", url, status)));
    }

    let declared_mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(normalize_mime)
        .filter(|mime| !mime.is_empty());
    let size_hint = response.content_length();
    let file_name = remote_file_name(&url);
    debug!(url = %url, status = %status, size = ?size_hint, "remote source opened");

    let body = response
        .bytes_stream()
        .map_err(|err| {
            let kind = if err.is_timeout() {
                io::ErrorKind::TimedOut
            } else {
                io::ErrorKind::Other
            };
            io::Error::new(kind, err)
        })
        .boxed();

    Ok(ResolvedSource {
        declared_mime: declared_mime.or_else(|| guess_mime(&file_name)),
        file_name,
        size_hint,
        origin_url: Some(url.to_string()),
        buffered: None,
        body,
    })
}

fn fetch_error(url: &Url, err: reqwest::Error) -> MediaError {
    if err.is_timeout() {
        MediaError::TimedOut {
            operation: format!("fetch {}", url),
        }
    } else {
        MediaError::InvalidSource(format!("failed to fetch {}: {}", url, err))
    }
}

fn remote_file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|segment| !segment.is_empty()).last())
        .map(str::to_string)
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

fn guess_mime(file_name: &str) -> Option<String> {
    mime_guess::from_path(file_name)
        .first_raw()
        .map(normalize_mime)
}

/// Read at least `limit` bytes (or the whole stream, if shorter) without
/// losing any of them. Returns the sample and a stream that replays the
/// sampled chunks ahead of the remainder.
pub async fn sample_header(mut body: ByteStream, limit: usize) -> io::Result<(Bytes, ByteStream)> {
    let mut sample = BytesMut::with_capacity(limit);
    let mut consumed = Vec::new();
    while sample.len() < limit {
        match body.next().await {
            Some(chunk) => {
                let chunk = chunk?;
                let wanted = (limit - sample.len()).min(chunk.len());
                sample.extend_from_slice(&chunk[..wanted]);
                consumed.push(chunk);
            }
            None => break,
        }
    }

    let replay = stream::iter(consumed.into_iter().map(Ok)).chain(body).boxed();
    Ok((sample.freeze(), replay))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        stream::iter(parts.iter().map(|part| Ok(Bytes::from_static(part))).collect::<Vec<_>>()).boxed()
    }

    #[tokio::test]
    async fn sampling_loses_no_bytes() {
        let (sample, rest) = sample_header(chunks(&[b"abc", b"defg", b"hij"]), 5).await.unwrap();
        assert_eq!(&sample[..], b"abcde");
        let all: Vec<Bytes> = rest.try_collect().await.unwrap();
        assert_eq!(all.concat(), b"abcdefghij".to_vec());
    }

    #[tokio::test]
    async fn short_streams_are_sampled_whole() {
        let (sample, rest) = sample_header(chunks(&[b"ab"]), 512).await.unwrap();
        assert_eq!(&sample[..], b"ab");
        let all: Vec<Bytes> = rest.try_collect().await.unwrap();
        assert_eq!(all.concat(), b"ab".to_vec());
    }

    #[tokio::test]
    async fn blank_upload_type_falls_back_to_file_name() {
        let client = reqwest::Client::new();
        let upload = Source::upload(b"data".to_vec(), "photo.png", Some(String::new()));
        let resolved = resolve(upload, &client, None).await.unwrap();
        assert_eq!(resolved.declared_mime.as_deref(), Some("image/png"));

        let unnamed = Source::upload(b"data".to_vec(), "upload", Some(" ".into()));
        let resolved = resolve(unnamed, &client, None).await.unwrap();
        assert_eq!(resolved.declared_mime, None);
    }

    #[tokio::test]
    async fn non_http_schemes_are_invalid() {
        let client = reqwest::Client::new();
        for url in ["ftp://example.com/a.png", "file:///etc/passwd", "not a url"] {
            let err = resolve(Source::remote(url), &client, None).await.err().unwrap();
            assert!(matches!(err, MediaError::InvalidSource(_)), "{}: {:?}", url, err);
        }
    }

    #[tokio::test]
    async fn missing_local_file_is_invalid() {
        let client = reqwest::Client::new();
        let err = resolve(Source::path("/definitely/not/here.png"), &client, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MediaError::InvalidSource(_)));
    }

    #[test]
    fn remote_names_come_from_the_last_segment() {
        let url = Url::parse("https://cdn.example.com/a/b/photo.jpg?size=large").unwrap();
        assert_eq!(remote_file_name(&url), "photo.jpg");
        let bare = Url::parse("https://cdn.example.com/").unwrap();
        assert_eq!(remote_file_name(&bare), FALLBACK_NAME);
    }
}
