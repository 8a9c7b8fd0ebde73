//! Ingestion Tests
//!
//! Covers the source → storage → record path for uploads, local files and
//! remote URLs, and the ways it can refuse content.

#![cfg(feature = "raster")]

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use common::{owner, pdf, png, serve, TestLibrary};
use futures::stream;
use serde_json::json;

use vellum::app::checksum::digest;
use vellum::app::ingest::{FinalizeOptions, SOURCE_URL_PROPERTY};
use vellum::app::source::{RemoteOptions, Source};
use vellum::domain::media::{ChecksumAlgorithm, OwnerRef};
use vellum::error::{MediaError, Rejection};

// ===========================================================================
// Uploads and local files
// ===========================================================================

#[tokio::test]
async fn upload_is_stored_hashed_and_recorded() {
    let t = TestLibrary::new();
    let bytes = png(40, 30);

    let record = t
        .library
        .media
        .ingest(owner("1"), Source::upload(bytes.clone(), "holiday.png", Some("image/png".into())))
        .custom_property("caption", "beach")
        .finalize("gallery", FinalizeOptions::default())
        .await
        .unwrap();

    assert_eq!(record.mime_type, "image/png");
    assert_eq!(record.file_name, "holiday.png");
    assert_eq!(record.size, bytes.len() as i64);
    assert_eq!(record.checksum_algorithm, Some(ChecksumAlgorithm::Sha256));
    assert_eq!(record.checksum.as_deref(), Some(digest(ChecksumAlgorithm::Sha256, &bytes).as_str()));
    assert_eq!(record.custom_properties["caption"], json!("beach"));
    assert_eq!(record.metadata["width"], json!(40));
    assert_eq!(record.metadata["height"], json!(30));
    assert!(record.metadata.contains_key("extracted_at"));

    let path = record.original_path();
    assert!(path.starts_with("gallery/1/"));
    assert!(path.ends_with("-holiday.png"));
    assert_eq!(std::fs::read(t.object(&path)).unwrap(), bytes);

    let stored = t.library.media.get(record.id).await.unwrap();
    assert_eq!(stored.order_index, 1);
}

#[tokio::test]
async fn local_file_is_streamed_in() {
    let t = TestLibrary::new();
    let scratch = tempfile::tempdir().unwrap();
    let source = scratch.path().join("scan.pdf");
    let bytes = pdf(900);
    std::fs::write(&source, &bytes).unwrap();

    let record = t
        .library
        .media
        .ingest(owner("1"), Source::path(&source))
        .finalize("documents", FinalizeOptions::default())
        .await
        .unwrap();

    assert_eq!(record.mime_type, "application/pdf");
    assert_eq!(record.file_name, "scan.pdf");
    assert_eq!(record.size, 900);
    assert_eq!(std::fs::read(t.object(&record.original_path())).unwrap(), bytes);
}

#[tokio::test]
async fn same_file_name_does_not_collide() {
    let t = TestLibrary::new();
    let mut paths = Vec::new();
    for _ in 0..2 {
        let record = t
            .library
            .media
            .ingest(owner("1"), Source::upload(png(8, 8), "same.png", None))
            .without_metadata()
            .finalize("gallery", FinalizeOptions::default())
            .await
            .unwrap();
        assert!(record.metadata.is_empty());
        paths.push(record.original_path());
    }
    assert_ne!(paths[0], paths[1]);
    assert!(paths.iter().all(|path| t.object_exists(path)));
}

#[tokio::test]
async fn missing_local_file_is_invalid_source() {
    let t = TestLibrary::new();
    let err = t
        .library
        .media
        .ingest(owner("1"), Source::path("/no/such/file.png"))
        .finalize("gallery", FinalizeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::InvalidSource(_)), "{:?}", err);
}

#[tokio::test]
async fn unknown_owner_type_is_not_found() {
    let t = TestLibrary::new();
    let err = t
        .library
        .media
        .ingest(OwnerRef::new("ghost", 1), Source::upload(png(4, 4), "a.png", None))
        .finalize("gallery", FinalizeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::NotFound(_)));
    assert!(t.repo.is_empty());
}

// ===========================================================================
// Content rules
// ===========================================================================

#[tokio::test]
async fn declared_type_must_match_content() {
    let t = TestLibrary::new();
    let err = t
        .library
        .media
        .ingest(owner("1"), Source::upload(png(4, 4), "photo.jpg", Some("image/jpeg".into())))
        .finalize("gallery", FinalizeOptions::default())
        .await
        .unwrap_err();

    match err {
        MediaError::ContentRejected(Rejection::Mismatch { detected, declared }) => {
            assert_eq!(detected, "image/png");
            assert_eq!(declared, "image/jpeg");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(t.stored_files().is_empty());
    assert!(t.repo.is_empty());
}

#[tokio::test]
async fn blank_declared_type_is_treated_as_undeclared() {
    let t = TestLibrary::new();
    let record = t
        .library
        .media
        .ingest(owner("1"), Source::upload(png(4, 4), "photo.png", Some("".into())))
        .finalize("gallery", FinalizeOptions::default())
        .await
        .unwrap();
    assert_eq!(record.mime_type, "image/png");
}

#[tokio::test]
async fn disabled_verification_records_detected_type() {
    let t = TestLibrary::new();
    let record = t
        .library
        .media
        .ingest(owner("1"), Source::upload(png(4, 4), "photo.jpg", Some("image/jpeg".into())))
        .finalize("imports", FinalizeOptions::default())
        .await
        .unwrap();
    assert_eq!(record.mime_type, "image/png");
}

#[tokio::test]
async fn unaccepted_type_is_rejected() {
    let t = TestLibrary::new();
    let err = t
        .library
        .media
        .ingest(owner("1"), Source::upload(pdf(100), "doc.pdf", None))
        .finalize("avatar", FinalizeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MediaError::ContentRejected(Rejection::NotAccepted { .. })
    ));
    assert!(t.stored_files().is_empty());
}

#[tokio::test]
async fn known_size_over_limit_fails_before_writing() {
    let t = TestLibrary::new();
    let err = t
        .library
        .media
        .ingest(owner("1"), Source::upload(pdf(2048), "big.pdf", None))
        .finalize("documents", FinalizeOptions::default())
        .await
        .unwrap_err();

    match err {
        MediaError::TooLarge { actual, limit } => {
            assert_eq!(actual, 2048);
            assert_eq!(limit, 1024);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(t.stored_files().is_empty());
}

// ===========================================================================
// Remote sources
// ===========================================================================

async fn fixture_server() -> String {
    let router = Router::new()
        .route(
            "/images/photo.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], png(24, 12)) }),
        )
        .route(
            "/secure.png",
            get(|headers: axum::http::HeaderMap| async move {
                match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
                    Some("Bearer letmein") => ([(header::CONTENT_TYPE, "image/png")], png(4, 4)).into_response(),
                    _ => StatusCode::UNAUTHORIZED.into_response(),
                }
            }),
        )
        .route(
            "/bucket/photo.png",
            get(|| async { ([(header::CONTENT_TYPE, "binary/octet-stream")], png(8, 8)) }),
        )
        .route("/missing.png", get(|| async { StatusCode::NOT_FOUND }))
        .route(
            "/slow.png",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                png(4, 4)
            }),
        )
        .route(
            "/endless.pdf",
            get(|| async {
                // Chunked, so the size is only discovered while streaming.
                let mut chunks = vec![Ok::<_, std::io::Error>(Bytes::from(pdf(512)))];
                chunks.extend((0..8).map(|_| Ok(Bytes::from(vec![b' '; 512]))));
                Body::from_stream(stream::iter(chunks))
            }),
        );
    format!("http://{}", serve(router).await)
}

#[tokio::test]
async fn remote_source_is_fetched_and_attributed() {
    let t = TestLibrary::new();
    let base = fixture_server().await;
    let url = format!("{}/images/photo.png", base);

    let record = t
        .library
        .media
        .ingest(owner("7"), Source::remote(url.clone()))
        .finalize("gallery", FinalizeOptions::default())
        .await
        .unwrap();

    assert_eq!(record.file_name, "photo.png");
    assert_eq!(record.mime_type, "image/png");
    assert_eq!(record.custom_properties[SOURCE_URL_PROPERTY], json!(url));
    assert_eq!(record.metadata["width"], json!(24));
    assert!(t.object_exists(&record.original_path()));
}

#[tokio::test]
async fn generic_binary_content_type_defers_to_detection() {
    let t = TestLibrary::new();
    let base = fixture_server().await;

    let record = t
        .library
        .media
        .ingest(owner("7"), Source::remote(format!("{}/bucket/photo.png", base)))
        .finalize("gallery", FinalizeOptions::default())
        .await
        .unwrap();
    assert_eq!(record.mime_type, "image/png");
}

#[tokio::test]
async fn remote_headers_are_sent() {
    let t = TestLibrary::new();
    let base = fixture_server().await;
    let options = RemoteOptions {
        headers: vec![("Authorization".into(), "Bearer letmein".into())],
        timeout: None,
    };

    t.library
        .media
        .ingest(owner("7"), Source::remote_with(format!("{}/secure.png", base), options))
        .finalize("gallery", FinalizeOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn remote_failures_are_invalid_sources() {
    let t = TestLibrary::new();
    let base = fixture_server().await;

    for url in [
        format!("{}/missing.png", base),
        format!("{}/secure.png", base),
        "ftp://example.com/a.png".to_string(),
        "http://".to_string(),
    ] {
        let err = t
            .library
            .media
            .ingest(owner("7"), Source::remote(url.clone()))
            .finalize("gallery", FinalizeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidSource(_)), "{}: {:?}", url, err);
    }
    assert!(t.repo.is_empty());
}

#[tokio::test]
async fn remote_timeout_is_reported() {
    let t = TestLibrary::new();
    let base = fixture_server().await;

    let err = t
        .library
        .media
        .ingest(owner("7"), Source::remote(format!("{}/slow.png", base)))
        .finalize(
            "gallery",
            FinalizeOptions {
                timeout: Some(Duration::from_millis(200)),
                ..FinalizeOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MediaError::TimedOut { .. }), "{:?}", err);
}

#[tokio::test]
async fn streamed_size_limit_removes_partial_object() {
    let t = TestLibrary::new();
    let base = fixture_server().await;

    let err = t
        .library
        .media
        .ingest(owner("7"), Source::remote(format!("{}/endless.pdf", base)))
        .finalize("documents", FinalizeOptions::default())
        .await
        .unwrap_err();

    match err {
        MediaError::TooLarge { actual, limit } => {
            assert_eq!(limit, 1024);
            assert!(actual > 1024);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(t.stored_files().is_empty());
    assert!(t.repo.is_empty());
}
