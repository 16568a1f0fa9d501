//! Black-box wiremock scenarios against [`oras_core::Registry`]'s public API.

use oras_core::{
    ANNOTATION_TITLE, BLANK_CONFIG_HASH, BLANK_HASH, BLOB_MEDIA_TYPE, Descriptor, MANIFEST_MEDIA_TYPE,
    Manifest, Reference, Registry, UNKNOWN_CONFIG_MEDIA_TYPE,
};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn reference_for(server: &MockServer) -> Reference {
    let host = server.address().to_string();
    Reference::parse(&format!("{host}/demo/repo:v1"), None).unwrap()
}

#[tokio::test]
async fn get_manifest_parses_response_body() {
    let server = MockServer::start().await;
    let manifest = Manifest::new();
    Mock::given(method("GET"))
        .and(path("/v2/demo/repo/manifests/v1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&manifest))
        .mount(&server)
        .await;

    let mut registry = Registry::new().insecure(true);
    let reference = reference_for(&server);
    let fetched = registry.get_manifest(&reference).await.unwrap();
    assert_eq!(fetched.schema_version, 2);
}

#[tokio::test]
async fn get_tags_follows_link_header_pagination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/demo/repo/tags/list"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"tags": ["a"]}))
                .insert_header("Link", "</v2/demo/repo/tags/list?next=1>; rel=\"next\""),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/demo/repo/tags/list"))
        .and(wiremock::matchers::query_param("next", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tags": ["b"]})))
        .mount(&server)
        .await;

    let mut registry = Registry::new().insecure(true);
    let reference = reference_for(&server);
    let tags = registry.get_tags(&reference, None).await.unwrap();
    assert_eq!(tags, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn not_found_manifest_maps_to_not_found_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/demo/repo/manifests/v1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let mut registry = Registry::new().insecure(true);
    let reference = reference_for(&server);
    let err = registry.get_manifest(&reference).await.unwrap_err();
    assert!(matches!(err, oras_core::Error::NotFound(_)));
}

#[tokio::test]
async fn push_files_uploads_layer_config_and_manifest_in_order() {
    let server = MockServer::start().await;
    let dir = tempfile::TempDir::new().unwrap();
    let file_path = dir.path().join("artifact.txt");
    std::fs::write(&file_path, b"hello\n").unwrap();

    Mock::given(method("HEAD"))
        .and(path_regex(r"^/v2/demo/repo/blobs/sha256:.*$"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/demo/repo/blobs/uploads/"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", "/v2/demo/repo/blobs/uploads/abc"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/demo/repo/blobs/uploads/abc"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/v2/demo/repo/manifests/.*$"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let mut registry = Registry::new().insecure(true);
    let reference = reference_for(&server);
    let descriptor = registry
        .push_files(&reference, &[file_path], None, None, None, false)
        .await
        .unwrap();
    assert_eq!(descriptor.media_type, MANIFEST_MEDIA_TYPE);
}

#[tokio::test]
async fn pull_files_names_output_from_title_annotation() {
    let server = MockServer::start().await;
    let mut manifest = Manifest::new();
    manifest.config.media_type = UNKNOWN_CONFIG_MEDIA_TYPE.to_string();
    manifest.config.digest = BLANK_CONFIG_HASH.to_string();
    let mut layer = Descriptor {
        media_type: BLOB_MEDIA_TYPE.to_string(),
        size: 6,
        digest: "sha256:5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03".to_string(),
        annotations: std::collections::BTreeMap::new(),
    };
    layer.annotations.insert(ANNOTATION_TITLE.to_string(), "hello.txt".to_string());
    manifest.layers.push(layer);

    Mock::given(method("GET"))
        .and(path("/v2/demo/repo/manifests/v1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&manifest))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/v2/demo/repo/blobs/sha256:.*$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello\n".to_vec()))
        .mount(&server)
        .await;

    let mut registry = Registry::new().insecure(true);
    let reference = reference_for(&server);
    let outdir = tempfile::TempDir::new().unwrap();
    registry.pull_files(&reference, outdir.path(), false).await.unwrap();

    let content = std::fs::read(outdir.path().join("hello.txt")).unwrap();
    assert_eq!(content, b"hello\n");
}

#[tokio::test]
async fn upload_blob_synthesizes_success_for_rejected_empty_blob() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path_regex(r"^/v2/demo/repo/blobs/sha256:.*$"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/demo/repo/blobs/uploads/"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", "/v2/demo/repo/blobs/uploads/abc"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/demo/repo/blobs/uploads/abc"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let dir = tempfile::TempDir::new().unwrap();
    let blob_path = dir.path().join("empty.bin");
    std::fs::write(&blob_path, b"").unwrap();

    let descriptor = Descriptor {
        media_type: BLOB_MEDIA_TYPE.to_string(),
        size: 0,
        digest: BLANK_HASH.to_string(),
        annotations: std::collections::BTreeMap::new(),
    };

    let mut registry = Registry::new().insecure(true);
    let reference = reference_for(&server);
    registry
        .upload_blob(&reference, &descriptor, &blob_path, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn upload_blob_propagates_error_for_non_blank_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path_regex(r"^/v2/demo/repo/blobs/sha256:.*$"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/demo/repo/blobs/uploads/"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", "/v2/demo/repo/blobs/uploads/abc"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/demo/repo/blobs/uploads/abc"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let dir = tempfile::TempDir::new().unwrap();
    let blob_path = dir.path().join("data.bin");
    std::fs::write(&blob_path, b"hello\n").unwrap();

    let descriptor = Descriptor {
        media_type: BLOB_MEDIA_TYPE.to_string(),
        size: 6,
        digest: "sha256:5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03".to_string(),
        annotations: std::collections::BTreeMap::new(),
    };

    let mut registry = Registry::new().insecure(true);
    let reference = reference_for(&server);
    let err = registry
        .upload_blob(&reference, &descriptor, &blob_path, None)
        .await
        .unwrap_err();
    assert!(matches!(err, oras_core::Error::ProtocolError { .. }));
}
