//! File upload integration tests, parsed back with a real multipart reader.

mod common;

use anyhow::Result;
use bytes::Bytes;
use conduit_client::{Error, MultipartForm};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use common::TestServer;

#[derive(Debug, PartialEq)]
struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

/// Parse the body of the `index`th request the mock server received.
async fn received_parts(test: &TestServer, index: usize) -> Result<Vec<Part>> {
    let requests = test.server.received_requests().await.unwrap_or_default();
    let request = requests.get(index).expect("upload request");
    let content_type = request
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let boundary = multer::parse_boundary(content_type)?;

    let body = Bytes::from(request.body.clone());
    let stream = futures::stream::once(async move { Ok::<_, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut parts = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(|mime| mime.to_string());
        let data = field.bytes().await?;
        parts.push(Part {
            name,
            filename,
            content_type,
            data,
        });
    }
    Ok(parts)
}

#[tokio::test]
async fn test_upload_file_with_fields() -> Result<()> {
    let test = TestServer::start_with(|builder| builder.token("tok").max_retries(0)).await?;
    Mock::given(method("POST"))
        .and(path("/v1/files/upload"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "file-1"})))
        .expect(1)
        .mount(&test.server)
        .await;

    let content: Vec<u8> = vec![0, 159, 146, 150, b'\r', b'\n', 255];
    let response = test
        .client
        .upload(
            "files/upload",
            "file",
            "report.bin",
            content.clone(),
            [("user", "abc-123"), ("purpose", "dataset")],
        )
        .await?;
    assert_eq!(response.status(), 201);
    assert_eq!(response.json::<serde_json::Value>()?["id"], "file-1");

    let parts = received_parts(&test, 0).await?;
    assert_eq!(parts.len(), 3);

    let requests = test.server.received_requests().await.unwrap_or_default();
    let content_type = requests[0].headers.get("content-type").unwrap().to_str()?;
    assert!(content_type.starts_with("multipart/form-data; boundary="));
    assert_eq!(requests[0].headers.get_all("content-type").iter().count(), 1);

    assert_eq!(parts[0].name, "file");
    assert_eq!(parts[0].filename.as_deref(), Some("report.bin"));
    assert_eq!(parts[0].content_type.as_deref(), Some("application/octet-stream"));
    assert_eq!(parts[0].data.as_ref(), &content[..]);

    assert_eq!(parts[1].name, "user");
    assert_eq!(parts[1].filename, None);
    assert_eq!(parts[1].data.as_ref(), b"abc-123");
    assert_eq!(parts[2].name, "purpose");
    assert_eq!(parts[2].data.as_ref(), b"dataset");
    Ok(())
}

#[tokio::test]
async fn test_upload_form_is_resent_on_retry() -> Result<()> {
    let test = TestServer::start(1).await?;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&test.server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&test.server)
        .await;

    let form = MultipartForm::new("file", "a.txt", "payload").text("k", "v");
    test.client.upload_form("files", &form).await?;

    let requests = test.server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 2);

    let first = received_parts(&test, 0).await?;
    let retried = received_parts(&test, 1).await?;
    assert_eq!(first.len(), 2);
    assert_eq!(first, retried);
    assert_eq!(retried[0].data.as_ref(), b"payload");
    Ok(())
}

#[tokio::test]
async fn test_invalid_filename_never_reaches_server() -> Result<()> {
    let test = TestServer::start(0).await?;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&test.server)
        .await;

    let err = test
        .client
        .upload("files", "file", "bad\nname.txt", "x", Vec::<(String, String)>::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Encoding(_)));
    Ok(())
}
