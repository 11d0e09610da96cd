//! Test fixtures for generating request bodies and test data.

use super::TestServer;
use axum::http::StatusCode;
use serde_json::json;

/// Random bytes, which no compressor can shrink.
#[allow(dead_code)]
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::Rng::fill(&mut rand::rng(), &mut data[..]);
    data
}

/// Highly compressible text of at least `len` bytes.
#[allow(dead_code)]
pub fn compressible_text(len: usize) -> Vec<u8> {
    let line = b"courier stores files and hands out short codes for them.\n";
    line.iter().copied().cycle().take(len).collect()
}

const BOUNDARY: &str = "courier-test-boundary";

/// Minimal multipart/form-data builder.
#[derive(Default)]
pub struct Multipart {
    body: Vec<u8>,
}

#[allow(dead_code)]
impl Multipart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, filename: &str, content_type: &str, data: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    /// Content-Type header value and encoded body.
    pub fn finish(mut self) -> (String, Vec<u8>) {
        self.body
            .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        (
            format!("multipart/form-data; boundary={BOUNDARY}"),
            self.body,
        )
    }
}

/// Open a chunked session and return its id.
#[allow(dead_code)]
pub async fn init_upload(
    server: &TestServer,
    upload_id: Option<&str>,
    filename: &str,
    total_chunks: u32,
    file_size: u64,
) -> String {
    let mut body = json!({
        "filename": filename,
        "totalChunks": total_chunks,
        "fileSize": file_size,
        "mimeType": "text/plain",
    });
    if let Some(id) = upload_id {
        body["uploadId"] = json!(id);
    }
    let (status, body) = server.json("POST", "/api/upload/init", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "init failed: {body}");
    body["uploadId"].as_str().unwrap().to_string()
}

/// Upload one chunk and return the status and reply.
#[allow(dead_code)]
pub async fn send_chunk(
    server: &TestServer,
    upload_id: &str,
    index: u32,
    data: &[u8],
) -> (StatusCode, serde_json::Value) {
    let form = Multipart::new()
        .text("uploadId", upload_id)
        .text("chunkIndex", &index.to_string())
        .file("chunk", "blob", "application/octet-stream", data);
    server.multipart("/api/upload/chunk", form).await
}

/// Upload `chunks` in the given order, then complete the session.
#[allow(dead_code)]
pub async fn chunked_upload(
    server: &TestServer,
    filename: &str,
    chunks: &[impl AsRef<[u8]>],
    order: &[u32],
    compress: bool,
) -> serde_json::Value {
    let size: usize = chunks.iter().map(|c| c.as_ref().len()).sum();
    let id = init_upload(server, None, filename, chunks.len() as u32, size as u64).await;
    for &index in order {
        let (status, body) = send_chunk(server, &id, index, chunks[index as usize].as_ref()).await;
        assert_eq!(status, StatusCode::OK, "chunk {index} failed: {body}");
    }
    let (status, body) = server
        .json(
            "POST",
            "/api/upload/complete",
            Some(json!({ "uploadId": id, "compress": compress })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "complete failed: {body}");
    body
}
