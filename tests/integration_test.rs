use async_trait::async_trait;
use futures::stream;
use gigachat_adapter::cache::KvStore;
use gigachat_adapter::gigachat::types::*;
use gigachat_adapter::gigachat::{ChunkStream, VendorApi};
use gigachat_adapter::logging::SharedLogger;
use gigachat_adapter::{build_router, AdapterError, AdapterService, AppState, Result};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const TOKEN: &str = "test-bearer";
const PIXEL: &str = "data:image/png;base64,aGVsbG8=";

/// In-process stand-in for GigaChat that records what it was asked.
#[derive(Default)]
struct FakeGigaChat {
    uploads: AtomicUsize,
    last_chat: Mutex<Option<Chat>>,
    last_upload: Mutex<Option<FileUpload>>,
    fail_models: bool,
    fail_stream_early: bool,
}

fn chunk(content: &str, finish_reason: Option<&str>) -> ChatCompletionChunk {
    ChatCompletionChunk {
        choices: vec![ChoicesChunk {
            delta: MessagesChunk {
                role: Some("assistant".to_string()),
                content: Some(content.to_string()),
                function_call: None,
            },
            index: 0,
            finish_reason: finish_reason.map(String::from),
        }],
        created: 1_706_096_247,
        model: "GigaChat:1.0.26.20".to_string(),
        usage: None,
        object: "chat.completion".to_string(),
    }
}

#[async_trait]
impl VendorApi for FakeGigaChat {
    async fn models(&self) -> Result<Models> {
        if self.fail_models {
            return Err(AdapterError::vendor(503, "GigaChat unavailable"));
        }
        Ok(Models {
            data: vec![
                Model {
                    id: "GigaChat".to_string(),
                    object: "model".to_string(),
                    owned_by: "salutedevices".to_string(),
                },
                Model {
                    id: "GigaChat-Pro".to_string(),
                    object: "model".to_string(),
                    owned_by: "salutedevices".to_string(),
                },
            ],
            object: "list".to_string(),
        })
    }

    async fn chat(&self, chat: &Chat) -> Result<ChatCompletion> {
        *self.last_chat.lock().unwrap() = Some(chat.clone());
        Ok(ChatCompletion {
            choices: vec![Choices {
                message: Messages {
                    role: "assistant".to_string(),
                    content: "pong".to_string(),
                    ..Messages::default()
                },
                index: 0,
                finish_reason: Some("stop".to_string()),
            }],
            created: 1_706_096_247,
            model: "GigaChat:1.0.26.20".to_string(),
            usage: Usage {
                prompt_tokens: 5,
                completion_tokens: 1,
                total_tokens: 6,
            },
            object: "chat.completion".to_string(),
        })
    }

    async fn stream(&self, chat: &Chat) -> Result<ChunkStream> {
        *self.last_chat.lock().unwrap() = Some(chat.clone());
        if self.fail_stream_early {
            return Ok(Box::pin(stream::iter(vec![Err(AdapterError::vendor(
                500,
                "upstream exploded",
            ))])));
        }
        Ok(Box::pin(stream::iter(vec![
            Ok(chunk("Hel", None)),
            Ok(chunk("lo", None)),
            Ok(chunk("", Some("stop"))),
        ])))
    }

    async fn upload_file(&self, upload: FileUpload) -> Result<UploadedFile> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        let uploaded = UploadedFile {
            id: format!("file-{n}"),
            object: "file".to_string(),
            bytes: upload.data.len() as u64,
            created_at: 1_735_000_000,
            filename: upload.filename.clone(),
            purpose: upload.purpose.clone(),
        };
        *self.last_upload.lock().unwrap() = Some(upload);
        Ok(uploaded)
    }
}

async fn spawn_adapter(vendor: Arc<FakeGigaChat>, cache_path: &Path) -> String {
    let service = AdapterService::new(
        vendor,
        KvStore::open(cache_path),
        SharedLogger::in_memory(),
    );
    let state = Arc::new(AppState {
        service: Arc::new(service),
        bearer_token: TOKEN.to_string(),
        version: "test".to_string(),
        cors_allowed_origins: vec!["http://localhost:5173".to_string()],
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

fn hello_body(stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": "GigaChat",
        "stream": stream,
        "messages": [{"role": "user", "content": "ping"}],
    })
}

#[tokio::test]
async fn test_missing_bearer_token_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = Arc::new(FakeGigaChat::default());
    let base = spawn_adapter(vendor.clone(), &dir.path().join("kv.json")).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&hello_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "HTTP_EXCEPTION");
    assert_eq!(body["error"]["type"], "http");

    let resp = client
        .get(format!("{base}/v1/models"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert!(vendor.last_chat.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_adapter(Arc::new(FakeGigaChat::default()), &dir.path().join("kv.json")).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth(TOKEN)
        .header("Content-Type", "application/json")
        .body("{\"messages\": 42")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_non_streaming_chat() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = Arc::new(FakeGigaChat::default());
    let base = spawn_adapter(vendor.clone(), &dir.path().join("kv.json")).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth(TOKEN)
        .json(&hello_body(false))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 6);

    let chat = vendor.last_chat.lock().unwrap().clone().unwrap();
    assert_eq!(chat.messages.len(), 1);
    assert_eq!(chat.messages[0].content, "ping");
    assert_eq!(chat.stream, Some(false));
}

#[tokio::test]
async fn test_streaming_chat_ends_with_done() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_adapter(Arc::new(FakeGigaChat::default()), &dir.path().join("kv.json")).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth(TOKEN)
        .json(&hello_body(true))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");

    let text = resp.text().await.unwrap();
    assert!(text.ends_with("data: [DONE]\n\n"));

    let payloads: Vec<serde_json::Value> = text
        .split("\n\n")
        .filter_map(|e| e.strip_prefix("data: "))
        .filter(|p| *p != "[DONE]")
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    assert_eq!(payloads.len(), 3);
    assert_eq!(payloads[0]["object"], "chat.completion.chunk");
    assert_eq!(payloads[0]["choices"][0]["delta"]["content"], "Hel");
    assert_eq!(payloads[1]["choices"][0]["delta"]["content"], "lo");
    assert_eq!(payloads[2]["choices"][0]["finish_reason"], "stop");
    assert_eq!(payloads[0]["id"], payloads[2]["id"]);
}

#[tokio::test]
async fn test_streaming_failure_before_output_is_plain_error() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = Arc::new(FakeGigaChat {
        fail_stream_early: true,
        ..FakeGigaChat::default()
    });
    let base = spawn_adapter(vendor, &dir.path().join("kv.json")).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth(TOKEN)
        .json(&hello_body(true))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "HTTP_EXCEPTION");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("upstream exploded"));
}

#[tokio::test]
async fn test_models_list() {
    let dir = tempfile::tempdir().unwrap();
    let base = spawn_adapter(Arc::new(FakeGigaChat::default()), &dir.path().join("kv.json")).await;

    let resp = reqwest::Client::new()
        .get(format!("{base}/v1/models"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["id"], "GigaChat");
    assert_eq!(data[1]["owned_by"], "salutedevices");
    assert!(data.iter().all(|m| m["created"] == 1_735_689_600));
}

#[tokio::test]
async fn test_health_probes() {
    let dir = tempfile::tempdir().unwrap();
    let healthy = spawn_adapter(Arc::new(FakeGigaChat::default()), &dir.path().join("a.json")).await;
    let broken = spawn_adapter(
        Arc::new(FakeGigaChat {
            fail_models: true,
            ..FakeGigaChat::default()
        }),
        &dir.path().join("b.json"),
    )
    .await;
    let client = reqwest::Client::new();

    // No bearer token needed for probes
    let resp = client
        .get(format!("{broken}/health/liveness"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], "test");

    let resp = client
        .get(format!("{healthy}/health/readiness"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{broken}/health/readiness"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
}

#[tokio::test]
async fn test_file_upload_maps_purpose() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = Arc::new(FakeGigaChat::default());
    let base = spawn_adapter(vendor.clone(), &dir.path().join("kv.json")).await;

    let form = reqwest::multipart::Form::new()
        .text("purpose", "fine-tune")
        .part(
            "file",
            reqwest::multipart::Part::bytes(b"some notes".to_vec())
                .file_name("notes.txt")
                .mime_str("text/plain")
                .unwrap(),
        );

    let resp = reqwest::Client::new()
        .post(format!("{base}/files"))
        .bearer_auth(TOKEN)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "file-1");
    assert_eq!(body["object"], "file");
    assert_eq!(body["bytes"], 10);
    assert_eq!(body["filename"], "notes.txt");

    let upload = vendor.last_upload.lock().unwrap().clone().unwrap();
    assert_eq!(upload.purpose, "general");
    assert_eq!(upload.content_type, "text/plain");
    assert_eq!(upload.data, b"some notes");
}

#[tokio::test]
async fn test_file_upload_without_file_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = Arc::new(FakeGigaChat::default());
    let base = spawn_adapter(vendor.clone(), &dir.path().join("kv.json")).await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new().text("purpose", "assistants");
    let resp = client
        .post(format!("{base}/files"))
        .bearer_auth(TOKEN)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "No file uploaded");

    let form = reqwest::multipart::Form::new()
        .text("purpose", "homework")
        .part(
            "file",
            reqwest::multipart::Part::bytes(b"x".to_vec())
                .file_name("x.txt")
                .mime_str("text/plain")
                .unwrap(),
        );
    let resp = client
        .post(format!("{base}/files"))
        .bearer_auth(TOKEN)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(vendor.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_same_image_uploaded_once_across_requests_and_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("kv.json");
    let body = serde_json::json!({
        "model": "GigaChat",
        "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": "what is this?"},
                {"type": "image_url", "image_url": {"url": PIXEL}},
            ],
        }],
    });

    let vendor = Arc::new(FakeGigaChat::default());
    let base = spawn_adapter(vendor.clone(), &cache_path).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client
            .post(format!("{base}/v1/chat/completions"))
            .bearer_auth(TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }
    assert_eq!(vendor.uploads.load(Ordering::SeqCst), 1);

    let chat = vendor.last_chat.lock().unwrap().clone().unwrap();
    assert_eq!(chat.messages.len(), 2);
    assert_eq!(chat.messages[0].content, "what is this?");
    assert_eq!(chat.messages[1].attachments, Some(vec!["file-1".to_string()]));

    // A fresh adapter over the same cache file reuses the stored file id
    let fresh_vendor = Arc::new(FakeGigaChat::default());
    let fresh = spawn_adapter(fresh_vendor.clone(), &cache_path).await;
    let resp = client
        .post(format!("{fresh}/v1/chat/completions"))
        .bearer_auth(TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(fresh_vendor.uploads.load(Ordering::SeqCst), 0);
    let chat = fresh_vendor.last_chat.lock().unwrap().clone().unwrap();
    assert_eq!(chat.messages[1].attachments, Some(vec!["file-1".to_string()]));
}

#[tokio::test]
async fn test_invalid_image_data_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = Arc::new(FakeGigaChat::default());
    let base = spawn_adapter(vendor.clone(), &dir.path().join("kv.json")).await;

    let body = serde_json::json!({
        "messages": [{
            "role": "user",
            "content": [{"type": "image_url", "image_url": {"url": "data:image/png;base64,@@@"}}],
        }],
    });
    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .bearer_auth(TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
    assert_eq!(vendor.uploads.load(Ordering::SeqCst), 0);
}
