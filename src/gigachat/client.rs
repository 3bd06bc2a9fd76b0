use super::types::{
    AccessToken, Chat, ChatCompletion, ChatCompletionChunk, FileUpload, Models, Token, UploadedFile,
};
use super::{ChunkStream, VendorApi};
use crate::config::{GigaChatConfig, GigaChatSecrets};
use crate::error::{AdapterError, Result};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use std::time::Duration;
use tokio::sync::RwLock;

/// Tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_MARGIN_MS: i64 = 60_000;

#[derive(Debug, Clone)]
enum AuthMethod {
    Static(String),
    Credentials {
        credentials: String,
        scope: String,
        auth_url: String,
    },
    Password {
        user: String,
        password: String,
    },
    Unconfigured,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at_ms: i64,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at_ms - chrono::Utc::now().timestamp_millis() > TOKEN_EXPIRY_MARGIN_MS
    }
}

pub struct GigaChatClient {
    http: reqwest::Client,
    base_url: String,
    auth: AuthMethod,
    token: RwLock<Option<CachedToken>>,
    /// When set, replaces the model named in every chat request.
    model: Option<String>,
}

impl GigaChatClient {
    /// Build a client with explicit transport settings: timeout, TLS roots,
    /// client identity and HTTP/2 mode all come from `config`.
    pub fn new(config: &GigaChatConfig, secrets: GigaChatSecrets) -> Result<Self> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs));

        if !config.verify_ssl_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(ref ca_path) = config.ca_bundle_file {
            let pem = std::fs::read(ca_path).map_err(|e| {
                AdapterError::config(format!("Failed to read CA bundle {}: {}", ca_path.display(), e))
            })?;
            for cert in reqwest::Certificate::from_pem_bundle(&pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        match (&config.cert_file, &config.key_file) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path)?;
                let key = std::fs::read(key_path)?;
                builder = builder.identity(reqwest::Identity::from_pkcs8_pem(&cert, &key)?);
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(AdapterError::config(
                    "gigachat.cert_file and gigachat.key_file must be set together",
                ));
            }
            (None, None) => {}
        }

        if config.http2_prior_knowledge {
            builder = builder.http2_prior_knowledge();
        }

        let auth = if let Some(token) = secrets.access_token {
            AuthMethod::Static(token)
        } else if let Some(credentials) = secrets.credentials {
            AuthMethod::Credentials {
                credentials,
                scope: config.scope.clone(),
                auth_url: config.auth_url.clone(),
            }
        } else if let (Some(user), Some(password)) = (config.user.clone(), secrets.password) {
            AuthMethod::Password { user, password }
        } else {
            AuthMethod::Unconfigured
        };

        Ok(Self {
            http: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth,
            token: RwLock::new(None),
            model: config.model.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn outgoing_chat(&self, chat: &Chat, stream: bool) -> Chat {
        let mut body = chat.clone();
        if let Some(ref model) = self.model {
            body.model = model.clone();
        }
        body.stream = Some(stream);
        body
    }

    /// Obtain a valid access token, fetching a new one if the cached token
    /// is missing or about to expire.
    pub async fn access_token(&self) -> Result<String> {
        if let AuthMethod::Static(ref token) = self.auth {
            return Ok(token.clone());
        }

        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.value.clone());
            }
        }

        let mut slot = self.token.write().await;
        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.value.clone());
            }
        }

        let fresh = self.fetch_token().await?;
        let value = fresh.value.clone();
        *slot = Some(fresh);
        Ok(value)
    }

    async fn fetch_token(&self) -> Result<CachedToken> {
        match &self.auth {
            AuthMethod::Static(token) => Ok(CachedToken {
                value: token.clone(),
                expires_at_ms: i64::MAX,
            }),
            AuthMethod::Credentials {
                credentials,
                scope,
                auth_url,
            } => {
                tracing::debug!(auth_url = %auth_url, scope = %scope, "Requesting GigaChat access token");
                let response = self
                    .http
                    .post(auth_url)
                    .header(AUTHORIZATION, format!("Basic {credentials}"))
                    .header("RqUID", uuid::Uuid::new_v4().to_string())
                    .header(ACCEPT, "application/json")
                    .form(&[("scope", scope.as_str())])
                    .send()
                    .await
                    .map_err(|e| AdapterError::auth(format!("token request failed: {e}")))?;

                let response = auth_status(response).await?;
                let token: AccessToken = response
                    .json()
                    .await
                    .map_err(|e| AdapterError::auth(format!("invalid token response: {e}")))?;
                Ok(CachedToken {
                    value: token.access_token,
                    expires_at_ms: token.expires_at,
                })
            }
            AuthMethod::Password { user, password } => {
                tracing::debug!(user = %user, "Requesting GigaChat token with user/password");
                let response = self
                    .http
                    .post(format!("{}/token", self.base_url))
                    .basic_auth(user, Some(password))
                    .send()
                    .await
                    .map_err(|e| AdapterError::auth(format!("token request failed: {e}")))?;

                let response = auth_status(response).await?;
                let token: Token = response
                    .json()
                    .await
                    .map_err(|e| AdapterError::auth(format!("invalid token response: {e}")))?;
                Ok(CachedToken {
                    value: token.tok,
                    expires_at_ms: token.exp,
                })
            }
            AuthMethod::Unconfigured => Err(AdapterError::auth(
                "no GigaChat credentials, access token or user/password configured",
            )),
        }
    }

    /// Fail on 4xx/5xx. A 401 drops the cached token so the next call re-authenticates.
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status().as_u16();
        if status < 400 {
            return Ok(response);
        }

        if status == 401 {
            *self.token.write().await = None;
        }

        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status, body = %truncate(&body, 300), "GigaChat returned an error");
        Err(AdapterError::vendor(status, truncate(&body, 500)))
    }
}

async fn auth_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AdapterError::auth(format!(
        "auth endpoint returned {}: {}",
        status.as_u16(),
        truncate(&body, 300)
    )))
}

#[async_trait]
impl VendorApi for GigaChatClient {
    async fn models(&self) -> Result<Models> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        let response = self.check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn chat(&self, chat: &Chat) -> Result<ChatCompletion> {
        let token = self.access_token().await?;
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.outgoing_chat(chat, false);
        tracing::debug!(url = %url, model = %body.model, messages = body.messages.len(), "POST chat");

        let response = self.http.post(&url).bearer_auth(token).json(&body).send().await?;
        let response = self.check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn stream(&self, chat: &Chat) -> Result<ChunkStream> {
        let token = self.access_token().await?;
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.outgoing_chat(chat, true);
        tracing::debug!(url = %url, model = %body.model, "POST chat (streaming)");

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-store")
            .json(&body)
            .send()
            .await?;
        let response = self.check_status(response).await?;

        let events = response.bytes_stream().eventsource();

        let chunks = async_stream::stream! {
            tokio::pin!(events);

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(ev) => ev,
                    Err(e) => {
                        yield Err(AdapterError::other(format!("GigaChat stream error: {e}")));
                        break;
                    }
                };

                let data = event.data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    break;
                }

                match serde_json::from_str::<ChatCompletionChunk>(data) {
                    Ok(chunk) => yield Ok(chunk),
                    Err(e) => {
                        tracing::warn!(error = %e, data = %truncate(data, 300), "Unparseable GigaChat chunk");
                        yield Err(AdapterError::other(format!("invalid GigaChat chunk: {e}")));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(chunks))
    }

    async fn upload_file(&self, upload: FileUpload) -> Result<UploadedFile> {
        let token = self.access_token().await?;
        let size = upload.data.len();
        let part = reqwest::multipart::Part::bytes(upload.data)
            .file_name(upload.filename.clone())
            .mime_str(&upload.content_type)?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("purpose", upload.purpose);

        tracing::debug!(filename = %upload.filename, bytes = size, "Uploading file to GigaChat");

        let response = self
            .http
            .post(format!("{}/files", self.base_url))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        let response = self.check_status(response).await?;
        Ok(response.json().await?)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
