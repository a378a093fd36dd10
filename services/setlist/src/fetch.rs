//!
//! src/fetch.rs  Andrew Belles  Oct 17th, 2026
//!
//! Defines the signed client for the ACRCloud identify endpoint,
//! the typed shape of its response, and the retry policy around it
//!

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use reqwest::{Client, header, multipart, redirect, RequestBuilder};
use serde::Deserialize;
use sha1::Sha1;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::capture::AudioClip;
use crate::config::{AcrCloudConfig, HttpConfig, RetryConfig};
use crate::errors::SetListError;

type HmacSha1 = Hmac<Sha1>;

pub const IDENTIFY_PATH: &str = "/v1/identify";

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder {
    let builder = Client::builder()
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize));

    match http.timeout {
        Some(timeout) => builder.timeout(timeout),
        None => builder
    }
}

pub fn base_client(http: &HttpConfig) -> Result<Client, SetListError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    client_helper(http)
        .default_headers(h)
        .build()
        .map_err(|e| SetListError::Network(format!("build client: {e}")))
}

///
/// Response shape of /v1/identify
///
#[derive(Debug, Clone, Deserialize)]
pub struct AcrStatus {
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub code: i64
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcrArtist {
    #[serde(default)]
    pub name: Option<String>
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcrAlbum {
    #[serde(default)]
    pub name: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcrMusic {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artists: Vec<AcrArtist>,
    #[serde(default)]
    pub album: Option<AcrAlbum>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub score: Option<f64>
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcrMetadata {
    #[serde(default)]
    pub music: Vec<serde_json::Value>
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcrResponse {
    pub status: AcrStatus,
    #[serde(default)]
    pub metadata: Option<AcrMetadata>
}

/// Best-effort metadata for one clip, as merged into a set
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub title: String,
    pub artist_names: Vec<String>,
    pub album: Option<String>,
    pub release_date: Option<String>,
    pub score: u8,
    pub payload: serde_json::Value
}

impl Candidate {
    pub fn primary_artist(&self) -> &str {
        self.artist_names
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// One answer from the recognition service for one clip
#[derive(Debug, Clone)]
pub struct Recognition {
    pub status: AcrStatus,
    pub music: Vec<serde_json::Value>,
    pub recognized_at: chrono::DateTime<Utc>
}

impl Recognition {
    pub fn from_json(value: serde_json::Value) -> Result<Self, SetListError> {
        let response: AcrResponse = serde_json::from_value(value)?;
        let music = response.metadata.map(|m| m.music).unwrap_or_default();
        Ok( Self { status: response.status, music, recognized_at: Utc::now() } )
    }

    pub fn no_match() -> Self {
        Self {
            status: AcrStatus { msg: "No result".to_string(), code: 1001 },
            music: Vec::new(),
            recognized_at: Utc::now()
        }
    }

    /// First candidate of the music list, if it carries the metadata a
    /// track needs. Anything less is a miss, not an error.
    pub fn primary(&self) -> Result<Option<Candidate>, SetListError> {
        let Some(raw) = self.music.first() else {
            return Ok(None);
        };

        let music: AcrMusic = serde_json::from_value(raw.clone())?;
        let title = music.title
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| SetListError::DataInvariant("music entry without title".into()))?;

        let artist_names: Vec<String> = music.artists.into_iter()
            .filter_map(|a| a.name)
            .filter(|n| !n.trim().is_empty())
            .collect();
        if artist_names.is_empty() {
            return Err(SetListError::DataInvariant(
                format!("music entry '{title}' without artists")
            ));
        }

        let score = music.score.unwrap_or(0.0).clamp(0.0, 100.0).round() as u8;

        Ok(Some( Candidate {
            title,
            artist_names,
            album: music.album.and_then(|a| a.name),
            release_date: music.release_date,
            score,
            payload: raw.clone()
        }))
    }
}

/// Anything that can put a name on a clip
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn identify(&self, clip: &AudioClip) -> Result<Recognition, SetListError>;
}

/// Simple function to generate random wait for send_with_retry
fn generate_backoff(retry: &RetryConfig, attempt: u8, rng: &mut SmallRng) -> Duration {
    let base = retry.base_backoff.as_millis() as u64;
    let exp = (1_u64 << attempt.min(6)) * base;
    let jitter = if retry.jitter { rng.gen_range(50..=200) as u64 } else { 0 };
    Duration::from_millis(exp + jitter)
}

/// Sends a freshly built request until it succeeds, fails hard, or
/// retries run out. The builder is called per attempt since multipart
/// bodies cannot be cloned.
async fn send_with_retry<F>(build: F, retry: &RetryConfig) ->
    Result<serde_json::Value, SetListError>
where
    F: Fn() -> Result<RequestBuilder, SetListError>
{
    let mut rng = SmallRng::from_entropy();
    let mut attempt = 0_u8;
    loop {
        match build()?.send().await {
            Ok(resp) => {
                if resp.status().is_success() {
                    let v = resp.json::<serde_json::Value>().await?;
                    return Ok(v);
                }
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                let retryable = retry.retryable_statuses.contains(&status.as_u16());
                if !retryable || attempt + 1 >= retry.max_attempts {
                    return Err(SetListError::Network(
                        format!("status {status} after {attempt} retries: {body}")
                    ));
                }
                let backoff = generate_backoff(retry, attempt, &mut rng);
                warn!(status = %status, backoff = ?backoff.as_millis(), "http.retry");
                sleep(backoff).await;
                attempt += 1;
            },
            Err(e) => {
                if attempt + 1 >= retry.max_attempts {
                    return Err(e.into());
                }
                let backoff = generate_backoff(retry, attempt, &mut rng);
                warn!(error = %e, backoff = ?backoff.as_millis(), "http.retry.error");
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct AcrCloudClient {
    pub http: Client,
    pub cfg: AcrCloudConfig,
    pub retry: RetryConfig
}

impl AcrCloudClient {
    pub fn new(http_config: &HttpConfig, cfg: &AcrCloudConfig) ->
        Result<Self, SetListError> {

        let http = base_client(http_config)?;
        Ok( Self {
            http,
            cfg: cfg.clone(),
            retry: http_config.retry.clone()
        })
    }

    pub fn string_to_sign(&self, timestamp: i64) -> String {
        format!(
            "POST\n{IDENTIFY_PATH}\n{}\n{}\n{}\n{timestamp}",
            self.cfg.access_key, self.cfg.data_type, self.cfg.signature_version
        )
    }

    /// base64(HMAC-SHA1(secret, string_to_sign))
    pub fn sign(&self, string_to_sign: &str) -> Result<String, SetListError> {
        let mut mac = HmacSha1::new_from_slice(self.cfg.access_secret.as_bytes())
            .map_err(|e| SetListError::Config(format!("invalid access secret: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// POST /v1/identify
    pub fn identify_request(&self, clip: &AudioClip, timestamp: i64) ->
        Result<RequestBuilder, SetListError> {

        let signature = self.sign(&self.string_to_sign(timestamp))?;
        let url = self.cfg.base_url.join(IDENTIFY_PATH.trim_start_matches('/'))
            .map_err(|e| SetListError::Config(format!("identify url: {e}")))?;

        let sample = multipart::Part::bytes(clip.bytes.clone())
            .file_name(clip.file_name.clone())
            .mime_str(&clip.mime)
            .map_err(|e| SetListError::Parse(format!("clip mime {}: {e}", clip.mime)))?;

        let form = multipart::Form::new()
            .part("sample", sample)
            .text("access_key", self.cfg.access_key.clone())
            .text("data_type", self.cfg.data_type.clone())
            .text("signature_version", self.cfg.signature_version.clone())
            .text("signature", signature)
            .text("sample_bytes", clip.bytes.len().to_string())
            .text("timestamp", timestamp.to_string());

        Ok(self.http.post(url).multipart(form))
    }
}

#[async_trait]
impl Recognizer for AcrCloudClient {
    async fn identify(&self, clip: &AudioClip) -> Result<Recognition, SetListError> {
        debug!(bytes = clip.bytes.len(), file = %clip.file_name, "acr.identify");
        let value = send_with_retry(
            || self.identify_request(clip, Utc::now().timestamp()),
            &self.retry
        ).await?;

        let recognition = Recognition::from_json(value)?;
        debug!(
            code = recognition.status.code,
            msg = %recognition.status.msg,
            candidates = recognition.music.len(),
            "acr.identify.done"
        );
        Ok(recognition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::build_config;

    fn client() -> AcrCloudClient {
        let lookup = |key: &str| match key {
            "ACR_ACCESS_KEY" => Some("ak".to_string()),
            "ACR_ACCESS_SECRET" => Some("secret".to_string()),
            "ACR_HOST" => Some("identify-eu-west-1.acrcloud.com".to_string()),
            _ => None
        };
        let cfg = build_config(&lookup).unwrap();
        AcrCloudClient::new(&cfg.http, cfg.require_acrcloud().unwrap()).unwrap()
    }

    fn clip() -> AudioClip {
        AudioClip {
            bytes: vec![0_u8; 64],
            file_name: "chunk-1.wav".to_string(),
            mime: "audio/wav".to_string(),
            captured_at: Utc::now()
        }
    }

    #[test]
    fn string_to_sign_layout() {
        let c = client();
        assert_eq!(
            c.string_to_sign(1_700_000_000),
            "POST\n/v1/identify\nak\naudio\n1\n1700000000"
        );
    }

    #[test]
    fn signature_is_base64_hmac_sha1() -> Result<(), SetListError> {
        let c = client();
        let sig = c.sign(&c.string_to_sign(1_700_000_000))?;
        assert_eq!(sig, "iMyrAl3MOp8jdcUO7jQ9+PZw2zY=");
        Ok(())
    }

    #[test]
    fn identify_request_targets_identify_endpoint() -> Result<(), SetListError> {
        let c = client();
        let request = c.identify_request(&clip(), 1_700_000_000)?
            .build()
            .map_err(SetListError::from)?;

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(
            request.url().as_str(),
            "https://identify-eu-west-1.acrcloud.com/v1/identify"
        );
        let content_type = request.headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("multipart/form-data"));
        Ok(())
    }

    #[test]
    fn primary_candidate_from_success_response() -> Result<(), SetListError> {
        let value = serde_json::json!({
            "status": { "msg": "Success", "code": 0 },
            "metadata": { "music": [
                {
                    "title": "Song A",
                    "artists": [{ "name": "X" }, { "name": "Y" }],
                    "album": { "name": "Album" },
                    "release_date": "2020-01-01",
                    "score": 85
                },
                { "title": "Other", "artists": [{ "name": "Z" }], "score": 99 }
            ]}
        });
        let recognition = Recognition::from_json(value)?;
        let candidate = recognition.primary()?.expect("candidate");

        assert_eq!(candidate.title, "Song A");
        assert_eq!(candidate.artist_names, vec!["X".to_string(), "Y".to_string()]);
        assert_eq!(candidate.primary_artist(), "X");
        assert_eq!(candidate.album.as_deref(), Some("Album"));
        assert_eq!(candidate.score, 85);
        assert_eq!(candidate.payload["release_date"], "2020-01-01");
        Ok(())
    }

    #[test]
    fn no_result_response_has_no_candidate() -> Result<(), SetListError> {
        let value = serde_json::json!({
            "status": { "msg": "No result", "code": 1001 }
        });
        let recognition = Recognition::from_json(value)?;
        assert!(recognition.primary()?.is_none());
        assert!(Recognition::no_match().primary()?.is_none());
        Ok(())
    }

    #[test]
    fn music_without_artists_violates_invariant() -> Result<(), SetListError> {
        let value = serde_json::json!({
            "status": { "msg": "Success", "code": 0 },
            "metadata": { "music": [{ "title": "Nameless", "artists": [], "score": 90 }] }
        });
        let recognition = Recognition::from_json(value)?;
        assert!(matches!(recognition.primary(), Err(SetListError::DataInvariant(_))));
        Ok(())
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let retry = RetryConfig { jitter: false, ..RetryConfig::default() };
        let mut rng = SmallRng::seed_from_u64(7);
        let first = generate_backoff(&retry, 0, &mut rng);
        let third = generate_backoff(&retry, 2, &mut rng);
        assert_eq!(first, Duration::from_millis(250));
        assert_eq!(third, Duration::from_millis(1000));
    }

    /// Replies to each connection with the next scripted status and body,
    /// keeping every request body it read
    struct ScriptedServer {
        base_url: url::Url,
        bodies: std::sync::Arc<std::sync::Mutex<Vec<String>>>
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> std::io::Result<String> {
        use tokio::io::AsyncReadExt;

        let mut buf = Vec::new();
        let mut chunk = [0_u8; 4096];
        let split = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(String::new());
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(at) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break at + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..split]).to_ascii_lowercase();
        let length = head.lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok());
        let chunked = head.contains("transfer-encoding: chunked");

        loop {
            let body = &buf[split..];
            let done = match length {
                Some(len) => body.len() >= len,
                None => !chunked || body.ends_with(b"0\r\n\r\n")
            };
            if done {
                break;
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(String::from_utf8_lossy(&buf[split..]).into_owned())
    }

    async fn scripted(replies: Vec<(u16, &'static str)>) -> ScriptedServer {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bodies = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = bodies.clone();

        tokio::spawn(async move {
            for (status, body) in replies {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                let request = read_request(&mut stream).await.unwrap_or_default();
                seen.lock().unwrap().push(request);
                let reply = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        ScriptedServer {
            base_url: url::Url::parse(&format!("http://{addr}/")).unwrap(),
            bodies
        }
    }

    fn local_client(server: &ScriptedServer, retry: RetryConfig) -> AcrCloudClient {
        let acr = AcrCloudConfig {
            host: "127.0.0.1".to_string(),
            access_key: "ak".to_string(),
            access_secret: "secret".to_string(),
            base_url: server.base_url.clone(),
            data_type: "audio".to_string(),
            signature_version: "1".to_string()
        };
        let http = HttpConfig { retry, ..HttpConfig::default() };
        let mut c = AcrCloudClient::new(&http, &acr).unwrap();
        // loopback only, whatever proxy the environment names
        c.http = client_helper(&http).no_proxy().build().unwrap();
        c
    }

    /// Value of one text field of a multipart body
    fn form_field(body: &str, name: &str) -> Option<String> {
        let marker = format!("name=\"{name}\"");
        let rest = &body[body.find(&marker)? + marker.len()..];
        let value = &rest[rest.find("\r\n\r\n")? + 4..];
        Some(value[..value.find("\r\n")?].to_string())
    }

    const SUCCESS: &str = r#"{"status":{"msg":"Success","code":0},"metadata":{"music":[{"title":"Song A","artists":[{"name":"X"}],"score":88}]}}"#;

    #[tokio::test]
    async fn retry_resigns_each_attempt() -> Result<(), SetListError> {
        let server = scripted(vec![(503, "busy"), (200, SUCCESS)]).await;
        let c = local_client(&server, RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1000),
            jitter: false,
            ..RetryConfig::default()
        });

        let recognition = c.identify(&clip()).await?;
        assert_eq!(recognition.primary()?.map(|m| m.score), Some(88));

        let bodies = server.bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 2);
        let mut stamps = Vec::new();
        for body in &bodies {
            let ts: i64 = form_field(body, "timestamp").and_then(|t| t.parse().ok())
                .expect("timestamp field");
            let signature = form_field(body, "signature").expect("signature field");
            assert_eq!(signature, c.sign(&c.string_to_sign(ts))?, "signed for its own timestamp");
            assert_eq!(form_field(body, "sample_bytes").as_deref(), Some("64"));
            stamps.push(ts);
        }
        assert!(stamps[1] > stamps[0], "retry carries a fresh timestamp: {stamps:?}");
        Ok(())
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = scripted(vec![(400, r#"{"error":"bad sample"}"#), (200, SUCCESS)]).await;
        let c = local_client(&server, RetryConfig {
            base_backoff: Duration::from_millis(10),
            ..RetryConfig::default()
        });

        let res = c.identify(&clip()).await;
        match res {
            Err(SetListError::Network(msg)) => assert!(msg.contains("400"), "{msg}"),
            other => panic!("expected a network error, got {other:?}")
        }
        assert_eq!(server.bodies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let server = scripted(vec![(503, "busy"), (503, "busy"), (503, "busy"), (200, SUCCESS)]).await;
        let c = local_client(&server, RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(10),
            jitter: false,
            ..RetryConfig::default()
        });

        let res = c.identify(&clip()).await;
        match res {
            Err(SetListError::Network(msg)) => {
                assert!(msg.contains("503"), "{msg}");
                assert!(msg.contains("after 2 retries"), "{msg}");
            }
            other => panic!("expected a network error, got {other:?}")
        }
        assert_eq!(server.bodies.lock().unwrap().len(), 3);
    }
}
