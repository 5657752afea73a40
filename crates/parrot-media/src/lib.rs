//! Parrot Media
//!
//! Attachment download and best-effort description. Every media kind degrades
//! independently: a failure on one attachment becomes a sentinel string and
//! never blocks the rest of the turn.

use base64::Engine;
use parrot_config::{MediaConfig, SttConfig};
use parrot_gateway::{ChatMessage, CompletionBackend, ModelError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "aac", "ogg", "oga", "opus"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "mkv"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "docx", "txt", "md", "pptx"];
const TEXT_DOCUMENT_EXTENSIONS: &[&str] = &["txt", "md"];

const CAPTION_MAX_TOKENS: u32 = 200;
const TRANSCRIPTION_MAX_TOKENS: u32 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download request: {0}")]
    Request(String),
    #[error("download HTTP {0}")]
    Status(u16),
    #[error("download exceeds the {limit} byte cap")]
    TooLarge { limit: u64 },
    #[error("download io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DescribeError {
    #[error("media io: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("external tool: {0}")]
    Tool(String),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("unsupported format")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Image,
    Video,
    Document,
}

impl MediaKind {
    pub fn tag(&self) -> &'static str {
        match self {
            MediaKind::Audio => "[audio]",
            MediaKind::Image => "[image]",
            MediaKind::Video => "[video]",
            MediaKind::Document => "[document]",
        }
    }

    pub fn sentinel(&self) -> &'static str {
        match self {
            MediaKind::Audio => "[audio unavailable]",
            MediaKind::Image => "[image unavailable]",
            MediaKind::Video => "[video unavailable]",
            MediaKind::Document => "[document unavailable]",
        }
    }

    /// Classify by local extension first, declared MIME second.
    pub fn classify(extension: Option<&str>, mime: Option<&str>) -> Option<Self> {
        if let Some(ext) = extension {
            let ext = ext.to_ascii_lowercase();
            if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
                return Some(MediaKind::Audio);
            }
            if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                return Some(MediaKind::Image);
            }
            if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
                return Some(MediaKind::Video);
            }
            if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
                return Some(MediaKind::Document);
            }
        }

        if let Some(mime) = mime {
            let mime = mime.to_ascii_lowercase();
            if mime.starts_with("audio") {
                return Some(MediaKind::Audio);
            }
            if mime.starts_with("image") {
                return Some(MediaKind::Image);
            }
            if mime.starts_with("video") {
                return Some(MediaKind::Video);
            }
            if mime.contains("pdf") || mime.contains("document") || mime.starts_with("text") {
                return Some(MediaKind::Document);
            }
        }

        None
    }
}

/// Map a declared Content-Type onto a filename extension.
fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    match essence.to_ascii_lowercase().as_str() {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "audio/mpeg" => Some("mp3"),
        "audio/ogg" => Some("ogg"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/mp4" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "video/mp4" => Some("mp4"),
        "video/webm" => Some("webm"),
        "video/quicktime" => Some("mov"),
        "application/pdf" => Some("pdf"),
        "text/plain" => Some("txt"),
        "text/markdown" => Some("md"),
        _ => None,
    }
}

/// Extension from the URL path suffix, query string excluded.
fn extension_from_url(raw_url: &str) -> Option<String> {
    let parsed = url::Url::parse(raw_url).ok()?;
    let path = parsed.path();
    let (_, suffix) = path.rsplit_once('.')?;
    let suffix = suffix.to_ascii_lowercase();
    if suffix.is_empty()
        || suffix.len() > 5
        || !suffix.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(suffix)
}

pub struct MediaFetcher {
    client: reqwest::Client,
    download_dir: PathBuf,
    max_download_bytes: u64,
}

impl MediaFetcher {
    pub fn new(config: &MediaConfig, download_dir: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            download_dir,
            max_download_bytes: config.max_download_bytes,
        }
    }

    /// Download a remote attachment to the local download directory, streamed
    /// chunk by chunk so the payload never sits in memory whole. Returns the
    /// local path; any network or IO failure is a `DownloadError` value,
    /// never a fault crossing the component boundary.
    pub async fn fetch(&self, url: &str) -> Result<PathBuf, DownloadError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }

        // A declared length over the cap saves reading the body at all.
        if let Some(length) = response.content_length() {
            if length > self.max_download_bytes {
                return Err(DownloadError::TooLarge {
                    limit: self.max_download_bytes,
                });
            }
        }

        // Extension resolution order: declared content-type, URL suffix, none.
        let extension = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(extension_for_content_type)
            .map(|ext| ext.to_string())
            .or_else(|| extension_from_url(url));

        let filename = match extension {
            Some(ext) => format!("{}.{}", uuid::Uuid::new_v4().simple(), ext),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let path = self.download_dir.join(filename);
        let mut file = tokio::fs::File::create(&path).await?;
        let mut written: u64 = 0;

        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(DownloadError::Request(e.to_string()));
                }
            };

            written += chunk.len() as u64;
            if written > self.max_download_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(DownloadError::TooLarge {
                    limit: self.max_download_bytes,
                });
            }

            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(DownloadError::Io(e));
            }
        }

        file.flush().await?;

        tracing::debug!(url, path = %path.display(), bytes = written, "Attachment downloaded");
        Ok(path)
    }
}

/// Local speech-to-text invocation. Configured binary is expected to print
/// the transcript on stdout when given a 16 kHz mono WAV.
pub struct SpeechToText {
    bin: String,
    model_path: Option<String>,
    language: Option<String>,
    threads: u32,
}

impl SpeechToText {
    pub fn new(config: &SttConfig) -> Self {
        Self {
            bin: config.bin.clone(),
            model_path: config.model_path.clone(),
            language: config.language.clone(),
            threads: config.threads,
        }
    }

    async fn transcribe(&self, wav_path: &Path) -> Result<String, DescribeError> {
        let mut command = Command::new(&self.bin);
        if let Some(model) = &self.model_path {
            command.arg("-m").arg(model);
        }
        if let Some(language) = &self.language {
            command.arg("-l").arg(language);
        }
        command
            .arg("-t")
            .arg(self.threads.to_string())
            .arg("--no-timestamps")
            .arg("-f")
            .arg(wav_path);

        let output = command
            .output()
            .await
            .map_err(|e| DescribeError::Tool(format!("{}: {}", self.bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DescribeError::Tool(format!("{} failed: {}", self.bin, stderr)));
        }

        let transcript = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if transcript.is_empty() {
            return Err(DescribeError::Tool(format!("{} produced no output", self.bin)));
        }
        Ok(transcript)
    }
}

pub struct MediaDescriber {
    backend: Arc<dyn CompletionBackend>,
    stt: Option<SpeechToText>,
    max_audio_bytes: u64,
    max_image_bytes: u64,
    max_document_chars: usize,
}

impl MediaDescriber {
    pub fn new(
        config: &MediaConfig,
        backend: Arc<dyn CompletionBackend>,
        stt: Option<SpeechToText>,
    ) -> Self {
        Self {
            backend,
            stt,
            max_audio_bytes: config.max_audio_bytes,
            max_image_bytes: config.max_image_bytes,
            max_document_chars: config.max_document_chars,
        }
    }

    /// Uniform failure policy: a short description, or the kind's sentinel.
    /// Nothing ever escapes this boundary as an error.
    pub async fn describe(&self, kind: MediaKind, path: &Path) -> String {
        let result = match kind {
            MediaKind::Audio => self.describe_audio(path).await,
            MediaKind::Image => self.describe_image(path).await,
            MediaKind::Video => Err(DescribeError::Unsupported),
            MediaKind::Document => self.describe_document(path).await,
        };

        match result {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(kind = kind.tag(), path = %path.display(), error = %err, "Media description degraded to sentinel");
                kind.sentinel().to_string()
            }
        }
    }

    /// Resample to canonical mono 16 kHz and run the local transcriber when
    /// one is configured; otherwise ship a bounded base64 payload to the
    /// model with an explicit transcription instruction.
    async fn describe_audio(&self, path: &Path) -> Result<String, DescribeError> {
        if let Some(stt) = &self.stt {
            match self.resample_to_wav(path).await {
                Ok(wav_path) => {
                    let transcript = stt.transcribe(&wav_path).await;
                    let _ = tokio::fs::remove_file(&wav_path).await;
                    if let Ok(text) = transcript {
                        return Ok(text);
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "Audio resample failed, trying model fallback");
                }
            }
        }

        let data = self.read_bounded(path, self.max_audio_bytes).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
        let prompt = format!(
            "Transcribe the following base64-encoded audio. Return only the transcription.\n{}",
            encoded
        );
        let reply = self
            .backend
            .complete(vec![ChatMessage::user(prompt)], TRANSCRIPTION_MAX_TOKENS)
            .await?;
        Ok(reply)
    }

    async fn describe_image(&self, path: &Path) -> Result<String, DescribeError> {
        let data = self.read_bounded(path, self.max_image_bytes).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
        let prompt = format!(
            "You are an image captioning assistant. Provide a 1-2 line description \
             of the image encoded in base64. Return only the caption.\nBASE64:\n{}",
            encoded
        );
        let reply = self
            .backend
            .complete(vec![ChatMessage::user(prompt)], CAPTION_MAX_TOKENS)
            .await?;
        Ok(reply)
    }

    async fn describe_document(&self, path: &Path) -> Result<String, DescribeError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension.as_deref() {
            Some(ext) if TEXT_DOCUMENT_EXTENSIONS.contains(&ext) => {
                let content = tokio::fs::read_to_string(path).await?;
                let head: String = content.chars().take(self.max_document_chars).collect();
                let prompt = format!("Summarize the following text in 1-2 lines:\n{}", head);
                let reply = self
                    .backend
                    .complete(vec![ChatMessage::user(prompt)], CAPTION_MAX_TOKENS)
                    .await?;
                Ok(reply)
            }
            // PDF/DOCX and friends need a real extractor; degrade for now.
            _ => Err(DescribeError::Unsupported),
        }
    }

    async fn read_bounded(&self, path: &Path, limit: u64) -> Result<Vec<u8>, DescribeError> {
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.len() > limit {
            return Err(DescribeError::TooLarge {
                size: metadata.len(),
                limit,
            });
        }
        Ok(tokio::fs::read(path).await?)
    }

    async fn resample_to_wav(&self, path: &Path) -> Result<PathBuf, DescribeError> {
        let wav_path = path.with_extension("16k.wav");
        let output = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(path)
            .arg("-ar")
            .arg("16000")
            .arg("-ac")
            .arg("1")
            .arg(&wav_path)
            .output()
            .await
            .map_err(|e| DescribeError::Tool(format!("ffmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DescribeError::Tool(format!("ffmpeg failed: {}", stderr)));
        }
        Ok(wav_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parrot_config::MediaConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    struct StubBackend {
        reply: Result<String, String>,
        calls: AtomicUsize,
    }

    impl StubBackend {
        fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(detail: &str) -> Self {
            Self {
                reply: Err(detail.to_string()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl CompletionBackend for StubBackend {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
            _max_tokens: u32,
        ) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(detail) => Err(ModelError::Transport(detail.clone())),
            }
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn temp_file(name: &str, ext: &str, contents: &[u8]) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("parrot-media-{}-{}.{}", name, ts, ext));
        std::fs::write(&path, contents).expect("seed file");
        path
    }

    fn describer(backend: StubBackend) -> MediaDescriber {
        MediaDescriber::new(&MediaConfig::default(), Arc::new(backend), None)
    }

    #[test]
    fn extension_resolution_prefers_content_type() {
        assert_eq!(extension_for_content_type("image/jpeg"), Some("jpg"));
        assert_eq!(extension_for_content_type("text/plain; charset=utf-8"), Some("txt"));
        assert_eq!(extension_for_content_type("application/x-unknown"), None);
    }

    #[test]
    fn extension_from_url_ignores_query() {
        assert_eq!(
            extension_from_url("https://cdn.example.com/a/photo.png?token=abc.def"),
            Some("png".to_string())
        );
        assert_eq!(extension_from_url("https://example.com/no-suffix"), None);
        assert_eq!(extension_from_url("https://example.com/odd.tar%20gz"), None);
    }

    #[test]
    fn classify_prefers_extension_over_mime() {
        assert_eq!(
            MediaKind::classify(Some("ogg"), Some("application/octet-stream")),
            Some(MediaKind::Audio)
        );
        assert_eq!(MediaKind::classify(None, Some("image/webp")), Some(MediaKind::Image));
        assert_eq!(MediaKind::classify(None, Some("video/mp4")), Some(MediaKind::Video));
        assert_eq!(MediaKind::classify(Some("pdf"), None), Some(MediaKind::Document));
        assert_eq!(MediaKind::classify(Some("bin"), Some("application/octet-stream")), None);
    }

    #[tokio::test]
    async fn video_always_degrades_to_sentinel() {
        let describer = describer(StubBackend::ok("unused"));
        let path = temp_file("video", "mp4", b"fake");
        let summary = describer.describe(MediaKind::Video, &path).await;
        assert_eq!(summary, "[video unavailable]");
    }

    #[tokio::test]
    async fn binary_document_degrades_to_sentinel() {
        let describer = describer(StubBackend::ok("unused"));
        let path = temp_file("doc", "pdf", b"%PDF-1.4");
        let summary = describer.describe(MediaKind::Document, &path).await;
        assert_eq!(summary, "[document unavailable]");
    }

    #[tokio::test]
    async fn text_document_is_summarized_via_model() {
        let describer = describer(StubBackend::ok("a short note about parrots"));
        let path = temp_file("note", "txt", b"parrots are excellent mimics");
        let summary = describer.describe(MediaKind::Document, &path).await;
        assert_eq!(summary, "a short note about parrots");
    }

    #[tokio::test]
    async fn oversized_image_degrades_to_sentinel() {
        let backend = StubBackend::ok("unused");
        let describer = describer(backend);
        let big = vec![0u8; 1_600_000];
        let path = temp_file("big", "jpg", &big);
        let summary = describer.describe(MediaKind::Image, &path).await;
        assert_eq!(summary, "[image unavailable]");
    }

    #[tokio::test]
    async fn model_failure_on_image_degrades_to_sentinel() {
        let describer = describer(StubBackend::failing("boom"));
        let path = temp_file("img", "png", b"\x89PNG");
        let summary = describer.describe(MediaKind::Image, &path).await;
        assert_eq!(summary, "[image unavailable]");
    }

    #[tokio::test]
    async fn audio_without_stt_uses_model_fallback() {
        let describer = describer(StubBackend::ok("hello from the voice note"));
        let path = temp_file("voice", "ogg", b"OggS");
        let summary = describer.describe(MediaKind::Audio, &path).await;
        assert_eq!(summary, "hello from the voice note");
    }

    /// One-shot HTTP server for download tests; accepts a single connection
    /// and writes a canned response.
    async fn serve_once(response: Vec<u8>) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn small_download_streams_to_disk() {
        let response = b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\ncontent-type: text/plain\r\nconnection: close\r\n\r\nhello".to_vec();
        let addr = serve_once(response).await;

        let fetcher = MediaFetcher::new(&MediaConfig::default(), std::env::temp_dir());
        let path = fetcher
            .fetch(&format!("http://{}/note", addr))
            .await
            .expect("fetch");
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("txt"));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "hello");
    }

    #[tokio::test]
    async fn declared_oversized_download_is_rejected_up_front() {
        let body = vec![b'x'; 64 * 1024];
        let response = [
            format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes(),
            body,
        ]
        .concat();
        let addr = serve_once(response).await;

        let mut config = MediaConfig::default();
        config.max_download_bytes = 16 * 1024;
        let fetcher = MediaFetcher::new(&config, std::env::temp_dir());
        let result = fetcher.fetch(&format!("http://{}/big.bin", addr)).await;
        assert!(matches!(result, Err(DownloadError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn undeclared_stream_is_capped_mid_download() {
        // No content-length: the cap has to trip while streaming.
        let body = vec![b'x'; 64 * 1024];
        let response = [b"HTTP/1.1 200 OK\r\nconnection: close\r\n\r\n".to_vec(), body].concat();
        let addr = serve_once(response).await;

        let mut config = MediaConfig::default();
        config.max_download_bytes = 16 * 1024;
        let fetcher = MediaFetcher::new(&config, std::env::temp_dir());
        let result = fetcher.fetch(&format!("http://{}/endless", addr)).await;
        assert!(matches!(result, Err(DownloadError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn fetch_failure_is_a_value_not_a_panic() {
        let fetcher = MediaFetcher::new(&MediaConfig::default(), std::env::temp_dir());
        // Nothing listens on this port; connection is refused immediately.
        let result = fetcher.fetch("http://127.0.0.1:9/never.jpg").await;
        assert!(matches!(result, Err(DownloadError::Request(_))));
    }
}
