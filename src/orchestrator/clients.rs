//! HTTP collaborators: Azure Computer Vision captions and HF text completion.

use std::time::Duration;

use serde::Deserialize;

use super::{ImageCaptioner, PromptWriter};
use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("photong/", env!("CARGO_PKG_VERSION"));

const AZURE_ANALYZE_PATH: &str = "computervision/imageanalysis:analyze";
const AZURE_API_VERSION: &str = "2022-10-12-preview";

pub const HF_BLOOM_URL: &str = "https://api-inference.huggingface.co/models/bigscience/bloom";

/// Few-shot preamble; the caption and ` -> ` are appended to it.
pub const FEW_SHOT_PROMPT: &str = "This tool can generate a musical prompt from an image prompt:
a place in China -> traditional Chinese music
a place in South America -> Latin American music
a man blowing a trumpet in a club -> jazz music with trumpets
a concert hall -> orchestral music with violins
a country house -> acoustic folk country guitar
a blooming flower -> passionate piano and strings
a sleeping baby -> serene lullaby, violin and piano
";

/// Credentials for the remote services, read from the environment.
#[derive(Debug, Clone)]
pub struct CollaboratorSettings {
    pub azure_key: String,
    pub azure_endpoint: String,
    pub hf_token: String,
    pub timeout: Duration,
}

impl CollaboratorSettings {
    /// Read `AZ_CV_KEY`, `AZ_CV_ENDPOINT` and `HF_TOKEN`.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            azure_key: env_var("AZ_CV_KEY")?,
            azure_endpoint: env_var("AZ_CV_ENDPOINT")?,
            hf_token: env_var("HF_TOKEN")?,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn captioner(&self) -> Result<AzureCaptioner> {
        AzureCaptioner::new(&self.azure_endpoint, &self.azure_key, self.timeout)
    }

    pub fn prompt_writer(&self) -> Result<HfPromptWriter> {
        HfPromptWriter::new(HF_BLOOM_URL, &self.hf_token, self.timeout)
    }
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::Config(format!("environment variable {name} is not set")))
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

// ── Azure Computer Vision ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(rename = "descriptionResult")]
    description_result: DescriptionResult,
}

#[derive(Debug, Deserialize)]
struct DescriptionResult {
    values: Vec<CaptionValue>,
}

#[derive(Debug, Deserialize)]
struct CaptionValue {
    text: String,
}

pub struct AzureCaptioner {
    http: reqwest::Client,
    url: reqwest::Url,
    key: String,
}

impl AzureCaptioner {
    pub fn new(endpoint: &str, key: &str, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(endpoint)
            .and_then(|base| base.join(AZURE_ANALYZE_PATH))
            .map_err(|e| Error::Config(format!("invalid Azure endpoint {endpoint:?}: {e}")))?;
        Ok(Self {
            http: http_client(timeout)?,
            url,
            key: key.to_string(),
        })
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }
}

impl ImageCaptioner for AzureCaptioner {
    async fn caption(&self, image: &[u8]) -> Result<String> {
        tracing::debug!(bytes = image.len(), "requesting image caption");
        let response = self
            .http
            .post(self.url.clone())
            .query(&[
                ("features", "Description"),
                ("model-version", "latest"),
                ("language", "en"),
                ("api-version", AZURE_API_VERSION),
            ])
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await?
            .error_for_status()?;
        parse_caption(response.json().await?)
    }
}

fn parse_caption(response: AnalyzeResponse) -> Result<String> {
    response
        .description_result
        .values
        .into_iter()
        .next()
        .map(|value| value.text)
        .ok_or_else(|| Error::Collaborator("caption response contained no descriptions".into()))
}

// ── HF text completion ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Completion {
    generated_text: String,
}

pub struct HfPromptWriter {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl HfPromptWriter {
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            url: url.to_string(),
            token: token.to_string(),
        })
    }
}

impl PromptWriter for HfPromptWriter {
    async fn prompt_for(&self, caption: &str) -> Result<String> {
        let inputs = format!("{FEW_SHOT_PROMPT}{caption} -> ");
        let completions: Vec<Completion> = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "inputs": inputs }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let first = completions
            .into_iter()
            .next()
            .ok_or_else(|| Error::Collaborator("completion response was empty".into()))?;
        parse_completion(&first.generated_text)
    }
}

/// Pull the new prompt out of the echoed few-shot completion.
fn parse_completion(generated: &str) -> Result<String> {
    let stripped = generated.replace(FEW_SHOT_PROMPT, "");
    let line = stripped.split('\n').next().unwrap_or_default();
    line.split("->")
        .nth(1)
        .map(|prompt| prompt.trim().to_string())
        .ok_or_else(|| Error::Collaborator(format!("completion has no '->' separator: {line:?}")))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Answer one HTTP request with `status` and a JSON `body`; yields the raw request.
    async fn serve_once(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&raw).to_string()
        });
        (url, handle)
    }

    #[test]
    fn test_parse_completion_takes_first_new_line() {
        let generated = format!(
            "{FEW_SHOT_PROMPT}a sunny beach -> calm reggae with steel drums\na dark forest -> eerie ambient"
        );
        assert_eq!(
            parse_completion(&generated).unwrap(),
            "calm reggae with steel drums"
        );
    }

    #[test]
    fn test_parse_completion_without_separator() {
        let generated = format!("{FEW_SHOT_PROMPT}a sunny beach\n");
        assert!(matches!(
            parse_completion(&generated),
            Err(Error::Collaborator(_))
        ));
    }

    #[test]
    fn test_parse_caption() {
        let response: AnalyzeResponse = serde_json::from_str(
            r#"{"descriptionResult":{"values":[{"text":"a dog on a beach","confidence":0.9}]},"modelVersion":"latest"}"#,
        )
        .unwrap();
        assert_eq!(parse_caption(response).unwrap(), "a dog on a beach");

        let empty: AnalyzeResponse =
            serde_json::from_str(r#"{"descriptionResult":{"values":[]}}"#).unwrap();
        assert!(matches!(parse_caption(empty), Err(Error::Collaborator(_))));
    }

    #[test]
    fn test_azure_url_is_joined_onto_endpoint() {
        let captioner = AzureCaptioner::new(
            "https://example.cognitiveservices.azure.com/",
            "key",
            DEFAULT_TIMEOUT,
        )
        .unwrap();
        assert_eq!(
            captioner.url().as_str(),
            "https://example.cognitiveservices.azure.com/computervision/imageanalysis:analyze"
        );
        assert!(matches!(
            AzureCaptioner::new("not a url", "key", DEFAULT_TIMEOUT),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_azure_request_shape() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"descriptionResult":{"values":[{"text":"a concert hall"}]}}"#,
        )
        .await;
        let captioner = AzureCaptioner::new(&url, "secret", DEFAULT_TIMEOUT).unwrap();
        let caption = captioner.caption(b"image-bytes").await.unwrap();
        assert_eq!(caption, "a concert hall");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /computervision/imageanalysis:analyze?features=Description"));
        assert!(request.contains("api-version=2022-10-12-preview"));
        assert!(request.to_ascii_lowercase().contains("ocp-apim-subscription-key: secret"));
        assert!(request.ends_with("image-bytes"));
    }

    #[tokio::test]
    async fn test_hf_request_and_parse() {
        let generated = format!("{FEW_SHOT_PROMPT}a concert hall -> orchestral music with violins\n");
        let body = serde_json::json!([{ "generated_text": generated }]).to_string();
        let (url, server) = serve_once("200 OK", &body).await;
        let writer = HfPromptWriter::new(&url, "hf_token", DEFAULT_TIMEOUT).unwrap();
        let prompt = writer.prompt_for("a concert hall").await.unwrap();
        assert_eq!(prompt, "orchestral music with violins");

        let request = server.await.unwrap();
        assert!(request.to_ascii_lowercase().contains("authorization: bearer hf_token"));
        assert!(request.contains(r#"a concert hall -> "}"#));
    }

    #[tokio::test]
    async fn test_http_error_status_is_collaborator_error() {
        let (url, _server) = serve_once("503 Service Unavailable", "{}").await;
        let writer = HfPromptWriter::new(&url, "t", DEFAULT_TIMEOUT).unwrap();
        assert!(matches!(
            writer.prompt_for("x").await,
            Err(Error::Collaborator(_))
        ));
    }
}
