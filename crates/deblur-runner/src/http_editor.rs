use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use tracing::debug;

use crate::editor::{EditError, ImageEditor, TargetSize};

/// Generic HTTP edit endpoint: raw image bytes in, raw image bytes out.
///
/// Prompt, size and model travel in the query string; the key, when present,
/// as a bearer token.
#[derive(Clone, Debug)]
pub struct HttpImageEditor {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl HttpImageEditor {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            timeout,
        }
    }

    pub fn request_url(&self, target: TargetSize, prompt: &str) -> Result<Url, EditError> {
        let width = target.width.to_string();
        let height = target.height.to_string();
        Url::parse_with_params(
            &self.endpoint,
            &[
                ("prompt", prompt),
                ("width", width.as_str()),
                ("height", height.as_str()),
                ("model", self.model.as_str()),
            ],
        )
        .map_err(|e| EditError::InvalidRequest(format!("endpoint {}: {e}", self.endpoint)))
    }
}

impl ImageEditor for HttpImageEditor {
    fn edit(&self, image: &[u8], target: TargetSize, prompt: &str) -> Result<Vec<u8>, EditError> {
        let url = self.request_url(target, prompt)?;
        let transport = |e: reqwest::Error| {
            if e.is_timeout() {
                EditError::Timeout(self.timeout)
            } else {
                EditError::Transport(Box::new(e))
            }
        };

        // a blocking client must not be dropped on a runtime thread
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(transport)?;

        let mut req = client
            .post(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec());
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        debug!(endpoint = %self.endpoint, bytes = image.len(), "sending edit request");
        let resp = req.send().map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(EditError::Http {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let bytes = resp.bytes().map_err(transport)?;
        if bytes.is_empty() {
            return Err(EditError::EmptyResponse);
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// One-shot HTTP server answering with `status` and `body`.
    fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            drain_request(&mut stream);
            let head = format!("HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n", body.len());
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(body).unwrap();
        });
        format!("http://{addr}/edit")
    }

    fn drain_request(stream: &mut std::net::TcpStream) {
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).unwrap_or(0);
            if n == 0 {
                return;
            }
            seen.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&seen).to_lowercase();
            if let Some(end) = text.find("\r\n\r\n") {
                let len = text
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0)))
                    .unwrap_or(0);
                if seen.len() >= end + 4 + len {
                    return;
                }
            }
        }
    }

    #[test]
    fn url_carries_prompt_size_and_model() {
        let editor = HttpImageEditor::new("http://localhost/edit", "m1", None, Duration::from_secs(5));
        let url = editor.request_url(TargetSize::new(1024, 1536), "make it sharp").unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("prompt".into(), "make it sharp".into())));
        assert!(pairs.contains(&("width".into(), "1024".into())));
        assert!(pairs.contains(&("model".into(), "m1".into())));
    }

    #[test]
    fn bad_endpoint_is_rejected() {
        let editor = HttpImageEditor::new("not a url", "m1", None, Duration::from_secs(5));
        assert!(matches!(
            editor.request_url(TargetSize::new(1, 1), "p"),
            Err(EditError::InvalidRequest(_))
        ));
    }

    #[test]
    fn success_returns_body() {
        let endpoint = serve_once("200 OK", b"edited");
        let editor = HttpImageEditor::new(endpoint, "m1", Some("k".into()), Duration::from_secs(5));
        let out = editor.edit(b"raw", TargetSize::new(8, 8), "p").unwrap();
        assert_eq!(out, b"edited");
    }

    #[test]
    fn error_status_is_reported_with_body() {
        let endpoint = serve_once("401 Unauthorized", b"bad key");
        let editor = HttpImageEditor::new(endpoint, "m1", None, Duration::from_secs(5));
        let err = editor.edit(b"raw", TargetSize::new(8, 8), "p").unwrap_err();
        assert_eq!(err.to_string(), "HTTP 401: bad key");
    }
}
