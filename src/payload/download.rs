use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info};

use crate::config::NetworkConfig;
use crate::error::{AnalysisError, Result};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; rv:40.0) Gecko/20100101 Firefox/40.0";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_REDIRECTS: usize = 10;
const FALLBACK_FILE_NAME: &str = "download.bin";

/// Source of secondary payload bytes. The pipeline only needs the body of a
/// single GET; tests substitute a stub.
pub trait PayloadFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Blocking HTTP fetcher with a fixed user agent, request timeout and
/// redirect limit. No retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration, max_redirects: usize) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(max_redirects))
            .build()
            .map_err(|err| AnalysisError::Network(format!("cannot build http client: {err}")))?;
        Ok(Self { client })
    }

    pub fn from_config(cfg: &NetworkConfig) -> Result<Self> {
        Self::new(&cfg.user_agent, cfg.timeout(), cfg.max_redirects)
    }
}

impl PayloadFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(|err| network_error(url, err))?;
        let body = response.bytes().map_err(|err| network_error(url, err))?;
        Ok(body.to_vec())
    }
}

fn network_error(url: &str, err: reqwest::Error) -> AnalysisError {
    let reason = if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_redirect() {
        "too many redirects".to_string()
    } else if let Some(status) = err.status() {
        format!("http status {status}")
    } else if err.is_connect() {
        "connection failed".to_string()
    } else {
        "request failed".to_string()
    };
    error!("download failed url={url} reason={reason}");
    AnalysisError::Network(format!("{reason} for {url}: {err}"))
}

/// File name for a downloaded URL: the last path segment without query or
/// fragment, restricted to a safe character set.
pub fn file_name_for_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let after_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    let segment = match after_scheme.split_once('/') {
        Some((_, path)) => path.rsplit('/').next().unwrap_or(""),
        None => "",
    };
    let name: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        FALLBACK_FILE_NAME.to_string()
    } else {
        name
    }
}

/// Fetch `url` through `fetcher` and write the raw body under `output_dir`.
pub fn download_with(fetcher: &dyn PayloadFetcher, url: &str, output_dir: &Path) -> Result<PathBuf> {
    info!("downloading url={url}");
    let body = fetcher.fetch(url)?;
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(file_name_for_url(url));
    std::fs::write(&path, &body)?;
    info!("saved download bytes={} path={}", body.len(), path.display());
    Ok(path)
}

/// Single GET with the given user agent and timeout; the body is written to
/// a file under `output_dir`.
pub fn download(url: &str, output_dir: &Path, user_agent: &str, timeout: Duration) -> Result<PathBuf> {
    let fetcher = HttpFetcher::new(user_agent, timeout, DEFAULT_MAX_REDIRECTS)?;
    download_with(&fetcher, url, output_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFetcher(Vec<u8>);

    impl PayloadFetcher for StaticFetcher {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    struct FailingFetcher;

    impl PayloadFetcher for FailingFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            Err(AnalysisError::Network(format!("connection failed for {url}")))
        }
    }

    #[test]
    fn names_file_after_last_segment() {
        assert_eq!(file_name_for_url("http://h/a/b/payload.iso"), "payload.iso");
        assert_eq!(file_name_for_url("http://h/x.iso?id=1#frag"), "x.iso");
        assert_eq!(file_name_for_url("http://h/"), "download.bin");
        assert_eq!(file_name_for_url("http://h"), "download.bin");
        assert_eq!(file_name_for_url("http://h/we ird:name.iso"), "we_ird_name.iso");
    }

    #[test]
    fn writes_body_to_output_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StaticFetcher(b"QUJD".to_vec());
        let path = download_with(&fetcher, "http://h/file.iso", dir.path()).expect("download");
        assert_eq!(path, dir.path().join("file.iso"));
        assert_eq!(std::fs::read(path).expect("read"), b"QUJD");
    }

    #[test]
    fn propagates_network_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = download_with(&FailingFetcher, "http://h/file.iso", dir.path()).unwrap_err();
        assert!(matches!(err, AnalysisError::Network(_)));
        assert!(!dir.path().join("file.iso").exists());
    }

    #[test]
    fn builds_client_from_defaults() {
        assert!(HttpFetcher::new(DEFAULT_USER_AGENT, DEFAULT_TIMEOUT, 10).is_ok());
    }

    mod local_server {
        use super::*;
        use std::io::{BufRead, BufReader, Write};
        use std::net::TcpListener;
        use std::sync::mpsc;
        use std::thread;

        /// Serve one connection with `response` and hand back the request head.
        fn serve_once(response: &'static [u8]) -> (String, mpsc::Receiver<String>) {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            let addr = listener.local_addr().expect("addr");
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let (stream, _) = listener.accept().expect("accept");
                let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                let mut head = String::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).expect("read") == 0 || line == "\r\n" {
                        break;
                    }
                    head.push_str(&line);
                }
                let mut stream = stream;
                stream.write_all(response).expect("respond");
                stream.flush().expect("flush");
                let _ = tx.send(head);
            });
            (format!("http://{addr}/files/update.iso"), rx)
        }

        fn user_agent_line(head: &str) -> Option<&str> {
            head.lines()
                .find(|l| l.to_ascii_lowercase().starts_with("user-agent:"))
                .map(|l| l["user-agent:".len()..].trim())
        }

        #[test]
        fn not_found_is_network_error_and_sends_user_agent() {
            let (url, rx) = serve_once(
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
            let fetcher = HttpFetcher::new("droptrace-test/1.0", Duration::from_secs(5), 0)
                .expect("client");
            let err = fetcher.fetch(&url).unwrap_err();
            match &err {
                AnalysisError::Network(msg) => assert!(msg.contains("404"), "{msg}"),
                other => panic!("unexpected {other:?}"),
            }

            let head = rx.recv().expect("request");
            assert!(head.starts_with("GET /files/update.iso HTTP/1.1"), "{head}");
            assert_eq!(user_agent_line(&head), Some("droptrace-test/1.0"));
        }

        #[test]
        fn download_writes_response_body() {
            let (url, rx) = serve_once(
                b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\nUVVKRA==",
            );
            let dir = tempfile::tempdir().expect("tempdir");
            let path = download(&url, dir.path(), DEFAULT_USER_AGENT, Duration::from_secs(5))
                .expect("download");
            assert_eq!(path, dir.path().join("update.iso"));
            assert_eq!(std::fs::read(&path).expect("read"), b"UVVKRA==");

            let head = rx.recv().expect("request");
            assert_eq!(user_agent_line(&head), Some(DEFAULT_USER_AGENT));
        }

        #[test]
        fn stalled_server_times_out() {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            let addr = listener.local_addr().expect("addr");
            let (done_tx, done_rx) = mpsc::channel::<()>();
            thread::spawn(move || {
                let accepted = listener.accept();
                let _ = done_rx.recv();
                drop(accepted);
            });

            let fetcher = HttpFetcher::new(DEFAULT_USER_AGENT, Duration::from_millis(300), 0)
                .expect("client");
            let err = fetcher.fetch(&format!("http://{addr}/x.iso")).unwrap_err();
            let _ = done_tx.send(());
            match err {
                AnalysisError::Network(msg) => assert!(msg.contains("timed out"), "{msg}"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
