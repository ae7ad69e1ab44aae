use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use chapterflow::config::CrawlerConfig;
use chapterflow::fetch::{FetchError, Fetcher, HttpTransport};
use tokio_util::sync::CancellationToken;

/// Serves a handful of fixed routes and counts hits per path.
struct Site {
    base_url: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Site {
    fn spawn() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start site");
        let base_url = format!("http://{}", server.server_addr());
        let hits = Arc::new(Mutex::new(HashMap::new()));
        let counter = Arc::clone(&hits);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let request = match server.recv_timeout(Duration::from_millis(20)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                let path = request.url().to_string();
                let hit = {
                    let mut hits = counter.lock().unwrap();
                    let n = hits.entry(path.clone()).or_insert(0);
                    *n += 1;
                    *n
                };
                let html = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/html"[..])
                    .expect("build header");
                let response = match path.as_str() {
                    "/flaky.html" if hit == 1 => {
                        tiny_http::Response::from_data(b"busy".to_vec()).with_status_code(503)
                    }
                    "/flaky.html" | "/ok.html" => {
                        tiny_http::Response::from_data("<h1>第一章</h1><p>正文</p>".as_bytes())
                            .with_header(html)
                    }
                    // "你好" encoded as GBK.
                    "/gbk.html" => {
                        tiny_http::Response::from_data(vec![0xC4, 0xE3, 0xBA, 0xC3])
                            .with_header(html)
                    }
                    _ => tiny_http::Response::from_data(b"nope".to_vec()).with_status_code(404),
                };
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl Drop for Site {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn fetcher(max_retries: usize) -> Fetcher {
    let config = CrawlerConfig {
        delay_ms: 1,
        max_retries,
        timeout_seconds: 5,
        ..CrawlerConfig::default()
    };
    Fetcher::new(Arc::new(HttpTransport::new(&config).unwrap()), &config)
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let site = Site::spawn();
    let body = fetcher(2)
        .fetch(&site.url("/flaky.html"), "utf-8", &CancellationToken::new())
        .await
        .unwrap();
    assert!(body.contains("第一章"));
    assert_eq!(site.hits("/flaky.html"), 2);
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let site = Site::spawn();
    let err = fetcher(3)
        .fetch(&site.url("/gone.html"), "utf-8", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 404, .. }));
    assert!(!err.is_retryable());
    assert_eq!(site.hits("/gone.html"), 1);
}

#[tokio::test]
async fn declared_book_encoding_is_used_for_decoding() {
    let site = Site::spawn();
    let body = fetcher(0)
        .fetch(&site.url("/gbk.html"), "gbk", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(body, "你好");
}

#[tokio::test]
async fn cancelled_fetch_sends_nothing() {
    let site = Site::spawn();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = fetcher(0)
        .fetch(&site.url("/ok.html"), "utf-8", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Cancelled));
    assert_eq!(site.hits("/ok.html"), 0);
}
