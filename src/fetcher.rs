use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use url::Url;

use crate::discovery::last_segment;
use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded { path: PathBuf, bytes: u64 },
    AlreadyPresent(PathBuf),
}

/// Download stats returned after completion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchStats {
    pub total: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Destination file name for a source URL: its final path segment.
pub fn file_name_for(url: &str) -> Result<String, FetchError> {
    Url::parse(url)
        .ok()
        .as_ref()
        .and_then(last_segment)
        .map(str::to_string)
        .ok_or_else(|| FetchError::BadUrl(url.to_string()))
}

/// Download `urls` into `raw_dir`, at most `concurrency` at a time. Errors are logged
/// and counted, never returned. A URL whose file name was already claimed by an earlier
/// URL in the list is skipped.
pub async fn fetch_all(
    client: &reqwest::Client,
    urls: Vec<String>,
    raw_dir: &Path,
    concurrency: usize,
) -> FetchStats {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let total = urls.len();

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    let (tx, mut rx) =
        tokio::sync::mpsc::channel::<(String, Result<FetchOutcome, FetchError>)>(concurrency.max(1) * 2);

    let mut stats = FetchStats {
        total,
        ..Default::default()
    };
    let mut claimed = HashSet::new();
    for url in urls {
        if let Ok(name) = file_name_for(&url) {
            if !claimed.insert(name.clone()) {
                warn!(url = %url, file = %name, "Another URL already maps to this file, skipping");
                stats.skipped += 1;
                pb.inc(1);
                continue;
            }
        }
        let client = client.clone();
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();
        let raw_dir = raw_dir.to_path_buf();

        tokio::spawn(async move {
            let result = match sem.acquire_owned().await {
                Ok(_permit) => fetch_one(&client, &url, &raw_dir).await,
                Err(_) => return,
            };
            let _ = tx.send((url, result)).await;
        });
    }

    // rx closes once every task has dropped its sender
    drop(tx);

    while let Some((url, result)) = rx.recv().await {
        match result {
            Ok(FetchOutcome::Downloaded { path, bytes }) => {
                info!(file = %path.display(), bytes, "Saved");
                stats.downloaded += 1;
            }
            Ok(FetchOutcome::AlreadyPresent(path)) => {
                info!("Already downloaded: {}", path.display());
                stats.skipped += 1;
            }
            Err(e) => {
                warn!(url = %url, "Download failed: {}", e);
                stats.failed += 1;
            }
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Fetched {} files ({} downloaded, {} already present, {} failed)",
        stats.total, stats.downloaded, stats.skipped, stats.failed
    );
    stats
}

/// Fetch one file unless it is already in `raw_dir`. The body is streamed to a
/// temporary file of its own and moved into place only after the last byte is written;
/// an existing destination is never overwritten.
pub async fn fetch_one(
    client: &reqwest::Client,
    url: &str,
    raw_dir: &Path,
) -> Result<FetchOutcome, FetchError> {
    let name = file_name_for(url)?;
    let dest = raw_dir.join(&name);
    if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        return Ok(FetchOutcome::AlreadyPresent(dest));
    }

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| FetchError::Io { path, source }
    };
    tokio::fs::create_dir_all(raw_dir)
        .await
        .map_err(io_err(raw_dir))?;

    info!("Downloading: {}", name);
    let start = Instant::now();
    let network = |source| FetchError::Network {
        url: url.to_string(),
        source,
    };
    let mut response = client.get(url).send().await.map_err(network)?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status,
        });
    }

    let prefix = format!(".{}.", name);
    let tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".part")
        .tempfile_in(raw_dir)
        .map_err(io_err(raw_dir))?;
    // The temporary file is removed when `tmp` drops without being persisted.
    let bytes = async {
        let handle = tmp.reopen().map_err(io_err(tmp.path()))?;
        let mut file = tokio::fs::File::from_std(handle);
        let mut bytes = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(network)? {
            file.write_all(&chunk).await.map_err(io_err(tmp.path()))?;
            bytes += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err(tmp.path()))?;
        file.sync_all().await.map_err(io_err(tmp.path()))?;
        Ok::<u64, FetchError>(bytes)
    }
    .await?;

    match tmp.persist_noclobber(&dest) {
        Ok(_) => {}
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
            info!("Already downloaded: {}", dest.display());
            return Ok(FetchOutcome::AlreadyPresent(dest));
        }
        Err(e) => {
            return Err(FetchError::Io {
                path: dest,
                source: e.error,
            })
        }
    }

    info!(
        file = %name,
        bytes,
        secs = start.elapsed().as_secs_f64(),
        "Download complete"
    );
    Ok(FetchOutcome::Downloaded { path: dest, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    struct Route {
        path: &'static str,
        body: Vec<u8>,
        chunk_delay: Duration,
    }

    /// Minimal HTTP/1.1 server: known paths get 200 with their body written in
    /// 100-byte chunks, anything else gets 404. Returns the base URL.
    async fn serve(routes: Vec<Route>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let routes = Arc::new(routes);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let routes = Arc::clone(&routes);
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let request = String::from_utf8_lossy(&request).into_owned();
                    let path = request.split_whitespace().nth(1).unwrap_or("/");
                    let (status, body, delay) = match routes.iter().find(|r| r.path == path) {
                        Some(r) => ("200 OK", r.body.clone(), r.chunk_delay),
                        None => ("404 Not Found", b"not found".to_vec(), Duration::ZERO),
                    };
                    let head = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        status,
                        body.len()
                    );
                    if socket.write_all(head.as_bytes()).await.is_err() {
                        return;
                    }
                    for part in body.chunks(100) {
                        tokio::time::sleep(delay).await;
                        if socket.write_all(part).await.is_err() {
                            return;
                        }
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });
        base
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn file_name_from_last_segment() {
        assert_eq!(
            file_name_for("http://example.org/data/pp-2019-part1.csv").unwrap(),
            "pp-2019-part1.csv"
        );
        assert_eq!(
            file_name_for("http://example.org/pp-2019-part1.csv?download=1").unwrap(),
            "pp-2019-part1.csv"
        );
        assert!(file_name_for("http://example.org/").is_err());
        assert!(file_name_for("not a url").is_err());
    }

    #[tokio::test]
    async fn downloads_body_into_place() {
        let body = std::fs::read("tests/fixtures/pp-2019-part1.csv").unwrap();
        let base = serve(vec![Route {
            path: "/data/pp-2019-part1.csv",
            body: body.clone(),
            chunk_delay: Duration::ZERO,
        }])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");

        let url = format!("{}/data/pp-2019-part1.csv", base);
        let outcome = fetch_one(&client(), &url, &raw).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Downloaded {
                path: raw.join("pp-2019-part1.csv"),
                bytes: body.len() as u64
            }
        );
        assert_eq!(std::fs::read(raw.join("pp-2019-part1.csv")).unwrap(), body);
        assert_eq!(entries(&raw), vec!["pp-2019-part1.csv"]);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let base = serve(Vec::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/pp-2019-part3.csv", base);

        let err = fetch_one(&client(), &url, dir.path()).await.unwrap_err();
        match err {
            FetchError::Status { status, .. } => assert_eq!(status.as_u16(), 404),
            other => panic!("expected a status error, got {other}"),
        }
        assert!(entries(dir.path()).is_empty());

        let stats = fetch_all(&client(), vec![url], dir.path(), 2).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.downloaded, 0);
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn urls_sharing_a_file_name_download_once() {
        let base = serve(vec![
            Route {
                path: "/a/pp-2019-part1.csv",
                body: vec![b'A'; 800],
                chunk_delay: Duration::from_millis(20),
            },
            Route {
                path: "/b/pp-2019-part1.csv",
                body: vec![b'B'; 400],
                chunk_delay: Duration::ZERO,
            },
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let urls = vec![
            format!("{}/a/pp-2019-part1.csv", base),
            format!("{}/b/pp-2019-part1.csv", base),
        ];

        let stats = fetch_all(&client(), urls, dir.path(), 4).await;
        assert_eq!(
            stats,
            FetchStats {
                total: 2,
                downloaded: 1,
                skipped: 1,
                failed: 0
            }
        );
        let content = std::fs::read(dir.path().join("pp-2019-part1.csv")).unwrap();
        assert_eq!(content, vec![b'A'; 800]);
        assert_eq!(entries(dir.path()), vec!["pp-2019-part1.csv"]);
    }

    #[tokio::test]
    async fn concurrent_fetches_of_one_file_never_mix() {
        let base = serve(vec![
            Route {
                path: "/a/pp-2019-part1.csv",
                body: vec![b'A'; 800],
                chunk_delay: Duration::from_millis(20),
            },
            Route {
                path: "/b/pp-2019-part1.csv",
                body: vec![b'B'; 400],
                chunk_delay: Duration::ZERO,
            },
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let client = client();
        let a = format!("{}/a/pp-2019-part1.csv", base);
        let b = format!("{}/b/pp-2019-part1.csv", base);

        let (ra, rb) = tokio::join!(
            fetch_one(&client, &a, dir.path()),
            fetch_one(&client, &b, dir.path())
        );
        let outcomes = [ra.unwrap(), rb.unwrap()];
        let downloaded = outcomes
            .iter()
            .filter(|o| matches!(o, FetchOutcome::Downloaded { .. }))
            .count();
        assert_eq!(downloaded, 1);

        let content = std::fs::read(dir.path().join("pp-2019-part1.csv")).unwrap();
        assert!(
            content == vec![b'A'; 800] || content == vec![b'B'; 400],
            "mixed content: {} bytes",
            content.len()
        );
        assert_eq!(entries(dir.path()), vec!["pp-2019-part1.csv"]);
    }

    #[tokio::test]
    async fn existing_file_is_not_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("pp-2019-part1.csv");
        std::fs::write(&existing, "cached").unwrap();

        // Nothing listens on port 9; a request would fail.
        let outcome = fetch_one(&client(), "http://127.0.0.1:9/pp-2019-part1.csv", dir.path())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::AlreadyPresent(existing.clone()));
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "cached");
    }

    #[tokio::test]
    async fn failed_download_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        let err = fetch_one(&client(), "http://127.0.0.1:9/pp-2019-part2.csv", &raw)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));
        assert!(entries(&raw).is_empty());
    }

    #[tokio::test]
    async fn resumes_with_only_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pp-2019-part1.csv"), "a").unwrap();
        let urls = vec![
            "http://127.0.0.1:9/pp-2019-part1.csv".to_string(),
            "http://127.0.0.1:9/pp-2019-part2.csv".to_string(),
        ];
        let stats = fetch_all(&client(), urls, dir.path(), 2).await;
        assert_eq!(
            stats,
            FetchStats {
                total: 2,
                downloaded: 0,
                skipped: 1,
                failed: 1
            }
        );
    }
}
