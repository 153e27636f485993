use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{CONTENT_LENGTH, HOST, HeaderMap, LOCATION};
use hyper::{Method, Request, Response, StatusCode, Uri};
use log::{debug, error, info, warn};
use pin_project::pin_project;
use tokio::io::AsyncWriteExt as _;
use tokio_util::sync::PollSender;

use crate::cache::{sidecar_path, tmp_path};
use crate::humanfmt::HumanFmt;
use crate::{HttpClient, empty};

/// End-to-end budget for one upstream fetch, redirects included.
pub(crate) const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// End-to-end budget for a passthrough fetch.
pub(crate) const PASSTHROUGH_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_REDIRECTS: usize = 10;

const CACHE_WRITER_QUEUE: usize = 64;

#[derive(Debug)]
pub(crate) enum FetchError {
    Dns,
    Status(StatusCode),
    Timeout(Duration),
    TooManyRedirects(String),
    InvalidUrl(String),
    Io(std::io::Error),
    Client(hyper_util::client::legacy::Error),
    AllMirrorsFailed { tried: usize, last: Box<FetchError> },
}

impl FetchError {
    /// Whether the (possibly aggregated) failure was a DNS resolution
    /// failure, surfaced to clients with a dedicated message.
    #[must_use]
    pub(crate) fn is_dns(&self) -> bool {
        match self {
            Self::Dns => true,
            Self::AllMirrorsFailed { last, .. } => last.is_dns(),
            _ => false,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dns => f.write_str("DNS resolution failed"),
            Self::Status(status) => write!(f, "HTTP {status}"),
            Self::Timeout(budget) => write!(f, "no response within {}", HumanFmt::Time(*budget)),
            Self::TooManyRedirects(url) => write!(f, "too many redirects fetching `{url}`"),
            Self::InvalidUrl(url) => write!(f, "invalid upstream URL `{url}`"),
            Self::Io(err) => err.fmt(f),
            Self::Client(err) => err.fmt(f),
            Self::AllMirrorsFailed { tried, last } => {
                write!(f, "all {tried} mirrors failed: {last}")
            }
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Client(err) => Some(err),
            Self::AllMirrorsFailed { last, .. } => Some(&**last),
            _ => None,
        }
    }
}

/// Resolver failures are detected by message inspection; the client stack
/// exposes no typed DNS error across its connector layers.
#[must_use]
fn is_dns_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);

    while let Some(e) = current {
        let message = e.to_string();
        if message.contains("failed to lookup address")
            || message.contains("dns error")
            || message.contains("Name or service not known")
            || message.contains("no such host")
        {
            return true;
        }
        current = e.source();
    }

    false
}

#[must_use]
fn classify_client_error(err: hyper_util::client::legacy::Error) -> FetchError {
    if is_dns_failure(&err) {
        FetchError::Dns
    } else {
        FetchError::Client(err)
    }
}

#[must_use]
pub(crate) fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
}

#[must_use]
fn redirect_target(current: &Uri, headers: &HeaderMap) -> Option<Uri> {
    let location = headers.get(LOCATION)?.to_str().ok()?;
    let location: Uri = location.parse().ok()?;

    if location.scheme().is_some() {
        return Some(location);
    }

    /* relative redirect: keep scheme and authority */
    let mut parts = current.clone().into_parts();
    parts.path_and_query = location.path_and_query().cloned();
    Uri::from_parts(parts).ok()
}

/// Issues a GET against one upstream URL, following redirects, with `budget`
/// covering all hops up to the response head. Client headers are copied
/// verbatim except `Host`. The response is returned regardless of status.
pub(crate) async fn fetch_upstream(
    client: &HttpClient,
    url: &str,
    headers: &HeaderMap,
    budget: Duration,
) -> Result<Response<Incoming>, FetchError> {
    let deadline = tokio::time::Instant::now() + budget;

    let mut uri: Uri = url
        .parse()
        .map_err(|_| FetchError::InvalidUrl(url.to_string()))?;

    for _hop in 0..MAX_REDIRECTS {
        let mut builder = Request::builder().method(Method::GET).uri(uri.clone());
        {
            let request_headers = builder.headers_mut().expect("request builder is valid");
            for (name, value) in headers {
                if name != HOST {
                    request_headers.append(name.clone(), value.clone());
                }
            }
        }
        let request = builder.body(empty()).expect("request is valid");

        debug!("Downloading: {uri}");

        let response = match tokio::time::timeout_at(deadline, client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(classify_client_error(err)),
            Err(_) => return Err(FetchError::Timeout(budget)),
        };

        if response.status().is_redirection() {
            if let Some(next) = redirect_target(&uri, response.headers()) {
                debug!("Following redirect {uri} -> {next}");
                uri = next;
                continue;
            }
        }

        return Ok(response);
    }

    Err(FetchError::TooManyRedirects(url.to_string()))
}

/// Tries the mirror URLs in their declared order until one answers with a
/// non-error status. Only the first and last failures are logged to keep a
/// long dead mirror list from flooding the log.
pub(crate) async fn fetch_failover(
    client: &HttpClient,
    urls: &[String],
    headers: &HeaderMap,
) -> Result<Response<Incoming>, FetchError> {
    let total = urls.len();
    let mut last_err = None;

    for (pos, url) in urls.iter().enumerate() {
        let result = match fetch_upstream(client, url, headers, UPSTREAM_TIMEOUT).await {
            Ok(response) if response.status().as_u16() >= 400 => {
                Err(FetchError::Status(response.status()))
            }
            other => other,
        };

        match result {
            Ok(response) => return Ok(response),
            Err(err) => {
                let failed = pos + 1;
                if failed == 1 || failed == total {
                    warn!("Mirror failed ({failed}/{total}): {err}");
                }
                last_err = Some(err);
            }
        }
    }

    Err(FetchError::AllMirrorsFailed {
        tried: total,
        last: Box::new(last_err.unwrap_or(FetchError::InvalidUrl(String::new()))),
    })
}

/// Fetches from the first healthy mirror and returns a response whose body
/// tees every byte into `<cache_path>.tmp` while the client drains it. The
/// entry becomes visible at `cache_path` only after the download completed
/// with the declared length and was atomically renamed.
pub(crate) async fn stream_and_cache(
    client: &HttpClient,
    urls: &[String],
    cache_path: &Path,
    headers: &HeaderMap,
    buffer_size: usize,
) -> Result<Response<TeeBody<Incoming>>, FetchError> {
    let temp_path = tmp_path(cache_path);

    /* Leftover from a previously failed or torn down download */
    match tokio::fs::remove_file(&temp_path).await {
        Ok(()) => debug!("Removed stale temporary file `{}`", temp_path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
        Err(err) => warn!(
            "Failed to remove stale temporary file `{}`:  {err}",
            temp_path.display()
        ),
    }

    let response = fetch_failover(client, urls, headers).await?;

    let file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(FetchError::Io)?;

    let declared = declared_content_length(response.headers());

    let (tx, rx) = tokio::sync::mpsc::channel(CACHE_WRITER_QUEUE);
    tokio::task::spawn(cache_writer(
        rx,
        file,
        temp_path,
        cache_path.to_path_buf(),
        declared,
        buffer_size,
    ));

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, TeeBody::new(body, tx)))
}

/// Drains teed chunks into the temporary file. When the channel closes,
/// regardless of whether the download completed or the client vanished,
/// the entry is finalized or discarded based on what actually reached disk.
async fn cache_writer(
    mut rx: tokio::sync::mpsc::Receiver<Bytes>,
    file: tokio::fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    declared_len: Option<u64>,
    buffer_size: usize,
) {
    let mut writer = tokio::io::BufWriter::with_capacity(buffer_size, file);

    while let Some(mut chunk) = rx.recv().await {
        if let Err(err) = writer.write_all_buf(&mut chunk).await {
            error!(
                "Error writing to temporary file `{}`:  {err}",
                temp_path.display()
            );
            rx.close();
            drop(writer);
            let _ = tokio::fs::remove_file(&temp_path).await;
            return;
        }
    }

    if let Err(err) = writer.flush().await {
        error!(
            "Error flushing temporary file `{}`:  {err}",
            temp_path.display()
        );
        drop(writer);
        let _ = tokio::fs::remove_file(&temp_path).await;
        return;
    }
    drop(writer);

    finalize_entry(&temp_path, &final_path, declared_len).await;
}

/// Publication step of the tee: validates what reached the temporary file
/// and atomically renames it into place with its length sidecar. Any
/// failure discards the temporary file; a partial download never becomes
/// visible at the final path.
pub(crate) async fn finalize_entry(
    temp_path: &Path,
    final_path: &Path,
    declared_len: Option<u64>,
) -> bool {
    let size = match tokio::fs::metadata(temp_path).await {
        Ok(metadata) => metadata.len(),
        Err(err) => {
            warn!(
                "Failed to stat temporary file `{}`:  {err}",
                temp_path.display()
            );
            let _ = tokio::fs::remove_file(temp_path).await;
            return false;
        }
    };

    if let Some(declared) = declared_len {
        if declared > 0 && size != declared {
            warn!(
                "Size mismatch for `{}`: announced {declared} bytes, wrote {size} bytes; discarding",
                final_path.display()
            );
            let _ = tokio::fs::remove_file(temp_path).await;
            return false;
        }
    }

    if size == 0 {
        warn!("Empty download for `{}`, discarding", final_path.display());
        let _ = tokio::fs::remove_file(temp_path).await;
        return false;
    }

    let meta_path = sidecar_path(final_path);
    if let Err(err) = tokio::fs::write(&meta_path, format!("{size}\n")).await {
        warn!("Failed to write sidecar `{}`:  {err}", meta_path.display());
    }

    match tokio::fs::rename(temp_path, final_path).await {
        Ok(()) => {
            info!(
                "Cached: {} ({})",
                final_path.display(),
                HumanFmt::Size(size)
            );
            true
        }
        Err(err) => {
            warn!("Failed to cache file `{}`:  {err}", final_path.display());
            let _ = tokio::fs::remove_file(temp_path).await;
            let _ = tokio::fs::remove_file(&meta_path).await;
            false
        }
    }
}

/// Read-through body adapter: every data frame is handed to the cache
/// writer before it is yielded to the client, so the client never gets
/// ahead of the bytes persisted to the temporary file. Dropping the body
/// (client abort) or exhausting it closes the channel, which triggers
/// finalization. If the writer dies, streaming continues uncached.
#[pin_project]
pub(crate) struct TeeBody<B> {
    #[pin]
    inner: B,
    tx: Option<PollSender<Bytes>>,
    staged: Option<Bytes>,
}

impl<B> TeeBody<B> {
    #[must_use]
    pub(crate) fn new(inner: B, tx: tokio::sync::mpsc::Sender<Bytes>) -> Self {
        Self {
            inner,
            tx: Some(PollSender::new(tx)),
            staged: None,
        }
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        loop {
            if this.staged.is_some() {
                if let Some(tx) = this.tx.as_mut() {
                    match tx.poll_reserve(cx) {
                        Poll::Ready(Ok(())) => {
                            let chunk = this.staged.take().expect("staged chunk present");
                            if tx.send_item(chunk.clone()).is_err() {
                                *this.tx = None;
                            }
                            return Poll::Ready(Some(Ok(Frame::data(chunk))));
                        }
                        Poll::Ready(Err(_)) => {
                            /* writer gone; keep serving the client uncached */
                            *this.tx = None;
                            let chunk = this.staged.take().expect("staged chunk present");
                            return Poll::Ready(Some(Ok(Frame::data(chunk))));
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }

                let chunk = this.staged.take().expect("staged chunk present");
                return Poll::Ready(Some(Ok(Frame::data(chunk))));
            }

            match this.inner.as_mut().poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        *this.staged = Some(data);
                    }
                    Err(frame) => return Poll::Ready(Some(Ok(frame))),
                },
                Poll::Ready(Some(Err(err))) => {
                    /* short body; the writer discards on close */
                    *this.tx = None;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    *this.tx = None;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.staged.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use http_body_util::{BodyExt as _, Full};

    fn scratch_dir() -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);

        let dir = std::env::temp_dir().join(format!(
            "pkg-cacher-fetch-test-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn finalize_publishes_complete_download() {
        let dir = scratch_dir();
        let final_path = dir.join("artifact.deb");
        let temp_path = crate::cache::tmp_path(&final_path);

        tokio::fs::write(&temp_path, b"0123456789").await.unwrap();

        assert!(finalize_entry(&temp_path, &final_path, Some(10)).await);
        assert!(!temp_path.exists());
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"0123456789");
        assert_eq!(
            tokio::fs::read_to_string(sidecar_path(&final_path))
                .await
                .unwrap(),
            "10\n"
        );
    }

    #[tokio::test]
    async fn finalize_discards_truncated_download() {
        let dir = scratch_dir();
        let final_path = dir.join("artifact.deb");
        let temp_path = crate::cache::tmp_path(&final_path);

        tokio::fs::write(&temp_path, b"01234").await.unwrap();

        assert!(!finalize_entry(&temp_path, &final_path, Some(1000)).await);
        assert!(!temp_path.exists());
        assert!(!final_path.exists());
        assert!(!sidecar_path(&final_path).exists());
    }

    #[tokio::test]
    async fn finalize_discards_empty_download() {
        let dir = scratch_dir();
        let final_path = dir.join("artifact.deb");
        let temp_path = crate::cache::tmp_path(&final_path);

        tokio::fs::write(&temp_path, b"").await.unwrap();

        assert!(!finalize_entry(&temp_path, &final_path, None).await);
        assert!(!temp_path.exists());
        assert!(!final_path.exists());
    }

    #[tokio::test]
    async fn finalize_accepts_unknown_length() {
        let dir = scratch_dir();
        let final_path = dir.join("artifact.deb");
        let temp_path = crate::cache::tmp_path(&final_path);

        tokio::fs::write(&temp_path, b"chunked payload").await.unwrap();

        assert!(finalize_entry(&temp_path, &final_path, None).await);
        assert!(final_path.exists());
    }

    #[tokio::test]
    async fn tee_streams_to_client_and_cache() {
        let dir = scratch_dir();
        let final_path = dir.join("artifact.deb");
        let temp_path = crate::cache::tmp_path(&final_path);

        let file = tokio::fs::File::create(&temp_path).await.unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let writer = tokio::task::spawn(cache_writer(
            rx,
            file,
            temp_path.clone(),
            final_path.clone(),
            Some(11),
            8192,
        ));

        let body = TeeBody::new(Full::new(Bytes::from_static(b"hello world")), tx);
        let delivered = body.collect().await.unwrap().to_bytes();
        assert_eq!(delivered.as_ref(), b"hello world");

        writer.await.unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"hello world");
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn dropped_tee_discards_temporary_file() {
        let dir = scratch_dir();
        let final_path = dir.join("artifact.deb");
        let temp_path = crate::cache::tmp_path(&final_path);

        let file = tokio::fs::File::create(&temp_path).await.unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let writer = tokio::task::spawn(cache_writer(
            rx,
            file,
            temp_path.clone(),
            final_path.clone(),
            Some(1000),
            8192,
        ));

        let body = TeeBody::new(Full::new(Bytes::from_static(b"partial")), tx);
        drop(body);

        writer.await.unwrap();
        assert!(!temp_path.exists());
        assert!(!final_path.exists());
    }

    #[test]
    fn dns_failures_are_recognized_by_message() {
        let io = std::io::Error::other(
            "failed to lookup address information: Name or service not known",
        );
        assert!(is_dns_failure(&io));

        let wrapped = std::io::Error::other(io);
        assert!(is_dns_failure(&wrapped));

        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(!is_dns_failure(&refused));
    }

    #[test]
    fn aggregate_error_reports_dns_and_count() {
        let err = FetchError::AllMirrorsFailed {
            tried: 3,
            last: Box::new(FetchError::Dns),
        };
        assert!(err.is_dns());
        assert_eq!(err.to_string(), "all 3 mirrors failed: DNS resolution failed");

        let err = FetchError::AllMirrorsFailed {
            tried: 2,
            last: Box::new(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE)),
        };
        assert!(!err.is_dns());
        assert!(err.to_string().starts_with("all 2 mirrors failed: HTTP 503"));
    }

    #[test]
    fn redirects_resolve_relative_locations() {
        let current: Uri = "http://deb.debian.org/debian/pool/x.deb".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, "/debian/pool/y.deb".parse().unwrap());
        assert_eq!(
            redirect_target(&current, &headers).unwrap().to_string(),
            "http://deb.debian.org/debian/pool/y.deb"
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            LOCATION,
            "http://cdn.example.org/debian/pool/x.deb".parse().unwrap(),
        );
        assert_eq!(
            redirect_target(&current, &headers).unwrap().to_string(),
            "http://cdn.example.org/debian/pool/x.deb"
        );

        assert_eq!(redirect_target(&current, &HeaderMap::new()), None);
    }

    #[test]
    fn content_length_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(declared_content_length(&headers), None);

        headers.insert(CONTENT_LENGTH, "1024".parse().unwrap());
        assert_eq!(declared_content_length(&headers), Some(1024));

        headers.insert(CONTENT_LENGTH, "garbage".parse().unwrap());
        assert_eq!(declared_content_length(&headers), None);
    }
}
