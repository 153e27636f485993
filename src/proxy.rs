use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::TryStreamExt as _;
use http_body_util::{BodyExt as _, StreamBody};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{
    ACCEPT_RANGES, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
    HeaderValue, IF_MODIFIED_SINCE, IF_RANGE, LAST_MODIFIED, RANGE, SERVER, TRANSFER_ENCODING,
};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, error, info, warn};
use pin_project::{pin_project, pinned_drop};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

use crate::cache::basename;
use crate::error::ProxyCacheError;
use crate::fetch::{self, PASSTHROUGH_TIMEOUT};
use crate::http_range::{http_datetime_to_systemtime, resolve_byte_range, systemtime_to_http_datetime};
use crate::humanfmt::HumanFmt;
use crate::mirrors::upstream_key;
use crate::stats::Stats;
use crate::{APP_NAME, AppState, ProxyBody, empty, quick_response, web_interface};

const CONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Counts the bytes that actually reached the client. Attribution happens
/// on drop, which fires for completed and aborted deliveries alike.
#[pin_project(PinnedDrop)]
pub(crate) struct DeliveryBody<B> {
    #[pin]
    inner: B,
    resource: String,
    client: IpAddr,
    size: Option<u64>,
    transferred: u64,
    start: Instant,
    stats: Stats,
}

impl<B> DeliveryBody<B> {
    #[must_use]
    pub(crate) fn new(
        inner: B,
        resource: String,
        client: IpAddr,
        size: Option<u64>,
        stats: Stats,
    ) -> Self {
        Self {
            inner,
            resource,
            client,
            size,
            transferred: 0,
            start: Instant::now(),
            stats,
        }
    }
}

impl<B> Body for DeliveryBody<B>
where
    B: Body<Data = Bytes, Error = ProxyCacheError>,
{
    type Data = Bytes;
    type Error = ProxyCacheError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        let result = this.inner.poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &result {
            if let Some(data) = frame.data_ref() {
                *this.transferred += data.len() as u64;
            }
        }

        result
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pinned_drop]
impl<B> PinnedDrop for DeliveryBody<B> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        let transferred = *this.transferred;
        let elapsed = this.start.elapsed();

        this.stats.add_bytes_served(transferred);

        match this.size {
            Some(size) if *size == transferred => {
                info!(
                    "Served {} for client {} in {} ({}, {})",
                    this.resource,
                    this.client,
                    HumanFmt::Time(elapsed),
                    HumanFmt::Size(transferred),
                    HumanFmt::Rate(transferred, elapsed)
                );
            }
            Some(size) => {
                warn!(
                    "Delivery of {} for client {} ended after {} of {} bytes ({})",
                    this.resource,
                    this.client,
                    HumanFmt::Size(transferred),
                    HumanFmt::Size(*size),
                    HumanFmt::Time(elapsed)
                );
            }
            None => {
                info!(
                    "Served {} for client {} in {} ({})",
                    this.resource,
                    this.client,
                    HumanFmt::Time(elapsed),
                    HumanFmt::Size(transferred)
                );
            }
        }
    }
}

/// Strips an embedded absolute-form prefix, as sent by clients that put the
/// full URL into the request path. Returns the path below the authority.
#[must_use]
pub(crate) fn normalize_request_path(path: &str) -> &str {
    let path = path.trim_start_matches('/');

    if path.starts_with("http://") || path.starts_with("https://") {
        let mut parts = path.splitn(4, '/');
        return parts.nth(3).unwrap_or("");
    }

    path
}

pub(crate) async fn handle_request(
    client: SocketAddr,
    req: Request<Incoming>,
    state: AppState,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        return handle_connect(client, req).await;
    }

    let uri_path = req.uri().path();
    if req.uri().authority().is_none()
        && (matches!(
            uri_path,
            "/health" | "/api/stats" | "/api/cache/search" | "/api/reload"
        ) || uri_path.starts_with("/api/admin/"))
    {
        return web_interface::serve(req, state).await;
    }

    let path = normalize_request_path(uri_path).to_string();

    let Some((distro, pkg_path)) = path.split_once('/') else {
        return handle_unknown(client, req, state).await;
    };
    let (distro, pkg_path) = (distro.to_string(), pkg_path.to_string());

    let key = upstream_key(&distro, &pkg_path);
    let urls = state
        .mirrors
        .urls_for(key)
        .or_else(|| state.mirrors.urls_for(&distro));

    match urls {
        Some(urls) => handle_group_request(client, req, &distro, key, &pkg_path, &urls, state).await,
        None => {
            debug!("No upstream configured for `{distro}` (key `{key}`)");
            handle_unknown(client, req, state).await
        }
    }
}

async fn handle_group_request(
    client: SocketAddr,
    req: Request<Incoming>,
    distro: &str,
    key: &str,
    pkg_path: &str,
    base_urls: &[String],
    state: AppState,
) -> Response<ProxyBody> {
    state.stats.inc_requests();

    info!("Request: /{distro}/{pkg_path}");

    let filename = basename(pkg_path);
    if state.blacklist.matches(filename) {
        info!("Blacklisted: {filename}, serving without caching");
        return serve_blacklisted(client, &req, pkg_path, base_urls, state).await;
    }

    let cache_path = match state.cache.path_for(distro, pkg_path).await {
        Ok(path) => path,
        Err(err) => {
            error!("Failed to prepare cache directory for /{distro}/{pkg_path}:  {err}");
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Cache Access Failure");
        }
    };

    if state.cache.is_fresh(&cache_path).await {
        state.stats.inc_cache_hits();
        info!("HIT: {}", cache_path.display());
        return serve_cached_file(client, &req, &cache_path, &state).await;
    }

    state.stats.inc_cache_misses();
    info!("MISS: {pkg_path} -> {key}");

    let upstream_urls: Vec<String> = base_urls
        .iter()
        .map(|base| format!("{base}/{pkg_path}"))
        .collect();

    let response = match fetch::stream_and_cache(
        &state.client,
        &upstream_urls,
        &cache_path,
        req.headers(),
        crate::config::DEFAULT_BUF_SIZE,
    )
    .await
    {
        Ok(response) => response,
        Err(err) if err.is_dns() => {
            error!("DNS resolution failed for all mirrors of `{key}`. Check network connectivity.");
            return quick_response(
                StatusCode::BAD_GATEWAY,
                "Upstream mirrors unreachable (DNS failure)",
            );
        }
        Err(err) => {
            error!("Download of /{distro}/{pkg_path} failed:  {err}");
            return quick_response(StatusCode::BAD_GATEWAY, "Failed to download from upstream");
        }
    };

    let size = fetch::declared_content_length(response.headers());
    let (parts, tee) = response.into_parts();

    let body = DeliveryBody::new(
        tee.map_err(ProxyCacheError::Hyper),
        format!("/{distro}/{pkg_path}"),
        client.ip().to_canonical(),
        size,
        state.stats.clone(),
    );

    Response::from_parts(parts, body.boxed())
}

/// Blacklisted artifacts are fetched with the normal mirror failover but
/// streamed straight through; no temporary file, no cache entry, and the
/// request counts as neither hit nor miss.
async fn serve_blacklisted(
    client: SocketAddr,
    req: &Request<Incoming>,
    pkg_path: &str,
    base_urls: &[String],
    state: AppState,
) -> Response<ProxyBody> {
    let upstream_urls: Vec<String> = base_urls
        .iter()
        .map(|base| format!("{base}/{pkg_path}"))
        .collect();

    let response = match fetch::fetch_failover(&state.client, &upstream_urls, req.headers()).await {
        Ok(response) => response,
        Err(err) if err.is_dns() => {
            error!("DNS resolution failed for all mirrors. Check network connectivity.");
            return quick_response(
                StatusCode::BAD_GATEWAY,
                "Upstream mirrors unreachable (DNS failure)",
            );
        }
        Err(err) => {
            error!("Download of blacklisted file {pkg_path} failed:  {err}");
            return quick_response(StatusCode::BAD_GATEWAY, "Failed to download from upstream");
        }
    };

    let size = fetch::declared_content_length(response.headers());
    let (parts, body) = response.into_parts();

    let body = DeliveryBody::new(
        body.map_err(ProxyCacheError::Hyper),
        format!("{pkg_path} (uncached)"),
        client.ip().to_canonical(),
        size,
        state.stats.clone(),
    );

    Response::from_parts(parts, body.boxed())
}

async fn serve_cached_file(
    client: SocketAddr,
    req: &Request<Incoming>,
    cache_path: &Path,
    state: &AppState,
) -> Response<ProxyBody> {
    let mut file = match tokio::fs::File::open(cache_path).await {
        Ok(file) => file,
        Err(err) => {
            error!("Error reading cache `{}`:  {err}", cache_path.display());
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Error reading cache");
        }
    };

    let metadata = match file.metadata().await {
        Ok(metadata) => metadata,
        Err(err) => {
            error!("Error reading cache `{}`:  {err}", cache_path.display());
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Error reading cache");
        }
    };

    let file_size = metadata.len();
    let modified = metadata
        .modified()
        .expect("platform should support modification time");

    if let Some(since) = req
        .headers()
        .get(IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(http_datetime_to_systemtime)
    {
        let to_secs = |time: std::time::SystemTime| {
            time.duration_since(UNIX_EPOCH)
                .map(|duration| duration.as_secs())
                .unwrap_or(0)
        };
        if to_secs(modified) <= to_secs(since) {
            let response = Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(
                    LAST_MODIFIED,
                    HeaderValue::try_from(systemtime_to_http_datetime(modified))
                        .expect("date string is valid"),
                )
                .header(SERVER, HeaderValue::from_static(APP_NAME))
                .body(empty())
                .expect("HTTP response is valid");
            return response;
        }
    }

    let byte_range = resolve_byte_range(
        req.headers().get(RANGE).and_then(|value| value.to_str().ok()),
        req.headers()
            .get(IF_RANGE)
            .and_then(|value| value.to_str().ok()),
        file_size,
        modified,
    );

    let (status, content_length, content_range) = match byte_range {
        Some(range) => {
            if let Err(err) = file.seek(std::io::SeekFrom::Start(range.start)).await {
                error!(
                    "Error seeking cached file `{}` to {}/{file_size}:  {err}",
                    cache_path.display(),
                    range.start
                );
                return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Error reading cache");
            }
            (
                StatusCode::PARTIAL_CONTENT,
                range.length,
                Some(range.content_range),
            )
        }
        None => (StatusCode::OK, file_size, None),
    };

    let reader = tokio_util::io::ReaderStream::with_capacity(
        file.take(content_length),
        crate::config::DEFAULT_BUF_SIZE,
    );
    let stream = reader.map_err(ProxyCacheError::Io).map_ok(Frame::data);

    let body = DeliveryBody::new(
        StreamBody::new(stream),
        cache_path.display().to_string(),
        client.ip().to_canonical(),
        Some(content_length),
        state.stats.clone(),
    );

    let mut response = Response::builder()
        .status(status)
        .header(CONNECTION, HeaderValue::from_static("keep-alive"))
        .header(CONTENT_LENGTH, HeaderValue::from(content_length))
        .header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        )
        .header(
            LAST_MODIFIED,
            HeaderValue::try_from(systemtime_to_http_datetime(modified))
                .expect("date string is valid"),
        )
        .header(ACCEPT_RANGES, HeaderValue::from_static("bytes"))
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .body(body.boxed())
        .expect("HTTP response is valid");

    if let Some(content_range) = content_range {
        response.headers_mut().insert(
            CONTENT_RANGE,
            content_range
                .try_into()
                .expect("content range string is valid"),
        );
    }

    response
}

/// Direct proxying for requests whose group is not registered. Only
/// enabled by configuration, only for absolute-form GET requests.
async fn handle_unknown(
    client: SocketAddr,
    req: Request<Incoming>,
    state: AppState,
) -> Response<ProxyBody> {
    if !state.config.current().passthrough_mode {
        return quick_response(StatusCode::NOT_FOUND, "Unsupported distro");
    }

    if req.method() != Method::GET {
        return quick_response(StatusCode::BAD_REQUEST, "Method not supported");
    }

    if req.uri().scheme().is_none() || req.uri().authority().is_none() {
        return quick_response(StatusCode::BAD_REQUEST, "Invalid proxy request");
    }

    let target = req.uri().to_string();
    info!("PROXY: {target}");

    let response =
        match fetch::fetch_upstream(&state.client, &target, req.headers(), PASSTHROUGH_TIMEOUT)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!("Proxy error:  {err}");
                return quick_response(StatusCode::BAD_GATEWAY, err.to_string());
            }
        };

    let (mut parts, body) = response.into_parts();

    /* hop-by-hop and representation headers the relayed stream invalidates */
    for header in [
        CONTENT_ENCODING,
        CONTENT_LENGTH,
        TRANSFER_ENCODING,
        CONNECTION,
    ] {
        parts.headers.remove(header);
    }

    let body = DeliveryBody::new(
        body.map_err(ProxyCacheError::Hyper),
        target,
        client.ip().to_canonical(),
        None,
        state.stats.clone(),
    );

    Response::from_parts(parts, body.boxed())
}

/// CONNECT target, taken from the `Host` header with the URI authority as
/// fallback.
#[must_use]
pub(crate) fn connect_target(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|host| !host.is_empty())
        .map(str::to_owned)
        .or_else(|| req.uri().authority().map(ToString::to_string))
}

async fn handle_connect(client: SocketAddr, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(target) = connect_target(&req) else {
        warn!("Invalid CONNECT request without target: {}", req.uri());
        return quick_response(StatusCode::BAD_REQUEST, "Cannot determine CONNECT target");
    };

    info!("CONNECT: {target}");

    /* Dial before answering; a dead target must surface as 502, not as an
     * established tunnel that dies immediately. */
    let upstream =
        match tokio::time::timeout(CONNECT_DIAL_TIMEOUT, tokio::net::TcpStream::connect(target.as_str()))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                error!("CONNECT to {target} failed:  {err}");
                return quick_response(StatusCode::BAD_GATEWAY, err.to_string());
            }
            Err(_) => {
                error!("CONNECT to {target} timed out");
                return quick_response(StatusCode::BAD_GATEWAY, "CONNECT dial timed out");
            }
        };

    /*
     * The `200 Connection Established` response must reach the client
     * through the normal response path; only afterwards does the
     * connection upgrade into an opaque byte tunnel.
     */
    let client_ip = client.ip().to_canonical();
    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(err) = tunnel(client_ip, upgraded, upstream, &target).await {
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::NotConnected
                            | std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::BrokenPipe
                    ) {
                        debug!("Tunnel for client {client_ip} to {target} closed:  {err}");
                    } else {
                        error!("Error tunneling client {client_ip} to {target}:  {err}");
                    }
                }
            }
            Err(err) => error!("Error upgrading connection for client {client_ip}:  {err}"),
        }
    });

    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(
            b"Connection Established",
        ));
    response
}

/// Opaque relay between the upgraded client connection and the upstream
/// socket. Returns when EITHER direction finishes; the other side's copy
/// unblocks when its connection is dropped here. Contents are never
/// inspected or cached.
async fn tunnel(
    client: IpAddr,
    upgraded: hyper::upgrade::Upgraded,
    mut upstream: tokio::net::TcpStream,
    target: &str,
) -> std::io::Result<()> {
    let start = Instant::now();

    let upgraded = hyper_util::rt::TokioIo::new(upgraded);
    let (mut client_read, mut client_write) = tokio::io::split(upgraded);
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let (direction, bytes) = tokio::select! {
        res = tokio::io::copy(&mut client_read, &mut upstream_write) => ("sent", res?),
        res = tokio::io::copy(&mut upstream_read, &mut client_write) => ("received", res?),
    };

    info!(
        "Tunneled client {client} {direction} {} with {target} in {}",
        HumanFmt::Size(bytes),
        HumanFmt::Time(start.elapsed())
    );

    Ok(())
}
