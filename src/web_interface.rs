use std::borrow::Cow;
use std::path::{Path, PathBuf};

use http_body_util::BodyExt as _;
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, SERVER};
use hyper::{Method, Request, Response, StatusCode};
use log::{error, info, warn};
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

use crate::config::Config;
use crate::mirrors::{self, GroupStatus};
use crate::task_cleanup::task_cleanup;
use crate::{APP_NAME, AppState, ProxyBody, full, quick_response};

const SEARCH_RESULT_LIMIT: usize = 100;

const SEARCH_DATE_FORMAT: &[FormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]");

/// Entry point for the non-proxy surface: liveness, statistics, cache
/// search and the authenticated admin API.
pub(crate) async fn serve(req: Request<Incoming>, state: AppState) -> Response<ProxyBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => health(&state),
        (&Method::GET, "/api/stats") => stats(&state),
        (&Method::GET, "/api/cache/search") => search(&req, &state).await,
        _ => {
            if !authorized(&req, &state.config.current().admin_token) {
                return quick_response(StatusCode::UNAUTHORIZED, "Unauthorized");
            }

            match (&method, path.as_str()) {
                (&Method::POST, "/api/reload") => reload(&state).await,
                (&Method::GET, "/api/admin/config") => get_config(&state),
                (&Method::PUT, "/api/admin/config") => update_config(req, &state).await,
                (&Method::GET, "/api/admin/mirrors") => get_mirrors(&state),
                (&Method::POST, "/api/admin/mirrors") => add_mirror(req, &state).await,
                (&Method::PUT | &Method::DELETE, _)
                    if path.starts_with("/api/admin/mirrors/") =>
                {
                    let name = path
                        .strip_prefix("/api/admin/mirrors/")
                        .expect("prefix checked above");
                    let name = match urlencoding::decode(name) {
                        Ok(name) => name.into_owned(),
                        Err(err) => {
                            warn!("Invalid mirror name encoding `{name}`:  {err}");
                            return quick_response(
                                StatusCode::BAD_REQUEST,
                                "Unsupported URL encoding",
                            );
                        }
                    };
                    if method == Method::PUT {
                        update_mirror(req, &name, &state).await
                    } else {
                        delete_mirror(&name, &state).await
                    }
                }
                (&Method::DELETE, "/api/admin/cache") => delete_cache_file(&req, &state).await,
                (&Method::GET, "/api/admin/blacklist") => get_blacklist(&state),
                (&Method::POST, "/api/admin/blacklist") => add_blacklist(req, &state).await,
                (&Method::DELETE, "/api/admin/blacklist") => remove_blacklist(&req, &state).await,
                (&Method::POST, "/api/admin/cleanup") => trigger_cleanup(&state),
                _ => quick_response(StatusCode::NOT_FOUND, "Resource not found"),
            }
        }
    }
}

#[must_use]
fn authorized<B>(req: &Request<B>, token: &str) -> bool {
    if token.is_empty() {
        return true;
    }

    let Some(header) = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };

    let received = header.strip_prefix("Bearer ").unwrap_or(header);
    received == token
}

#[must_use]
fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(err) => {
            error!("Failed to serialize response:  {err}");
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "Serialization failure");
        }
    };

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .body(full(body))
        .expect("HTTP response is valid")
}

#[must_use]
fn success() -> Response<ProxyBody> {
    json_response(StatusCode::OK, &json!({"status": "success"}))
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, Response<ProxyBody>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!("Failed to read request body:  {err}");
            return Err(quick_response(StatusCode::BAD_REQUEST, "Invalid body"));
        }
    };

    serde_json::from_slice(&body).map_err(|err| {
        warn!("Failed to parse request body:  {err}");
        quick_response(StatusCode::BAD_REQUEST, "Invalid JSON body")
    })
}

#[must_use]
fn query_param<'a, B>(req: &'a Request<B>, key: &str) -> Option<Cow<'a, str>> {
    let query = req.uri().query()?;

    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            return urlencoding::decode(v).ok();
        }
    }

    None
}

#[must_use]
fn health(state: &AppState) -> Response<ProxyBody> {
    let config = state.config.current();

    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "cache_path": config.storage_root,
        }),
    )
}

#[must_use]
fn stats(state: &AppState) -> Response<ProxyBody> {
    let snapshot = state.stats.snapshot();
    let (total_files, total_size, groups) = state.file_stats.snapshot();

    #[expect(clippy::cast_precision_loss)]
    let total_cache_size_mb = total_size as f64 / (1024.0 * 1024.0);

    json_response(
        StatusCode::OK,
        &json!({
            "requests_total": snapshot.requests_total,
            "cache_hits": snapshot.cache_hits,
            "cache_misses": snapshot.cache_misses,
            "bytes_served": snapshot.bytes_served,
            "uptime": format!("{}", crate::humanfmt::HumanFmt::Time(state.start_time.elapsed())),
            "total_files": total_files,
            "total_size": total_size,
            "total_cache_size_mb": total_cache_size_mb,
            "distro_stats": groups,
            "mirrors": state.mirrors.approved(),
            "logs": state.logstore.lines(),
        }),
    )
}

#[derive(Serialize)]
struct SearchResult {
    name: String,
    distro: String,
    size: u64,
    path: String,
    mtime: String,
}

/// Case-insensitive filename search over the storage tree. The result cap
/// is advisory; the walk stops once enough matches are collected.
async fn search(req: &Request<Incoming>, state: &AppState) -> Response<ProxyBody> {
    let Some(query) = query_param(req, "q").filter(|q| !q.is_empty()) else {
        return json_response(StatusCode::OK, &json!([]));
    };
    let query = query.to_lowercase();

    let storage_root = state.config.current().storage_root.clone();
    let mut results = Vec::new();
    let mut pending: Vec<PathBuf> = vec![storage_root.clone()];

    'walk: while let Some(current) = pending.pop() {
        let mut dir = match tokio::fs::read_dir(&current).await {
            Ok(dir) => dir,
            Err(err) => {
                warn!("Failed to list directory `{}`:  {err}", current.display());
                continue;
            }
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let entry_path = entry.path();

            let Ok(metadata) = entry.metadata().await else {
                continue;
            };

            if metadata.is_dir() {
                pending.push(entry_path);
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.to_lowercase().contains(&query) {
                continue;
            }

            let distro = entry_path
                .strip_prefix(&storage_root)
                .ok()
                .and_then(|rel| rel.components().next())
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .unwrap_or_default();

            let mtime = metadata
                .modified()
                .ok()
                .map(OffsetDateTime::from)
                .and_then(|odt| odt.format(SEARCH_DATE_FORMAT).ok())
                .unwrap_or_default();

            results.push(SearchResult {
                name,
                distro,
                size: metadata.len(),
                path: entry_path.display().to_string(),
                mtime,
            });

            if results.len() >= SEARCH_RESULT_LIMIT {
                break 'walk;
            }
        }
    }

    json_response(StatusCode::OK, &results)
}

async fn reload(state: &AppState) -> Response<ProxyBody> {
    let config_path = state.config.current().config_path.clone();

    let config = match Config::load(&config_path) {
        Ok((config, _fallback)) => config,
        Err(err) => {
            error!("Failed to reload configuration:  {err}");
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    };
    state.config.replace(config);

    if let Err(err) = state.mirrors.load_from_db(&state.database).await {
        error!("Failed to reload mirrors:  {err}");
        return quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    if let Err(err) = state.blacklist.load_from_db(&state.database).await {
        error!("Failed to reload blacklist:  {err}");
        return quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    info!("Configuration reloaded");
    json_response(StatusCode::OK, &json!({"status": "reloaded"}))
}

#[must_use]
fn get_config(state: &AppState) -> Response<ProxyBody> {
    let config = state.config.current();

    json_response(
        StatusCode::OK,
        &json!({
            "cache_days": config.cache_days,
            "cache_retention_enabled": config.cache_retention_enabled,
        }),
    )
}

#[derive(Deserialize)]
struct ConfigUpdate {
    cache_days: Option<u64>,
    cache_retention_enabled: Option<bool>,
}

async fn update_config(req: Request<Incoming>, state: &AppState) -> Response<ProxyBody> {
    let update: ConfigUpdate = match read_json_body(req).await {
        Ok(update) => update,
        Err(response) => return response,
    };

    let mut config = (*state.config.current()).clone();
    if let Some(cache_days) = update.cache_days {
        config.cache_days = cache_days;
    }
    if let Some(enabled) = update.cache_retention_enabled {
        config.cache_retention_enabled = enabled;
    }

    if let Err(err) = config.validate() {
        return quick_response(StatusCode::BAD_REQUEST, err.to_string());
    }

    if let Err(err) = config.save() {
        error!("Failed to persist configuration:  {err}");
        return quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    state.config.replace(config);
    success()
}

#[must_use]
fn get_mirrors(state: &AppState) -> Response<ProxyBody> {
    json_response(StatusCode::OK, &state.mirrors.all())
}

#[derive(Deserialize)]
struct NewMirror {
    name: String,
    urls: Vec<String>,
    status: Option<String>,
}

async fn add_mirror(req: Request<Incoming>, state: &AppState) -> Response<ProxyBody> {
    let mirror: NewMirror = match read_json_body(req).await {
        Ok(mirror) => mirror,
        Err(response) => return response,
    };

    if mirror.name.is_empty() || mirror.urls.is_empty() {
        return quick_response(StatusCode::BAD_REQUEST, "Missing name or urls");
    }

    let status = mirror
        .status
        .as_deref()
        .map_or(GroupStatus::Approved, GroupStatus::parse);

    match mirrors::save_group(
        &state.mirrors,
        &state.database,
        &state.client,
        &mirror.name,
        mirror.urls,
        status,
    )
    .await
    {
        Ok(_stored) => success(),
        Err(err) => {
            error!("Failed to save mirror group `{}`:  {err}", mirror.name);
            quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

#[derive(Deserialize)]
struct MirrorUpdate {
    urls: Option<Vec<String>>,
    status: Option<String>,
}

async fn update_mirror(
    req: Request<Incoming>,
    name: &str,
    state: &AppState,
) -> Response<ProxyBody> {
    let update: MirrorUpdate = match read_json_body(req).await {
        Ok(update) => update,
        Err(response) => return response,
    };

    if let Some(urls) = update.urls {
        let urls_json =
            serde_json::to_string(&urls).expect("string array serialization cannot fail");
        if let Err(err) = state.database.update_mirror_urls(name, &urls_json).await {
            error!("Failed to update mirror `{name}`:  {err}");
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    }

    if let Some(status) = update.status.filter(|status| !status.is_empty()) {
        let status = GroupStatus::parse(&status);
        if let Err(err) = state
            .database
            .update_mirror_status(name, status.as_str())
            .await
        {
            error!("Failed to update mirror `{name}`:  {err}");
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    }

    if let Err(err) = state.mirrors.load_from_db(&state.database).await {
        error!("Failed to reload mirrors:  {err}");
        return quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    success()
}

async fn delete_mirror(name: &str, state: &AppState) -> Response<ProxyBody> {
    if let Err(err) = state.database.delete_mirror(name).await {
        error!("Failed to delete mirror `{name}`:  {err}");
        return quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    state.mirrors.remove(name);
    info!("Deleted mirror group `{name}`");
    success()
}

async fn delete_cache_file(req: &Request<Incoming>, state: &AppState) -> Response<ProxyBody> {
    let Some(path) = query_param(req, "path").filter(|path| !path.is_empty()) else {
        return quick_response(StatusCode::BAD_REQUEST, "Missing path parameter");
    };

    match state.cache.delete(Path::new(path.as_ref())).await {
        Ok(()) => success(),
        Err(err) => quick_response(StatusCode::NOT_FOUND, err.to_string()),
    }
}

#[must_use]
fn get_blacklist(state: &AppState) -> Response<ProxyBody> {
    json_response(StatusCode::OK, &state.blacklist.patterns())
}

#[derive(Deserialize)]
struct NewPattern {
    pattern: String,
}

async fn add_blacklist(req: Request<Incoming>, state: &AppState) -> Response<ProxyBody> {
    let body: NewPattern = match read_json_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    if body.pattern.is_empty() {
        return quick_response(StatusCode::BAD_REQUEST, "Missing pattern");
    }

    if let Err(err) = state.database.add_blacklist_pattern(&body.pattern).await {
        error!("Failed to store blacklist pattern:  {err}");
        return quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    state.blacklist.add(body.pattern.clone());
    info!("Added blacklist pattern: {}", body.pattern);
    success()
}

async fn remove_blacklist(req: &Request<Incoming>, state: &AppState) -> Response<ProxyBody> {
    let Some(pattern) = query_param(req, "pattern").filter(|pattern| !pattern.is_empty()) else {
        return quick_response(StatusCode::BAD_REQUEST, "Missing pattern parameter");
    };

    if let Err(err) = state.database.remove_blacklist_pattern(&pattern).await {
        error!("Failed to remove blacklist pattern:  {err}");
        return quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    state.blacklist.remove(&pattern);
    info!("Removed blacklist pattern: {pattern}");
    success()
}

#[must_use]
fn trigger_cleanup(state: &AppState) -> Response<ProxyBody> {
    let state = state.clone();
    tokio::task::spawn(async move {
        task_cleanup(&state).await;
    });

    json_response(StatusCode::OK, &json!({"status": "cleanup started"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_auth(header: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/api/admin/config");
        if let Some(header) = header {
            builder = builder.header(AUTHORIZATION, header);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn empty_token_disables_auth() {
        assert!(authorized(&request_with_auth(None), ""));
        assert!(authorized(&request_with_auth(Some("anything")), ""));
    }

    #[test]
    fn bearer_token_is_checked() {
        assert!(authorized(&request_with_auth(Some("Bearer secret")), "secret"));
        assert!(authorized(&request_with_auth(Some("secret")), "secret"));
        assert!(!authorized(&request_with_auth(Some("Bearer wrong")), "secret"));
        assert!(!authorized(&request_with_auth(None), "secret"));
    }

    #[test]
    fn query_params_are_decoded() {
        let req = Request::builder()
            .uri("/api/cache/search?q=linux%2Dimage&x=1")
            .body(())
            .unwrap();

        assert_eq!(query_param(&req, "q").as_deref(), Some("linux-image"));
        assert_eq!(query_param(&req, "x").as_deref(), Some("1"));
        assert_eq!(query_param(&req, "missing"), None);
    }
}
