//! Static file resolver (spec section 4.7): root-prefix strip, ServeStatic
//! (extension allow-list + MIME + Cache-Control), and TryFiles (suffix
//! ladder + trailing-slash redirect).

use std::path::{Path, PathBuf};

use hyper::{Response, StatusCode};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::body::{self, ResponseBody};
use crate::config::StaticConfig;

/// Strip the configured root path from a request path (spec 4.7).
pub fn strip_root<'a>(root_path: &str, path: &'a str) -> &'a str {
    if root_path.is_empty() {
        return path;
    }
    match path.strip_prefix(root_path) {
        Some("") => "/",
        Some(rest) => rest,
        None => path,
    }
}

/// Resolve the longest-prefix cache-control override, else the default
/// (spec 4.1 tie-break iv, 4.7 ServeStatic).
fn cache_control_for(config: &StaticConfig, path: &str) -> String {
    let best = config
        .cache_overrides
        .iter()
        .filter(|o| path.starts_with(o.prefix.as_str()))
        .max_by_key(|o| o.prefix.len());

    let (max_age, immutable) = match best {
        Some(o) => (o.max_age_seconds, o.immutable),
        None => (config.cache_max_age_seconds, config.cache_immutable),
    };

    if immutable {
        format!("public, max-age={max_age}, immutable")
    } else {
        format!("public, max-age={max_age}")
    }
}

fn extension_allowed(config: &StaticConfig, path: &str) -> bool {
    if config.extensions.is_empty() {
        return Path::new(path).extension().is_some();
    }
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some(ext) => config.extensions.iter().any(|allowed| allowed.trim_start_matches('.') == ext),
        None => false,
    }
}

async fn serve_file(disk_path: &Path, cache_control: &str) -> Option<Response<ResponseBody>> {
    let metadata = tokio::fs::metadata(disk_path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    let file = File::open(disk_path).await.ok()?;
    let content_type = mime_guess::from_path(disk_path).first_or_octet_stream().to_string();
    let stream = ReaderStream::new(file);
    let body = http_body_util::StreamBody::new(futures::TryStreamExt::map_ok(stream, |chunk| {
        http_body_util::Frame::data(chunk)
    }))
    .map_err(|e| Box::new(e) as body::BoxError);
    use http_body_util::BodyExt;

    Some(
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", content_type)
            .header("cache-control", cache_control)
            .body(body.boxed())
            .expect("static file response is well-formed"),
    )
}

/// ServeStatic: applies only to paths with a recognized extension.
pub async fn serve_static(config: &StaticConfig, stripped_path: &str) -> Option<Response<ResponseBody>> {
    if !extension_allowed(config, stripped_path) {
        return None;
    }
    let disk_path = join_public(&config.public_dir, stripped_path)?;
    let cache_control = cache_control_for(config, stripped_path);
    serve_file(&disk_path, &cache_control).await
}

/// TryFiles: extensionless paths, suffix ladder, then directory redirect.
pub async fn try_files(config: &StaticConfig, stripped_path: &str) -> Option<Response<ResponseBody>> {
    for suffix in &config.try_files {
        let candidate = format!("{}{}", stripped_path.trim_end_matches('/'), suffix);
        if let Some(disk_path) = join_public(&config.public_dir, &candidate) {
            let cache_control = cache_control_for(config, &candidate);
            if let Some(resp) = serve_file(&disk_path, &cache_control).await {
                return Some(resp);
            }
        }
    }

    if config.normalize_trailing_slash && !stripped_path.ends_with('/') {
        if let Some(dir_path) = join_public(&config.public_dir, stripped_path) {
            let index = dir_path.join("index.html");
            if tokio::fs::metadata(&dir_path).await.map(|m| m.is_dir()).unwrap_or(false)
                && tokio::fs::metadata(&index).await.map(|m| m.is_file()).unwrap_or(false)
            {
                let location = format!("{stripped_path}/");
                debug!(%location, "try-files redirecting to directory index");
                return Some(
                    Response::builder()
                        .status(StatusCode::MOVED_PERMANENTLY)
                        .header("location", location)
                        .body(body::empty())
                        .expect("static redirect response is well-formed"),
                );
            }
        }
    }

    None
}

/// Joins `public_dir` and a request-derived path, rejecting `..` escapes.
fn join_public(public_dir: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.trim_start_matches('/');
    if relative.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(public_dir.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheOverride;

    #[test]
    fn root_strip_empty_result_becomes_root() {
        assert_eq!(strip_root("/showcase", "/showcase"), "/");
    }

    #[test]
    fn root_strip_removes_prefix() {
        assert_eq!(strip_root("/showcase", "/showcase/assets/a.js"), "/assets/a.js");
    }

    #[test]
    fn root_strip_passthrough_when_not_prefixed() {
        assert_eq!(strip_root("/showcase", "/other/a.js"), "/other/a.js");
    }

    #[test]
    fn cache_control_uses_longest_prefix_override() {
        let mut config = StaticConfig::default();
        config.cache_max_age_seconds = 60;
        config.cache_overrides = vec![
            CacheOverride { prefix: "/assets".into(), max_age_seconds: 3600, immutable: false },
            CacheOverride { prefix: "/assets/fonts".into(), max_age_seconds: 31536000, immutable: true },
        ];
        assert_eq!(cache_control_for(&config, "/assets/fonts/a.woff"), "public, max-age=31536000, immutable");
        assert_eq!(cache_control_for(&config, "/assets/a.js"), "public, max-age=3600");
        assert_eq!(cache_control_for(&config, "/other.js"), "public, max-age=60");
    }

    #[test]
    fn extension_allow_list_empty_means_any_extension() {
        let config = StaticConfig::default();
        assert!(extension_allowed(&config, "/a.js"));
        assert!(!extension_allowed(&config, "/a"));
    }

    #[test]
    fn extension_allow_list_restricts_matches() {
        let mut config = StaticConfig::default();
        config.extensions = vec!["js".into(), ".css".into()];
        assert!(extension_allowed(&config, "/a.js"));
        assert!(extension_allowed(&config, "/a.css"));
        assert!(!extension_allowed(&config, "/a.png"));
    }

    #[test]
    fn join_public_rejects_parent_escapes() {
        let base = PathBuf::from("/tmp/pub");
        assert!(join_public(&base, "/../etc/passwd").is_none());
        assert_eq!(join_public(&base, "/assets/a.js").unwrap(), PathBuf::from("/tmp/pub/assets/a.js"));
    }

    #[tokio::test]
    async fn serve_static_streams_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/a.js"), b"console.log(1)").unwrap();

        let mut config = StaticConfig::default();
        config.public_dir = dir.path().to_path_buf();

        let resp = serve_static(&config, "/assets/a.js").await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn try_files_finds_html_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("about.html"), b"<html></html>").unwrap();

        let mut config = StaticConfig::default();
        config.public_dir = dir.path().to_path_buf();

        let resp = try_files(&config, "/about").await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
