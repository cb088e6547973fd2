use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use percent_encoding::percent_decode_str;
use reqwest::Url;
use tiny_http::{Header, Request, Response, Server, StatusCode};

use crate::metrics::Metrics;
use crate::sync::SyncEngine;
use crate::tree::SiteTree;

/// Scanner noise answered with 404 before touching the filesystem.
const DENYLIST: [&str; 4] = ["/favicon.ico", "/robots.txt", "/config/", "/.git/config"];
const NOT_FOUND_BODY: &str = "404 page not found";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind HTTP listener on port {port}: {message}")]
    Bind { port: u16, message: String },
}

/// A file picked for a request path, opened under the tree's shared lock.
#[derive(Debug)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub status: u16,
    pub file: Option<File>,
}

/// Maps request paths onto files in the served tree.
#[derive(Debug, Clone)]
pub struct Resolver {
    tree: Arc<SiteTree>,
    suffix: String,
}

impl Resolver {
    pub fn new(tree: Arc<SiteTree>, suffix: impl Into<String>) -> Self {
        Self {
            tree,
            suffix: suffix.into(),
        }
    }

    /// Resolution order: `/` to the index page, then the cleaned path, then
    /// the cleaned path plus the story suffix, then the 404 page.
    pub fn resolve(&self, request_path: &str) -> ResolvedFile {
        let _shared = self.tree.read();
        let root = self.tree.content_dir();

        if request_path == "/" {
            let path = root.join(format!("index{}", self.suffix));
            let file = File::open(&path).ok();
            return ResolvedFile {
                path,
                status: 200,
                file,
            };
        }

        let cleaned = clean_path(request_path);
        if !cleaned.is_empty() {
            let direct = root.join(&cleaned);
            if let Some(file) = SiteTree::open_file(&direct) {
                return found(direct, file);
            }

            if !self.suffix.is_empty() {
                let with_suffix = root.join(format!("{cleaned}{}", self.suffix));
                if let Some(file) = SiteTree::open_file(&with_suffix) {
                    tracing::debug!(
                        path = %with_suffix.display(),
                        request = request_path,
                        "serving suffixed fallback"
                    );
                    return found(with_suffix, file);
                }
            }
        }

        let path = root.join(format!("404{}", self.suffix));
        let file = SiteTree::open_file(&path);
        ResolvedFile {
            path,
            status: 404,
            file,
        }
    }
}

fn found(path: PathBuf, file: File) -> ResolvedFile {
    ResolvedFile {
        path,
        status: 200,
        file: Some(file),
    }
}

/// Lexically normalizes a request path into a relative path that cannot
/// climb above the content root.
pub fn clean_path(raw: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// What to send back for one request.
#[derive(Debug)]
pub enum Reply {
    File {
        path: PathBuf,
        status: u16,
        file: File,
    },
    Text {
        status: u16,
        body: String,
    },
}

impl Reply {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Reply::Text {
            status,
            body: body.into(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Reply::File { status, .. } | Reply::Text { status, .. } => *status,
        }
    }
}

#[derive(Debug)]
pub struct RequestHandler {
    resolver: Resolver,
    engine: Arc<SyncEngine>,
    sync_path: String,
    api_token: String,
    metrics: Arc<Metrics>,
}

impl RequestHandler {
    pub fn new(
        engine: Arc<SyncEngine>,
        sync_path: impl Into<String>,
        api_token: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            resolver: Resolver::new(engine.tree(), engine.suffix()),
            engine,
            sync_path: sync_path.into(),
            api_token: api_token.into(),
            metrics,
        }
    }

    /// Routes a raw request target (path plus optional query).
    pub fn route(&self, target: &str, remote: &str) -> Reply {
        let Some((path, token)) = parse_target(target) else {
            self.metrics.inc_not_found();
            return Reply::text(404, NOT_FOUND_BODY);
        };

        if DENYLIST.contains(&path.as_str()) {
            self.metrics.inc_not_found();
            return Reply::text(404, NOT_FOUND_BODY);
        }

        tracing::debug!(path = %path, remote, "handling request");

        if path == self.sync_path {
            return self.handle_trigger(token.as_deref(), remote);
        }

        let resolved = self.resolver.resolve(&path);
        let reply = match resolved.file {
            Some(file) => Reply::File {
                path: resolved.path,
                status: resolved.status,
                file,
            },
            None => {
                tracing::debug!(path = %resolved.path.display(), "file unavailable");
                Reply::text(404, NOT_FOUND_BODY)
            }
        };

        if reply.status() == 404 {
            self.metrics.inc_not_found();
        } else {
            self.metrics.inc_file_served();
        }
        reply
    }

    fn handle_trigger(&self, token: Option<&str>, remote: &str) -> Reply {
        let authorized = !self.api_token.is_empty() && token == Some(self.api_token.as_str());
        if !authorized {
            self.metrics.inc_trigger_rejected();
            tracing::warn!(remote, "invalid sync token");
            return Reply::text(401, "Unable to handle your request");
        }

        tracing::info!(remote, "sync signal received");
        match self.engine.run_cycle() {
            Ok(outcome) => {
                tracing::info!(%outcome, "triggered sync finished");
                Reply::text(200, format!("Sync signal received: {outcome}"))
            }
            Err(err) => {
                tracing::error!(error = %err, "triggered sync failed");
                Reply::text(500, format!("Sync signal received, sync failed: {err}"))
            }
        }
    }

    pub fn handle(&self, request: Request) {
        let remote = request
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let reply = self.route(request.url(), &remote);

        let result = match reply {
            Reply::File { path, status, file } => {
                let mut response = Response::from_file(file).with_status_code(StatusCode(status));
                if let Ok(header) = Header::from_bytes("Content-Type", content_type(&path)) {
                    response.add_header(header);
                }
                request.respond(response)
            }
            Reply::Text { status, body } => {
                request.respond(Response::from_string(body).with_status_code(StatusCode(status)))
            }
        };

        if let Err(err) = result {
            tracing::debug!(remote = %remote, error = %err, "client went away before response");
        }
    }
}

/// Splits a request target into its percent-decoded path and `token` query
/// value.
fn parse_target(target: &str) -> Option<(String, Option<String>)> {
    let url = if target.starts_with('/') {
        Url::parse(&format!("http://localhost{target}")).ok()?
    } else {
        Url::parse(target).ok()?
    };
    let path = percent_decode_str(url.path())
        .decode_utf8_lossy()
        .into_owned();
    let token = url
        .query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned());
    Some((path, token))
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "" | "html" | "htm" => "text/html; charset=utf-8",
        "xml" => "text/xml; charset=utf-8",
        "json" => "application/json",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

pub fn bind(port: u16) -> Result<Server, ServerError> {
    Server::http(("0.0.0.0", port)).map_err(|err| ServerError::Bind {
        port,
        message: err.to_string(),
    })
}

/// Accepts requests on `workers` threads sharing the listener. Returns once
/// the listener is unblocked and every worker has drained.
pub fn serve(server: Server, handler: Arc<RequestHandler>, workers: usize) {
    let server = Arc::new(server);
    tracing::info!(addr = %server.server_addr(), workers, "serving site");

    let pool: Vec<_> = (0..workers.max(1))
        .map(|_| {
            let server = Arc::clone(&server);
            let handler = Arc::clone(&handler);
            thread::spawn(move || {
                for request in server.incoming_requests() {
                    handler.handle(request);
                }
            })
        })
        .collect();

    for worker in pool {
        if worker.join().is_err() {
            tracing::error!("http worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Read;

    use super::*;
    use crate::config::Layout;
    use crate::source::Source;

    const PAYLOAD: &str = r#"{"title":"T","stories":[{"anchor":"index","content":"home","canonical_url":"https://x/","updated_at":"2024-01-01T00:00:00Z"},{"anchor":"about","content":"about us"}],"error_page":"custom 404"}"#;

    struct Site {
        _dir: tempfile::TempDir,
        layout: Layout,
        engine: Arc<SyncEngine>,
        metrics: Arc<Metrics>,
    }

    fn site(suffix: &str) -> Site {
        let dir = tempfile::tempdir().expect("tempdir");
        let payload = dir.path().join("local.json");
        fs::write(&payload, PAYLOAD).expect("payload");
        let layout = Layout::new(dir.path().join("app"));
        let metrics = Arc::new(Metrics::new());
        let engine = Arc::new(SyncEngine::new(
            Source::Local(payload),
            &layout,
            suffix,
            false,
            Arc::clone(&metrics),
        ));
        Site {
            _dir: dir,
            layout,
            engine,
            metrics,
        }
    }

    fn handler(site: &Site) -> RequestHandler {
        RequestHandler::new(
            Arc::clone(&site.engine),
            "/.nrtk-sync",
            "secret",
            Arc::clone(&site.metrics),
        )
    }

    fn body(reply: Reply) -> String {
        match reply {
            Reply::File { mut file, .. } => {
                let mut out = String::new();
                file.read_to_string(&mut out).expect("read served file");
                out
            }
            Reply::Text { body, .. } => body,
        }
    }

    #[test]
    fn clean_path_never_climbs_above_root() {
        let root = Path::new("/srv/www");
        for raw in [
            "/../../etc/passwd",
            "/a/../../b",
            "/./../.././x",
            "/..",
            "/a/b/../../../../c",
            "//..//..//",
        ] {
            let cleaned = clean_path(raw);
            let joined = root.join(&cleaned);
            assert!(joined.starts_with(root), "{raw} escaped to {joined:?}");
            assert!(
                !cleaned.split('/').any(|s| s == ".."),
                "{raw} kept a parent segment"
            );
        }
        assert_eq!(clean_path("/a/./b/../c"), "a/c");
        assert_eq!(clean_path("/"), "");
    }

    #[test]
    fn parses_path_and_token() {
        let (path, token) = parse_target("/.nrtk-sync?token=a%20b&token=c").expect("target");
        assert_eq!(path, "/.nrtk-sync");
        assert_eq!(token.as_deref(), Some("a b"));

        let (path, token) = parse_target("/caf%C3%A9").expect("target");
        assert_eq!(path, "/café");
        assert_eq!(token, None);
    }

    #[test]
    fn resolves_with_suffix_fallback_then_404() {
        let site = site(".html");
        site.engine.run_cycle().expect("sync");
        let resolver = Resolver::new(site.engine.tree(), ".html");
        let www = &site.layout.content_dir;

        let root = resolver.resolve("/");
        assert_eq!((root.status, root.path.clone()), (200, www.join("index.html")));

        let direct = resolver.resolve("/sitemap.xml");
        assert_eq!((direct.status, direct.path), (200, www.join("sitemap.xml")));

        let fallback = resolver.resolve("/about");
        assert_eq!((fallback.status, fallback.path), (200, www.join("about.html")));

        let missing = resolver.resolve("/nowhere");
        assert_eq!(missing.status, 404);
        assert_eq!(missing.path, www.join("404.html"));
        assert!(missing.file.is_some());

        let escape = resolver.resolve("/../meta.json");
        assert_eq!(escape.status, 404);
    }

    #[test]
    fn empty_suffix_skips_fallback() {
        let site = site("");
        site.engine.run_cycle().expect("sync");
        let resolver = Resolver::new(site.engine.tree(), "");
        let www = &site.layout.content_dir;

        assert_eq!(resolver.resolve("/about").path, www.join("about"));

        fs::rename(www.join("about"), www.join("about.html")).expect("rename");
        let resolved = resolver.resolve("/about");
        assert_eq!(resolved.status, 404);
        assert_eq!(resolved.path, www.join("404"));
    }

    #[test]
    fn denylist_is_answered_without_filesystem() {
        let site = site(".html");
        let handler = handler(&site);
        for path in DENYLIST {
            let reply = handler.route(path, "test");
            assert_eq!(reply.status(), 404, "{path}");
            assert_eq!(body(reply), NOT_FOUND_BODY);
        }
        assert!(!site.layout.root.exists());
    }

    #[test]
    fn serves_custom_404_page_with_status() {
        let site = site(".html");
        site.engine.run_cycle().expect("sync");
        let reply = handler(&site).route("/missing/page", "test");
        assert_eq!(reply.status(), 404);
        assert_eq!(body(reply), "custom 404");
    }

    #[test]
    fn missing_index_is_plain_404() {
        let site = site(".html");
        let reply = handler(&site).route("/", "test");
        assert_eq!(reply.status(), 404);
        assert_eq!(body(reply), NOT_FOUND_BODY);
    }

    #[test]
    fn wrong_token_is_rejected_without_sync() {
        let site = site(".html");
        let handler = handler(&site);

        assert_eq!(handler.route("/.nrtk-sync?token=nope", "test").status(), 401);
        assert_eq!(handler.route("/.nrtk-sync", "test").status(), 401);

        assert!(!site.layout.meta_path.exists());
        let m = site.metrics.snapshot();
        assert_eq!((m.sync_cycles, m.triggers_rejected), (0, 2));
    }

    #[test]
    fn empty_configured_token_disables_trigger() {
        let site = site(".html");
        let handler = RequestHandler::new(
            Arc::clone(&site.engine),
            "/.nrtk-sync",
            "",
            Arc::clone(&site.metrics),
        );
        assert_eq!(handler.route("/.nrtk-sync?token=", "test").status(), 401);
        assert!(!site.layout.meta_path.exists());
    }

    #[test]
    fn valid_token_runs_cycle() {
        let site = site(".html");
        let handler = handler(&site);

        let reply = handler.route("/.nrtk-sync?token=secret", "test");
        assert_eq!(reply.status(), 200);
        assert!(body(reply).starts_with("Sync signal received"));
        assert!(site.layout.meta_path.exists());

        let reply = handler.route("/.nrtk-sync?token=secret", "test");
        assert_eq!(body(reply), "Sync signal received: nothing to update");
    }

    #[test]
    fn failed_triggered_cycle_is_reported() {
        let site = site(".html");
        fs::create_dir_all(&site.layout.root).expect("root");
        let handler = RequestHandler::new(
            Arc::new(SyncEngine::new(
                Source::Local(site.layout.root.join("absent.json")),
                &site.layout,
                ".html",
                false,
                Arc::clone(&site.metrics),
            )),
            "/.nrtk-sync",
            "secret",
            Arc::clone(&site.metrics),
        );

        let reply = handler.route("/.nrtk-sync?token=secret", "test");
        assert_eq!(reply.status(), 500);
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type(Path::new("a/index.html")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("a/index")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("sitemap.xml")), "text/xml; charset=utf-8");
        assert_eq!(content_type(Path::new("blob.bin")), "application/octet-stream");
    }

    #[test]
    fn serves_over_http() {
        let site = site(".html");
        site.engine.run_cycle().expect("sync");
        let handler = Arc::new(handler(&site));

        let server = Server::http("127.0.0.1:0").expect("server start");
        let addr = format!("http://{}", server.server_addr());
        thread::spawn(move || serve(server, handler, 2));

        let client = reqwest::blocking::Client::new();

        let index = client.get(format!("{addr}/")).send().expect("index");
        assert_eq!(index.status().as_u16(), 200);
        assert_eq!(
            index
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(index.text().expect("body"), "home");

        let about = client.get(format!("{addr}/about")).send().expect("about");
        assert_eq!(about.text().expect("body"), "about us");

        let robots = client.get(format!("{addr}/robots.txt")).send().expect("robots");
        assert_eq!(robots.status().as_u16(), 404);

        let denied = client
            .get(format!("{addr}/.nrtk-sync?token=bad"))
            .send()
            .expect("trigger");
        assert_eq!(denied.status().as_u16(), 401);
    }

    #[test]
    fn worker_pool_answers_more_clients_than_workers() {
        let site = site(".html");
        site.engine.run_cycle().expect("sync");
        let handler = Arc::new(handler(&site));

        let server = Server::http("127.0.0.1:0").expect("server start");
        let addr = format!("http://{}", server.server_addr());
        thread::spawn(move || serve(server, handler, 2));

        let clients: Vec<_> = (0..8)
            .map(|i| {
                let addr = addr.clone();
                thread::spawn(move || {
                    let target = if i % 2 == 0 {
                        format!("{addr}/.nrtk-sync?token=secret")
                    } else {
                        format!("{addr}/about")
                    };
                    reqwest::blocking::get(target)
                        .expect("request")
                        .status()
                        .as_u16()
                })
            })
            .collect();

        for client in clients {
            assert_eq!(client.join().expect("client thread"), 200);
        }
        let m = site.metrics.snapshot();
        assert_eq!((m.sync_cycles, m.files_served), (5, 4));
    }
}
