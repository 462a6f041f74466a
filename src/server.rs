//! Contains the HTTP server component of SHDB.
//!
//! Opens a server socket on the specified port (**server.port** in the config or 8443 as fallback)
//! and binds it to the selected IP (**server.host** in the config or 0.0.0.0 as fallback). Each
//! incoming request is handed to the [Router](crate::router::Router) which serves it from the
//! file cache, the document store or the fallback handler.
//!
//! Note that in order to achieve zero downtime / ultra high availability demands, the server will
//! periodically try to bind the socket to the selected port, therefore a "new" instance can
//! be started and the "old" one can bleed out and the port will be "handed through" with minimal
//! downtime. Also, this will listen to change events of the config and will relocate to another
//! port or host if changed.
//!
//! # Example
//!
//! ```no_run
//! use shdb::builder::Builder;
//! use shdb::config::Config;
//! use shdb::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     //  Setup and create a platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Specify a minimal config so that we run on a different port than a
//!     // production instance.
//!     platform.require::<Config>().load_from_string("
//!         server:
//!             port: 8444
//!     ", None).unwrap();
//!
//!     shdb::store::install(platform.clone()).await.unwrap();
//!     shdb::files::install(platform.clone()).await.unwrap();
//!
//!     // Run the platform...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};

use crate::average::Average;
use crate::config::Config;
use crate::fmt::format_short_duration;
use crate::platform::Platform;
use crate::router::Router;
use crate::spawn;

/// Specifies the interval in which the shutdown conditions are re-checked.
///
/// While waiting for requests we need to wake up every once in a while to check if either
/// the platform is being shut down or a restart onto a new address was requested.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Represents the HTTP server.
///
/// The server is installed by the [Builder](crate::builder::Builder) but has to be started
/// manually by invoking [event_loop](Server::event_loop), as this is most probably done in
/// the main thread.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    platform: Arc<Platform>,
    latencies: Average,
}

impl Server {
    /// Creates and installs a **Server** into the given **Platform**.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    ///
    /// Also note, that this will not technically start the server. This has to be done
    /// manually via [event_loop](Server::event_loop).
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            platform: platform.clone(),
            latencies: Average::new(),
        });

        platform.register::<Server>(server.clone());

        server
    }

    /// Provides the sliding average of the request latencies.
    pub fn latencies(&self) -> &Average {
        &self.latencies
    }

    /// Determines if the server socket should keep serving requests.
    ///
    /// In contrast to **Platform::is_running** this is not used to control the shutdown of
    /// the server. Rather we toggle this flag to false if a config and therefore address
    /// change was detected. This way **server_loop** will exit and a new server socket for
    /// the appropriate address will be set up by the **event_loop**.
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the server address based on the current configuration.
    ///
    /// If no, an invalid or a partial config is present, fallback values are used. By
    /// default we use port 8443 and bind to "0.0.0.0".
    fn address(&self) -> String {
        self.platform
            .find::<Config>()
            .map(|config| {
                let handle = config.current();
                format!(
                    "{}:{}",
                    handle.config()["server"]["host"]
                        .as_str()
                        .unwrap_or("0.0.0.0"),
                    handle.config()["server"]["port"]
                        .as_i64()
                        .filter(|port| port > &0 && port <= &(u16::MAX as i64))
                        .unwrap_or(8443)
                )
            })
            .unwrap_or_else(|| "0.0.0.0:8443".to_owned())
    }

    /// Starts the event loop in a separate thread.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main
    /// thread.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate thread and waits until the server is up and
    /// running.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while server.current_address.lock().unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Tries to open a server socket on the configured address and serve requests from it.
    ///
    /// The task of this loop is to bind the server socket to the configured address. Once
    /// this was successful, we enter the [server_loop](Server::server_loop) to actually
    /// handle requests. Once this loop returns, either the platform is no longer running
    /// and we should exit, or the config has changed and we should try to bind the server
    /// to the new address.
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported = Instant::now();

        while self.platform.is_running() {
            // If the server is started for the first time or if it has been restarted due
            // to a config change, we need to reload the address...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            if let Err(error) = self.server_loop(&address).await {
                // If we were unable to bind to the server, we log this every once in a
                // while (every 5s). Otherwise we would jam the log as we retry every 500ms.
                if Instant::now()
                    .duration_since(last_bind_error_reported)
                    .as_secs()
                    > 5
                {
                    log::error!(
                        "Cannot serve on address {}: {}. Retrying every 500ms...",
                        &address,
                        error
                    );
                    last_bind_error_reported = Instant::now();
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    /// Runs a hyper server on the given address until a shutdown condition is met.
    ///
    /// The graceful shutdown is driven by [shutdown_signal](Server::shutdown_signal),
    /// which observes both the platform state and config changes.
    async fn server_loop(&self, address: &str) -> anyhow::Result<()> {
        let socket_address: SocketAddr = address
            .parse()
            .with_context(|| format!("Invalid server address: {}", address))?;

        let router = Arc::new(Router::new(&self.platform));
        let platform = self.platform.clone();
        let service = make_service_fn(move |_connection| {
            let router = router.clone();
            let platform = platform.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    handle_request(platform.clone(), router.clone(), request)
                }))
            }
        });

        let server = hyper::Server::try_bind(&socket_address)
            .with_context(|| format!("Cannot open server address: {}", address))?
            .serve(service);

        log::info!("Opened server socket on {}...", address);
        *self.current_address.lock().unwrap() = Some(address.to_owned());

        server
            .with_graceful_shutdown(self.shutdown_signal())
            .await
            .context("The server loop failed")?;

        log::info!("Closed server socket on {}.", address);

        Ok(())
    }

    /// Completes once the running server should shut down.
    ///
    /// This is either the case because the platform is terminating or because a config
    /// change moved the server to another address. In the latter case the **running** flag
    /// is cleared so that the **event_loop** re-evaluates the address and binds again.
    async fn shutdown_signal(&self) {
        // Keeps a sender alive so that the receiver below never fails fast if no config
        // is registered...
        let (_tx, fallback_notifier) = tokio::sync::broadcast::channel::<()>(1);
        let mut config_changed = match self.platform.find::<Config>() {
            Some(config) => config.notifier(),
            None => fallback_notifier,
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep(SHUTDOWN_POLL_INTERVAL) => {
                    if !self.platform.is_running() || !self.is_running() {
                        return;
                    }
                }
                _ = config_changed.recv() => {
                    // If the config was changed, we need to check if the address itself
                    // changed...
                    let new_address = self.address();
                    let address_changed = self
                        .current_address
                        .lock()
                        .unwrap()
                        .as_deref()
                        .map(|current_address| current_address != new_address)
                        .unwrap_or(false);

                    if address_changed {
                        log::info!("Server address has changed. Restarting server socket...");

                        // Force the event_loop to re-evaluate the expected server address...
                        self.running.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }
}

/// Handles a single request.
///
/// Delegates the actual work to the router and takes care of the ambient concerns: the
/// latency is recorded in the server's sliding average and each request is logged along
/// with its status and duration.
async fn handle_request(
    platform: Arc<Platform>,
    router: Arc<Router>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let watch = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let response = router.dispatch(request).await;

    let duration = watch.elapsed().as_micros() as i32;
    if let Some(server) = platform.find::<Server>() {
        server.latencies.add(duration);
    }
    log::debug!(
        "{} {} -> {} ({})",
        method,
        path,
        response.status().as_u16(),
        format_short_duration(duration)
    );

    Ok(response)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use hyper::{Body, Method, Request, Response, StatusCode, Uri};
    use serde_json::{json, Value};

    use crate::builder::Builder;
    use crate::config::Config;
    use crate::platform::Platform;
    use crate::router::{Fallback, FallbackHandler};
    use crate::server::Server;
    use crate::testing::{test_async, SHARED_TEST_RESOURCES};

    const TEST_DOCUMENT: &str = r#"{
        "users": [
            { "id": 1, "name": "Anna", "age": 30, "_token": "hunter2",
              "status": { "online": true } },
            { "id": 2, "name": "Ben", "age": 23, "status": { "online": false } }
        ],
        "_secrets": [ { "id": 1, "key": "xyz" } ]
    }"#;

    /// Seeds a scratch directory below target/ and boots a complete platform serving it
    /// on the given port.
    async fn setup_environment(port: u16, root: &str) -> Arc<Platform> {
        let _ = tokio::fs::remove_dir_all(root).await;
        tokio::fs::create_dir_all(format!("{}/public/assets", root))
            .await
            .unwrap();
        tokio::fs::write(format!("{}/public/index.html", root), "<html>SHDB</html>")
            .await
            .unwrap();
        tokio::fs::write(format!("{}/public/assets/app.css", root), "body {}")
            .await
            .unwrap();
        tokio::fs::write(format!("{}/db.json", root), TEST_DOCUMENT)
            .await
            .unwrap();

        let platform = Builder::new().enable_all().disable_signals().build().await;
        platform
            .require::<Config>()
            .load_from_string(
                &format!(
                    "
server:
    host: 127.0.0.1
    port: {}
    public_dir: {}/public
    db_file: {}/db.json
",
                    port, root, root
                ),
                None,
            )
            .unwrap();

        let _ = crate::store::install(platform.clone()).await.unwrap();
        let _ = crate::files::install(platform.clone()).await.unwrap();

        platform
    }

    fn uri(port: u16, path: &str) -> Uri {
        format!("http://127.0.0.1:{}{}", port, path).parse().unwrap()
    }

    async fn body_bytes(response: Response<Body>) -> Vec<u8> {
        hyper::body::to_bytes(response.into_body())
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: Response<Body>) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    async fn send(
        client: &hyper::Client<hyper::client::HttpConnector>,
        method: Method,
        target: Uri,
        body: &str,
    ) -> Response<Body> {
        let request = Request::builder()
            .method(method)
            .uri(target)
            .body(Body::from(body.to_owned()))
            .unwrap();
        client.request(request).await.unwrap()
    }

    #[test]
    fn integration_test() {
        // We want exclusive access to both, the scratch directory and the test port on
        // which we fire up a server for our integration tests...
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let port = 17403;
            let platform = setup_environment(port, "target/server-tests/base").await;
            Server::fork_and_await(&platform.require::<Server>()).await;

            let client = hyper::Client::new();

            // Static delivery: "/" and "/index.html" serve the same bytes...
            let root = client.get(uri(port, "/")).await.unwrap();
            assert_eq!(root.status(), StatusCode::OK);
            assert_eq!(
                root.headers().get("X-Content-Type-Options").unwrap(),
                "nosniff"
            );
            let root_bytes = body_bytes(root).await;

            let index = client.get(uri(port, "/index.html")).await.unwrap();
            assert_eq!(body_bytes(index).await, root_bytes);

            let css = client.get(uri(port, "/assets/app.css")).await.unwrap();
            assert_eq!(css.status(), StatusCode::OK);
            assert_eq!(css.headers().get("Content-Type").unwrap(), "text/css");

            // Unknown paths end up in the default fallback...
            let missing = client.get(uri(port, "/missing.txt")).await.unwrap();
            assert_eq!(missing.status(), StatusCode::NOT_FOUND);

            // The whole document is served without private fields or collections...
            let doc = client.get(uri(port, "/shdb/json/")).await.unwrap();
            assert_eq!(doc.status(), StatusCode::OK);
            let doc = body_json(doc).await;
            assert_eq!(doc.get("_secrets"), None);
            assert_eq!(doc["users"][0].get("_token"), None);

            // Nested filters, sorting and pagination work over the wire...
            let online = client
                .get(uri(port, "/shdb/json/users?status.online=true"))
                .await
                .unwrap();
            let online = body_json(online).await;
            assert_eq!(online.as_array().unwrap().len(), 1);
            assert_eq!(online[0]["id"], json!(1));

            let sorted = client
                .get(uri(port, "/shdb/json/users?_sort=age&_order=desc&_page=1&_limit=1"))
                .await
                .unwrap();
            let sorted = body_json(sorted).await;
            assert_eq!(sorted.as_array().unwrap().len(), 1);
            assert_eq!(sorted[0]["name"], json!("Anna"));

            // Records resolve by id, unknown ids yield 404...
            let ben = client.get(uri(port, "/shdb/json/users/2")).await.unwrap();
            assert_eq!(ben.status(), StatusCode::OK);
            assert_eq!(body_json(ben).await["name"], json!("Ben"));

            let nobody = client.get(uri(port, "/shdb/json/users/9")).await.unwrap();
            assert_eq!(nobody.status(), StatusCode::NOT_FOUND);

            // Private collections are invisible through the API...
            let secrets = client.get(uri(port, "/shdb/json/_secrets")).await.unwrap();
            assert_eq!(secrets.status(), StatusCode::NOT_FOUND);

            // Writes: conflicts, validation and the full lifecycle...
            let conflict = send(
                &client,
                Method::POST,
                uri(port, "/shdb/json/users"),
                r#"{ "id": 2, "name": "Ben II" }"#,
            )
            .await;
            assert_eq!(conflict.status(), StatusCode::CONFLICT);

            let no_id = send(
                &client,
                Method::POST,
                uri(port, "/shdb/json/users"),
                r#"{ "name": "Clara" }"#,
            )
            .await;
            assert_eq!(no_id.status(), StatusCode::BAD_REQUEST);

            let created = send(
                &client,
                Method::POST,
                uri(port, "/shdb/json/users"),
                r#"{ "id": 3, "name": "Clara" }"#,
            )
            .await;
            assert_eq!(created.status(), StatusCode::CREATED);
            assert_eq!(body_json(created).await["name"], json!("Clara"));

            let updated = send(
                &client,
                Method::PUT,
                uri(port, "/shdb/json/users/3"),
                r#"{ "id": 3, "name": "Klara" }"#,
            )
            .await;
            assert_eq!(updated.status(), StatusCode::OK);

            let deleted = send(&client, Method::DELETE, uri(port, "/shdb/json/users/3"), "").await;
            assert_eq!(deleted.status(), StatusCode::OK);

            let gone = client.get(uri(port, "/shdb/json/users/3")).await.unwrap();
            assert_eq!(gone.status(), StatusCode::NOT_FOUND);

            // Unknown methods below the API prefix are rejected...
            let patch = send(&client, Method::PATCH, uri(port, "/shdb/json/users/1"), "{}").await;
            assert_eq!(patch.status(), StatusCode::METHOD_NOT_ALLOWED);

            // The persisted file still contains all private data...
            let disk = tokio::fs::read_to_string("target/server-tests/base/db.json")
                .await
                .unwrap();
            assert_eq!(disk.contains("hunter2"), true);
            assert_eq!(disk.contains("_secrets"), true);

            platform.terminate();
        });
    }

    struct TeapotFallback;

    #[async_trait]
    impl FallbackHandler for TeapotFallback {
        async fn handle(&self, _request: Request<Body>) -> Response<Body> {
            let mut response = Response::new(Body::from("teapot"));
            *response.status_mut() = StatusCode::IM_A_TEAPOT;
            response
        }
    }

    #[test]
    fn custom_fallback_handles_delegated_requests() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let port = 17404;
            let platform = setup_environment(port, "target/server-tests/fallback").await;
            platform.register::<Fallback>(Arc::new(Fallback(Arc::new(TeapotFallback))));
            Server::fork_and_await(&platform.require::<Server>()).await;

            let client = hyper::Client::new();

            // Cached files and the API still win...
            let index = client.get(uri(port, "/index.html")).await.unwrap();
            assert_eq!(index.status(), StatusCode::OK);

            // ...everything else is delegated to the custom handler...
            let delegated = client.get(uri(port, "/custom/endpoint")).await.unwrap();
            assert_eq!(delegated.status(), StatusCode::IM_A_TEAPOT);
            assert_eq!(body_bytes(delegated).await, b"teapot");

            platform.terminate();
        });
    }
}
