//! Loopback HTTP listener and command dispatcher.
//!
//! Each command from the API table is served on the URL path named after it
//! (`POST /StartEncode`, `GET /Version`, ...). Per request:
//!
//! `Received -> Authenticated | Rejected -> Dispatched -> Responded`
//!
//! Authentication is a shared-secret `token` header checked before dispatch;
//! `IsTokenSet` and `RegisterToken` are exempt so a fresh host can bootstrap
//! a secret. Unknown commands get 404, handler panics are caught at the
//! dispatch boundary and surfaced as 500 - a failed request never takes down
//! the serve loop.
//!
//! rouille runs the requests on its own worker pool; the listener thread
//! polls with a timeout so `stop()` can wind the server down gracefully
//! (in-flight requests complete, no new connections are accepted).

use log::{error, info, warn};
use rouille::{Request, Response};
use std::collections::HashMap;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::auth::TokenService;
use crate::router::{ApiRouter, LogIndexRequest};

/// Commands a client may invoke before a token exists.
const NO_AUTH_COMMANDS: &[&str] = &["IsTokenSet", "RegisterToken"];

pub type ApiHandler = Box<dyn Fn(&Request) -> Response + Send + Sync>;
pub type HandlerMap = HashMap<&'static str, ApiHandler>;

#[derive(Debug)]
pub enum ServerError {
    Bind { addr: String, detail: String },
    Spawn(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind { addr, detail } => {
                write!(f, "failed to bind {}: {}", addr, detail)
            }
            ServerError::Spawn(msg) => write!(f, "failed to spawn listener thread: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

/// Running HTTP server. Dropping it stops the serve loop.
pub struct HttpServer {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    port: u16,
}

impl HttpServer {
    /// Bind `127.0.0.1:port` (0 picks a free port) and start serving on a
    /// background thread. A bind failure is returned instead of panicking so
    /// the entry point can report it and exit.
    pub fn start(
        port: u16,
        handlers: HandlerMap,
        tokens: Arc<TokenService>,
    ) -> Result<Self, ServerError> {
        let addr = format!("127.0.0.1:{}", port);
        let handlers = Arc::new(handlers);

        let server = rouille::Server::new(addr.clone(), move |request| {
            handle_request(request, &handlers, &tokens)
        })
        .map_err(|e| ServerError::Bind {
            addr,
            detail: e.to_string(),
        })?
        .pool_size(num_cpus::get().max(2));

        let local_port = server.server_addr().port();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("encoderd-http".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    server.poll_timeout(Duration::from_millis(50));
                }
                info!("Listener stopped");
            })
            .map_err(|e| ServerError::Spawn(e.to_string()))?;

        info!("Listener serving on 127.0.0.1:{}", local_port);
        Ok(Self {
            stop,
            handle: Some(handle),
            port: local_port,
        })
    }

    /// The bound port (useful when started with port 0).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections and join the listener thread. In-flight
    /// requests finish before the loop exits.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn handle_request(
    request: &Request,
    handlers: &HandlerMap,
    tokens: &TokenService,
) -> Response {
    let url = request.url();
    let command = url.trim_start_matches('/');

    let handler = match handlers.get(command) {
        Some(handler) => handler,
        None => {
            return Response::text(format!("Unknown command: {}", command))
                .with_status_code(404);
        }
    };

    if !NO_AUTH_COMMANDS.contains(&command) {
        let candidate = request.header("token").unwrap_or("");
        if !tokens.validate(candidate) {
            warn!("Rejected '{}': missing or invalid token", command);
            return Response::text("Authentication failed").with_status_code(401);
        }
    }

    match panic::catch_unwind(AssertUnwindSafe(|| handler(request))) {
        Ok(response) => response,
        Err(_) => {
            error!("Handler '{}' panicked; request answered with 500", command);
            Response::text("Internal server error").with_status_code(500)
        }
    }
}

/// Read the raw request body as UTF-8 text. Fails on undecodable bytes or a
/// broken connection instead of passing an empty body downstream.
pub fn request_body(request: &Request) -> std::io::Result<String> {
    let mut body = String::new();
    if let Some(mut data) = request.data() {
        data.read_to_string(&mut body)?;
    }
    Ok(body)
}

fn read_body_or_400(request: &Request) -> Result<String, Response> {
    request_body(request).map_err(|e| {
        warn!("Unreadable request body: {}", e);
        Response::text(format!("Bad request body: {}", e)).with_status_code(400)
    })
}

/// The fixed command table from the API contract, wired against the router
/// and token service.
pub fn api_handlers(router: Arc<ApiRouter>, tokens: Arc<TokenService>) -> HandlerMap {
    let mut map: HandlerMap = HashMap::new();

    // Process handling
    let r = Arc::clone(&router);
    map.insert(
        "Shutdown",
        Box::new(move |_| {
            r.shutdown();
            Response::text("Server Terminated")
        }),
    );
    let t = Arc::clone(&tokens);
    map.insert(
        "IsTokenSet",
        Box::new(move |_| Response::text(t.is_token_set().to_string())),
    );
    let t = Arc::clone(&tokens);
    map.insert(
        "RegisterToken",
        Box::new(move |req| {
            let body = match read_body_or_400(req) {
                Ok(body) => body,
                Err(resp) => return resp,
            };
            if body.is_empty() {
                return Response::text("false");
            }
            t.register_token(&body);
            Response::text("true")
        }),
    );
    let r = Arc::clone(&router);
    map.insert(
        "Version",
        Box::new(move |_| Response::text(r.version_info())),
    );

    // Logging
    let r = Arc::clone(&router);
    map.insert(
        "GetAllLogMessages",
        Box::new(move |req| {
            let key = match read_body_or_400(req) {
                Ok(key) => key,
                Err(resp) => return resp,
            };
            Response::json(&r.get_all_log_messages(key.trim()))
        }),
    );
    let r = Arc::clone(&router);
    map.insert(
        "GetLogMessagesFromIndex",
        Box::new(move |req| {
            let body = match read_body_or_400(req) {
                Ok(body) => body,
                Err(resp) => return resp,
            };
            match serde_json::from_str::<LogIndexRequest>(&body) {
                Ok(idx) => Response::json(&r.get_log_messages_from_index(&idx)),
                Err(e) => Response::text(format!("BadPayload: {}", e)).with_status_code(400),
            }
        }),
    );
    let r = Arc::clone(&router);
    map.insert(
        "ResetLogging",
        Box::new(move |req| {
            let key = match read_body_or_400(req) {
                Ok(key) => key,
                Err(resp) => return resp,
            };
            Response::text(r.reset_logging(key.trim()).to_string())
        }),
    );

    // Encode lifecycle
    let r = Arc::clone(&router);
    map.insert(
        "StartEncode",
        Box::new(move |req| {
            let payload = match read_body_or_400(req) {
                Ok(payload) => payload,
                Err(resp) => return resp,
            };
            Response::text(r.start_encode(&payload).to_string())
        }),
    );
    let r = Arc::clone(&router);
    map.insert(
        "PauseEncode",
        Box::new(move |_| Response::text(r.pause_encode().to_string())),
    );
    let r = Arc::clone(&router);
    map.insert(
        "ResumeEncode",
        Box::new(move |_| Response::text(r.resume_encode().to_string())),
    );
    let r = Arc::clone(&router);
    map.insert(
        "StopEncode",
        Box::new(move |_| Response::text(r.stop_encode().to_string())),
    );
    let r = router;
    map.insert(
        "PollEncodeProgress",
        Box::new(move |_| Response::json(&r.poll_progress())),
    );

    map
}
