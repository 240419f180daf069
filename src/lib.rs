//! Actix-web middleware that logs whole request/response exchanges.
//! This middleware is inspired by the `actix-web`'s `Logger` middleware, but
//! besides the request line it records the request parameters and the
//! response body.
//!
//! For every request the middleware:
//! - reads the request body and puts an unread copy back, so handlers and
//!   extractors see it untouched,
//! - mirrors the response body while it streams to the client,
//! - picks per media type what ends up in the log (parsed parameters,
//!   pretty-printed JSON, raw text or a placeholder),
//! - emits one multi-line record to a [`Sink`].
//!
//! # Examples:
//! ## By default middleware uses the standard `log` crate for logging.
//! ```bash
//! cargo add actix-web-middleware-exchange-log
//! ```
//! Example usage with standard `log` crate and `structured_logger` crate:
//! ```rust
//! use actix_web::{web, App, HttpResponse, HttpServer};
//! use actix_web_middleware_exchange_log::ExchangeRecorder;
//! use structured_logger::{Builder, async_json::new_writer};
//!
//! #[actix_web::main] // or #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     Builder::new()
//!         .with_target_writer("*", new_writer(tokio::io::stdout()))
//!         .init();
//!
//!     HttpServer::new(|| {
//!         App::new()
//!             .wrap(ExchangeRecorder::default())
//!             .service(
//!                 web::resource("/users/{id}")
//!                     .name("GetUser")
//!                     .route(web::get().to(|| async { HttpResponse::Ok().json(42) })),
//!             )
//!     })
//!     .bind("127.0.0.1:8080")?;
//!     Ok(())
//! }
//! ```
//! ## Rotating log file mirrored to the console
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use actix_web::{web, App, HttpServer};
//! use actix_web_middleware_exchange_log::{ExchangeRecorder, RotatingFileSink, Sink, SinkConfig};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let config = SinkConfig {
//!         filename: "logs/exchange.log".into(),
//!         max_size: 50,
//!         max_backups: 10,
//!         max_age: 14,
//!         compress: true,
//!     };
//!     let sink = Arc::new(RotatingFileSink::new(config).map_err(std::io::Error::other)?);
//!
//!     let app_sink = Arc::clone(&sink);
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(ExchangeRecorder::new(app_sink.clone()))
//!             .route("/", web::get().to(|| async { "Hello world!" }))
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await?;
//!
//!     sink.flush();
//!     Ok(())
//! }
//! ```
//!
//! # Record format
//!
//! ```text
//! ---------------------------- exchange start ----------------------------
//! handler: GetUser
//! path: /users/42
//! method: GET
//! params: <unsupported content type>
//! client: 10.0.0.5
//! status: 200
//! response: {
//!   "id": 42,
//!   "name": "Ann"
//! }
//! elapsed: 1.2803ms
//! ----------------------------- exchange end -----------------------------
//! ```
//!
//! The handler identity is the name registered with
//! [`Resource::name`](actix_web::Resource::name), `unknown` when the resource
//! has none.
//!
//! # Content policy
//!
//! | Media type | Request `params` | Logged `response` |
//! |---|---|---|
//! | `application/json` | JSON object | pretty-printed, raw if malformed |
//! | `application/x-www-form-urlencoded` | query and form fields | raw text |
//! | `multipart/form-data` | query fields and text parts | raw text |
//! | `image/*`, `audio/*`, `text/html`, `application/octet-stream` | placeholder | placeholder |
//! | anything else | placeholder | placeholder |
//!
//! # Path Exclusions
//!
//! ```rust
//! use actix_web_middleware_exchange_log::ExchangeRecorder;
//!
//! let recorder = ExchangeRecorder::default()
//!     .exclude("/health")
//!     .exclude_regex(r"^/assets/.*");
//! ```

mod body;
mod policy;
mod recorder;
mod rotate;
mod sink;

pub use crate::body::{DuplicatingBody, rehydrate};
pub use crate::policy::{
    AUDIO_PLACEHOLDER, BINARY_PLACEHOLDER, BodyParseError, BodyValue, ContentMode,
    HTML_PLACEHOLDER, IMAGE_PLACEHOLDER, NOT_CAPTURED_PLACEHOLDER, UNSUPPORTED_PLACEHOLDER,
    classify, normalize_media_type,
};
pub use crate::recorder::{ExchangeRecorder, ExchangeRecorderService, UNKNOWN_HANDLER};
pub use crate::rotate::{RotatingFileSink, SinkConfig, SinkError};
pub use crate::sink::{LogSink, Sink};
