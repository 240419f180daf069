use std::{collections::HashSet, rc::Rc, sync::Arc};

use futures_util::future::LocalBoxFuture;
use regex::Regex;
use time::OffsetDateTime;

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{CONTENT_TYPE, HeaderMap};
use actix_web::http::{Method, StatusCode};
use actix_web::{Error, HttpMessage, Result};

use crate::body::{DuplicatingBody, rehydrate};
use crate::policy::{BodyValue, classify};
use crate::sink::{LogSink, Sink};

const RECORD_START: &str =
    "---------------------------- exchange start ----------------------------";
const RECORD_END: &str =
    "----------------------------- exchange end -----------------------------";

/// Logged when no handler name was registered for the matched resource.
pub const UNKNOWN_HANDLER: &str = "unknown";

/// Middleware that logs every request together with the response it produced.
///
/// For each exchange the request body is read and put back for the handler,
/// the response body is mirrored while it streams to the client, and one
/// record is handed to the [`Sink`] once the response body is done.
///
/// The handler identity is the resource name given at registration time,
/// see [`Resource::name`](actix_web::Resource::name).
///
/// # Examples
/// ```rust
/// use actix_web::{App, HttpResponse, web};
/// use actix_web_middleware_exchange_log::ExchangeRecorder;
///
/// let app = App::new()
///     .wrap(ExchangeRecorder::default().exclude("/health"))
///     .service(
///         web::resource("/users/{id}")
///             .name("GetUser")
///             .route(web::get().to(|| async { HttpResponse::Ok().json(42) })),
///     );
/// ```
pub struct ExchangeRecorder(Rc<Inner>);

struct Inner {
    sink: Arc<dyn Sink>,
    exclude: HashSet<String>,
    exclude_regex: Vec<Regex>,
}

impl Inner {
    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.contains(path) || self.exclude_regex.iter().any(|r| r.is_match(path))
    }
}

impl ExchangeRecorder {
    /// Create `ExchangeRecorder` middleware emitting to `sink`.
    pub fn new(sink: Arc<dyn Sink>) -> ExchangeRecorder {
        ExchangeRecorder(Rc::new(Inner {
            sink,
            exclude: HashSet::new(),
            exclude_regex: Vec::new(),
        }))
    }

    /// Ignore and do not record exchanges for specified path.
    pub fn exclude<T: Into<String>>(mut self, path: T) -> Self {
        self.inner_mut().exclude.insert(path.into());
        self
    }

    /// Ignore and do not record exchanges for paths that match regex.
    ///
    /// # Panics
    /// Panics if `path` is not a valid regular expression.
    pub fn exclude_regex<T: Into<String>>(mut self, path: T) -> Self {
        let regex = Regex::new(&path.into()).expect("invalid exclude regex");
        self.inner_mut().exclude_regex.push(regex);
        self
    }

    fn inner_mut(&mut self) -> &mut Inner {
        Rc::get_mut(&mut self.0).expect("ExchangeRecorder is configured before it is mounted")
    }
}

impl Default for ExchangeRecorder {
    /// Create `ExchangeRecorder` middleware forwarding records to the `log` facade.
    fn default() -> Self {
        ExchangeRecorder::new(Arc::new(LogSink::default()))
    }
}

impl<S, B> Transform<S, ServiceRequest> for ExchangeRecorder
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<DuplicatingBody<B>>;
    type Error = Error;
    type Transform = ExchangeRecorderService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ExchangeRecorderService {
            service: Rc::new(service),
            inner: Rc::clone(&self.0),
        }))
    }
}

/// Exchange recorder middleware service.
pub struct ExchangeRecorderService<S> {
    inner: Rc<Inner>,
    service: Rc<S>,
}

// Marks a request already observed by an outer recorder.
#[derive(Clone, Copy)]
struct Recorded;

impl<S, B> Service<ServiceRequest> for ExchangeRecorderService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<DuplicatingBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_service::forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let inner = Rc::clone(&self.inner);

        Box::pin(async move {
            let skip = inner.is_excluded(req.path()) || req.extensions().contains::<Recorded>();
            if skip {
                let res = service.call(req).await?;
                return Ok(res.map_body(|_, body| DuplicatingBody::passthrough(body)));
            }
            req.extensions_mut().insert(Recorded);

            let exchange = Exchange::from_request(&req);
            let mut record = PendingRecord::new(exchange, Arc::clone(&inner.sink));

            let params = match rehydrate(&mut req).await {
                Ok(body) => {
                    let mode = classify(&record.exchange.request_type);
                    let content_type = record.exchange.request_type.as_str();
                    match mode.request_params(content_type, &body, req.query_string()) {
                        Ok(params) => params,
                        Err(err) => {
                            inner.sink.emit(
                                log::Level::Debug,
                                &format!(
                                    "request parameters of {} {} not captured: {err}",
                                    record.exchange.method, record.exchange.path
                                ),
                            );
                            BodyValue::NotCaptured
                        }
                    }
                }
                Err(err) => {
                    inner.sink.emit(
                        log::Level::Error,
                        &format!(
                            "failed to read request body of {} {}: {err}",
                            record.exchange.method, record.exchange.path
                        ),
                    );
                    BodyValue::NotCaptured
                }
            };
            record.exchange.params = params;

            match service.call(req).await {
                Ok(res) => {
                    record.exchange.status = Some(res.status());
                    record.exchange.response_type = content_type(res.headers());

                    Ok(res.map_body(move |_, body| DuplicatingBody::recording(body, record)))
                }
                Err(err) => {
                    record.exchange.status = Some(err.as_response_error().status_code());
                    record.finish_uncaptured();
                    Err(err)
                }
            }
        })
    }
}

/// One request paired with its response, filled in as the request advances.
#[derive(Debug)]
pub(crate) struct Exchange {
    start: OffsetDateTime,
    handler: Option<String>,
    method: Method,
    path: String,
    params: BodyValue,
    client_addr: Option<String>,
    request_type: String,
    status: Option<StatusCode>,
    response_type: String,
}

impl Exchange {
    fn from_request(req: &ServiceRequest) -> Self {
        Exchange {
            start: OffsetDateTime::now_utc(),
            handler: req.request().match_name().map(str::to_owned),
            method: req.method().clone(),
            path: req.path().to_owned(),
            params: BodyValue::NotCaptured,
            client_addr: req
                .connection_info()
                .realip_remote_addr()
                .map(str::to_owned),
            request_type: content_type(req.headers()),
            status: None,
            response_type: String::new(),
        }
    }

    fn render(&self, response: &BodyValue, elapsed: time::Duration) -> String {
        let status = self
            .status
            .map(|status| status.as_u16().to_string())
            .unwrap_or_else(|| "-".to_owned());
        let elapsed = std::time::Duration::try_from(elapsed).unwrap_or_default();

        format!(
            "\n{RECORD_START}\
             \nhandler: {}\
             \npath: {}\
             \nmethod: {}\
             \nparams: {}\
             \nclient: {}\
             \nstatus: {}\
             \nresponse: {}\
             \nelapsed: {:?}\
             \n{RECORD_END}",
            self.handler.as_deref().unwrap_or(UNKNOWN_HANDLER),
            self.path,
            self.method,
            self.params,
            self.client_addr.as_deref().unwrap_or("-"),
            status,
            response,
            elapsed,
        )
    }
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|val| val.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

/// An exchange waiting for its response body.
///
/// Emitted exactly once: by [`finish`](Self::finish) when the response body is
/// done, or on drop if the handler never produced a response.
pub(crate) struct PendingRecord {
    exchange: Exchange,
    sink: Arc<dyn Sink>,
    emitted: bool,
}

impl PendingRecord {
    fn new(exchange: Exchange, sink: Arc<dyn Sink>) -> Self {
        PendingRecord {
            exchange,
            sink,
            emitted: false,
        }
    }

    pub(crate) fn finish(mut self, captured: &[u8]) {
        let response = classify(&self.exchange.response_type).response_body(captured);
        self.emit(&response);
    }

    fn finish_uncaptured(mut self) {
        self.emit(&BodyValue::NotCaptured);
    }

    fn emit(&mut self, response: &BodyValue) {
        self.emitted = true;
        let elapsed = OffsetDateTime::now_utc() - self.exchange.start;
        let message = self.exchange.render(response, elapsed);
        self.sink.emit(log::Level::Info, &message);
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        if !self.emitted {
            self.emit(&BodyValue::NotCaptured);
        }
    }
}
