use std::{
    pin::Pin,
    task::{Context, Poll},
};

use actix_http::error::PayloadError;
use actix_web::body::{BodySize, MessageBody};
use actix_web::HttpMessage;
use actix_web::dev::ServiceRequest;
use bytes::{Bytes, BytesMut};
use futures_core::ready;
use futures_util::StreamExt;
use pin_project_lite::pin_project;

use crate::recorder::PendingRecord;

pin_project! {
    /// Response body that mirrors every chunk it yields into a capture buffer.
    ///
    /// Chunks reach the client exactly as the wrapped body produced them. When
    /// the body is dropped, either fully streamed or abandoned, the attached
    /// exchange record is completed with whatever was captured.
    pub struct DuplicatingBody<B> {
        #[pin]
        body: B,
        captured: Option<BytesMut>,
        record: Option<PendingRecord>,
    }

    impl<B> PinnedDrop for DuplicatingBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(record) = this.record.take() {
                let captured = this.captured.as_deref().unwrap_or_default();
                record.finish(captured);
            }
        }
    }
}

impl<B> DuplicatingBody<B> {
    /// Wrap `body` and capture everything it yields.
    pub fn new(body: B) -> Self {
        DuplicatingBody {
            body,
            captured: Some(BytesMut::new()),
            record: None,
        }
    }

    pub(crate) fn recording(body: B, record: PendingRecord) -> Self {
        DuplicatingBody {
            body,
            captured: Some(BytesMut::new()),
            record: Some(record),
        }
    }

    /// Forward `body` without buffering anything.
    pub(crate) fn passthrough(body: B) -> Self {
        DuplicatingBody {
            body,
            captured: None,
            record: None,
        }
    }

    /// Bytes yielded so far.
    pub fn captured(&self) -> &[u8] {
        self.captured.as_deref().unwrap_or_default()
    }
}

impl<B: MessageBody> MessageBody for DuplicatingBody<B> {
    type Error = B::Error;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.project();

        match ready!(this.body.poll_next(cx)) {
            Some(Ok(chunk)) => {
                if let Some(captured) = this.captured {
                    captured.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}

/// Drain the request payload and put an unread copy of it back.
///
/// The handler then reads the same bytes from the start, as if nobody had
/// touched the payload. A missing payload is an empty body. When the payload
/// fails mid-stream the handler gets an empty body and the error is returned.
pub async fn rehydrate(req: &mut ServiceRequest) -> Result<Bytes, PayloadError> {
    let mut payload = req.take_payload();
    let mut body = BytesMut::new();

    let mut failure = None;
    while let Some(chunk) = payload.next().await {
        match chunk {
            Ok(chunk) => body.extend_from_slice(&chunk),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    match failure {
        None => {
            let body = body.freeze();
            req.set_payload(replay(body.clone()));
            Ok(body)
        }
        Some(err) => {
            req.set_payload(replay(Bytes::new()));
            Err(err)
        }
    }
}

fn replay(body: Bytes) -> actix_http::Payload {
    let (_, mut payload) = actix_http::h1::Payload::create(true);
    if !body.is_empty() {
        payload.unread_data(body);
    }
    actix_http::Payload::from(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use std::pin::pin;

    use actix_web::body::BodyStream;
    use actix_web::test::TestRequest;
    use actix_web::web;
    use futures_util::stream;

    type Chunks = stream::Iter<std::vec::IntoIter<Result<Bytes, std::io::Error>>>;

    fn chunked(chunks: &[&'static [u8]]) -> BodyStream<Chunks> {
        let chunks: Vec<Result<Bytes, std::io::Error>> = chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk)))
            .collect();
        BodyStream::new(stream::iter(chunks))
    }

    #[actix_web::test]
    async fn test_duplicating_body_forwards_chunks_unchanged() {
        let parts: [&'static [u8]; 4] = [b"{\"id\":", b"", b"42,\"name\"", b":\"Ann\"}"];
        let mut body = pin!(DuplicatingBody::new(chunked(&parts)));

        let mut forwarded = Vec::new();
        while let Some(chunk) = poll_fn(|cx| body.as_mut().poll_next(cx)).await {
            forwarded.push(chunk.unwrap());
        }

        // chunking seen by the client is untouched
        let expected: Vec<Bytes> = parts
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| Bytes::from_static(*part))
            .collect();
        let forwarded_non_empty: Vec<Bytes> =
            forwarded.iter().filter(|c| !c.is_empty()).cloned().collect();
        assert_eq!(forwarded_non_empty, expected);

        assert_eq!(body.captured(), br#"{"id":42,"name":"Ann"}"#);
    }

    #[actix_web::test]
    async fn test_duplicating_body_reports_inner_size() {
        let body = DuplicatingBody::new(Bytes::from_static(b"hello"));
        assert_eq!(body.size(), BodySize::Sized(5));

        let body = DuplicatingBody::passthrough(Bytes::from_static(b"hello"));
        let bytes = actix_web::body::to_bytes(body).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"hello"));
    }

    #[actix_web::test]
    async fn test_passthrough_captures_nothing() {
        let mut body = pin!(DuplicatingBody::passthrough(Bytes::from_static(b"data")));
        while poll_fn(|cx| body.as_mut().poll_next(cx)).await.is_some() {}
        assert!(body.captured().is_empty());
    }

    #[actix_web::test]
    async fn test_rehydrate_replays_the_same_bytes() {
        let mut req = TestRequest::post()
            .uri("/echo")
            .set_payload("name=ann&tag=a")
            .to_srv_request();

        let body = rehydrate(&mut req).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"name=ann&tag=a"));

        let (_, payload) = req.parts_mut();
        let mut replayed = BytesMut::new();
        while let Some(chunk) = payload.next().await {
            replayed.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(replayed.freeze(), body);
    }

    #[actix_web::test]
    async fn test_rehydrate_without_body() {
        let mut req = TestRequest::get().uri("/users/42").to_srv_request();

        let body = rehydrate(&mut req).await.unwrap();
        assert!(body.is_empty());

        let extracted = req.extract::<web::Bytes>().await.unwrap();
        assert!(extracted.is_empty());
    }

    #[actix_web::test]
    async fn test_rehydrate_substitutes_empty_body_on_failure() {
        let mut req = TestRequest::post().uri("/upload").to_srv_request();
        let failing: actix_http::BoxedPayloadStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(PayloadError::Incomplete(None)),
        ]));
        req.set_payload(actix_http::Payload::Stream { payload: failing });

        let err = rehydrate(&mut req).await.unwrap_err();
        assert!(matches!(err, PayloadError::Incomplete(_)));

        let extracted = req.extract::<web::Bytes>().await.unwrap();
        assert!(extracted.is_empty());
    }
}
