use std::{convert::Infallible, future::Future, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{
    header, uri::PathAndQuery, HeaderMap, HeaderValue, Method, Request, Response, StatusCode,
    Version,
};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::{body::Body, service};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::{client::Grpc, metadata::MetadataMap, Request as GrpcRequest, Status};
use tracing::debug;

use crate::{
    codec::RawCodec,
    cors::{self, OriginAllowList},
    director::Director,
    framing::{self, FrameDecoder, WireFormat, DEFAULT_MAX_FRAME},
    observe::CallObserver,
    pump, BoxError,
};

/// Body type of every response the bridge produces.
pub type ResponseBody = BoxBody<Bytes, Infallible>;

/// Settings the daemon resolves once and hands in; the service itself never
/// reads flags or the environment.
#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
    pub max_frame_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME,
        }
    }
}

/// The browser-facing service: gate, negotiate, route, pump.
#[derive(Clone)]
pub struct ProxyService {
    director: Arc<dyn Director>,
    origins: Arc<OriginAllowList>,
    observer: Arc<dyn CallObserver>,
    max_frame: usize,
}

impl ProxyService {
    pub fn new(
        director: Arc<dyn Director>,
        origins: OriginAllowList,
        observer: Arc<dyn CallObserver>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            director,
            origins: Arc::new(origins),
            observer,
            max_frame: config.max_frame_bytes,
        }
    }

    async fn handle<B>(self, req: Request<B>) -> Result<Response<ResponseBody>, http::Error>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if req.method() == Method::OPTIONS {
            return cors::preflight(&self.origins, req.headers());
        }

        let origin = req.headers().get(header::ORIGIN).cloned();
        if let Some(origin) = &origin {
            if !self.origins.allows(origin) {
                return plain_response(StatusCode::FORBIDDEN);
            }
        }
        if req.method() != Method::POST {
            return plain_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        let Some(content_type) = req.headers().get(header::CONTENT_TYPE).cloned() else {
            return plain_response(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        };
        let format = content_type
            .to_str()
            .ok()
            .and_then(WireFormat::from_content_type);
        let format = match format {
            // native framing needs real trailers, which HTTP/1.1 cannot carry
            Some(WireFormat::Native) if req.version() != Version::HTTP_2 => {
                return plain_response(StatusCode::UNSUPPORTED_MEDIA_TYPE);
            }
            Some(format) => format,
            None => return plain_response(StatusCode::UNSUPPORTED_MEDIA_TYPE),
        };

        let (parts, body) = req.into_parts();
        let grpc_path = match parts.uri.path().parse::<PathAndQuery>() {
            Ok(grpc_path) if is_method_path(&grpc_path) => grpc_path,
            _ => {
                let status = Status::unimplemented("malformed method name");
                return trailer_only_response(format, &content_type, origin.as_ref(), &status);
            }
        };
        let method = grpc_path.path().to_owned();

        // Hop-level headers hyper keeps in the map; they are not call
        // metadata (the director owns the gRPC-level strip list).
        let mut call_headers = parts.headers.clone();
        call_headers.remove(header::HOST);
        call_headers.remove(header::CONTENT_LENGTH);
        // this hop cannot re-frame compressed messages, so never invite them
        call_headers.remove("grpc-accept-encoding");
        let metadata = MetadataMap::from_headers(call_headers);
        let (mut outgoing, channel) = match self.director.route(&metadata, &method) {
            Ok(routed) => routed,
            Err(status) => {
                return trailer_only_response(format, &content_type, origin.as_ref(), &status);
            }
        };
        self.observer.call_started(&method);

        // The deadline crosses the hop as-is: tonic re-emits the same header
        // from the request timeout.
        let timeout = grpc_timeout(&parts.headers);
        outgoing.remove("grpc-timeout");

        let (message_tx, message_rx) = mpsc::channel(pump::PUMP_DEPTH);
        let (fault_tx, mut fault_rx) = oneshot::channel();
        tokio::spawn(pump::client_to_backend(
            body,
            FrameDecoder::new(format.is_text(), self.max_frame),
            message_tx,
            fault_tx,
        ));

        let mut request = GrpcRequest::new(ReceiverStream::new(message_rx));
        *request.metadata_mut() = outgoing;
        if let Some(timeout) = timeout {
            request.set_timeout(timeout);
        }

        let mut grpc = Grpc::new(channel);
        let opened = {
            let open = std::pin::pin!(async {
                grpc.ready()
                    .await
                    .map_err(|err| Status::unavailable(format!("upstream unavailable: {err}")))?;
                grpc.streaming(request, grpc_path, RawCodec).await
            });
            // a clean end of the request body is not a fault; only decode
            // failures race the call open
            let fault = std::pin::pin!(async {
                match (&mut fault_rx).await {
                    Ok(status) => status,
                    Err(_) => std::future::pending().await,
                }
            });
            tokio::select! {
                outcome = open => outcome,
                status = fault => Err(status),
            }
        };

        let response = match opened {
            Err(status) => {
                self.observer.call_closed(&method, status.code());
                return trailer_only_response(format, &content_type, origin.as_ref(), &status);
            }
            Ok(response) => response,
        };

        let (meta, streaming, _extensions) = response.into_parts();
        let (frame_tx, frame_rx) = mpsc::channel(pump::PUMP_DEPTH);
        tokio::spawn(pump::backend_to_client(
            streaming,
            frame_tx,
            fault_rx,
            format,
            self.max_frame,
            method,
            Arc::clone(&self.observer),
        ));

        let mut headers = meta.into_headers();
        headers.remove(header::CONTENT_TYPE);
        let mut builder = Response::builder().status(StatusCode::OK);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let mut response = builder.header(header::CONTENT_TYPE, content_type).body(
            StreamBody::new(ReceiverStream::new(frame_rx).map(Ok::<_, Infallible>)).boxed(),
        )?;
        if let Some(origin) = origin.as_ref() {
            cors::decorate(response.headers_mut(), origin);
        }
        Ok(response)
    }
}

impl<B> service::Service<Request<B>> for ProxyService
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<ResponseBody>;
    type Error = http::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        debug!("{} {}", req.method(), req.uri());
        let service = self.clone();
        Box::pin(service.handle(req))
    }
}

/// `/service/Method`, nothing more, nothing less.
fn is_method_path(path: &PathAndQuery) -> bool {
    let mut segments = path.path().split('/');
    matches!(
        (segments.next(), segments.next(), segments.next(), segments.next()),
        (Some(""), Some(service), Some(method), None)
            if !service.is_empty() && !method.is_empty()
    )
}

/// `grpc-timeout` header: digits plus an hour/minute/second/milli/micro/nano
/// unit.
fn grpc_timeout(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get("grpc-timeout")?.to_str().ok()?;
    if raw.len() < 2 || raw.len() > 9 {
        return None;
    }
    let (value, unit) = raw.split_at(raw.len() - 1);
    let value = value.parse::<u64>().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(value * 3600)),
        "M" => Some(Duration::from_secs(value * 60)),
        "S" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_millis(value)),
        "u" => Some(Duration::from_micros(value)),
        "n" => Some(Duration::from_nanos(value)),
        _ => None,
    }
}

/// A call that ends before any DATA frame still carries its status: as a
/// lone trailer frame (web) or a trailers-only header block (native).
fn trailer_only_response(
    format: WireFormat,
    content_type: &HeaderValue,
    origin: Option<&HeaderValue>,
    status: &Status,
) -> Result<Response<ResponseBody>, http::Error> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);
    let body = match format {
        WireFormat::Native => {
            for (name, value) in framing::trailer_headers(status, None).iter() {
                builder = builder.header(name, value);
            }
            empty_body()
        }
        WireFormat::Web => full_body(framing::encode_trailers(status, None)),
        WireFormat::WebText => {
            full_body(framing::to_text(&framing::encode_trailers(status, None)))
        }
    };
    let mut response = builder.body(body)?;
    if let Some(origin) = origin {
        cors::decorate(response.headers_mut(), origin);
    }
    Ok(response)
}

fn plain_response(status: StatusCode) -> Result<Response<ResponseBody>, http::Error> {
    Response::builder().status(status).body(empty_body())
}

pub(crate) fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new().boxed()
}

fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).boxed()
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use tonic::transport::Endpoint;

    use super::*;
    use crate::{director::SingleBackend, observe::LogObserver};

    fn service() -> ProxyService {
        // port 1 refuses immediately, which is exactly what the error-path
        // tests need
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        ProxyService::new(
            Arc::new(SingleBackend::new(channel)),
            OriginAllowList::new(Vec::new()),
            Arc::new(LogObserver),
            ProxyConfig::default(),
        )
    }

    fn web_request(path: &str, body: Bytes) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/grpc-web+proto")
            .body(Full::new(body))
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_content_type_is_unsupported() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/pkg.Svc/Call")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = service().handle(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn non_post_is_rejected() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/pkg.Svc/Call")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = service().handle(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn native_grpc_needs_http2() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/pkg.Svc/Call")
            .header(header::CONTENT_TYPE, "application/grpc")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = service().handle(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn disallowed_origin_gets_no_cors_headers() {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let service = ProxyService::new(
            Arc::new(SingleBackend::new(channel)),
            OriginAllowList::new(vec!["https://a.test".to_owned()]),
            Arc::new(LogObserver),
            ProxyConfig::default(),
        );
        let mut req = web_request("/pkg.Svc/Call", Bytes::new());
        req.headers_mut()
            .insert(header::ORIGIN, "https://b.test".parse().unwrap());

        let response = service.handle(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[tokio::test]
    async fn options_goes_to_preflight() {
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/pkg.Svc/Call")
            .header(header::ORIGIN, "https://a.test")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = service().handle(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn malformed_method_name_is_a_trailer_only_refusal() {
        let response = service()
            .handle(web_request("/nope", Bytes::new()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body[0], 0b1000_0000, "only frame is the trailer");
        let block = String::from_utf8_lossy(&body[5..]);
        assert!(block.contains("grpc-status: 12"), "{block}");
    }

    #[tokio::test]
    async fn text_mode_refusals_are_base64() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/nope")
            .header(header::CONTENT_TYPE, "application/grpc-web-text")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = service().handle(req).await.unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let decoded = BASE64.decode(&body[..]).unwrap();
        assert_eq!(decoded[0], 0b1000_0000);
    }

    #[tokio::test]
    async fn unreachable_backend_reports_unavailable_with_zero_data_frames() {
        let body = framing::encode_data(b"", DEFAULT_MAX_FRAME).unwrap();
        let response = service()
            .handle(web_request("/pkg.Svc/Call", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/grpc-web+proto"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body[0], 0b1000_0000, "first and only frame is the trailer");
        let block = String::from_utf8_lossy(&body[5..]);
        assert!(block.contains("grpc-status: 14"), "{block}");
    }

    #[test]
    fn grpc_timeout_units() {
        let mut headers = HeaderMap::new();
        for (raw, expected) in [
            ("1H", Duration::from_secs(3600)),
            ("2M", Duration::from_secs(120)),
            ("3S", Duration::from_secs(3)),
            ("4m", Duration::from_millis(4)),
            ("5u", Duration::from_micros(5)),
            ("6n", Duration::from_nanos(6)),
        ] {
            headers.insert("grpc-timeout", raw.parse().unwrap());
            assert_eq!(grpc_timeout(&headers), Some(expected), "{raw}");
        }
        headers.insert("grpc-timeout", "10X".parse().unwrap());
        assert_eq!(grpc_timeout(&headers), None);
        headers.insert("grpc-timeout", "S".parse().unwrap());
        assert_eq!(grpc_timeout(&headers), None);
    }

    #[test]
    fn method_paths_need_service_and_method() {
        for (path, expected) in [
            ("/pkg.Svc/Call", true),
            ("/a/b", true),
            ("/onlyservice", false),
            ("/a/b/c", false),
            ("/", false),
            ("//method", false),
        ] {
            let parsed: PathAndQuery = path.parse().unwrap();
            assert_eq!(is_method_path(&parsed), expected, "{path}");
        }
    }
}
