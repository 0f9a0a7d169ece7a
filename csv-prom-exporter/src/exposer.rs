use std::net::SocketAddr;
use std::sync::Arc;

use csv_prom_metrics::MetricRegistry;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1::Builder as HyperHttpBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

use crate::process_metrics::ProcessMetrics;

/// Serves `GET /metrics` and `GET /ping` on TCP port 5000, all interfaces
/// (spec §6 "External Interfaces"). Built directly on `hyper`, matching the
/// teacher crate's own plain listener rather than a web framework (see the
/// design's "Why no web framework" note).
pub struct Exposer {
    registry: Arc<MetricRegistry>,
}

impl Exposer {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self { registry }
    }

    /// Binds and serves forever. A bind failure is the only `Exposer` error
    /// that's fatal at startup (spec §7); per-connection errors are logged
    /// and otherwise ignored so one bad client never takes down the
    /// scrape endpoint.
    pub async fn serve(&self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(err) => {
                    warn!(error = %err, "error accepting connection, ignoring");
                    continue;
                }
            };
            self.process_stream(stream);
        }
    }

    fn process_stream(&self, stream: TcpStream) {
        let registry = self.registry.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let registry = registry.clone();
            async move { Ok::<_, hyper::Error>(handle_request(&registry, &req)) }
        });

        tokio::spawn(async move {
            if let Err(err) = HyperHttpBuilder::new().serve_connection(TokioIo::new(stream), service).await {
                warn!(error = %err, "error serving connection");
            }
        });
    }
}

fn handle_request(registry: &MetricRegistry, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/ping" => Response::new(Full::new(Bytes::from_static(b"pong"))),
        "/metrics" => render_metrics(registry),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::<Bytes>::default())
            .expect("status/body are both statically valid"),
    }
}

fn render_metrics(registry: &MetricRegistry) -> Response<Full<Bytes>> {
    let mut body = String::new();
    let exposed = registry.expose_to(&mut body);

    if let Some(process) = ProcessMetrics::sample() {
        process.write_prometheus(&mut body);
    }

    // Written last so it reflects this pass, per the design's "Exposition
    // size" note.
    body.push_str("# HELP exposed_metrics Number of metric lines written in this scrape.\n");
    body.push_str("# TYPE exposed_metrics gauge\n");
    body.push_str(&format!("exposed_metrics {exposed}\n"));

    let mut response = Response::new(Full::new(Bytes::from(body)));
    response
        .headers_mut()
        .append(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"));
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn ping_and_metrics_routes_are_distinct() {
        let registry = MetricRegistry::new(None, Duration::from_secs(60), 1, 10);
        let body = render_metrics(&registry);
        assert_eq!(body.status(), StatusCode::OK);
    }
}
