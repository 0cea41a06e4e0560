// Local crates
use crate::metrics::metrics::{CPU_PERCENT, MEMORY_BYTES};

// External crates
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::{CONTENT_TYPE, HeaderValue},
    http::{Method, Request, Response, StatusCode},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as HyperServerBuilder,
};
use prometheus::{Encoder, TEXT_FORMAT, TextEncoder};
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Samples this process's memory and CPU usage for the resource gauges.
///
/// CPU usage is a delta between two refreshes, so the `System` is kept across
/// scrapes; the first scrape reports 0%.
#[derive(Debug)]
struct ProcessSampler {
    system: System,
    pid: Option<Pid>,
}

impl ProcessSampler {
    fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| tracing::warn!(error = %e, "Process metrics unavailable on this platform"))
            .ok();
        Self {
            system: System::new(),
            pid,
        }
    }

    fn refresh(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );

        if let Some(process) = self.system.process(pid) {
            MEMORY_BYTES.set(process.memory() as f64);
            CPU_PERCENT.set(f64::from(process.cpu_usage()));
        }
    }
}

#[instrument(
    name = "metrics_server::handler",
    target = "metrics::http",
    skip_all,
    level = "debug"
)]
fn metrics_response(sampler: &Mutex<ProcessSampler>) -> Response<Full<Bytes>> {
    if let Ok(mut sampler) = sampler.lock() {
        sampler.refresh();
    }

    tracing::debug!("Collecting all registered prometheus metrics");
    let metric_families = prometheus::gather();

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode prometheus metrics");
        return status_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }
    tracing::debug!(
        writer_buffer = %buffer.len(),
        "Encoded collected metrics into prometheus text format"
    );

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
    response
}

fn status_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Bind `addr` and serve `/metrics` until `cancel` fires.
#[instrument(
    name = "metrics_server::start_metrics_server",
    target = "metrics::http",
    skip_all,
    fields(listen_addr = addr),
    level = "debug"
)]
pub async fn start_metrics_server(addr: &str, cancel: CancellationToken) -> Result<()> {
    // Hyper 1.0 no longer binds for us
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address {addr:?}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {addr}"))?;

    tracing::info!(
        metrics_endpoint = %addr,
        "Tail agent metrics available at http://{addr}/metrics"
    );

    serve(listener, cancel).await;
    Ok(())
}

pub(crate) async fn serve(listener: TcpListener, cancel: CancellationToken) {
    let sampler = Arc::new(Mutex::new(ProcessSampler::new()));

    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Metrics server received shutdown, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept metrics connection");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let sampler = Arc::clone(&sampler);
        let service = service_fn(move |req: Request<Incoming>| {
            let sampler = Arc::clone(&sampler);
            async move {
                let response = match (req.method(), req.uri().path()) {
                    (&Method::GET, "/metrics") => metrics_response(&sampler),
                    _ => status_response(StatusCode::NOT_FOUND, "Not Found"),
                };
                Ok::<_, Infallible>(response)
            }
        });

        tokio::spawn(async move {
            if let Err(err) = HyperServerBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                tracing::error!(error = %err, "Metrics server connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::metrics::LINES_FORWARDED_TOTAL;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write request");

        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read response");
        response
    }

    #[tokio::test]
    async fn serves_metrics_and_stops_on_cancel() {
        LINES_FORWARDED_TOTAL.with_label_values(&["http-test"]).inc();

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, cancel.clone()));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"));
        assert!(metrics.contains("tail_agent_lines_forwarded_total{project=\"http-test\"}"));

        let missing = get(addr, "/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        cancel.cancel();
        server.await.expect("server task exits");
    }

    #[tokio::test]
    async fn invalid_address_is_reported() {
        let result = start_metrics_server("not an address", CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
