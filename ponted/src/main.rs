use std::{fs, io, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use ponte::{
    cors::OriginAllowList,
    director::SingleBackend,
    framing::DEFAULT_MAX_FRAME,
    observe::LogObserver,
    service::{ProxyConfig, ProxyService},
};
use ponted::server;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Uri};
use tracing_subscriber::EnvFilter;

/// grpc-web to grpc bridge daemon
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// upstream grpc url, e.g. https://10.0.0.1:50051 when it serves tls
    #[arg(short = 'u', long, env = "PONTE_UPSTREAM_ADDR", default_value = "http://127.0.0.1:50051")]
    upstream_addr: Uri,

    /// upstream CA certificate (pem format)
    #[arg(short = 'C', long, env = "PONTE_UPSTREAM_CERTS")]
    upstream_certs: Option<PathBuf>,

    /// web bind address
    #[arg(short = 'a', long, env = "PONTE_WEB_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], 8080)))]
    web_addr: SocketAddr,

    /// web server public certificate (pem format)
    #[arg(short = 'c', long, env = "PONTE_WEB_CERTS")]
    web_certs: Option<PathBuf>,

    /// web server private key
    #[arg(short = 'k', long, env = "PONTE_WEB_PRIVATE_KEY")]
    web_private_key: Option<PathBuf>,

    /// allowed CORS origins, comma separated; empty allows any origin
    #[arg(short = 'o', long, env = "PONTE_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// per-frame size limit in bytes
    #[arg(long, env = "PONTE_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME)]
    max_frame_bytes: usize,

    /// debug log verbosity
    #[arg(short = 'd', long, env = "PONTE_DEBUG")]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let upstream = connect_upstream(
        args.upstream_addr,
        args.upstream_certs.map(load_upstream_certs).transpose()?,
    )
    .await?;

    let service = ProxyService::new(
        Arc::new(SingleBackend::new(upstream)),
        OriginAllowList::new(args.allowed_origins),
        Arc::new(LogObserver),
        ProxyConfig {
            max_frame_bytes: args.max_frame_bytes,
        },
    );

    server::run(
        args.web_addr,
        args.web_certs
            .zip(args.web_private_key)
            .map(load_web_certs)
            .transpose()?,
        service,
    )
    .await
}

async fn connect_upstream(addr: Uri, certs: Option<Certificate>) -> anyhow::Result<Channel> {
    let mut endpoint = Endpoint::from(addr);
    if let Some(certs) = certs {
        endpoint = endpoint.tls_config(ClientTlsConfig::new().ca_certificate(certs))?;
    }
    endpoint
        .connect()
        .await
        .context("failed to connect to upstream")
}

// Load the upstream CA certificate from file.
fn load_upstream_certs(filename: PathBuf) -> io::Result<Certificate> {
    let pem = fs::read(filename)?;
    Ok(Certificate::from_pem(pem))
}

fn load_web_certs(
    (certs, private_key): (PathBuf, PathBuf),
) -> io::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    Ok((load_public_certs(certs)?, load_private_key(private_key)?))
}

// Load public certificate from file.
fn load_public_certs(filename: PathBuf) -> io::Result<Vec<CertificateDer<'static>>> {
    let certfile = fs::File::open(filename)?;
    let mut reader = io::BufReader::new(certfile);
    rustls_pemfile::certs(&mut reader).collect()
}

// Load private key from file.
fn load_private_key(filename: PathBuf) -> io::Result<PrivateKeyDer<'static>> {
    let keyfile = fs::File::open(filename)?;
    let mut reader = io::BufReader::new(keyfile);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))
}
