use std::{net::SocketAddr, sync::Arc};

use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use ponte::service::ProxyService;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error};

use crate::tls::MaybeTls;

pub async fn run(
    addr: SocketAddr,
    cert: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    service: ProxyService,
) -> anyhow::Result<()> {
    // Set a process wide default crypto provider.
    #[cfg(feature = "ring")]
    let _ = rustls::crypto::ring::default_provider().install_default();
    #[cfg(feature = "aws-lc-rs")]
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let tls_acceptor = cert
        .map(|(certs, key)| {
            ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map(|mut server_config| {
                    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
                    TlsAcceptor::from(Arc::new(server_config))
                })
        })
        .transpose()?;

    let listener = TcpListener::bind(&addr).await?;
    debug!("bridge listening on http://{}", addr);

    loop {
        let (stream, _) = listener.accept().await?;

        tokio::spawn({
            let tls_acceptor = tls_acceptor.clone();
            let service = service.clone();
            async move {
                let io = match tls_acceptor {
                    Some(tls_acceptor) => match tls_acceptor.accept(stream).await {
                        Ok(stream) => MaybeTls::Secured { stream },
                        Err(err) => {
                            error!("failed to perform tls handshake: {err}");
                            return;
                        }
                    },
                    None => MaybeTls::Plain { stream },
                };

                if let Err(err) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(io), service)
                    .await
                {
                    error!("failed to serve connection: {err}");
                }
            }
        });
    }
}
