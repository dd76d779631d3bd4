use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::server::TlsStream;

pin_project_lite::pin_project! {
    #[project = MaybeTlsProj]
    pub enum MaybeTls {
        Secured { #[pin] stream: TlsStream<TcpStream> },
        Plain { #[pin] stream: TcpStream },
    }
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsProj::Secured { stream } => stream.poll_read(cx, buf),
            MaybeTlsProj::Plain { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Secured { stream } => stream.is_write_vectored(),
            Self::Plain { stream } => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.project() {
            MaybeTlsProj::Secured { stream } => stream.poll_flush(cx),
            MaybeTlsProj::Plain { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.project() {
            MaybeTlsProj::Secured { stream } => stream.poll_shutdown(cx),
            MaybeTlsProj::Plain { stream } => stream.poll_shutdown(cx),
        }
    }

    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.project() {
            MaybeTlsProj::Secured { stream } => stream.poll_write(cx, buf),
            MaybeTlsProj::Plain { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        match self.project() {
            MaybeTlsProj::Secured { stream } => stream.poll_write_vectored(cx, bufs),
            MaybeTlsProj::Plain { stream } => stream.poll_write_vectored(cx, bufs),
        }
    }
}
