use core::{
    pin::Pin,
    task::{Context, Poll, ready},
};
use std::io::{self, ErrorKind};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use crate::{
    cipher::CipherFilter,
    conn::{Decoded, Filter, RELAY_BUFFER_SIZE},
    obfs::ObfsFilter,
    protocol::ProtocolFilter,
};

/// A fully composed asynchronous client connection.
///
/// Created by [`Config::stream`].
///
/// [`Config::stream`]: crate::Config::stream
pub type SsrStream<IO> =
    FilterStream<FilterStream<FilterStream<IO, ObfsFilter>, CipherFilter>, ProtocolFilter>;

pin_project! {
    /// Asynchronous counterpart of [`FilterConn`] based on `Tokio` runtime.
    ///
    /// [`FilterStream`] implements the [`AsyncRead`] and [`AsyncWrite`] traits,
    /// allowing it to be used similarly to a [`TcpStream`]. Filters may be
    /// stacked by nesting streams.
    ///
    /// [`FilterConn`]: crate::FilterConn
    /// [`TcpStream`]: tokio::net::TcpStream
    #[derive(Debug)]
    pub struct FilterStream<IO, F> {
        inner: IO,
        filter: F,
        read_state: ReadState,
        write_state: WriteState,
        inbound: Vec<u8>,
        inbound_pos: usize,
        outbound: Vec<u8>,
        outbound_pos: usize,
        scratch: Box<[u8]>,
    }
}

/// State Transition Diagram
/// ```text
///
///          |
///          V
///   +---> Read <------+
///   |      |          |
///   |      V          |
///   |   WaitData -----+
///   |
///   +--- Sendback <-- Read
///
/// ```
#[derive(Copy, Clone, Debug)]
enum ReadState {
    Read,
    WaitData,
    Sendback,
}

/// State Transition Diagram
/// ```text
///
///    |
///    V
///  WaitData <---+
///    |          |
///    V          |
///   Write ------+
/// ```
#[derive(Copy, Clone, Debug)]
enum WriteState {
    WaitData,
    Write { consumed: usize },
}

impl<IO, F> FilterStream<IO, F> {
    /// Binds `filter` to the underlying `stream`.
    pub fn new(stream: IO, filter: F) -> Self {
        Self {
            inner: stream,
            filter,
            read_state: ReadState::Read,
            write_state: WriteState::WaitData,
            inbound: Vec::new(),
            inbound_pos: 0,
            outbound: Vec::new(),
            outbound_pos: 0,
            scratch: vec![0u8; RELAY_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    /// Returns a reference to the internal stream.
    pub fn inner_stream(&self) -> &IO {
        &self.inner
    }

    /// Returns a mutable reference to the inner stream.
    pub fn inner_stream_mut(&mut self) -> &mut IO {
        &mut self.inner
    }

    /// Returns a reference to the filter.
    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// Returns a mutable reference to the filter, e.g. to hand a server-side
    /// [`ProtocolFilter`] the client IV once it is known.
    pub fn filter_mut(&mut self) -> &mut F {
        &mut self.filter
    }
}

impl<IO, F> AsyncRead for FilterStream<IO, F>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    F: Filter,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.project();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            match *me.read_state {
                ReadState::Read => {
                    let mut wire = ReadBuf::new(&mut me.scratch[..]);
                    ready!(Pin::new(&mut *me.inner).poll_read(cx, &mut wire))?;
                    let n = wire.filled().len();

                    // Reached EOF.
                    if n == 0 {
                        return Poll::Ready(Ok(()));
                    }

                    match me.filter.decode(&me.scratch[..n]) {
                        Ok(Decoded::Sendback) => {
                            trace!("answering handshake response");
                            let encoded = me.filter.encode(&[])?;
                            me.outbound.extend_from_slice(&encoded);
                            *me.read_state = ReadState::Sendback;
                        }
                        // Incomplete frame, read again.
                        Ok(Decoded::Data(data)) if data.is_empty() => {}
                        Ok(Decoded::Data(data)) => {
                            *me.inbound = data;
                            *me.inbound_pos = 0;
                            *me.read_state = ReadState::WaitData;
                        }
                        Err(e) => {
                            debug!(error = %e, "inbound data rejected");
                            return Poll::Ready(Err(e.into()));
                        }
                    }
                }
                ReadState::Sendback => {
                    ready!(poll_drain(
                        &mut *me.inner,
                        &mut *me.outbound,
                        &mut *me.outbound_pos,
                        cx
                    ))?;
                    ready!(Pin::new(&mut *me.inner).poll_flush(cx))?;
                    *me.read_state = ReadState::Read;
                }
                ReadState::WaitData => {
                    let pos = *me.inbound_pos;
                    let n = buf.remaining().min(me.inbound.len() - pos);
                    buf.put_slice(&me.inbound[pos..pos + n]);
                    *me.inbound_pos += n;
                    if *me.inbound_pos == me.inbound.len() {
                        me.inbound.clear();
                        *me.inbound_pos = 0;
                        *me.read_state = ReadState::Read;
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<IO, F> AsyncWrite for FilterStream<IO, F>
where
    IO: AsyncWrite + Unpin,
    F: Filter,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let me = self.project();
        loop {
            match *me.write_state {
                WriteState::WaitData => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let encoded = me.filter.encode(buf)?;
                    me.outbound.extend_from_slice(&encoded);
                    *me.write_state = WriteState::Write {
                        consumed: buf.len(),
                    };
                }
                WriteState::Write { consumed } => {
                    ready!(poll_drain(
                        &mut *me.inner,
                        &mut *me.outbound,
                        &mut *me.outbound_pos,
                        cx
                    ))?;
                    *me.write_state = WriteState::WaitData;
                    return Poll::Ready(Ok(consumed));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let me = self.project();
        ready!(poll_drain(
            &mut *me.inner,
            &mut *me.outbound,
            &mut *me.outbound_pos,
            cx
        ))?;
        Pin::new(&mut *me.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Writes the queued wire bytes. The queue is shared by caller writes and
/// handshake answers, so bytes leave in the order they were encoded.
fn poll_drain<IO: AsyncWrite + Unpin>(
    io: &mut IO,
    outbound: &mut Vec<u8>,
    pos: &mut usize,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    while *pos < outbound.len() {
        let n = ready!(Pin::new(&mut *io).poll_write(cx, &outbound[*pos..]))?;
        if n == 0 {
            return Poll::Ready(Err(ErrorKind::WriteZero.into()));
        }
        *pos += n;
    }
    outbound.clear();
    *pos = 0;
    Poll::Ready(Ok(()))
}
