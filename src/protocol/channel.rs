//! # Line-framed envelope channel.
//!
//! [`EnvelopeStream`] and [`EnvelopeSink`] wrap any async pipe (child
//! stdin/stdout, the worker's own stdio, or a `tokio::io::duplex` in tests)
//! with [`LinesCodec`] framing and JSON encoding.
//!
//! ## Rules
//! - One envelope per line, in send order (a pipe is a single ordered channel).
//! - `EnvelopeStream::next` is cancel-safe: partial lines stay buffered in the
//!   framed reader, so it can sit in a `tokio::select!` next to timers.
//! - End of stream yields `None`; the caller decides what a closed peer means.

use std::marker::PhantomData;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use super::envelope::{Envelope, Incoming, decode};
use crate::error::ProtocolError;

/// Longest accepted line; a `config` envelope is well below this.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Receiving half of an envelope channel.
pub struct EnvelopeStream<R, T> {
    inner: FramedRead<R, LinesCodec>,
    _direction: PhantomData<fn() -> T>,
}

impl<R, T> EnvelopeStream<R, T>
where
    R: AsyncRead + Unpin,
    T: Envelope,
{
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            _direction: PhantomData,
        }
    }

    /// Waits for the next envelope.
    ///
    /// Returns `None` once the peer closed its end. Blank lines are skipped.
    pub async fn next(&mut self) -> Option<Result<Incoming<T>, ProtocolError>> {
        loop {
            let line = match self.inner.next().await? {
                Ok(line) => line,
                Err(e) => return Some(Err(codec_error(e))),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(decode::<T>(&line));
        }
    }
}

/// Sending half of an envelope channel.
pub struct EnvelopeSink<W, T> {
    inner: FramedWrite<W, LinesCodec>,
    _direction: PhantomData<fn(T)>,
}

impl<W, T> EnvelopeSink<W, T>
where
    W: AsyncWrite + Unpin,
    T: Envelope,
{
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            _direction: PhantomData,
        }
    }

    /// Encodes and writes one envelope, flushing the pipe.
    pub async fn send(&mut self, envelope: &T) -> Result<(), ProtocolError> {
        let line = serde_json::to_string(envelope)?;
        self.inner.send(line).await.map_err(codec_error)
    }
}

fn codec_error(e: LinesCodecError) -> ProtocolError {
    match e {
        LinesCodecError::Io(io) => ProtocolError::Io(io),
        LinesCodecError::MaxLineLengthExceeded => ProtocolError::Malformed {
            error: format!("line longer than {MAX_LINE_BYTES} bytes"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ReportSample, ToSupervisor};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_envelopes_arrive_in_send_order() {
        let (a, b) = tokio::io::duplex(4096);
        let mut sink = EnvelopeSink::<_, ToSupervisor>::new(a);
        let mut stream = EnvelopeStream::<_, ToSupervisor>::new(b);

        sink.send(&ToSupervisor::Started).await.unwrap();
        sink.send(&ToSupervisor::Ready).await.unwrap();
        sink.send(&ToSupervisor::Report(ReportSample::Producer { sent: 5 }))
            .await
            .unwrap();
        drop(sink);

        let mut got = Vec::new();
        while let Some(item) = stream.next().await {
            match item.unwrap() {
                Incoming::Known(env) => got.push(env.tag()),
                Incoming::Unknown { channel, .. } => panic!("unknown {channel}"),
            }
        }
        assert_eq!(got, vec!["started", "ready", "report"]);
    }

    #[tokio::test]
    async fn test_garbage_line_does_not_end_stream() {
        let (mut a, b) = tokio::io::duplex(4096);
        let mut stream = EnvelopeStream::<_, ToSupervisor>::new(b);

        a.write_all(b"hello\n\n{\"channel\":\"ready\"}\n").await.unwrap();
        drop(a);

        assert!(stream.next().await.unwrap().is_err());
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Incoming::Known(ToSupervisor::Ready)
        );
        assert!(stream.next().await.is_none());
    }
}
