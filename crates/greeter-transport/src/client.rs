//! Client side of a streaming call.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::DEFAULT_MAX_FRAME_LENGTH;
use crate::errors::Result;

/// A connected client speaking the length-delimited frame protocol.
#[derive(Debug)]
pub struct ClientStream {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl ClientStream {
    /// Connect with the default frame limit.
    pub async fn connect(address: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_with_limit(address, DEFAULT_MAX_FRAME_LENGTH).await
    }

    /// Connect with an explicit frame limit.
    pub async fn connect_with_limit(
        address: impl ToSocketAddrs,
        max_frame_length: usize,
    ) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, crate::frame_codec(max_frame_length)),
        })
    }

    /// Send one frame.
    pub async fn send(&mut self, payload: Bytes) -> Result<()> {
        self.framed.send(payload).await?;
        Ok(())
    }

    /// Receive the next frame, or `None` once the server closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.framed.next().await {
            Some(frame) => Ok(Some(frame?.freeze())),
            None => Ok(None),
        }
    }

    /// Half-close: the server sees end of stream, frames already in flight
    /// from the server can still be received.
    pub async fn close(&mut self) -> Result<()> {
        SinkExt::<Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn close_half_closes_and_still_receives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let mut client = ClientStream::connect(address).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = Framed::new(stream, crate::frame_codec(DEFAULT_MAX_FRAME_LENGTH));

        client.send(Bytes::from_static(b"ada")).await.unwrap();
        client.close().await.unwrap();
        assert_eq!(&server.next().await.unwrap().unwrap()[..], b"ada");
        assert!(server.next().await.is_none());

        server.send(Bytes::from_static(b"Hello ada")).await.unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            Some(Bytes::from_static(b"Hello ada"))
        );
        drop(server);
        assert_eq!(client.recv().await.unwrap(), None);
    }
}
