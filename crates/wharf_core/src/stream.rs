//! Body adapters used on the upload paths.
//!
//! [`DigestBody`] taps a request body so the registry learns the digest of
//! what actually streamed through it, and [`ChunkedBody`] regroups an
//! arbitrary body into parts sized for the object store's staged-upload
//! API.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures_core::stream::Stream;
use hyper::body::Body;
use pin_project::pin_project;

use crate::Digester;

type ChunkResult = std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync + 'static>>;

/// Streams a [`hyper::body::Body`] unchanged while feeding every chunk to
/// a shared [`Digester`].
///
/// The digester handle is shared because the body is consumed by whatever
/// transport writes it out; the caller keeps the other handle and
/// finalizes it once the write completes.
#[pin_project]
pub struct DigestBody {
    body: Body,
    digester: Arc<Mutex<Digester>>,
}

impl DigestBody {
    pub fn from_body(body: Body, digester: Arc<Mutex<Digester>>) -> Self {
        Self { body, digester }
    }
}

impl Stream for DigestBody {
    type Item = ChunkResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = Pin::new(this.body).poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            this.digester
                .lock()
                .expect("a digest body is only ever polled from one task")
                .update(chunk);
        }
        polled.map(|next| {
            next.map(|result| {
                result.map_err(|e| {
                    Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
                })
            })
        })
    }
}

/// Part size handed to the object store's staged uploads. S3-compatible
/// backends require every part except the last to be at least 5 MB.
const STAGED_PART_SIZE: usize = 6 * 1024 * 1024;

/// Split the next full-sized part off the front of the buffer, if one has
/// accumulated.
fn take_full_part(buffer: &mut BytesMut) -> Option<Bytes> {
    if buffer.len() >= STAGED_PART_SIZE {
        Some(buffer.split_to(STAGED_PART_SIZE).freeze())
    } else {
        None
    }
}

/// Regroups a [`hyper::body::Body`] into parts of exactly
/// [`STAGED_PART_SIZE`] bytes, with whatever remains flushed as the final
/// part when the body ends.
#[pin_project]
pub struct ChunkedBody {
    body: Body,
    buffer: BytesMut,
}

impl ChunkedBody {
    pub fn from_body(body: Body) -> ChunkedBody {
        ChunkedBody {
            body,
            buffer: BytesMut::with_capacity(STAGED_PART_SIZE),
        }
    }
}

impl Stream for ChunkedBody {
    type Item = ChunkResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        loop {
            if let Some(part) = take_full_part(this.buffer) {
                return Poll::Ready(Some(Ok(part)));
            }
            match Pin::new(&mut *this.body).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(Box::new(e)))),
                Poll::Ready(None) => {
                    if this.buffer.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(this.buffer.split().freeze())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    fn short_buffers_hold_until_flush() {
        let mut buffer = BytesMut::from(&b"short"[..]);
        assert!(take_full_part(&mut buffer).is_none());
        assert_eq!(&buffer[..], b"short");
    }

    #[rstest]
    fn full_parts_split_off_the_front() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&vec![7u8; STAGED_PART_SIZE + 10]);
        let part = take_full_part(&mut buffer).expect("a full part has accumulated");
        assert_eq!(part.len(), STAGED_PART_SIZE);
        assert_eq!(buffer.len(), 10);
        assert!(take_full_part(&mut buffer).is_none());
    }
}
