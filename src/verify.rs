//! Integrity-checked reading of layer content.
//!
//! [`VerifiedReader`] hashes everything that passes through it and, once the underlying stream
//! reports end-of-file, compares the result against the digest the layer was registered with.  A
//! mismatch turns the end-of-file into an error, so a consumer that reads to the end either got
//! exactly the registered bytes or sees a failure.  Nothing is buffered.
//!
//! [`HashingReader`] is the plain building block: it only computes the digest and size of what
//! passes through, which is what registration needs.

use std::{
    io::{self, ErrorKind, Read},
    pin::Pin,
    task::{ready, Context, Poll},
};

use log::debug;
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};

use crate::digest::{Algorithm, Digest, Hasher};

/// The content of a stream did not hash to the expected digest.
///
/// This is reported as the `InvalidData` [`io::Error`] returned by the final read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "could not verify layer data for: {expected} (content hashes to {found}). This may be \
     because internal files in the layer store were modified. Re-pulling or rebuilding this \
     image may resolve the issue"
)]
pub struct VerificationError {
    pub expected: Digest,
    pub found: Digest,
}

impl From<VerificationError> for io::Error {
    fn from(value: VerificationError) -> Self {
        io::Error::new(ErrorKind::InvalidData, value)
    }
}

/// Wraps a reader and hashes all data read through it.
#[derive(Debug)]
pub struct HashingReader<R> {
    inner: R,
    hasher: Hasher,
    len: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R, algorithm: Algorithm) -> Self {
        HashingReader {
            inner,
            hasher: algorithm.hasher(),
            len: 0,
        }
    }

    /// The digest of everything read so far.
    pub fn digest(&self) -> Digest {
        self.hasher.clone().finalize()
    }

    /// The number of bytes read so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn consume(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consume(&buf[..n]);
        Ok(n)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.consume(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// Wraps a reader, verifying at end-of-file that the bytes read match a digest.
///
/// Errors from the inner reader are passed through unchanged.  Dropping the reader (or calling
/// [`VerifiedReader::into_inner()`]) before end-of-file is always fine and never verifies
/// anything.
#[derive(Debug)]
pub struct VerifiedReader<R> {
    reader: HashingReader<R>,
    expected: Digest,
}

impl<R> VerifiedReader<R> {
    pub fn new(inner: R, expected: Digest) -> Self {
        VerifiedReader {
            reader: HashingReader::new(inner, expected.algorithm()),
            expected,
        }
    }

    pub fn expected(&self) -> &Digest {
        &self.expected
    }

    /// Gives up on verification and returns the underlying stream.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    /// Checks the bytes seen so far against the expected digest.
    pub fn verify(&self) -> Result<(), VerificationError> {
        let found = self.reader.digest();
        if found == self.expected {
            Ok(())
        } else {
            debug!(
                "layer content verification failed: expected {} found {found}",
                self.expected
            );
            Err(VerificationError {
                expected: self.expected.clone(),
                found,
            })
        }
    }
}

impl<R: Read> Read for VerifiedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        if n == 0 && !buf.is_empty() {
            // zero bytes into a non-empty buffer: end-of-file
            self.verify()?;
        }
        Ok(n)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for VerifiedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let had_room = buf.remaining() > 0;

        ready!(Pin::new(&mut this.reader).poll_read(cx, buf))?;

        if had_room && buf.filled().len() == before {
            this.verify()?;
        }
        Poll::Ready(Ok(()))
    }
}
