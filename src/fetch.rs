use crate::error::Error;
use std::borrow::Cow;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Delivers exactly `needed` bytes starting at `*pos`, preferring the
/// caller's read buffer and falling back to the byte source when a header
/// field straddles the end of the buffer.
///
/// The fast path returns a window into `buf` without copying. On the slow
/// path the tail of `buf` is copied into a fresh holder and the source is
/// read until the holder is full, with `*pos` left at `buf.len()` so the
/// caller knows the buffer is exhausted.
pub(crate) async fn fetch<'a, S: AsyncRead + Unpin>(
    src: &mut S,
    buf: &'a [u8],
    pos: &mut usize,
    needed: usize,
) -> Result<Cow<'a, [u8]>, Error> {
    if buf.len() - *pos >= needed {
        let window = &buf[*pos..*pos + needed];
        *pos += needed;
        return Ok(Cow::Borrowed(window));
    }

    let mut holder = vec![0u8; needed];
    let available = buf.len() - *pos;
    holder[..available].copy_from_slice(&buf[*pos..]);
    *pos = buf.len();

    let mut filled = available;
    while filled < needed {
        let n = src.read(&mut holder[filled..]).await?;
        if n == 0 {
            return Err(Error::IOError {
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed while reading frame",
                ),
            });
        }
        filled += n;
    }

    Ok(Cow::Owned(holder))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_from_buffer() {
        let buf = [1u8, 2, 3, 4, 5];
        let mut src: &[u8] = &[];
        let mut pos = 1;

        let got = fetch(&mut src, &buf, &mut pos, 3).await.unwrap();
        assert_eq!(got.as_ref(), &[2, 3, 4]);
        assert_eq!(pos, 4);
        assert!(matches!(got, Cow::Borrowed(_)));
    }

    #[tokio::test]
    async fn test_fetch_straddling_source() {
        let buf = [1u8, 2, 3];
        let mut src: &[u8] = &[4, 5, 6, 7];
        let mut pos = 2;

        let got = fetch(&mut src, &buf, &mut pos, 4).await.unwrap();
        assert_eq!(got.as_ref(), &[3, 4, 5, 6]);
        assert_eq!(pos, 3);
        assert!(matches!(got, Cow::Owned(_)));
        // One byte of the source is left for the next call.
        assert_eq!(src, &[7]);
    }

    #[tokio::test]
    async fn test_fetch_source_exhausted() {
        let buf = [1u8];
        let mut src: &[u8] = &[2];
        let mut pos = 0;

        let err = fetch(&mut src, &buf, &mut pos, 4).await.unwrap_err();
        assert!(matches!(err, Error::IOError { .. }));
    }

    #[tokio::test]
    async fn test_fetch_empty_window() {
        let buf = [1u8, 2];
        let mut src: &[u8] = &[];
        let mut pos = 2;

        let got = fetch(&mut src, &buf, &mut pos, 0).await.unwrap();
        assert!(got.is_empty());
        assert_eq!(pos, 2);
    }
}
