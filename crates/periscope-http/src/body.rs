use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::buffered::{BufferedReader, BufferedWriter};
use crate::error::ParseError;
use crate::headers::BodyKind;
use crate::sniffer::Sniffer;
use crate::{CHUNK_SIZE_LINE_LIMIT, DEFAULT_MAX_HEADER_BYTES};

/// Stream a message body from `src` to `dst` according to `kind`.
///
/// Returns the number of payload-plus-framing bytes written. The sniffer
/// sees exactly the byte ranges written, in order. `scratch` assembles
/// chunk-size lines and trailers; it is cleared as needed.
pub async fn copy_body<R, W>(
    src: &mut BufferedReader<R>,
    dst: &mut BufferedWriter<W>,
    kind: BodyKind,
    scratch: &mut BytesMut,
    sniffer: &dyn Sniffer,
) -> Result<u64, ParseError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match kind {
        BodyKind::None => Ok(0),
        BodyKind::Fixed(length) => copy_fixed(src, dst, length, sniffer, false).await,
        BodyKind::Chunked => copy_chunked(src, dst, scratch, sniffer).await,
        BodyKind::UntilEof => copy_fixed(src, dst, u64::MAX, sniffer, true).await,
    }
}

/// The primitive drain loop: write whatever is already buffered (truncated
/// to the remaining budget), consume exactly what was written, refill, and
/// repeat. Never consumes past the budget, so trailing pipelined bytes stay
/// available on the reader.
async fn copy_fixed<R, W>(
    src: &mut BufferedReader<R>,
    dst: &mut BufferedWriter<W>,
    budget: u64,
    sniffer: &dyn Sniffer,
    eof_ends_body: bool,
) -> Result<u64, ParseError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = budget;
    let mut copied = 0_u64;
    while remaining > 0 {
        if src.buffered().is_empty() {
            let filled = src.fill().await?;
            if filled == 0 {
                if eof_ends_body {
                    break;
                }
                return Err(ParseError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "body ended before its declared length",
                )));
            }
        }
        let take = remaining.min(src.buffered().len() as u64) as usize;
        dst.write_all(&src.buffered()[..take]).await?;
        sniffer.body(&src.buffered()[..take]);
        src.consume(take);
        remaining -= take as u64;
        copied += take as u64;
    }
    Ok(copied)
}

async fn copy_chunked<R, W>(
    src: &mut BufferedReader<R>,
    dst: &mut BufferedWriter<W>,
    scratch: &mut BytesMut,
    sniffer: &dyn Sniffer,
) -> Result<u64, ParseError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0_u64;
    loop {
        scratch.clear();
        if let Err(error) = src.read_line_into(scratch, CHUNK_SIZE_LINE_LIMIT).await {
            return Err(chunk_framing(error));
        }
        let size = parse_chunk_size(&scratch[..])?;

        dst.write_all(&scratch[..]).await?;
        sniffer.body(&scratch[..]);
        copied += scratch.len() as u64;

        if size == 0 {
            return copy_trailers(src, dst, scratch, sniffer, copied).await;
        }

        // Chunk payload plus its trailing CRLF, forwarded as-is.
        copied += copy_fixed(src, dst, size.saturating_add(2), sniffer, false).await?;
    }
}

/// Forward trailer lines verbatim up to and including the final empty line.
async fn copy_trailers<R, W>(
    src: &mut BufferedReader<R>,
    dst: &mut BufferedWriter<W>,
    scratch: &mut BytesMut,
    sniffer: &dyn Sniffer,
    mut copied: u64,
) -> Result<u64, ParseError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        scratch.clear();
        if let Err(error) = src.read_line_into(scratch, DEFAULT_MAX_HEADER_BYTES).await {
            return Err(chunk_framing(error));
        }
        dst.write_all(&scratch[..]).await?;
        sniffer.body(&scratch[..]);
        copied += scratch.len() as u64;
        if scratch.len() == 2 {
            return Ok(copied);
        }
    }
}

/// Parse the hex size prefix of a chunk-size line. A `;`-delimited extension
/// is ignored here but has already been forwarded verbatim by the caller.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let body = &line[..line.len().saturating_sub(2)];
    let hex_end = body
        .iter()
        .position(|&b| b == b';')
        .unwrap_or(body.len());
    let hex = std::str::from_utf8(&body[..hex_end])
        .map_err(|_| ParseError::BadChunk("chunk size is not UTF-8".to_string()))?
        .trim();
    if hex.is_empty() {
        return Err(ParseError::BadChunk("empty chunk size".to_string()));
    }
    u64::from_str_radix(hex, 16)
        .map_err(|_| ParseError::BadChunk(format!("invalid chunk size {hex:?}")))
}

fn chunk_framing(error: ParseError) -> ParseError {
    match error {
        ParseError::HeaderTooLarge(limit) => {
            ParseError::BadChunk(format!("chunk line exceeded {limit} bytes"))
        }
        ParseError::BadHeader(detail) => ParseError::BadChunk(detail),
        other => other,
    }
}
