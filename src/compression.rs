use crate::error::Error;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::sync::{Mutex, OnceLock};

pub const MIN_COMPRESSION_LEVEL: i32 = -2;
pub const MAX_COMPRESSION_LEVEL: i32 = 9;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = -1;

/// Sync marker terminating every deflate block flushed with an empty
/// stored block, stripped from outbound payloads and re-appended before
/// inflating inbound ones (RFC 7692, section 7.2.1).
const SYNC_MARKER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Sync marker followed by a final empty block, appended to a complete
/// message before inflating so a streaming inflater terminates instead of
/// signaling a premature end of stream.
const INFLATE_TAIL: [u8; 9] = [0x00, 0x00, 0xff, 0xff, 0x01, 0x00, 0x00, 0xff, 0xff];

// With no-context-takeover negotiated on both sides, deflate state never
// carries across messages, so the expensive compressor and decompressor
// objects can be shared process-wide and reset on every checkout.
const POOL_SOFT_CAPACITY: usize = 8;
const LEVEL_COUNT: usize = (MAX_COMPRESSION_LEVEL - MIN_COMPRESSION_LEVEL + 1) as usize;

static COMPRESSOR_POOLS: OnceLock<[Mutex<Vec<Compress>>; LEVEL_COUNT]> = OnceLock::new();
static DECOMPRESSOR_POOL: OnceLock<Mutex<Vec<Decompress>>> = OnceLock::new();

fn compressor_pool(level: i32) -> &'static Mutex<Vec<Compress>> {
    let pools =
        COMPRESSOR_POOLS.get_or_init(|| std::array::from_fn(|_| Mutex::new(Vec::new())));
    &pools[(level - MIN_COMPRESSION_LEVEL) as usize]
}

fn decompressor_pool() -> &'static Mutex<Vec<Decompress>> {
    DECOMPRESSOR_POOL.get_or_init(|| Mutex::new(Vec::new()))
}

// flate2 exposes levels 0 through 9. The two negative configuration values
// mirror the conventional deflate aliases: -1 selects the library default
// and -2, which asks for the cheapest possible encoding, maps to the
// fastest real level.
fn flate_compression(level: i32) -> Compression {
    match level {
        -2 => Compression::fast(),
        -1 => Compression::default(),
        n => Compression::new(n as u32),
    }
}

pub(crate) fn acquire_compressor(level: i32) -> Compress {
    let level = level.clamp(MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL);
    let mut pool = compressor_pool(level).lock().unwrap();
    match pool.pop() {
        Some(mut compressor) => {
            compressor.reset();
            compressor
        }
        // A miss constructs a fresh raw-deflate compressor, no zlib header.
        None => Compress::new(flate_compression(level), false),
    }
}

pub(crate) fn release_compressor(level: i32, compressor: Compress) {
    let level = level.clamp(MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL);
    let mut pool = compressor_pool(level).lock().unwrap();
    if pool.len() < POOL_SOFT_CAPACITY {
        pool.push(compressor);
    }
}

pub(crate) fn acquire_decompressor() -> Decompress {
    let mut pool = decompressor_pool().lock().unwrap();
    match pool.pop() {
        Some(mut decompressor) => {
            decompressor.reset(false);
            decompressor
        }
        None => Decompress::new(false),
    }
}

pub(crate) fn release_decompressor(decompressor: Decompress) {
    let mut pool = decompressor_pool().lock().unwrap();
    if pool.len() < POOL_SOFT_CAPACITY {
        pool.push(decompressor);
    }
}

/// Deflates one data frame's payload. The output of a sync flush always
/// ends with the 4-byte sync marker, which is stripped from the wire bytes;
/// the peer re-appends it before inflating.
pub(crate) fn compress_frame_payload(
    compressor: &mut Compress,
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity((payload.len() / 2).max(64));
    let mut consumed = 0usize;

    loop {
        out.reserve(256);
        let before_in = compressor.total_in();
        compressor.compress_vec(&payload[consumed..], &mut out, FlushCompress::Sync)?;
        consumed += (compressor.total_in() - before_in) as usize;

        // The flush is complete once all input was taken and the encoder
        // stopped short of the available output space.
        if consumed >= payload.len() && out.len() < out.capacity() {
            break;
        }
    }

    if out.ends_with(&SYNC_MARKER) {
        out.truncate(out.len() - SYNC_MARKER.len());
    }
    Ok(out)
}

/// Inflates a complete message accumulated across its fragments. The stream
/// was sent without its trailing sync marker, so the marker plus a final
/// empty block are appended first.
pub(crate) fn decompress_message(
    decompressor: &mut Decompress,
    accum: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut input = Vec::with_capacity(accum.len() + INFLATE_TAIL.len());
    input.extend_from_slice(accum);
    input.extend_from_slice(&INFLATE_TAIL);

    let mut out = Vec::with_capacity((input.len() * 2).max(256));
    let mut consumed = 0usize;

    loop {
        out.reserve(input.len().max(256));
        let before_in = decompressor.total_in();
        let status =
            decompressor.decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)?;
        consumed += (decompressor.total_in() - before_in) as usize;

        match status {
            // The appended final empty block terminates the stream.
            Status::StreamEnd => break,
            _ => {
                if consumed >= input.len() && out.len() < out.capacity() {
                    break;
                }
            }
        }
    }

    Ok(out)
}
