use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

/// Upper bound on one protocol record; a line past this is a codec error,
/// handled as a transport failure rather than a skippable parse error.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

pub type RecordLines<S> = FramedRead<StreamReader<S, Bytes>, LinesCodec>;

/// Frame a raw byte-chunk stream into complete newline-terminated records.
///
/// The codec buffers a trailing partial line across chunk boundaries and
/// flushes any non-empty residue as one final line at end-of-stream, so the
/// decoded sequence depends only on the concatenated bytes, never on how the
/// transport happened to chunk them.
pub fn ndjson_lines<S>(chunks: S) -> RecordLines<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    FramedRead::new(
        StreamReader::new(chunks),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    )
}

/// Adapt a reqwest body into the io-flavored chunk stream the framer wants.
pub fn response_chunks(
    response: reqwest::Response,
) -> impl Stream<Item = std::io::Result<Bytes>> + Unpin {
    response.bytes_stream().map(|r| r.map_err(std::io::Error::other))
}
