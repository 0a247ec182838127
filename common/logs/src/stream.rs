use std::io::{self, BufRead, BufReader, Cursor, Read};

use common_s3::{ObjectStore, S3Error};
use flate2::read::MultiGzDecoder;
use tracing::debug;

/// Lines of one log object, decoded lazily. A read error (corrupt gzip data) ends
/// the useful part of the stream.
pub type LineStream = Box<dyn Iterator<Item = io::Result<String>> + Send>;

/// Split raw object bytes into lines without their `\n`. Invalid UTF-8 is replaced
/// rather than rejected.
pub fn lines_from_bytes(bytes: Vec<u8>, compressed: bool) -> LineStream {
    let reader: Box<dyn Read + Send> = if compressed {
        Box::new(MultiGzDecoder::new(Cursor::new(bytes)))
    } else {
        Box::new(Cursor::new(bytes))
    };
    Box::new(
        BufReader::new(reader)
            .split(b'\n')
            .map(|line| line.map(|l| String::from_utf8_lossy(&l).into_owned())),
    )
}

/// Fetch an object and stream its lines
pub async fn get_object_lines(
    store: &dyn ObjectStore,
    account: &str,
    container: &str,
    name: &str,
    compressed: bool,
) -> Result<LineStream, S3Error> {
    debug!("get_object_lines({account}, {container}, {name}, compressed={compressed})");
    let bytes = store.get_object(account, container, name).await?;
    Ok(lines_from_bytes(bytes, compressed))
}
