//! Splits a raw read into Firehose XML frames.

const FRAME_START: &[u8] = b"<?xml";
const FRAME_END: &[u8] = b"</data>";

/// Frames found at the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameSplit {
    pub frames: Vec<String>,
    /// Bytes covered by `frames`; everything after is not frame data.
    pub consumed: usize,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split consecutive `<?xml ... </data>` frames off the front of `buf`.
///
/// Scanning stops at the first position that does not begin with `<?xml`,
/// or when a frame has no closing `</data>`. Nothing is buffered between
/// calls: a frame split across two reads is not recognized.
pub fn split_frames(buf: &[u8]) -> FrameSplit {
    let mut split = FrameSplit::default();
    while split.consumed < buf.len() {
        let rest = &buf[split.consumed..];
        if !rest.starts_with(FRAME_START) {
            break;
        }
        let Some(end) = find(rest, FRAME_END) else {
            break;
        };
        let len = end + FRAME_END.len();
        split
            .frames
            .push(String::from_utf8_lossy(&rest[..len]).into_owned());
        split.consumed += len;
    }
    split
}
