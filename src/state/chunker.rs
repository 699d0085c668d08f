use fastcdc::v2020::FastCDC;

/// Content-defined cut points for the write path.
///
/// Wraps the FastCDC (2020) gear-hash algorithm. A boundary depends only on
/// a sliding window of nearby bytes, never on the absolute file offset, so
/// the same content produces the same cut wherever it sits in a file. The
/// algorithm applies a tight mask while the chunk is shorter than `normal`
/// and a looser one afterward, biasing cuts toward `normal`-sized chunks
/// while tolerating the full `[min, max]` range.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    min: u32,
    normal: u32,
    max: u32,
}

impl Chunker {
    pub fn new(min: u32, normal: u32, max: u32) -> Self {
        assert!(min >= 64, "minimum chunk size too small for the gear hash");
        assert!(min <= normal && normal <= max, "chunk sizes must be ordered");
        Self { min, normal, max }
    }

    /// Return the first cut point in `buf`.
    ///
    /// Never before `min` bytes unless the buffer itself is shorter (then the
    /// whole buffer length is returned), never after `max` bytes: a hard cut
    /// is forced there when no content boundary was found earlier. Always
    /// nonzero for a nonempty buffer, so callers make progress.
    pub fn cut(&self, buf: &[u8]) -> usize {
        if buf.len() <= self.min as usize {
            return buf.len();
        }
        FastCDC::new(buf, self.min, self.normal, self.max)
            .next()
            .map(|chunk| chunk.length)
            .unwrap_or(buf.len())
    }

    /// Maximum chunk length, which is also the write-buffer flush threshold.
    pub fn max_size(&self) -> usize {
        self.max as usize
    }
}
