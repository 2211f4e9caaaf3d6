pub mod hot_tail;
pub mod index;
pub mod segment;

/// Internal recovery signal (spec.md §4.1, §4.6). Never surfaced to callers
/// of the public API — `recovery` and the live read path both translate it
/// into either a truncation or a best-effort partial result.
#[derive(Debug)]
pub(crate) enum FrameError {
    /// Fewer than 4 bytes remain, or the declared length runs past EOF.
    Torn,
    Io(std::io::Error),
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}
