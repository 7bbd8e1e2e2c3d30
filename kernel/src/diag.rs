//! Diagnostics output boundary.
//!
//! The allocator core never talks to a console directly; anything it wants
//! to say — log lines, heap dumps — goes through a [`Sink`]. The kernel's
//! console driver implements `Sink` on whatever device it owns, and hosted
//! test builds implement it on a plain buffer.

use core::fmt;

/// A destination for diagnostic text.
///
/// Implementations receive raw byte spans and must not fail; a sink that
/// loses output (e.g. a full ring buffer) simply drops it.
pub trait Sink {
    /// Write one span of bytes to the sink.
    fn write_span(&mut self, span: &[u8]);
}

/// Adapter that lets `core::fmt` machinery drive a [`Sink`].
pub struct SinkWriter<'a, S: ?Sized + Sink> {
    sink: &'a mut S,
}

impl<'a, S: ?Sized + Sink> SinkWriter<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        Self { sink }
    }
}

impl<S: ?Sized + Sink> fmt::Write for SinkWriter<'_, S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.sink.write_span(s.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    struct BufferSink(String);

    impl Sink for BufferSink {
        fn write_span(&mut self, span: &[u8]) {
            self.0.push_str(core::str::from_utf8(span).unwrap());
        }
    }

    #[test]
    fn writer_forwards_formatted_text() {
        let mut sink = BufferSink(String::new());
        let mut writer = SinkWriter::new(&mut sink);
        write!(writer, "order {} has {} blocks", 3, 2).unwrap();
        assert_eq!(sink.0, "order 3 has 2 blocks");
    }
}
