//! Credential redaction at the log sink.
//!
//! Every formatted event passes through [`RedactingWriter`] before it reaches
//! the real output, so call sites never need to scrub secrets themselves.

use std::borrow::Cow;
use std::io::{self, Write};
use std::sync::Arc;

use tracing_subscriber::fmt::MakeWriter;

use crate::config::REDACTED;

/// Replace every occurrence of `secret` in `text` with `[REDACTED]`.
pub fn redact<'a>(text: &'a str, secret: &str) -> Cow<'a, str> {
    if secret.is_empty() || !text.contains(secret) {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(text.replace(secret, REDACTED))
    }
}

/// `MakeWriter` wrapper that redacts a secret from each event.
#[derive(Clone)]
pub struct RedactingMakeWriter<M> {
    inner: M,
    secret: Arc<str>,
}

impl<M> RedactingMakeWriter<M> {
    /// Wrap `inner`; an empty secret disables redaction.
    pub fn new(inner: M, secret: impl Into<Arc<str>>) -> Self {
        Self {
            inner,
            secret: secret.into(),
        }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer(), self.secret.clone())
    }
}

/// Buffers one event and writes the redacted text on flush or drop.
///
/// Buffering keeps a secret that straddles two `write` calls from slipping
/// through.
pub struct RedactingWriter<W: Write> {
    inner: W,
    secret: Arc<str>,
    buf: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W, secret: Arc<str>) -> Self {
        Self {
            inner,
            secret,
            buf: Vec::new(),
        }
    }

    fn emit(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.buf);
        let redacted = redact(&text, &self.secret);
        self.inner.write_all(redacted.as_bytes())?;
        self.buf.clear();
        self.inner.flush()
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        // Nowhere to report a failed log write
        let _ = self.emit();
    }
}
