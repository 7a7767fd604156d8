use core::fmt;

/// Errors returned by the codec and the message plumbing.
///
/// Protocol-level outcomes that travel inside messages use [`Status`] instead.
///
/// [`Status`]: ../att/enum.Status.html
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A length field or the size of a buffer is out of range.
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// Returned both when a value does not fit into its output buffer and when an input buffer
    /// ends before an announced field.
    Eof,

    /// Parsing didn't consume the entire buffer.
    IncompleteParse,

    /// A bounded queue (kernel message queue, deferred queue, task table) has no room left.
    QueueFull,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::IncompleteParse => "excess data in buffer",
            Error::QueueFull => "queue full",
        })
    }
}
