//! The failure taxonomy of the bridge, plus a thin wrapper around libdbus'
//! `DBusError` used at the FFI boundary.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::{fmt, ptr};

use crate::{ffi, init_dbus};

/// The prefix under which host exceptions travel as D-Bus error names.
///
/// An exception raised while servicing an exported call becomes an error
/// reply named `org.gnustep.objc.exception.<SymbolicName>`; a peer receiving
/// such an error reverses the transform.
pub const EXCEPTION_NAME_PREFIX: &str = "org.gnustep.objc.exception.";

/// Classifies every failure the bridge can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An invalid or over-long D-Bus type signature.
    MalformedSignature,
    /// A host invocation layout incompatible with the method, or a wire type
    /// that differs from the expected argument type.
    TypeMismatch,
    /// The transport failed to enqueue a message.
    OutOfMemory,
    /// The transport closed before a reply arrived.
    Disconnected,
    /// The peer returned a D-Bus error message.
    RemoteError,
    /// Introspection failed, or the service is not on the bus.
    RemoteUnreachable,
    /// A pending call exceeded its deadline.
    Timeout,
    /// The invocation was cancelled by the caller.
    Cancelled,
    /// Variant-type inference could not represent a value.
    UnsupportedValue,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedSignature => "malformed signature",
            ErrorKind::TypeMismatch => "type mismatch",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::RemoteError => "remote error",
            ErrorKind::RemoteUnreachable => "remote unreachable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::UnsupportedValue => "unsupported value",
        }
    }
}

/// A single structured error: a kind, a human-readable message and an
/// optional payload (remote error name, offending signature).
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    remote_name: Option<String>,
    signature: Option<String>,
}

impl Error {
    /// Creates an error of the given kind.
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Error {
        Error { kind, message: message.into(), remote_name: None, signature: None }
    }

    /// A malformed-signature error carrying the offending signature.
    pub fn malformed_signature<S: Into<String>>(sig: &str, message: S) -> Error {
        Error {
            kind: ErrorKind::MalformedSignature,
            message: message.into(),
            remote_name: None,
            signature: Some(sig.to_string()),
        }
    }

    /// A remote error preserving the D-Bus error name.
    pub fn remote<N: Into<String>, S: Into<String>>(name: N, message: S) -> Error {
        let name = name.into();
        let kind = classify_error_name(&name);
        Error { kind, message: message.into(), remote_name: Some(name), signature: None }
    }

    /// An error representing a host exception with the given symbolic name.
    ///
    /// The exception travels the wire as
    /// `org.gnustep.objc.exception.<symbol>` so the peer can rebuild it.
    pub fn exception<S: Into<String>>(symbol: &str, message: S) -> Error {
        Error {
            kind: ErrorKind::RemoteError,
            message: message.into(),
            remote_name: Some(format!("{}{}", EXCEPTION_NAME_PREFIX, symbol)),
            signature: None,
        }
    }

    /// The error kind.
    pub fn kind(&self) -> ErrorKind { self.kind }

    /// The human-readable message.
    pub fn message(&self) -> &str { &self.message }

    /// The preserved D-Bus error name, for remote errors.
    pub fn remote_name(&self) -> Option<&str> { self.remote_name.as_deref() }

    /// The offending signature, for malformed-signature errors.
    pub fn signature(&self) -> Option<&str> { self.signature.as_deref() }

    /// The symbolic host exception name, if this error round-tripped from an
    /// exported exception.
    pub fn exception_symbol(&self) -> Option<&str> {
        self.remote_name.as_deref().and_then(|n| n.strip_prefix(EXCEPTION_NAME_PREFIX))
    }

    /// The D-Bus error name to use when sending this error as a reply.
    pub fn reply_error_name(&self) -> String {
        if let Some(n) = self.remote_name.as_deref() {
            return n.to_string();
        }
        match self.kind {
            ErrorKind::TypeMismatch | ErrorKind::MalformedSignature | ErrorKind::UnsupportedValue =>
                "org.freedesktop.DBus.Error.InvalidArgs".to_string(),
            ErrorKind::OutOfMemory => "org.freedesktop.DBus.Error.NoMemory".to_string(),
            ErrorKind::Disconnected => "org.freedesktop.DBus.Error.Disconnected".to_string(),
            ErrorKind::Timeout => "org.freedesktop.DBus.Error.Timeout".to_string(),
            _ => "org.freedesktop.DBus.Error.Failed".to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let Some(n) = &self.remote_name {
            write!(f, " ({})", n)?;
        }
        if let Some(s) = &self.signature {
            write!(f, " (signature '{}')", s)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// Maps a D-Bus error name onto the bridge's taxonomy.
pub(crate) fn classify_error_name(name: &str) -> ErrorKind {
    match name {
        "org.freedesktop.DBus.Error.NoMemory" => ErrorKind::OutOfMemory,
        "org.freedesktop.DBus.Error.Disconnected" => ErrorKind::Disconnected,
        "org.freedesktop.DBus.Error.Timeout"
        | "org.freedesktop.DBus.Error.TimedOut"
        | "org.freedesktop.DBus.Error.NoReply" => ErrorKind::Timeout,
        "org.freedesktop.DBus.Error.ServiceUnknown"
        | "org.freedesktop.DBus.Error.NameHasNoOwner"
        | "org.freedesktop.DBus.Error.UnknownObject" => ErrorKind::RemoteUnreachable,
        _ => ErrorKind::RemoteError,
    }
}

/// Wrapper around libdbus' out-parameter error struct.
pub(crate) struct NativeError {
    e: ffi::DBusError,
}

unsafe impl Send for NativeError {}

impl NativeError {
    pub fn empty() -> NativeError {
        init_dbus();
        let mut e = ffi::DBusError {
            name: ptr::null(),
            message: ptr::null(),
            dummy: 0,
            padding1: ptr::null(),
        };
        unsafe { ffi::dbus_error_init(&mut e) };
        NativeError { e }
    }

    pub fn name(&self) -> Option<&str> {
        c_str_opt(self.e.name)
    }

    pub fn message(&self) -> Option<&str> {
        c_str_opt(self.e.message)
    }

    pub fn get_mut(&mut self) -> &mut ffi::DBusError { &mut self.e }
}

fn c_str_opt<'a>(c: *const c_char) -> Option<&'a str> {
    if c.is_null() { None }
    else { std::str::from_utf8(unsafe { CStr::from_ptr(c).to_bytes() }).ok() }
}

impl Drop for NativeError {
    fn drop(&mut self) {
        unsafe { ffi::dbus_error_free(&mut self.e) };
    }
}

impl From<NativeError> for Error {
    fn from(n: NativeError) -> Error {
        let name = n.name().unwrap_or("org.freedesktop.DBus.Error.Failed").to_string();
        let message = n.message().unwrap_or("").to_string();
        Error::remote(name, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(classify_error_name("org.freedesktop.DBus.Error.NoMemory"), ErrorKind::OutOfMemory);
        assert_eq!(classify_error_name("org.freedesktop.DBus.Error.ServiceUnknown"), ErrorKind::RemoteUnreachable);
        assert_eq!(classify_error_name("org.freedesktop.DBus.Error.NoReply"), ErrorKind::Timeout);
        assert_eq!(classify_error_name("com.example.Whatever"), ErrorKind::RemoteError);
    }

    #[test]
    fn exception_round_trip() {
        let e = Error::exception("MyFailure", "nope");
        assert_eq!(e.remote_name(), Some("org.gnustep.objc.exception.MyFailure"));

        let back = Error::remote(e.reply_error_name(), e.message());
        assert_eq!(back.exception_symbol(), Some("MyFailure"));
        assert_eq!(back.message(), "nope");
        assert_eq!(back.kind(), ErrorKind::RemoteError);
    }

    #[test]
    fn reply_names() {
        assert_eq!(Error::new(ErrorKind::TypeMismatch, "x").reply_error_name(),
            "org.freedesktop.DBus.Error.InvalidArgs");
        assert_eq!(Error::new(ErrorKind::Cancelled, "x").reply_error_name(),
            "org.freedesktop.DBus.Error.Failed");
    }
}
