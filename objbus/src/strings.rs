//! Strings with a specific format: valid bus names, object paths, interface
//! names, member names and error names.
//!
//! The wrappers own a `CString` so they can be handed to libdbus without
//! conversion costs; validation happens once, at construction.

use std::ffi::{CStr, CString};
use std::{fmt, ops};

use crate::{Error, ErrorKind};

/// The D-Bus name grammars. Every name class is a sequence of elements with
/// a per-class alphabet; each predicate answers whether the whole string is
/// well-formed. Interior nul bytes never pass.
mod grammar {
    const MAX_NAME_LEN: usize = 255;

    fn is_element(e: &[u8], digit_may_lead: bool, hyphens: bool) -> bool {
        let Some((&first, rest)) = e.split_first() else { return false };
        let lead_ok = first.is_ascii_alphabetic()
            || first == b'_'
            || (hyphens && first == b'-')
            || (digit_may_lead && first.is_ascii_digit());
        lead_ok && rest.iter().all(|&b| {
            b.is_ascii_alphanumeric() || b == b'_' || (hyphens && b == b'-')
        })
    }

    pub fn member_name(s: &str) -> bool {
        s.len() <= MAX_NAME_LEN && is_element(s.as_bytes(), false, false)
    }

    pub fn interface_name(s: &str) -> bool {
        if s.len() > MAX_NAME_LEN {
            return false;
        }
        let mut elements = 0;
        for e in s.as_bytes().split(|&b| b == b'.') {
            if !is_element(e, false, false) {
                return false;
            }
            elements += 1;
        }
        elements >= 2
    }

    pub fn error_name(s: &str) -> bool {
        interface_name(s)
    }

    pub fn bus_name(s: &str) -> bool {
        if s.len() > MAX_NAME_LEN {
            return false;
        }
        // Unique connection names lead with ':' and may have digit-led
        // elements; well-known names may not.
        let (unique, rest) = match s.as_bytes().split_first() {
            Some((&b':', rest)) => (true, rest),
            _ => (false, s.as_bytes()),
        };
        let mut elements = 0;
        for e in rest.split(|&b| b == b'.') {
            if !is_element(e, unique, true) {
                return false;
            }
            elements += 1;
        }
        elements >= 2
    }

    pub fn object_path(s: &str) -> bool {
        let b = s.as_bytes();
        if b.first() != Some(&b'/') {
            return false;
        }
        if b.len() == 1 {
            return true;
        }
        b[1..].split(|&c| c == b'/').all(|e| {
            !e.is_empty() && e.iter().all(|&c| c.is_ascii_alphanumeric() || c == b'_')
        })
    }
}

macro_rules! dstring_wrapper {
    ($(#[$comments:meta])* $t: ident, $check: ident) => {

$(#[$comments])*
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct $t(CString);

impl $t {
    /// Creates a new instance, validating the string against the D-Bus
    /// specification rules for this name class.
    pub fn new<S: Into<String>>(s: S) -> Result<$t, Error> {
        let s = s.into();
        if !grammar::$check(&s) {
            return Err(Error::new(ErrorKind::TypeMismatch,
                format!("'{}' is not a valid {}", s, stringify!($t))));
        }
        // The grammars exclude interior nul bytes.
        CString::new(s).map($t).map_err(|_| {
            Error::new(ErrorKind::TypeMismatch,
                format!("nul byte in {}", stringify!($t)))
        })
    }

    /// View this string as a CStr, for handing to libdbus.
    pub fn as_cstr(&self) -> &CStr { &self.0 }
}

/// # Panics
///
/// If the given string is not valid.
impl From<&str> for $t {
    fn from(s: &str) -> $t { $t::new(s).unwrap() }
}

/// # Panics
///
/// If the given string is not valid.
impl From<String> for $t {
    fn from(s: String) -> $t { $t::new(s).unwrap() }
}

impl ops::Deref for $t {
    type Target = str;
    fn deref(&self) -> &str {
        // Validated at construction; the name grammars are all ASCII.
        std::str::from_utf8(self.0.to_bytes()).unwrap()
    }
}

impl fmt::Display for $t {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <str as fmt::Display>::fmt(self, f)
    }
}

}}

dstring_wrapper!(
    /// A wrapper around a string that is guaranteed to be
    /// a valid D-Bus bus name, either well-known or unique.
    BusName, bus_name
);

dstring_wrapper!(
    /// A wrapper around a string that is guaranteed to be
    /// a valid absolute D-Bus object path.
    ObjectPath, object_path
);

dstring_wrapper!(
    /// A wrapper around a string that is guaranteed to be
    /// a valid D-Bus interface name.
    InterfaceName, interface_name
);

dstring_wrapper!(
    /// A wrapper around a string that is guaranteed to be
    /// a valid D-Bus member name, i e a method or signal name.
    MemberName, member_name
);

dstring_wrapper!(
    /// A wrapper around a string that is guaranteed to be
    /// a valid D-Bus error name.
    ErrorName, error_name
);

impl Default for ObjectPath {
    fn default() -> ObjectPath { ObjectPath::new("/").unwrap() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member() {
        assert!(MemberName::new("He11o").is_ok());
        assert!(MemberName::new("_go").is_ok());
        assert!(MemberName::new("").is_err());
        assert!(MemberName::new("He11o!").is_err());
        assert!(MemberName::new("1Hello").is_err());
        assert!(MemberName::new(":1.54").is_err());
        assert!(MemberName::new("Has.Dot").is_err());
    }

    #[test]
    fn interface() {
        assert!(InterfaceName::new("Hello.W0rld").is_ok());
        assert!(InterfaceName::new("a.b.c.d").is_ok());
        assert!(InterfaceName::new("He11o").is_err());
        assert!(InterfaceName::new("Hello.").is_err());
        assert!(InterfaceName::new(".Hello").is_err());
        assert!(InterfaceName::new("ZZZ.1Hello").is_err());
        assert!(InterfaceName::new(":1.54").is_err());
        assert!(InterfaceName::new(&"x.".repeat(130)).is_err());
    }

    #[test]
    fn bus() {
        assert!(BusName::new("Hello.W0rld").is_ok());
        assert!(BusName::new("com.example-corp.Frob").is_ok());
        assert!(BusName::new(":1.54").is_ok());
        assert!(BusName::new("1.54").is_err());
        assert!(BusName::new("Hello!.World").is_err());
        assert!(BusName::new("Hello").is_err());
        assert!(BusName::new(":").is_err());
        assert!(BusName::new("").is_err());
    }

    #[test]
    fn object_path() {
        assert!(ObjectPath::new("/").is_ok());
        assert!(ObjectPath::new("/1234").is_ok());
        assert!(ObjectPath::new("/a/c/df1").is_ok());
        assert!(ObjectPath::new("/asdf/_123").is_ok());
        assert!(ObjectPath::new("").is_err());
        assert!(ObjectPath::new("/abce/").is_err());
        assert!(ObjectPath::new("/ab//c/d").is_err());
        assert!(ObjectPath::new("/12.43/fasd").is_err());
        assert!(ObjectPath::new("relative/path").is_err());
    }

    #[test]
    fn deref_and_display() {
        let p: ObjectPath = "/valid".into();
        assert_eq!(&*p, "/valid");
        assert_eq!(format!("{}", p), "/valid");
        assert_eq!(ObjectPath::default(), ObjectPath::new("/").unwrap());
    }
}
