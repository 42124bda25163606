//! A wrapper around libdbus messages and their append/read iterators.
//!
//! The iterator pair is where all marshalling bottoms out: `IterAppend`
//! writes basic values and opens/closes containers, `Iter` reads them back.
//! Container writes go through a closure so the container is closed on every
//! exit path, keeping the wire balanced even when marshalling fails halfway.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::{fmt, mem, ptr};

use crate::error::NativeError;
use crate::typebridge::TypeCode;
use crate::{c_str_to_slice, ffi, init_dbus, to_c_str};
use crate::{BusName, Error, ErrorKind, ErrorName, InterfaceName, MemberName, ObjectPath};

pub use crate::ffi::DBusMessageType as MessageType;

fn ffi_iter() -> ffi::DBusMessageIter {
    unsafe { mem::zeroed() }
}

fn check(f: &str, i: u32) -> Result<(), Error> {
    if i == 0 {
        Err(Error::new(ErrorKind::OutOfMemory, format!("{} failed", f)))
    } else {
        Ok(())
    }
}

/// A D-Bus message: headers plus a marshalled argument body.
pub struct Message {
    msg: *mut ffi::DBusMessage,
}

unsafe impl Send for Message {}

impl Message {
    /// Creates a new method call message.
    pub fn method_call(destination: &BusName, path: &ObjectPath, iface: &InterfaceName,
                       method: &MemberName) -> Message {
        init_dbus();
        let ptr = unsafe {
            ffi::dbus_message_new_method_call(destination.as_cstr().as_ptr(),
                path.as_cstr().as_ptr(), iface.as_cstr().as_ptr(), method.as_cstr().as_ptr())
        };
        if ptr.is_null() { panic!("D-Bus error: dbus_message_new_method_call failed") }
        Message { msg: ptr }
    }

    /// Creates a new signal message.
    pub fn signal(path: &ObjectPath, iface: &InterfaceName, name: &MemberName) -> Message {
        init_dbus();
        let ptr = unsafe {
            ffi::dbus_message_new_signal(path.as_cstr().as_ptr(), iface.as_cstr().as_ptr(),
                name.as_cstr().as_ptr())
        };
        if ptr.is_null() { panic!("D-Bus error: dbus_message_new_signal failed") }
        Message { msg: ptr }
    }

    /// Creates a method return (reply) for this method call.
    pub fn method_return(&self) -> Message {
        let ptr = unsafe { ffi::dbus_message_new_method_return(self.msg) };
        if ptr.is_null() { panic!("D-Bus error: dbus_message_new_method_return failed") }
        Message { msg: ptr }
    }

    /// Creates an error reply for this method call.
    pub fn error_reply(&self, error_name: &ErrorName, error_message: &str) -> Message {
        let m = to_c_str(error_message);
        let ptr = unsafe {
            ffi::dbus_message_new_error(self.msg, error_name.as_cstr().as_ptr(), m.as_ptr())
        };
        if ptr.is_null() { panic!("D-Bus error: dbus_message_new_error failed") }
        Message { msg: ptr }
    }

    /// Gets the message type.
    pub fn msg_type(&self) -> MessageType {
        unsafe { mem::transmute(ffi::dbus_message_get_type(self.msg)) }
    }

    /// Gets the D-Bus serial of the message, if assigned.
    pub fn serial(&self) -> u32 {
        unsafe { ffi::dbus_message_get_serial(self.msg) }
    }

    pub(crate) fn set_serial(&mut self, s: u32) {
        unsafe { ffi::dbus_message_set_serial(self.msg, s) };
    }

    /// Gets the serial of the message this is a reply to, if present.
    pub fn reply_serial(&self) -> Option<u32> {
        let s = unsafe { ffi::dbus_message_get_reply_serial(self.msg) };
        if s == 0 { None } else { Some(s) }
    }

    /// Returns true if the message does not expect a reply.
    pub fn no_reply(&self) -> bool {
        unsafe { ffi::dbus_message_get_no_reply(self.msg) != 0 }
    }

    /// Sets whether the message expects a reply.
    pub fn set_no_reply(&self, v: bool) {
        unsafe { ffi::dbus_message_set_no_reply(self.msg, if v { 1 } else { 0 }) }
    }

    fn internal_str(&self, c: *const c_char) -> Option<String> {
        c_str_to_slice(&c).map(|s| s.to_string())
    }

    /// The connection name that originated this message.
    pub fn sender(&self) -> Option<String> {
        self.internal_str(unsafe { ffi::dbus_message_get_sender(self.msg) })
    }

    /// The destination bus name.
    pub fn destination(&self) -> Option<String> {
        self.internal_str(unsafe { ffi::dbus_message_get_destination(self.msg) })
    }

    /// The object path the message is routed to.
    pub fn path(&self) -> Option<String> {
        self.internal_str(unsafe { ffi::dbus_message_get_path(self.msg) })
    }

    /// The interface header.
    pub fn interface(&self) -> Option<String> {
        self.internal_str(unsafe { ffi::dbus_message_get_interface(self.msg) })
    }

    /// The member being called or emitted.
    pub fn member(&self) -> Option<String> {
        self.internal_str(unsafe { ffi::dbus_message_get_member(self.msg) })
    }

    /// If this message is an error reply, extracts it as a structured error
    /// with the D-Bus error name preserved.
    pub fn to_error(&self) -> Option<Error> {
        let mut e = NativeError::empty();
        if unsafe { ffi::dbus_set_error_from_message(e.get_mut(), self.msg) } != 0 {
            Some(e.into())
        } else {
            None
        }
    }

    /// Transforms an error reply into an `Err`, passing other messages
    /// through.
    pub fn as_result(self) -> Result<Message, Error> {
        match self.to_error() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }

    /// Starts reading the arguments of the message.
    pub fn iter_init(&self) -> Iter {
        Iter::new(self)
    }

    /// Starts appending arguments to the message.
    pub fn iter_append(&mut self) -> IterAppend {
        IterAppend::new(self)
    }

    pub(crate) fn ptr(&self) -> *mut ffi::DBusMessage { self.msg }

    pub(crate) fn from_ptr(ptr: *mut ffi::DBusMessage, add_ref: bool) -> Message {
        if add_ref {
            unsafe { ffi::dbus_message_ref(ptr) };
        }
        Message { msg: ptr }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        unsafe { ffi::dbus_message_unref(self.msg) };
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:?}, {:?}, {:?}, {:?})", self.msg_type(), self.path(),
            self.interface(), self.member())
    }
}

/// Helper struct for appending one or more arguments to a message.
pub struct IterAppend<'a>(ffi::DBusMessageIter, &'a Message);

impl<'a> IterAppend<'a> {
    /// Creates an append iterator positioned at the end of the message body.
    pub fn new(m: &'a mut Message) -> IterAppend<'a> {
        let mut i = ffi_iter();
        unsafe { ffi::dbus_message_iter_init_append(m.ptr(), &mut i) };
        IterAppend(i, m)
    }

    /// Appends one basic value from a sign-extended 64-bit buffer.
    ///
    /// libdbus copies only the wire width of `code` out of the buffer, so a
    /// single `i64` slot serves every integer and boolean code.
    pub fn append_i64(&mut self, code: TypeCode, v: i64) -> Result<(), Error> {
        let p = &v as *const _ as *const c_void;
        check("dbus_message_iter_append_basic", unsafe {
            ffi::dbus_message_iter_append_basic(&mut self.0, code.as_ffi(), p)
        })
    }

    /// Appends a double, bit-identically.
    pub fn append_f64(&mut self, v: f64) -> Result<(), Error> {
        let p = &v as *const _ as *const c_void;
        check("dbus_message_iter_append_basic", unsafe {
            ffi::dbus_message_iter_append_basic(&mut self.0, TypeCode::Double.as_ffi(), p)
        })
    }

    /// Appends a string-like basic value (string, object path, signature).
    pub fn append_cstr(&mut self, code: TypeCode, v: &CStr) -> Result<(), Error> {
        let p = v.as_ptr();
        let q = &p as *const _ as *const c_void;
        check("dbus_message_iter_append_basic", unsafe {
            ffi::dbus_message_iter_append_basic(&mut self.0, code.as_ffi(), q)
        })
    }

    /// Appends a block of bytes at once. Only valid inside an array
    /// container whose element type is byte.
    pub fn append_fixed_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        let zptr = data.as_ptr();
        let zlen = data.len() as c_int;
        check("dbus_message_iter_append_fixed_array", unsafe {
            ffi::dbus_message_iter_append_fixed_array(&mut self.0, TypeCode::Byte.as_ffi(),
                &zptr as *const _ as *const c_void, zlen)
        })
    }

    /// Opens a container, runs `f` inside it, and closes it again.
    ///
    /// The container is closed on every exit path, so a marshalling error
    /// inside `f` cannot leave the message unbalanced.
    pub fn append_container<R, F>(&mut self, code: TypeCode, sig: Option<&CStr>, f: F)
        -> Result<R, Error>
    where F: FnOnce(&mut IterAppend<'a>) -> Result<R, Error>
    {
        let mut s = IterAppend(ffi_iter(), self.1);
        let p = sig.map(|s| s.as_ptr()).unwrap_or(ptr::null());
        check("dbus_message_iter_open_container", unsafe {
            ffi::dbus_message_iter_open_container(&mut self.0, code.as_ffi(), p, &mut s.0)
        })?;
        let r = f(&mut s);
        let closed = check("dbus_message_iter_close_container", unsafe {
            ffi::dbus_message_iter_close_container(&mut self.0, &mut s.0)
        });
        let v = r?;
        closed?;
        Ok(v)
    }
}

/// Helper struct for reading arguments from a message.
///
/// Not a Rust `Iterator`: the items are of varying types, and reads do not
/// advance the position - call [`next`](Iter::next) explicitly.
pub struct Iter<'a>(ffi::DBusMessageIter, &'a Message, u32);

impl<'a> Iter<'a> {
    /// Creates a read iterator positioned at the first argument.
    pub fn new(m: &'a Message) -> Iter<'a> {
        let mut i = ffi_iter();
        unsafe { ffi::dbus_message_iter_init(m.ptr(), &mut i) };
        Iter(i, m, 0)
    }

    /// The type code of the current argument, or `None` past the end.
    pub fn arg_type(&mut self) -> Option<TypeCode> {
        TypeCode::from_ffi(unsafe { ffi::dbus_message_iter_get_arg_type(&mut self.0) })
    }

    /// Advances to the next argument. Returns false if there is none.
    pub fn next(&mut self) -> bool {
        self.2 += 1;
        unsafe { ffi::dbus_message_iter_next(&mut self.0) != 0 }
    }

    /// Zero-based position of the current argument.
    pub fn pos(&self) -> u32 { self.2 }

    /// The complete signature of the remaining arguments at this level.
    pub fn signature(&mut self) -> String {
        unsafe {
            let c = ffi::dbus_message_iter_get_signature(&mut self.0);
            assert!(!c.is_null());
            let r = CStr::from_ptr(c).to_string_lossy().into_owned();
            ffi::dbus_free(c as *mut c_void);
            r
        }
    }

    /// Reads the current basic argument into a sign-extended 64-bit buffer,
    /// if it has the expected code.
    pub fn get_i64(&mut self, code: TypeCode) -> Option<i64> {
        let mut c = 0i64;
        unsafe {
            if ffi::dbus_message_iter_get_arg_type(&mut self.0) != code.as_ffi() { return None; }
            ffi::dbus_message_iter_get_basic(&mut self.0, &mut c as *mut _ as *mut c_void);
        }
        Some(c)
    }

    /// Reads the current double.
    pub fn get_f64(&mut self) -> Option<f64> {
        let mut c = 0f64;
        unsafe {
            if ffi::dbus_message_iter_get_arg_type(&mut self.0) != TypeCode::Double.as_ffi() {
                return None;
            }
            ffi::dbus_message_iter_get_basic(&mut self.0, &mut c as *mut _ as *mut c_void);
        }
        Some(c)
    }

    /// Reads the current string-like argument, if it has the expected code.
    pub fn get_string(&mut self, code: TypeCode) -> Option<String> {
        unsafe {
            if ffi::dbus_message_iter_get_arg_type(&mut self.0) != code.as_ffi() { return None; }
            let mut p: *const c_char = ptr::null();
            ffi::dbus_message_iter_get_basic(&mut self.0, &mut p as *mut _ as *mut c_void);
            CStr::from_ptr(p).to_str().ok().map(|s| s.to_string())
        }
    }

    /// Recurses into the current container argument.
    pub fn recurse(&mut self) -> Option<Iter<'a>> {
        let t = self.arg_type()?;
        if !t.is_container() { return None; }
        let mut subiter = ffi_iter();
        unsafe { ffi::dbus_message_iter_recurse(&mut self.0, &mut subiter) };
        Some(Iter(subiter, self.1, 0))
    }

    /// Reads a whole byte array in one step. Only valid when the current
    /// argument is an array of bytes.
    pub fn get_byte_array(&mut self) -> Option<Vec<u8>> {
        let mut sub = self.recurse()?;
        unsafe {
            let t = ffi::dbus_message_iter_get_arg_type(&mut sub.0);
            if t == 0 { return Some(Vec::new()); }
            if t != TypeCode::Byte.as_ffi() { return None; }
            let mut v: *mut u8 = ptr::null_mut();
            let mut n: c_int = 0;
            ffi::dbus_message_iter_get_fixed_array(&mut sub.0,
                &mut v as *mut _ as *mut c_void, &mut n);
            if v.is_null() { return Some(Vec::new()); }
            Some(std::slice::from_raw_parts(v, n as usize).to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_call() -> Message {
        Message::method_call(&"org.test.rust".into(), &"/".into(),
            &"org.test.rust".into(), &"Test".into())
    }

    #[test]
    fn no_reply_flag() {
        let m = test_call();
        assert!(!m.no_reply());
        m.set_no_reply(true);
        assert!(m.no_reply());
    }

    #[test]
    fn headers() {
        let m = test_call();
        assert_eq!(m.destination().as_deref(), Some("org.test.rust"));
        assert_eq!(m.path().as_deref(), Some("/"));
        assert_eq!(m.member().as_deref(), Some("Test"));
        assert_eq!(m.msg_type(), MessageType::MethodCall);
    }

    #[test]
    fn basic_append_and_read() {
        let mut m = test_call();
        {
            let mut ia = m.iter_append();
            ia.append_i64(TypeCode::UInt16, 2000).unwrap();
            ia.append_cstr(TypeCode::String, &to_c_str("hello")).unwrap();
            ia.append_f64(-3.25).unwrap();
        }
        let mut it = m.iter_init();
        assert_eq!(it.get_i64(TypeCode::UInt16), Some(2000));
        assert!(it.next());
        assert_eq!(it.get_string(TypeCode::String).as_deref(), Some("hello"));
        assert!(it.next());
        assert_eq!(it.get_f64(), Some(-3.25));
        assert!(!it.next());
        assert_eq!(it.arg_type(), None);
    }

    #[test]
    fn container_balancing() {
        let mut m = test_call();
        {
            let sig = to_c_str("i");
            let mut ia = m.iter_append();
            ia.append_container(TypeCode::Array, Some(&sig), |s| {
                s.append_i64(TypeCode::Int32, -1)?;
                s.append_i64(TypeCode::Int32, 7)
            }).unwrap();
        }
        let mut it = m.iter_init();
        assert_eq!(it.arg_type(), Some(TypeCode::Array));
        let mut sub = it.recurse().unwrap();
        assert_eq!(sub.get_i64(TypeCode::Int32), Some(-1));
        assert!(sub.next());
        assert_eq!(sub.get_i64(TypeCode::Int32), Some(7));
        assert!(!sub.next());
    }

    #[test]
    fn byte_array_fast_path() {
        let data: Vec<u8> = (0..=255u8).chain(0..44u8).collect();
        let mut m = test_call();
        {
            let sig = to_c_str("y");
            let mut ia = m.iter_append();
            let d = &data;
            ia.append_container(TypeCode::Array, Some(&sig), |s| {
                s.append_fixed_bytes(d)
            }).unwrap();
        }
        let mut it = m.iter_init();
        assert_eq!(it.get_byte_array().unwrap(), data);
    }
}
