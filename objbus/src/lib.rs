//! A bidirectional bridge between a dynamically-typed, message-passing object
//! model and D-Bus.
//!
//! The crate lets a program talk to remote D-Bus objects through opaque
//! [`Proxy`](proxy::Proxy) values that resolve selectors against introspection
//! data at runtime, and lets it export local [`HostObject`](value::HostObject)
//! implementations so that remote peers may invoke them. Type information is
//! derived from D-Bus introspection XML or from the declared-method tables the
//! host objects supply themselves.
//!
//! The load-bearing pieces are the recursive signature parser
//! ([`signature`]), the two-way converter between D-Bus wire values and the
//! dynamic [`Value`](value::Value) model ([`argument`]), and the
//! selector-to-member dispatch tables ([`interface`]). Everything else -
//! proxies, property access, exporting - funnels through them.
//!
//! Wire transport is libdbus, consumed through `libdbus-sys`. A companion
//! binary, `objbus-codegen`, turns introspection XML into Rust trait
//! declarations.

#![warn(missing_docs)]

#[allow(missing_docs)]
extern crate libdbus_sys as ffi;

mod strings;
pub use crate::strings::{BusName, ErrorName, InterfaceName, MemberName, ObjectPath};

mod error;
pub use crate::error::{Error, ErrorKind, EXCEPTION_NAME_PREFIX};

pub mod value;
pub use crate::value::{HostMethodDesc, HostObject, ProtocolDesc, Value};

pub mod typebridge;
pub use crate::typebridge::{HostKind, NativeKind, TypeCode};

pub mod signature;

pub mod message;
pub use crate::message::Message;

pub mod argument;
pub use crate::argument::{Argument, MarshalCtx};

pub mod registry;

pub mod method;
pub use crate::method::{Access, Invocation, Method, Property, Signal};

pub mod interface;
pub use crate::interface::Interface;

pub mod introspect;

pub mod proxy;
pub use crate::proxy::{Proxy, ProxyState, RemoteObject, Scope};

pub mod call;
pub use crate::call::{CallState, CancelToken, MethodCall, ReplyFuture};

pub mod endpoint;
pub use crate::endpoint::{BusKind, Endpoint, MatchSpec, RequestNameReply, Token};

pub mod export;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

static INITDBUS: std::sync::Once = std::sync::Once::new();

pub(crate) fn init_dbus() {
    INITDBUS.call_once(|| {
        if unsafe { ffi::dbus_threads_init_default() } == 0 {
            panic!("Out of memory when trying to initialize D-Bus library!");
        }
    });
}

pub(crate) fn c_str_to_slice(c: &*const c_char) -> Option<&str> {
    if c.is_null() { None }
    else { std::str::from_utf8(unsafe { CStr::from_ptr(*c).to_bytes() }).ok() }
}

pub(crate) fn to_c_str(n: &str) -> CString { CString::new(n.as_bytes()).unwrap() }
