//! The dynamic value model the bridge marshals to and from the wire, and the
//! trait local objects implement to be callable from the bus.

use std::fmt;
use std::sync::Arc;

use crate::proxy::Proxy;
use crate::typebridge::NativeKind;
use crate::{Error, ErrorKind};

/// A dynamically-typed host value.
///
/// Every D-Bus wire value boxes into exactly one of these; the reverse
/// direction goes through an [`Argument`](crate::argument::Argument) node
/// that knows the expected wire type, or through variant-type inference for
/// `v` slots.
#[derive(Clone)]
pub enum Value {
    /// The explicit null sentinel.
    Null,
    /// `y`.
    Byte(u8),
    /// `b`.
    Bool(bool),
    /// `n`.
    Int16(i16),
    /// `q`.
    UInt16(u16),
    /// `i`.
    Int32(i32),
    /// `u`.
    UInt32(u32),
    /// `x`.
    Int64(i64),
    /// `t`.
    UInt64(u64),
    /// `d`.
    Double(f64),
    /// `s`.
    Str(String),
    /// `g` - a validated single type signature.
    Signature(String),
    /// `o` - a raw object path with no attached scope.
    ObjectPath(String),
    /// `o` - a proxy standing in for a remote object.
    Remote(Arc<Proxy>),
    /// `h` - a file descriptor handle exchanged as an integer.
    Fd(i32),
    /// `ay` - a byte blob.
    Bytes(Vec<u8>),
    /// A homogeneous sequence (`a…`).
    Array(Vec<Value>),
    /// A positional tuple (`(…)`).
    Struct(Vec<Value>),
    /// A keyed collection (`a{…}`), insertion-ordered.
    Dict(Vec<(Value, Value)>),
    /// A value carrying its own wire type (`v`).
    Variant(Box<Value>),
    /// A local host object; transmissible only by exporting it.
    Object(Arc<dyn HostObject>),
}

impl Value {
    /// The natural host kind of this value, when it has a scalar one.
    pub fn native_kind(&self) -> Option<NativeKind> {
        Some(match self {
            Value::Byte(_) => NativeKind::U8,
            Value::Bool(_) => NativeKind::Bool,
            Value::Int16(_) => NativeKind::I16,
            Value::UInt16(_) => NativeKind::U16,
            Value::Int32(_) => NativeKind::I32,
            Value::UInt32(_) => NativeKind::U32,
            Value::Int64(_) => NativeKind::I64,
            Value::UInt64(_) => NativeKind::U64,
            Value::Double(_) => NativeKind::F64,
            Value::Str(_) => NativeKind::Str,
            Value::Fd(_) => NativeKind::Fd,
            _ => return None,
        })
    }

    /// A short name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Byte(_) => "byte",
            Value::Bool(_) => "bool",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Signature(_) => "signature",
            Value::ObjectPath(_) => "object path",
            Value::Remote(_) => "proxy",
            Value::Fd(_) => "fd",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Dict(_) => "dict",
            Value::Variant(_) => "variant",
            Value::Object(_) => "object",
        }
    }

    /// The signed-64 reading of an integer-like value, sign-extended.
    pub(crate) fn as_i64(&self) -> Option<i64> {
        Some(match *self {
            Value::Byte(v) => v as i64,
            Value::Bool(v) => v as i64,
            Value::Int16(v) => v as i64,
            Value::UInt16(v) => v as i64,
            Value::Int32(v) => v as i64,
            Value::UInt32(v) => v as i64,
            Value::Int64(v) => v,
            Value::UInt64(v) => v as i64,
            _ => return None,
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Byte(a), Byte(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (Int16(a), Int16(b)) => a == b,
            (UInt16(a), UInt16(b)) => a == b,
            (Int32(a), Int32(b)) => a == b,
            (UInt32(a), UInt32(b)) => a == b,
            (Int64(a), Int64(b)) => a == b,
            (UInt64(a), UInt64(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Signature(a), Signature(b)) => a == b,
            (ObjectPath(a), ObjectPath(b)) => a == b,
            (Remote(a), Remote(b)) => a.scope() == b.scope() && a.path_str() == b.path_str(),
            (Fd(a), Fd(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Struct(a), Struct(b)) => a == b,
            (Dict(a), Dict(b)) => a == b,
            (Variant(a), Variant(b)) => a == b,
            (Object(a), Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Value::*;
        match self {
            Null => write!(f, "Null"),
            Byte(v) => write!(f, "Byte({})", v),
            Bool(v) => write!(f, "Bool({})", v),
            Int16(v) => write!(f, "Int16({})", v),
            UInt16(v) => write!(f, "UInt16({})", v),
            Int32(v) => write!(f, "Int32({})", v),
            UInt32(v) => write!(f, "UInt32({})", v),
            Int64(v) => write!(f, "Int64({})", v),
            UInt64(v) => write!(f, "UInt64({})", v),
            Double(v) => write!(f, "Double({})", v),
            Str(v) => write!(f, "Str({:?})", v),
            Signature(v) => write!(f, "Signature({:?})", v),
            ObjectPath(v) => write!(f, "ObjectPath({:?})", v),
            Remote(p) => write!(f, "Remote({} {})", p.service_str(), p.path_str()),
            Fd(v) => write!(f, "Fd({})", v),
            Bytes(v) => write!(f, "Bytes(len {})", v.len()),
            Array(v) => f.debug_tuple("Array").field(v).finish(),
            Struct(v) => f.debug_tuple("Struct").field(v).finish(),
            Dict(v) => f.debug_tuple("Dict").field(v).finish(),
            Variant(v) => f.debug_tuple("Variant").field(v).finish(),
            Object(o) => write!(f, "Object({})", o.class_name()),
        }
    }
}

macro_rules! value_from {
    ($t: ty, $v: ident) => {
        impl From<$t> for Value {
            fn from(v: $t) -> Value { Value::$v(v) }
        }
    }
}

value_from!(u8, Byte);
value_from!(bool, Bool);
value_from!(i16, Int16);
value_from!(u16, UInt16);
value_from!(i32, Int32);
value_from!(u32, UInt32);
value_from!(i64, Int64);
value_from!(u64, UInt64);
value_from!(f64, Double);
value_from!(String, Str);

impl From<&str> for Value {
    fn from(v: &str) -> Value { Value::Str(v.to_string()) }
}

/// The declared shape of one host method: its selector, its named input
/// argument signatures, and its output signatures.
///
/// This is the bridge's stand-in for runtime reflection: exported objects
/// describe their callable surface through these descriptors.
#[derive(Debug, Clone)]
pub struct HostMethodDesc {
    /// The selector the object answers to.
    pub selector: String,
    /// Input arguments as (name, single complete D-Bus signature) pairs.
    pub in_args: Vec<(Option<String>, String)>,
    /// Output arguments as single complete D-Bus signatures.
    pub out_args: Vec<String>,
}

/// A named bag of method descriptions standing in for a host protocol.
#[derive(Debug, Clone)]
pub struct ProtocolDesc {
    /// The protocol name.
    pub name: String,
    /// The methods the protocol declares.
    pub methods: Vec<HostMethodDesc>,
}

/// A local object callable through dynamic dispatch.
///
/// Implementors can be exported on the bus; incoming method calls unmarshal
/// into [`invoke`](HostObject::invoke) and the returned value (or error)
/// travels back to the caller.
pub trait HostObject: Send + Sync {
    /// The host class name, used to derive the exported interface name.
    fn class_name(&self) -> &str;

    /// The publicly declared instance methods of the object.
    fn declared_methods(&self) -> Vec<HostMethodDesc>;

    /// Dispatches a selector with the given arguments.
    fn invoke(&self, selector: &str, args: &[Value]) -> Result<Value, Error>;

    /// Whether the object answers the given selector.
    fn responds_to(&self, selector: &str) -> bool {
        self.declared_methods().iter().any(|m| m.selector == selector)
    }
}

impl dyn HostObject {
    /// Invokes `selector` and requires a scalar result, for the unbox
    /// accessor path.
    pub(crate) fn scalar_accessor(&self, selector: &str) -> Result<Value, Error> {
        let v = self.invoke(selector, &[])?;
        match v.native_kind() {
            Some(_) => Ok(v),
            None => Err(Error::new(ErrorKind::TypeMismatch,
                format!("accessor '{}' on {} did not yield a scalar", selector, self.class_name()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality() {
        assert_eq!(Value::from(5i32), Value::Int32(5));
        assert_ne!(Value::Int32(5), Value::UInt32(5));
        assert_eq!(Value::Array(vec![Value::Byte(1)]), Value::Array(vec![Value::Byte(1)]));
        assert_ne!(Value::Null, Value::Str(String::new()));
    }

    #[test]
    fn nan_is_not_equal_but_bits_survive() {
        let v = Value::Double(f64::NAN);
        if let Value::Double(d) = v {
            assert!(d.is_nan());
            assert_eq!(d.to_bits(), f64::NAN.to_bits());
        } else {
            unreachable!();
        }
    }
}
