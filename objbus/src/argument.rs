//! Argument nodes: parsed D-Bus signature trees that marshal and unmarshal
//! one value each.
//!
//! A leaf argument carries a basic type code; container arguments own their
//! child arguments. Marshalling walks the tree against a [`Value`], boxing
//! and unboxing through fixed-width slots the way libdbus expects, and
//! variant slots synthesize an argument tree from the value itself.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::sync::Arc;

use log::warn;

use crate::endpoint::Endpoint;
use crate::message::{Iter, IterAppend};
use crate::proxy::{Proxy, Scope};
use crate::signature::{self, SignatureIter};
use crate::typebridge::{self, HostKind, NativeKind, TypeCode};
use crate::value::{HostObject, Value};
use crate::{registry, to_c_str};
use crate::{Error, ErrorKind, ObjectPath};

/// Annotation key declaring the host class of an argument.
pub const CLASS_ANNOTATION: &str = "org.gnustep.objc.class";

/// Scope and endpoint context threaded through marshalling calls.
///
/// The original design reached the owning proxy through parent
/// back-references; here the context travels with the call instead, carrying
/// the receiving scope (for object-path reference checks) and the endpoint
/// (for minting child proxies and auto-exports).
#[derive(Clone, Default)]
pub struct MarshalCtx {
    /// The scope of the proxy the marshalled message belongs to.
    pub scope: Option<Scope>,
    /// The endpoint carrying the message.
    pub endpoint: Option<Arc<Endpoint>>,
    /// True when marshalling a reply from an exported object; unlocks
    /// auto-export of unknown objects.
    pub local: bool,
}

impl MarshalCtx {
    /// The context for values travelling through the given proxy.
    pub fn for_proxy(p: &Proxy) -> MarshalCtx {
        MarshalCtx { scope: Some(p.scope()), endpoint: Some(p.endpoint()), local: false }
    }

    /// The context for replies leaving a locally exported object.
    pub fn for_export(endpoint: Arc<Endpoint>, peer: Option<Scope>) -> MarshalCtx {
        MarshalCtx { scope: peer, endpoint: Some(endpoint), local: true }
    }

    fn box_path(&self, path: &str) -> Value {
        if let (Some(scope), Some(ep)) = (&self.scope, &self.endpoint) {
            if let Ok(p) = ObjectPath::new(path) {
                return Value::Remote(Proxy::new(ep.clone(), scope.service_name(), p));
            }
        }
        Value::ObjectPath(path.to_string())
    }
}

/// A fixed-width slot holding one unboxed basic value.
///
/// All integer values travel sign-extended in a 64-bit buffer and are masked
/// to the wire width on write; doubles are carried bit-identically; strings
/// hold their NUL-terminated bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    bits: u64,
    text: Option<CString>,
}

impl Slot {
    fn from_i64(v: i64) -> Slot { Slot { bits: v as u64, text: None } }
    fn from_f64(v: f64) -> Slot { Slot { bits: v.to_bits(), text: None } }
    fn from_text(c: CString) -> Slot { Slot { bits: 0, text: Some(c) } }
    fn empty_text() -> Slot { Slot { bits: 0, text: Some(CString::default()) } }

    /// The sign-extended integer reading of the slot.
    pub fn as_i64(&self) -> i64 { self.bits as i64 }

    /// The bit-identical double reading of the slot.
    pub fn as_f64(&self) -> f64 { f64::from_bits(self.bits) }

    /// The string reading of the slot, if it holds one.
    pub fn text(&self) -> Option<&CString> { self.text.as_ref() }
}

/// One node of a parsed D-Bus signature tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    code: TypeCode,
    name: Option<String>,
    annotations: BTreeMap<String, String>,
    children: Vec<Argument>,
    dict: bool,
}

impl Argument {
    /// A leaf argument of the given basic type.
    pub fn new_basic(code: TypeCode) -> Argument {
        Argument { code, name: None, annotations: BTreeMap::new(), children: Vec::new(), dict: false }
    }

    fn container(code: TypeCode, children: Vec<Argument>) -> Argument {
        let dict = code == TypeCode::Array
            && children.first().map(|c| c.code == TypeCode::DictEntry).unwrap_or(false);
        Argument { code, name: None, annotations: BTreeMap::new(), children, dict }
    }

    /// Parses an argument from a string encoding exactly one complete type.
    ///
    /// Fails on empty input, trailing garbage and unbalanced brackets.
    pub fn from_signature(s: &str) -> Result<Argument, Error> {
        signature::validate_single(s)?;
        let b = s.as_bytes();
        let mut pos = 0;
        let arg = Argument::parse_at(s, b, &mut pos)?;
        Ok(arg)
    }

    /// Constructs the argument for the next complete type of the iterator.
    pub fn from_iter(it: &mut SignatureIter) -> Result<Argument, Error> {
        match it.next() {
            Some(s) => Argument::from_signature(s),
            None => Err(Error::malformed_signature("", "signature exhausted")),
        }
    }

    /// Maps a host type descriptor onto an argument. Native kinds map
    /// through the type bridge; the remaining kinds have no wire
    /// representation and are rejected.
    pub fn from_host_kind(kind: HostKind) -> Result<Argument, Error> {
        match kind {
            HostKind::Native(k) => Ok(Argument::new_basic(typebridge::dbus_code_for_host_kind(k))),
            other => Err(Error::new(ErrorKind::UnsupportedValue,
                format!("host type {:?} has no D-Bus representation", other))),
        }
    }

    fn parse_at(whole: &str, b: &[u8], pos: &mut usize) -> Result<Argument, Error> {
        let malformed = |m: &str| Error::malformed_signature(whole, m.to_string());
        let c = *b.get(*pos).ok_or_else(|| malformed("truncated signature"))? as char;
        *pos += 1;
        let code = TypeCode::from_char(c).ok_or_else(|| malformed("unknown type code"))?;
        Ok(match code {
            TypeCode::Array => {
                let child = Argument::parse_at(whole, b, pos)?;
                Argument::container(TypeCode::Array, vec![child])
            }
            TypeCode::Struct => {
                let mut children = Vec::new();
                while b.get(*pos) != Some(&b')') {
                    if *pos >= b.len() {
                        return Err(malformed("unbalanced parenthesis"));
                    }
                    children.push(Argument::parse_at(whole, b, pos)?);
                }
                *pos += 1;
                if children.is_empty() {
                    return Err(malformed("empty struct"));
                }
                Argument::container(TypeCode::Struct, children)
            }
            TypeCode::DictEntry => {
                let key = Argument::parse_at(whole, b, pos)?;
                if !key.code.is_basic() {
                    return Err(malformed("dict entry key must be a basic type"));
                }
                let value = Argument::parse_at(whole, b, pos)?;
                if b.get(*pos) != Some(&b'}') {
                    return Err(malformed("dict entry must hold exactly a key and a value"));
                }
                *pos += 1;
                Argument::container(TypeCode::DictEntry, vec![key, value])
            }
            // Variants discover their element type from the wire.
            TypeCode::Variant => Argument::new_basic(TypeCode::Variant),
            basic => Argument::new_basic(basic),
        })
    }

    /// Renders the signature this argument tree encodes; round-trips through
    /// [`from_signature`](Argument::from_signature).
    pub fn render(&self) -> String {
        match self.code {
            TypeCode::Array => format!("a{}", self.children[0].render()),
            TypeCode::Struct => {
                let inner: String = self.children.iter().map(|c| c.render()).collect();
                format!("({})", inner)
            }
            TypeCode::DictEntry => {
                format!("{{{}{}}}", self.children[0].render(), self.children[1].render())
            }
            _ => self.code.as_char().to_string(),
        }
    }

    /// Sets the argument name.
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Argument {
        self.name = Some(name.into());
        self
    }

    /// Attaches an annotation.
    pub fn set_annotation<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.annotations.insert(key.into(), value.into());
    }

    /// The D-Bus type code of this node.
    pub fn code(&self) -> TypeCode { self.code }

    /// The argument name, if the introspection data supplied one.
    pub fn name(&self) -> Option<&str> { self.name.as_deref() }

    /// The argument's annotations.
    pub fn annotations(&self) -> &BTreeMap<String, String> { &self.annotations }

    /// Child arguments of a container node.
    pub fn children(&self) -> &[Argument] { &self.children }

    /// Whether this is an array whose sole child is a dict entry.
    pub fn is_dict(&self) -> bool { self.dict }

    /// The host class values of this argument box into: the annotation
    /// override if present, the default bridge class for the code otherwise.
    pub fn host_class(&self) -> &str {
        if let Some(c) = self.annotations.get(CLASS_ANNOTATION) {
            return c;
        }
        match self.code {
            TypeCode::Byte => "byte",
            TypeCode::Boolean => "bool",
            TypeCode::Int16 => "int16",
            TypeCode::UInt16 => "uint16",
            TypeCode::Int32 => "int32",
            TypeCode::UInt32 => "uint32",
            TypeCode::Int64 => "int64",
            TypeCode::UInt64 => "uint64",
            TypeCode::Double => "double",
            TypeCode::String => "string",
            TypeCode::ObjectPath => "proxy",
            TypeCode::Signature => "signature",
            TypeCode::UnixFd => "fd",
            TypeCode::Array => if self.dict { "dict" } else { "array" },
            TypeCode::Struct => "struct",
            TypeCode::DictEntry => "pair",
            TypeCode::Variant => "variant",
        }
    }

    /// Renders an introspection XML element for this argument.
    pub fn to_xml(&self, direction: Option<&str>, indent: usize) -> String {
        let pad = " ".repeat(indent);
        let mut s = format!("{}<arg", pad);
        if let Some(n) = &self.name {
            s.push_str(&format!(" name=\"{}\"", n));
        }
        s.push_str(&format!(" type=\"{}\"", self.render()));
        if let Some(d) = direction {
            s.push_str(&format!(" direction=\"{}\"", d));
        }
        s.push_str("/>\n");
        s
    }

    // ---- unbox / box ----

    fn type_mismatch(&self, v: &Value) -> Error {
        Error::new(ErrorKind::TypeMismatch,
            format!("cannot convert {} into '{}'", v.type_name(), self.render()))
    }

    fn unbox_via_registry(&self, o: &Arc<dyn HostObject>) -> Result<Slot, Error> {
        for sel in registry::selectors_for(self.code) {
            if o.responds_to(&sel) {
                let v = o.scalar_accessor(&sel)?;
                return self.unbox(&v);
            }
        }
        Err(Error::new(ErrorKind::TypeMismatch,
            format!("no unboxing accessor turns {} into '{}'", o.class_name(), self.render())))
    }

    /// Unboxes a value into a fixed-width slot for this basic type.
    ///
    /// Numeric values coerce when the widening rules allow it; absent (null)
    /// values become a zeroed slot, except string-like types which become
    /// the empty string. Booleans are normalized to 0 or 1. Custom host
    /// objects fall back to the process-wide accessor registry.
    pub fn unbox(&self, v: &Value) -> Result<Slot, Error> {
        let target = typebridge::native_kind_for(self.code);
        match self.code {
            TypeCode::Byte | TypeCode::Int16 | TypeCode::UInt16 | TypeCode::Int32
            | TypeCode::UInt32 | TypeCode::Int64 | TypeCode::UInt64 => match v {
                Value::Null => Ok(Slot::from_i64(0)),
                Value::Object(o) => self.unbox_via_registry(o),
                _ => {
                    let source = v.native_kind().ok_or_else(|| self.type_mismatch(v))?;
                    if source == NativeKind::Bool || !typebridge::fits(source, target) {
                        return Err(self.type_mismatch(v));
                    }
                    Ok(Slot::from_i64(v.as_i64().ok_or_else(|| self.type_mismatch(v))?))
                }
            },
            TypeCode::Boolean => match v {
                Value::Null => Ok(Slot::from_i64(0)),
                Value::Bool(b) => Ok(Slot::from_i64(if *b { 1 } else { 0 })),
                Value::Object(o) => self.unbox_via_registry(o),
                _ => match v.as_i64() {
                    Some(n) => Ok(Slot::from_i64(if n != 0 { 1 } else { 0 })),
                    None => Err(self.type_mismatch(v)),
                },
            },
            TypeCode::Double => match v {
                Value::Null => Ok(Slot::from_f64(0.0)),
                Value::Double(d) => Ok(Slot::from_f64(*d)),
                Value::Object(o) => self.unbox_via_registry(o),
                _ => Err(self.type_mismatch(v)),
            },
            TypeCode::String => match v {
                Value::Null => Ok(Slot::empty_text()),
                Value::Str(s) => Ok(Slot::from_text(self.text_to_c(s)?)),
                Value::Object(o) => self.unbox_via_registry(o),
                _ => Err(self.type_mismatch(v)),
            },
            TypeCode::ObjectPath => match v {
                Value::Null => Ok(Slot::empty_text()),
                Value::Remote(p) => Ok(Slot::from_text(self.text_to_c(p.path_str())?)),
                Value::ObjectPath(s) => Ok(Slot::from_text(self.text_to_c(s)?)),
                _ => Err(self.type_mismatch(v)),
            },
            TypeCode::Signature => match v {
                Value::Null => Ok(Slot::empty_text()),
                Value::Signature(s) => Ok(Slot::from_text(self.text_to_c(s)?)),
                _ => Err(self.type_mismatch(v)),
            },
            TypeCode::UnixFd => match v {
                Value::Null => Ok(Slot::from_i64(0)),
                Value::Fd(fd) => Ok(Slot::from_i64(*fd as i64)),
                Value::Object(o) => self.unbox_via_registry(o),
                _ => Err(self.type_mismatch(v)),
            },
            _ => Err(Error::new(ErrorKind::TypeMismatch,
                format!("container type '{}' has no slot representation", self.render()))),
        }
    }

    fn text_to_c(&self, s: &str) -> Result<CString, Error> {
        CString::new(s).map_err(|_| Error::new(ErrorKind::TypeMismatch,
            "string value contains a nul byte".to_string()))
    }

    /// Boxes a slot into the default host class for this basic type.
    ///
    /// Any non-zero wire boolean becomes host `true`; object paths become
    /// child proxies inheriting service and endpoint from the receiving
    /// scope; signatures validate and box as signature values.
    pub fn box_value(&self, slot: &Slot, ctx: &MarshalCtx) -> Result<Value, Error> {
        let text = || -> Result<String, Error> {
            let c = slot.text().ok_or_else(|| Error::new(ErrorKind::TypeMismatch,
                "slot holds no string".to_string()))?;
            c.to_str().map(|s| s.to_string()).map_err(|_| Error::new(ErrorKind::TypeMismatch,
                "wire string is not UTF-8".to_string()))
        };
        Ok(match self.code {
            TypeCode::Byte => Value::Byte(slot.as_i64() as u8),
            TypeCode::Boolean => Value::Bool(slot.as_i64() != 0),
            TypeCode::Int16 => Value::Int16(slot.as_i64() as i16),
            TypeCode::UInt16 => Value::UInt16(slot.as_i64() as u16),
            TypeCode::Int32 => Value::Int32(slot.as_i64() as i32),
            TypeCode::UInt32 => Value::UInt32(slot.as_i64() as u32),
            TypeCode::Int64 => Value::Int64(slot.as_i64()),
            TypeCode::UInt64 => Value::UInt64(slot.as_i64() as u64),
            TypeCode::Double => Value::Double(slot.as_f64()),
            TypeCode::String => Value::Str(text()?),
            TypeCode::ObjectPath => ctx.box_path(&text()?),
            TypeCode::Signature => {
                let s = text()?;
                signature::validate_single(&s)?;
                Value::Signature(s)
            }
            TypeCode::UnixFd => Value::Fd(slot.as_i64() as i32),
            _ => return Err(Error::new(ErrorKind::TypeMismatch,
                format!("container type '{}' has no slot representation", self.render()))),
        })
    }

    // ---- marshal ----

    /// Marshals `v` as this argument into an append iterator.
    pub fn marshal(&self, v: &Value, ia: &mut IterAppend, ctx: &MarshalCtx) -> Result<(), Error> {
        match self.code {
            TypeCode::ObjectPath => self.marshal_object_path(v, ia, ctx),
            c if c.is_basic() => {
                let slot = self.unbox(v)?;
                match c {
                    TypeCode::Double => ia.append_f64(slot.as_f64()),
                    TypeCode::String | TypeCode::Signature => {
                        let text = slot.text().ok_or_else(|| self.type_mismatch(v))?;
                        ia.append_cstr(c, text)
                    }
                    _ => ia.append_i64(c, slot.as_i64()),
                }
            }
            TypeCode::Array if self.dict => self.marshal_dict(v, ia, ctx),
            TypeCode::Array => self.marshal_array(v, ia, ctx),
            TypeCode::Struct => self.marshal_struct(v, ia, ctx),
            TypeCode::DictEntry => Err(Error::new(ErrorKind::TypeMismatch,
                "dict entry outside dictionary".to_string())),
            TypeCode::Variant => self.marshal_variant(v, ia, ctx),
            _ => unreachable!(),
        }
    }

    /// Object-path arguments only transmit references the peer can resolve:
    /// proxies in the same scope go by path, local objects are exported,
    /// anything else cannot cross the wire.
    fn marshal_object_path(&self, v: &Value, ia: &mut IterAppend, ctx: &MarshalCtx)
        -> Result<(), Error>
    {
        let path = match v {
            Value::Remote(p) => {
                if ctx.scope.as_ref() == Some(&p.scope()) {
                    p.path_str().to_string()
                } else {
                    return Err(Error::new(ErrorKind::TypeMismatch,
                        format!("object reference {} is outside the receiver's scope", p.path_str())));
                }
            }
            Value::Object(o) => {
                let ep = ctx.endpoint.as_ref().ok_or_else(|| {
                    Error::new(ErrorKind::TypeMismatch,
                        format!("cannot export {} without an endpoint", o.class_name()))
                })?;
                ep.export_path_for(o)?
            }
            Value::ObjectPath(s) => s.clone(),
            _ => return Err(self.type_mismatch(v)),
        };
        ia.append_cstr(TypeCode::ObjectPath, &self.text_to_c(&path)?)
    }

    fn marshal_array(&self, v: &Value, ia: &mut IterAppend, ctx: &MarshalCtx) -> Result<(), Error> {
        let child = &self.children[0];
        let sig = to_c_str(&child.render());
        match v {
            Value::Bytes(b) if child.code == TypeCode::Byte => {
                ia.append_container(TypeCode::Array, Some(&sig), |s| s.append_fixed_bytes(b))
            }
            Value::Array(items) => {
                ia.append_container(TypeCode::Array, Some(&sig), |s| {
                    for item in items {
                        child.marshal(item, s, ctx)?;
                    }
                    Ok(())
                })
            }
            _ => Err(self.type_mismatch(v)),
        }
    }

    fn marshal_dict(&self, v: &Value, ia: &mut IterAppend, ctx: &MarshalCtx) -> Result<(), Error> {
        let entry = &self.children[0];
        let (key_arg, val_arg) = (&entry.children[0], &entry.children[1]);
        let sig = to_c_str(&entry.render());
        let pairs = match v {
            Value::Dict(pairs) => pairs,
            _ => return Err(self.type_mismatch(v)),
        };
        ia.append_container(TypeCode::Array, Some(&sig), |s| {
            for (k, val) in pairs {
                s.append_container(TypeCode::DictEntry, None, |ss| {
                    key_arg.marshal(k, ss, ctx)?;
                    val_arg.marshal(val, ss, ctx)
                })?;
            }
            Ok(())
        })
    }

    fn marshal_struct(&self, v: &Value, ia: &mut IterAppend, ctx: &MarshalCtx) -> Result<(), Error> {
        let vals = match v {
            Value::Struct(vals) => vals,
            Value::Array(vals) => vals,
            _ => return Err(self.type_mismatch(v)),
        };
        if vals.len() != self.children.len() {
            return Err(Error::new(ErrorKind::TypeMismatch,
                format!("struct '{}' takes {} members, got {}",
                    self.render(), self.children.len(), vals.len())));
        }
        ia.append_container(TypeCode::Struct, None, |s| {
            for (child, val) in self.children.iter().zip(vals) {
                child.marshal(val, s, ctx)?;
            }
            Ok(())
        })
    }

    fn marshal_variant(&self, v: &Value, ia: &mut IterAppend, ctx: &MarshalCtx) -> Result<(), Error> {
        let inner = match v {
            Value::Variant(b) => &**b,
            other => other,
        };
        let arg = Argument::infer_from_value(inner, ctx)?;
        let sig = to_c_str(&arg.render());
        ia.append_container(TypeCode::Variant, Some(&sig), |s| arg.marshal(inner, s, ctx))
    }

    // ---- unmarshal ----

    /// Unmarshals the value at the iterator's current position. Does not
    /// advance the iterator.
    pub fn unmarshal(&self, it: &mut Iter, ctx: &MarshalCtx) -> Result<Value, Error> {
        let wire = it.arg_type().ok_or_else(|| Error::new(ErrorKind::TypeMismatch,
            format!("message truncated; expected '{}'", self.render())))?;
        if wire != self.code {
            return Err(Error::new(ErrorKind::TypeMismatch,
                format!("wire holds {:?} where '{}' was expected", wire, self.render())));
        }
        match self.code {
            TypeCode::Double => {
                let slot = Slot::from_f64(it.get_f64().ok_or_else(|| self.wire_error())?);
                self.box_value(&slot, ctx)
            }
            TypeCode::String | TypeCode::ObjectPath | TypeCode::Signature => {
                let s = it.get_string(self.code).ok_or_else(|| self.wire_error())?;
                let slot = Slot::from_text(self.text_to_c(&s)?);
                self.box_value(&slot, ctx)
            }
            c if c.is_basic() => {
                let slot = Slot::from_i64(it.get_i64(c).ok_or_else(|| self.wire_error())?);
                self.box_value(&slot, ctx)
            }
            TypeCode::Array if self.dict => self.unmarshal_dict(it, ctx),
            TypeCode::Array if self.children[0].code == TypeCode::Byte => {
                Ok(Value::Bytes(it.get_byte_array().ok_or_else(|| self.wire_error())?))
            }
            TypeCode::Array => {
                let child = &self.children[0];
                let mut sub = it.recurse().ok_or_else(|| self.wire_error())?;
                let mut items = Vec::new();
                while sub.arg_type().is_some() {
                    items.push(child.unmarshal(&mut sub, ctx)?);
                    sub.next();
                }
                Ok(Value::Array(items))
            }
            TypeCode::Struct => {
                let mut sub = it.recurse().ok_or_else(|| self.wire_error())?;
                let mut vals = Vec::new();
                for child in &self.children {
                    vals.push(child.unmarshal(&mut sub, ctx)?);
                    sub.next();
                }
                Ok(Value::Struct(vals))
            }
            TypeCode::DictEntry => {
                let mut sub = it.recurse().ok_or_else(|| self.wire_error())?;
                let k = self.children[0].unmarshal(&mut sub, ctx)?;
                sub.next();
                let v = self.children[1].unmarshal(&mut sub, ctx)?;
                Ok(Value::Struct(vec![k, v]))
            }
            TypeCode::Variant => {
                // The element type comes from the wire; the inner value is
                // boxed directly, without a wrapper.
                let mut sub = it.recurse().ok_or_else(|| self.wire_error())?;
                let sig = sub.signature();
                let arg = Argument::from_signature(&sig)?;
                arg.unmarshal(&mut sub, ctx)
            }
            _ => unreachable!(),
        }
    }

    fn unmarshal_dict(&self, it: &mut Iter, ctx: &MarshalCtx) -> Result<Value, Error> {
        let entry = &self.children[0];
        let (key_arg, val_arg) = (&entry.children[0], &entry.children[1]);
        let mut sub = it.recurse().ok_or_else(|| self.wire_error())?;
        let mut pairs: Vec<(Value, Value)> = Vec::new();
        while sub.arg_type().is_some() {
            let mut e = sub.recurse().ok_or_else(|| self.wire_error())?;
            let k = key_arg.unmarshal(&mut e, ctx)?;
            e.next();
            let v = val_arg.unmarshal(&mut e, ctx)?;
            if pairs.iter().any(|(k0, _)| k0 == &k) {
                // First key wins; later duplicates are dropped, not raised.
                warn!("duplicate dictionary key {:?} dropped while unmarshalling '{}'",
                    k, self.render());
            } else {
                pairs.push((k, v));
            }
            sub.next();
        }
        Ok(Value::Dict(pairs))
    }

    fn wire_error(&self) -> Error {
        Error::new(ErrorKind::TypeMismatch,
            format!("wire value does not decode as '{}'", self.render()))
    }

    // ---- variant inference ----

    /// Picks the most specific wire type that represents `v`.
    ///
    /// Key/value collections become dictionaries (promoted to arrays of
    /// structs when the keys are not basic), sequences become arrays or
    /// structs, byte blobs become `ay`, in-scope proxies become object
    /// paths. Booleans are matched before the generic numeric mapping so
    /// they are never promoted to byte. When replying from an exported
    /// object, unknown local objects auto-export as object paths.
    pub fn infer_from_value(v: &Value, ctx: &MarshalCtx) -> Result<Argument, Error> {
        Ok(match v {
            Value::Variant(_) => Argument::new_basic(TypeCode::Variant),
            Value::Bool(_) => Argument::new_basic(TypeCode::Boolean),
            Value::Bytes(_) => Argument::from_signature("ay")?,
            Value::Str(_) => Argument::new_basic(TypeCode::String),
            Value::Signature(_) => Argument::new_basic(TypeCode::Signature),
            Value::ObjectPath(_) => Argument::new_basic(TypeCode::ObjectPath),
            Value::Fd(_) => Argument::new_basic(TypeCode::UnixFd),
            Value::Remote(p) => {
                if ctx.scope.as_ref() == Some(&p.scope()) {
                    Argument::new_basic(TypeCode::ObjectPath)
                } else {
                    return Err(Error::new(ErrorKind::TypeMismatch,
                        format!("object reference {} is outside the receiver's scope", p.path_str())));
                }
            }
            Value::Object(o) => {
                if ctx.local && ctx.endpoint.is_some() {
                    Argument::new_basic(TypeCode::ObjectPath)
                } else {
                    return Err(Error::new(ErrorKind::UnsupportedValue,
                        format!("cannot represent {} in a variant", o.class_name())));
                }
            }
            Value::Dict(pairs) => Argument::infer_dict(pairs, ctx)?,
            Value::Struct(vals) => {
                if vals.is_empty() {
                    return Err(Error::new(ErrorKind::UnsupportedValue,
                        "cannot represent an empty struct".to_string()));
                }
                let children = vals.iter()
                    .map(|e| Argument::infer_from_value(e, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                Argument::container(TypeCode::Struct, children)
            }
            Value::Array(items) => {
                if items.is_empty() {
                    Argument::from_signature("av")?
                } else {
                    let args = items.iter()
                        .map(|e| Argument::infer_from_value(e, ctx))
                        .collect::<Result<Vec<_>, _>>()?;
                    let first = args[0].render();
                    let elem = if args.iter().all(|a| a.render() == first) {
                        args.into_iter().next().unwrap()
                    } else {
                        Argument::new_basic(TypeCode::Variant)
                    };
                    Argument::container(TypeCode::Array, vec![elem])
                }
            }
            Value::Null => return Err(Error::new(ErrorKind::UnsupportedValue,
                "cannot infer a wire type for null".to_string())),
            other => {
                let kind = other.native_kind().ok_or_else(|| {
                    Error::new(ErrorKind::UnsupportedValue,
                        format!("cannot represent {} in a variant", other.type_name()))
                })?;
                Argument::new_basic(typebridge::dbus_code_for_host_kind(kind))
            }
        })
    }

    fn infer_dict(pairs: &[(Value, Value)], ctx: &MarshalCtx) -> Result<Argument, Error> {
        if pairs.is_empty() {
            return Argument::from_signature("a{sv}");
        }
        let keys = pairs.iter()
            .map(|(k, _)| Argument::infer_from_value(k, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let vals = pairs.iter()
            .map(|(_, v)| Argument::infer_from_value(v, ctx))
            .collect::<Result<Vec<_>, _>>()?;

        let key_sig = keys[0].render();
        let keys_homogeneous = keys.iter().all(|a| a.render() == key_sig);
        let val_sig = vals[0].render();
        let val_arg = if vals.iter().all(|a| a.render() == val_sig) {
            vals.into_iter().next().unwrap()
        } else {
            Argument::new_basic(TypeCode::Variant)
        };

        if keys_homogeneous && keys[0].code.is_basic() {
            let entry = Argument::container(TypeCode::DictEntry,
                vec![keys.into_iter().next().unwrap(), val_arg]);
            Ok(Argument::container(TypeCode::Array, vec![entry]))
        } else if keys_homogeneous {
            // Complex keys cannot head a dict entry; fall back to an array
            // of (key, value) structs.
            let entry = Argument::container(TypeCode::Struct,
                vec![keys.into_iter().next().unwrap(), val_arg]);
            Ok(Argument::container(TypeCode::Array, vec![entry]))
        } else {
            let entry = Argument::container(TypeCode::Struct,
                vec![Argument::new_basic(TypeCode::Variant), Argument::new_basic(TypeCode::Variant)]);
            Ok(Argument::container(TypeCode::Array, vec![entry]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn test_message() -> Message {
        Message::method_call(&"org.test.objbus".into(), &"/".into(),
            &"org.test.objbus".into(), &"Test".into())
    }

    fn round_trip(arg: &Argument, v: &Value) -> Value {
        let ctx = MarshalCtx::default();
        let mut m = test_message();
        {
            let mut ia = m.iter_append();
            arg.marshal(v, &mut ia, &ctx).unwrap();
        }
        let mut it = m.iter_init();
        arg.unmarshal(&mut it, &ctx).unwrap()
    }

    #[test]
    fn parse_render_round_trip() {
        for sig in ["y", "b", "n", "q", "i", "u", "x", "t", "d", "s", "o", "g", "h",
                    "v", "ai", "aay", "a{ss}", "a{sv}", "a{oa{sv}}", "(i)", "(iis)",
                    "(sa{sv}(i))", "a(ii)", "av"] {
            let arg = Argument::from_signature(sig).unwrap();
            assert_eq!(arg.render(), sig, "render mismatch for {}", sig);
        }
    }

    #[test]
    fn parse_rejects_malformed() {
        for sig in ["", "ii", "a", "a{vs}", "{ss}", "()", "(s", "a{ss}i", "z"] {
            assert!(Argument::from_signature(sig).is_err(), "{} should be rejected", sig);
        }
    }

    #[test]
    fn dict_recognition() {
        let arg = Argument::from_signature("a{sv}").unwrap();
        assert!(arg.is_dict());
        assert_eq!(arg.children()[0].code(), TypeCode::DictEntry);
        let arg = Argument::from_signature("as").unwrap();
        assert!(!arg.is_dict());
    }

    #[test]
    fn host_kind_mapping() {
        let a = Argument::from_host_kind(HostKind::Native(NativeKind::I32)).unwrap();
        assert_eq!(a.code(), TypeCode::Int32);
        let a = Argument::from_host_kind(HostKind::Native(NativeKind::Boxed)).unwrap();
        assert_eq!(a.code(), TypeCode::Variant);
        assert!(Argument::from_host_kind(HostKind::FnPointer).is_err());
        assert!(Argument::from_host_kind(HostKind::Union).is_err());
        assert!(Argument::from_host_kind(HostKind::Unknown).is_err());
    }

    #[test]
    fn unbox_widens_but_never_narrows() {
        let arg = Argument::new_basic(TypeCode::Int32);
        assert_eq!(arg.unbox(&Value::Byte(255)).unwrap().as_i64(), 255);
        assert_eq!(arg.unbox(&Value::Int16(-7)).unwrap().as_i64(), -7);
        assert!(arg.unbox(&Value::Int64(1)).is_err());
        assert!(arg.unbox(&Value::UInt32(1)).is_err());
        assert!(arg.unbox(&Value::Bool(true)).is_err());
        assert!(arg.unbox(&Value::Double(1.0)).is_err());

        let arg = Argument::new_basic(TypeCode::Int64);
        assert_eq!(arg.unbox(&Value::UInt32(u32::MAX)).unwrap().as_i64(), u32::MAX as i64);
        assert!(arg.unbox(&Value::UInt64(1)).is_err());
    }

    #[test]
    fn unbox_null_and_booleans() {
        assert_eq!(Argument::new_basic(TypeCode::Int32).unbox(&Value::Null).unwrap().as_i64(), 0);
        let s = Argument::new_basic(TypeCode::String).unbox(&Value::Null).unwrap();
        assert_eq!(s.text().unwrap().to_bytes(), b"");

        let b = Argument::new_basic(TypeCode::Boolean);
        assert_eq!(b.unbox(&Value::Bool(true)).unwrap().as_i64(), 1);
        assert_eq!(b.unbox(&Value::Byte(200)).unwrap().as_i64(), 1);
        assert_eq!(b.unbox(&Value::Int32(0)).unwrap().as_i64(), 0);
    }

    #[test]
    fn basic_boundary_round_trips() {
        let cases: Vec<(&str, Value)> = vec![
            ("y", Value::Byte(0)), ("y", Value::Byte(255)),
            ("b", Value::Bool(true)), ("b", Value::Bool(false)),
            ("n", Value::Int16(i16::MIN)), ("n", Value::Int16(i16::MAX)),
            ("q", Value::UInt16(0)), ("q", Value::UInt16(u16::MAX)),
            ("i", Value::Int32(i32::MIN)), ("i", Value::Int32(i32::MAX)),
            ("u", Value::UInt32(u32::MAX)),
            ("x", Value::Int64(i64::MIN)), ("x", Value::Int64(i64::MAX)),
            ("t", Value::UInt64(u64::MAX)),
            ("d", Value::Double(0.0)), ("d", Value::Double(-0.0)),
            ("d", Value::Double(f64::MIN_POSITIVE / 2.0)),
            ("d", Value::Double(f64::INFINITY)), ("d", Value::Double(f64::NEG_INFINITY)),
            ("s", Value::Str(String::new())),
            ("s", Value::Str("smörgåsbord 文字化け".to_string())),
            ("g", Value::Signature("a{sv}".to_string())),
            ("o", Value::ObjectPath("/a/b".to_string())),
        ];
        for (sig, v) in cases {
            let arg = Argument::from_signature(sig).unwrap();
            assert_eq!(round_trip(&arg, &v), v, "round trip failed for {} {:?}", sig, v);
        }
    }

    #[test]
    fn nan_survives_via_bits() {
        let arg = Argument::from_signature("d").unwrap();
        let out = round_trip(&arg, &Value::Double(f64::NAN));
        match out {
            Value::Double(d) => assert_eq!(d.to_bits(), f64::NAN.to_bits()),
            other => panic!("expected double, got {:?}", other),
        }
    }

    #[test]
    fn negative_widths_sign_extend() {
        let arg = Argument::from_signature("n").unwrap();
        assert_eq!(round_trip(&arg, &Value::Int16(-2)), Value::Int16(-2));
        let arg = Argument::from_signature("i").unwrap();
        assert_eq!(round_trip(&arg, &Value::Int32(-1)), Value::Int32(-1));
    }

    #[test]
    fn array_round_trips() {
        let arg = Argument::from_signature("ai").unwrap();
        assert_eq!(round_trip(&arg, &Value::Array(vec![])), Value::Array(vec![]));
        let one = Value::Array(vec![Value::Int32(42)]);
        assert_eq!(round_trip(&arg, &one), one);

        let arg = Argument::from_signature("as").unwrap();
        let v = Value::Array(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(round_trip(&arg, &v), v);
    }

    #[test]
    fn byte_blob_round_trips() {
        let arg = Argument::from_signature("ay").unwrap();
        let data: Vec<u8> = (0..=255u8).chain(0..44u8).collect();
        assert_eq!(data.len(), 300);
        let out = round_trip(&arg, &Value::Bytes(data.clone()));
        assert_eq!(out, Value::Bytes(data));

        // A sequence of byte values is accepted on the way in and
        // canonicalizes to a blob on the way out.
        let out = round_trip(&arg, &Value::Array(vec![Value::Byte(1), Value::Byte(2)]));
        assert_eq!(out, Value::Bytes(vec![1, 2]));

        assert_eq!(round_trip(&arg, &Value::Bytes(vec![])), Value::Bytes(vec![]));
    }

    #[test]
    fn struct_round_trips_and_arity() {
        let arg = Argument::from_signature("(isd)").unwrap();
        let v = Value::Struct(vec![Value::Int32(-5), Value::from("x"), Value::Double(2.5)]);
        assert_eq!(round_trip(&arg, &v), v);

        let ctx = MarshalCtx::default();
        let mut m = test_message();
        let mut ia = m.iter_append();
        let short = Value::Struct(vec![Value::Int32(1)]);
        let e = arg.marshal(&short, &mut ia, &ctx).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn dict_round_trips() {
        let arg = Argument::from_signature("a{si}").unwrap();
        let v = Value::Dict(vec![
            (Value::from("pencil"), Value::Int32(2)),
            (Value::from("paper"), Value::Int32(5)),
        ]);
        assert_eq!(round_trip(&arg, &v), v);
    }

    #[test]
    fn duplicate_dict_keys_first_wins() {
        let arg = Argument::from_signature("a{si}").unwrap();
        let dup = Value::Dict(vec![
            (Value::from("k"), Value::Int32(1)),
            (Value::from("k"), Value::Int32(2)),
            (Value::from("other"), Value::Int32(3)),
        ]);
        let out = round_trip(&arg, &dup);
        assert_eq!(out, Value::Dict(vec![
            (Value::from("k"), Value::Int32(1)),
            (Value::from("other"), Value::Int32(3)),
        ]));
    }

    #[test]
    fn variant_inference_specificity() {
        let ctx = MarshalCtx::default();
        assert_eq!(Argument::infer_from_value(&Value::Bool(true), &ctx).unwrap().render(), "b");
        assert_eq!(Argument::infer_from_value(&Value::Byte(1), &ctx).unwrap().render(), "y");
        assert_eq!(Argument::infer_from_value(&Value::from("x"), &ctx).unwrap().render(), "s");
        assert_eq!(Argument::infer_from_value(&Value::Bytes(vec![1]), &ctx).unwrap().render(), "ay");
        assert_eq!(Argument::infer_from_value(
            &Value::Array(vec![Value::Int32(1), Value::Int32(2)]), &ctx).unwrap().render(), "ai");
        assert_eq!(Argument::infer_from_value(
            &Value::Array(vec![Value::Int32(1), Value::from("s")]), &ctx).unwrap().render(), "av");
        assert_eq!(Argument::infer_from_value(
            &Value::Struct(vec![Value::Int32(1), Value::from("s")]), &ctx).unwrap().render(), "(is)");
        assert_eq!(Argument::infer_from_value(&Value::Array(vec![]), &ctx).unwrap().render(), "av");
        assert!(Argument::infer_from_value(&Value::Null, &ctx).is_err());
    }

    #[test]
    fn variant_inference_dicts() {
        let ctx = MarshalCtx::default();
        let homogeneous = Value::Dict(vec![
            (Value::from("a"), Value::Int32(1)),
            (Value::from("b"), Value::Int32(2)),
        ]);
        assert_eq!(Argument::infer_from_value(&homogeneous, &ctx).unwrap().render(), "a{si}");

        let heterogeneous = Value::Dict(vec![
            (Value::from("a"), Value::Int32(1)),
            (Value::from("b"), Value::Double(2.5)),
        ]);
        assert_eq!(Argument::infer_from_value(&heterogeneous, &ctx).unwrap().render(), "a{sv}");

        // Complex keys cannot head a dict entry: promoted to array-of-struct.
        let complex_keys = Value::Dict(vec![
            (Value::Struct(vec![Value::Int32(1)]), Value::from("one")),
        ]);
        assert_eq!(Argument::infer_from_value(&complex_keys, &ctx).unwrap().render(), "a((i)s)");

        let empty = Value::Dict(vec![]);
        assert_eq!(Argument::infer_from_value(&empty, &ctx).unwrap().render(), "a{sv}");
    }

    #[test]
    fn variant_round_trips() {
        let arg = Argument::from_signature("v").unwrap();
        for v in [
            Value::Int32(-3),
            Value::from("hello"),
            Value::Bool(true),
            Value::Bytes(vec![0, 1, 2]),
            Value::Dict(vec![
                (Value::from("a"), Value::Int32(1)),
                (Value::from("b"), Value::Double(2.5)),
            ]),
            Value::Struct(vec![Value::Int32(1), Value::from("s")]),
        ] {
            assert_eq!(round_trip(&arg, &v), v, "variant round trip failed for {:?}", v);
        }
    }

    #[test]
    fn variant_sentinel_nests() {
        // An explicit variant wrapper below the top level marshals as `v`.
        let ctx = MarshalCtx::default();
        let v = Value::Array(vec![
            Value::Variant(Box::new(Value::Int32(1))),
            Value::Variant(Box::new(Value::from("x"))),
        ]);
        assert_eq!(Argument::infer_from_value(&v, &ctx).unwrap().render(), "av");

        let arg = Argument::from_signature("v").unwrap();
        assert_eq!(round_trip(&arg, &v),
            Value::Array(vec![Value::Int32(1), Value::Str("x".to_string())]));
    }

    #[test]
    fn unboxing_accessor_registry() {
        use crate::value::{HostMethodDesc, HostObject};

        struct Epoch;
        impl HostObject for Epoch {
            fn class_name(&self) -> &str { "Epoch" }
            fn declared_methods(&self) -> Vec<HostMethodDesc> {
                vec![HostMethodDesc {
                    selector: "unix_timestamp".to_string(),
                    in_args: vec![],
                    out_args: vec!["x".to_string()],
                }]
            }
            fn invoke(&self, selector: &str, _args: &[Value]) -> Result<Value, Error> {
                match selector {
                    "unix_timestamp" => Ok(Value::Int64(1234567890)),
                    _ => Err(Error::new(ErrorKind::TypeMismatch, "unknown selector")),
                }
            }
        }

        let _g = registry::TEST_GUARD.lock().unwrap();
        registry::teardown();
        let obj: Arc<dyn HostObject> = Arc::new(Epoch);
        let arg = Argument::new_basic(TypeCode::Int64);
        assert!(arg.unbox(&Value::Object(obj.clone())).is_err());

        registry::init();
        registry::register_unboxing_selector("unix_timestamp", TypeCode::Int64).unwrap();
        assert_eq!(arg.unbox(&Value::Object(obj)).unwrap().as_i64(), 1234567890);
        registry::teardown();
    }

    #[test]
    fn mid_container_errors_keep_message_balanced() {
        // A failure halfway through an array closes the container; the
        // message stays structurally sound and writable.
        let ctx = MarshalCtx::default();
        let arg = Argument::from_signature("ai").unwrap();
        let bad = Value::Array(vec![Value::Int32(1), Value::from("oops")]);
        let mut m = test_message();
        {
            let mut ia = m.iter_append();
            assert!(arg.marshal(&bad, &mut ia, &ctx).is_err());
            ia.append_i64(TypeCode::Int32, 9).unwrap();
        }
        let mut it = m.iter_init();
        assert_eq!(it.arg_type(), Some(TypeCode::Array));
    }
}
