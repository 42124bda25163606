//! Method, signal and property nodes: the member shapes an interface holds,
//! and the glue turning host invocations into wire messages and back.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::argument::{Argument, MarshalCtx};
use crate::endpoint::Endpoint;
use crate::interface::make_snake;
use crate::message::{Iter, IterAppend, Message};
use crate::typebridge::TypeCode;
use crate::value::Value;
use crate::{Error, ErrorKind};

/// Annotation marking a method as oneway.
pub const NO_REPLY_ANNOTATION: &str = "org.freedesktop.DBus.Method.NoReply";
/// Annotation marking a member as deprecated.
pub const DEPRECATED_ANNOTATION: &str = "org.freedesktop.DBus.Deprecated";
/// Annotation overriding the derived canonical selector.
pub const SELECTOR_ANNOTATION: &str = "org.gnustep.objc.selector";

/// A captured host invocation: the dispatched selector, its positional
/// arguments, and the return slot.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// The selector the host dispatched.
    pub selector: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// The return slot; `None` until a reply (or the target) fills it.
    pub ret: Option<Value>,
}

impl Invocation {
    /// Captures an invocation of `selector` with the given arguments.
    pub fn new<S: Into<String>>(selector: S, args: Vec<Value>) -> Invocation {
        Invocation { selector: selector.into(), args, ret: None }
    }
}

/// How a synthesized property accessor forwards to
/// `org.freedesktop.DBus.Properties`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyRole {
    /// A getter for the named property on the named interface.
    Get {
        /// Interface declaring the property.
        interface: String,
        /// Property name.
        property: String,
    },
    /// A setter for the named property on the named interface.
    Set {
        /// Interface declaring the property.
        interface: String,
        /// Property name.
        property: String,
    },
}

/// Ordered in/out argument vectors for one interface member.
#[derive(Debug, Clone)]
pub struct Method {
    name: String,
    interface_name: String,
    in_args: Vec<Argument>,
    out_args: Vec<Argument>,
    annotations: BTreeMap<String, String>,
    property: Option<PropertyRole>,
}

impl Method {
    /// Creates a method node.
    pub fn new<N: Into<String>, I: Into<String>>(name: N, interface_name: I,
        in_args: Vec<Argument>, out_args: Vec<Argument>) -> Method
    {
        Method {
            name: name.into(),
            interface_name: interface_name.into(),
            in_args,
            out_args,
            annotations: BTreeMap::new(),
            property: None,
        }
    }

    /// The member name.
    pub fn name(&self) -> &str { &self.name }

    /// The interface the member belongs to.
    pub fn interface_name(&self) -> &str { &self.interface_name }

    /// Input arguments, in order.
    pub fn in_args(&self) -> &[Argument] { &self.in_args }

    /// Output arguments, in order.
    pub fn out_args(&self) -> &[Argument] { &self.out_args }

    /// The member's annotations.
    pub fn annotations(&self) -> &BTreeMap<String, String> { &self.annotations }

    /// Attaches an annotation.
    pub fn set_annotation<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.annotations.insert(key.into(), value.into());
    }

    /// The selector override from the `org.gnustep.objc.selector`
    /// annotation, if any.
    pub fn selector_override(&self) -> Option<&str> {
        self.annotations.get(SELECTOR_ANNOTATION).map(|s| s.as_str())
    }

    /// Whether the method expects no reply.
    pub fn is_oneway(&self) -> bool {
        self.annotations.get(NO_REPLY_ANNOTATION).map(|v| v == "true").unwrap_or(false)
    }

    /// Whether the method is marked deprecated.
    pub fn is_deprecated(&self) -> bool {
        self.annotations.get(DEPRECATED_ANNOTATION).map(|v| v == "true").unwrap_or(false)
    }

    /// The property this accessor was synthesized for, if any.
    pub fn property_role(&self) -> Option<&PropertyRole> { self.property.as_ref() }

    /// Builds the host method signature string.
    ///
    /// The return position reflects the out-argument count: zero arguments
    /// make a void method, one argument uses that argument's type, several
    /// collapse into the host sequence class.
    pub fn signature(&self, boxed: bool) -> String {
        let ins: Vec<String> = self.in_args.iter()
            .map(|a| if boxed { "objbus::Value".to_string() } else { rust_type(a, false) })
            .collect();
        let ret = match self.out_args.len() {
            0 => "()".to_string(),
            1 => if boxed { "objbus::Value".to_string() } else { rust_type(&self.out_args[0], true) },
            _ => "Vec<objbus::Value>".to_string(),
        };
        format!("fn({}) -> {}", ins.join(", "), ret)
    }

    /// Marshals the invocation's arguments positionally.
    pub fn marshal_arguments(&self, inv: &Invocation, ia: &mut IterAppend, ctx: &MarshalCtx)
        -> Result<(), Error>
    {
        if inv.args.len() != self.in_args.len() {
            return Err(Error::new(ErrorKind::TypeMismatch,
                format!("{}.{} takes {} arguments, invocation has {}",
                    self.interface_name, self.name, self.in_args.len(), inv.args.len())));
        }
        for (arg, v) in self.in_args.iter().zip(&inv.args) {
            arg.marshal(v, ia, ctx)?;
        }
        Ok(())
    }

    /// Marshals the invocation's return value. With several out-arguments
    /// the return value must be an ordered sequence of matching length.
    pub fn marshal_return(&self, inv: &Invocation, ia: &mut IterAppend, ctx: &MarshalCtx)
        -> Result<(), Error>
    {
        let ret = inv.ret.as_ref().unwrap_or(&Value::Null);
        match self.out_args.len() {
            0 => Ok(()),
            1 => self.out_args[0].marshal(ret, ia, ctx),
            n => {
                let vals = match ret {
                    Value::Array(v) => v,
                    Value::Struct(v) => v,
                    _ => return Err(Error::new(ErrorKind::TypeMismatch,
                        format!("{}.{} returns {} values, got {}",
                            self.interface_name, self.name, n, ret.type_name()))),
                };
                if vals.len() != n {
                    return Err(Error::new(ErrorKind::TypeMismatch,
                        format!("{}.{} returns {} values, sequence has {}",
                            self.interface_name, self.name, n, vals.len())));
                }
                for (arg, v) in self.out_args.iter().zip(vals) {
                    arg.marshal(v, ia, ctx)?;
                }
                Ok(())
            }
        }
    }

    /// Unmarshals the wire arguments into the invocation, advancing the
    /// iterator between arguments. A too-short payload fails.
    pub fn unmarshal_arguments(&self, it: &mut Iter, inv: &mut Invocation, ctx: &MarshalCtx)
        -> Result<(), Error>
    {
        for arg in &self.in_args {
            inv.args.push(arg.unmarshal(it, ctx)?);
            it.next();
        }
        Ok(())
    }

    /// Unmarshals the reply into the invocation's return slot. A void method
    /// stores the explicit null sentinel; multi-valued returns become a
    /// sequence of boxed values.
    pub fn unmarshal_return(&self, it: &mut Iter, inv: &mut Invocation, ctx: &MarshalCtx)
        -> Result<(), Error>
    {
        inv.ret = Some(match self.out_args.len() {
            0 => Value::Null,
            1 => self.out_args[0].unmarshal(it, ctx)?,
            _ => {
                let mut vals = Vec::with_capacity(self.out_args.len());
                for arg in &self.out_args {
                    vals.push(arg.unmarshal(it, ctx)?);
                    it.next();
                }
                Value::Array(vals)
            }
        });
        Ok(())
    }

    /// Renders a Rust trait-method declaration for this member, the unit of
    /// output of the protocol-generator tool.
    pub fn host_declaration(&self) -> String {
        let selector = self.selector_override().map(|s| s.to_string())
            .unwrap_or_else(|| make_snake(&self.name));
        let mut s = format!("    fn {}(&self", selector);
        for (idx, a) in self.in_args.iter().enumerate() {
            s.push_str(&format!(", {}: {}", var_name(a, idx), rust_type(a, false)));
        }
        match self.out_args.len() {
            0 => s.push_str(") -> Result<(), objbus::Error>"),
            1 => s.push_str(&format!(") -> Result<{}, objbus::Error>", rust_type(&self.out_args[0], true))),
            _ => {
                let outs: Vec<String> = self.out_args.iter().map(|a| rust_type(a, true)).collect();
                s.push_str(&format!(") -> Result<({}), objbus::Error>", outs.join(", ")));
            }
        }
        s.push(';');
        s
    }

    /// Renders the introspection XML element for this method.
    pub fn to_xml(&self, indent: usize) -> String {
        let pad = " ".repeat(indent);
        let mut s = format!("{}<method name=\"{}\">\n", pad, self.name);
        for a in &self.in_args {
            s.push_str(&a.to_xml(Some("in"), indent + 2));
        }
        for a in &self.out_args {
            s.push_str(&a.to_xml(Some("out"), indent + 2));
        }
        for (k, v) in &self.annotations {
            s.push_str(&format!("{}  <annotation name=\"{}\" value=\"{}\"/>\n", pad, k, v));
        }
        s.push_str(&format!("{}</method>\n", pad));
        s
    }
}

/// A signal node. All arguments are out-direction by construction.
#[derive(Debug, Clone)]
pub struct Signal {
    name: String,
    interface_name: String,
    args: Vec<Argument>,
    annotations: BTreeMap<String, String>,
}

impl Signal {
    /// Creates a signal node.
    pub fn new<N: Into<String>, I: Into<String>>(name: N, interface_name: I,
        args: Vec<Argument>) -> Signal
    {
        Signal { name: name.into(), interface_name: interface_name.into(),
            args, annotations: BTreeMap::new() }
    }

    /// The signal name.
    pub fn name(&self) -> &str { &self.name }

    /// The interface the signal belongs to.
    pub fn interface_name(&self) -> &str { &self.interface_name }

    /// The signal's arguments.
    pub fn args(&self) -> &[Argument] { &self.args }

    /// Attaches an annotation.
    pub fn set_annotation<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Emits this signal from `path` with the given argument values.
    pub fn emit(&self, endpoint: &Arc<Endpoint>, path: &crate::ObjectPath, values: &[Value])
        -> Result<(), Error>
    {
        if values.len() != self.args.len() {
            return Err(Error::new(ErrorKind::TypeMismatch,
                format!("signal {}.{} takes {} arguments, got {}",
                    self.interface_name, self.name, self.args.len(), values.len())));
        }
        let mut msg = Message::signal(path, &self.interface_name.as_str().into(),
            &self.name.as_str().into());
        {
            let mut ia = msg.iter_append();
            let ctx = MarshalCtx::for_export(endpoint.clone(), None);
            for (arg, v) in self.args.iter().zip(values) {
                arg.marshal(v, &mut ia, &ctx)?;
            }
        }
        endpoint.send(msg)?;
        Ok(())
    }

    /// Renders the introspection XML element for this signal.
    pub fn to_xml(&self, indent: usize) -> String {
        let pad = " ".repeat(indent);
        let mut s = format!("{}<signal name=\"{}\">\n", pad, self.name);
        for a in &self.args {
            s.push_str(&a.to_xml(None, indent + 2));
        }
        s.push_str(&format!("{}</signal>\n", pad));
        s
    }
}

/// The access characteristics of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The property can only be read.
    Read,
    /// The property can only be written.
    Write,
    /// The property can be read and written.
    ReadWrite,
}

impl Access {
    /// Parses the introspection `access` attribute.
    pub fn from_attr(s: &str) -> Option<Access> {
        match s {
            "read" => Some(Access::Read),
            "write" => Some(Access::Write),
            "readwrite" => Some(Access::ReadWrite),
            _ => None,
        }
    }

    fn as_attr(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        }
    }
}

/// A property node, exposing synthesized accessor methods that forward to
/// `org.freedesktop.DBus.Properties`.
#[derive(Debug, Clone)]
pub struct Property {
    name: String,
    interface_name: String,
    ty: Argument,
    access: Access,
}

impl Property {
    /// Creates a property node.
    pub fn new<N: Into<String>, I: Into<String>>(name: N, interface_name: I,
        ty: Argument, access: Access) -> Property
    {
        Property { name: name.into(), interface_name: interface_name.into(), ty, access }
    }

    /// The property name.
    pub fn name(&self) -> &str { &self.name }

    /// The interface declaring the property.
    pub fn interface_name(&self) -> &str { &self.interface_name }

    /// The property's type.
    pub fn ty(&self) -> &Argument { &self.ty }

    /// The property's access mode.
    pub fn access(&self) -> Access { self.access }

    /// The synthesized getter, forwarding to `Properties.Get`. `None` for
    /// write-only properties.
    pub fn getter(&self) -> Option<Method> {
        if self.access == Access::Write { return None; }
        let mut m = Method::new("Get", "org.freedesktop.DBus.Properties",
            vec![
                Argument::new_basic(TypeCode::String).with_name("interface_name"),
                Argument::new_basic(TypeCode::String).with_name("property_name"),
            ],
            vec![Argument::new_basic(TypeCode::Variant).with_name("value")]);
        m.property = Some(PropertyRole::Get {
            interface: self.interface_name.clone(),
            property: self.name.clone(),
        });
        Some(m)
    }

    /// The synthesized setter, forwarding to `Properties.Set`. `None` for
    /// read-only properties.
    pub fn setter(&self) -> Option<Method> {
        if self.access == Access::Read { return None; }
        let mut m = Method::new("Set", "org.freedesktop.DBus.Properties",
            vec![
                Argument::new_basic(TypeCode::String).with_name("interface_name"),
                Argument::new_basic(TypeCode::String).with_name("property_name"),
                Argument::new_basic(TypeCode::Variant).with_name("value"),
            ],
            vec![]);
        m.property = Some(PropertyRole::Set {
            interface: self.interface_name.clone(),
            property: self.name.clone(),
        });
        Some(m)
    }

    /// Renders the introspection XML element for this property.
    pub fn to_xml(&self, indent: usize) -> String {
        let pad = " ".repeat(indent);
        format!("{}<property name=\"{}\" type=\"{}\" access=\"{}\"/>\n",
            pad, self.name, self.ty.render(), self.access.as_attr())
    }
}

fn var_name(a: &Argument, idx: usize) -> String {
    match a.name() {
        Some(n) => make_snake(n),
        None => format!("arg{}", idx),
    }
}

/// Maps an argument onto the Rust type the generated facade uses for it.
pub(crate) fn rust_type(a: &Argument, out: bool) -> String {
    match a.code() {
        TypeCode::Byte => "u8".into(),
        TypeCode::Boolean => "bool".into(),
        TypeCode::Int16 => "i16".into(),
        TypeCode::UInt16 => "u16".into(),
        TypeCode::Int32 => "i32".into(),
        TypeCode::UInt32 => "u32".into(),
        TypeCode::Int64 => "i64".into(),
        TypeCode::UInt64 => "u64".into(),
        TypeCode::Double => "f64".into(),
        TypeCode::String => if out { "String".into() } else { "&str".into() },
        TypeCode::ObjectPath => "objbus::ObjectPath".into(),
        TypeCode::Signature => "String".into(),
        TypeCode::UnixFd => "i32".into(),
        TypeCode::Variant => "objbus::Value".into(),
        TypeCode::Array if a.is_dict() => {
            let entry = &a.children()[0];
            format!("::std::collections::HashMap<{}, {}>",
                rust_type(&entry.children()[0], true), rust_type(&entry.children()[1], true))
        }
        TypeCode::Array if a.children()[0].code() == TypeCode::Byte => "Vec<u8>".into(),
        TypeCode::Array => format!("Vec<{}>", rust_type(&a.children()[0], true)),
        TypeCode::Struct => {
            let inner: Vec<String> = a.children().iter().map(|c| rust_type(c, true)).collect();
            format!("({})", inner.join(", "))
        }
        TypeCode::DictEntry => {
            format!("({}, {})",
                rust_type(&a.children()[0], true), rust_type(&a.children()[1], true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn ping() -> Method {
        Method::new("Ping", "com.example.Echo",
            vec![Argument::from_signature("s").unwrap().with_name("message")],
            vec![Argument::from_signature("s").unwrap()])
    }

    fn test_message() -> Message {
        Message::method_call(&"org.test.objbus".into(), &"/".into(),
            &"org.test.objbus".into(), &"Test".into())
    }

    #[test]
    fn return_positions() {
        let void = Method::new("Notify", "com.example.Echo", vec![], vec![]);
        assert_eq!(void.signature(false), "fn() -> ()");
        assert_eq!(void.signature(true), "fn() -> ()");

        assert_eq!(ping().signature(false), "fn(&str) -> String");
        assert_eq!(ping().signature(true), "fn(objbus::Value) -> objbus::Value");

        let multi = Method::new("Stat", "com.example.Echo", vec![],
            vec![Argument::from_signature("u").unwrap(), Argument::from_signature("s").unwrap()]);
        assert_eq!(multi.signature(false), "fn() -> Vec<objbus::Value>");
    }

    #[test]
    fn oneway_and_deprecated() {
        let mut m = ping();
        assert!(!m.is_oneway());
        assert!(!m.is_deprecated());
        m.set_annotation(NO_REPLY_ANNOTATION, "true");
        m.set_annotation(DEPRECATED_ANNOTATION, "true");
        assert!(m.is_oneway());
        assert!(m.is_deprecated());
    }

    #[test]
    fn argument_round_trip_through_invocation() {
        let m = ping();
        let ctx = MarshalCtx::default();
        let inv = Invocation::new("ping", vec![Value::from("hello")]);

        let mut msg = test_message();
        {
            let mut ia = msg.iter_append();
            m.marshal_arguments(&inv, &mut ia, &ctx).unwrap();
        }
        let mut back = Invocation::new("ping", vec![]);
        m.unmarshal_arguments(&mut msg.iter_init(), &mut back, &ctx).unwrap();
        assert_eq!(back.args, vec![Value::from("hello")]);
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let m = ping();
        let ctx = MarshalCtx::default();
        let inv = Invocation::new("ping", vec![]);
        let mut msg = test_message();
        let mut ia = msg.iter_append();
        let e = m.marshal_arguments(&inv, &mut ia, &ctx).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let m = Method::new("Two", "com.example.Echo",
            vec![Argument::from_signature("s").unwrap(), Argument::from_signature("i").unwrap()],
            vec![]);
        let ctx = MarshalCtx::default();
        let mut msg = test_message();
        {
            let mut ia = msg.iter_append();
            Argument::from_signature("s").unwrap()
                .marshal(&Value::from("only one"), &mut ia, &ctx).unwrap();
        }
        let mut inv = Invocation::default();
        let e = m.unmarshal_arguments(&mut msg.iter_init(), &mut inv, &ctx).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn return_marshalling() {
        let ctx = MarshalCtx::default();
        let multi = Method::new("Stat", "com.example.Echo", vec![],
            vec![Argument::from_signature("u").unwrap(), Argument::from_signature("s").unwrap()]);

        let mut inv = Invocation::default();
        inv.ret = Some(Value::Array(vec![Value::UInt32(9), Value::from("ok")]));
        let mut msg = test_message();
        {
            let mut ia = msg.iter_append();
            multi.marshal_return(&inv, &mut ia, &ctx).unwrap();
        }
        let mut back = Invocation::default();
        multi.unmarshal_return(&mut msg.iter_init(), &mut back, &ctx).unwrap();
        assert_eq!(back.ret, Some(Value::Array(vec![Value::UInt32(9), Value::from("ok")])));

        // Void methods yield the explicit null sentinel.
        let void = Method::new("Notify", "com.example.Echo", vec![], vec![]);
        let msg = test_message();
        let mut back = Invocation::default();
        void.unmarshal_return(&mut msg.iter_init(), &mut back, &ctx).unwrap();
        assert_eq!(back.ret, Some(Value::Null));
    }

    #[test]
    fn declarations() {
        let mut m = Method::new("SetFooWithBar", "com.example.Echo",
            vec![
                Argument::from_signature("s").unwrap().with_name("foo"),
                Argument::from_signature("i").unwrap().with_name("bar"),
            ],
            vec![]);
        assert_eq!(m.host_declaration(),
            "    fn set_foo_with_bar(&self, foo: &str, bar: i32) -> Result<(), objbus::Error>;");

        m.set_annotation(SELECTOR_ANNOTATION, "reconfigure");
        assert_eq!(m.host_declaration(),
            "    fn reconfigure(&self, foo: &str, bar: i32) -> Result<(), objbus::Error>;");

        let dict = Method::new("GetAll", "com.example.Echo",
            vec![Argument::from_signature("s").unwrap()],
            vec![Argument::from_signature("a{sv}").unwrap()]);
        assert_eq!(dict.host_declaration(),
            "    fn get_all(&self, arg0: &str) -> Result<::std::collections::HashMap<String, objbus::Value>, objbus::Error>;");
    }

    #[test]
    fn property_accessors() {
        let p = Property::new("Volume", "com.example.Player",
            Argument::from_signature("d").unwrap(), Access::ReadWrite);
        let g = p.getter().unwrap();
        assert_eq!(g.name(), "Get");
        assert_eq!(g.interface_name(), "org.freedesktop.DBus.Properties");
        assert_eq!(g.property_role(), Some(&PropertyRole::Get {
            interface: "com.example.Player".to_string(),
            property: "Volume".to_string(),
        }));
        let s = p.setter().unwrap();
        assert_eq!(s.in_args().len(), 3);

        let ro = Property::new("Version", "com.example.Player",
            Argument::from_signature("s").unwrap(), Access::Read);
        assert!(ro.getter().is_some());
        assert!(ro.setter().is_none());
    }

    #[test]
    fn xml_rendering() {
        let m = ping();
        let xml = m.to_xml(2);
        assert!(xml.contains("<method name=\"Ping\">"));
        assert!(xml.contains("direction=\"in\""));
        assert!(xml.contains("direction=\"out\""));

        let p = Property::new("Volume", "com.example.Player",
            Argument::from_signature("d").unwrap(), Access::Read);
        assert!(p.to_xml(0).contains("access=\"read\""));
    }
}
