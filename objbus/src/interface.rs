//! Interfaces: named bags of methods, signals and properties, plus the
//! selector dispatch table proxies resolve host messages against.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::method::{Access, Method, Property, Signal};
use crate::value::{HostMethodDesc, HostObject, ProtocolDesc};
use crate::{Error, ErrorKind};

/// Annotation declaring the host protocol name of an interface.
pub const PROTOCOL_ANNOTATION: &str = "org.gnustep.objc.protocol";

/// Interface-name prefix for interfaces reflected from host classes.
pub const CLASS_INTERFACE_PREFIX: &str = "org.gnustep.objc.class.";
/// Interface-name prefix for interfaces reflected from host protocols.
pub const PROTOCOL_INTERFACE_PREFIX: &str = "org.gnustep.objc.protocol.";

/// Derives the canonical host selector from a D-Bus member name.
///
/// The member name converts to snake case; a character that follows a word
/// boundary but is not an ASCII letter is kept as-is, so `Get2ndItem`
/// becomes `get2nd_item`. The rule is stable across rebuilds.
pub fn make_snake(s: &str) -> String {
    let mut lcase = false;
    let mut r = String::new();
    for c in s.chars() {
        match c {
            'a'..='z' | '0'..='9' => {
                r.push(c);
                lcase = true;
            }
            'A'..='Z' => {
                if lcase { r.push('_'); }
                lcase = false;
                r.push(c.to_ascii_lowercase());
            }
            _ => { lcase = true; }
        }
    }
    r
}

/// Turns a dotted or snake-cased name into CamelCase, for trait names and
/// reflected member names.
pub fn make_camel(s: &str) -> String {
    let mut ucase = true;
    s.chars().filter_map(|c| match c {
        'a'..='z' | 'A'..='Z' | '0'..='9' => {
            let cc = if ucase { c.to_uppercase().next() } else { Some(c) };
            ucase = false;
            cc
        }
        _ => { ucase = true; None }
    }).collect()
}

/// A named bag of methods, signals and properties with a selector dispatch
/// table.
///
/// Every method reachable through the dispatch table is also present in the
/// method map; installing a method adds it to the interface first when
/// needed.
#[derive(Debug, Clone, Default)]
pub struct Interface {
    name: String,
    methods: BTreeMap<String, Arc<Method>>,
    signals: BTreeMap<String, Arc<Signal>>,
    properties: BTreeMap<String, Arc<Property>>,
    dispatch: BTreeMap<String, Arc<Method>>,
    annotations: BTreeMap<String, String>,
}

impl Interface {
    /// Creates an empty interface with the given name.
    pub fn new<S: Into<String>>(name: S) -> Interface {
        Interface { name: name.into(), ..Default::default() }
    }

    /// The interface name.
    pub fn name(&self) -> &str { &self.name }

    /// The interface's methods, keyed by member name.
    pub fn methods(&self) -> &BTreeMap<String, Arc<Method>> { &self.methods }

    /// The interface's signals, keyed by member name.
    pub fn signals(&self) -> &BTreeMap<String, Arc<Signal>> { &self.signals }

    /// The interface's properties, keyed by name.
    pub fn properties(&self) -> &BTreeMap<String, Arc<Property>> { &self.properties }

    /// The installed selectors, in table order.
    pub fn selectors(&self) -> impl Iterator<Item = &str> {
        self.dispatch.keys().map(|s| s.as_str())
    }

    /// Attaches an annotation to the interface.
    pub fn set_annotation<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Adds a method, keyed by member name. A duplicate add overwrites: the
    /// introspection loader supplies canonical data, so the last writer
    /// wins.
    pub fn add_method(&mut self, method: Method) {
        self.methods.insert(method.name().to_string(), Arc::new(method));
    }

    /// Adds a signal, keyed by member name. Last writer wins.
    pub fn add_signal(&mut self, signal: Signal) {
        self.signals.insert(signal.name().to_string(), Arc::new(signal));
    }

    /// Adds a property, keyed by name. Last writer wins.
    pub fn add_property(&mut self, property: Property) {
        self.properties.insert(property.name().to_string(), Arc::new(property));
    }

    /// Installs a method under the given selector. Idempotent; several
    /// selectors may map to the same method. The method joins the interface
    /// if it is not already a member.
    pub fn install_method(&mut self, method: Arc<Method>, selector: &str) {
        self.methods.entry(method.name().to_string()).or_insert_with(|| method.clone());
        self.dispatch.insert(selector.to_string(), method);
    }

    /// Installs every method under its canonical selector (or its
    /// `org.gnustep.objc.selector` override).
    pub fn install_methods(&mut self) {
        let entries: Vec<(String, Arc<Method>)> = self.methods.values()
            .filter(|m| m.property_role().is_none())
            .map(|m| {
                let selector = m.selector_override().map(|s| s.to_string())
                    .unwrap_or_else(|| make_snake(m.name()));
                (selector, m.clone())
            })
            .collect();
        for (selector, m) in entries {
            self.dispatch.insert(selector, m);
        }
    }

    /// Installs accessor and mutator selectors for every property, skipping
    /// selectors that already dispatch to a method.
    pub fn install_properties(&mut self) {
        let props: Vec<Arc<Property>> = self.properties.values().cloned().collect();
        for p in props {
            if let Some(getter) = p.getter() {
                let selector = make_snake(p.name());
                if !self.dispatch.contains_key(&selector) {
                    self.install_method(Arc::new(getter), &selector);
                }
            }
            if let Some(setter) = p.setter() {
                let selector = format!("set_{}", make_snake(p.name()));
                if !self.dispatch.contains_key(&selector) {
                    self.install_method(Arc::new(setter), &selector);
                }
            }
        }
    }

    /// Looks the selector up in the dispatch table.
    pub fn method_for_selector(&self, selector: &str) -> Option<Arc<Method>> {
        self.dispatch.get(selector).cloned()
    }

    /// Reflects a host object's declared methods into an interface named
    /// after its class.
    pub fn from_host_object(obj: &dyn HostObject) -> Result<Interface, Error> {
        Interface::from_descs(
            format!("{}{}", CLASS_INTERFACE_PREFIX, obj.class_name()),
            &obj.declared_methods())
    }

    /// Reflects a host protocol description into an interface named after
    /// the protocol.
    pub fn from_host_protocol(proto: &ProtocolDesc) -> Result<Interface, Error> {
        let mut i = Interface::from_descs(
            format!("{}{}", PROTOCOL_INTERFACE_PREFIX, proto.name), &proto.methods)?;
        i.set_annotation(PROTOCOL_ANNOTATION, proto.name.clone());
        Ok(i)
    }

    fn from_descs(name: String, descs: &[HostMethodDesc]) -> Result<Interface, Error> {
        let mut iface = Interface::new(name.clone());
        for desc in descs {
            let member = make_camel(&desc.selector);
            if member.is_empty() {
                return Err(Error::new(ErrorKind::TypeMismatch,
                    format!("selector '{}' yields no member name", desc.selector)));
            }
            let mut in_args = Vec::new();
            for (argname, sig) in &desc.in_args {
                let mut a = crate::argument::Argument::from_signature(sig)?;
                if let Some(n) = argname {
                    a = a.with_name(n.clone());
                }
                in_args.push(a);
            }
            let mut out_args = Vec::new();
            for sig in &desc.out_args {
                out_args.push(crate::argument::Argument::from_signature(sig)?);
            }
            let mut m = Method::new(member, name.clone(), in_args, out_args);
            // The reflected selector is authoritative; record it so the
            // derivation cannot drift from the host's own name.
            m.set_annotation(crate::method::SELECTOR_ANNOTATION, desc.selector.clone());
            iface.add_method(m);
        }
        iface.install_methods();
        Ok(iface)
    }

    /// The host protocol name of the interface: the annotation override if
    /// present, the interface name with dots replaced by underscores
    /// otherwise.
    pub fn protocol_name(&self) -> String {
        self.annotations.get(PROTOCOL_ANNOTATION).cloned()
            .unwrap_or_else(|| self.name.replace('.', "_"))
    }

    /// Renders the interface as a Rust trait declaration, the output unit of
    /// the protocol-generator tool.
    pub fn protocol_declaration(&self) -> String {
        let mut s = format!("pub trait {} {{\n", make_camel(&self.name));
        for m in self.methods.values() {
            if m.property_role().is_some() { continue; }
            s.push_str(&m.host_declaration());
            s.push('\n');
        }
        for p in self.properties.values() {
            let ty_out = crate::method::rust_type(p.ty(), true);
            if p.access() != Access::Write {
                s.push_str(&format!("    fn {}(&self) -> Result<{}, objbus::Error>;\n",
                    make_snake(p.name()), ty_out));
            }
            if p.access() != Access::Read {
                s.push_str(&format!("    fn set_{}(&self, value: {}) -> Result<(), objbus::Error>;\n",
                    make_snake(p.name()), ty_out));
            }
        }
        s.push_str("}\n");
        s
    }

    /// Renders the introspection XML element for this interface.
    pub fn to_xml(&self, indent: usize) -> String {
        let pad = " ".repeat(indent);
        let mut s = format!("{}<interface name=\"{}\">\n", pad, self.name);
        for m in self.methods.values() {
            if m.property_role().is_some() { continue; }
            s.push_str(&m.to_xml(indent + 2));
        }
        for sig in self.signals.values() {
            s.push_str(&sig.to_xml(indent + 2));
        }
        for p in self.properties.values() {
            s.push_str(&p.to_xml(indent + 2));
        }
        for (k, v) in &self.annotations {
            s.push_str(&format!("{}  <annotation name=\"{}\" value=\"{}\"/>\n", pad, k, v));
        }
        s.push_str(&format!("{}</interface>\n", pad));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::Argument;
    use crate::value::Value;

    #[test]
    fn snake_and_camel() {
        assert_eq!(make_snake("SetFooWithBar"), "set_foo_with_bar");
        assert_eq!(make_snake("Ping"), "ping");
        assert_eq!(make_snake("GetAll"), "get_all");
        assert_eq!(make_snake("Get2ndItem"), "get2nd_item");
        assert_eq!(make_snake("IOError"), "ioerror");
        assert_eq!(make_camel("org.freedesktop.DBus.Properties"), "OrgFreedesktopDBusProperties");
        assert_eq!(make_camel("set_foo_with_bar"), "SetFooWithBar");
    }

    fn sample_interface() -> Interface {
        let mut i = Interface::new("com.example.Echo");
        i.add_method(Method::new("SetFooWithBar", "com.example.Echo",
            vec![
                Argument::from_signature("s").unwrap().with_name("foo"),
                Argument::from_signature("i").unwrap().with_name("bar"),
            ],
            vec![]));
        i.add_method(Method::new("Ping", "com.example.Echo",
            vec![Argument::from_signature("s").unwrap().with_name("message")],
            vec![Argument::from_signature("s").unwrap()]));
        i
    }

    #[test]
    fn canonical_selector_dispatch() {
        let mut i = sample_interface();
        i.install_methods();
        let m = i.method_for_selector("set_foo_with_bar").unwrap();
        assert_eq!(m.name(), "SetFooWithBar");
        assert!(i.method_for_selector("ping").is_some());
        assert!(i.method_for_selector("Ping").is_none());
    }

    #[test]
    fn selector_override_wins() {
        let mut i = sample_interface();
        let mut m = Method::new("Ping", "com.example.Echo",
            vec![Argument::from_signature("s").unwrap()],
            vec![Argument::from_signature("s").unwrap()]);
        m.set_annotation(crate::method::SELECTOR_ANNOTATION, "echo_back");
        i.add_method(m);
        i.install_methods();
        assert!(i.method_for_selector("echo_back").is_some());
        assert!(i.method_for_selector("ping").is_none());
    }

    #[test]
    fn dispatch_methods_are_members() {
        let mut i = sample_interface();
        i.install_methods();
        let extra = Arc::new(Method::new("Hidden", "com.example.Echo", vec![], vec![]));
        i.install_method(extra, "sneaky");
        for sel in i.selectors().map(|s| s.to_string()).collect::<Vec<_>>() {
            let m = i.method_for_selector(&sel).unwrap();
            assert!(i.methods().contains_key(m.name()),
                "selector {} reaches a method outside the interface", sel);
        }
    }

    #[test]
    fn selector_derivation_matches_dispatch() {
        let mut i = sample_interface();
        i.install_methods();
        for sel in i.selectors().map(|s| s.to_string()).collect::<Vec<_>>() {
            let m = i.method_for_selector(&sel).unwrap();
            let derived = m.selector_override().map(|s| s.to_string())
                .unwrap_or_else(|| make_snake(m.name()));
            assert_eq!(derived, sel);
        }
    }

    #[test]
    fn duplicate_add_overwrites() {
        let mut i = sample_interface();
        i.add_method(Method::new("Ping", "com.example.Echo", vec![], vec![]));
        assert_eq!(i.methods()["Ping"].in_args().len(), 0);
    }

    #[test]
    fn properties_install_accessors() {
        let mut i = Interface::new("com.example.Player");
        i.add_property(Property::new("Volume", "com.example.Player",
            Argument::from_signature("d").unwrap(), Access::ReadWrite));
        i.add_property(Property::new("Version", "com.example.Player",
            Argument::from_signature("s").unwrap(), Access::Read));
        i.install_properties();

        assert!(i.method_for_selector("volume").is_some());
        assert!(i.method_for_selector("set_volume").is_some());
        assert!(i.method_for_selector("version").is_some());
        assert!(i.method_for_selector("set_version").is_none());

        // An existing method keeps its selector.
        let mut i = Interface::new("com.example.Player");
        i.add_method(Method::new("Volume", "com.example.Player", vec![], vec![]));
        i.install_methods();
        i.add_property(Property::new("Volume", "com.example.Player",
            Argument::from_signature("d").unwrap(), Access::ReadWrite));
        i.install_properties();
        let m = i.method_for_selector("volume").unwrap();
        assert!(m.property_role().is_none());
    }

    #[test]
    fn reflection_from_host_object() {
        use crate::value::{HostMethodDesc, HostObject};

        struct Clock;
        impl HostObject for Clock {
            fn class_name(&self) -> &str { "Clock" }
            fn declared_methods(&self) -> Vec<HostMethodDesc> {
                vec![HostMethodDesc {
                    selector: "current_time".to_string(),
                    in_args: vec![],
                    out_args: vec!["x".to_string()],
                }]
            }
            fn invoke(&self, _selector: &str, _args: &[Value]) -> Result<Value, Error> {
                Ok(Value::Int64(0))
            }
        }

        let i = Interface::from_host_object(&Clock).unwrap();
        assert_eq!(i.name(), "org.gnustep.objc.class.Clock");
        let m = i.method_for_selector("current_time").unwrap();
        assert_eq!(m.name(), "CurrentTime");
        assert_eq!(m.selector_override(), Some("current_time"));
    }

    #[test]
    fn protocol_declaration_rendering() {
        let mut i = sample_interface();
        i.add_property(Property::new("Volume", "com.example.Echo",
            Argument::from_signature("d").unwrap(), Access::ReadWrite));
        i.install_methods();
        i.install_properties();
        let decl = i.protocol_declaration();
        assert!(decl.starts_with("pub trait ComExampleEcho {"));
        assert!(decl.contains("fn ping(&self, message: &str) -> Result<String, objbus::Error>;"));
        assert!(decl.contains("fn volume(&self) -> Result<f64, objbus::Error>;"));
        assert!(decl.contains("fn set_volume(&self, value: f64) -> Result<(), objbus::Error>;"));
        assert!(decl.ends_with("}\n"));
    }

    #[test]
    fn xml_rendering() {
        let mut i = sample_interface();
        i.add_signal(Signal::new("Changed", "com.example.Echo",
            vec![Argument::from_signature("s").unwrap()]));
        let xml = i.to_xml(2);
        assert!(xml.contains("<interface name=\"com.example.Echo\">"));
        assert!(xml.contains("<method name=\"Ping\">"));
        assert!(xml.contains("<signal name=\"Changed\">"));
    }
}
