//! Loads `org.freedesktop.DBus.Introspectable` XML into interface objects.
//!
//! A plain streaming pass over the document: interfaces, members and
//! arguments are assembled as their end tags arrive. Child `<node>` elements
//! describe other objects and are skipped.

use xml::attribute::OwnedAttribute;
use xml::reader::{EventReader, XmlEvent};

use crate::argument::Argument;
use crate::interface::Interface;
use crate::method::{Access, Method, Property, Signal};
use crate::{Error, ErrorKind};

fn parse_error<S: Into<String>>(msg: S) -> Error {
    Error::new(ErrorKind::RemoteUnreachable,
        format!("introspection data unusable: {}", msg.into()))
}

fn find_attr<'a>(attrs: &'a [OwnedAttribute], name: &str) -> Result<&'a str, Error> {
    attrs.iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.as_str())
        .ok_or_else(|| parse_error(format!("missing '{}' attribute", name)))
}

fn opt_attr<'a>(attrs: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attrs.iter().find(|a| a.name.local_name == name).map(|a| a.value.as_str())
}

struct PendingMember {
    name: String,
    signal: bool,
    in_args: Vec<Argument>,
    out_args: Vec<Argument>,
    annotations: Vec<(String, String)>,
}

/// Parses an introspection document into its interfaces, with their
/// dispatch tables installed.
pub fn parse_introspection(doc: &str) -> Result<Vec<Interface>, Error> {
    let parser = EventReader::new(doc.as_bytes());

    let mut interfaces = Vec::new();
    let mut node_depth = 0usize;
    let mut iface: Option<Interface> = None;
    let mut member: Option<PendingMember> = None;
    let mut property: Option<Property> = None;
    let mut arg: Option<(Argument, bool)> = None; // (argument, is_out)

    for event in parser {
        let event = event.map_err(|e| parse_error(e.to_string()))?;
        match event {
            XmlEvent::StartElement { name, attributes, .. } => {
                match name.local_name.as_str() {
                    "node" => node_depth += 1,
                    // Interfaces of child nodes belong to other objects.
                    _ if node_depth > 1 => {}
                    "interface" => {
                        iface = Some(Interface::new(find_attr(&attributes, "name")?));
                    }
                    "method" | "signal" if iface.is_some() => {
                        member = Some(PendingMember {
                            name: find_attr(&attributes, "name")?.to_string(),
                            signal: name.local_name == "signal",
                            in_args: Vec::new(),
                            out_args: Vec::new(),
                            annotations: Vec::new(),
                        });
                    }
                    "property" if iface.is_some() => {
                        let ty = Argument::from_signature(find_attr(&attributes, "type")?)?;
                        let access = Access::from_attr(find_attr(&attributes, "access")?)
                            .ok_or_else(|| parse_error("bad property access"))?;
                        let iname = iface.as_ref().map(|i| i.name().to_string()).unwrap_or_default();
                        property = Some(Property::new(
                            find_attr(&attributes, "name")?, iname, ty, access));
                    }
                    "arg" if member.is_some() => {
                        let mut a = Argument::from_signature(find_attr(&attributes, "type")?)?;
                        if let Some(n) = opt_attr(&attributes, "name") {
                            a = a.with_name(n);
                        }
                        let is_signal = member.as_ref().map(|m| m.signal).unwrap_or(false);
                        let out = match opt_attr(&attributes, "direction") {
                            Some("in") => false,
                            Some("out") => true,
                            // Signal arguments are out-direction by
                            // construction; method arguments default to in.
                            None => is_signal,
                            Some(other) => {
                                return Err(parse_error(format!("bad direction '{}'", other)));
                            }
                        };
                        arg = Some((a, out));
                    }
                    "annotation" => {
                        let key = find_attr(&attributes, "name")?.to_string();
                        let value = find_attr(&attributes, "value")?.to_string();
                        if let Some((a, _)) = arg.as_mut() {
                            a.set_annotation(key, value);
                        } else if let Some(m) = member.as_mut() {
                            m.annotations.push((key, value));
                        } else if let Some(i) = iface.as_mut() {
                            i.set_annotation(key, value);
                        }
                    }
                    _ => {}
                }
            }
            XmlEvent::EndElement { name } => {
                match name.local_name.as_str() {
                    "node" => node_depth = node_depth.saturating_sub(1),
                    _ if node_depth > 1 => {}
                    "arg" => {
                        if let (Some((a, out)), Some(m)) = (arg.take(), member.as_mut()) {
                            if out { m.out_args.push(a) } else { m.in_args.push(a) }
                        }
                    }
                    "method" | "signal" => {
                        if let (Some(p), Some(i)) = (member.take(), iface.as_mut()) {
                            if p.signal {
                                let mut s = Signal::new(p.name, i.name().to_string(),
                                    p.out_args.into_iter().chain(p.in_args).collect());
                                for (k, v) in p.annotations {
                                    s.set_annotation(k, v);
                                }
                                i.add_signal(s);
                            } else {
                                let mut m = Method::new(p.name, i.name().to_string(),
                                    p.in_args, p.out_args);
                                for (k, v) in p.annotations {
                                    m.set_annotation(k, v);
                                }
                                i.add_method(m);
                            }
                        }
                    }
                    "property" => {
                        if let (Some(p), Some(i)) = (property.take(), iface.as_mut()) {
                            i.add_property(p);
                        }
                    }
                    "interface" => {
                        if let Some(mut i) = iface.take() {
                            i.install_methods();
                            i.install_properties();
                            interfaces.push(i);
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
    Ok(interfaces)
}
