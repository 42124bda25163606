//! Proxies: opaque stand-ins for remote objects that intercept host
//! messages and turn them into method calls.
//!
//! A proxy starts cold, introspects its peer on first use, and then
//! resolves selectors against the interfaces the peer declared. All
//! state transitions latch a condition variable so concurrent callers
//! observe a consistent lifecycle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::call::{MethodCall, ReplyFuture};
use crate::endpoint::Endpoint;
use crate::interface::Interface;
use crate::introspect;
use crate::message::Message;
use crate::method::{Invocation, Method, PropertyRole};
use crate::typebridge::TypeCode;
use crate::value::Value;
use crate::{BusName, Error, ErrorKind, ObjectPath};

/// The `(endpoint, service)` pair a proxy belongs to.
///
/// Object-path arguments may only be passed by reference between objects of
/// the same scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    endpoint_id: usize,
    service: String,
}

impl Scope {
    pub(crate) fn new(endpoint_id: usize, service: &BusName) -> Scope {
        Scope { endpoint_id, service: service.to_string() }
    }

    /// The service half of the scope.
    pub fn service_name(&self) -> BusName {
        BusName::from(self.service.as_str())
    }
}

/// The lifecycle of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Created; nothing resolved yet.
    Cold,
    /// First unresolved message triggered introspection.
    Warming,
    /// Introspection data loaded; selectors resolve.
    Ready,
    /// Introspection failed or the transport was lost. Terminal.
    Invalid,
}

struct ProxyInner {
    state: ProxyState,
    interfaces: BTreeMap<String, Interface>,
    last_interface: Option<String>,
}

/// An opaque stand-in for a remote `(service, object path)` pair.
pub struct Proxy {
    service: BusName,
    path: ObjectPath,
    endpoint: Arc<Endpoint>,
    timeout_ms: i32,
    inner: Mutex<ProxyInner>,
    cond: Condvar,
}

/// The dynamic-dispatch entry point of the bridge: anything that accepts a
/// selector with arguments and produces a value.
///
/// Remote proxies implement this by issuing method calls; typed facades
/// generated from introspection data bottom out here.
pub trait RemoteObject {
    /// Invokes `selector` synchronously.
    fn invoke(&self, selector: &str, args: &[Value]) -> Result<Value, Error>;

    /// Invokes `selector`, returning immediately with a future.
    fn invoke_async(&self, selector: &str, args: &[Value]) -> Result<ReplyFuture, Error>;
}

impl Proxy {
    /// Creates a cold proxy for `(service, path)` on the endpoint.
    pub fn new(endpoint: Arc<Endpoint>, service: BusName, path: ObjectPath) -> Arc<Proxy> {
        Arc::new(Proxy {
            service,
            path,
            endpoint,
            timeout_ms: -1,
            inner: Mutex::new(ProxyInner {
                state: ProxyState::Cold,
                interfaces: BTreeMap::new(),
                last_interface: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// Creates a ready proxy with a preloaded interface cache, bypassing
    /// introspection.
    pub fn with_interfaces(endpoint: Arc<Endpoint>, service: BusName, path: ObjectPath,
        interfaces: Vec<Interface>) -> Arc<Proxy>
    {
        let map = interfaces.into_iter()
            .map(|i| (i.name().to_string(), i))
            .collect();
        Arc::new(Proxy {
            service,
            path,
            endpoint,
            timeout_ms: -1,
            inner: Mutex::new(ProxyInner {
                state: ProxyState::Ready,
                interfaces: map,
                last_interface: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// The service name the proxy stands in for.
    pub fn service_str(&self) -> &str { &self.service }

    /// The object path the proxy stands in for.
    pub fn path_str(&self) -> &str { &self.path }

    /// The endpoint carrying the proxy's messages.
    pub fn endpoint(&self) -> Arc<Endpoint> { self.endpoint.clone() }

    /// The proxy's scope: its endpoint and service.
    pub fn scope(&self) -> Scope {
        Scope::new(self.endpoint.id(), &self.service)
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ProxyState {
        self.inner.lock().unwrap().state
    }

    /// The method-call timeout, in milliseconds; non-positive means the
    /// library default.
    pub fn timeout_ms(&self) -> i32 { self.timeout_ms }

    pub(crate) fn service(&self) -> &BusName { &self.service }
    pub(crate) fn path(&self) -> &ObjectPath { &self.path }

    /// Marks the proxy invalid, waking any blocked callers. Called on
    /// transport loss; the state is terminal.
    pub fn invalidate(&self) {
        let mut g = self.inner.lock().unwrap();
        g.state = ProxyState::Invalid;
        self.cond.notify_all();
    }

    /// Fetches the peer's introspection XML.
    pub fn introspect(&self) -> Result<String, Error> {
        let msg = Message::method_call(&self.service, &self.path,
            &"org.freedesktop.DBus.Introspectable".into(), &"Introspect".into());
        let reply = self.endpoint.call_blocking(msg, self.timeout_ms, None)
            .map_err(|e| match e.kind() {
                ErrorKind::RemoteError | ErrorKind::Timeout => Error::new(
                    ErrorKind::RemoteUnreachable,
                    format!("introspection of {} {} failed: {}", self.service, self.path, e)),
                _ => e,
            })?;
        reply.iter_init().get_string(TypeCode::String)
            .ok_or_else(|| Error::new(ErrorKind::RemoteUnreachable,
                "Introspect returned no data".to_string()))
    }

    /// Drives the proxy to the ready state, introspecting the peer if this
    /// is the first use. Blocks while another caller is already warming the
    /// proxy up.
    pub fn resolve(&self) -> Result<(), Error> {
        let mut g = self.inner.lock().unwrap();
        if !self.endpoint.is_running() {
            g.state = ProxyState::Invalid;
            self.cond.notify_all();
        }
        loop {
            match g.state {
                ProxyState::Ready => return Ok(()),
                ProxyState::Invalid => {
                    return Err(Error::new(ErrorKind::RemoteUnreachable,
                        format!("proxy for {} {} is invalid", self.service, self.path)));
                }
                ProxyState::Warming => {
                    g = self.cond.wait(g).unwrap();
                }
                ProxyState::Cold => {
                    g.state = ProxyState::Warming;
                    drop(g);
                    let loaded = self.introspect()
                        .and_then(|xml| introspect::parse_introspection(&xml));
                    g = self.inner.lock().unwrap();
                    match loaded {
                        Ok(ifaces) => {
                            debug!("proxy {} {} resolved {} interfaces",
                                self.service, self.path, ifaces.len());
                            for i in ifaces {
                                g.interfaces.insert(i.name().to_string(), i);
                            }
                            g.state = ProxyState::Ready;
                            self.cond.notify_all();
                            return Ok(());
                        }
                        Err(e) => {
                            g.state = ProxyState::Invalid;
                            self.cond.notify_all();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Resolves a selector to its method, applying the most-recently-used
    /// interface as the tiebreak when several interfaces dispatch it.
    fn lookup(&self, selector: &str) -> Result<(String, Arc<Method>), Error> {
        let g = self.inner.lock().unwrap();
        let mut matches: Vec<(String, Arc<Method>)> = g.interfaces.values()
            .filter_map(|i| i.method_for_selector(selector)
                .map(|m| (i.name().to_string(), m)))
            .collect();
        match matches.len() {
            0 => Err(Error::new(ErrorKind::TypeMismatch,
                format!("{} {} does not recognize selector '{}'",
                    self.service, self.path, selector))),
            1 => Ok(matches.remove(0)),
            _ => {
                if let Some(last) = &g.last_interface {
                    if let Some(idx) = matches.iter().position(|(n, _)| n == last) {
                        return Ok(matches.remove(idx));
                    }
                }
                Err(Error::new(ErrorKind::TypeMismatch,
                    format!("selector '{}' is ambiguous between {} interfaces",
                        selector, matches.len())))
            }
        }
    }

    /// Builds the wire invocation for a selector, handling synthesized
    /// property accessors, and checks the argument layout.
    fn prepare(&self, selector: &str, args: &[Value])
        -> Result<(Arc<Method>, Invocation), Error>
    {
        self.resolve()?;
        let (iface_name, method) = self.lookup(selector)?;
        let inv = match method.property_role() {
            Some(PropertyRole::Get { interface, property }) => {
                if !args.is_empty() {
                    return Err(Error::new(ErrorKind::TypeMismatch,
                        format!("property accessor '{}' takes no arguments", selector)));
                }
                Invocation::new(selector,
                    vec![Value::from(interface.as_str()), Value::from(property.as_str())])
            }
            Some(PropertyRole::Set { interface, property }) => {
                if args.len() != 1 {
                    return Err(Error::new(ErrorKind::TypeMismatch,
                        format!("property mutator '{}' takes exactly one argument", selector)));
                }
                Invocation::new(selector,
                    vec![Value::from(interface.as_str()), Value::from(property.as_str()),
                         args[0].clone()])
            }
            None => {
                if args.len() != method.in_args().len() {
                    return Err(Error::new(ErrorKind::TypeMismatch,
                        format!("selector '{}' takes {} arguments, got {}",
                            selector, method.in_args().len(), args.len())));
                }
                Invocation::new(selector, args.to_vec())
            }
        };
        self.inner.lock().unwrap().last_interface = Some(iface_name);
        Ok((method, inv))
    }

    /// Reads a property through `org.freedesktop.DBus.Properties.Get`,
    /// without consulting the dispatch table.
    pub fn get_property(&self, interface: &str, name: &str) -> Result<Value, Error> {
        let method = properties_get();
        let inv = Invocation::new("get",
            vec![Value::from(interface), Value::from(name)]);
        MethodCall::new(self, Arc::new(method)).invoke(inv)
    }

    /// Writes a property through `org.freedesktop.DBus.Properties.Set`.
    pub fn set_property(&self, interface: &str, name: &str, value: Value) -> Result<(), Error> {
        let method = properties_set();
        let inv = Invocation::new("set",
            vec![Value::from(interface), Value::from(name), value]);
        MethodCall::new(self, Arc::new(method)).invoke(inv)?;
        Ok(())
    }
}

impl RemoteObject for Proxy {
    fn invoke(&self, selector: &str, args: &[Value]) -> Result<Value, Error> {
        let (method, inv) = self.prepare(selector, args)?;
        MethodCall::new(self, method).invoke(inv)
    }

    fn invoke_async(&self, selector: &str, args: &[Value]) -> Result<ReplyFuture, Error> {
        let (method, inv) = self.prepare(selector, args)?;
        MethodCall::new(self, method).invoke_async(inv)
    }
}

fn properties_get() -> Method {
    use crate::argument::Argument;
    Method::new("Get", "org.freedesktop.DBus.Properties",
        vec![
            Argument::new_basic(TypeCode::String).with_name("interface_name"),
            Argument::new_basic(TypeCode::String).with_name("property_name"),
        ],
        vec![Argument::new_basic(TypeCode::Variant).with_name("value")])
}

fn properties_set() -> Method {
    use crate::argument::Argument;
    Method::new("Set", "org.freedesktop.DBus.Properties",
        vec![
            Argument::new_basic(TypeCode::String).with_name("interface_name"),
            Argument::new_basic(TypeCode::String).with_name("property_name"),
            Argument::new_basic(TypeCode::Variant).with_name("value"),
        ],
        vec![])
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("service", &self.service_str())
            .field("path", &self.path_str())
            .field("state", &self.state())
            .finish()
    }
}
