//! Endpoints: ownership of one D-Bus connection and the transport worker
//! that drives it.
//!
//! Only the worker thread touches the connection. Host threads enqueue
//! closures (send a message, register a pending call, adjust match rules)
//! and either block on a completion handle or observe a reply future. The
//! worker loop alternates between draining that queue, reading the socket,
//! and routing incoming messages: replies to their pending slots, method
//! calls to exported objects, signals to registered handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::NativeError;
use crate::export::{self, ExportTable};
use crate::interface::Interface;
use crate::message::{Message, MessageType};
use crate::value::HostObject;
use crate::call::CancelToken;
use crate::{ffi, init_dbus, to_c_str};
use crate::{BusName, Error, ErrorKind, ObjectPath};

/// The default timeout for pending calls, applied when a caller passes a
/// non-positive timeout.
pub const DEFAULT_TIMEOUT_MS: i32 = 25_000;

/// Converts a floating-point second count to integer milliseconds with
/// truncation. Non-positive results select the transport default.
pub fn timeout_ms_from_secs(secs: f64) -> i32 {
    (secs * 1000.0) as i32
}

pub(crate) fn effective_timeout(ms: i32) -> Duration {
    if ms <= 0 {
        Duration::from_millis(DEFAULT_TIMEOUT_MS as u64)
    } else {
        Duration::from_millis(ms as u64)
    }
}

/// Which bus (or custom server address) an endpoint connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusKind {
    /// The per-login session bus.
    Session,
    /// The system-wide bus.
    System,
    /// The bus that started this process.
    Starter,
    /// A custom server address, e g `unix:path=/tmp/mybus`.
    Address(String),
}

/// The bus daemon's answer to a name request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    /// The connection now owns the name.
    PrimaryOwner,
    /// The name has an owner; the connection is queued for it.
    InQueue,
    /// The name has an owner and queueing was not requested.
    Exists,
    /// The connection already owned the name.
    AlreadyOwner,
}

/// Low-level connection handle; all use is funnelled through the worker.
pub(crate) struct Channel {
    conn: *mut ffi::DBusConnection,
}

unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    fn open(kind: &BusKind) -> Result<Channel, Error> {
        init_dbus();
        let mut e = NativeError::empty();
        let conn = match kind {
            BusKind::Session => unsafe {
                ffi::dbus_bus_get_private(ffi::DBusBusType::Session, e.get_mut())
            },
            BusKind::System => unsafe {
                ffi::dbus_bus_get_private(ffi::DBusBusType::System, e.get_mut())
            },
            BusKind::Starter => unsafe {
                ffi::dbus_bus_get_private(ffi::DBusBusType::Starter, e.get_mut())
            },
            BusKind::Address(addr) => {
                let c = to_c_str(addr);
                let conn = unsafe { ffi::dbus_connection_open_private(c.as_ptr(), e.get_mut()) };
                if !conn.is_null() && unsafe { ffi::dbus_bus_register(conn, e.get_mut()) } == 0 {
                    unsafe {
                        ffi::dbus_connection_close(conn);
                        ffi::dbus_connection_unref(conn);
                    }
                    return Err(e.into());
                }
                conn
            }
        };
        if conn.is_null() {
            return Err(e.into());
        }
        // The bridge owns its error handling; never let libdbus exit us.
        unsafe { ffi::dbus_connection_set_exit_on_disconnect(conn, 0) };
        Ok(Channel { conn })
    }

    fn is_connected(&self) -> bool {
        unsafe { ffi::dbus_connection_get_is_connected(self.conn) != 0 }
    }

    fn unique_name(&self) -> Option<String> {
        let c = unsafe { ffi::dbus_bus_get_unique_name(self.conn) };
        crate::c_str_to_slice(&c).map(|s| s.to_string())
    }

    /// Puts a message on the outgoing queue. Distinguishes a full transport
    /// (out of memory) from a closed one.
    fn send(&self, msg: &Message) -> Result<u32, Error> {
        if !self.is_connected() {
            return Err(Error::new(ErrorKind::Disconnected,
                "connection closed before the message could be enqueued".to_string()));
        }
        let mut serial = 0u32;
        let r = unsafe { ffi::dbus_connection_send(self.conn, msg.ptr(), &mut serial) };
        if r == 0 {
            Err(Error::new(ErrorKind::OutOfMemory,
                "transport failed to enqueue the message".to_string()))
        } else {
            Ok(serial)
        }
    }

    fn read_write(&self, timeout: Duration) -> bool {
        let ms = timeout.as_millis() as std::os::raw::c_int;
        unsafe { ffi::dbus_connection_read_write(self.conn, ms) != 0 }
    }

    fn pop_message(&self) -> Option<Message> {
        let mptr = unsafe { ffi::dbus_connection_pop_message(self.conn) };
        if mptr.is_null() {
            None
        } else {
            Some(Message::from_ptr(mptr, false))
        }
    }

    fn flush(&self) {
        unsafe { ffi::dbus_connection_flush(self.conn) }
    }

    fn request_name(&self, name: &str, flags: u32) -> Result<i32, Error> {
        let mut e = NativeError::empty();
        let c = to_c_str(name);
        let r = unsafe { ffi::dbus_bus_request_name(self.conn, c.as_ptr(), flags, e.get_mut()) };
        if r < 0 { Err(e.into()) } else { Ok(r) }
    }

    fn release_name(&self, name: &str) -> Result<(), Error> {
        let mut e = NativeError::empty();
        let c = to_c_str(name);
        let r = unsafe { ffi::dbus_bus_release_name(self.conn, c.as_ptr(), e.get_mut()) };
        if r < 0 { Err(e.into()) } else { Ok(()) }
    }

    fn add_match(&self, rule: &str) -> Result<(), Error> {
        let mut e = NativeError::empty();
        let c = to_c_str(rule);
        unsafe { ffi::dbus_bus_add_match(self.conn, c.as_ptr(), e.get_mut()) };
        if e.name().is_some() { Err(e.into()) } else { Ok(()) }
    }

    fn remove_match(&self, rule: &str) -> Result<(), Error> {
        let mut e = NativeError::empty();
        let c = to_c_str(rule);
        unsafe { ffi::dbus_bus_remove_match(self.conn, c.as_ptr(), e.get_mut()) };
        if e.name().is_some() { Err(e.into()) } else { Ok(()) }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        unsafe {
            ffi::dbus_connection_close(self.conn);
            ffi::dbus_connection_unref(self.conn);
        }
    }
}

enum SlotState {
    Pending,
    Done(Option<Result<Message, Error>>),
}

/// The completion slot of one pending call.
pub struct ReplySlot {
    st: Mutex<SlotState>,
    serial: Mutex<Option<u32>>,
    deadline: Instant,
}

impl ReplySlot {
    fn new(deadline: Instant) -> ReplySlot {
        ReplySlot { st: Mutex::new(SlotState::Pending), serial: Mutex::new(None), deadline }
    }

    /// Whether a reply, error or cancellation has landed.
    pub fn is_done(&self) -> bool {
        matches!(*self.st.lock().unwrap(), SlotState::Done(_))
    }

    fn set_serial(&self, serial: u32) {
        *self.serial.lock().unwrap() = Some(serial);
    }

    fn serial(&self) -> Option<u32> {
        *self.serial.lock().unwrap()
    }

    fn complete(&self, msg: Message) {
        let mut g = self.st.lock().unwrap();
        if let SlotState::Pending = *g {
            *g = SlotState::Done(Some(msg.as_result()));
        }
    }

    fn fail(&self, e: Error) {
        let mut g = self.st.lock().unwrap();
        if let SlotState::Pending = *g {
            *g = SlotState::Done(Some(Err(e)));
        }
    }

    /// Takes the reply atomically; only the first taker sees it.
    fn take(&self) -> Option<Result<Message, Error>> {
        let mut g = self.st.lock().unwrap();
        match &mut *g {
            SlotState::Pending => None,
            SlotState::Done(r) => r.take(),
        }
    }

    fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// A handle identifying a registered signal watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(
    /// The watch id.
    pub usize,
);

/// Callback invoked for each matching signal; returning false removes the
/// watch.
pub type SignalCallback = Box<dyn FnMut(&Message) -> bool + Send>;

/// Which signals a watch matches on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSpec {
    /// Match on the sending connection.
    pub sender: Option<String>,
    /// Match on the emitting object path.
    pub path: Option<String>,
    /// Match on the signal's interface.
    pub interface: Option<String>,
    /// Match on the signal name.
    pub member: Option<String>,
}

impl MatchSpec {
    /// The bus match rule for this spec.
    pub fn match_str(&self) -> String {
        let mut parts = vec!["type='signal'".to_string()];
        if let Some(s) = &self.sender { parts.push(format!("sender='{}'", s)); }
        if let Some(p) = &self.path { parts.push(format!("path='{}'", p)); }
        if let Some(i) = &self.interface { parts.push(format!("interface='{}'", i)); }
        if let Some(m) = &self.member { parts.push(format!("member='{}'", m)); }
        parts.join(",")
    }

    /// Whether the message matches this spec.
    pub fn matches(&self, m: &Message) -> bool {
        if m.msg_type() != MessageType::Signal { return false; }
        fn hit(want: &Option<String>, got: Option<String>) -> bool {
            match want {
                Some(w) => got.as_deref() == Some(w.as_str()),
                None => true,
            }
        }
        hit(&self.sender, m.sender())
            && hit(&self.path, m.path())
            && hit(&self.interface, m.interface())
            && hit(&self.member, m.member())
    }
}

struct SignalHandler {
    token: Token,
    spec: MatchSpec,
    callback: SignalCallback,
}

type Work = Box<dyn FnOnce(&Endpoint) + Send>;

static NEXT_ENDPOINT_ID: AtomicUsize = AtomicUsize::new(1);

/// One D-Bus connection plus the worker that drives it.
pub struct Endpoint {
    id: usize,
    weak_self: Weak<Endpoint>,
    channel: Channel,
    work_tx: Mutex<mpsc::Sender<Work>>,
    work_rx: Mutex<mpsc::Receiver<Work>>,
    pending: Mutex<HashMap<u32, Arc<ReplySlot>>>,
    handlers: Mutex<Vec<SignalHandler>>,
    exports: Mutex<ExportTable>,
    next_token: AtomicUsize,
    running: AtomicBool,
    synchronizing: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: Mutex<Option<ThreadId>>,
}

impl Endpoint {
    /// Connects to the session bus.
    pub fn session() -> Result<Arc<Endpoint>, Error> {
        Endpoint::open(BusKind::Session)
    }

    /// Connects to the system bus.
    pub fn system() -> Result<Arc<Endpoint>, Error> {
        Endpoint::open(BusKind::System)
    }

    /// Connects to the given bus and spawns the transport worker.
    pub fn open(kind: BusKind) -> Result<Arc<Endpoint>, Error> {
        Endpoint::open_inner(kind, true)
    }

    /// Connects without a worker thread; the endpoint runs in synchronizing
    /// mode and callers drive the connection themselves (via blocking calls
    /// or [`process`](Endpoint::process)).
    pub fn open_synchronizing(kind: BusKind) -> Result<Arc<Endpoint>, Error> {
        Endpoint::open_inner(kind, false)
    }

    fn open_inner(kind: BusKind, spawn: bool) -> Result<Arc<Endpoint>, Error> {
        let channel = Channel::open(&kind)?;
        let (tx, rx) = mpsc::channel();
        let ep = Arc::new_cyclic(|weak| Endpoint {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::SeqCst),
            weak_self: weak.clone(),
            channel,
            work_tx: Mutex::new(tx),
            work_rx: Mutex::new(rx),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            exports: Mutex::new(ExportTable::default()),
            next_token: AtomicUsize::new(1),
            running: AtomicBool::new(true),
            synchronizing: AtomicBool::new(!spawn),
            worker: Mutex::new(None),
            worker_thread: Mutex::new(None),
        });
        if spawn {
            let weak = Arc::downgrade(&ep);
            let handle = thread::Builder::new()
                .name("objbus-endpoint".to_string())
                .spawn(move || worker_main(weak))
                .map_err(|e| Error::new(ErrorKind::OutOfMemory,
                    format!("failed to spawn transport worker: {}", e)))?;
            *ep.worker_thread.lock().unwrap() = Some(handle.thread().id());
            *ep.worker.lock().unwrap() = Some(handle);
        }
        Ok(ep)
    }

    /// A process-unique id; two proxies share a scope only when they share
    /// this id and a service name.
    pub fn id(&self) -> usize { self.id }

    /// A strong handle on this endpoint, for threading into marshal
    /// contexts. `None` only while the endpoint is being torn down.
    pub(crate) fn strong(&self) -> Option<Arc<Endpoint>> {
        self.weak_self.upgrade()
    }

    /// The connection's unique bus name, e g `:1.54`.
    pub fn unique_name(&self) -> Option<String> {
        self.channel.unique_name()
    }

    /// Whether the endpoint still runs.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Puts the endpoint in (or out of) synchronizing mode, where blocking
    /// waits drive the connection from the calling thread.
    pub fn set_synchronizing(&self, on: bool) {
        self.synchronizing.store(on, Ordering::SeqCst);
    }

    fn synchronizing(&self) -> bool {
        self.synchronizing.load(Ordering::SeqCst)
    }

    fn on_worker(&self) -> bool {
        (*self.worker_thread.lock().unwrap())
            .map(|id| id == thread::current().id())
            .unwrap_or(false)
    }

    fn run_on_worker<F>(&self, f: F) -> Result<(), Error>
    where F: FnOnce(&Endpoint) + Send + 'static
    {
        if !self.is_running() {
            return Err(Error::new(ErrorKind::Disconnected, "endpoint closed".to_string()));
        }
        if self.on_worker() || self.synchronizing() {
            f(self);
            return Ok(());
        }
        self.work_tx.lock().unwrap().send(Box::new(f))
            .map_err(|_| Error::new(ErrorKind::Disconnected, "endpoint closed".to_string()))
    }

    /// Runs one slice of the connection loop: queued work, socket I/O, and
    /// message routing. Public for synchronizing-mode servers.
    pub fn process(&self, timeout: Duration) {
        self.drive(timeout)
    }

    pub(crate) fn drive(&self, timeout: Duration) {
        let mut work = Vec::new();
        {
            let rx = self.work_rx.lock().unwrap();
            while let Ok(w) = rx.try_recv() {
                work.push(w);
            }
        }
        for w in work {
            w(self);
        }
        if !self.channel.read_write(timeout) {
            self.handle_disconnect();
            return;
        }
        while let Some(msg) = self.channel.pop_message() {
            self.route(msg);
        }
        self.expire_pending();
    }

    fn handle_disconnect(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            warn!("endpoint {}: transport lost", self.id);
        }
        self.fail_all_pending(Error::new(ErrorKind::Disconnected,
            "transport closed before reply".to_string()));
    }

    fn fail_all_pending(&self, e: Error) {
        let slots: Vec<Arc<ReplySlot>> = self.pending.lock().unwrap()
            .drain().map(|(_, s)| s).collect();
        for s in slots {
            s.fail(e.clone());
        }
    }

    fn expire_pending(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<ReplySlot>> = {
            let mut g = self.pending.lock().unwrap();
            let serials: Vec<u32> = g.iter()
                .filter(|(_, s)| s.deadline() <= now)
                .map(|(serial, _)| *serial)
                .collect();
            serials.into_iter().filter_map(|s| g.remove(&s)).collect()
        };
        for s in expired {
            s.fail(Error::new(ErrorKind::Timeout, "pending call exceeded its deadline".to_string()));
        }
    }

    fn route(&self, msg: Message) {
        match msg.msg_type() {
            MessageType::MethodReturn | MessageType::Error => {
                if let Some(serial) = msg.reply_serial() {
                    let slot = self.pending.lock().unwrap().remove(&serial);
                    if let Some(slot) = slot {
                        slot.complete(msg);
                        return;
                    }
                }
                debug!("endpoint {}: dropping unmatched reply {:?}", self.id, msg);
            }
            MessageType::MethodCall => {
                if let Some(reply) = export::dispatch_call(self, &msg) {
                    let _ = self.channel.send(&reply);
                }
            }
            MessageType::Signal => self.deliver_signal(&msg),
            _ => {}
        }
    }

    fn deliver_signal(&self, msg: &Message) {
        let mut matched = Vec::new();
        {
            let mut g = self.handlers.lock().unwrap();
            let mut i = 0;
            while i < g.len() {
                if g[i].spec.matches(msg) {
                    matched.push(g.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        let mut keep = Vec::new();
        for mut h in matched {
            if (h.callback)(msg) {
                keep.push(h);
            }
        }
        self.handlers.lock().unwrap().extend(keep);
    }

    /// Sends a message without expecting a reply; used for signals and
    /// oneway calls. Returns the message serial.
    pub fn send(&self, msg: Message) -> Result<u32, Error> {
        if self.on_worker() || self.synchronizing() {
            return self.channel.send(&msg);
        }
        let (tx, rx) = mpsc::channel();
        self.run_on_worker(move |ep| {
            let _ = tx.send(ep.channel.send(&msg));
        })?;
        rx.recv().map_err(|_| Error::new(ErrorKind::Disconnected, "endpoint closed".to_string()))?
    }

    /// Enqueues a method call and returns its pending slot immediately.
    pub fn call_async(&self, msg: Message, timeout_ms: i32)
        -> Result<Arc<ReplySlot>, Error>
    {
        let deadline = Instant::now() + effective_timeout(timeout_ms);
        let slot = Arc::new(ReplySlot::new(deadline));
        let s2 = slot.clone();
        self.run_on_worker(move |ep| {
            match ep.channel.send(&msg) {
                Ok(serial) => {
                    s2.set_serial(serial);
                    ep.pending.lock().unwrap().insert(serial, s2);
                    ep.channel.flush();
                }
                Err(e) => s2.fail(e),
            }
        })?;
        Ok(slot)
    }

    /// Enqueues a method call and blocks until its reply arrives.
    pub fn call_blocking(&self, msg: Message, timeout_ms: i32,
        cancel: Option<&CancelToken>) -> Result<Message, Error>
    {
        let slot = self.call_async(msg, timeout_ms)?;
        self.wait_for(&slot, cancel)
    }

    /// Blocks until the slot completes.
    ///
    /// On the worker thread (or in synchronizing mode) the caller drives the
    /// connection loop in 100 ms slices; elsewhere it polls, yielding the
    /// scheduler every sixteenth iteration. Cancellation removes the pending
    /// call and ends the wait.
    pub fn wait_for(&self, slot: &Arc<ReplySlot>, cancel: Option<&CancelToken>)
        -> Result<Message, Error>
    {
        let drives = self.on_worker() || self.synchronizing();
        let mut polls: u32 = 0;
        loop {
            if let Some(r) = slot.take() {
                return r;
            }
            if let Some(c) = cancel {
                if c.is_cancelled() {
                    self.cancel_slot(slot);
                    return Err(Error::new(ErrorKind::Cancelled,
                        "invocation cancelled by caller".to_string()));
                }
            }
            if Instant::now() >= slot.deadline() {
                self.cancel_slot(slot);
                return Err(Error::new(ErrorKind::Timeout,
                    "pending call exceeded its deadline".to_string()));
            }
            if !self.is_running() {
                return slot.take().unwrap_or_else(|| {
                    Err(Error::new(ErrorKind::Disconnected,
                        "transport closed before reply".to_string()))
                });
            }
            if drives {
                self.drive(Duration::from_millis(100));
            } else {
                polls += 1;
                if polls % 16 == 0 {
                    thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Cancels a pending slot: removes it from the pending table and fails
    /// any waiter with a cancelled error.
    pub fn cancel_slot(&self, slot: &Arc<ReplySlot>) {
        if let Some(serial) = slot.serial() {
            let _ = self.pending.lock().unwrap().remove(&serial);
        }
        slot.fail(Error::new(ErrorKind::Cancelled,
            "invocation cancelled by caller".to_string()));
    }

    /// Registers a match rule with the bus and a callback for the matching
    /// signals. Delivery is in arrival order per source.
    pub fn watch_signal(&self, spec: MatchSpec, callback: SignalCallback)
        -> Result<Token, Error>
    {
        self.bus_match(&spec.match_str(), true)?;
        let token = Token(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.handlers.lock().unwrap().push(SignalHandler { token, spec, callback });
        Ok(token)
    }

    /// Removes a signal watch registered with
    /// [`watch_signal`](Endpoint::watch_signal).
    pub fn unwatch_signal(&self, token: Token) -> Result<(), Error> {
        let removed = {
            let mut g = self.handlers.lock().unwrap();
            g.iter().position(|h| h.token == token).map(|i| g.remove(i))
        };
        match removed {
            Some(h) => self.bus_match(&h.spec.match_str(), false),
            None => Ok(()),
        }
    }

    fn bus_match(&self, rule: &str, add: bool) -> Result<(), Error> {
        if self.on_worker() || self.synchronizing() {
            return if add { self.channel.add_match(rule) } else { self.channel.remove_match(rule) };
        }
        let rule = rule.to_string();
        let (tx, rx) = mpsc::channel();
        self.run_on_worker(move |ep| {
            let r = if add { ep.channel.add_match(&rule) } else { ep.channel.remove_match(&rule) };
            let _ = tx.send(r);
        })?;
        rx.recv().map_err(|_| Error::new(ErrorKind::Disconnected, "endpoint closed".to_string()))?
    }

    /// Requests a well-known name on the bus, so peers can reach exported
    /// objects without knowing the unique connection name.
    pub fn request_name(&self, name: &BusName, replace_existing: bool) -> Result<RequestNameReply, Error> {
        // DBUS_NAME_FLAG_REPLACE_EXISTING
        let flags: u32 = if replace_existing { 2 } else { 0 };
        let code = if self.on_worker() || self.synchronizing() {
            self.channel.request_name(name, flags)?
        } else {
            let name = name.clone();
            let (tx, rx) = mpsc::channel();
            self.run_on_worker(move |ep| {
                let _ = tx.send(ep.channel.request_name(&name, flags));
            })?;
            rx.recv().map_err(|_| Error::new(ErrorKind::Disconnected, "endpoint closed".to_string()))??
        };
        Ok(match code {
            1 => RequestNameReply::PrimaryOwner,
            2 => RequestNameReply::InQueue,
            3 => RequestNameReply::Exists,
            4 => RequestNameReply::AlreadyOwner,
            other => return Err(Error::new(ErrorKind::RemoteError,
                format!("unexpected RequestName reply {}", other))),
        })
    }

    /// Releases a previously requested well-known name.
    pub fn release_name(&self, name: &BusName) -> Result<(), Error> {
        if self.on_worker() || self.synchronizing() {
            return self.channel.release_name(name);
        }
        let name = name.clone();
        let (tx, rx) = mpsc::channel();
        self.run_on_worker(move |ep| {
            let _ = tx.send(ep.channel.release_name(&name));
        })?;
        rx.recv().map_err(|_| Error::new(ErrorKind::Disconnected, "endpoint closed".to_string()))?
    }

    // ---- exported objects ----

    /// Exports a host object at the given path, reflecting its declared
    /// methods into an interface. The path is taken verbatim and must be
    /// absolute.
    pub fn export_object(&self, path: &str, obj: Arc<dyn HostObject>) -> Result<(), Error> {
        let iface = Interface::from_host_object(&*obj)?;
        self.export_object_with_interfaces(path, obj, vec![iface])
    }

    /// Exports a host object with an explicit set of interfaces.
    pub fn export_object_with_interfaces(&self, path: &str, obj: Arc<dyn HostObject>,
        interfaces: Vec<Interface>) -> Result<(), Error>
    {
        if !path.starts_with('/') {
            return Err(Error::new(ErrorKind::TypeMismatch,
                format!("exported path '{}' must begin with '/'", path)));
        }
        ObjectPath::new(path)?;
        self.exports.lock().unwrap().insert(path, obj, interfaces);
        Ok(())
    }

    /// Exports a host object under a fresh auto-generated path, or returns
    /// the path it is already exported at.
    pub fn export_auto(&self, obj: Arc<dyn HostObject>) -> Result<String, Error> {
        if let Some(p) = self.exports.lock().unwrap().path_for(&obj) {
            return Ok(p);
        }
        let iface = Interface::from_host_object(&*obj)?;
        Ok(self.exports.lock().unwrap().insert_auto(obj, vec![iface]))
    }

    /// Withdraws an exported object. Returns whether anything was exported
    /// at the path.
    pub fn unexport(&self, path: &str) -> bool {
        self.exports.lock().unwrap().remove(path)
    }

    pub(crate) fn export_path_for(&self, obj: &Arc<dyn HostObject>) -> Result<String, Error> {
        if let Some(p) = self.exports.lock().unwrap().path_for(obj) {
            return Ok(p);
        }
        self.export_auto(obj.clone())
    }

    pub(crate) fn exports(&self) -> &Mutex<ExportTable> {
        &self.exports
    }

    /// Tears the endpoint down: stops the worker, fails outstanding calls,
    /// and clears the export and handler tables. No endpoint state survives.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.worker.lock().unwrap().take();
        if let Some(h) = handle {
            if h.thread().id() != thread::current().id() {
                let _ = h.join();
            }
        }
        self.fail_all_pending(Error::new(ErrorKind::Disconnected, "endpoint closed".to_string()));
        self.exports.lock().unwrap().clear();
        self.handlers.lock().unwrap().clear();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn worker_main(weak: Weak<Endpoint>) {
    loop {
        let ep = match weak.upgrade() {
            Some(ep) => ep,
            None => return,
        };
        if !ep.is_running() {
            return;
        }
        ep.drive(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_conversion_truncates() {
        assert_eq!(timeout_ms_from_secs(1.5), 1500);
        assert_eq!(timeout_ms_from_secs(0.0109), 10);
        assert_eq!(timeout_ms_from_secs(-2.0), -2000);
        assert_eq!(effective_timeout(-1), Duration::from_millis(DEFAULT_TIMEOUT_MS as u64));
        assert_eq!(effective_timeout(0), Duration::from_millis(DEFAULT_TIMEOUT_MS as u64));
        assert_eq!(effective_timeout(300), Duration::from_millis(300));
    }

    #[test]
    fn match_spec_strings() {
        let spec = MatchSpec {
            interface: Some("com.example.Echo".to_string()),
            member: Some("Changed".to_string()),
            ..Default::default()
        };
        assert_eq!(spec.match_str(), "type='signal',interface='com.example.Echo',member='Changed'");
        assert_eq!(MatchSpec::default().match_str(), "type='signal'");
    }

    #[test]
    fn match_spec_matches_signal_headers() {
        let msg = Message::signal(&"/obj".into(), &"com.example.Echo".into(), &"Changed".into());
        let hit = MatchSpec {
            path: Some("/obj".to_string()),
            interface: Some("com.example.Echo".to_string()),
            member: Some("Changed".to_string()),
            ..Default::default()
        };
        assert!(hit.matches(&msg));
        let miss = MatchSpec {
            member: Some("Other".to_string()),
            ..Default::default()
        };
        assert!(!miss.matches(&msg));
        assert!(MatchSpec::default().matches(&msg));
    }

    #[test]
    fn reply_slot_takes_once() {
        let slot = ReplySlot::new(Instant::now() + Duration::from_secs(1));
        assert!(!slot.is_done());
        slot.fail(Error::new(ErrorKind::Timeout, "x"));
        assert!(slot.is_done());
        assert!(slot.take().unwrap().is_err());
        assert!(slot.take().is_none());

        // A late completion cannot displace the first outcome.
        let slot = ReplySlot::new(Instant::now() + Duration::from_secs(1));
        slot.fail(Error::new(ErrorKind::Cancelled, "x"));
        slot.fail(Error::new(ErrorKind::Timeout, "y"));
        match slot.take().unwrap() {
            Err(e) => assert_eq!(e.kind(), ErrorKind::Cancelled),
            Ok(_) => panic!("expected error"),
        }
    }
}
