//! One in-flight invocation: builds the wire request, awaits the reply, and
//! unmarshals it (or surfaces the error) into the captured invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::argument::MarshalCtx;
use crate::endpoint::{Endpoint, ReplySlot};
use crate::message::Message;
use crate::method::{Invocation, Method};
use crate::proxy::Proxy;
use crate::value::Value;
use crate::{Error, InterfaceName, MemberName};

/// A cancellation token carried by an invocation. Cancelling removes the
/// pending call and releases any blocked waiter with a cancelled error.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an uncancelled token.
    pub fn new() -> CancelToken { CancelToken::default() }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The terminal states of a method call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// The request message is being assembled.
    Building,
    /// The request was enqueued on the transport.
    Sent,
    /// A reply arrived and was unmarshalled.
    Completed,
    /// Marshalling, transport or the peer failed the call.
    Failed,
}

/// One in-flight invocation against a proxy's method.
pub struct MethodCall<'a> {
    proxy: &'a Proxy,
    method: Arc<Method>,
    timeout_ms: i32,
    cancel: CancelToken,
    state: CallState,
}

impl<'a> MethodCall<'a> {
    /// Creates a call of `method` on the proxy, inheriting the proxy's
    /// timeout.
    pub fn new(proxy: &'a Proxy, method: Arc<Method>) -> MethodCall<'a> {
        MethodCall {
            proxy,
            method,
            timeout_ms: proxy.timeout_ms(),
            cancel: CancelToken::new(),
            state: CallState::Building,
        }
    }

    /// Overrides the timeout; non-positive values mean the library default.
    pub fn with_timeout(mut self, ms: i32) -> MethodCall<'a> {
        self.timeout_ms = ms;
        self
    }

    /// The call's cancellation token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The call's current state.
    pub fn state(&self) -> CallState { self.state }

    /// Builds the request message and marshals the in-arguments. Failures
    /// here abort the call without any transport effect.
    fn build(&self, inv: &Invocation) -> Result<Message, Error> {
        let mut msg = Message::method_call(self.proxy.service(), self.proxy.path(),
            &InterfaceName::from(self.method.interface_name()),
            &MemberName::from(self.method.name()));
        {
            let mut ia = msg.iter_append();
            let ctx = MarshalCtx::for_proxy(self.proxy);
            self.method.marshal_arguments(inv, &mut ia, &ctx)?;
        }
        Ok(msg)
    }

    /// Issues the call and blocks for the reply.
    ///
    /// Oneway methods return immediately with the null sentinel and leave no
    /// pending entry behind. Error replies surface with their D-Bus error
    /// name preserved; exception-named errors keep their symbolic name.
    pub fn invoke(mut self, mut inv: Invocation) -> Result<Value, Error> {
        let msg = match self.build(&inv) {
            Ok(m) => m,
            Err(e) => {
                self.state = CallState::Failed;
                return Err(e);
            }
        };
        let ep = self.proxy.endpoint();
        if self.method.is_oneway() {
            msg.set_no_reply(true);
            match ep.send(msg) {
                Ok(_) => {
                    self.state = CallState::Completed;
                    return Ok(Value::Null);
                }
                Err(e) => {
                    self.state = CallState::Failed;
                    return Err(e);
                }
            }
        }
        self.state = CallState::Sent;
        let reply = match ep.call_blocking(msg, self.timeout_ms, Some(&self.cancel)) {
            Ok(r) => r,
            Err(e) => {
                self.state = CallState::Failed;
                return Err(e);
            }
        };
        let ctx = MarshalCtx::for_proxy(self.proxy);
        match self.method.unmarshal_return(&mut reply.iter_init(), &mut inv, &ctx) {
            Ok(()) => {
                self.state = CallState::Completed;
                Ok(inv.ret.take().unwrap_or(Value::Null))
            }
            Err(e) => {
                self.state = CallState::Failed;
                Err(e)
            }
        }
    }

    /// Issues the call and returns immediately with a future for the reply.
    pub fn invoke_async(mut self, inv: Invocation) -> Result<ReplyFuture, Error> {
        let msg = match self.build(&inv) {
            Ok(m) => m,
            Err(e) => {
                self.state = CallState::Failed;
                return Err(e);
            }
        };
        let ep = self.proxy.endpoint();
        if self.method.is_oneway() {
            msg.set_no_reply(true);
            ep.send(msg)?;
            self.state = CallState::Completed;
            return Ok(ReplyFuture {
                inner: FutureInner::Ready(Ok(Value::Null)),
                cancel: self.cancel,
            });
        }
        let slot = ep.call_async(msg, self.timeout_ms)?;
        self.state = CallState::Sent;
        Ok(ReplyFuture {
            inner: FutureInner::Pending {
                slot,
                endpoint: ep,
                method: self.method,
                ctx: MarshalCtx::for_proxy(self.proxy),
            },
            cancel: self.cancel,
        })
    }
}

enum FutureInner {
    Ready(Result<Value, Error>),
    Pending {
        slot: Arc<ReplySlot>,
        endpoint: Arc<Endpoint>,
        method: Arc<Method>,
        ctx: MarshalCtx,
    },
}

/// A placeholder for the reply of an asynchronous call.
///
/// Success fulfils the future with the boxed value; a remote error is
/// preserved and delivered only when the future is dereferenced with
/// [`wait`](ReplyFuture::wait).
pub struct ReplyFuture {
    inner: FutureInner,
    cancel: CancelToken,
}

impl ReplyFuture {
    /// Whether the reply (or its error) has already arrived.
    pub fn is_complete(&self) -> bool {
        match &self.inner {
            FutureInner::Ready(_) => true,
            FutureInner::Pending { slot, .. } => slot.is_done(),
        }
    }

    /// The future's cancellation token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Cancels the pending call; a subsequent wait reports cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let FutureInner::Pending { slot, endpoint, .. } = &self.inner {
            endpoint.cancel_slot(slot);
        }
    }

    /// Blocks until the reply arrives and unmarshals it.
    pub fn wait(self) -> Result<Value, Error> {
        match self.inner {
            FutureInner::Ready(r) => r,
            FutureInner::Pending { slot, endpoint, method, ctx } => {
                let reply = endpoint.wait_for(&slot, Some(&self.cancel))?;
                let mut inv = Invocation::default();
                method.unmarshal_return(&mut reply.iter_init(), &mut inv, &ctx)?;
                Ok(inv.ret.unwrap_or(Value::Null))
            }
        }
    }
}
