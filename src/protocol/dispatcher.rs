//! Type-keyed message dispatcher.
//!
//! Handlers subscribe to a concrete message type and are invoked in insertion
//! order for every inbound message of exactly that type. The table is guarded by
//! a short-held mutex: dispatch copies the handler list for one type, releases
//! the lock, then invokes. A handler removed while a dispatch is in flight may
//! therefore still run once for that message.
//!
//! Handler failures are isolated: an `Err` or a panic is logged and counted,
//! and the remaining handlers still run.

use crate::core::message::{Envelope, Message};
use crate::error::{ProtocolError, Result};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

type ErasedFn<S> = dyn Fn(&S, &dyn Any) -> Result<()> + Send + Sync;

fn erase<S, M, F>(f: F) -> Arc<ErasedFn<S>>
where
    S: 'static,
    M: Message,
    F: Fn(&S, &M) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |sender: &S, body: &dyn Any| match body.downcast_ref::<M>() {
        Some(message) => f(sender, message),
        None => Err(ProtocolError::UnexpectedMessage),
    })
}

/// Who a subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerId {
    /// Free-standing handlers with no owning object.
    Static,
    /// An object identified by its address.
    Address(usize),
    /// An explicitly allocated token.
    Token(u64),
}

impl OwnerId {
    pub const STATIC: OwnerId = OwnerId::Static;

    /// Identity of a live object; stable while the object is not moved.
    pub fn of<T: ?Sized>(owner: &T) -> Self {
        OwnerId::Address(owner as *const T as *const () as usize)
    }

    /// A fresh token distinct from every other token in the process.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        OwnerId::Token(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of a callback instance: the address of its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HandlerKey(usize);

impl HandlerKey {
    fn of<S>(f: &Arc<ErasedFn<S>>) -> Self {
        HandlerKey(Arc::as_ptr(f) as *const () as usize)
    }
}

/// A typed callback. Clones share identity, so the handle used to `add` can be
/// used to `remove`.
pub struct Handler<S, M> {
    f: Arc<ErasedFn<S>>,
    _message: PhantomData<fn(&M)>,
}

impl<S: 'static, M: Message> Handler<S, M> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&S, &M) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            f: erase::<S, M, F>(f),
            _message: PhantomData,
        }
    }

    fn key(&self) -> HandlerKey {
        HandlerKey::of(&self.f)
    }
}

impl<S, M> Clone for Handler<S, M> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
            _message: PhantomData,
        }
    }
}

impl<S, M> fmt::Debug for Handler<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("message", &std::any::type_name::<M>())
            .finish()
    }
}

struct Binding<S> {
    type_id: TypeId,
    name: &'static str,
    key: HandlerKey,
    f: Arc<ErasedFn<S>>,
}

/// The handlers a [`HandlerContainer`] exposes.
pub struct HandlerSet<S> {
    bindings: Vec<Binding<S>>,
}

impl<S: 'static> Default for HandlerSet<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> HandlerSet<S> {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Bind `f` to messages of type `M`. Every call is a distinct handler,
    /// even for closures of the same type.
    pub fn on<M, F>(mut self, f: F) -> Self
    where
        M: Message,
        F: Fn(&S, &M) -> Result<()> + Send + Sync + 'static,
    {
        let f = erase::<S, M, F>(f);
        self.bindings.push(Binding {
            type_id: TypeId::of::<M>(),
            name: M::name(),
            key: HandlerKey::of(&f),
            f,
        });
        self
    }

    /// Bind an existing handler; its clones keep the same identity.
    pub fn handler<M: Message>(mut self, handler: &Handler<S, M>) -> Self {
        self.bindings.push(Binding {
            type_id: TypeId::of::<M>(),
            name: M::name(),
            key: handler.key(),
            f: Arc::clone(&handler.f),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// An object that registers several handlers at once.
///
/// ```rust
/// use secure_channel::protocol::dispatcher::{Dispatcher, HandlerContainer, HandlerSet};
/// use secure_channel::core::message::Message;
/// use serde::{Deserialize, Serialize};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping;
/// impl Message for Ping {}
///
/// #[derive(Default)]
/// struct Counter(AtomicUsize);
///
/// impl HandlerContainer<()> for Counter {
///     fn bindings(self: Arc<Self>) -> HandlerSet<()> {
///         HandlerSet::new().on(move |_: &(), _: &Ping| {
///             self.0.fetch_add(1, Ordering::SeqCst);
///             Ok(())
///         })
///     }
/// }
///
/// let counter = Arc::new(Counter::default());
/// let dispatcher = Dispatcher::with_container(&counter).unwrap();
/// dispatcher.dispatch_message(&(), &Ping);
/// assert_eq!(counter.0.load(Ordering::SeqCst), 1);
/// ```
pub trait HandlerContainer<S>: Send + Sync + 'static {
    fn bindings(self: Arc<Self>) -> HandlerSet<S>;
}

struct Entry<S> {
    owner: OwnerId,
    key: HandlerKey,
    f: Arc<ErasedFn<S>>,
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers invoked, failed ones included.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

/// Routes messages to the handlers registered for their exact type.
///
/// `S` is the sender handed to every callback; channels use themselves.
pub struct Dispatcher<S> {
    entries: Mutex<HashMap<TypeId, Vec<Entry<S>>>>,
    names: Mutex<HashMap<TypeId, &'static str>>,
}

impl<S: 'static> Default for Dispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count: usize = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum();
        f.debug_struct("Dispatcher")
            .field("handlers", &count)
            .finish()
    }
}

impl<S: 'static> Dispatcher<S> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
        }
    }

    /// Build a dispatcher pre-populated from a container.
    ///
    /// # Errors
    /// `EmptyContainer` when the container exposes no handlers.
    pub fn with_container<C: HandlerContainer<S>>(container: &Arc<C>) -> Result<Self> {
        let dispatcher = Self::new();
        if dispatcher.add_container(container)? == 0 {
            return Err(ProtocolError::EmptyContainer);
        }
        Ok(dispatcher)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<TypeId, Vec<Entry<S>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember_name(&self, type_id: TypeId, name: &'static str) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_id, name);
    }

    /// Subscribe `handler` to messages of type `M` on behalf of `owner`.
    ///
    /// # Errors
    /// `DuplicateHandler` when the same owner already registered this handler.
    pub fn add<M: Message>(&self, owner: OwnerId, handler: &Handler<S, M>) -> Result<()> {
        let key = handler.key();
        let mut table = self.table();
        let list = table.entry(TypeId::of::<M>()).or_default();
        if list.iter().any(|e| e.owner == owner && e.key == key) {
            return Err(ProtocolError::DuplicateHandler(M::name()));
        }
        list.push(Entry {
            owner,
            key,
            f: Arc::clone(&handler.f),
        });
        drop(table);

        self.remember_name(TypeId::of::<M>(), M::name());
        debug!(message_type = M::name(), ?owner, "Handler added");
        Ok(())
    }

    /// Unsubscribe one handler; `false` when it was not registered.
    pub fn remove<M: Message>(&self, owner: OwnerId, handler: &Handler<S, M>) -> bool {
        let key = handler.key();
        let mut table = self.table();
        let Some(list) = table.get_mut(&TypeId::of::<M>()) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| !(e.owner == owner && e.key == key));
        let removed = list.len() != before;
        if list.is_empty() {
            table.remove(&TypeId::of::<M>());
        }
        removed
    }

    /// Drop every handler for `M`; `false` when there were none.
    pub fn remove_all<M: Message>(&self) -> bool {
        self.table().remove(&TypeId::of::<M>()).is_some()
    }

    pub fn clear(&self) {
        self.table().clear();
    }

    pub fn count<M: Message>(&self) -> usize {
        self.table().get(&TypeId::of::<M>()).map_or(0, Vec::len)
    }

    pub fn count_all(&self) -> usize {
        self.table().values().map(Vec::len).sum()
    }

    /// Register every handler a container exposes, owned by the container.
    ///
    /// Either all bindings are added or none are.
    ///
    /// # Errors
    /// `DuplicateHandler` when the container is already registered or the set
    /// binds one handler twice for the same type.
    pub fn add_container<C: HandlerContainer<S>>(&self, container: &Arc<C>) -> Result<usize> {
        let owner = OwnerId::of(&**container);
        let set = Arc::clone(container).bindings();

        let mut table = self.table();
        if let Some(first) = set.bindings.first() {
            if table.values().flatten().any(|e| e.owner == owner) {
                return Err(ProtocolError::DuplicateHandler(first.name));
            }
        }
        for (i, binding) in set.bindings.iter().enumerate() {
            let repeated = set.bindings[..i]
                .iter()
                .any(|b| b.type_id == binding.type_id && b.key == binding.key);
            if repeated {
                return Err(ProtocolError::DuplicateHandler(binding.name));
            }
        }

        let added = set.bindings.len();
        let mut names = Vec::with_capacity(added);
        for binding in set.bindings {
            names.push((binding.type_id, binding.name));
            table.entry(binding.type_id).or_default().push(Entry {
                owner,
                key: binding.key,
                f: binding.f,
            });
        }
        drop(table);

        for (type_id, name) in names {
            self.remember_name(type_id, name);
        }
        debug!(?owner, handlers = added, "Handler container added");
        Ok(added)
    }

    /// Remove everything a container registered; returns how many handlers went.
    pub fn remove_container<C: HandlerContainer<S>>(&self, container: &Arc<C>) -> usize {
        let owner = OwnerId::of(&**container);
        let mut table = self.table();
        let mut removed = 0;
        table.retain(|_, list| {
            let before = list.len();
            list.retain(|e| e.owner != owner);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Invoke every handler for the envelope's type; returns how many ran.
    pub fn dispatch(&self, sender: &S, envelope: &Envelope) -> usize {
        self.dispatch_report(sender, envelope).invoked
    }

    /// Typed convenience for locally constructed messages.
    pub fn dispatch_message<M: Message>(&self, sender: &S, message: &M) -> usize {
        self.invoke(sender, TypeId::of::<M>(), M::name(), message)
            .invoked
    }

    /// Like [`dispatch`](Self::dispatch) but also reports failures.
    pub fn dispatch_report(&self, sender: &S, envelope: &Envelope) -> DispatchReport {
        self.invoke(sender, envelope.type_id(), envelope.name(), envelope.body())
    }

    fn invoke(
        &self,
        sender: &S,
        type_id: TypeId,
        name: &'static str,
        body: &dyn Any,
    ) -> DispatchReport {
        let snapshot: Vec<Arc<ErasedFn<S>>> = match self.table().get(&type_id) {
            Some(list) => list.iter().map(|e| Arc::clone(&e.f)).collect(),
            None => Vec::new(),
        };

        let mut report = DispatchReport::default();
        if snapshot.is_empty() {
            debug!(message_type = name, "No handlers registered");
            return report;
        }

        for f in snapshot {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| f(sender, body))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(message_type = name, error = %e, "Handler failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    error!(message_type = name, %reason, "Handler panicked");
                }
            }
        }
        report
    }

    /// Names of the message types that currently have handlers.
    pub fn subscribed_types(&self) -> Vec<&'static str> {
        let names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        let mut subscribed: Vec<_> = self
            .table()
            .keys()
            .filter_map(|type_id| names.get(type_id).copied())
            .collect();
        subscribed.sort_unstable();
        subscribed
    }
}
