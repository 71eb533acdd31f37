//! Reference-counted, layered objects.
//!
//! Every OMAPI entity (connection, protocol, listener, message, generic
//! object) is an [`Object`]: a shared handle to a cell holding the concrete
//! behaviour plus the bookkeeping the protocol needs.
//!
//! Objects stack into simple chains through `inner`/`outer` links. A request
//! that a layer does not implement falls through to its inner object, so a
//! pass-through layer (a listener, a protocol) still takes part correctly in
//! a stack it has nothing to add to.
//!
//! ## Ownership
//!
//! Cloning an `Object` acquires a reference and dropping it releases one.
//! Those are the only *owning* references. The links between layers and the
//! entry in a [`HandleTable`](crate::handle::HandleTable) are *structural*:
//! they keep the backing storage reachable but never keep a chain alive on
//! their own. When the last owner anywhere in a chain goes away, the whole
//! chain is unlinked, each layer's [`ObjectBehavior::destroy`] hook runs
//! exactly once, and published handles are withdrawn.

use crate::generic::GenericObject;
use crate::handle::PublishedHandle;
use crate::value::{TypedData, ValueWriter};
use omapi_types::{OmapiError, OmapiResult};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Serializes link changes and teardown decisions across all chains.
static CHAIN_LOCK: Mutex<()> = Mutex::new(());

fn chain_lock() -> MutexGuard<'static, ()> {
    CHAIN_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// A named notification delivered to an object and passed inward when the
/// object does not handle it.
#[derive(Debug)]
pub enum Signal<'a> {
    /// A listener accepted a connection; the argument is the new connection.
    Connect(&'a Object),
    /// A byte requirement armed on the connection has been satisfied.
    Ready,
    /// The connection underneath has closed.
    Disconnect,
    /// Any other named signal.
    Custom {
        name: &'a str,
        arg: Option<&'a Object>,
    },
}

impl Signal<'_> {
    pub fn name(&self) -> &str {
        match self {
            Signal::Connect(_) => "connect",
            Signal::Ready => "ready",
            Signal::Disconnect => "disconnect",
            Signal::Custom { name, .. } => name,
        }
    }
}

/// The capability table of a concrete object type.
///
/// Every method except [`type_name`](Self::type_name) has a default that
/// forwards the request to the inner object, reporting
/// [`OmapiError::NotFound`] once the chain ends (`stuff_values` simply writes
/// nothing). Implementations override what they handle and call the
/// matching `Object::pass_*` method for the rest.
pub trait ObjectBehavior: Send + Sync + 'static {
    fn type_name(&self) -> &'static str;

    fn set_value(&self, this: &Object, name: &str, value: TypedData) -> OmapiResult<()> {
        this.pass_set_value(name, value)
    }

    fn get_value(&self, this: &Object, name: &str) -> OmapiResult<TypedData> {
        this.pass_get_value(name)
    }

    fn signal(&self, this: &Object, signal: &Signal<'_>) -> OmapiResult<()> {
        this.pass_signal(signal)
    }

    /// Write this object's published name/value pairs.
    fn stuff_values(&self, this: &Object, out: &mut ValueWriter<'_>) -> OmapiResult<()> {
        this.pass_stuff_values(out)
    }

    /// Called once when the chain holding this object is torn down.
    fn destroy(&self) {}
}

pub(crate) struct ObjectCell {
    behavior: Arc<dyn ObjectBehavior>,
    any: Arc<dyn Any + Send + Sync>,
    owners: AtomicUsize,
    links: Mutex<Links>,
}

#[derive(Default)]
struct Links {
    inner: Option<Arc<ObjectCell>>,
    outer: Option<Arc<ObjectCell>>,
    handle: Option<PublishedHandle>,
    destroyed: bool,
}

impl ObjectCell {
    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn owners(&self) -> usize {
        self.owners.load(Ordering::Acquire)
    }
}

/// An owning reference to an OMAPI object.
pub struct Object {
    cell: Arc<ObjectCell>,
}

impl Object {
    /// Create an object of a concrete type, holding one reference.
    pub fn create<T: ObjectBehavior>(value: T) -> Object {
        let value = Arc::new(value);
        let cell = ObjectCell {
            behavior: value.clone(),
            any: value,
            owners: AtomicUsize::new(1),
            links: Mutex::new(Links::default()),
        };
        Object {
            cell: Arc::new(cell),
        }
    }

    /// Create an untyped object that stores whatever values are set on it.
    pub fn generic() -> Object {
        Object::create(GenericObject::default())
    }

    /// Turn a structural pointer into an owning reference.
    ///
    /// Callers must hold the chain lock and know the cell is not destroyed.
    fn acquire(cell: &Arc<ObjectCell>) -> Object {
        cell.owners.fetch_add(1, Ordering::AcqRel);
        Object { cell: cell.clone() }
    }

    /// Owning reference from a structural pointer, unless the object is gone.
    pub(crate) fn revive(cell: &Arc<ObjectCell>) -> Option<Object> {
        let _chain = chain_lock();
        if cell.links().destroyed {
            return None;
        }
        Some(Object::acquire(cell))
    }

    pub(crate) fn cell(&self) -> &Arc<ObjectCell> {
        &self.cell
    }

    pub fn type_name(&self) -> &'static str {
        self.cell.behavior.type_name()
    }

    /// Borrow the concrete type behind this object.
    pub fn downcast_ref<T: ObjectBehavior>(&self) -> Option<&T> {
        self.cell.any.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Published handle, or 0 if the object was never published.
    pub fn handle(&self) -> u32 {
        self.cell.links().handle.as_ref().map_or(0, PublishedHandle::id)
    }

    /// Assign a handle under the chain lock unless one is already set.
    pub(crate) fn assign_handle(&self, publish: impl FnOnce() -> PublishedHandle) -> u32 {
        let _chain = chain_lock();
        let mut links = self.cell.links();
        if let Some(handle) = &links.handle {
            return handle.id();
        }
        let handle = publish();
        let id = handle.id();
        links.handle = Some(handle);
        id
    }

    /// The object this one wraps.
    pub fn inner(&self) -> Option<Object> {
        let _chain = chain_lock();
        let links = self.cell.links();
        links.inner.as_ref().map(Object::acquire)
    }

    /// The object wrapping this one.
    pub fn outer(&self) -> Option<Object> {
        let _chain = chain_lock();
        let links = self.cell.links();
        links.outer.as_ref().map(Object::acquire)
    }

    /// Owners plus structural references (inner link, outer link, handle).
    pub fn ref_count(&self) -> usize {
        let _chain = chain_lock();
        let links = self.cell.links();
        self.cell.owners()
            + usize::from(links.inner.is_some())
            + usize::from(links.outer.is_some())
            + usize::from(links.handle.is_some())
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject {
            cell: Arc::downgrade(&self.cell),
        }
    }

    /// Layer `outer` on top of `inner`.
    ///
    /// Both slots must be empty and the two objects must not already share
    /// a chain.
    pub fn link(outer: &Object, inner: &Object) -> OmapiResult<()> {
        if outer.ptr_eq(inner) {
            return Err(OmapiError::InvalidArgument(
                "cannot layer an object on itself".into(),
            ));
        }
        let _chain = chain_lock();
        if chain_members(&outer.cell)
            .iter()
            .any(|member| Arc::ptr_eq(member, &inner.cell))
        {
            return Err(OmapiError::InvalidArgument(
                "objects already share a chain".into(),
            ));
        }
        let mut outer_links = outer.cell.links();
        if outer_links.inner.is_some() {
            return Err(OmapiError::InvalidArgument(format!(
                "{} object already wraps an inner object",
                outer.type_name()
            )));
        }
        let mut inner_links = inner.cell.links();
        if inner_links.outer.is_some() {
            return Err(OmapiError::InvalidArgument(format!(
                "{} object is already wrapped",
                inner.type_name()
            )));
        }
        outer_links.inner = Some(inner.cell.clone());
        inner_links.outer = Some(outer.cell.clone());
        Ok(())
    }

    /// Detach this object's inner layer.
    ///
    /// The detached half is released like any other reference, so it is torn
    /// down if nothing else owns it.
    pub fn unlink_inner(&self) {
        let detached = {
            let _chain = chain_lock();
            let Some(inner) = self.cell.links().inner.take() else {
                return;
            };
            inner.links().outer = None;
            Object::acquire(&inner)
        };
        drop(detached);
    }

    pub fn set_value(&self, name: &str, value: TypedData) -> OmapiResult<()> {
        self.cell.behavior.set_value(self, name, value)
    }

    pub fn get_value(&self, name: &str) -> OmapiResult<TypedData> {
        self.cell.behavior.get_value(self, name)
    }

    pub fn signal(&self, signal: &Signal<'_>) -> OmapiResult<()> {
        self.cell.behavior.signal(self, signal)
    }

    pub fn stuff_values(&self, out: &mut ValueWriter<'_>) -> OmapiResult<()> {
        self.cell.behavior.stuff_values(self, out)
    }

    pub fn pass_set_value(&self, name: &str, value: TypedData) -> OmapiResult<()> {
        match self.inner() {
            Some(inner) => inner.set_value(name, value),
            None => Err(OmapiError::NotFound(name.to_string())),
        }
    }

    pub fn pass_get_value(&self, name: &str) -> OmapiResult<TypedData> {
        match self.inner() {
            Some(inner) => inner.get_value(name),
            None => Err(OmapiError::NotFound(name.to_string())),
        }
    }

    pub fn pass_signal(&self, signal: &Signal<'_>) -> OmapiResult<()> {
        match self.inner() {
            Some(inner) => inner.signal(signal),
            None => Err(OmapiError::NotFound(format!("signal {}", signal.name()))),
        }
    }

    pub fn pass_stuff_values(&self, out: &mut ValueWriter<'_>) -> OmapiResult<()> {
        match self.inner() {
            Some(inner) => inner.stuff_values(out),
            None => Ok(()),
        }
    }
}

impl Clone for Object {
    fn clone(&self) -> Self {
        self.cell.owners.fetch_add(1, Ordering::AcqRel);
        Object {
            cell: self.cell.clone(),
        }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        release(&self.cell);
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Object {}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("type", &self.type_name())
            .field("handle", &self.handle())
            .finish()
    }
}

/// A non-owning pointer to an object, used by tasks that must not keep a
/// chain alive.
#[derive(Clone)]
pub struct WeakObject {
    cell: Weak<ObjectCell>,
}

impl WeakObject {
    pub fn upgrade(&self) -> Option<Object> {
        let cell = self.cell.upgrade()?;
        Object::revive(&cell)
    }

    pub fn is_destroyed(&self) -> bool {
        match self.cell.upgrade() {
            Some(cell) => cell.links().destroyed,
            None => true,
        }
    }
}

/// `cell` followed by every object reachable through inner links, then every
/// object reachable through outer links. Caller holds the chain lock.
fn chain_members(cell: &Arc<ObjectCell>) -> Vec<Arc<ObjectCell>> {
    let mut members = vec![cell.clone()];
    let mut next = cell.links().inner.clone();
    while let Some(member) = next {
        next = member.links().inner.clone();
        members.push(member);
    }
    let mut next = cell.links().outer.clone();
    while let Some(member) = next {
        next = member.links().outer.clone();
        members.push(member);
    }
    members
}

fn release(cell: &Arc<ObjectCell>) {
    if cell.owners.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }

    let doomed = {
        let _chain = chain_lock();
        if cell.links().destroyed {
            return;
        }
        let members = chain_members(cell);
        if members.iter().any(|member| member.owners() > 0) {
            return;
        }
        members
            .into_iter()
            .map(|member| {
                let handle = {
                    let mut links = member.links();
                    links.destroyed = true;
                    links.inner = None;
                    links.outer = None;
                    links.handle.take()
                };
                (member, handle)
            })
            .collect::<Vec<_>>()
    };

    // Hooks run outside the chain lock: they may drop other objects.
    for (member, handle) in &doomed {
        if let Some(handle) = handle {
            handle.unpublish();
        }
        member.behavior.destroy();
    }
}
