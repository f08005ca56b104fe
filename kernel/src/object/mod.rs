//! Kernel object arena.
//!
//! Every kernel object lives in a single arena keyed by a monotonically increasing `ObjectId`.
//! Handles and internal strong references bump the object's reference count, and the object is
//! destroyed when the count drops to zero. Back references between objects (mutex owner, peer
//! session, waiters) are plain ids and never keep anything alive.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;

use crate::process::{KProcess, LimitCategory};
use crate::session::{KClientPort, KClientSession, KServerPort, KServerSession};
use crate::shared_memory::KSharedMemory;
use crate::sync::{KAddressArbiter, KConditionVariable, KEvent, KMutex, KSemaphore, KTimer};
use crate::thread::KThread;
use crate::wait::WaitQueue;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(NonZeroU32);

impl ObjectId {
    pub fn from_raw(value: u32) -> Option<ObjectId> {
        NonZeroU32::new(value).map(ObjectId)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0.get())
    }
}

pub type ThreadId = ObjectId;
pub type ProcessId = ObjectId;

/// Conversion between a concrete object type and the closed `KObject` enum.
pub trait KObjectData: Sized + 'static {
    const KIND: ObjectKind;

    fn from_object(object: &KObject) -> Option<&Self>;
    fn from_object_mut(object: &mut KObject) -> Option<&mut Self>;
    fn into_object(self) -> KObject;
}

macro_rules! kernel_objects {
    ($($variant:ident($ty:ty)),* $(,)*) => {
        pub enum KObject {
            $($variant($ty)),*
        }

        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum ObjectKind {
            $($variant),*
        }

        impl KObject {
            pub fn kind(&self) -> ObjectKind {
                match self {
                    $(KObject::$variant(..) => ObjectKind::$variant),*
                }
            }
        }

        $(
            impl KObjectData for $ty {
                const KIND: ObjectKind = ObjectKind::$variant;

                fn from_object(object: &KObject) -> Option<&Self> {
                    match object {
                        KObject::$variant(data) => Some(data),
                        _ => None,
                    }
                }

                fn from_object_mut(object: &mut KObject) -> Option<&mut Self> {
                    match object {
                        KObject::$variant(data) => Some(data),
                        _ => None,
                    }
                }

                fn into_object(self) -> KObject {
                    KObject::$variant(self)
                }
            }
        )*
    };
}

kernel_objects! {
    Process(KProcess),
    Thread(KThread),
    Mutex(KMutex),
    Semaphore(KSemaphore),
    Event(KEvent),
    Timer(KTimer),
    ConditionVariable(KConditionVariable),
    AddressArbiter(KAddressArbiter),
    SharedMemory(KSharedMemory),
    ServerPort(KServerPort),
    ClientPort(KClientPort),
    ServerSession(KServerSession),
    ClientSession(KClientSession),
}

impl ObjectKind {
    /// Whether threads can block on objects of this kind with WaitSynchronization.
    pub fn is_waitable(self) -> bool {
        match self {
            ObjectKind::Process |
            ObjectKind::Thread |
            ObjectKind::Mutex |
            ObjectKind::Semaphore |
            ObjectKind::Event |
            ObjectKind::Timer |
            ObjectKind::ServerPort |
            ObjectKind::ServerSession => true,
            ObjectKind::ConditionVariable |
            ObjectKind::AddressArbiter |
            ObjectKind::SharedMemory |
            ObjectKind::ClientPort |
            ObjectKind::ClientSession => false,
        }
    }
}

impl KObject {
    pub fn wait_queue(&self) -> Option<&WaitQueue> {
        match self {
            KObject::Process(process) => Some(&process.waiters),
            KObject::Thread(thread) => Some(&thread.waiters),
            KObject::Mutex(mutex) => Some(&mutex.waiters),
            KObject::Semaphore(semaphore) => Some(&semaphore.waiters),
            KObject::Event(event) => Some(&event.waiters),
            KObject::Timer(timer) => Some(&timer.waiters),
            KObject::ServerPort(port) => Some(&port.waiters),
            KObject::ServerSession(session) => Some(&session.waiters),
            _ => None,
        }
    }

    pub fn wait_queue_mut(&mut self) -> Option<&mut WaitQueue> {
        match self {
            KObject::Process(process) => Some(&mut process.waiters),
            KObject::Thread(thread) => Some(&mut thread.waiters),
            KObject::Mutex(mutex) => Some(&mut mutex.waiters),
            KObject::Semaphore(semaphore) => Some(&mut semaphore.waiters),
            KObject::Event(event) => Some(&mut event.waiters),
            KObject::Timer(timer) => Some(&mut timer.waiters),
            KObject::ServerPort(port) => Some(&mut port.waiters),
            KObject::ServerSession(session) => Some(&mut session.waiters),
            _ => None,
        }
    }
}

impl fmt::Debug for KObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KObject::{:?}", self.kind())
    }
}

/// A resource limit reservation released when the object is destroyed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResourceCharge {
    pub process: ProcessId,
    pub category: LimitCategory,
    pub amount: u64,
}

struct ObjectEntry {
    refcount: u32,
    charge: Option<ResourceCharge>,
    object: KObject,
}

/// An object whose last reference went away, handed back so its destruction hooks can run.
pub struct DestroyedObject {
    pub id: ObjectId,
    pub charge: Option<ResourceCharge>,
    pub object: KObject,
}

pub struct ObjectManager {
    next_id: u32,
    objects: BTreeMap<ObjectId, ObjectEntry>,
}

impl ObjectManager {
    pub fn new() -> ObjectManager {
        ObjectManager {
            next_id: 1,
            objects: BTreeMap::new(),
        }
    }

    fn allocate_id(&mut self) -> ObjectId {
        let id = ObjectId::from_raw(self.next_id).expect("Object id space exhausted");
        self.next_id = self.next_id.checked_add(1).expect("Object id space exhausted");
        id
    }

    /// Inserts a new object with a single reference owned by the caller.
    pub fn insert<T: KObjectData>(&mut self, data: T) -> ObjectId {
        self.insert_charged(data, None)
    }

    pub fn insert_charged<T: KObjectData>(&mut self, data: T, charge: Option<ResourceCharge>) -> ObjectId {
        let id = self.allocate_id();
        self.objects.insert(id, ObjectEntry {
            refcount: 1,
            charge,
            object: data.into_object(),
        });
        id
    }

    /// Inserts an object built from its own id, for objects that need to know where they live.
    pub fn insert_with<T: KObjectData>(&mut self, f: impl FnOnce(ObjectId) -> T) -> ObjectId {
        let id = self.allocate_id();
        self.objects.insert(id, ObjectEntry {
            refcount: 1,
            charge: None,
            object: f(id).into_object(),
        });
        id
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn get<T: KObjectData>(&self, id: ObjectId) -> Option<&T> {
        self.objects.get(&id).and_then(|entry| T::from_object(&entry.object))
    }

    pub fn get_mut<T: KObjectData>(&mut self, id: ObjectId) -> Option<&mut T> {
        self.objects.get_mut(&id).and_then(|entry| T::from_object_mut(&mut entry.object))
    }

    pub fn get_raw(&self, id: ObjectId) -> Option<&KObject> {
        self.objects.get(&id).map(|entry| &entry.object)
    }

    pub fn get_raw_mut(&mut self, id: ObjectId) -> Option<&mut KObject> {
        self.objects.get_mut(&id).map(|entry| &mut entry.object)
    }

    pub fn kind(&self, id: ObjectId) -> Option<ObjectKind> {
        self.get_raw(id).map(KObject::kind)
    }

    pub fn retain(&mut self, id: ObjectId) {
        let entry = self.objects.get_mut(&id).unwrap_or_else(|| panic!("Retaining destroyed object {:?}", id));
        entry.refcount += 1;
    }

    /// Drops one reference. Returns the object once the last reference is gone.
    pub fn release(&mut self, id: ObjectId) -> Option<DestroyedObject> {
        let entry = self.objects.get_mut(&id).unwrap_or_else(|| panic!("Releasing destroyed object {:?}", id));
        assert!(entry.refcount > 0, "Object {:?} has no references left", id);
        entry.refcount -= 1;
        if entry.refcount == 0 {
            let entry = self.objects.remove(&id)?;
            Some(DestroyedObject {
                id,
                charge: entry.charge,
                object: entry.object,
            })
        } else {
            None
        }
    }

    pub fn refcount(&self, id: ObjectId) -> u32 {
        self.objects.get(&id).map(|entry| entry.refcount).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids_of_kind(&self, kind: ObjectKind) -> Vec<ObjectId> {
        self.objects.iter()
            .filter(|(_, entry)| entry.object.kind() == kind)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl Default for ObjectManager {
    fn default() -> Self {
        ObjectManager::new()
    }
}
