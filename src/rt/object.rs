use crate::rt::event::EventId;
use crate::rt::value::{ObjectId, Value, ValueId, FIRST_OBJECT_ID};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;

/// A live heap cell the checker can hand back to instrumented code.
///
/// One cell backs every location flavor rooted at the object: named fields,
/// array elements and the single slot of an atomic wrapper.
pub struct ObjectCell {
    class_name: String,
    fields: Mutex<HashMap<String, Value>>,
    elements: Mutex<Vec<Value>>,
    atomic: Mutex<Value>,
}

pub type ObjRef = Arc<ObjectCell>;

impl ObjectCell {
    pub fn new(class_name: &str) -> ObjRef {
        Arc::new(ObjectCell {
            class_name: class_name.to_string(),
            fields: Mutex::new(HashMap::new()),
            elements: Mutex::new(Vec::new()),
            atomic: Mutex::new(Value::Null),
        })
    }

    pub fn array(class_name: &str, len: usize, fill: Value) -> ObjRef {
        let cell = ObjectCell::new(class_name);
        cell.elements.lock().unwrap().resize(len, fill);
        cell
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.lock().unwrap().get(name).cloned()
    }

    pub fn set_field(&self, name: &str, value: Value) {
        self.fields.lock().unwrap().insert(name.to_string(), value);
    }

    pub fn element(&self, index: usize) -> Option<Value> {
        self.elements.lock().unwrap().get(index).cloned()
    }

    pub fn set_element(&self, index: usize, value: Value) -> bool {
        let mut elements = self.elements.lock().unwrap();
        match elements.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.lock().unwrap().len()
    }

    /// A frozen copy of the cell's current contents.
    pub fn snapshot(&self) -> ObjRef {
        Arc::new(ObjectCell {
            class_name: self.class_name.clone(),
            fields: Mutex::new(self.fields.lock().unwrap().clone()),
            elements: Mutex::new(self.elements.lock().unwrap().clone()),
            atomic: Mutex::new(self.atomic.lock().unwrap().clone()),
        })
    }

    pub fn atomic_value(&self) -> Value {
        self.atomic.lock().unwrap().clone()
    }

    pub fn set_atomic_value(&self, value: Value) {
        *self.atomic.lock().unwrap() = value;
    }
}

impl fmt::Debug for ObjectCell {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ObjectCell")
            .field("class_name", &self.class_name)
            .finish()
    }
}

/// Registry entry for one tracked object.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub id: ObjectId,
    pub value: ObjRef,
    /// Event that brought the object into the execution; the root for
    /// external objects.
    pub allocation: EventId,
    /// `true` when the object predates the test and survives resets.
    pub external: bool,
}

/// Monotonic allocator of [`ObjectId`]s with identity-keyed lookup.
pub struct ObjectRegistry {
    next_id: ObjectId,
    by_identity: HashMap<usize, ObjectId>,
    entries: HashMap<ObjectId, ObjectEntry>,
}

impl ObjectRegistry {
    pub fn new() -> ObjectRegistry {
        ObjectRegistry {
            next_id: FIRST_OBJECT_ID,
            by_identity: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    fn allocate_id(&mut self) -> ObjectId {
        let id = self.next_id;
        self.next_id = self.next_id.next();
        id
    }

    /// Map a live value to its engine-side identity.
    ///
    /// Unknown objects are registered as external: their allocation is the
    /// root event, so every later access knows the object predates the test.
    pub fn compute_value_id(&mut self, value: &Value, root: EventId) -> ValueId {
        match value {
            Value::Null => ValueId::Null,
            Value::Primitive(p) => ValueId::Primitive(*p),
            Value::Object(obj) => {
                let key = Arc::as_ptr(obj) as usize;

                if let Some(id) = self.by_identity.get(&key) {
                    return ValueId::Object(*id);
                }

                let id = self.allocate_id();
                trace!(?id, class = obj.class_name(), "register external object");

                self.by_identity.insert(key, id);
                self.entries.insert(
                    id,
                    ObjectEntry {
                        id,
                        value: obj.clone(),
                        allocation: root,
                        external: true,
                    },
                );

                ValueId::Object(id)
            }
        }
    }

    /// Mint an id for an allocation about to be recorded.
    pub fn reserve_id(&mut self) -> ObjectId {
        self.allocate_id()
    }

    /// Bind a live cell to an id carried by an allocation event, either the
    /// one just reserved or one replayed from a previous run.
    pub fn rebind(&mut self, id: ObjectId, value: ObjRef, allocation: EventId) {
        assert!(
            !self.entries.contains_key(&id),
            "[weft internal bug] rebinding a live object id {}",
            id
        );
        self.bind(id, value, allocation, false);
    }

    fn bind(&mut self, id: ObjectId, value: ObjRef, allocation: EventId, external: bool) {
        self.by_identity.insert(Arc::as_ptr(&value) as usize, id);
        self.entries.insert(
            id,
            ObjectEntry {
                id,
                value,
                allocation,
                external,
            },
        );
    }

    pub fn entry(&self, id: ObjectId) -> Option<&ObjectEntry> {
        self.entries.get(&id)
    }

    /// Resolve an id back to the live value.
    pub fn get_value(&self, id: ValueId) -> Option<Value> {
        match id {
            ValueId::Null => Some(Value::Null),
            ValueId::Primitive(p) => Some(Value::Primitive(p)),
            ValueId::Object(id) => self.entries.get(&id).map(|e| Value::Object(e.value.clone())),
        }
    }

    /// Event that brought the object into the execution.
    pub fn allocation_of(&self, id: ObjectId) -> Option<EventId> {
        self.entries.get(&id).map(|e| e.allocation)
    }

    /// Live bindings that predate the test.
    pub fn external_entries(&self) -> Vec<(ObjectId, ObjRef)> {
        self.entries
            .values()
            .filter(|e| e.external)
            .map(|e| (e.id, e.value.clone()))
            .collect()
    }

    /// Drop everything allocated during the aborted exploration; external
    /// objects survive.
    pub fn retain_external(&mut self) {
        let entries = &mut self.entries;
        let by_identity = &mut self.by_identity;

        entries.retain(|_, e| e.external);
        by_identity.retain(|_, id| entries.contains_key(id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ObjectRegistry")
            .field("next_id", &self.next_id)
            .field("entries", &self.entries.len())
            .finish()
    }
}
