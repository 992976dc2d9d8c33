use crate::rt::object::ObjRef;
use crate::rt::value::{ObjectId, PrimitiveKind, PrimitiveValue, Value};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Uniform handle for one shared memory cell.
///
/// Equality is structural; the engine uses locations as index keys, the
/// driver uses `read`/`write` to keep the live heap in step with the chosen
/// execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    StaticField {
        class_name: Arc<str>,
        field_name: Arc<str>,
    },
    ObjectField {
        object_id: ObjectId,
        class_name: Arc<str>,
        field_name: Arc<str>,
    },
    ArrayElement {
        object_id: ObjectId,
        index: usize,
    },
    AtomicPrimitive {
        object_id: ObjectId,
    },
}

impl MemoryLocation {
    pub fn static_field(class_name: &str, field_name: &str) -> MemoryLocation {
        MemoryLocation::StaticField {
            class_name: class_name.into(),
            field_name: field_name.into(),
        }
    }

    pub fn object_field(object_id: ObjectId, class_name: &str, field_name: &str) -> MemoryLocation {
        MemoryLocation::ObjectField {
            object_id,
            class_name: class_name.into(),
            field_name: field_name.into(),
        }
    }

    pub fn array_element(object_id: ObjectId, index: usize) -> MemoryLocation {
        MemoryLocation::ArrayElement { object_id, index }
    }

    pub fn atomic(object_id: ObjectId) -> MemoryLocation {
        MemoryLocation::AtomicPrimitive { object_id }
    }

    /// The object owning the cell; `None` for statics.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            MemoryLocation::StaticField { .. } => None,
            MemoryLocation::ObjectField { object_id, .. }
            | MemoryLocation::ArrayElement { object_id, .. }
            | MemoryLocation::AtomicPrimitive { object_id } => Some(*object_id),
        }
    }

    /// Read the live value behind the location.
    ///
    /// Unset field slots yield the declared default (primitive zero, or null
    /// for references).
    pub fn read(&self, mapper: &dyn ObjectMapper) -> Result<Value, MemoryError> {
        match self {
            MemoryLocation::StaticField {
                class_name,
                field_name,
            } => match mapper.static_read(class_name, field_name) {
                Some(value) => Ok(value),
                None => field_default(mapper.classes(), class_name, field_name),
            },
            MemoryLocation::ObjectField {
                object_id,
                class_name,
                field_name,
            } => {
                let cell = resolve(mapper, *object_id)?;
                match cell.field(field_name) {
                    Some(value) => Ok(value),
                    None => field_default(mapper.classes(), class_name, field_name),
                }
            }
            MemoryLocation::ArrayElement { object_id, index } => {
                let cell = resolve(mapper, *object_id)?;
                cell.element(*index).ok_or(MemoryError::IndexOutOfBounds {
                    object_id: *object_id,
                    index: *index,
                    len: cell.len(),
                })
            }
            MemoryLocation::AtomicPrimitive { object_id } => {
                Ok(resolve(mapper, *object_id)?.atomic_value())
            }
        }
    }

    /// Store `value` into the live cell, narrowing primitives to the declared
    /// field width.
    pub fn write(&self, mapper: &dyn ObjectMapper, value: Value) -> Result<(), MemoryError> {
        match self {
            MemoryLocation::StaticField {
                class_name,
                field_name,
            } => {
                let value = fit(mapper.classes(), class_name, field_name, value)?;
                mapper.static_write(class_name, field_name, value);
                Ok(())
            }
            MemoryLocation::ObjectField {
                object_id,
                class_name,
                field_name,
            } => {
                let value = fit(mapper.classes(), class_name, field_name, value)?;
                resolve(mapper, *object_id)?.set_field(field_name, value);
                Ok(())
            }
            MemoryLocation::ArrayElement { object_id, index } => {
                let cell = resolve(mapper, *object_id)?;
                if cell.set_element(*index, value) {
                    Ok(())
                } else {
                    Err(MemoryError::IndexOutOfBounds {
                        object_id: *object_id,
                        index: *index,
                        len: cell.len(),
                    })
                }
            }
            MemoryLocation::AtomicPrimitive { object_id } => {
                resolve(mapper, *object_id)?.set_atomic_value(value);
                Ok(())
            }
        }
    }
}

impl fmt::Display for MemoryLocation {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLocation::StaticField {
                class_name,
                field_name,
            } => write!(fmt, "{}.{}", class_name, field_name),
            MemoryLocation::ObjectField {
                object_id,
                class_name,
                field_name,
            } => write!(fmt, "{}{}.{}", object_id, class_name, field_name),
            MemoryLocation::ArrayElement { object_id, index } => {
                write!(fmt, "{}[{}]", object_id, index)
            }
            MemoryLocation::AtomicPrimitive { object_id } => write!(fmt, "atomic {}", object_id),
        }
    }
}

fn resolve(mapper: &dyn ObjectMapper, id: ObjectId) -> Result<ObjRef, MemoryError> {
    mapper.resolve(id).ok_or(MemoryError::UnresolvedObject(id))
}

fn field_default(
    classes: &ClassTable,
    class_name: &str,
    field_name: &str,
) -> Result<Value, MemoryError> {
    let field =
        classes
            .resolve_field(class_name, field_name)
            .ok_or_else(|| MemoryError::UnknownField {
                class_name: class_name.to_string(),
                field_name: field_name.to_string(),
            })?;

    Ok(match field.kind {
        FieldKind::Primitive(kind) => Value::Primitive(PrimitiveValue::zero(kind)),
        FieldKind::Reference => Value::Null,
    })
}

fn fit(
    classes: &ClassTable,
    class_name: &str,
    field_name: &str,
    value: Value,
) -> Result<Value, MemoryError> {
    let field = match classes.resolve_field(class_name, field_name) {
        Some(field) => field,
        // Undeclared fields behave as reference slots.
        None => return Ok(value),
    };

    match (&field.kind, value) {
        (FieldKind::Reference, value) => Ok(value),
        (FieldKind::Primitive(kind), Value::Primitive(p)) => match p.coerce(*kind) {
            Some(p) => Ok(Value::Primitive(p)),
            None => Err(MemoryError::WidthMismatch {
                field_name: field_name.to_string(),
                expected: *kind,
                found: p.kind(),
            }),
        },
        (FieldKind::Primitive(kind), _) => Err(MemoryError::NonPrimitive {
            field_name: field_name.to_string(),
            expected: *kind,
        }),
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("object {0} is not mapped to a live value")]
    UnresolvedObject(ObjectId),
    #[error("no field {class_name}.{field_name} in any registered class")]
    UnknownField {
        class_name: String,
        field_name: String,
    },
    #[error("index {index} out of bounds for array {object_id} of length {len}")]
    IndexOutOfBounds {
        object_id: ObjectId,
        index: usize,
        len: usize,
    },
    #[error("field {field_name} holds {expected:?}, cannot store {found:?}")]
    WidthMismatch {
        field_name: String,
        expected: PrimitiveKind,
        found: PrimitiveKind,
    },
    #[error("field {field_name} holds {expected:?}, cannot store a reference")]
    NonPrimitive {
        field_name: String,
        expected: PrimitiveKind,
    },
}

/// Declared type of a field slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Primitive(PrimitiveKind),
    Reference,
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
}

/// Shape of one user class: named fields plus an optional superclass.
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    name: String,
    super_name: Option<String>,
    fields: Vec<FieldDescriptor>,
}

impl ClassDescriptor {
    pub fn new(name: &str) -> ClassDescriptor {
        ClassDescriptor {
            name: name.to_string(),
            super_name: None,
            fields: Vec::new(),
        }
    }

    pub fn extends(mut self, super_name: &str) -> ClassDescriptor {
        self.super_name = Some(super_name.to_string());
        self
    }

    pub fn field(mut self, name: &str, kind: FieldKind) -> ClassDescriptor {
        self.fields.push(FieldDescriptor {
            name: name.to_string(),
            kind,
        });
        self
    }

    pub fn field_i32(self, name: &str) -> ClassDescriptor {
        self.field(name, FieldKind::Primitive(PrimitiveKind::I32))
    }

    pub fn field_i64(self, name: &str) -> ClassDescriptor {
        self.field(name, FieldKind::Primitive(PrimitiveKind::I64))
    }

    pub fn field_bool(self, name: &str) -> ClassDescriptor {
        self.field(name, FieldKind::Primitive(PrimitiveKind::Bool))
    }

    pub fn field_ref(self, name: &str) -> ClassDescriptor {
        self.field(name, FieldKind::Reference)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registered class shapes with suffix-tolerant lookup.
///
/// Resolution tries the exact class first, then suffix matches (class-loader
/// decorated names keep resolving), walking superclasses at each step.
#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    classes: Vec<ClassDescriptor>,
}

impl ClassTable {
    pub fn new() -> ClassTable {
        ClassTable::default()
    }

    pub fn register(&mut self, class: ClassDescriptor) {
        self.classes.push(class);
    }

    fn find(&self, name: &str) -> Option<&ClassDescriptor> {
        self.classes
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.classes.iter().find(|c| suffix_match(&c.name, name)))
    }

    pub fn resolve_field(&self, class_name: &str, field_name: &str) -> Option<&FieldDescriptor> {
        let mut class = self.find(class_name)?;

        loop {
            if let Some(field) = class.fields.iter().find(|f| f.name == field_name) {
                return Some(field);
            }

            class = self.find(class.super_name.as_deref()?)?;
        }
    }
}

/// `true` when one dot-separated name is a suffix of the other on a segment
/// boundary.
fn suffix_match(a: &str, b: &str) -> bool {
    fn ends_on_boundary(long: &str, short: &str) -> bool {
        long.ends_with(short)
            && long[..long.len() - short.len()]
                .chars()
                .next_back()
                .map_or(true, |c| c == '.' || c == '$')
    }

    ends_on_boundary(a, b) || ends_on_boundary(b, a)
}

/// Resolves object ids to live receivers and owns the static area.
pub trait ObjectMapper: Send + Sync {
    fn resolve(&self, id: ObjectId) -> Option<ObjRef>;
    fn static_read(&self, class_name: &str, field_name: &str) -> Option<Value>;
    fn static_write(&self, class_name: &str, field_name: &str, value: Value);
    fn classes(&self) -> &ClassTable;
}

/// The driver's in-process heap: id to cell mapping plus the static area.
#[derive(Debug)]
pub struct SimHeap {
    classes: Arc<ClassTable>,
    statics: Mutex<HashMap<(String, String), Value>>,
    objects: Mutex<HashMap<ObjectId, ObjRef>>,
}

impl SimHeap {
    pub fn new(classes: ClassTable) -> SimHeap {
        SimHeap {
            classes: Arc::new(classes),
            statics: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn class_table(&self) -> Arc<ClassTable> {
        self.classes.clone()
    }

    pub fn insert(&self, id: ObjectId, value: ObjRef) {
        self.objects.lock().unwrap().insert(id, value);
    }

    /// Drop the previous run's state, keeping the given external bindings.
    pub fn reset(&self, keep: impl Iterator<Item = (ObjectId, ObjRef)>) {
        self.statics.lock().unwrap().clear();

        let mut objects = self.objects.lock().unwrap();
        objects.clear();
        objects.extend(keep);
    }
}

/// Root initializer: declared defaults only.
///
/// Must not consult the live heap, which trails the chosen execution; the
/// value a location held before the test is the declared zero (or null).
#[derive(Debug)]
pub struct TableInit {
    classes: Arc<ClassTable>,
}

impl TableInit {
    pub fn new(classes: Arc<ClassTable>) -> TableInit {
        TableInit { classes }
    }
}

impl crate::rt::label::MemoryInitializer for TableInit {
    fn initial_value(&self, location: &MemoryLocation) -> crate::rt::value::ValueId {
        use crate::rt::value::ValueId;

        let (class_name, field_name) = match location {
            MemoryLocation::StaticField {
                class_name,
                field_name,
            }
            | MemoryLocation::ObjectField {
                class_name,
                field_name,
                ..
            } => (class_name, field_name),
            // Arrays and atomics take their initial value from their
            // allocation event, never from the root.
            _ => return ValueId::Null,
        };

        match self.classes.resolve_field(class_name, field_name) {
            Some(FieldDescriptor {
                kind: FieldKind::Primitive(kind),
                ..
            }) => ValueId::Primitive(PrimitiveValue::zero(*kind)),
            _ => ValueId::Null,
        }
    }
}

/// Allocation initializer: a frozen copy of the cell taken at allocation
/// time, so later writes to the live cell cannot leak into initial values.
#[derive(Debug)]
pub struct CellSnapshot {
    frozen: ObjRef,
    classes: Arc<ClassTable>,
}

impl CellSnapshot {
    pub fn new(cell: &ObjRef, classes: Arc<ClassTable>) -> CellSnapshot {
        CellSnapshot {
            frozen: cell.snapshot(),
            classes,
        }
    }
}

impl crate::rt::label::MemoryInitializer for CellSnapshot {
    fn initial_value(&self, location: &MemoryLocation) -> crate::rt::value::ValueId {
        use crate::rt::value::ValueId;

        let value = match location {
            MemoryLocation::StaticField { .. } => return ValueId::Null,
            MemoryLocation::ObjectField {
                class_name,
                field_name,
                ..
            } => match self.frozen.field(field_name) {
                Some(value) => Some(value),
                None => {
                    return match self.classes.resolve_field(class_name, field_name) {
                        Some(FieldDescriptor {
                            kind: FieldKind::Primitive(kind),
                            ..
                        }) => ValueId::Primitive(PrimitiveValue::zero(*kind)),
                        _ => ValueId::Null,
                    }
                }
            },
            MemoryLocation::ArrayElement { index, .. } => self.frozen.element(*index),
            MemoryLocation::AtomicPrimitive { .. } => Some(self.frozen.atomic_value()),
        };

        match value {
            Some(Value::Primitive(p)) => ValueId::Primitive(p),
            _ => ValueId::Null,
        }
    }
}

impl ObjectMapper for SimHeap {
    fn resolve(&self, id: ObjectId) -> Option<ObjRef> {
        self.objects.lock().unwrap().get(&id).cloned()
    }

    fn static_read(&self, class_name: &str, field_name: &str) -> Option<Value> {
        self.statics
            .lock()
            .unwrap()
            .get(&(class_name.to_string(), field_name.to_string()))
            .cloned()
    }

    fn static_write(&self, class_name: &str, field_name: &str, value: Value) {
        self.statics
            .lock()
            .unwrap()
            .insert((class_name.to_string(), field_name.to_string()), value);
    }

    fn classes(&self) -> &ClassTable {
        &self.classes
    }
}
