use crate::rt::object::ObjRef;

use std::fmt;
use std::sync::Arc;

/// Opaque identifier for a tracked heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

/// Identifier of the null reference.
pub const NULL_OBJECT_ID: ObjectId = ObjectId(0);

/// Identifier standing in for the owner of static fields.
pub const STATIC_OBJECT_ID: ObjectId = ObjectId(1);

/// Sentinel for "no object"; never allocated.
pub const INVALID_OBJECT_ID: ObjectId = ObjectId(u64::MAX);

/// First identifier handed out by the registry.
pub(crate) const FIRST_OBJECT_ID: ObjectId = ObjectId(2);

impl ObjectId {
    pub(crate) fn next(self) -> ObjectId {
        ObjectId(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "#{}", self.0)
    }
}

/// Width of a primitive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Char,
    Bool,
}

/// A primitive literal, width-exact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrimitiveValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Char(char),
    Bool(bool),
}

impl PrimitiveValue {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            PrimitiveValue::I8(_) => PrimitiveKind::I8,
            PrimitiveValue::I16(_) => PrimitiveKind::I16,
            PrimitiveValue::I32(_) => PrimitiveKind::I32,
            PrimitiveValue::I64(_) => PrimitiveKind::I64,
            PrimitiveValue::F32(_) => PrimitiveKind::F32,
            PrimitiveValue::F64(_) => PrimitiveKind::F64,
            PrimitiveValue::Char(_) => PrimitiveKind::Char,
            PrimitiveValue::Bool(_) => PrimitiveKind::Bool,
        }
    }

    /// The zero value of the given width.
    pub fn zero(kind: PrimitiveKind) -> PrimitiveValue {
        match kind {
            PrimitiveKind::I8 => PrimitiveValue::I8(0),
            PrimitiveKind::I16 => PrimitiveValue::I16(0),
            PrimitiveKind::I32 => PrimitiveValue::I32(0),
            PrimitiveKind::I64 => PrimitiveValue::I64(0),
            PrimitiveKind::F32 => PrimitiveValue::F32(0.0),
            PrimitiveKind::F64 => PrimitiveValue::F64(0.0),
            PrimitiveKind::Char => PrimitiveValue::Char('\0'),
            PrimitiveKind::Bool => PrimitiveValue::Bool(false),
        }
    }

    /// Convert to the given width, truncating integers the way a narrowing
    /// store does. Boolean and char slots only accept their own kind.
    pub fn coerce(self, kind: PrimitiveKind) -> Option<PrimitiveValue> {
        if self.kind() == kind {
            return Some(self);
        }

        let wide = match self {
            PrimitiveValue::I8(v) => v as i64,
            PrimitiveValue::I16(v) => v as i64,
            PrimitiveValue::I32(v) => v as i64,
            PrimitiveValue::I64(v) => v,
            PrimitiveValue::F32(v) => return float_coerce(v as f64, kind),
            PrimitiveValue::F64(v) => return float_coerce(v, kind),
            PrimitiveValue::Char(_) | PrimitiveValue::Bool(_) => return None,
        };

        Some(match kind {
            PrimitiveKind::I8 => PrimitiveValue::I8(wide as i8),
            PrimitiveKind::I16 => PrimitiveValue::I16(wide as i16),
            PrimitiveKind::I32 => PrimitiveValue::I32(wide as i32),
            PrimitiveKind::I64 => PrimitiveValue::I64(wide),
            PrimitiveKind::F32 => PrimitiveValue::F32(wide as f32),
            PrimitiveKind::F64 => PrimitiveValue::F64(wide as f64),
            PrimitiveKind::Char | PrimitiveKind::Bool => return None,
        })
    }
}

fn float_coerce(v: f64, kind: PrimitiveKind) -> Option<PrimitiveValue> {
    match kind {
        PrimitiveKind::F32 => Some(PrimitiveValue::F32(v as f32)),
        PrimitiveKind::F64 => Some(PrimitiveValue::F64(v)),
        _ => None,
    }
}

macro_rules! primitive_from {
    ($($ty:ty => $variant:ident,)*) => {
        $(
            impl From<$ty> for PrimitiveValue {
                fn from(src: $ty) -> PrimitiveValue {
                    PrimitiveValue::$variant(src)
                }
            }

            impl From<$ty> for ValueId {
                fn from(src: $ty) -> ValueId {
                    ValueId::Primitive(PrimitiveValue::$variant(src))
                }
            }

            impl From<$ty> for Value {
                fn from(src: $ty) -> Value {
                    Value::Primitive(PrimitiveValue::$variant(src))
                }
            }
        )*
    };
}

primitive_from! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    char => Char,
    bool => Bool,
}

/// Engine-side identity of a value: primitives are embedded by value, objects
/// are represented by their registry id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueId {
    Null,
    Primitive(PrimitiveValue),
    Object(ObjectId),
}

impl ValueId {
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            ValueId::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_primitive(&self) -> Option<PrimitiveValue> {
        match self {
            ValueId::Primitive(p) => Some(*p),
            _ => None,
        }
    }
}

/// User-facing side of [`ValueId`]: objects are live heap cells.
#[derive(Clone)]
pub enum Value {
    Null,
    Primitive(PrimitiveValue),
    Object(ObjRef),
}

impl Value {
    pub fn as_primitive(&self) -> Option<PrimitiveValue> {
        match self {
            Value::Primitive(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Primitive(PrimitiveValue::I32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Primitive(PrimitiveValue::I64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Primitive(PrimitiveValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Primitive(a), Value::Primitive(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(fmt, "null"),
            Value::Primitive(p) => p.fmt(fmt),
            Value::Object(obj) => write!(fmt, "{}@{:p}", obj.class_name(), Arc::as_ptr(obj)),
        }
    }
}
