#![deny(warnings, rust_2018_idioms)]

use weft::rt::consistency::NoChecker;
use weft::rt::memory::{ClassDescriptor, ClassTable, MemoryLocation, SimHeap, TableInit};
use weft::rt::object::ObjectCell;
use weft::rt::value::{PrimitiveValue, Value, ValueId};
use weft::rt::{EngineConfig, EventStructure, MemoryInit};

use std::sync::Arc;

fn classes() -> ClassTable {
    let mut classes = ClassTable::new();
    classes.register(
        ClassDescriptor::new("com.example.Node")
            .field_i32("value")
            .field_i64("wide")
            .field_ref("next"),
    );
    classes.register(ClassDescriptor::new("com.example.Base").field_bool("ready"));
    classes.register(ClassDescriptor::new("com.example.Derived").extends("com.example.Base"));
    classes
}

fn engine() -> EventStructure {
    EventStructure::new(
        MemoryInit::new(Arc::new(TableInit::new(Arc::new(classes())))),
        Box::new(NoChecker),
        EngineConfig::default(),
    )
}

/// Round-trip: primitives by value, objects by identity.
#[test]
fn value_id_round_trip() {
    let mut engine = engine();

    let five = engine.compute_value_id(&Value::from(5i32));
    assert_eq!(five, ValueId::Primitive(PrimitiveValue::I32(5)));
    assert_eq!(engine.get_value(five), Some(Value::from(5i32)));

    assert_eq!(engine.compute_value_id(&Value::Null), ValueId::Null);

    let cell = ObjectCell::new("com.example.Node");
    let id = engine.compute_value_id(&Value::Object(cell.clone()));

    // Identity is stable across lookups.
    assert_eq!(engine.compute_value_id(&Value::Object(cell.clone())), id);

    match engine.get_value(id) {
        Some(Value::Object(resolved)) => assert!(Arc::ptr_eq(&resolved, &cell)),
        other => panic!("unexpected value {:?}", other),
    }

    // A different live object gets a different id.
    let other = ObjectCell::new("com.example.Node");
    assert_ne!(engine.compute_value_id(&Value::Object(other)), id);
}

/// Unknown objects register as external and survive exploration resets.
#[test]
fn external_objects_survive_reset() {
    let mut engine = engine();

    let cell = ObjectCell::new("com.example.Node");
    let id = engine.compute_value_id(&Value::Object(cell.clone()));

    engine.registry_mut().retain_external();

    assert_eq!(engine.compute_value_id(&Value::Object(cell)), id);
    assert_eq!(engine.registry().external_entries().len(), 1);
}

/// Field writes preserve the declared primitive width.
#[test]
fn field_width_preserved() {
    let mut engine = engine();
    let heap = SimHeap::new(classes());

    let cell = ObjectCell::new("com.example.Node");
    let id = engine
        .compute_value_id(&Value::Object(cell.clone()))
        .object_id()
        .unwrap();
    heap.insert(id, cell);

    let value = MemoryLocation::object_field(id, "com.example.Node", "value");

    // A wide literal narrows to the declared i32 slot.
    value.write(&heap, Value::from(0x1_0000_0001i64)).unwrap();
    assert_eq!(value.read(&heap).unwrap(), Value::from(1i32));

    let wide = MemoryLocation::object_field(id, "com.example.Node", "wide");
    wide.write(&heap, Value::from(7i32)).unwrap();
    assert_eq!(wide.read(&heap).unwrap(), Value::from(7i64));

    // Unset slots read as their declared defaults.
    let next = MemoryLocation::object_field(id, "com.example.Node", "next");
    assert_eq!(next.read(&heap).unwrap(), Value::Null);

    // A boolean slot rejects references.
    let ready = MemoryLocation::static_field("com.example.Base", "ready");
    assert!(ready
        .write(&heap, Value::Object(ObjectCell::new("com.example.Node")))
        .is_err());
}

/// Resolution tolerates class-loader decorated names (suffix match) and
/// walks the superclass chain.
#[test]
fn suffix_matched_resolution() {
    let mut engine = engine();
    let heap = SimHeap::new(classes());

    let cell = ObjectCell::new("Node");
    let id = engine
        .compute_value_id(&Value::Object(cell.clone()))
        .object_id()
        .unwrap();
    heap.insert(id, cell);

    // Bare suffix resolves against the registered dotted name.
    let by_suffix = MemoryLocation::object_field(id, "Node", "value");
    assert_eq!(by_suffix.read(&heap).unwrap(), Value::from(0i32));

    // Inherited fields resolve through the superclass.
    let inherited = MemoryLocation::static_field("com.example.Derived", "ready");
    assert_eq!(inherited.read(&heap).unwrap(), Value::from(false));

    // Unknown fields fail rather than defaulting.
    let missing = MemoryLocation::object_field(id, "Node", "missing");
    assert!(missing.read(&heap).is_err());
}

/// Array elements bound-check against the live cell.
#[test]
fn array_elements() {
    let mut engine = engine();
    let heap = SimHeap::new(classes());

    let cell = ObjectCell::array("int[]", 3, Value::from(0i32));
    let id = engine
        .compute_value_id(&Value::Object(cell.clone()))
        .object_id()
        .unwrap();
    heap.insert(id, cell);

    let second = MemoryLocation::array_element(id, 1);
    second.write(&heap, Value::from(9i32)).unwrap();
    assert_eq!(second.read(&heap).unwrap(), Value::from(9i32));

    let oob = MemoryLocation::array_element(id, 3);
    assert!(oob.read(&heap).is_err());
    assert!(oob.write(&heap, Value::from(1i32)).is_err());
}
