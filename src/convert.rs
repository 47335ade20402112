//! Materialization of value snapshots into protocol-displayable variables.

use itertools::Itertools;

use crate::handles::HandleRegistry;
use crate::protocol::Variable;
use crate::value::{ValueKind, ValueSnapshot};

/// Registry of value handles shared by the scopes and variables handlers.
pub type ValueRegistry = HandleRegistry<ValueSnapshot>;

/// Converts a value snapshot into its display string and child reference.
///
/// A positive reference signals the client that another variables request
/// can be issued to get the elements of the compound value. A zero
/// reference, reminiscent of a zero pointer, marks a value that cannot be
/// "dereferenced" to get its elements (as there are none): no handle is ever
/// allocated for a snapshot with zero children, regardless of kind.
pub fn convert(registry: &mut ValueRegistry, v: &ValueSnapshot) -> (String, i64) {
    if let Some(cause) = &v.unreadable {
        return (format!("unreadable <{cause}>"), 0);
    }

    let type_name = &v.type_name;
    match v.kind {
        ValueKind::RawPointer => {
            if v.children.is_empty() {
                ("unsafe.Pointer(nil)".to_string(), 0)
            } else {
                (format!("unsafe.Pointer({:#x})", v.children[0].addr), 0)
            }
        }
        ValueKind::Pointer => {
            if v.children.is_empty() {
                ("nil".to_string(), 0)
            } else if v.children[0].addr == 0 {
                (format!("nil <{type_name}>"), 0)
            } else if v.children[0].kind == ValueKind::Invalid {
                ("void".to_string(), 0)
            } else {
                // The pointee is exposed as the pointer's single child.
                (
                    format!("<{type_name}>({:#x})", v.children[0].addr),
                    registry.create(v.clone()),
                )
            }
        }
        ValueKind::Array => {
            let reference = maybe_create(registry, v);
            (format!("<{type_name}>"), reference)
        }
        ValueKind::Slice => {
            if v.base == 0 {
                (format!("nil <{type_name}>"), 0)
            } else {
                let reference = maybe_create(registry, v);
                (
                    format!("<{type_name}> (length: {}, cap: {})", v.len, v.cap),
                    reference,
                )
            }
        }
        ValueKind::Map => {
            if v.base == 0 {
                (format!("nil <{type_name}>"), 0)
            } else {
                let reference = maybe_create(registry, v);
                (format!("<{type_name}> (length: {})", v.len), reference)
            }
        }
        ValueKind::String => {
            let mut loaded = v.value.clone();
            let not_loaded = v.len - loaded.len() as i64;
            if not_loaded > 0 {
                loaded.push_str(&format!("...+{not_loaded} more"));
            }
            (format!("{loaded:?}"), 0)
        }
        ValueKind::Channel => {
            if v.children.is_empty() {
                (format!("nil <{type_name}>"), 0)
            } else {
                (format!("<{type_name}>"), registry.create(v.clone()))
            }
        }
        ValueKind::Interface => {
            if v.addr == 0 {
                // An escaped interface variable that points to nil; happens
                // when the variable is out of scope, e.g. captured by a
                // closure and replaced by a pointer that contains 0.
                ("nil".to_string(), 0)
            } else if v.children.is_empty()
                || (v.children[0].kind == ValueKind::Invalid && v.children[0].addr == 0)
            {
                (format!("nil <{type_name}>"), 0)
            } else {
                // The held value is exposed as a synthetic "data" child.
                (
                    format!("<{type_name}({})>", v.children[0].type_name),
                    registry.create(v.clone()),
                )
            }
        }
        ValueKind::Complex64 | ValueKind::Complex128 => {
            let float_kind = if v.kind == ValueKind::Complex64 {
                ValueKind::Float32
            } else {
                ValueKind::Float64
            };
            let (re, im) = v.complex.unwrap_or_default();
            let mut synthesized = v.clone();
            synthesized.children = vec![
                float_part("real", re, float_kind),
                float_part("imaginary", im, float_kind),
            ];
            convert_default(registry, &synthesized)
        }
        _ => convert_default(registry, v),
    }
}

// Struct, scalar and every remaining kind.
fn convert_default(registry: &mut ValueRegistry, v: &ValueSnapshot) -> (String, i64) {
    let display = if v.value.is_empty() {
        format!("<{}>", v.type_name)
    } else {
        v.value.clone()
    };
    (display, maybe_create(registry, v))
}

fn maybe_create(registry: &mut ValueRegistry, v: &ValueSnapshot) -> i64 {
    if v.children.is_empty() {
        0
    } else {
        registry.create(v.clone())
    }
}

fn float_part(name: &str, value: f64, kind: ValueKind) -> ValueSnapshot {
    ValueSnapshot {
        name: name.to_string(),
        kind,
        value: value.to_string(),
        ..Default::default()
    }
}

/// Renders the children of a resolved compound value as a flat ordered
/// variable list.
pub fn children(registry: &mut ValueRegistry, v: &ValueSnapshot) -> Vec<Variable> {
    match v.kind {
        ValueKind::Map => {
            // A map has twice as many children as key-value elements;
            // process them in pairs, even indices are keys.
            let mut variables = Vec::with_capacity(v.children.len() / 2);
            for (kv_index, pair) in v.children.chunks(2).enumerate() {
                let [key, val] = pair else { continue };
                let (key_display, key_ref) = convert(registry, key);
                let (val_display, val_ref) = convert(registry, val);
                if key_ref > 0 && val_ref > 0 {
                    // Neither side is a scalar: separate entries for both.
                    variables.push(Variable {
                        name: format!("[key {kv_index}]"),
                        value: key_display,
                        variables_reference: key_ref,
                    });
                    variables.push(Variable {
                        name: format!("[val {kv_index}]"),
                        value: val_display,
                        variables_reference: val_ref,
                    });
                } else {
                    // At least one side is a scalar: a single key:value entry.
                    let mut entry = Variable {
                        name: key_display,
                        value: val_display,
                        variables_reference: 0,
                    };
                    if key_ref != 0 {
                        // Expandable key: suffix the pair index to keep the
                        // name unique.
                        entry.name = format!("{}[{kv_index}]", entry.name);
                        entry.variables_reference = key_ref;
                    } else if val_ref != 0 {
                        entry.variables_reference = val_ref;
                    }
                    variables.push(entry);
                }
            }
            variables
        }
        ValueKind::Slice | ValueKind::Array => v
            .children
            .iter()
            .enumerate()
            .map(|(i, child)| {
                let (value, reference) = convert(registry, child);
                Variable {
                    name: format!("[{i}]"),
                    value,
                    variables_reference: reference,
                }
            })
            .collect_vec(),
        _ => v
            .children
            .iter()
            .map(|child| {
                let (value, reference) = convert(registry, child);
                Variable {
                    name: child.name.clone(),
                    value,
                    variables_reference: reference,
                }
            })
            .collect_vec(),
    }
}
