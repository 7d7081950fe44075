use crate::value::{ObjectId, Value};
use stackil_bytecode::core::metadata::TypeRef;
use stackil_bytecode::core::types::VerificationType;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub enum Object {
    Instance {
        class: TypeRef,
        fields: BTreeMap<String, Value>,
    },
    Array {
        element: VerificationType,
        items: Vec<Value>,
    },
    Boxed {
        ty: TypeRef,
        value: Value,
    },
}

impl Object {
    pub fn class(&self) -> TypeRef {
        match self {
            Object::Instance { class, .. } => class.clone(),
            Object::Array { element, .. } => TypeRef::array_of(element.clone()),
            Object::Boxed { ty, .. } => ty.clone(),
        }
    }
}

/// Grow-only object store. Nothing is collected during a run.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Object>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, object: Object) -> ObjectId {
        self.objects.push(object);
        ObjectId(self.objects.len() - 1)
    }

    /// Allocate an instance with no fields set
    pub fn instance(&mut self, class: TypeRef) -> ObjectId {
        self.alloc(Object::Instance {
            class,
            fields: BTreeMap::new(),
        })
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id.0)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Instance field, if it has been stored
    pub fn field(&self, id: ObjectId, name: &str) -> Option<&Value> {
        match self.get(id)? {
            Object::Instance { fields, .. } => fields.get(name),
            _ => None,
        }
    }

    /// Store an instance field; returns `false` when `id` is not an instance
    pub fn set_field(&mut self, id: ObjectId, name: &str, value: Value) -> bool {
        match self.get_mut(id) {
            Some(Object::Instance { fields, .. }) => {
                fields.insert(name.to_string(), value);
                true
            }
            _ => false,
        }
    }

    /// Runtime class of a reference or value; `None` for null and
    /// primitives
    pub fn class_of(&self, value: &Value) -> Option<TypeRef> {
        match value {
            Value::Str(_) => Some(TypeRef::string()),
            Value::Object(id) => self.get(*id).map(Object::class),
            Value::Struct(s) => Some(s.ty.clone()),
            _ => None,
        }
    }
}
