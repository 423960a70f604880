use {
    crate::dbus::{CallError, ExecutionContext, ObjectPath, Value},
    ahash::AHashMap,
    indexmap::IndexMap,
    std::sync::Arc,
};

/// An inbound method call addressed to an exported object.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodInvocation {
    pub sender: Option<String>,
    pub path: ObjectPath,
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
    /// Whether the caller asked for no reply. The return value is discarded
    /// in that case.
    pub no_reply: bool,
}

/// A local object answering method calls for one interface.
pub trait ObjectExport: Send + Sync {
    /// Returns the reply body or the error to send back.
    fn route_method_call(&self, invocation: &MethodInvocation) -> Result<Vec<Value>, CallError>;
}

impl<F> ObjectExport for F
where
    F: Fn(&MethodInvocation) -> Result<Vec<Value>, CallError> + Send + Sync,
{
    fn route_method_call(&self, invocation: &MethodInvocation) -> Result<Vec<Value>, CallError> {
        self(invocation)
    }
}

#[derive(Clone)]
pub(super) struct Export {
    pub ctx: Arc<dyn ExecutionContext>,
    pub obj: Arc<dyn ObjectExport>,
}

pub(super) enum Route {
    Found(String, Export),
    UnknownObject,
    UnknownInterface,
}

/// The objects exported on a connection, by path and interface.
#[derive(Default)]
pub(super) struct Exports {
    objects: AHashMap<String, IndexMap<String, Export>>,
}

impl Exports {
    /// Returns the replaced export.
    pub fn insert(&mut self, path: &str, interface: &str, export: Export) -> Option<Export> {
        self.objects
            .entry(path.to_string())
            .or_default()
            .insert(interface.to_string(), export)
    }

    pub fn remove(&mut self, path: &str, interface: &str) -> Option<Export> {
        let interfaces = self.objects.get_mut(path)?;
        let removed = interfaces.shift_remove(interface);
        if interfaces.is_empty() {
            self.objects.remove(path);
        }
        removed
    }

    /// Finds the export for a call. A call without an interface is routed
    /// only if the path exports a single interface.
    pub fn route(&self, path: &str, interface: Option<&str>) -> Route {
        let Some(interfaces) = self.objects.get(path) else {
            return Route::UnknownObject;
        };
        let found = match interface {
            Some(i) => interfaces.get_key_value(i),
            None if interfaces.len() == 1 => interfaces.first(),
            None => None,
        };
        match found {
            Some((i, e)) => Route::Found(i.clone(), e.clone()),
            None => Route::UnknownInterface,
        }
    }
}
