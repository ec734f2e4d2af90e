use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

type Attr = Box<dyn Any + Send + Sync>;
type TeardownHook = Box<dyn FnOnce(&Context) + Send>;

/// One unit of request-scoped state.
///
/// A context is created per operation — an incoming request on the embedding
/// application's side, or one consumed message on ours — and carries named
/// attributes (the bound session, the raw inbound message) plus teardown
/// hooks that fire exactly once when the context ends, synchronously, even
/// after a handler error.
pub struct Context {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub content_type: Option<String>,
    pub payload: Vec<u8>,
    attrs: Mutex<HashMap<String, Attr>>,
    teardown: Mutex<Vec<TeardownHook>>,
    finished: AtomicBool,
}

impl Context {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_request(method, path, HashMap::new(), None, Vec::new())
    }

    pub fn with_request(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: HashMap<String, String>,
        content_type: Option<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers,
            content_type,
            payload,
            attrs: Mutex::new(HashMap::new()),
            teardown: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        }
    }

    /// Attach an opaque attribute under `name`, replacing any prior value.
    pub fn set<T: Any + Send + Sync>(&self, name: &str, value: T) {
        self.attrs
            .lock()
            .unwrap()
            .insert(name.to_string(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync + Clone>(&self, name: &str) -> Option<T> {
        self.attrs
            .lock()
            .unwrap()
            .get(name)
            .and_then(|attr| attr.downcast_ref::<T>())
            .cloned()
    }

    /// Remove and return the attribute stored under `name`.
    pub fn take<T: Any + Send + Sync>(&self, name: &str) -> Option<T> {
        self.attrs
            .lock()
            .unwrap()
            .remove(name)
            .and_then(|attr| attr.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    /// Register a hook to run when the context ends. Hooks run in reverse
    /// registration order.
    pub fn on_teardown<F>(&self, hook: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.teardown.lock().unwrap().push(Box::new(hook));
    }

    /// End the context, firing teardown hooks. Idempotent: hooks run at
    /// most once, whether `finish` is called explicitly or from `Drop`.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.teardown.lock().unwrap());
        for hook in hooks.into_iter().rev() {
            hook(self);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn teardown_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let context = Context::new("GET", "/x");
        let counter = Arc::clone(&fired);
        context.on_teardown(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        context.finish();
        context.finish();
        drop(context);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_fires_on_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let context = Context::new("GET", "/x");
            let counter = Arc::clone(&fired);
            context.on_teardown(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attributes_roundtrip() {
        let context = Context::new("GET", "/x");
        context.set("answer", 42u32);
        assert_eq!(context.get::<u32>("answer"), Some(42));
        assert_eq!(context.take::<u32>("answer"), Some(42));
        assert_eq!(context.get::<u32>("answer"), None);
    }
}
