use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::connection::ConnectionManager;
use crate::context::Context;
use crate::session::Session;

pub(crate) const SESSION_ATTR: &str = "amqp.session";

/// Free list of idle sessions, keyed only by availability.
///
/// `acquire` binds a session to an execution context and registers
/// [`release`](SessionPool::release) as a teardown hook, so the session
/// comes back to the pool when the context ends no matter how the work
/// inside it went.
pub struct SessionPool {
    app_id: Option<String>,
    connections: Arc<ConnectionManager>,
    reply_timeout: Duration,
    idle: Mutex<Vec<Arc<Session>>>,
}

impl SessionPool {
    pub(crate) fn new(
        app_id: Option<String>,
        connections: Arc<ConnectionManager>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            app_id,
            connections,
            reply_timeout,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// The session bound to `context`, checking one out of the free list
    /// (or building a fresh one) on first use.
    pub fn acquire(self: &Arc<Self>, context: &Context) -> Arc<Session> {
        if let Some(session) = context.get::<Arc<Session>>(SESSION_ATTR) {
            return session;
        }
        let session = {
            let mut idle = self.idle.lock().unwrap();
            idle.pop()
        }
        .unwrap_or_else(|| {
            Arc::new(Session::new(
                self.app_id.clone(),
                Arc::clone(&self.connections),
                self.reply_timeout,
            ))
        });
        session.begin();
        context.set(SESSION_ATTR, Arc::clone(&session));
        let pool = Arc::clone(self);
        context.on_teardown(move |ctx| pool.release(ctx));
        session
    }

    /// Roll back and return the context's session to the free list, or drop
    /// it if its connection died. Uncommitted staged work is discarded:
    /// callers must `commit` before their context ends.
    pub fn release(&self, context: &Context) {
        if let Some(session) = context.take::<Arc<Session>>(SESSION_ATTR) {
            session.rollback();
            if session.is_connected() {
                self.idle.lock().unwrap().push(session);
            } else {
                debug!("dropping session with a dead connection");
            }
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    /// Close every idle session. Part of process shutdown.
    pub(crate) async fn close(&self) {
        loop {
            let session = { self.idle.lock().unwrap().pop() };
            match session {
                Some(session) => session.close().await,
                None => break,
            }
        }
    }
}
