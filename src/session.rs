//! Registro de sesiones. Cada cliente obtiene su propio índice de árbol y
//! su propio contexto; nada se comparte entre sesiones. Una sesión termina
//! con un DELETE explícito o al superar el tiempo máximo de inactividad.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{context::ContextState, models::DocumentNode, tree_index::TreeIndex};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Último acceso a través del registro.
    pub last_access: Instant,
    pub tree: TreeIndex,
    pub context: ContextState,
}

impl Session {
    pub fn new(nodes: Vec<DocumentNode>, token_limit: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            last_access: Instant::now(),
            tree: TreeIndex::from_roots(nodes),
            context: ContextState::with_token_limit(token_limit),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Un pánico dentro de otra petición no debe dejar inservible el registro.
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Session>> {
        self.sessions.lock().unwrap_or_else(|poisoned| {
            warn!("Mutex de sesiones envenenado; se recupera el estado.");
            poisoned.into_inner()
        })
    }

    /// Crea una sesión con la jerarquía inicial y devuelve su id.
    pub fn create(&self, nodes: Vec<DocumentNode>, token_limit: u64) -> Uuid {
        let session = Session::new(nodes, token_limit);
        let id = session.id;
        self.lock().insert(id, session);
        info!("Sesión {id} creada.");
        id
    }

    pub fn with_session<R>(&self, id: &Uuid, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.with_session_mut(id, |session| f(session))
    }

    /// Cada acceso renueva `last_access` antes de ejecutar `f`.
    pub fn with_session_mut<R>(&self, id: &Uuid, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(id)?;
        session.last_access = Instant::now();
        Some(f(session))
    }

    /// Elimina las sesiones sin acceso durante al menos `ttl` a fecha de
    /// `now`. Devuelve cuántas se descartaron.
    pub fn evict_idle(&self, now: Instant, ttl: Duration) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let idle = now.saturating_duration_since(session.last_access) >= ttl;
            if idle {
                debug!("Sesión {id} caducada por inactividad.");
            }
            !idle
        });
        before - sessions.len()
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            info!("Sesión {id} eliminada.");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
