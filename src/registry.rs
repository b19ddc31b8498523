//! At most one active session per local endpoint.
//!
//! A slot is reserved before the session starts and released if the start
//! fails, so two concurrent starts for the same key cannot both connect.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::config::Prompt;
use crate::error::RegistryError;
use crate::session::Session;

/// A slot marked as starting. Dropping it frees the slot.
struct Reservation<'a, K: Eq + Hash> {
    slots: &'a Mutex<HashMap<K, Option<Session>>>,
    key: Option<K>,
}

impl<K: Eq + Hash> Reservation<'_, K> {
    fn fill(mut self, session: Session) {
        if let Some(key) = self.key.take() {
            self.slots.lock().insert(key, Some(session));
        }
    }
}

impl<K: Eq + Hash> Drop for Reservation<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.slots.lock().remove(&key);
        }
    }
}

pub struct SessionRegistry<K> {
    /// `None` marks a slot whose session is still starting.
    slots: Mutex<HashMap<K, Option<Session>>>,
}

impl<K> Default for SessionRegistry<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> SessionRegistry<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `session` for `key` and take ownership of it.
    ///
    /// The slot is released again if the start fails or this future is
    /// dropped before it completes.
    pub async fn start(
        &self,
        key: K,
        mut session: Session,
        prompt: Prompt,
    ) -> Result<(), RegistryError> {
        let reservation = {
            let mut slots = self.slots.lock();
            if slots.contains_key(&key) {
                log::warn!("Session already active for {:?}", key);
                return Err(RegistryError::Occupied);
            }
            slots.insert(key.clone(), None);
            Reservation {
                slots: &self.slots,
                key: Some(key),
            }
        };

        session.start(prompt).await?;
        log::info!("Session {} registered", session.id());
        reservation.fill(session);
        Ok(())
    }

    /// Stop and drop the session for `key`. Returns false if none was active.
    ///
    /// A slot that is still starting is left alone.
    pub async fn stop(&self, key: &K) -> bool {
        let session = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(Some(_)) => slots.remove(key).flatten(),
                _ => None,
            }
        };
        match session {
            Some(mut session) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    /// Whether `key` holds a session, started or starting.
    pub fn is_active(&self, key: &K) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Stop every started session.
    pub async fn stop_all(&self) {
        let sessions: Vec<Session> = {
            let mut slots = self.slots.lock();
            let started: Vec<K> = slots
                .iter()
                .filter(|(_, slot)| slot.is_some())
                .map(|(key, _)| key.clone())
                .collect();
            started
                .into_iter()
                .filter_map(|key| slots.remove(&key).flatten())
                .collect()
        };
        for mut session in sessions {
            session.stop().await;
        }
    }
}
