use crate::{ConversationId, Error, SymmetricKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::Notify;

/// Load state of one conversation key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyState {
    Unloaded,
    Loading,
    Ready,
}

/// Proof that the holder started the current load of a conversation key.
///
/// Not `Clone`: a ticket completes at most one load. A ticket whose load was
/// superseded (unload, clear, or a newer load) is stale.
#[derive(Debug, PartialEq, Eq)]
pub struct LoadTicket {
    conversation_id: ConversationId,
    generation: u64,
}

impl LoadTicket {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoadStart {
    /// The caller owns the load and must finish it with the ticket.
    Started(LoadTicket),
    AlreadyLoading,
    AlreadyReady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The key was stored and is usable.
    Ready,
    /// The load was superseded; the key was discarded.
    Stale,
}

enum Entry {
    Loading { generation: u64 },
    Ready(SymmetricKey),
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ConversationId, Entry>,
    next_generation: u64,
}

/// In-memory conversation keys of one authenticated session.
///
/// Keys never leave this cache except by reference inside [`with_key`]. They
/// are zeroized when unloaded, cleared or dropped.
///
/// [`with_key`]: SessionKeyCache::with_key
#[derive(Default)]
pub struct SessionKeyCache {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl SessionKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, conversation_id: &ConversationId) -> KeyState {
        match self.inner.lock().entries.get(conversation_id) {
            None => KeyState::Unloaded,
            Some(Entry::Loading { .. }) => KeyState::Loading,
            Some(Entry::Ready(_)) => KeyState::Ready,
        }
    }

    /// Moves an unloaded conversation to `Loading`.
    pub fn begin_load(&self, conversation_id: &ConversationId) -> LoadStart {
        let mut inner = self.inner.lock();
        match inner.entries.get(conversation_id) {
            Some(Entry::Loading { .. }) => LoadStart::AlreadyLoading,
            Some(Entry::Ready(_)) => LoadStart::AlreadyReady,
            None => {
                inner.next_generation += 1;
                let generation = inner.next_generation;
                inner
                    .entries
                    .insert(conversation_id.clone(), Entry::Loading { generation });

                LoadStart::Started(LoadTicket {
                    conversation_id: conversation_id.clone(),
                    generation,
                })
            }
        }
    }

    /// Completes a load started with [`begin_load`].
    ///
    /// Results of superseded loads are dropped and reported as
    /// [`LoadOutcome::Stale`]. A failed current load returns the conversation
    /// to `Unloaded` and passes the error through.
    ///
    /// [`begin_load`]: SessionKeyCache::begin_load
    pub fn finish_load(
        &self,
        ticket: LoadTicket,
        result: Result<SymmetricKey, Error>,
    ) -> Result<LoadOutcome, Error> {
        let mut inner = self.inner.lock();
        let current = matches!(
            inner.entries.get(&ticket.conversation_id),
            Some(Entry::Loading { generation }) if *generation == ticket.generation
        );

        if !current {
            tracing::debug!(
                conversation = %ticket.conversation_id,
                "discarding result of superseded key load"
            );
            return Ok(LoadOutcome::Stale);
        }

        let outcome = match result {
            Ok(key) => {
                inner
                    .entries
                    .insert(ticket.conversation_id, Entry::Ready(key));
                Ok(LoadOutcome::Ready)
            }
            Err(err) => {
                inner.entries.remove(&ticket.conversation_id);
                Err(err)
            }
        };
        drop(inner);

        self.changed.notify_waiters();
        outcome
    }

    /// Runs `f` with the conversation key, only once it is `Ready`.
    pub fn with_key<T>(
        &self,
        conversation_id: &ConversationId,
        f: impl FnOnce(&SymmetricKey) -> T,
    ) -> Result<T, Error> {
        match self.inner.lock().entries.get(conversation_id) {
            Some(Entry::Ready(key)) => Ok(f(key)),
            _ => Err(Error::KeyNotReady),
        }
    }

    /// Waits out an in-flight load.
    ///
    /// Returns `Ok` once the key is `Ready` and [`Error::KeyNotReady`] if the
    /// conversation is, or falls back to, `Unloaded`.
    pub async fn wait_ready(&self, conversation_id: &ConversationId) -> Result<(), Error> {
        loop {
            let mut notified = std::pin::pin!(self.changed.notified());
            notified.as_mut().enable();

            match self.state(conversation_id) {
                KeyState::Ready => return Ok(()),
                KeyState::Unloaded => return Err(Error::KeyNotReady),
                KeyState::Loading => notified.await,
            }
        }
    }

    /// Drops the key of one conversation. In-flight loads for it go stale.
    pub fn unload(&self, conversation_id: &ConversationId) {
        let removed = self.inner.lock().entries.remove(conversation_id).is_some();
        if removed {
            tracing::debug!(conversation = %conversation_id, "conversation key unloaded");
            self.changed.notify_waiters();
        }
    }

    /// Drops every key.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
        self.changed.notify_waiters();
    }
}
