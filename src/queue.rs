//! Event-loop-bound message queue multiplexing many receivers, woken through
//! a `WakeHandle`. Mirrors `h2o_multithread_queue_t`: receivers are
//! partitioned into an "active" set (non-empty inbox) and an "inactive" set
//! (empty inbox), so dispatch only visits receivers with work.
//!
//! Rather than reproducing the original's embedded intrusive-list pointers,
//! receivers are held in an owned map under one mutex and moved between two
//! id sets, per the sum-type/owned-collection guidance for this kind of
//! state.

use crate::wake::WakeHandle;
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identifies a receiver registered with a `Queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

struct Entry<T> {
    inbox: VecDeque<T>,
    callback: Box<dyn FnMut(&mut VecDeque<T>) + Send>,
}

struct State<T> {
    next_id: u64,
    active: VecDeque<ReceiverId>,
    inactive: HashSet<ReceiverId>,
    receivers: HashMap<ReceiverId, Entry<T>>,
}

/// A queue of receivers living on one event-loop thread, fed by any number
/// of other threads via `send`.
pub struct Queue<T> {
    wake: Arc<dyn WakeHandle>,
    state: Mutex<State<T>>,
}

impl<T> Queue<T> {
    pub fn new(wake: Arc<dyn WakeHandle>) -> Self {
        Self {
            wake,
            state: Mutex::new(State {
                next_id: 0,
                active: VecDeque::new(),
                inactive: HashSet::new(),
                receivers: HashMap::new(),
            }),
        }
    }

    /// Registers a new receiver with the given callback, starting with an
    /// empty (inactive) inbox.
    pub fn register<F>(&self, callback: F) -> Result<ReceiverId>
    where
        F: FnMut(&mut VecDeque<T>) + Send + 'static,
    {
        let mut state = lock!(self.state);
        let id = ReceiverId(state.next_id);
        state.next_id += 1;
        state.receivers.insert(
            id,
            Entry {
                inbox: VecDeque::new(),
                callback: Box::new(callback),
            },
        );
        state.inactive.insert(id);
        Ok(id)
    }

    /// Unregisters a receiver. Precondition: its inbox must be empty
    /// (drained by a prior dispatch).
    pub fn unregister(&self, id: ReceiverId) -> Result<()> {
        let mut state = lock!(self.state);
        let entry = match state.receivers.get(&id) {
            Some(e) => e,
            None => bail!("unregister: unknown receiver"),
        };
        if !entry.inbox.is_empty() {
            bail!("unregister: receiver still has pending messages");
        }
        state.receivers.remove(&id);
        if !state.inactive.remove(&id) {
            state.active.retain(|&r| r != id);
        }
        Ok(())
    }

    /// Sends a message to `id`. `None` is a pure wake-up: it only signals
    /// when the receiver's inbox is currently empty.
    pub fn send(&self, id: ReceiverId, message: Option<T>) -> Result<()> {
        let mut do_send = false;
        {
            let mut state = lock!(self.state);
            let was_empty = match state.receivers.get(&id) {
                Some(e) => e.inbox.is_empty(),
                None => bail!("send: unknown receiver"),
            };

            match message {
                Some(m) => {
                    let entry = state
                        .receivers
                        .get_mut(&id)
                        .expect("receiver existence already checked above");
                    entry.inbox.push_back(m);
                    if was_empty {
                        state.inactive.remove(&id);
                        state.active.push_back(id);
                        do_send = true;
                    }
                }
                None => {
                    if was_empty {
                        do_send = true;
                    }
                }
            }
        }
        if do_send {
            self.wake.notify()?;
        }
        Ok(())
    }

    /// Drains all currently-active receivers, invoking each one's callback
    /// with its batch of messages. Callbacks run with the queue mutex
    /// released, so they may re-enter `send`.
    pub fn dispatch(&self) -> Result<()> {
        loop {
            let (id, mut messages, mut callback) = {
                let mut state = lock!(self.state);
                let id = match state.active.pop_front() {
                    Some(id) => id,
                    None => return Ok(()),
                };
                state.inactive.insert(id);
                let entry = state
                    .receivers
                    .get_mut(&id)
                    .expect("active id must have an entry");
                let messages = std::mem::take(&mut entry.inbox);
                // Pull the callback out so it can run without holding the
                // queue lock; the entry keeps a stub in its place and we put
                // the real one back below.
                let callback = std::mem::replace(&mut entry.callback, Box::new(|_| {}));
                (id, messages, callback)
            };

            callback(&mut messages);
            debug_assert!(
                messages.is_empty(),
                "receiver callback must consume all delivered messages"
            );

            let mut state = lock!(self.state);
            if let Some(entry) = state.receivers.get_mut(&id) {
                entry.callback = callback;
            }
        }
    }

    /// Number of currently registered receivers, for tests/diagnostics.
    pub fn receiver_count(&self) -> Result<usize> {
        Ok(lock!(self.state).receivers.len())
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.lock() {
            debug_assert!(
                state.receivers.is_empty(),
                "queue destroyed with registered receivers still pending"
            );
            debug_assert!(
                state.active.is_empty() && state.inactive.is_empty(),
                "queue destroyed with a non-empty active/inactive receiver list"
            );
        }
    }
}

/// A free-running counter usable to label messages when testing FIFO
/// ordering per sender.
pub fn next_test_seq() -> u64 {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    SEQ.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wake::NotifyWake;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::thread;

    fn new_queue() -> Arc<Queue<u64>> {
        Arc::new(Queue::new(Arc::new(NotifyWake::new())))
    }

    #[test]
    fn register_unregister_roundtrip() {
        let q = new_queue();
        let id = q.register(|_msgs| {}).unwrap();
        assert_eq!(q.receiver_count().unwrap(), 1);
        q.unregister(id).unwrap();
        assert_eq!(q.receiver_count().unwrap(), 0);
    }

    #[test]
    fn unregister_with_pending_fails() {
        let q = new_queue();
        let id = q.register(|msgs| msgs.clear()).unwrap();
        q.send(id, Some(1)).unwrap();
        assert!(q.unregister(id).is_err());
        q.dispatch().unwrap();
        q.unregister(id).unwrap();
    }

    #[test]
    fn send_then_dispatch_delivers_fifo() {
        let q = new_queue();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = received.clone();
        let id = q
            .register(move |msgs| {
                while let Some(m) = msgs.pop_front() {
                    received2.lock().unwrap().push(m);
                }
            })
            .unwrap();

        for i in 0..10 {
            q.send(id, Some(i)).unwrap();
        }
        q.dispatch().unwrap();
        assert_eq!(*received.lock().unwrap(), (0..10).collect::<Vec<_>>());
        q.unregister(id).unwrap();
    }

    #[test]
    fn three_senders_fan_in_preserves_per_sender_order() {
        let q = new_queue();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = received.clone();
        let id = q
            .register(move |msgs| {
                while let Some(m) = msgs.pop_front() {
                    received2.lock().unwrap().push(m);
                }
            })
            .unwrap();

        let mut handles = vec![];
        for sender in 0..3u64 {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                for seq in 0..33u64 {
                    // encode (sender, seq) into one u64 so we can check
                    // per-sender ordering after the fact.
                    q.send(id, Some(sender * 1_000 + seq)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        q.dispatch().unwrap();

        let all = received.lock().unwrap();
        assert_eq!(all.len(), 99);
        for sender in 0..3u64 {
            let seqs: Vec<u64> = all
                .iter()
                .filter(|&&m| m / 1_000 == sender)
                .map(|&m| m % 1_000)
                .collect();
            let sorted = {
                let mut s = seqs.clone();
                s.sort_unstable();
                s
            };
            assert_eq!(seqs, sorted, "messages from sender {sender} out of order");
        }
        q.unregister(id).unwrap();
    }

    #[test]
    fn send_to_unknown_receiver_fails_for_both_message_and_wakeup() {
        let q = new_queue();
        let id = q.register(|msgs| msgs.clear()).unwrap();
        q.unregister(id).unwrap();

        assert!(q.send(id, Some(1)).is_err());
        assert!(q.send(id, None).is_err());
    }

    #[test]
    fn pure_wakeup_only_signals_on_empty_inbox() {
        let q = new_queue();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let id = q
            .register(move |msgs| {
                calls2.fetch_add(1, Ordering::SeqCst);
                msgs.clear();
            })
            .unwrap();

        q.send(id, Some(1)).unwrap();
        // inbox non-empty: a pure wakeup must not mark it active again after
        // dispatch already emptied it, but before dispatch it's a no-op signal.
        q.send(id, None).unwrap();
        q.dispatch().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        q.send(id, None).unwrap();
        q.dispatch().unwrap();
        // a pure wakeup never enqueues work, so the callback is not invoked.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        q.unregister(id).unwrap();
    }
}
