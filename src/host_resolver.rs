//! Asynchronous DNS resolution pool: a lazy-growth, capacity-capped thread
//! pool that performs blocking name resolution off the event loop and posts
//! results back through a `Queue`.

use crate::queue::{Queue, ReceiverId};
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::ffi::{CStr, CString};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

/// The outcome of a single lookup: exactly one of `Ok`/`Err`, the Rust
/// `Result` already encoding the "error xor addrinfo chain" invariant the
/// original enforced by convention on its output union.
pub type LookupResult = std::result::Result<Vec<SocketAddr>, String>;

type UserCallback = Box<dyn FnOnce(LookupResult) + Send>;
/// A result already bound to its callback, ready to fire with no arguments
/// once it reaches the event-loop thread.
type Delivery = Box<dyn FnOnce() + Send>;

/// `getaddrinfo`-style resolution hints. All-zero (`AF_UNSPEC`/0/0/0) means
/// "no hint": the lookup is free to go through the plain `std::net` path.
/// Any non-default field routes through the raw `libc::getaddrinfo` binding,
/// since `std::net::ToSocketAddrs` has no way to express them.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddrHints {
    pub family: libc::c_int,
    pub socktype: libc::c_int,
    pub protocol: libc::c_int,
    pub flags: libc::c_int,
}

impl AddrHints {
    fn is_default(&self) -> bool {
        self.family == 0 && self.socktype == 0 && self.protocol == 0 && self.flags == 0
    }
}

struct Request {
    name: String,
    service: String,
    hints: AddrHints,
    callback: Mutex<Option<UserCallback>>,
}

struct PoolState {
    pending_ids: VecDeque<u64>,
    requests: HashMap<u64, Arc<Request>>,
    num_threads: usize,
    num_threads_idle: usize,
    max_threads: usize,
}

/// A handle to an in-flight or completed lookup request, usable with
/// `HostInfoResolver::cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// Lazy-growth worker pool performing blocking `getaddrinfo`-equivalent
/// lookups and posting results to a message queue.
pub struct HostInfoResolver {
    pool: Arc<(Mutex<PoolState>, Condvar)>,
    queue: Arc<Queue<u64>>,
    receiver: ReceiverId,
    /// Completed-but-undelivered results, keyed by request id, drained by
    /// the receiver callback on the event-loop thread.
    deliveries: Arc<Mutex<HashMap<u64, Delivery>>>,
    next_id: AtomicU64,
}

impl HostInfoResolver {
    /// Registers a receiver on `queue` and returns a resolver that will post
    /// completed lookups to it. `max_threads` bounds pool growth (the
    /// original defaults this to 1; callers here must choose explicitly).
    pub fn new(queue: Arc<Queue<u64>>, max_threads: usize) -> Result<Self> {
        let deliveries: Arc<Mutex<HashMap<u64, Delivery>>> = Arc::new(Mutex::new(HashMap::new()));
        let deliveries_for_cb = deliveries.clone();
        let receiver = queue.register(move |ids| {
            while let Some(id) = ids.pop_front() {
                let delivery = lock_or_log(&deliveries_for_cb).remove(&id);
                if let Some(delivery) = delivery {
                    delivery();
                }
            }
        })?;

        Ok(Self {
            pool: Arc::new((
                Mutex::new(PoolState {
                    pending_ids: VecDeque::new(),
                    requests: HashMap::new(),
                    num_threads: 0,
                    num_threads_idle: 0,
                    max_threads: max_threads.max(1),
                }),
                Condvar::new(),
            )),
            queue,
            receiver,
            deliveries,
            next_id: AtomicU64::new(0),
        })
    }

    /// Starts a lookup for `name`/`service`, invoking `callback` with the
    /// result once it is delivered through the queue. `hints` mirrors
    /// `getaddrinfo`'s `family`/`socktype`/`protocol`/`flags`; leave it
    /// `AddrHints::default()` for a plain, unhinted lookup. Returns the
    /// request id, usable with `cancel`.
    pub fn getaddr<F>(
        &self,
        name: &str,
        service: &str,
        hints: AddrHints,
        callback: F,
    ) -> Result<RequestId>
    where
        F: FnOnce(LookupResult) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = Arc::new(Request {
            name: name.to_string(),
            service: service.to_string(),
            hints,
            callback: Mutex::new(Some(Box::new(callback))),
        });

        let (mutex, cond) = &*self.pool;
        let mut state = lock!(mutex);
        state.pending_ids.push_back(id);
        state.requests.insert(id, req);
        let should_spawn = state.num_threads_idle == 0 && state.num_threads < state.max_threads;
        let is_first = state.num_threads == 0;
        if should_spawn {
            state.num_threads += 1;
        }
        drop(state);
        if should_spawn {
            self.spawn_worker(is_first);
        }
        cond.notify_one();
        Ok(RequestId(id))
    }

    /// Cancels a request. If it has not yet been picked up by a worker it is
    /// freed immediately and its callback never fires. Otherwise its
    /// callback is suppressed: the worker still posts a result, but the
    /// event loop silently drops it since no delivery will have been
    /// recorded for it when it fires.
    pub fn cancel(&self, id: RequestId) -> Result<()> {
        let (mutex, _cond) = &*self.pool;
        let mut state = lock!(mutex);
        if let Some(pos) = state.pending_ids.iter().position(|&x| x == id.0) {
            state.pending_ids.remove(pos);
            state.requests.remove(&id.0);
            return Ok(());
        }
        if let Some(req) = state.requests.get(&id.0) {
            *lock_or_log(&req.callback) = None;
        }
        Ok(())
    }

    fn spawn_worker(&self, is_first: bool) {
        let pool = self.pool.clone();
        let queue = self.queue.clone();
        let receiver = self.receiver;
        let deliveries = self.deliveries.clone();
        let result = thread::Builder::new()
            .stack_size(100 * 1024)
            .spawn(move || worker_main(pool, queue, receiver, deliveries));
        if let Err(e) = result {
            if is_first {
                panic!("failed to spawn first DNS resolver thread: {e}");
            }
            log::warn!("failed to spawn DNS resolver thread: {e}");
            let (mutex, _cond) = &*self.pool;
            lock_or_log(mutex).num_threads -= 1;
        }
    }
}

impl Drop for HostInfoResolver {
    /// Unregisters this resolver's receiver so the queue's own destruction
    /// invariant (no registered receivers) holds once the last `getaddr`
    /// caller drops the resolver. Worker threads are daemon-style and keep
    /// running parked on the pool condvar; they outlive the resolver but
    /// never touch the queue again once idle.
    fn drop(&mut self) {
        let _ = self.queue.unregister(self.receiver);
    }
}

fn worker_main(
    pool: Arc<(Mutex<PoolState>, Condvar)>,
    queue: Arc<Queue<u64>>,
    receiver: ReceiverId,
    deliveries: Arc<Mutex<HashMap<u64, Delivery>>>,
) {
    // A freshly spawned thread starts out busy (it was spawned because
    // work was waiting), so idle accounting only brackets the `cond.wait`
    // below rather than this first pass.
    let mut state = lock_or_log(&pool.0);
    loop {
        while let Some(id) = state.pending_ids.pop_front() {
            let req = state.requests.remove(&id);
            drop(state);
            if let Some(req) = req {
                lookup_and_respond(&req, id, &queue, receiver, &deliveries);
            }
            state = lock_or_log(&pool.0);
        }
        state.num_threads_idle += 1;
        state = pool.1.wait(state).unwrap_or_else(PoisonError::into_inner);
        state.num_threads_idle -= 1;
    }
}

fn lookup_and_respond(
    req: &Request,
    id: u64,
    queue: &Arc<Queue<u64>>,
    receiver: ReceiverId,
    deliveries: &Arc<Mutex<HashMap<u64, Delivery>>>,
) {
    let result = resolve(&req.name, &req.service, req.hints);

    if let Some(cb) = lock_or_log(&req.callback).take() {
        let delivery: Delivery = Box::new(move || cb(result));
        lock_or_log(deliveries).insert(id, delivery);
    }
    // If the callback was already cleared by `cancel`, no delivery is
    // recorded; the wake-up still fires but the receiver finds nothing to
    // run for this id.
    let _ = queue.send(receiver, Some(id));
}

/// Resolves `name`/`service`. When `hints` carries no family/socktype/
/// protocol/flags preference, goes through the plain `std::net` resolver
/// (and, for that path, `service` must be a numeric port); otherwise routes
/// through the raw `libc::getaddrinfo` binding, since `ToSocketAddrs` has no
/// way to express those hints.
fn resolve(name: &str, service: &str, hints: AddrHints) -> LookupResult {
    if hints.is_default() {
        if let Ok(port) = service.parse::<u16>() {
            return (name, port)
                .to_socket_addrs()
                .map(|it| it.collect())
                .map_err(|e| e.to_string());
        }
    }
    resolve_hinted(name, service, hints)
}

/// Resolves via `getaddrinfo(3)` directly, honoring `family`/`socktype`/
/// `protocol`/`flags` the way the original's `h2o_hostinfo_getaddr` does.
fn resolve_hinted(name: &str, service: &str, hints: AddrHints) -> LookupResult {
    let node = CString::new(name).map_err(|e| e.to_string())?;
    let serv = CString::new(service).map_err(|e| e.to_string())?;

    let mut raw_hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    raw_hints.ai_family = hints.family;
    raw_hints.ai_socktype = hints.socktype;
    raw_hints.ai_protocol = hints.protocol;
    raw_hints.ai_flags = hints.flags;

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(node.as_ptr(), serv.as_ptr(), &raw_hints, &mut res) };
    if rc != 0 {
        let msg = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
            .to_string_lossy()
            .into_owned();
        return Err(msg);
    }

    let mut out = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        let ai = unsafe { &*cur };
        if let Some(addr) = unsafe { sockaddr_to_socket_addr(ai.ai_addr) } {
            out.push(addr);
        }
        cur = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };
    Ok(out)
}

/// Converts a C `sockaddr` from an `addrinfo` chain entry into a
/// `std::net::SocketAddr`. Safety: `addr` must point at a live
/// `sockaddr_in`/`sockaddr_in6` for the duration of the call, as guaranteed
/// by a non-null entry in a `getaddrinfo` result chain.
unsafe fn sockaddr_to_socket_addr(addr: *mut libc::sockaddr) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }
    match (*addr).sa_family as libc::c_int {
        libc::AF_INET => {
            let sin = &*(addr as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let port = u16::from_be(sin.sin_port);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sin6 = &*(addr as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn lock_or_log<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn single_lookup_spawns_one_worker_and_delivers() {
        let _ = env_logger::builder().is_test(true).try_init();
        let queue = Arc::new(Queue::new(Arc::new(crate::wake::NotifyWake::new())));
        let resolver = HostInfoResolver::new(queue.clone(), 2).unwrap();

        let (tx, rx) = mpsc::channel();
        resolver
            .getaddr("localhost", "0", AddrHints::default(), move |result| {
                tx.send(result).unwrap();
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        queue.dispatch().unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.is_ok() || result.is_err());
    }

    #[test]
    fn ten_concurrent_lookups_bounded_by_two_threads() {
        let queue = Arc::new(Queue::new(Arc::new(crate::wake::NotifyWake::new())));
        let resolver = Arc::new(HostInfoResolver::new(queue.clone(), 2).unwrap());
        let (tx, rx) = mpsc::channel();
        for _ in 0..10 {
            let tx = tx.clone();
            resolver
                .getaddr("localhost", "0", AddrHints::default(), move |result| {
                    tx.send(result).unwrap();
                })
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(300));
        queue.dispatch().unwrap();
        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        let (mutex, _) = &*resolver.pool;
        assert!(lock_or_log(mutex).num_threads <= 2);
    }

    #[test]
    fn cancel_before_pickup_suppresses_callback() {
        let queue = Arc::new(Queue::new(Arc::new(crate::wake::NotifyWake::new())));
        let resolver = HostInfoResolver::new(queue, 0).unwrap();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        let id = resolver
            .getaddr(
                "example.invalid",
                "0",
                AddrHints::default(),
                move |_| {
                    fired2.store(true, Ordering::SeqCst);
                },
            )
            .unwrap();
        resolver.cancel(id).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn hinted_lookup_resolves_loopback_via_getaddrinfo() {
        let queue = Arc::new(Queue::new(Arc::new(crate::wake::NotifyWake::new())));
        let resolver = HostInfoResolver::new(queue.clone(), 2).unwrap();
        let (tx, rx) = mpsc::channel();

        let hints = AddrHints {
            family: libc::AF_INET,
            socktype: libc::SOCK_STREAM,
            protocol: 0,
            flags: 0,
        };
        resolver
            .getaddr("127.0.0.1", "80", hints, move |result| {
                tx.send(result).unwrap();
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        queue.dispatch().unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(result, vec![SocketAddr::from(([127, 0, 0, 1], 80))]);

        let (mutex, _) = &*resolver.pool;
        assert_eq!(lock_or_log(mutex).num_threads, 1);
    }
}
