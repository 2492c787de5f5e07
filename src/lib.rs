pub use child_spawner::{run_command, set_signal_handler, setuidgid, spawn, RawFdMapping};
pub use cloexec::CloexecGate;
pub use fd_factory::{
    accept_cloexec, accept_cloexec_gated, pipe_cloexec, pipe_cloexec_gated, socket_cloexec,
    socket_cloexec_gated,
};
pub use host_resolver::{AddrHints, HostInfoResolver, LookupResult, RequestId};
pub use queue::{Queue, ReceiverId};
pub use semaphore::Semaphore;
pub use wake::{NotifyWake, SelfPipeWake, WakeHandle};

#[macro_use]
mod macros;

mod aton;
mod child_spawner;
mod cloexec;
mod fd_factory;
mod file;
mod host_resolver;
mod queue;
mod semaphore;
mod server_starter;
mod wake;

pub use aton::aton;
pub use file::read_file;
pub use server_starter::{server_starter_fds, server_starter_fds_from_env, MalformedServerStarterPort};
