//! Worker identities, routing and remote dispatch.

pub mod forward;
pub mod registry;
pub mod remote;
pub mod role;
pub mod selector;

pub use forward::RemoteForwarder;
pub use registry::{Registry, RegistryBuilder, WorkerRef};
pub use remote::{encode_frame, read_frame, RemoteSender, RemoteServer, TcpRemoteSender};
pub use role::Role;
pub use selector::WorkerSelector;
