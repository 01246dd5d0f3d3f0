//! Server side of the bridge: the event stream sink and the service façade
//! that exposes a [`Puppet`](crate::puppet::Puppet) to remote sessions.

pub mod facade;
pub mod filebox_store;
pub mod sink;

pub use facade::PuppetService;
pub use filebox_store::FileBoxStore;
pub use sink::{EventStreamSink, StreamReceiver, Teardown};
