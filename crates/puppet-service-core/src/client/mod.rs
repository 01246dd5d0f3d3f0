//! Client side of the bridge: a session that stands in for a remote puppet.

pub mod cache;
pub mod session;
pub mod transport;
pub mod watermark;

pub use cache::PayloadCache;
pub use session::{PuppetSession, ReconnectTiming, SessionOptions};
pub use transport::{
    EventTransport, StreamEvent, StreamEventKind, TcpConnector, TransportConnector,
    TransportManager,
};
pub use watermark::{
    watermark_key, MemoryWatermarkStore, SqliteWatermarkStore, Watermark, WatermarkStore,
};
