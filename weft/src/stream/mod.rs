mod buffered;
pub use buffered::{Handshake, Stream};

mod endpoint;
pub use endpoint::{Endpoint, FdEndpoint, Shutdown};

mod ring;
pub use ring::RingBuf;
