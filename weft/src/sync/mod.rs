mod channel;
pub use channel::{Channel, TryRecvError, TrySendError};

mod mutex;
pub use mutex::Mutex;

mod waitgroup;
pub use waitgroup::WaitGroup;
