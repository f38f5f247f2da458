pub mod dispatcher;
pub mod handler;
pub mod sink;

pub use dispatcher::{ChangeDispatcher, DispatchStats, DispatchStatsSnapshot};
pub use handler::{ChangeHandler, CopyToContainerHandler, HandlerFn, handler_fn};
pub use sink::{DocumentSink, InMemoryContainer};
