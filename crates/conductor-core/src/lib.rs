// Transport-independent core of the operation tracking layer.

pub mod dispatch;
pub mod error;
pub mod event;
pub mod operation;
pub mod rest;
pub mod state;

pub use dispatch::{Dispatcher, Emitter, HandlerContext, HandlerTable, OutboundEvent};
pub use error::{Error, Result};
pub use event::{EventPayload, INITIAL_STATE_EVENT, OUTPUT_EVENT, PushEvent};
pub use operation::{ItemProgress, OperationRecord, OperationSet, OperationStatus, Progress};
pub use state::{OperationLog, SynchronizedState};
