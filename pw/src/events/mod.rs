//! Pipeline event stream
//!
//! Typed events ([`PipelineEvent`]), the broadcast bus ([`EventBus`]), and
//! the emitter handles components use to record activity. Durability before
//! fan-out: an emitted event hits the session store before observers see it.

mod bus;
mod emitter;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, FilteredReceiver, create_event_bus};
pub use emitter::{SessionEmitter, StageEmitter};
pub use types::{EventKind, EventPayload, PipelineEvent};
