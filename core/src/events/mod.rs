//! Per-migration progress events: types, fan-out bus, durable log replay.

pub mod bus;
pub mod types;

pub use bus::{BusError, EventBus, EventStream, SharedEventBus};
pub use types::{Event, EventDraft, EventKind};
