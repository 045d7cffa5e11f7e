// Durable on-disk sinks: the day-rotated record store and the dead-letter
// queue writer.

pub mod day_store;
pub mod dlq;

pub use day_store::{DayStore, StoreError};
pub use dlq::{DlqEntry, DlqWriter};
