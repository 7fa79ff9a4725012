//! Data model shared by the poller: property values as delivered by a
//! management query, the records that carry them and the events they become.

pub mod decorate;
pub mod error;
pub mod event;
pub mod record;
pub mod translate;
pub mod value;

pub use decorate::{Decorate, FieldDecorator, NoDecoration};
pub use error::{PollError, PollResult};
pub use event::Event;
pub use record::{Property, Record};
pub use translate::translate;
pub use value::{PropertyValue, Text};
