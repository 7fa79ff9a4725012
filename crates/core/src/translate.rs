use crate::decorate::Decorate;
use crate::error::PollError;
use crate::event::{Event, HOST_FIELD};
use crate::record::Record;

/// Builds the event for one record.
///
/// Field precedence, last write wins: `host`, then whatever the decorator
/// sets, then the record's properties in their source order. Fails without a
/// partial event if any property value cannot be represented.
pub fn translate(
    record: &Record,
    resolved_host: &str,
    decorator: &dyn Decorate,
) -> Result<Event, PollError> {
    let mut event = Event::new();
    event.set(HOST_FIELD, resolved_host);
    decorator.decorate(&mut event);

    for property in record.properties() {
        let value = property
            .value
            .to_json()
            .map_err(|e| PollError::Translation {
                property: property.name.clone(),
                reason: e.0,
            })?;
        event.set(property.name.as_str(), value);
    }

    Ok(event)
}
