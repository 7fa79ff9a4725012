use crate::util::logging::{debug, error, info};
use crate::util::threading::{ThreadHandle, ThreadRegistry};
use anyhow::Result;
use crossbeam_channel::Receiver;
use std::io::{BufWriter, Write};
use wmipoll_core::Event;

/// Drains the event queue into `writer`, one JSON document per line.
///
/// The stage exits once every producer has dropped its sender. A write
/// failure (for example a closed stdout pipe) also ends it; the receiver is
/// dropped with the thread, so pollers see a closed queue and wind down.
pub fn spawn_output_stage<W>(
    threads: &ThreadRegistry,
    rx: Receiver<Event>,
    writer: W,
) -> Result<ThreadHandle>
where
    W: Write + Send + 'static,
{
    threads.spawn("output", move || {
        let mut out = BufWriter::new(writer);
        let mut written: u64 = 0;
        for event in rx.iter() {
            if let Err(e) = write_line(&mut out, &event) {
                error!("Output stage failed to write event: {}", e);
                return;
            }
            written += 1;
            // Flush whenever the queue runs dry so quiet inputs are not held back.
            if rx.is_empty() {
                if let Err(e) = out.flush() {
                    error!("Output stage failed to flush: {}", e);
                    return;
                }
            }
        }
        if let Err(e) = out.flush() {
            debug!("Final flush failed: {}", e);
        }
        info!("Output stage finished after {} event(s)", written);
    })
}

fn write_line<W: Write>(out: &mut W, event: &Event) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")
}
