//! Translation of process signals into control events.
//!
//! One listener task per signal pushes the corresponding event onto the
//! supervisor queue; no substantive work happens in signal context. The
//! mapping follows the conventional daemon vocabulary: hang-up reloads,
//! terminate is the smart stop, interrupt the fast stop, quit the
//! immediate stop.

use tokio::signal::unix::{SignalKind, signal};

use crate::supervisor::events::{ControlEvent, EventSender, WakeReason};

pub fn spawn_listeners(events: &EventSender) -> std::io::Result<()> {
    for (kind, event) in [
        (SignalKind::hangup(), ControlEvent::Reload),
        (SignalKind::terminate(), ControlEvent::SmartStop),
        (SignalKind::interrupt(), ControlEvent::FastStop),
        (SignalKind::quit(), ControlEvent::ImmediateStop),
    ] {
        let mut stream = signal(kind)?;
        let events = events.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                events.send(event);
            }
        });
    }

    // User-defined-1 covers two wake-ups: authentication-file reload and
    // archiver wake. The bare signal carries nothing to tell them apart,
    // and both are idempotent, so one delivery posts both.
    let mut wake = signal(SignalKind::user_defined1())?;
    let wake_events = events.clone();
    tokio::spawn(async move {
        while wake.recv().await.is_some() {
            wake_events.send(ControlEvent::Wake(WakeReason::AuthFiles));
            wake_events.send(ControlEvent::Wake(WakeReason::Archiver));
        }
    });

    // Reserved; registering the disposition keeps the default action from
    // killing the process.
    let mut reserved = signal(SignalKind::user_defined2())?;
    tokio::spawn(async move { while reserved.recv().await.is_some() {} });

    Ok(())
}
