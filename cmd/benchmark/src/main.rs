//! Message round-trip micro-benchmark
//!
//! A driver service plays request/response against an echo service and
//! reports round-trips per second. Exercises the full path: worker
//! outbox -> global queue -> master routing -> worker inbox.
//!
//! ```text
//! SVCMUX_WORKERS=4 cargo run --release -p svcmux-benchmark
//! ```

use std::time::Instant;

use svcmux::{start_main_thread, Body, Control, Payload, Service};

const REQ: u32 = 1;
const RSP: u32 = 2;
const KICK: u32 = 3;
const ROUND_TRIPS: u64 = 200_000;

fn main() {
    let started = Instant::now();

    let code = start_main_thread(|handle| {
        let echo = handle.spawn(Service::func(|cx, msg| {
            if let Body::User { code: REQ, payload } = &msg.body {
                cx.send(msg.from, RSP, Payload::Word(payload.word().unwrap_or(0)));
            }
            Control::Continue
        }));

        let driver = handle.spawn(
            Service::func(move |cx, msg| match &msg.body {
                Body::User { code: KICK, .. } => {
                    cx.send(echo, REQ, Payload::Word(0));
                    Control::Continue
                }
                Body::User { code: RSP, payload } => {
                    let n = payload.word().unwrap_or(0) + 1;
                    if n < ROUND_TRIPS {
                        cx.send(echo, REQ, Payload::Word(n));
                        Control::Continue
                    } else {
                        cx.shutdown();
                        Control::Done
                    }
                }
                _ => Control::Continue,
            }),
        );
        handle.send(driver, KICK, Payload::Empty);
        0
    });

    let elapsed = started.elapsed();
    let per_sec = ROUND_TRIPS as f64 / elapsed.as_secs_f64();
    println!(
        "{} round-trips in {:.3}s ({:.0}/s)",
        ROUND_TRIPS,
        elapsed.as_secs_f64(),
        per_sec
    );
    std::process::exit(code);
}
