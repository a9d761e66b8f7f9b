//! Ping-pong example
//!
//! A function-based responder and a coroutine-based requester exchange
//! a few rounds of messages, then the requester stops the runtime.
//!
//! # Environment Variables
//!
//! - `SVCMUX_WORKERS=2` - worker thread count
//! - `SVCMUX_LOG_LEVEL=debug` - watch the attach/route/reap traffic

use svcmux::{
    start_main_thread, Body, Control, Frame, Message, Payload, Service, ServiceCx, ServiceId,
};

const PING: u32 = 1;
const PONG: u32 = 2;
const KICK: u32 = 3;
const ROUNDS: u32 = 5;

struct PingSide {
    pong: ServiceId,
}

fn ping_entry(frame: &mut Frame, cx: &mut ServiceCx<'_>, msg: &Message) -> Control {
    let pong = match cx.data_mut::<PingSide>() {
        Some(side) => side.pong,
        None => return Control::Done,
    };
    match &msg.body {
        Body::User { code: KICK, .. } => {
            println!("ping: starting {} rounds", ROUNDS);
            cx.send(pong, PING, Payload::Word(0));
            Control::Continue
        }
        Body::User {
            code: PONG,
            payload,
        } => {
            println!("ping: round {} answered", payload.word().unwrap_or(0));
            frame.advance();
            if frame.step() < ROUNDS {
                cx.send(pong, PING, Payload::Word(frame.step() as u64));
                Control::Continue
            } else {
                println!("ping: done, shutting down");
                cx.shutdown();
                Control::Done
            }
        }
        _ => Control::Continue,
    }
}

fn main() {
    let code = start_main_thread(|handle| {
        let pong = handle.spawn(Service::func(|cx, msg| {
            if let Body::User {
                code: PING,
                payload,
            } = &msg.body
            {
                cx.send(msg.from, PONG, Payload::Word(payload.word().unwrap_or(0)));
            }
            Control::Continue
        }));

        let ping = handle.spawn(Service::coroutine(ping_entry).data(PingSide { pong }));
        handle.send(ping, KICK, Payload::Empty);
        0
    });
    std::process::exit(code);
}
