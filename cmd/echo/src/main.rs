//! TCP echo server
//!
//! A listener service accepts connections through the master's event
//! bridge and spawns one stream service per client. Each stream
//! service echoes whatever it reads until the peer hangs up.
//!
//! ```text
//! cargo run -p svcmux-echo -- --workers 4
//! # then: nc 127.0.0.1 7000
//! ```

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4};

use svcmux::{
    socket, start_main_thread_with_args, Body, Control, EventMask, Service, ServiceCx,
};

const PORT: u16 = 7000;

/// Echo until the readable edge is exhausted; true once the peer is gone.
fn drain_echo(cx: &mut ServiceCx<'_>) -> bool {
    let Some(fd) = cx.event_fd() else {
        return true;
    };
    let mut buf = cx.acquire_buffer(4096);
    buf.resize(4096, 0);
    let mut closed = false;
    loop {
        match socket::read(fd, &mut buf) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => {
                let mut sent = 0;
                while sent < n {
                    match socket::write(fd, &buf[sent..n]) {
                        Ok(w) => sent += w,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                        Err(_) => {
                            closed = true;
                            break;
                        }
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(_) => {
                closed = true;
                break;
            }
        }
    }
    cx.release_buffer(buf);
    closed
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = start_main_thread_with_args(
        |handle| {
            let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, PORT);
            let lfd = match socket::listen(addr, 1024) {
                Ok(fd) => fd,
                Err(e) => {
                    eprintln!("cannot listen on {}: {}", addr, e);
                    handle.shutdown();
                    return 1;
                }
            };
            println!("echo server listening on {}", addr);

            handle.spawn(
                Service::func(|cx, msg| {
                    if let Body::ConnInd { conn, remote } = &msg.body {
                        println!("connection from {}", remote);
                        match conn.try_clone() {
                            Ok(conn) => {
                                cx.spawn(Service::func(echo_entry).watch(
                                    conn,
                                    EventMask::READ | EventMask::RDH,
                                ));
                            }
                            Err(e) => eprintln!("cannot adopt connection: {}", e),
                        }
                    }
                    Control::Continue
                })
                .listener(lfd, EventMask::READ),
            );
            0
        },
        &args,
    );
    std::process::exit(code);
}

fn echo_entry(cx: &mut ServiceCx<'_>, msg: &svcmux::Message) -> Control {
    match &msg.body {
        Body::Io { masks, .. } => {
            if masks.intersects(EventMask::HUP | EventMask::ERR) || drain_echo(cx) {
                cx.remove_event();
                return Control::Done;
            }
            Control::Continue
        }
        _ => Control::Continue,
    }
}
