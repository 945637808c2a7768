use std::net::Ipv6Addr;
use std::process;
use std::str::FromStr;
use std::time::Duration;

use clap::{App, Arg};

use pulsenet::prelude::*;

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let matches = App::new("pulsenet-harness")
        .version("0.1")
        .author("Bush Hammer Industries")
        .about("Conformance test harness for the pulsenet protocol")
        .arg(Arg::with_name("server").short("s").help("run as server"))
        .arg(Arg::with_name("client").short("c").help("run as client").conflicts_with("server"))
        .arg(Arg::with_name("listen-addr").short("ll").takes_value(true).default_value("::1"))
        .arg(Arg::with_name("listen-port").short("lp").takes_value(true).default_value("0"))
        .arg(Arg::with_name("connect-addr").short("cl").takes_value(true))
        .arg(Arg::with_name("connect-port").short("cp").takes_value(true))
        .arg(Arg::with_name("ticks").short("t").takes_value(true).default_value("60"))
        .arg(Arg::with_name("no-payload").short("n").help("send heartbeats only, no user payload"))
        .arg(Arg::with_name("log-level").short("l").takes_value(true).default_value("info"))
        .arg(Arg::with_name("events").short("e").help("print emitted events"))
        .get_matches();

    if !matches.is_present("server") && !matches.is_present("client") {
        eprintln!("one of -s or -c is required");
        return 1;
    }

    let role = if matches.is_present("server") { Role::Server } else { Role::Client };

    let listen_addr = match Ipv6Addr::from_str(matches.value_of("listen-addr").unwrap()) {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("invalid -ll address");
            return 1;
        }
    };
    let listen_port: u16 = match matches.value_of("listen-port").unwrap().parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("invalid -lp port");
            return 1;
        }
    };

    let log_level = match matches.value_of("log-level").unwrap().to_ascii_lowercase().as_str() {
        "silent" => LogLevel::Silent,
        "error" => LogLevel::Error,
        "warning" => LogLevel::Warning,
        "info" => LogLevel::Info,
        "verbose" => LogLevel::Verbose,
        "debug" => LogLevel::Debug,
        _ => {
            eprintln!("invalid -l level");
            return 1;
        }
    };

    let emit_events = matches.is_present("events");
    let send_payload = !matches.is_present("no-payload");

    let ticks: u64 = match matches.value_of("ticks").unwrap().parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("invalid -t ticks");
            return 1;
        }
    };

    let mut config = ContextConfig::new(role, false);
    config.log_level = log_level;
    config.emit_events = emit_events;

    let ctx = match Context::init(listen_addr, listen_port, config) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("failed to initialize context: {}", err);
            return 1;
        }
    };

    println!("listening on [{}]:{}", listen_addr, ctx.local_port());

    if role == Role::Client {
        let connect_addr = match matches.value_of("connect-addr").and_then(|s| Ipv6Addr::from_str(s).ok()) {
            Some(addr) => addr,
            None => {
                eprintln!("-cl is required when running as client");
                return 1;
            }
        };
        let connect_port: u16 = match matches.value_of("connect-port").and_then(|s| s.parse().ok()) {
            Some(port) => port,
            None => {
                eprintln!("-cp is required when running as client");
                return 1;
            }
        };

        let peer = ConnectionId::from_socket(connect_addr, connect_port);
        ctx.client_initiate_connection(peer, false);
    }

    let mut tick_counter: u64 = 0;
    let mut seq: u64 = 0;
    while tick_counter < ticks {
        ctx.update();

        if send_payload {
            for peer in ctx.list_connected() {
                ctx.queue_send(peer, format!("tick {}", seq).into_bytes());
            }
        }

        while let Some(received) = ctx.get_received() {
            println!("received {} bytes from {}", received.data.len(), received.from);
        }

        if emit_events {
            while let Some(event) = ctx.get_event() {
                println!("event: {:?}", event);
            }
        }

        tick_counter += 1;
        seq += 1;
        std::thread::sleep(Duration::from_millis(16));
    }

    ctx.destroy();
    0
}
