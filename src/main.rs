#[macro_use]
extern crate clap;
extern crate relay_chat;
extern crate tracing_subscriber;

use std::io;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::ArgMatches;
use tracing_subscriber::EnvFilter;

use relay_chat::message::Framing;
use relay_chat::terminal::{Commands, Frontend, StdoutSink, HELP};
use relay_chat::{Client, Server, Settings};

fn settings(matches: &ArgMatches) -> Settings {
    let mut settings = Settings::default();
    if matches.is_present("POLL") {
        let millis = value_t!(matches, "POLL", u64).unwrap_or_else(|e| e.exit());
        settings.accept_poll = Duration::from_millis(millis.max(1));
    }
    if matches.is_present("FRAMING") {
        settings.framing = value_t!(matches, "FRAMING", Framing).unwrap_or_else(|e| e.exit());
    }
    settings
}

fn main() {
    let matches = clap_app!(
        relay_chat =>
            (name: "relay-chat")
            (version: crate_version!())
            (about: "A minimal TCP chat relay. Run a server, or a client that talks to one.")
            (@setting SubcommandRequiredElseHelp)
            (@arg POLL: --poll +takes_value +global "Milliseconds the server waits between checks for new clients.")
            (@arg FRAMING: --framing +takes_value +global "How inbound bytes are cut into messages: drain (default) or line.")
            (@subcommand server =>
                (about: "Relay every client's messages to every other client.")
                (@arg ADDRESS: "Address to listen on, e.g. 127.0.0.1.")
                (@arg PORT: "Port to listen on."))
            (@subcommand client =>
                (about: "Connect to a relay server.")
                (@arg ADDRESS: "Address of the server.")
                (@arg PORT: "Port of the server."))
    ).get_matches();

    // diagnostics go to stderr so they never mix with the chat log
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let sink = Arc::new(StdoutSink);
    let frontend = match matches.subcommand() {
        ("server", Some(sub)) => {
            let server = Server::new(settings(sub), sink).unwrap_or_else(|err| fail(err));
            if let (Some(address), Some(port)) = (sub.value_of("ADDRESS"), sub.value_of("PORT")) {
                let _ = server.start(address, port);
            }
            Frontend::Server(server)
        }
        ("client", Some(sub)) => {
            let client = Client::new(settings(sub), sink).unwrap_or_else(|err| fail(err));
            if let (Some(address), Some(port)) = (sub.value_of("ADDRESS"), sub.value_of("PORT")) {
                let _ = client.connect(address, port);
            }
            Frontend::Client(client)
        }
        _ => unreachable!("clap requires a subcommand"),
    };

    println!("{}", HELP);
    let stdin = io::stdin();
    for cmd in Commands::new(stdin.lock()) {
        match cmd {
            Ok(cmd) => {
                if !frontend.handle(cmd) {
                    break;
                }
            }
            Err(err) => {
                eprintln!("Error reading terminal input: {}", err);
                break;
            }
        }
    }
    frontend.shutdown();
}

fn fail<E: std::fmt::Display, T>(err: E) -> T {
    eprintln!("relay-chat: {}", err);
    process::exit(1)
}
