//! Line based terminal front end.
//!
//! Stdin is decoded into [`Command`]s, one per line. Lines starting with `/` are commands in
//! honor of IRC, anything else is chat text. The log is printed to stdout.

use std::io::{self, Read, Write};
use std::str::SplitWhitespace;

use bytes::BytesMut;
use tokio::codec::Decoder;

use crate::client::Client;
use crate::server::Server;
use crate::sink::LogSink;

pub const HELP: &str = "\
Commands:
  /start ADDRESS PORT     start listening (server)
  /stop                   stop listening and drop every client (server)
  /connect ADDRESS PORT   connect to a server (client)
  /disconnect             drop every client (server) or the connection (client)
  /clear                  clear the log
  /help                   show this message
  /quit                   leave
Anything else is sent as a message.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { address: String, port: String },
    Stop,
    Connect { address: String, port: String },
    Disconnect,
    Clear,
    Help,
    Quit,
    /// Chat text, exactly as typed.
    Say(String),
    /// A line that started with `/` but could not be understood.
    Invalid(String),
}

fn endpoint_args(args: &mut SplitWhitespace, usage: &str) -> Result<(String, String), String> {
    match (args.next(), args.next(), args.next()) {
        (Some(address), Some(port), None) => Ok((address.to_string(), port.to_string())),
        _ => Err(format!("Usage: {}", usage)),
    }
}

fn parse_command(line: &str) -> Command {
    let mut args = line.split_whitespace();
    let name = match args.next() {
        Some(name) => name.to_lowercase(),
        None => return Command::Invalid("Empty command".to_string()),
    };
    let res = match &name[..] {
        "/start" | "/listen" => {
            endpoint_args(&mut args, "/start ADDRESS PORT").map(|(address, port)| Command::Start { address, port })
        }
        "/connect" => {
            endpoint_args(&mut args, "/connect ADDRESS PORT").map(|(address, port)| Command::Connect { address, port })
        }
        "/stop" => Ok(Command::Stop),
        "/disconnect" => Ok(Command::Disconnect),
        "/clear" => Ok(Command::Clear),
        "/help" => Ok(Command::Help),
        "/quit" | "/exit" => Ok(Command::Quit),
        _ => Err(format!("Unknown command {}", name)),
    };
    res.unwrap_or_else(Command::Invalid)
}

/// Splits terminal input into commands.
#[derive(Debug, Default)]
pub struct CommandCodec {
    /// How far into the buffer we already looked for a newline.
    idx: usize,
}

impl CommandCodec {
    pub fn new() -> CommandCodec {
        CommandCodec::default()
    }

    fn parse_line(line: &[u8]) -> Option<Command> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if line.trim().is_empty() {
            return None;
        }
        if line.trim_start().starts_with('/') {
            Some(parse_command(line.trim()))
        } else {
            Some(Command::Say(line.to_string()))
        }
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Command>, io::Error> {
        loop {
            match buf[self.idx..].iter().position(|b| *b == b'\n') {
                None => {
                    self.idx = buf.len();
                    return Ok(None);
                }
                Some(offset) => {
                    let line = buf.split_to(self.idx + offset + 1);
                    self.idx = 0;
                    if let Some(cmd) = CommandCodec::parse_line(&line) {
                        return Ok(Some(cmd));
                    }
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Command>, io::Error> {
        if let Some(cmd) = self.decode(buf)? {
            return Ok(Some(cmd));
        }
        self.idx = 0;
        let rest = buf.take();
        Ok(CommandCodec::parse_line(&rest))
    }
}

/// Blocking iterator of the commands read from `input`.
pub struct Commands<R> {
    input: R,
    codec: CommandCodec,
    buf: BytesMut,
    eof: bool,
}

impl<R: Read> Commands<R> {
    pub fn new(input: R) -> Commands<R> {
        Commands {
            input,
            codec: CommandCodec::new(),
            buf: BytesMut::with_capacity(1024),
            eof: false,
        }
    }
}

impl<R: Read> Iterator for Commands<R> {
    type Item = io::Result<Command>;

    fn next(&mut self) -> Option<io::Result<Command>> {
        let mut chunk = [0; 1024];
        loop {
            if self.eof {
                return self.codec.decode_eof(&mut self.buf).transpose();
            }
            match self.codec.decode(&mut self.buf) {
                Ok(Some(cmd)) => return Some(Ok(cmd)),
                Ok(None) => {}
                Err(err) => return Some(Err(err)),
            }
            match self.input.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Prints the log to stdout. A clear is shown as a rule, since a terminal can't take lines back.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn append(&self, line: &str) {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }

    fn clear(&self) {
        let _ = writeln!(io::stdout(), "{}", "-".repeat(40));
    }
}

/// The side of the relay the terminal drives.
pub enum Frontend {
    Server(Server),
    Client(Client),
}

impl Frontend {
    /// Carry out `cmd`. Returns `false` once the user asked to quit.
    pub fn handle(&self, cmd: Command) -> bool {
        match (self, cmd) {
            (_, Command::Quit) => return false,
            (_, Command::Help) => println!("{}", HELP),
            (_, Command::Invalid(reason)) => eprintln!("Command failed: {}", reason),
            (Frontend::Server(server), Command::Start { address, port }) => {
                let _ = server.start(&address, &port);
            }
            (Frontend::Server(server), Command::Stop) => server.stop(),
            (Frontend::Server(server), Command::Disconnect) => {
                server.disconnect_all();
            }
            (Frontend::Server(server), Command::Clear) => server.clear_log(),
            (Frontend::Server(server), Command::Say(text)) => {
                server.broadcast(&text);
            }
            (Frontend::Client(client), Command::Connect { address, port }) => {
                let _ = client.connect(&address, &port);
            }
            (Frontend::Client(client), Command::Disconnect) => {
                client.disconnect();
            }
            (Frontend::Client(client), Command::Clear) => client.clear_log(),
            (Frontend::Client(client), Command::Say(text)) => {
                client.send(&text);
            }
            (Frontend::Server(_), cmd) | (Frontend::Client(_), cmd) => {
                eprintln!("Command failed: {:?} is not available here", cmd)
            }
        }
        true
    }

    /// Stop everything and wait for the relay's tasks to finish.
    pub fn shutdown(self) {
        match self {
            Frontend::Server(server) => server.shutdown(),
            Frontend::Client(client) => client.shutdown(),
        }
    }
}
