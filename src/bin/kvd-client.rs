//! this binary runs the interactive kvd client.
//!
//! It prompts for the server's endpoint on standard input, then loops reading
//! (operation, key, value) triples and sending them as requests. An operation
//! is accepted as its numeric tag, its single-letter shorthand or the full
//! word.

use clap::{crate_version, App};
use kvd::{ErrorCode, KvdClient, Operation, Request, Response, Result};
use std::io::{self, BufRead, Write};
use std::net::{IpAddr, SocketAddr};
use std::process::exit;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const ABOUT: &str = "\
Database Client sends requests to a Server using the following information:
1) server ip address and port
2) operation
3) key
4) value

Internal database storage is a key-value storage with the following constraints:
1) KEY is a string with max length equal to 1024 characters
2) VALUE is a string with max length equal to 1048576 characters

Supported operations:
1) INSERT - insert key:value
2) UPDATE - update key:value
3) DELETE - delete key
4) GET    - get value using key

In the following error cases the server will respond with an error:
1) Attempt to INSERT a key which already exists
2) Attempt to UPDATE a key which doesn't exist
3) Attempt to UPDATE a key to the same value
4) Attempt to DELETE a key which doesn't exist
5) Attempt to GET a value from a key which doesn't exist";

fn main() {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    App::new("kvd-client")
        .version(crate_version!())
        .about(ABOUT)
        .get_matches();

    let endpoint = loop {
        match read_endpoint() {
            Ok(Some(endpoint)) => break endpoint,
            Ok(None) => exit(0),
            Err(e) => eprintln!("{}", e),
        }
    };

    let mut client = KvdClient::new();
    loop {
        match read_request() {
            Ok(Some(request)) => {
                print_request(&request);
                match client.send(endpoint, &request) {
                    Ok(response) => print_response(&response),
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Ok(None) => exit(0),
            Err(e) => eprintln!("{}", e),
        }
    }
}

/// prints `message` and reads one line from standard input.
/// returns `None` when stdin is closed
fn prompt(message: &str) -> Result<Option<String>> {
    print!("{}", message);
    io::stdout().flush()?;

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// reads the server's address and port to connect to
fn read_endpoint() -> Result<Option<SocketAddr>> {
    let address = match prompt("Enter server's ip address: ")? {
        Some(line) => line
            .parse::<IpAddr>()
            .map_err(|_| kvd::KvdError::Parsing(format!("invalid ip address: {}", line)))?,
        None => return Ok(None),
    };

    let port = match prompt("Enter server's port: ")? {
        Some(line) => line
            .parse::<u16>()
            .map_err(|_| kvd::KvdError::Parsing(format!("invalid port: {}", line)))?,
        None => return Ok(None),
    };

    Ok(Some(SocketAddr::new(address, port)))
}

/// reads the next request from the console
fn read_request() -> Result<Option<Request>> {
    let operation = match prompt(
        "Enter operation [0|I|INSERT, 1|U|UPDATE, 2|D|DELETE, 3|G|GET]: ",
    )? {
        Some(line) => line.parse::<Operation>()?,
        None => return Ok(None),
    };

    let key = match prompt("Enter KEY: ")? {
        Some(line) => line,
        None => return Ok(None),
    };

    // DELETE and GET carry no value
    let value = match operation {
        Operation::Insert | Operation::Update => match prompt("Enter VALUE: ")? {
            Some(line) => line,
            None => return Ok(None),
        },
        Operation::Delete | Operation::Get => String::new(),
    };

    Ok(Some(Request {
        operation,
        key,
        value,
    }))
}

fn print_request(request: &Request) {
    match request.operation {
        Operation::Insert | Operation::Update => println!(
            "Request {{Operation: {}, Key: {}, Value: {}}}",
            request.operation, request.key, request.value
        ),
        Operation::Delete | Operation::Get => println!(
            "Request {{Operation: {}, Key: {}}}",
            request.operation, request.key
        ),
    }
}

fn print_response(response: &Response) {
    if response.error == ErrorCode::None {
        match response.operation {
            Operation::Get => println!(
                "Response {{Operation: {}, SUCCESS, got value: {}}}",
                response.operation, response.value
            ),
            _ => println!("Response {{Operation: {}, SUCCESS}}", response.operation),
        }
    } else {
        println!(
            "Response {{Operation: {}, ERROR: {}}}",
            response.operation, response.error
        );
    }
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
