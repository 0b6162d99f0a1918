//! this binary starts the kvd server
//! to see the list of command line options, type: `kvd-server --help`

use clap::{crate_version, App, Arg};
use kvd::thread_pool::{SharedQueueThreadPool, ThreadPool};
use kvd::{default_pool_size, KvdError, KvdServer, MappedStore, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

// name of the storage file used when --storage is not given
const DEFAULT_STORAGE_FILENAME: &str = "storage.bin";

const ABOUT: &str = "\
Database Server listens for requests on a predefined IP:PORT.

Internal storage is mapped to a file (path can be set explicitly, otherwise
'storage.bin' next to the executable is used) and is a key-value storage with
the following constraints:
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

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    addr: SocketAddr,
    storage: PathBuf,
}

impl Opt {
    /// validates the `addr` and `storage` parameters
    /// # Errors
    /// returns [`KvdError::Parsing`] if the address is not a valid IP:PORT
    fn build(addr: &str, storage: Option<&str>) -> Result<Opt> {
        let addr: SocketAddr = addr.parse().map_err(|_| {
            KvdError::Parsing(format!(
                "could not parse {} into an IP address and port",
                &addr
            ))
        })?;

        let storage = match storage {
            Some(path) => PathBuf::from(path),
            None => default_storage_path()?,
        };

        Ok(Opt { addr, storage })
    }
}

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    // parse command line args
    let matches = App::new("kvd-server")
        .version(crate_version!())
        .about(ABOUT)
        .arg(
            Arg::with_name("address")
                .long("address")
                .short("a")
                .value_name("IP:PORT")
                .help("the IP:PORT the server listens on")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("storage")
                .long("storage")
                .short("s")
                .value_name("PATH")
                .help("path to a storage-file")
                .takes_value(true),
        )
        .get_matches();

    let addr = matches.value_of("address").unwrap_or_default();
    let opt = match Opt::build(addr, matches.value_of("storage")) {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("{:?}", err);
            exit(1);
        }
    };

    // start the server
    if let Err(e) = run(opt) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    info!("kvd-server {}", env!("CARGO_PKG_VERSION"));
    info!("storage file: {}", opt.storage.display());

    let engine = MappedStore::open(&opt.storage)?;
    let pool = SharedQueueThreadPool::new(default_pool_size())?;
    let server = KvdServer::new(engine, pool)?;
    server.run(opt.addr)
}

/// the storage file placed next to this executable, used when --storage is
/// not given
fn default_storage_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(dir.join(DEFAULT_STORAGE_FILENAME))
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
