//! The codetester untrusted execution slave.
//!
//! A slave is a one-shot process: the master spawns it with a port and a
//! uid, the slave connects back, compiles and checks exactly one submission
//! and exits. Its own standard output and error are re-pointed at a
//! per-slave log file before any untrusted byte is loaded, so hostile code
//! can never write into the master's terminal.
//!
//! Usage: `codetester-slave <masterPort> <slaveUid> [--config FILE]
//! [--log-dir DIR]`
//!

#[macro_use]
extern crate error_chain;

mod client;
mod config;
mod lifecycle;

use std::fs::OpenOptions;
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use error_chain::ChainedError;
use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::config::SlaveConfig;
use crate::lifecycle::Slave;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        IoError(::std::io::Error);
        SetLoggerError(::log::SetLoggerError);
        LogConfigError(::log4rs::config::runtime::ConfigErrors);
    }

    links {
        ConfigError(crate::config::Error, crate::config::ErrorKind);
        LifecycleError(crate::lifecycle::Error, crate::lifecycle::ErrorKind);
        SandboxError(::sandbox::Error, ::sandbox::ErrorKind);
    }

    errors {
        InvalidArguments(message: String) {
            description("invalid arguments")
            display("invalid arguments: {}", message)
        }
    }
}

fn get_arg_matches() -> clap::ArgMatches<'static> {
    clap::App::new("codetester-slave")
        .version("0.1.0")
        .about("One-shot untrusted execution slave of the codetester judge.")
        .arg(clap::Arg::with_name("master_port")
            .required(true)
            .index(1)
            .value_name("MASTER_PORT")
            .help("local TCP port the master listens on"))
        .arg(clap::Arg::with_name("slave_uid")
            .required(true)
            .index(2)
            .value_name("SLAVE_UID")
            .help("uid assigned to this slave by the master"))
        .arg(clap::Arg::with_name("config_file")
            .long("config")
            .takes_value(true)
            .value_name("CONFIG_FILE")
            .help("path to a JSON configuration file"))
        .arg(clap::Arg::with_name("log_dir")
            .long("log-dir")
            .takes_value(true)
            .value_name("LOG_DIR")
            .help("directory the per-slave log file is created in"))
        .get_matches()
}

/// Initialize the log facilities, returning the opened log file for the
/// descriptor-level redirection.
fn init_log(config: &SlaveConfig, uid: &str) -> Result<std::fs::File> {
    let log_path = config.log_dir.join(format!("slave-{}.log", uid));

    let appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d} {l} {t} - {m}{n}")))
        .build(&log_path)?;
    let log_config = Config::builder()
        .appender(Appender::builder().build("slave", Box::new(appender)))
        .build(Root::builder().appender("slave").build(LevelFilter::Info))?;
    log4rs::init_config(log_config)?;

    let log_file = OpenOptions::new().create(true).append(true).open(&log_path)?;
    Ok(log_file)
}

/// Re-point the process's own stdout and stderr at the log file. Anything
/// the process prints outside the logger (panic reports, engine noise) must
/// land there, never on the master's terminal.
fn redirect_std_streams(log_file: &std::fs::File) -> Result<()> {
    let fd = log_file.as_raw_fd();
    for target in &[1, 2] {
        if unsafe { libc::dup2(fd, *target) } == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn do_main() -> Result<()> {
    let matches = get_arg_matches();

    let master_port: u16 = matches
        .value_of("master_port")
        .expect("master_port is a required argument")
        .parse()
        .map_err(|_| {
            Error::from(ErrorKind::InvalidArguments(
                "master port is not a valid port number".to_owned(),
            ))
        })?;
    let uid = matches
        .value_of("slave_uid")
        .expect("slave_uid is a required argument")
        .to_owned();

    let mut config = match matches.value_of("config_file") {
        Some(config_file) => SlaveConfig::from_file(config_file)?,
        None => SlaveConfig::default(),
    };
    if let Some(log_dir) = matches.value_of("log_dir") {
        config.log_dir = PathBuf::from(log_dir);
    }

    let log_file = init_log(&config, &uid)?;
    redirect_std_streams(&log_file)?;
    log::info!("slave {} starting, master port {}", uid, master_port);

    let stream = TcpStream::connect(("127.0.0.1", master_port))
        .chain_err(|| "unable to connect to the master")?;
    stream.set_nodelay(true).ok();

    // The policy engages with the runtime, before any submission byte is
    // loaded.
    let runtime = sandbox::Runtime::new(config.runtime_config())?;
    lifecycle::install_panic_capture();

    let mut slave = Slave::new(uid, config, runtime, stream)?;
    slave.run()?;
    Ok(())
}

fn main() -> Result<()> {
    match do_main() {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("error: {}", e.display_chain());
            Err(e)
        }
    }
}
