//! CLI entry point: mounts a read-only FTP-relay filesystem at a local mountpoint and
//! starts the control-socket broker a `relayfs-locald` process connects through.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use relayfs::ctldev::server::ControlServer;
use relayfs::ctldev::ControlState;
use relayfs::filesystem::RelayFs;
use relayfs::protocol::MountOptions;
use relayfs::{MountOption, Session, SessionConfig};

#[derive(Parser)]
#[command(version, about = "Mounts a read-only FTP-relay filesystem")]
struct Args {
    /// Local directory to mount the filesystem at
    mountpoint: PathBuf,

    /// FTP server hostname the relay daemon connects to
    #[clap(long)]
    server: String,

    /// FTP login user
    #[clap(long, default_value = "ftp")]
    user: String,

    /// FTP login password
    #[clap(long, default_value = "ftp")]
    pass: String,

    /// Directory on the FTP server treated as the filesystem root
    #[clap(long, default_value = "/")]
    basepath: String,

    /// Unix-domain control socket the `relayfs-locald` daemon connects through
    #[clap(long, default_value = "/tmp/relayfs.sock")]
    socket: PathBuf,

    /// Number of worker threads dispatching kernel requests. 1 runs single-threaded.
    #[clap(long, default_value_t = 1)]
    threads: usize,

    /// Automatically unmount when this process exits
    #[clap(long)]
    auto_unmount: bool,

    /// Allow the root user to access the filesystem in addition to the mounting user
    #[clap(long)]
    allow_root: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut mount_options = vec![MountOption::RO, MountOption::FSName("relayfs".to_string())];
    if args.auto_unmount {
        mount_options.push(MountOption::AutoUnmount);
    }
    if args.allow_root {
        mount_options.push(MountOption::CUSTOM("allow_root".to_string()));
    }

    let options = MountOptions::new(&args.user, &args.pass, &args.server, &args.basepath);
    let state = Arc::new(ControlState::new());

    let server = ControlServer::bind(&args.socket, state.clone())
        .expect("failed to bind control socket");
    info!("Control socket listening at {}", server.path().display());
    server.spawn();

    let (fs, slot) = RelayFs::new(options, state);

    if args.threads <= 1 {
        let mut session =
            Session::new(fs, &args.mountpoint, &mount_options).expect("failed to mount filesystem");
        slot.set(session.notifier());
        session.run().expect("filesystem session ended with an error");
    } else {
        let config = SessionConfig::new().max_threads(args.threads);
        let mut session = relayfs::MtSession::new(fs, &args.mountpoint, &mount_options, config)
            .expect("failed to mount filesystem");
        slot.set(session.notifier());
        session.run().expect("filesystem session ended with an error");
    }
}
