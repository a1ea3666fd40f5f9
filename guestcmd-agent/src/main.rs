//! guestcmd agent — runs inside the guest VM.
//!
//! Listens on a vsock port, runs each received command line under a shell
//! and answers with a JSON [`guestcmd_proto::CmdResult`].
#![allow(clippy::print_stderr)]

#[cfg(target_os = "linux")]
mod exec;
#[cfg(target_os = "linux")]
mod server;

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("guestcmd-agent only runs inside a Linux guest");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
#[tokio::main(flavor = "current_thread")]
async fn main() {
    use clap::Parser;

    let args = server::Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let result = match args.into_config() {
        Ok(config) => server::run(config).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        eprintln!("guestcmd-agent: {e:#}");
        std::process::exit(1);
    }
}
