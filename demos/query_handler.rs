//! Event handler for the agent: `serf agent -event-handler=query=<binary>`.
//!
//! Answers `uptime` directly and manages a long-running `backup` job through
//! `backup-start`, `backup-status` and `backup-reap` queries.

use std::error::Error;

use serf_rpc::handler::{EventKind, Handler, NameMatcher};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
fn register_backup(handler: &mut Handler) {
    use serf_rpc::job::{AsyncJob, JobSpec};

    let job = AsyncJob::new(
        JobSpec::new("tar czf /tmp/backup.tgz /etc", "/tmp/backup.state")
            .with_stdout("/tmp/backup.log")
            .with_stderr("/tmp/backup.log"),
    );

    let start = job.clone();
    handler.on(EventKind::Query, Some(NameMatcher::from("backup-start")), move |_| {
        match start.start() {
            Ok(outcome) => println!("{outcome}"),
            Err(err) => println!("failed: {err}"),
        }
    });
    let status = job.clone();
    handler.on(EventKind::Query, Some(NameMatcher::from("backup-status")), move |_| {
        match status.state_info() {
            Ok(state) => println!("{}", serde_json::to_string(&state).unwrap_or_default()),
            Err(err) => println!("failed: {err}"),
        }
    });
    handler.on(EventKind::Query, Some(NameMatcher::from("backup-reap")), move |_| {
        match job.reap() {
            Ok(outcome) => println!("{outcome}"),
            Err(err) => println!("failed: {err}"),
        }
    });
}

#[cfg(not(unix))]
fn register_backup(_handler: &mut Handler) {}

fn main() -> Result<(), Box<dyn Error>> {
    // Standard output is the query response, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut handler = Handler::new();
    handler.on(EventKind::Query, Some(NameMatcher::from("uptime")), |_| {
        let uptime = std::fs::read_to_string("/proc/uptime").unwrap_or_default();
        println!("{}", uptime.split_whitespace().next().unwrap_or("unknown"));
    });
    handler.on(
        EventKind::User,
        Some(NameMatcher::pattern("^deploy(-.+)?$")?),
        |event| {
            eprintln!(
                "deploy requested name={:?} payload={:?}",
                event.name,
                event.payload_str()
            );
        },
    );
    register_backup(&mut handler);

    handler.run()?;
    Ok(())
}
